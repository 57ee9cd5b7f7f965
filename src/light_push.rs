//! Light-push client and responder.
//!
//! Light push lets a resource-restricted node hand a message to a
//! full relay node over a dedicated request/response stream instead of
//! joining the gossip mesh itself. One stream carries exactly one
//! [`PushRpc`] request and one response.
//!
//! Frames are length-prefixed with a big-endian u32 and capped at
//! [`MAX_WIRE_SIZE`]. Precondition failures (unknown peer, missing
//! protocol, no connection) surface as [`PushError`]; failures after the
//! request is on the wire collapse to `Ok(None)`, because at that point
//! the remote may or may not have relayed the message and reporting a
//! hard error would overstate what we know.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::envelope::MessageEnvelope;
use crate::messages::MAX_WIRE_SIZE;
use crate::peer::PeerId;
use crate::push_rpc::{PushResponse, PushRpc};
use crate::relay::Relay;

/// Protocol identifier negotiated for light-push streams.
pub const LIGHT_PUSH_PROTOCOL_ID: &str = "/vac/waku/lightpush/2.0.0-alpha1";

/// Precondition failures detected before anything is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The peer is not in the local address book.
    UnknownPeer,
    /// The peer has not negotiated the light-push protocol.
    ProtocolNotSupported,
    /// No live connection to the peer.
    NoConnection,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPeer => write!(f, "peer not found in address book"),
            Self::ProtocolNotSupported => {
                write!(f, "peer does not support {LIGHT_PUSH_PROTOCOL_ID}")
            }
            Self::NoConnection => write!(f, "no open connection to peer"),
        }
    }
}

impl std::error::Error for PushError {}

/// A bidirectional byte stream usable for one push exchange.
pub trait PushStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> PushStream for S {}

/// Address-book view of a peer: its identity and negotiated protocols.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub id: PeerId,
    pub protocols: Vec<String>,
}

impl PeerRecord {
    pub fn supports(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|p| p == protocol)
    }
}

/// Connectivity services the light-push client consumes.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Look up a peer in the local address book.
    fn peer_record(&self, peer: &PeerId) -> Option<PeerRecord>;

    /// Whether a live connection to the peer exists right now.
    fn has_connection(&self, peer: &PeerId) -> bool;

    /// Open a fresh stream to the peer for the given protocol.
    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> anyhow::Result<Box<dyn PushStream>>;
}

/// Light-push client bound to a transport and a default pubsub topic.
pub struct LightPush<T> {
    transport: Arc<T>,
    pubsub_topic: String,
}

impl<T: PushTransport> LightPush<T> {
    pub fn new(transport: Arc<T>, pubsub_topic: impl Into<String>) -> Self {
        Self {
            transport,
            pubsub_topic: pubsub_topic.into(),
        }
    }

    /// Push an envelope to a relay peer on the default pubsub topic.
    ///
    /// `Ok(Some(response))` is the remote's verdict; `Ok(None)` means the
    /// request may have been sent but no usable response came back.
    pub async fn push(
        &self,
        peer: PeerId,
        envelope: MessageEnvelope,
    ) -> Result<Option<PushResponse>, PushError> {
        let topic = self.pubsub_topic.clone();
        self.push_on(peer, &topic, envelope).await
    }

    /// [`push`](Self::push) on an explicit pubsub topic.
    pub async fn push_on(
        &self,
        peer: PeerId,
        pubsub_topic: &str,
        envelope: MessageEnvelope,
    ) -> Result<Option<PushResponse>, PushError> {
        let record = self
            .transport
            .peer_record(&peer)
            .ok_or(PushError::UnknownPeer)?;
        if !record.supports(LIGHT_PUSH_PROTOCOL_ID) {
            return Err(PushError::ProtocolNotSupported);
        }
        if !self.transport.has_connection(&peer) {
            return Err(PushError::NoConnection);
        }

        let mut stream = match self
            .transport
            .open_stream(&peer, LIGHT_PUSH_PROTOCOL_ID)
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                warn!(peer = %peer, %error, "failed to open light-push stream");
                return Ok(None);
            }
        };

        let rpc = PushRpc::request(envelope, pubsub_topic);
        let request_id = rpc.request_id.clone();
        if let Err(error) = write_frame(&mut stream, &rpc.encode()).await {
            warn!(peer = %peer, %error, "failed to send push request");
            return Ok(None);
        }

        let reply_bytes = match read_frame(&mut stream).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(peer = %peer, %error, "failed to read push response");
                return Ok(None);
            }
        };
        let reply = match PushRpc::decode(&reply_bytes) {
            Ok(rpc) => rpc,
            Err(error) => {
                warn!(peer = %peer, %error, "undecodable push response");
                return Ok(None);
            }
        };
        match reply.reply() {
            Some(response) => {
                debug!(
                    peer = %peer,
                    request_id = %request_id,
                    success = response.is_success,
                    "push response received"
                );
                Ok(Some(response.clone()))
            }
            None => {
                warn!(peer = %peer, "push reply carried no response");
                Ok(None)
            }
        }
    }
}

/// Serve one inbound light-push stream: read the request, inject it into
/// the relay, and answer with the outcome under the request's id.
///
/// A decodable RPC that carries no request is answered with a failure
/// response; a frame that does not decode at all cannot be correlated and
/// is an error.
pub async fn serve_stream<S>(stream: &mut S, relay: &Relay) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let bytes = read_frame(stream)
        .await
        .context("reading push request frame")?;
    let rpc = PushRpc::decode(&bytes).context("decoding push request")?;
    let request_id = rpc.request_id.clone();

    let (is_success, info) = match rpc.query() {
        Some(request) => {
            match relay
                .inject(&request.pubsub_topic, request.message.clone())
                .await
            {
                Ok(()) => (true, None),
                Err(error) => {
                    debug!(request_id = %request_id, %error, "push injection failed");
                    (false, Some(error.to_string()))
                }
            }
        }
        None => (false, Some("rpc carried no request".to_string())),
    };

    let reply = PushRpc::response(request_id, is_success, info);
    write_frame(stream, &reply.encode())
        .await
        .context("writing push response frame")?;
    Ok(())
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<S>(stream: &mut S, bytes: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    if bytes.len() > MAX_WIRE_SIZE {
        anyhow::bail!("frame of {} bytes exceeds wire limit", bytes.len());
    }
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, rejecting oversized lengths before
/// allocating.
pub(crate) async fn read_frame<S>(stream: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Send + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_WIRE_SIZE {
        anyhow::bail!("frame length {len} exceeds wire limit");
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}
