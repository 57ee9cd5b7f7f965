//! Light-push request/response envelope.
//!
//! A [`PushRpc`] correlates one request with one response by a fresh UUID
//! request id. Exactly one of `request`/`response` is populated per
//! direction of travel; the implementation never multiplexes requests on a
//! stream, so one stream carries one request/response pair and id
//! uniqueness per outstanding push holds trivially.

use serde::{Deserialize, Serialize};

use crate::envelope::{CodecError, MessageEnvelope};
use crate::messages;

/// Request half: the message to inject and the pubsub topic to publish on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub message: MessageEnvelope,
    pub pubsub_topic: String,
}

/// Response half: whether the responder accepted the message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub is_success: bool,
    pub info: Option<String>,
}

/// The framed light-push RPC envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRpc {
    pub request_id: String,
    request: Option<PushRequest>,
    response: Option<PushResponse>,
}

impl PushRpc {
    /// Build a request RPC with a freshly generated request id.
    pub fn request(message: MessageEnvelope, pubsub_topic: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            request: Some(PushRequest {
                message,
                pubsub_topic: pubsub_topic.into(),
            }),
            response: None,
        }
    }

    /// Build a response RPC echoing the request id it answers.
    pub fn response(request_id: String, is_success: bool, info: Option<String>) -> Self {
        Self {
            request_id,
            request: None,
            response: Some(PushResponse { is_success, info }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        messages::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        messages::deserialize_bounded(bytes).map_err(|_| CodecError::MalformedEnvelope)
    }

    pub fn query(&self) -> Option<&PushRequest> {
        self.request.as_ref()
    }

    pub fn reply(&self) -> Option<&PushResponse> {
        self.response.as_ref()
    }
}
