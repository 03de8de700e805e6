//! UI-facing message values produced from inbound frames, control traffic and local sends.

use serde::{Deserialize, Serialize};

use crate::identity::DeviceIdentity;
use crate::wire::Frame;

pub const NOTICE_CONNECTION_ESTABLISHED: &str = "Connection established";
pub const NOTICE_CONNECTION_LOST: &str = "Connection lost";
pub const NOTICE_SEND_FAILED: &str = "Message send failed";

/// Binary attachment carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub payload: Vec<u8>,
    pub mime_type: String,
}

/// Immutable message handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub is_sent: bool,
    pub is_service_notice: bool,
    pub attachment: Option<Attachment>,
}

impl Message {
    pub fn received(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_sent: false,
            is_service_notice: false,
            attachment: None,
        }
    }

    pub fn sent(content: impl Into<String>) -> Self {
        Self {
            is_sent: true,
            ..Self::received(content)
        }
    }

    pub fn notice(content: impl Into<String>) -> Self {
        Self {
            is_service_notice: true,
            ..Self::received(content)
        }
    }

    pub fn service_discovered(identity: &DeviceIdentity) -> Self {
        Self::notice(format!("Service discovered: {}", identity))
    }

    /// Message for a frame; `is_sent` distinguishes local echo from inbound.
    pub fn from_frame(frame: Frame, is_sent: bool) -> Self {
        match frame {
            Frame::Text(content) => Self {
                content,
                is_sent,
                is_service_notice: false,
                attachment: None,
            },
            Frame::Attachment { mime_type, payload } => Self {
                content: format!("[attachment: {}, {} bytes]", mime_type, payload.len()),
                is_sent,
                is_service_notice: false,
                attachment: Some(Attachment { payload, mime_type }),
            },
        }
    }

    pub fn is_attachment(&self) -> bool {
        self.attachment.is_some()
    }
}
