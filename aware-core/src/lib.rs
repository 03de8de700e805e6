//! Proximity link protocol core.
//! Host-driven: no I/O; host passes discovery events and receives actions, and frames bytes with
//! the data-plane codec.

pub mod identity;
pub mod message;
pub mod protocol;
pub mod session;
pub mod wire;

pub mod ffi;

pub use identity::{DeviceIdentity, PeerHandle, PeerId, SessionId};
pub use message::{Attachment, Message};
pub use protocol::{ControlMessage, Role};
pub use session::{
    DiscoverySession, SessionAction, SessionError, SessionNotice, SessionState, TerminationReason,
};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError, FrameKind};
