//! Platform collaborators: discovery provider, network bring-up provider, permission gate.
//! Provider callbacks are modelled as a closed set of event variants delivered through one
//! channel per publish/subscribe.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use aware_core::{PeerHandle, PeerId, Role, SessionId};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("attach failed: {0}")]
    AttachFailed(String),
    #[error("discovery configuration rejected: {0}")]
    ConfigRejected(String),
    #[error("message send failed: {0}")]
    SendFailed(String),
    #[error("network request rejected: {0}")]
    NetworkRejected(String),
    #[error("session closed")]
    Closed,
}

/// Discovery callback for one publish or subscribe. Delivered in FIFO order.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// Publish/subscribe is live; carries the role's discovery channel.
    Started(Arc<dyn DiscoveryChannel>),
    ConfigFailed,
    PeerDiscovered { peer: PeerId, metadata: Vec<u8> },
    MessageReceived { peer: PeerId, payload: Vec<u8> },
    MessageSendResult { message_id: u32, ok: bool },
    Terminated,
}

pub type EventSink = mpsc::UnboundedSender<DiscoveryEvent>;

/// Message primitive of a started publish/subscribe.
pub trait DiscoveryChannel: Send + Sync + fmt::Debug {
    /// Provider-local identifier of this publish/subscribe; network requests are scoped by it.
    fn id(&self) -> u64;
    /// Queue `payload` for `peer`. The outcome arrives later as `MessageSendResult`.
    fn send_message(&self, peer: PeerId, message_id: u32, payload: &[u8])
        -> Result<(), ProviderError>;
    fn close(&self);
}

/// Result of a successful attach.
pub trait AttachedSession: Send + Sync {
    fn publish(
        &self,
        service_name: &str,
        metadata: Vec<u8>,
        sink: EventSink,
    ) -> Result<(), ProviderError>;
    fn subscribe(&self, service_name: &str, sink: EventSink) -> Result<(), ProviderError>;
    fn close(&self);
}

#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn attach(&self) -> Result<Arc<dyn AttachedSession>, ProviderError>;
}

/// Negotiated network, as named by the bring-up provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkHandle(pub u64);

/// Registered negotiation callback; must be unregistered on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

/// What the bring-up provider needs to negotiate a data path to one peer.
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub session: SessionId,
    pub role: Role,
    pub peer: PeerHandle,
    pub channel: Arc<dyn DiscoveryChannel>,
    pub passphrase: String,
    /// Publisher only: the port it already listens on.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(NetworkHandle),
    Capabilities {
        network: NetworkHandle,
        peer_addr: IpAddr,
        peer_port: u16,
    },
    Lost(NetworkHandle),
    Unavailable,
}

pub trait NetworkProvider: Send + Sync {
    fn negotiate(
        &self,
        request: NetworkRequest,
        sink: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<RegistrationId, ProviderError>;
    fn unregister(&self, registration: RegistrationId);
}

/// Host permission check, consulted before any provider call.
pub trait PermissionGate: Send + Sync {
    /// Names of missing permissions; empty when everything is granted.
    fn missing_permissions(&self) -> Vec<String>;
}

/// Gate for hosts without a permission model.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllGranted;

impl PermissionGate for AllGranted {
    fn missing_permissions(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The platform collaborators one coordinator runs against.
#[derive(Clone)]
pub struct Providers {
    pub discovery: Arc<dyn DiscoveryProvider>,
    pub network: Arc<dyn NetworkProvider>,
    pub permissions: Arc<dyn PermissionGate>,
}
