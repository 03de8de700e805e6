//! Proximity link runtime: drives discovery sessions against platform providers, negotiates a
//! data network per discovered peer and runs the framed transport over it.
//!
//! The protocol logic lives in `aware-core`; this crate owns the tasks, sockets and timers.

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod establish;
pub mod event;
pub mod medium;
pub mod provider;
pub mod service;
pub mod transport;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorError};
pub use event::{ConnectionId, LinkEvent, LostReason};
pub use provider::{
    DiscoveryChannel, DiscoveryEvent, DiscoveryProvider, NetworkEvent, NetworkProvider,
    PermissionGate, Providers,
};
pub use service::{AwareService, ConnectionStatus, ServiceError};
pub use transport::{TransportChannel, TransportError};
