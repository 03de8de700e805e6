//! Upward service surface for a UI or shell: text messaging over discovery, attachments and raw
//! data over the framed channel, connection status. Both listener styles view one coordinator.

use std::fmt;
use std::sync::Arc;

use aware_core::message::{NOTICE_CONNECTION_ESTABLISHED, NOTICE_CONNECTION_LOST, NOTICE_SEND_FAILED};
use aware_core::wire::OCTET_STREAM;
use aware_core::{DeviceIdentity, Frame, Message, Role, SessionNotice, SessionState, TerminationReason};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::event::LinkEvent;
use crate::provider::Providers;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("permission denied: missing {}", .0.join(", "))]
    PermissionDenied(Vec<String>),
    #[error("discovery not started")]
    NotStarted,
    #[error("no peer discovered")]
    NoPeer,
    #[error("discovery failed: {0}")]
    DiscoveryFailed(TerminationReason),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What `get_connection_status` reports; `Display` gives the UI string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    NoActiveSessions,
    PermissionDenied(Vec<String>),
    DiscoveryFailed(String),
    NoPeer,
    ConnectedToPeer(String),
    ConnectedAsServer,
    ConnectedAsClient,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::NoActiveSessions => f.write_str("No active sessions"),
            ConnectionStatus::PermissionDenied(missing) => {
                write!(f, "Permission denied: missing {}", missing.join(", "))
            }
            ConnectionStatus::DiscoveryFailed(reason) => write!(f, "Discovery failed: {}", reason),
            ConnectionStatus::NoPeer => f.write_str("No peer discovered"),
            ConnectionStatus::ConnectedToPeer(name) => write!(f, "Connected to peer: {}", name),
            ConnectionStatus::ConnectedAsServer => f.write_str("Connected as server"),
            ConnectionStatus::ConnectedAsClient => f.write_str("Connected as client"),
        }
    }
}

/// UI view of a link event, if it has one.
pub fn message_for(event: LinkEvent) -> Option<Message> {
    match event {
        LinkEvent::Session {
            role: Role::Subscriber,
            notice: SessionNotice::PeerDiscovered { identity, .. },
        } => Some(Message::service_discovered(&identity)),
        LinkEvent::Session {
            notice: SessionNotice::InboundText { text, .. },
            ..
        } => Some(Message::received(text)),
        LinkEvent::Session {
            notice: SessionNotice::MessageSendFailed { .. },
            ..
        } => Some(Message::notice(NOTICE_SEND_FAILED)),
        LinkEvent::Established { .. } => Some(Message::notice(NOTICE_CONNECTION_ESTABLISHED)),
        LinkEvent::Frame { frame, .. } => Some(Message::from_frame(frame, false)),
        LinkEvent::Lost { .. } => Some(Message::notice(NOTICE_CONNECTION_LOST)),
        _ => None,
    }
}

#[derive(Default)]
struct State {
    coordinator: Option<Arc<Coordinator>>,
    denied: Option<Vec<String>>,
    forwarders: Vec<JoinHandle<()>>,
}

pub struct AwareService {
    config: Config,
    identity: DeviceIdentity,
    providers: Providers,
    state: Mutex<State>,
    // Serializes start/stop so two callers never build two coordinators.
    lifecycle: tokio::sync::Mutex<()>,
}

impl AwareService {
    pub fn new(config: Config, identity: DeviceIdentity, providers: Providers) -> Self {
        Self {
            config,
            identity,
            providers,
            state: Mutex::new(State::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn coordinator(&self) -> Option<Arc<Coordinator>> {
        self.state.lock().coordinator.clone()
    }

    fn check_permissions(&self) -> Result<(), ServiceError> {
        let missing = self.providers.permissions.missing_permissions();
        let mut st = self.state.lock();
        if missing.is_empty() {
            st.denied = None;
            return Ok(());
        }
        warn!(missing = ?missing, "discovery refused: permissions missing");
        st.denied = Some(missing.clone());
        Err(ServiceError::PermissionDenied(missing))
    }

    /// Start discovery (or join the running one); `on_message` receives discovery notices,
    /// discovery-channel text and every inbound frame.
    pub async fn start_discovery<F>(&self, on_message: F) -> Result<(), ServiceError>
    where
        F: Fn(Message) + Send + 'static,
    {
        self.start_with(move |event| {
            if let Some(m) = message_for(event) {
                on_message(m);
            }
        })
        .await
    }

    /// Start discovery (or join the running one) with data-channel callbacks: `on_established`
    /// gets "server" or "client", `on_data` the payload of every inbound frame.
    pub async fn start_client_server_discovery<E, D, L>(
        &self,
        on_established: E,
        on_data: D,
        on_lost: L,
    ) -> Result<(), ServiceError>
    where
        E: Fn(String) + Send + 'static,
        D: Fn(Vec<u8>) + Send + 'static,
        L: Fn() + Send + 'static,
    {
        self.start_with(move |event| match event {
            LinkEvent::Established { role, .. } => on_established(role.transport_side().to_string()),
            LinkEvent::Frame { frame, .. } => on_data(frame.into_payload()),
            LinkEvent::Lost { .. } => on_lost(),
            _ => {}
        })
        .await
    }

    async fn start_with<H>(&self, handler: H) -> Result<(), ServiceError>
    where
        H: Fn(LinkEvent) + Send + 'static,
    {
        let _guard = self.lifecycle.lock().await;
        self.check_permissions()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<LinkEvent>();
        let forwarder = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                handler(ev);
            }
        });

        let running = self.coordinator();
        let coordinator = match running {
            Some(c) if !both_terminated(&c) => {
                c.add_listener(tx);
                c
            }
            stale => {
                if let Some(c) = stale {
                    // Both roles failed earlier; retry from scratch.
                    c.stop().await;
                }
                let c = Arc::new(Coordinator::start(
                    &self.config,
                    self.identity.clone(),
                    self.providers.discovery.clone(),
                    self.providers.network.clone(),
                    tx,
                ));
                self.state.lock().coordinator = Some(c.clone());
                c
            }
        };
        self.state.lock().forwarders.push(forwarder);

        for role in [Role::Publisher, Role::Subscriber] {
            coordinator
                .wait_for(role, |s| {
                    !matches!(s.state, SessionState::Idle | SessionState::Attaching)
                })
                .await
                .map_err(|_| ServiceError::NotStarted)?;
        }
        if both_terminated(&coordinator) {
            let reason = match coordinator.status(Role::Subscriber).state {
                SessionState::Terminated(r) => r,
                _ => TerminationReason::ProviderTerminated,
            };
            return Err(ServiceError::DiscoveryFailed(reason));
        }
        Ok(())
    }

    /// Legacy text send over the subscriber's discovery channel. Returns the local echo.
    pub async fn send_message(&self, text: &str) -> Result<Message, ServiceError> {
        let coordinator = self.coordinator().ok_or(ServiceError::NoPeer)?;
        match coordinator
            .send_message(Role::Subscriber, None, text.as_bytes().to_vec())
            .await
        {
            Ok(()) => Ok(Message::sent(text)),
            Err(CoordinatorError::Stopped) => Err(ServiceError::NotStarted),
            // No peer yet, or the subscriber session is no longer active.
            Err(CoordinatorError::Session(e)) => {
                warn!("send_message: {}", e);
                Err(ServiceError::NoPeer)
            }
        }
    }

    /// Send an attachment frame on the active data channel. Returns the local echo.
    pub fn send_attachment(&self, payload: Vec<u8>, mime_type: &str) -> Result<Message, ServiceError> {
        let frame = Frame::attachment(mime_type, payload);
        self.send_frame(&frame)?;
        Ok(Message::from_frame(frame, true))
    }

    /// Raw bytes on the active data channel, as an octet-stream attachment.
    pub fn send_data(&self, data: Vec<u8>) -> Result<(), ServiceError> {
        self.send_frame(&Frame::attachment(OCTET_STREAM, data))
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), ServiceError> {
        let coordinator = self
            .coordinator()
            .ok_or(ServiceError::Transport(TransportError::NotConnected))?;
        coordinator.send_frame(frame)?;
        Ok(())
    }

    pub fn is_peer_connected(&self) -> bool {
        self.coordinator().is_some_and(|c| {
            c.is_data_connection_active()
                || [Role::Publisher, Role::Subscriber]
                    .into_iter()
                    .any(|r| c.status(r).peer.is_some())
        })
    }

    pub fn is_data_connection_active(&self) -> bool {
        self.coordinator()
            .is_some_and(|c| c.is_data_connection_active())
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        let (coordinator, denied) = {
            let st = self.state.lock();
            (st.coordinator.clone(), st.denied.clone())
        };
        let Some(c) = coordinator else {
            return match denied {
                Some(missing) => ConnectionStatus::PermissionDenied(missing),
                None => ConnectionStatus::NoActiveSessions,
            };
        };
        match c.open_role() {
            Some(Role::Publisher) => return ConnectionStatus::ConnectedAsServer,
            Some(Role::Subscriber) => return ConnectionStatus::ConnectedAsClient,
            None => {}
        }
        let statuses = [c.status(Role::Subscriber), c.status(Role::Publisher)];
        if let Some(identity) = statuses
            .iter()
            .find_map(|s| s.peer.and(s.peer_identity.clone()))
        {
            return ConnectionStatus::ConnectedToPeer(identity.name().to_string());
        }
        if let Some(reason) = statuses.iter().find_map(|s| match s.state {
            SessionState::Terminated(r) if r != TerminationReason::Stopped => Some(r),
            _ => None,
        }) {
            return ConnectionStatus::DiscoveryFailed(reason.to_string());
        }
        if statuses
            .iter()
            .all(|s| matches!(s.state, SessionState::Terminated(_)))
        {
            return ConnectionStatus::NoActiveSessions;
        }
        ConnectionStatus::NoPeer
    }

    /// Close data channels and cancel bring-ups; discovery keeps running.
    pub async fn stop_data_connection(&self) {
        if let Some(c) = self.coordinator() {
            c.stop_data().await;
        }
    }

    /// Stop everything. Idempotent.
    pub async fn stop_discovery(&self) {
        let _guard = self.lifecycle.lock().await;
        let (coordinator, forwarders) = {
            let mut st = self.state.lock();
            (st.coordinator.take(), std::mem::take(&mut st.forwarders))
        };
        if let Some(c) = coordinator {
            c.stop().await;
            info!("discovery stopped by request");
        }
        // Forwarders end once the coordinator drops its listeners.
        for f in forwarders {
            let _ = f.await;
        }
    }
}

fn both_terminated(c: &Coordinator) -> bool {
    [Role::Publisher, Role::Subscriber]
        .into_iter()
        .all(|r| matches!(c.status(r).state, SessionState::Terminated(_)))
}
