//! Discovery session driver: runs one `DiscoverySession` against the providers, owns its
//! discovery channel, bring-up task and transport channel. Driven only from the coordinator's
//! event loop, so provider callbacks for a session never run concurrently.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use aware_core::{
    DeviceIdentity, DiscoverySession, PeerHandle, Role, SessionAction, SessionError, SessionState,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::establish::{ConnectionEstablisher, Endpoint, Negotiation, SessionContext};
use crate::event::LinkEvent;
use crate::provider::{AttachedSession, DiscoveryChannel, DiscoveryEvent, ProviderError};
use crate::transport::TransportChannel;

/// Snapshot of one role's discovery state, published after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleStatus {
    pub state: SessionState,
    pub peer: Option<PeerHandle>,
    pub peer_identity: Option<DeviceIdentity>,
}

/// Settings shared by both roles' bring-ups.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub passphrase: String,
    pub bind_addr: IpAddr,
    pub listen_port: u16,
}

struct BringUp {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct RoleSession {
    session: DiscoverySession,
    settings: LinkSettings,
    establisher: Arc<ConnectionEstablisher>,
    attached: Option<Arc<dyn AttachedSession>>,
    channel: Option<Arc<dyn DiscoveryChannel>>,
    events: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    transport: TransportChannel,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
    bring_up: Option<BringUp>,
    status: watch::Sender<RoleStatus>,
}

impl RoleSession {
    pub fn new(
        role: Role,
        service_name: &str,
        identity: DeviceIdentity,
        settings: LinkSettings,
        establisher: Arc<ConnectionEstablisher>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
        parent: &CancellationToken,
    ) -> Self {
        let session = DiscoverySession::new(role, service_name, identity);
        let cancel = parent.child_token();
        let transport = TransportChannel::new(role, link_events.clone(), cancel.clone());
        let (status, _) = watch::channel(Self::snapshot(&session));
        Self {
            session,
            settings,
            establisher,
            attached: None,
            channel: None,
            events: None,
            transport,
            link_events,
            cancel,
            bring_up: None,
            status,
        }
    }

    fn snapshot(session: &DiscoverySession) -> RoleStatus {
        RoleStatus {
            state: session.state().clone(),
            peer: session.peer(),
            peer_identity: session.peer_identity().cloned(),
        }
    }

    pub fn role(&self) -> Role {
        self.session.role()
    }

    pub fn state(&self) -> &SessionState {
        self.session.state()
    }

    pub fn transport(&self) -> &TransportChannel {
        &self.transport
    }

    pub fn status(&self) -> watch::Receiver<RoleStatus> {
        self.status.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        self.session.is_terminated()
    }

    /// Idle → Attaching; the caller performs the attach.
    pub fn begin(&mut self) -> Result<(), SessionError> {
        self.session.start()?;
        self.publish_status();
        Ok(())
    }

    /// Feed the shared attach result into this role.
    pub async fn attached(&mut self, result: &Result<Arc<dyn AttachedSession>, ProviderError>) {
        let actions = match result {
            Ok(attached) => {
                self.attached = Some(attached.clone());
                self.session.on_attached()
            }
            Err(e) => {
                warn!(role = %self.role(), "attach failed: {}", e);
                self.session.on_attach_failed()
            }
        };
        self.perform(actions).await;
    }

    /// Next provider event for this role; pending while nothing is subscribed.
    pub async fn next_event(&mut self) -> DiscoveryEvent {
        match self.events.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(ev) => ev,
                None => {
                    self.events = None;
                    DiscoveryEvent::Terminated
                }
            },
            None => std::future::pending().await,
        }
    }

    pub async fn handle(&mut self, event: DiscoveryEvent) {
        let role = self.role();
        let actions = match event {
            DiscoveryEvent::Started(channel) => {
                info!(%role, service = self.session.service_name(), "discovery started");
                self.channel = Some(channel);
                self.session.on_started();
                Vec::new()
            }
            DiscoveryEvent::ConfigFailed => {
                warn!(%role, "discovery configuration failed");
                self.session.on_config_failed()
            }
            DiscoveryEvent::PeerDiscovered { peer, metadata } => {
                info!(%role, %peer, "service discovered");
                self.session.on_peer_discovered(peer, &metadata)
            }
            DiscoveryEvent::MessageReceived { peer, payload } => {
                debug!(%role, %peer, len = payload.len(), "message received");
                self.session.on_message_received(peer, &payload)
            }
            DiscoveryEvent::MessageSendResult { message_id, ok } => {
                if ok {
                    debug!(%role, message_id, "message sent");
                } else {
                    warn!(%role, message_id, "message send failed");
                }
                self.session.on_message_send_result(message_id, ok)
            }
            DiscoveryEvent::Terminated => {
                info!(%role, "discovery session terminated");
                self.session.on_terminated()
            }
        };
        self.perform(actions).await;
    }

    /// Send a raw payload to the current peer over the discovery channel.
    pub async fn send_to_current(&mut self, payload: Vec<u8>) -> Result<(), SessionError> {
        let action = self.session.send_to_current(payload)?;
        self.perform(vec![action]).await;
        Ok(())
    }

    /// Send a raw payload to `peer`, which must belong to this session.
    pub async fn send_to(&mut self, peer: &PeerHandle, payload: Vec<u8>) -> Result<(), SessionError> {
        let action = self.session.send_message(peer, payload)?;
        self.perform(vec![action]).await;
        Ok(())
    }

    /// Cancel bring-up and close the transport; discovery keeps running.
    pub async fn stop_data(&mut self) {
        self.cancel_bring_up().await;
        self.transport.close().await;
    }

    /// Explicit stop. No-op once terminated.
    pub async fn stop(&mut self) {
        let actions = self.session.stop();
        self.perform(actions).await;
    }

    async fn perform(&mut self, actions: Vec<SessionAction>) {
        let role = self.role();
        let mut queue: VecDeque<SessionAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::Publish {
                    service_name,
                    metadata,
                } => {
                    let sink = self.subscribe_events();
                    let result = match &self.attached {
                        Some(a) => a.publish(&service_name, metadata, sink),
                        None => Err(ProviderError::Closed),
                    };
                    if let Err(e) = result {
                        warn!(%role, "publish rejected: {}", e);
                        queue.extend(self.session.on_config_failed());
                    }
                }
                SessionAction::Subscribe { service_name } => {
                    let sink = self.subscribe_events();
                    let result = match &self.attached {
                        Some(a) => a.subscribe(&service_name, sink),
                        None => Err(ProviderError::Closed),
                    };
                    if let Err(e) = result {
                        warn!(%role, "subscribe rejected: {}", e);
                        queue.extend(self.session.on_config_failed());
                    }
                }
                SessionAction::Notify(notice) => {
                    let _ = self.link_events.send(LinkEvent::Session { role, notice });
                }
                SessionAction::SendMessage {
                    peer,
                    message_id,
                    payload,
                } => {
                    let result = match &self.channel {
                        Some(ch) => ch.send_message(peer.peer(), message_id, &payload),
                        None => Err(ProviderError::Closed),
                    };
                    if let Err(e) = result {
                        warn!(%role, %peer, message_id, "message send failed: {}", e);
                        queue.extend(self.session.on_message_send_result(message_id, false));
                    }
                }
                SessionAction::BeginBringUp { peer } => self.begin_bring_up(peer).await,
                SessionAction::Release => self.release().await,
            }
        }
        self.publish_status();
    }

    fn subscribe_events(&mut self) -> mpsc::UnboundedSender<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(rx);
        tx
    }

    /// Reserve the port and register the network request before returning, so the
    /// DATA_CONNECTION_READY that follows only goes out once the peer has something to join.
    /// The bounded availability wait runs in a task.
    async fn begin_bring_up(&mut self, peer: PeerHandle) {
        let role = self.role();
        let Some(channel) = self.channel.clone() else {
            warn!(%role, %peer, "bring-up requested before discovery started");
            return;
        };
        // One connection per session: the previous one goes before a new bring-up.
        self.transport.retire();
        self.cancel_bring_up().await;
        self.transport.close().await;

        let ctx = SessionContext {
            session: self.session.id(),
            role,
            channel,
            passphrase: self.settings.passphrase.clone(),
            bind_addr: self.settings.bind_addr,
            listen_port: self.settings.listen_port,
        };
        let negotiation = match self.establisher.request(peer, &ctx).await {
            Ok(n) => n,
            Err(e) => {
                warn!(%role, %peer, "bring-up failed: {}", e);
                let _ = self.link_events.send(LinkEvent::BringupFailed {
                    role,
                    error: e.to_string(),
                });
                return;
            }
        };
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(run_bring_up(
            self.establisher.clone(),
            negotiation,
            self.transport.clone(),
            self.link_events.clone(),
            cancel.clone(),
        ));
        self.bring_up = Some(BringUp { cancel, task });
    }

    async fn cancel_bring_up(&mut self) {
        if let Some(b) = self.bring_up.take() {
            b.cancel.cancel();
            let _ = b.task.await;
        }
    }

    /// Teardown order: bring-up waits and read loops, sockets, negotiation, then the discovery
    /// handle, so no provider callback can reach a released handle. The bring-up task closes the
    /// transport before it unregisters.
    async fn release(&mut self) {
        let role = self.role();
        self.stop_data().await;
        self.cancel.cancel();
        if let Some(ch) = self.channel.take() {
            ch.close();
        }
        self.events = None;
        self.attached = None;
        info!(%role, "discovery session released");
    }

    fn publish_status(&self) {
        self.status.send_replace(Self::snapshot(&self.session));
    }
}

async fn run_bring_up(
    establisher: Arc<ConnectionEstablisher>,
    negotiation: Negotiation,
    transport: TransportChannel,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
) {
    let (role, peer) = (negotiation.role(), negotiation.peer());
    let (mut link, endpoint) = match establisher.complete(negotiation, &cancel).await {
        Ok(ok) => ok,
        Err(e) if e.is_cancelled() => {
            debug!(%role, %peer, "bring-up cancelled");
            return;
        }
        Err(e) => {
            warn!(%role, %peer, "bring-up failed: {}", e);
            let _ = events.send(LinkEvent::BringupFailed {
                role,
                error: e.to_string(),
            });
            return;
        }
    };
    let connection = match endpoint {
        Endpoint::Listen(listener) => transport.listen(listener),
        Endpoint::Connect(addr) => transport.connect(addr),
    };
    // The network lives exactly as long as the connection it carries.
    tokio::select! {
        _ = cancel.cancelled() => transport.close().await,
        reason = link.lost() => {
            info!(%role, %peer, %reason, "data network gone");
            transport.end(connection, reason);
        }
        _ = transport.closed(connection) => {
            debug!(%role, %peer, %connection, "connection ended, releasing network");
        }
    }
    establisher.release(link);
}
