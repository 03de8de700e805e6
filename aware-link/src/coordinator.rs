//! Dual-role coordinator: one event loop drives a publisher and a subscriber session over a single
//! attach, fans link events out to listeners and serves commands. Data sends go straight to the
//! transport channels.

use std::sync::Arc;

use aware_core::{DeviceIdentity, Frame, PeerHandle, Role, SessionError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::discovery::{LinkSettings, RoleSession, RoleStatus};
use crate::establish::ConnectionEstablisher;
use crate::event::LinkEvent;
use crate::provider::{AttachedSession, DiscoveryProvider, NetworkProvider, ProviderError};
use crate::transport::{TransportChannel, TransportError};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("coordinator stopped")]
    Stopped,
}

enum Command {
    Send {
        role: Role,
        peer: Option<PeerHandle>,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopData {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    AddListener(mpsc::UnboundedSender<LinkEvent>),
}

struct RoleView {
    status: watch::Receiver<RoleStatus>,
    transport: TransportChannel,
}

pub struct Coordinator {
    commands: mpsc::UnboundedSender<Command>,
    publisher: RoleView,
    subscriber: RoleView,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Start both roles on `config.service_name`; `listener` sees every event from the start.
    pub fn start(
        config: &Config,
        identity: DeviceIdentity,
        discovery: Arc<dyn DiscoveryProvider>,
        network: Arc<dyn NetworkProvider>,
        listener: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let establisher = Arc::new(ConnectionEstablisher::new(network, config.bringup_policy()));
        let settings = LinkSettings {
            passphrase: config.passphrase.clone(),
            bind_addr: config.bind_addr,
            listen_port: config.listen_port,
        };
        let make = |role| {
            RoleSession::new(
                role,
                &config.service_name,
                identity.clone(),
                settings.clone(),
                establisher.clone(),
                link_tx.clone(),
                &cancel,
            )
        };
        let publisher = make(Role::Publisher);
        let subscriber = make(Role::Subscriber);
        let views = |s: &RoleSession| RoleView {
            status: s.status(),
            transport: s.transport().clone(),
        };
        let (publisher_view, subscriber_view) = (views(&publisher), views(&subscriber));

        let (commands, command_rx) = mpsc::unbounded_channel();
        info!(service = %config.service_name, %identity, "starting discovery");
        let task = tokio::spawn(run(
            EventLoop {
                publisher,
                subscriber,
                attached: None,
                listeners: vec![listener],
                link_rx,
                cancel,
            },
            discovery,
            command_rx,
        ));
        Self {
            commands,
            publisher: publisher_view,
            subscriber: subscriber_view,
            task: Mutex::new(Some(task)),
        }
    }

    fn view(&self, role: Role) -> &RoleView {
        match role {
            Role::Publisher => &self.publisher,
            Role::Subscriber => &self.subscriber,
        }
    }

    pub fn add_listener(&self, listener: mpsc::UnboundedSender<LinkEvent>) {
        let _ = self.commands.send(Command::AddListener(listener));
    }

    pub fn status(&self, role: Role) -> RoleStatus {
        self.view(role).status.borrow().clone()
    }

    pub fn transport(&self, role: Role) -> &TransportChannel {
        &self.view(role).transport
    }

    /// Wait until `role`'s status satisfies `f`. Fails once the coordinator has stopped.
    pub async fn wait_for(
        &self,
        role: Role,
        f: impl FnMut(&RoleStatus) -> bool,
    ) -> Result<RoleStatus, CoordinatorError> {
        let mut rx = self.view(role).status.clone();
        rx.wait_for(f)
            .await
            .map(|s| s.clone())
            .map_err(|_| CoordinatorError::Stopped)
    }

    /// Send a raw payload over `role`'s discovery channel, to `peer` or the current peer.
    pub async fn send_message(
        &self,
        role: Role,
        peer: Option<PeerHandle>,
        payload: Vec<u8>,
    ) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                role,
                peer,
                payload,
                reply,
            })
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?.map_err(Into::into)
    }

    /// Send a frame on the open data channel, preferring the publisher side. Returns the side used.
    pub fn send_frame(&self, frame: &Frame) -> Result<Role, TransportError> {
        for role in [Role::Publisher, Role::Subscriber] {
            let transport = self.transport(role);
            if transport.is_open() {
                match transport.send(frame) {
                    Ok(()) => return Ok(role),
                    // Closed between the check and the send; try the other side.
                    Err(TransportError::NotConnected) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(TransportError::NotConnected)
    }

    pub fn open_role(&self) -> Option<Role> {
        [Role::Publisher, Role::Subscriber]
            .into_iter()
            .find(|&r| self.transport(r).is_open())
    }

    pub fn is_data_connection_active(&self) -> bool {
        self.open_role().is_some()
    }

    /// Tear down data channels of both roles; discovery keeps running.
    pub async fn stop_data(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::StopData { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop both roles and release the attach. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct EventLoop {
    publisher: RoleSession,
    subscriber: RoleSession,
    attached: Option<Arc<dyn AttachedSession>>,
    listeners: Vec<mpsc::UnboundedSender<LinkEvent>>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    cancel: CancellationToken,
}

impl EventLoop {
    fn session(&mut self, role: Role) -> &mut RoleSession {
        match role {
            Role::Publisher => &mut self.publisher,
            Role::Subscriber => &mut self.subscriber,
        }
    }

    async fn on_attach(&mut self, result: Result<Arc<dyn AttachedSession>, ProviderError>) {
        if let Ok(a) = &result {
            self.attached = Some(a.clone());
        }
        self.publisher.attached(&result).await;
        self.subscriber.attached(&result).await;
        self.flush();
    }

    fn fan_out(&mut self, event: LinkEvent) {
        self.listeners.retain(|l| l.send(event.clone()).is_ok());
    }

    /// Deliver link events already queued, so listeners see a command's effects before its reply.
    fn flush(&mut self) {
        while let Ok(ev) = self.link_rx.try_recv() {
            self.fan_out(ev);
        }
    }

    async fn shutdown(&mut self) {
        self.publisher.stop().await;
        self.subscriber.stop().await;
        if let Some(a) = self.attached.take() {
            a.close();
        }
        self.cancel.cancel();
        self.flush();
        info!("discovery stopped");
    }
}

async fn run(
    mut lp: EventLoop,
    discovery: Arc<dyn DiscoveryProvider>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let _ = lp.publisher.begin();
    let _ = lp.subscriber.begin();
    let attach = discovery.attach();
    tokio::pin!(attach);
    let mut attaching = true;
    loop {
        tokio::select! {
            result = &mut attach, if attaching => {
                attaching = false;
                lp.on_attach(result).await;
            }
            ev = lp.publisher.next_event() => {
                lp.publisher.handle(ev).await;
                lp.flush();
            }
            ev = lp.subscriber.next_event() => {
                lp.subscriber.handle(ev).await;
                lp.flush();
            }
            Some(ev) = lp.link_rx.recv() => lp.fan_out(ev),
            cmd = commands.recv() => match cmd {
                Some(Command::Send { role, peer, payload, reply }) => {
                    let session = lp.session(role);
                    let result = match peer {
                        Some(p) => session.send_to(&p, payload).await,
                        None => session.send_to_current(payload).await,
                    };
                    lp.flush();
                    let _ = reply.send(result);
                }
                Some(Command::StopData { reply }) => {
                    lp.publisher.stop_data().await;
                    lp.subscriber.stop_data().await;
                    lp.flush();
                    debug!("data connections stopped");
                    let _ = reply.send(());
                }
                Some(Command::AddListener(l)) => lp.listeners.push(l),
                Some(Command::Stop { reply }) => {
                    lp.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                None => {
                    lp.shutdown().await;
                    break;
                }
            },
        }
    }
}
