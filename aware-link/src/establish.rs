//! Connection establisher: negotiate a data network to a discovered peer and wait, bounded, for it
//! to become usable. The publisher reserves its listen port before negotiating so the port can be
//! advertised; the subscriber additionally waits for the peer's address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use aware_core::{PeerHandle, Role, SessionId};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::event::LostReason;
use crate::provider::{
    DiscoveryChannel, NetworkEvent, NetworkHandle, NetworkProvider, NetworkRequest, ProviderError,
    RegistrationId,
};

/// Bounded availability wait. Default 50 polls at 100 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringupPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for BringupPolicy {
    fn default() -> Self {
        Self {
            attempts: 50,
            interval: Duration::from_millis(100),
        }
    }
}

/// Per-session inputs to a bring-up.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session: SessionId,
    pub role: Role,
    pub channel: Arc<dyn DiscoveryChannel>,
    pub passphrase: String,
    pub bind_addr: IpAddr,
    pub listen_port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    #[error("peer {peer} does not belong to session {session}")]
    ForeignPeer { peer: PeerHandle, session: SessionId },
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("bring-up timed out waiting for {stage} after {attempts} attempts")]
    BringupTimeout { stage: &'static str, attempts: u32 },
    #[error("network unavailable")]
    Unavailable,
    #[error("network lost during bring-up")]
    NetworkLost,
    #[error("bring-up cancelled")]
    Cancelled,
}

impl EstablishError {
    /// Cancellation is teardown, not failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EstablishError::Cancelled)
    }
}

/// Where the transport channel goes next.
#[derive(Debug)]
pub enum Endpoint {
    /// Publisher: accept one connection on the pre-bound listener.
    Listen(TcpListener),
    /// Subscriber: connect to the resolved peer address.
    Connect(SocketAddr),
}

/// A negotiated network. Must be handed back to `ConnectionEstablisher::release`.
#[derive(Debug)]
pub struct NetworkLink {
    pub network: NetworkHandle,
    pub registration: RegistrationId,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
}

impl NetworkLink {
    /// Resolves when the provider reports this network gone.
    pub async fn lost(&mut self) -> LostReason {
        while let Some(ev) = self.events.recv().await {
            match ev {
                NetworkEvent::Lost(h) if h == self.network => return LostReason::NetworkLost,
                NetworkEvent::Unavailable => return LostReason::Unavailable,
                _ => {}
            }
        }
        // Provider dropped its sink without a verdict; the network stays up until teardown.
        std::future::pending().await
    }
}

/// A registered network request that is not usable yet. Hand it to
/// `ConnectionEstablisher::complete`, which unregisters it on failure.
#[derive(Debug)]
pub struct Negotiation {
    session: SessionId,
    role: Role,
    peer: PeerHandle,
    registration: RegistrationId,
    listener: Option<TcpListener>,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
}

impl Negotiation {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> PeerHandle {
        self.peer
    }
}

pub struct ConnectionEstablisher {
    provider: Arc<dyn NetworkProvider>,
    policy: BringupPolicy,
}

impl ConnectionEstablisher {
    pub fn new(provider: Arc<dyn NetworkProvider>, policy: BringupPolicy) -> Self {
        Self { provider, policy }
    }

    /// Negotiate a network to `peer` and wait until the transport can be started.
    /// On any error the negotiation is unregistered before returning.
    pub async fn establish(
        &self,
        peer: PeerHandle,
        ctx: &SessionContext,
        cancel: &CancellationToken,
    ) -> Result<(NetworkLink, Endpoint), EstablishError> {
        let negotiation = self.request(peer, ctx).await?;
        self.complete(negotiation, cancel).await
    }

    /// Reserve the publisher's listen port and register the network request. Returns once the
    /// provider holds the registration, so a peer told to connect can find it.
    pub async fn request(
        &self,
        peer: PeerHandle,
        ctx: &SessionContext,
    ) -> Result<Negotiation, EstablishError> {
        if !peer.belongs_to(ctx.session) {
            return Err(EstablishError::ForeignPeer {
                peer,
                session: ctx.session,
            });
        }
        let listener = match ctx.role {
            Role::Publisher => {
                let l = TcpListener::bind(SocketAddr::new(ctx.bind_addr, ctx.listen_port))
                    .await
                    .map_err(EstablishError::Bind)?;
                Some(l)
            }
            Role::Subscriber => None,
        };
        let port = match &listener {
            Some(l) => Some(l.local_addr().map_err(EstablishError::Bind)?.port()),
            None => None,
        };
        if let Some(port) = port {
            info!(session = %ctx.session, port, "server socket created");
        }

        let (tx, events) = mpsc::unbounded_channel();
        let registration = self.provider.negotiate(
            NetworkRequest {
                session: ctx.session,
                role: ctx.role,
                peer,
                channel: ctx.channel.clone(),
                passphrase: ctx.passphrase.clone(),
                port,
            },
            tx,
        )?;
        debug!(session = %ctx.session, role = %ctx.role, %peer, "network requested");
        Ok(Negotiation {
            session: ctx.session,
            role: ctx.role,
            peer,
            registration,
            listener,
            events,
        })
    }

    /// Bounded wait for a registered negotiation to become usable.
    pub async fn complete(
        &self,
        negotiation: Negotiation,
        cancel: &CancellationToken,
    ) -> Result<(NetworkLink, Endpoint), EstablishError> {
        let Negotiation {
            session,
            role,
            registration,
            listener,
            mut events,
            ..
        } = negotiation;
        match self.wait(role, &mut events, cancel).await {
            Ok((network, peer_addr)) => {
                let endpoint = match (listener, peer_addr) {
                    (Some(l), _) => Endpoint::Listen(l),
                    (None, Some(addr)) => Endpoint::Connect(addr),
                    (None, None) => {
                        self.provider.unregister(registration);
                        return Err(EstablishError::Unavailable);
                    }
                };
                info!(%session, %role, ?network, "network available");
                Ok((
                    NetworkLink {
                        network,
                        registration,
                        events,
                    },
                    endpoint,
                ))
            }
            Err(e) => {
                self.provider.unregister(registration);
                Err(e)
            }
        }
    }

    pub fn release(&self, link: NetworkLink) {
        self.provider.unregister(link.registration);
    }

    async fn wait(
        &self,
        role: Role,
        rx: &mut mpsc::UnboundedReceiver<NetworkEvent>,
        cancel: &CancellationToken,
    ) -> Result<(NetworkHandle, Option<SocketAddr>), EstablishError> {
        let mut network: Option<NetworkHandle> = None;
        let mut stage = "network availability";
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(EstablishError::Cancelled);
            }
            loop {
                match rx.try_recv() {
                    Ok(NetworkEvent::Available(h)) => {
                        if network.is_none() {
                            network = Some(h);
                            // Capability resolution gets its own bound.
                            attempt = 0;
                            stage = "peer capabilities";
                        }
                    }
                    Ok(NetworkEvent::Capabilities {
                        network: h,
                        peer_addr,
                        peer_port,
                    }) => {
                        let h = *network.get_or_insert(h);
                        if role == Role::Subscriber {
                            debug!(%peer_addr, peer_port, "peer capabilities resolved");
                            return Ok((h, Some(SocketAddr::new(peer_addr, peer_port))));
                        }
                    }
                    Ok(NetworkEvent::Lost(_)) => return Err(EstablishError::NetworkLost),
                    Ok(NetworkEvent::Unavailable) | Err(TryRecvError::Disconnected) => {
                        return Err(EstablishError::Unavailable)
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }
            if role == Role::Publisher {
                if let Some(h) = network {
                    return Ok((h, None));
                }
            }
            if attempt >= self.policy.attempts {
                return Err(EstablishError::BringupTimeout {
                    stage,
                    attempts: self.policy.attempts,
                });
            }
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(EstablishError::Cancelled),
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aware_core::PeerId;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct NullChannel;

    impl DiscoveryChannel for NullChannel {
        fn id(&self) -> u64 {
            1
        }
        fn send_message(&self, _: PeerId, _: u32, _: &[u8]) -> Result<(), ProviderError> {
            Ok(())
        }
        fn close(&self) {}
    }

    /// Replays `script` into every negotiation and records requests and unregisters.
    #[derive(Default)]
    struct Scripted {
        script: Vec<NetworkEvent>,
        requests: Mutex<Vec<Option<u16>>>,
        sinks: Mutex<Vec<mpsc::UnboundedSender<NetworkEvent>>>,
        unregistered: Mutex<Vec<RegistrationId>>,
    }

    impl NetworkProvider for Scripted {
        fn negotiate(
            &self,
            request: NetworkRequest,
            sink: mpsc::UnboundedSender<NetworkEvent>,
        ) -> Result<RegistrationId, ProviderError> {
            let mut requests = self.requests.lock();
            requests.push(request.port);
            for ev in &self.script {
                let _ = sink.send(ev.clone());
            }
            self.sinks.lock().push(sink);
            Ok(RegistrationId(requests.len() as u64))
        }
        fn unregister(&self, registration: RegistrationId) {
            self.unregistered.lock().push(registration);
        }
    }

    fn ctx(role: Role) -> SessionContext {
        SessionContext {
            session: SessionId::new(),
            role,
            channel: Arc::new(NullChannel),
            passphrase: "pass".into(),
            bind_addr: IpAddr::from([127u8, 0, 0, 1]),
            listen_port: 0,
        }
    }

    fn fast() -> BringupPolicy {
        BringupPolicy {
            attempts: 3,
            interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn publisher_advertises_bound_port() {
        let provider = Arc::new(Scripted {
            script: vec![NetworkEvent::Available(NetworkHandle(7))],
            ..Default::default()
        });
        let est = ConnectionEstablisher::new(provider.clone(), fast());
        let c = ctx(Role::Publisher);
        let peer = PeerHandle::new(c.session, PeerId(1));
        let (link, endpoint) = est
            .establish(peer, &c, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(link.network, NetworkHandle(7));
        let advertised = provider.requests.lock()[0].expect("port advertised");
        assert_ne!(advertised, 0);
        match endpoint {
            Endpoint::Listen(l) => assert_eq!(l.local_addr().unwrap().port(), advertised),
            other => panic!("unexpected {other:?}"),
        }
        est.release(link);
        assert_eq!(provider.unregistered.lock().len(), 1);
    }

    #[tokio::test]
    async fn request_registers_before_any_wait() {
        let provider = Arc::new(Scripted::default());
        let est = ConnectionEstablisher::new(provider.clone(), fast());
        let c = ctx(Role::Publisher);
        let peer = PeerHandle::new(c.session, PeerId(1));
        let negotiation = est.request(peer, &c).await.unwrap();
        assert_eq!(negotiation.role(), Role::Publisher);
        assert_eq!(negotiation.peer(), peer);
        assert_eq!(provider.requests.lock().len(), 1);
        assert!(provider.requests.lock()[0].is_some());
        assert!(provider.unregistered.lock().is_empty());

        let err = est
            .complete(negotiation, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EstablishError::BringupTimeout { .. }));
        assert_eq!(provider.unregistered.lock().len(), 1);
    }

    #[tokio::test]
    async fn subscriber_waits_for_capabilities() {
        let provider = Arc::new(Scripted {
            script: vec![
                NetworkEvent::Available(NetworkHandle(3)),
                NetworkEvent::Capabilities {
                    network: NetworkHandle(3),
                    peer_addr: IpAddr::from([127u8, 0, 0, 1]),
                    peer_port: 4321,
                },
            ],
            ..Default::default()
        });
        let est = ConnectionEstablisher::new(provider.clone(), fast());
        let c = ctx(Role::Subscriber);
        let peer = PeerHandle::new(c.session, PeerId(1));
        let (_, endpoint) = est
            .establish(peer, &c, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(provider.requests.lock()[0], None);
        match endpoint {
            Endpoint::Connect(addr) => assert_eq!(addr, "127.0.0.1:4321".parse().unwrap()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_availability_times_out_and_unregisters() {
        let provider = Arc::new(Scripted::default());
        let est = ConnectionEstablisher::new(provider.clone(), fast());
        let c = ctx(Role::Publisher);
        let peer = PeerHandle::new(c.session, PeerId(1));
        let err = est
            .establish(peer, &c, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EstablishError::BringupTimeout { attempts: 3, .. }
        ));
        assert_eq!(provider.unregistered.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_wait_is_benign() {
        let provider = Arc::new(Scripted::default());
        let est = ConnectionEstablisher::new(
            provider.clone(),
            BringupPolicy {
                attempts: 1000,
                interval: Duration::from_millis(50),
            },
        );
        let c = ctx(Role::Subscriber);
        let peer = PeerHandle::new(c.session, PeerId(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let err = est.establish(peer, &c, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.unregistered.lock().len(), 1);
    }

    #[tokio::test]
    async fn lost_during_wait() {
        let provider = Arc::new(Scripted {
            script: vec![NetworkEvent::Lost(NetworkHandle(1))],
            ..Default::default()
        });
        let est = ConnectionEstablisher::new(provider, fast());
        let c = ctx(Role::Subscriber);
        let peer = PeerHandle::new(c.session, PeerId(1));
        let err = est
            .establish(peer, &c, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EstablishError::NetworkLost));
    }

    #[tokio::test]
    async fn foreign_peer_never_negotiates() {
        let provider = Arc::new(Scripted::default());
        let est = ConnectionEstablisher::new(provider.clone(), fast());
        let c = ctx(Role::Subscriber);
        let other = PeerHandle::new(SessionId::new(), PeerId(1));
        let err = est
            .establish(other, &c, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EstablishError::ForeignPeer { .. }));
        assert!(provider.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn link_reports_loss_of_its_network() {
        let provider = Arc::new(Scripted {
            script: vec![NetworkEvent::Available(NetworkHandle(5))],
            ..Default::default()
        });
        let est = ConnectionEstablisher::new(provider.clone(), fast());
        let c = ctx(Role::Publisher);
        let peer = PeerHandle::new(c.session, PeerId(1));
        let (mut link, _endpoint) = est
            .establish(peer, &c, &CancellationToken::new())
            .await
            .unwrap();
        let sink = provider.sinks.lock()[0].clone();
        sink.send(NetworkEvent::Lost(NetworkHandle(99))).unwrap();
        sink.send(NetworkEvent::Lost(NetworkHandle(5))).unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(1), link.lost())
            .await
            .unwrap();
        assert_eq!(reason, LostReason::NetworkLost);
    }
}
