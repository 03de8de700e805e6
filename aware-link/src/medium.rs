//! In-process proximity medium. Devices attach, publish and subscribe by service name, exchange
//! discovery messages and negotiate loopback "networks". Faults can be injected per device.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use aware_core::{PeerId, Role};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::provider::{
    AllGranted, AttachedSession, DiscoveryChannel, DiscoveryEvent, DiscoveryProvider, EventSink,
    NetworkEvent, NetworkHandle, NetworkProvider, NetworkRequest, ProviderError, Providers,
    RegistrationId,
};

/// Per-device fault switches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Faults {
    pub fail_attach: bool,
    pub fail_publish: bool,
    pub fail_subscribe: bool,
    /// Every discovery message send reports failure.
    pub fail_sends: bool,
    /// Negotiations never become available.
    pub withhold_network: bool,
}

struct Endpoint {
    device: u64,
    attach: u64,
    role: Role,
    service: String,
    metadata: Vec<u8>,
    sink: EventSink,
}

struct Negotiation {
    device: u64,
    local: u64,
    remote: u64,
    port: Option<u16>,
    sink: mpsc::UnboundedSender<NetworkEvent>,
    network: Option<NetworkHandle>,
    /// Registration this one was connected with.
    paired: Option<u64>,
}

struct MediumState {
    next_id: u64,
    loopback: IpAddr,
    endpoints: HashMap<u64, Endpoint>,
    negotiations: HashMap<u64, Negotiation>,
    faults: HashMap<u64, Faults>,
}

impl MediumState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn faults(&self, device: u64) -> Faults {
        self.faults.get(&device).copied().unwrap_or_default()
    }

    /// Tell every subscriber of the service on another device about every matching publisher.
    fn match_endpoint(&self, id: u64) {
        let Some(endpoint) = self.endpoints.get(&id) else {
            return;
        };
        for (&other, e) in &self.endpoints {
            if e.service != endpoint.service || e.device == endpoint.device || e.role == endpoint.role
            {
                continue;
            }
            let (publisher, subscriber) = match endpoint.role {
                Role::Publisher => (endpoint, e),
                Role::Subscriber => (e, endpoint),
            };
            let publisher_id = if endpoint.role == Role::Publisher { id } else { other };
            let _ = subscriber.sink.send(DiscoveryEvent::PeerDiscovered {
                peer: PeerId(publisher_id as u32),
                metadata: publisher.metadata.clone(),
            });
            debug!(publisher = publisher_id, service = %endpoint.service, "service matched");
        }
    }

    /// Complete `reg` if its counterpart has also asked for a network.
    fn try_connect(&mut self, reg: u64) {
        let Some(n) = self.negotiations.get(&reg) else {
            return;
        };
        if self.faults(n.device).withhold_network {
            return;
        }
        let (local, remote) = (n.local, n.remote);
        let other = self
            .negotiations
            .iter()
            .find(|(&id, o)| {
                id != reg && o.local == remote && o.remote == local && o.paired.is_none()
            })
            .map(|(&id, o)| (id, o.device));
        let Some((other, other_device)) = other else {
            return;
        };
        if self.faults(other_device).withhold_network {
            return;
        }
        let port = [reg, other]
            .iter()
            .find_map(|id| self.negotiations.get(id).and_then(|n| n.port));
        let Some(port) = port else {
            return;
        };
        let peer_addr = self.loopback;
        for (id, counterpart) in [(reg, other), (other, reg)] {
            let handle = NetworkHandle(self.next_id());
            if let Some(n) = self.negotiations.get_mut(&id) {
                n.network = Some(handle);
                n.paired = Some(counterpart);
                let _ = n.sink.send(NetworkEvent::Available(handle));
                let _ = n.sink.send(NetworkEvent::Capabilities {
                    network: handle,
                    peer_addr,
                    peer_port: port,
                });
            }
        }
        debug!(local, remote, port, "network negotiated");
    }

    fn counterpart(&self, reg: u64) -> Option<u64> {
        self.negotiations.get(&reg)?.paired
    }

    fn lose(&mut self, reg: u64) {
        if let Some(n) = self.negotiations.get_mut(&reg) {
            if let Some(handle) = n.network.take() {
                let _ = n.sink.send(NetworkEvent::Lost(handle));
            }
        }
    }
}

/// Shared medium; devices created from one medium can see each other.
#[derive(Clone)]
pub struct LocalMedium {
    state: Arc<Mutex<MediumState>>,
}

impl std::fmt::Debug for LocalMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedium").finish_non_exhaustive()
    }
}

impl Default for LocalMedium {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl LocalMedium {
    /// `loopback` is the address every negotiated network resolves the peer to.
    pub fn new(loopback: IpAddr) -> Self {
        Self {
            state: Arc::new(Mutex::new(MediumState {
                next_id: 0,
                loopback,
                endpoints: HashMap::new(),
                negotiations: HashMap::new(),
                faults: HashMap::new(),
            })),
        }
    }

    pub fn device(&self) -> LocalDevice {
        let id = self.state.lock().next_id();
        LocalDevice {
            id,
            medium: self.clone(),
        }
    }

    fn add_endpoint(&self, endpoint: Endpoint) {
        let mut st = self.state.lock();
        let id = st.next_id();
        let sink = endpoint.sink.clone();
        st.endpoints.insert(id, endpoint);
        let channel: Arc<dyn DiscoveryChannel> = Arc::new(LocalChannel {
            id,
            medium: self.clone(),
        });
        let _ = sink.send(DiscoveryEvent::Started(channel));
        st.match_endpoint(id);
    }
}

/// One simulated device: its discovery and network-bring-up providers.
#[derive(Clone)]
pub struct LocalDevice {
    id: u64,
    medium: LocalMedium,
}

impl LocalDevice {
    pub fn set_faults(&self, faults: Faults) {
        self.medium.state.lock().faults.insert(self.id, faults);
    }

    /// Drop every negotiated network of this device; both ends see `Lost`.
    pub fn lose_network(&self) {
        let mut st = self.medium.state.lock();
        let mine: Vec<u64> = st
            .negotiations
            .iter()
            .filter(|(_, n)| n.device == self.id && n.network.is_some())
            .map(|(&id, _)| id)
            .collect();
        for reg in mine {
            if let Some(other) = st.counterpart(reg) {
                st.lose(other);
            }
            st.lose(reg);
        }
    }

    /// Negotiations this device has not unregistered yet.
    pub fn active_negotiations(&self) -> usize {
        let st = self.medium.state.lock();
        st.negotiations.values().filter(|n| n.device == self.id).count()
    }

    /// Publish/subscribe sessions of this device still open.
    pub fn open_endpoints(&self) -> usize {
        let st = self.medium.state.lock();
        st.endpoints.values().filter(|e| e.device == self.id).count()
    }

    pub fn providers(&self) -> Providers {
        Providers {
            discovery: Arc::new(self.clone()),
            network: Arc::new(self.clone()),
            permissions: Arc::new(AllGranted),
        }
    }
}

#[async_trait]
impl DiscoveryProvider for LocalDevice {
    async fn attach(&self) -> Result<Arc<dyn AttachedSession>, ProviderError> {
        let mut st = self.medium.state.lock();
        if st.faults(self.id).fail_attach {
            return Err(ProviderError::AttachFailed("proximity service unavailable".into()));
        }
        let attach = st.next_id();
        debug!(device = self.id, attach, "attached");
        Ok(Arc::new(LocalAttach {
            id: attach,
            device: self.id,
            medium: self.medium.clone(),
        }))
    }
}

impl NetworkProvider for LocalDevice {
    fn negotiate(
        &self,
        request: NetworkRequest,
        sink: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<RegistrationId, ProviderError> {
        let local = request.channel.id();
        let remote = u64::from(request.peer.peer().0);
        let mut st = self.medium.state.lock();
        if !st.endpoints.contains_key(&local) {
            return Err(ProviderError::NetworkRejected(
                "discovery session closed".into(),
            ));
        }
        let reg = st.next_id();
        st.negotiations.insert(
            reg,
            Negotiation {
                device: self.id,
                local,
                remote,
                port: request.port,
                sink,
                network: None,
                paired: None,
            },
        );
        debug!(device = self.id, reg, role = %request.role, port = ?request.port, "negotiation registered");
        st.try_connect(reg);
        Ok(RegistrationId(reg))
    }

    fn unregister(&self, registration: RegistrationId) {
        let mut st = self.medium.state.lock();
        let connected = st
            .negotiations
            .get(&registration.0)
            .is_some_and(|n| n.network.is_some());
        if connected {
            if let Some(other) = st.counterpart(registration.0) {
                st.lose(other);
            }
        }
        st.negotiations.remove(&registration.0);
    }
}

struct LocalAttach {
    id: u64,
    device: u64,
    medium: LocalMedium,
}

impl AttachedSession for LocalAttach {
    fn publish(
        &self,
        service_name: &str,
        metadata: Vec<u8>,
        sink: EventSink,
    ) -> Result<(), ProviderError> {
        if self.medium.state.lock().faults(self.device).fail_publish {
            return Err(ProviderError::ConfigRejected("publish rejected".into()));
        }
        self.medium.add_endpoint(Endpoint {
            device: self.device,
            attach: self.id,
            role: Role::Publisher,
            service: service_name.to_string(),
            metadata,
            sink,
        });
        Ok(())
    }

    fn subscribe(&self, service_name: &str, sink: EventSink) -> Result<(), ProviderError> {
        if self.medium.state.lock().faults(self.device).fail_subscribe {
            return Err(ProviderError::ConfigRejected("subscribe rejected".into()));
        }
        self.medium.add_endpoint(Endpoint {
            device: self.device,
            attach: self.id,
            role: Role::Subscriber,
            service: service_name.to_string(),
            metadata: Vec::new(),
            sink,
        });
        Ok(())
    }

    fn close(&self) {
        self.medium
            .state
            .lock()
            .endpoints
            .retain(|_, e| e.attach != self.id);
    }
}

#[derive(Debug)]
struct LocalChannel {
    id: u64,
    medium: LocalMedium,
}

impl DiscoveryChannel for LocalChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn send_message(&self, peer: PeerId, message_id: u32, payload: &[u8]) -> Result<(), ProviderError> {
        let st = self.medium.state.lock();
        let Some(me) = st.endpoints.get(&self.id) else {
            return Err(ProviderError::Closed);
        };
        let delivered = !st.faults(me.device).fail_sends
            && match st.endpoints.get(&u64::from(peer.0)) {
                Some(target) => target
                    .sink
                    .send(DiscoveryEvent::MessageReceived {
                        peer: PeerId(self.id as u32),
                        payload: payload.to_vec(),
                    })
                    .is_ok(),
                None => false,
            };
        let _ = me.sink.send(DiscoveryEvent::MessageSendResult {
            message_id,
            ok: delivered,
        });
        Ok(())
    }

    fn close(&self) {
        self.medium.state.lock().endpoints.remove(&self.id);
    }
}
