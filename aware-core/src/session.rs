//! Discovery session state machine. Host-driven: the host feeds provider events in order and
//! performs the returned actions (publish, subscribe, send on the discovery channel, bring-up).

use crate::identity::{DeviceIdentity, PeerHandle, PeerId, SessionId};
use crate::protocol::{ControlMessage, Role};

/// Lifecycle of one discovery session. `Terminated` is absorbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Attaching,
    Attached,
    Publishing,
    Subscribing,
    PeerDiscovered,
    Terminated(TerminationReason),
}

/// Why a session reached `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Stopped,
    AttachFailed,
    PublishConfigFailed,
    SubscribeConfigFailed,
    ProviderTerminated,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TerminationReason::Stopped => "stopped",
            TerminationReason::AttachFailed => "attach failed",
            TerminationReason::PublishConfigFailed => "publish configuration failed",
            TerminationReason::SubscribeConfigFailed => "subscribe configuration failed",
            TerminationReason::ProviderTerminated => "terminated by provider",
        })
    }
}

/// Upward notification for the host's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    PeerDiscovered {
        peer: PeerHandle,
        identity: DeviceIdentity,
    },
    /// Discovery-channel payload that is not a control token.
    InboundText { peer: PeerHandle, text: String },
    MessageSendFailed { message_id: u32 },
    Terminated(TerminationReason),
}

/// Action for the host to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Publish {
        service_name: String,
        metadata: Vec<u8>,
    },
    Subscribe {
        service_name: String,
    },
    Notify(SessionNotice),
    SendMessage {
        peer: PeerHandle,
        message_id: u32,
        payload: Vec<u8>,
    },
    /// Close any prior connection for this session and bring up the data network to `peer`.
    BeginBringUp { peer: PeerHandle },
    /// Cancel bring-up and transport, unregister negotiation, then release the discovery handle.
    Release,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("peer handle {peer} does not belong to session {session}")]
    ForeignPeer { peer: PeerHandle, session: SessionId },
    #[error("no peer discovered")]
    NoPeer,
    #[error("session is {0:?}")]
    InvalidState(SessionState),
}

/// One discovery session in one role.
pub struct DiscoverySession {
    id: SessionId,
    role: Role,
    service_name: String,
    identity: DeviceIdentity,
    state: SessionState,
    peer: Option<PeerHandle>,
    peer_identity: Option<DeviceIdentity>,
    next_message_id: u32,
}

impl DiscoverySession {
    pub fn new(role: Role, service_name: impl Into<String>, identity: DeviceIdentity) -> Self {
        Self {
            id: SessionId::new(),
            role,
            service_name: service_name.into(),
            identity,
            state: SessionState::Idle,
            peer: None,
            peer_identity: None,
            // Random start so ids from successive sessions rarely collide in provider logs.
            next_message_id: rand::random::<u16>() as u32,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn peer(&self) -> Option<PeerHandle> {
        self.peer
    }

    pub fn peer_identity(&self) -> Option<&DeviceIdentity> {
        self.peer_identity.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, SessionState::Terminated(_))
    }

    /// Publishing, Subscribing or PeerDiscovered: the discovery channel is usable.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Publishing | SessionState::Subscribing | SessionState::PeerDiscovered
        )
    }

    /// Idle → Attaching. The host then calls the provider's attach.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState(self.state.clone()));
        }
        self.state = SessionState::Attaching;
        Ok(())
    }

    pub fn on_attached(&mut self) -> Vec<SessionAction> {
        if self.state != SessionState::Attaching {
            return vec![];
        }
        self.state = SessionState::Attached;
        match self.role {
            Role::Publisher => vec![SessionAction::Publish {
                service_name: self.service_name.clone(),
                metadata: self.identity.to_metadata(),
            }],
            Role::Subscriber => vec![SessionAction::Subscribe {
                service_name: self.service_name.clone(),
            }],
        }
    }

    pub fn on_attach_failed(&mut self) -> Vec<SessionAction> {
        self.terminate(TerminationReason::AttachFailed)
    }

    /// Provider confirmed publish/subscribe.
    pub fn on_started(&mut self) {
        if self.state == SessionState::Attached {
            self.state = match self.role {
                Role::Publisher => SessionState::Publishing,
                Role::Subscriber => SessionState::Subscribing,
            };
        }
    }

    pub fn on_config_failed(&mut self) -> Vec<SessionAction> {
        let reason = match self.role {
            Role::Publisher => TerminationReason::PublishConfigFailed,
            Role::Subscriber => TerminationReason::SubscribeConfigFailed,
        };
        self.terminate(reason)
    }

    /// Service discovered (or peer info received). The handle is recorded before anything else
    /// is emitted so a control message triggered by this event always finds it.
    pub fn on_peer_discovered(&mut self, peer: PeerId, metadata: &[u8]) -> Vec<SessionAction> {
        if !self.is_active() {
            return vec![];
        }
        let handle = PeerHandle::new(self.id, peer);
        let identity = DeviceIdentity::from_metadata(metadata);
        let mut actions = self.record_peer(handle, identity);
        if self.role == Role::Subscriber {
            actions.push(self.message_action(handle, ControlMessage::RequestDataConnection.to_bytes()));
        }
        actions
    }

    pub fn on_message_received(&mut self, peer: PeerId, bytes: &[u8]) -> Vec<SessionAction> {
        if !self.is_active() {
            return vec![];
        }
        let handle = PeerHandle::new(self.id, peer);
        let mut actions = Vec::new();
        if self.peer != Some(handle) {
            // Publisher learns its peer from the first message; announce it before acting on it.
            actions.extend(self.record_peer(handle, DeviceIdentity::new("")));
        }
        match (ControlMessage::parse(bytes), self.role) {
            (Some(ControlMessage::RequestDataConnection), Role::Publisher) => {
                actions.push(SessionAction::BeginBringUp { peer: handle });
                actions.push(self.message_action(handle, ControlMessage::DataConnectionReady.to_bytes()));
            }
            (Some(ControlMessage::DataConnectionReady), Role::Subscriber) => {
                actions.push(SessionAction::BeginBringUp { peer: handle });
            }
            // Token meant for the other role.
            (Some(_), _) => {}
            (None, _) => actions.push(SessionAction::Notify(SessionNotice::InboundText {
                peer: handle,
                text: String::from_utf8_lossy(bytes).into_owned(),
            })),
        }
        actions
    }

    pub fn on_message_send_result(&mut self, message_id: u32, ok: bool) -> Vec<SessionAction> {
        if ok || self.is_terminated() {
            return vec![];
        }
        vec![SessionAction::Notify(SessionNotice::MessageSendFailed { message_id })]
    }

    /// Provider ended the session on its own.
    pub fn on_terminated(&mut self) -> Vec<SessionAction> {
        self.terminate(TerminationReason::ProviderTerminated)
    }

    /// Explicit stop. No-op once terminated.
    pub fn stop(&mut self) -> Vec<SessionAction> {
        self.terminate(TerminationReason::Stopped)
    }

    /// Reject handles from other sessions.
    pub fn check_peer(&self, peer: &PeerHandle) -> Result<(), SessionError> {
        if !peer.belongs_to(self.id) {
            return Err(SessionError::ForeignPeer {
                peer: *peer,
                session: self.id,
            });
        }
        Ok(())
    }

    /// Send an arbitrary payload to `peer` over the discovery channel.
    pub fn send_message(
        &mut self,
        peer: &PeerHandle,
        payload: Vec<u8>,
    ) -> Result<SessionAction, SessionError> {
        self.check_peer(peer)?;
        if !self.is_active() {
            return Err(SessionError::InvalidState(self.state.clone()));
        }
        Ok(self.message_action(*peer, payload))
    }

    /// Send to the currently recorded peer.
    pub fn send_to_current(&mut self, payload: Vec<u8>) -> Result<SessionAction, SessionError> {
        let peer = self.peer.ok_or(SessionError::NoPeer)?;
        self.send_message(&peer, payload)
    }

    fn record_peer(&mut self, handle: PeerHandle, identity: DeviceIdentity) -> Vec<SessionAction> {
        self.peer = Some(handle);
        self.peer_identity = Some(identity.clone());
        self.state = SessionState::PeerDiscovered;
        vec![SessionAction::Notify(SessionNotice::PeerDiscovered {
            peer: handle,
            identity,
        })]
    }

    fn message_action(&mut self, peer: PeerHandle, payload: Vec<u8>) -> SessionAction {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        SessionAction::SendMessage {
            peer,
            message_id,
            payload,
        }
    }

    fn terminate(&mut self, reason: TerminationReason) -> Vec<SessionAction> {
        if self.is_terminated() {
            return vec![];
        }
        self.state = SessionState::Terminated(reason);
        self.peer = None;
        vec![
            SessionAction::Release,
            SessionAction::Notify(SessionNotice::Terminated(reason)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(role: Role) -> DiscoverySession {
        let mut s = DiscoverySession::new(role, "AwareData", DeviceIdentity::new("Me"));
        s.start().unwrap();
        let actions = s.on_attached();
        assert_eq!(actions.len(), 1);
        s.on_started();
        s
    }

    fn sent_payloads(actions: &[SessionAction]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::SendMessage { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn publisher_advertises_identity() {
        let mut s = DiscoverySession::new(Role::Publisher, "svc", DeviceIdentity::new("DeviceA"));
        s.start().unwrap();
        assert_eq!(s.state(), &SessionState::Attaching);
        let actions = s.on_attached();
        assert_eq!(
            actions,
            vec![SessionAction::Publish {
                service_name: "svc".into(),
                metadata: b"DeviceA".to_vec(),
            }]
        );
        s.on_started();
        assert_eq!(s.state(), &SessionState::Publishing);
    }

    #[test]
    fn subscriber_records_peer_then_requests_connection() {
        let mut s = started(Role::Subscriber);
        assert_eq!(s.state(), &SessionState::Subscribing);
        let actions = s.on_peer_discovered(PeerId(4), b"DeviceA");
        let handle = s.peer().expect("handle recorded");
        assert_eq!(handle.peer(), PeerId(4));
        assert_eq!(s.state(), &SessionState::PeerDiscovered);
        match &actions[0] {
            SessionAction::Notify(SessionNotice::PeerDiscovered { identity, peer }) => {
                assert_eq!(identity.name(), "DeviceA");
                assert_eq!(*peer, handle);
            }
            other => panic!("expected discovery notice first, got {other:?}"),
        }
        assert_eq!(sent_payloads(&actions), vec![b"REQUEST_DATA_CONNECTION".to_vec()]);
    }

    #[test]
    fn publisher_answers_request_with_bring_up_then_ready() {
        let mut s = started(Role::Publisher);
        let actions = s.on_message_received(PeerId(9), b"REQUEST_DATA_CONNECTION");
        assert!(matches!(
            actions[0],
            SessionAction::Notify(SessionNotice::PeerDiscovered { .. })
        ));
        let bring_up = actions
            .iter()
            .position(|a| matches!(a, SessionAction::BeginBringUp { .. }))
            .expect("bring-up");
        let ready = actions
            .iter()
            .position(|a| matches!(a, SessionAction::SendMessage { .. }))
            .expect("ready");
        assert!(bring_up < ready);
        assert_eq!(sent_payloads(&actions), vec![b"DATA_CONNECTION_READY".to_vec()]);
    }

    #[test]
    fn subscriber_brings_up_only_after_ready() {
        let mut s = started(Role::Subscriber);
        let actions = s.on_peer_discovered(PeerId(1), b"DeviceA");
        assert!(!actions
            .iter()
            .any(|a| matches!(a, SessionAction::BeginBringUp { .. })));
        let actions = s.on_message_received(PeerId(1), b"DATA_CONNECTION_READY");
        assert_eq!(
            actions,
            vec![SessionAction::BeginBringUp {
                peer: s.peer().unwrap()
            }]
        );
    }

    #[test]
    fn plain_payload_is_inbound_text() {
        let mut s = started(Role::Publisher);
        s.on_message_received(PeerId(2), b"REQUEST_DATA_CONNECTION");
        let actions = s.on_message_received(PeerId(2), b"hi there");
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            &actions[0],
            SessionAction::Notify(SessionNotice::InboundText { text, .. }) if text == "hi there"
        ));
    }

    #[test]
    fn foreign_handle_rejected() {
        let mut a = started(Role::Subscriber);
        let mut b = started(Role::Subscriber);
        a.on_peer_discovered(PeerId(1), b"X");
        let from_a = a.peer().unwrap();
        let err = b.send_message(&from_a, b"hello".to_vec()).unwrap_err();
        assert!(matches!(err, SessionError::ForeignPeer { .. }));
        assert!(a.send_message(&from_a, b"hello".to_vec()).is_ok());
    }

    #[test]
    fn send_without_peer_fails() {
        let mut s = started(Role::Subscriber);
        assert_eq!(
            s.send_to_current(b"x".to_vec()).unwrap_err(),
            SessionError::NoPeer
        );
    }

    #[test]
    fn message_ids_are_unique_per_session() {
        let mut s = started(Role::Subscriber);
        s.on_peer_discovered(PeerId(1), b"X");
        let ids: Vec<u32> = (0..3)
            .map(|_| match s.send_to_current(b"x".to_vec()).unwrap() {
                SessionAction::SendMessage { message_id, .. } => message_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn send_failure_reported_session_continues() {
        let mut s = started(Role::Subscriber);
        let actions = s.on_message_send_result(42, false);
        assert_eq!(
            actions,
            vec![SessionAction::Notify(SessionNotice::MessageSendFailed {
                message_id: 42
            })]
        );
        assert!(s.on_message_send_result(43, true).is_empty());
        assert!(s.is_active());
    }

    #[test]
    fn attach_failure_is_terminal() {
        let mut s = DiscoverySession::new(Role::Publisher, "svc", DeviceIdentity::new("A"));
        s.start().unwrap();
        let actions = s.on_attach_failed();
        assert_eq!(actions[0], SessionAction::Release);
        assert_eq!(
            s.state(),
            &SessionState::Terminated(TerminationReason::AttachFailed)
        );
        // Absorbing: nothing restarts it.
        assert!(s.start().is_err());
        assert!(s.on_attached().is_empty());
        assert!(s.on_peer_discovered(PeerId(1), b"x").is_empty());
    }

    #[test]
    fn config_failure_reason_follows_role() {
        let mut s = DiscoverySession::new(Role::Subscriber, "svc", DeviceIdentity::new("A"));
        s.start().unwrap();
        s.on_attached();
        s.on_config_failed();
        assert_eq!(
            s.state(),
            &SessionState::Terminated(TerminationReason::SubscribeConfigFailed)
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let mut s = started(Role::Publisher);
        s.on_message_received(PeerId(1), b"hello");
        assert!(!s.stop().is_empty());
        assert!(s.peer().is_none());
        assert!(s.stop().is_empty());
        assert!(s.on_message_received(PeerId(1), b"hello").is_empty());
    }
}
