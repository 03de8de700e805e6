//! Device identity, discovery session IDs and session-scoped peer handles.

use serde::{Deserialize, Serialize};

/// Name used when no candidate yields a usable device name.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Display name advertised as service-specific discovery metadata. Computed once per session start.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.trim().is_empty() {
            DeviceIdentity(UNKNOWN_DEVICE.to_string())
        } else {
            DeviceIdentity(name)
        }
    }

    /// First non-blank candidate wins (configured name, device name, model, ...).
    pub fn resolve<I>(candidates: I) -> Self
    where
        I: IntoIterator<Item = Option<String>>,
    {
        candidates
            .into_iter()
            .flatten()
            .find(|c| !c.trim().is_empty())
            .map(DeviceIdentity)
            .unwrap_or_else(|| DeviceIdentity(UNKNOWN_DEVICE.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn to_metadata(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Decode peer metadata. Lossy: discovery metadata is not validated by the provider.
    pub fn from_metadata(bytes: &[u8]) -> Self {
        Self::new(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one discovery session for its whole lifetime.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to tell sessions apart in logs.
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Provider-assigned peer identifier. Only meaningful to the session that received it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Opaque reference to a discovered peer, bound to the session that discovered it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerHandle {
    session: SessionId,
    peer: PeerId,
}

impl PeerHandle {
    pub fn new(session: SessionId, peer: PeerId) -> Self {
        Self { session, peer }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn belongs_to(&self, session: SessionId) -> bool {
        self.session == session
    }
}

impl std::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.peer, self.session)
    }
}
