//! Per-peer state and the server-side peer registry.
//!
//! A peer exists in the registry from its CONNECT handshake until its
//! DISCONNECT (graceful or error-induced); while registered, exactly one
//! state object exists for it. All registry operations take one consistent
//! short lock, and broadcast snapshots are taken under that same lock.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::dispatch::FrameSink;

static NEXT_PEER_KEY: AtomicU64 = AtomicU64::new(1);

/// Opaque transport identifier for a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(u64);

impl PeerKey {
    /// Mint a fresh key. Transports call this once per accepted peer.
    pub fn next() -> Self {
        Self(NEXT_PEER_KEY.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw key value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// What the peer factory contributes to a freshly accepted peer.
#[derive(Default)]
pub struct PeerSeed {
    /// User-extensible payload attached to the peer state.
    pub attachment: Option<Box<dyn Any + Send + Sync>>,
}

/// Factory deciding whether an accepted transport peer becomes a registered
/// peer. Returning `None` rejects the handshake.
pub type PeerFactory = Arc<dyn Fn(PeerKey, Option<SocketAddr>) -> Option<PeerSeed> + Send + Sync>;

/// Accept-everything factory with an empty attachment.
pub fn accept_all_factory() -> PeerFactory {
    Arc::new(|_, _| Some(PeerSeed::default()))
}

/// State for one connected peer.
pub struct Peer {
    key: PeerKey,
    remote_addr: Option<SocketAddr>,
    connected_at: Instant,
    last_received: Mutex<Instant>,
    attachment: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    sink: Arc<dyn FrameSink>,
}

impl Peer {
    pub(crate) fn new(
        key: PeerKey,
        remote_addr: Option<SocketAddr>,
        attachment: Option<Box<dyn Any + Send + Sync>>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            remote_addr,
            connected_at: now,
            last_received: Mutex::new(now),
            attachment: Mutex::new(attachment),
            sink,
        }
    }

    /// The peer's transport key.
    pub fn key(&self) -> PeerKey {
        self.key
    }

    /// Remote address, when the transport knows one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// When this peer was registered.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Monotonic timestamp of the last frame received from this peer.
    pub fn last_received_at(&self) -> Instant {
        *self.last_received.lock()
    }

    pub(crate) fn touch(&self) {
        *self.last_received.lock() = Instant::now();
    }

    /// Replace the user attachment.
    pub fn set_attachment(&self, value: Box<dyn Any + Send + Sync>) {
        *self.attachment.lock() = Some(value);
    }

    /// Run `f` against the attachment, if present and of type `T`.
    pub fn with_attachment<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.attachment.lock();
        slot.as_mut()?.downcast_mut::<T>().map(f)
    }

    pub(crate) fn sink(&self) -> Arc<dyn FrameSink> {
        Arc::clone(&self.sink)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("key", &self.key)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Peer-key → peer-state map guarded by one short lock.
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerKey, Arc<Peer>>>,
}

impl PeerRegistry {
    /// Create a registry with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Insert a peer. Returns false when the key is already present.
    pub(crate) fn insert(&self, peer: Arc<Peer>) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains_key(&peer.key()) {
            return false;
        }
        peers.insert(peer.key(), peer);
        true
    }

    /// Remove a peer. The winner of a concurrent removal race gets the
    /// state back; losers get `None`, which keeps disconnect notification
    /// at-most-once.
    pub(crate) fn remove(&self, key: PeerKey) -> Option<Arc<Peer>> {
        self.peers.lock().remove(&key)
    }

    /// Look a peer up by key.
    pub fn get(&self, key: PeerKey) -> Option<Arc<Peer>> {
        self.peers.lock().get(&key).cloned()
    }

    /// Whether a peer is registered.
    pub fn contains(&self, key: PeerKey) -> bool {
        self.peers.lock().contains_key(&key)
    }

    /// Registered peer count.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Clone the peer list under the lock. Broadcasts iterate the snapshot
    /// outside it so a slow socket cannot block registration.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Remove and return every peer.
    pub(crate) fn drain(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().drain().map(|(_, p)| p).collect()
    }
}

type ConnectedHandler = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;
type DisconnectedHandler = Arc<dyn Fn(&Arc<Peer>, crate::error::DisconnectReason) + Send + Sync>;

/// Ordered subscriber lists for peer lifecycle events. Handlers are
/// snapshotted under the lock and invoked outside it.
#[derive(Default)]
pub struct PeerHooks {
    connected: Mutex<Vec<ConnectedHandler>>,
    disconnected: Mutex<Vec<DisconnectedHandler>>,
}

impl PeerHooks {
    /// Subscribe to peer registration.
    pub fn on_connected(&self, handler: impl Fn(&Arc<Peer>) + Send + Sync + 'static) {
        self.connected.lock().push(Arc::new(handler));
    }

    /// Subscribe to peer removal.
    pub fn on_disconnected(
        &self,
        handler: impl Fn(&Arc<Peer>, crate::error::DisconnectReason) + Send + Sync + 'static,
    ) {
        self.disconnected.lock().push(Arc::new(handler));
    }

    pub(crate) fn notify_connected(&self, peer: &Arc<Peer>) {
        let handlers = self.connected.lock().clone();
        for handler in handlers {
            handler(peer);
        }
    }

    pub(crate) fn notify_disconnected(&self, peer: &Arc<Peer>, reason: crate::error::DisconnectReason) {
        let handlers = self.disconnected.lock().clone();
        for handler in handlers {
            handler(peer, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send_frame(
            &self,
            _command: u16,
            _payload: &[u8],
            _response_id: u32,
        ) -> std::result::Result<(), SendError> {
            Ok(())
        }
    }

    fn peer() -> Arc<Peer> {
        Arc::new(Peer::new(PeerKey::next(), None, None, Arc::new(NullSink)))
    }

    #[test]
    fn keys_are_unique() {
        assert_ne!(PeerKey::next(), PeerKey::next());
    }

    #[test]
    fn insert_is_exclusive_per_key() {
        let registry = PeerRegistry::with_capacity(4);
        let p = peer();
        assert!(registry.insert(Arc::clone(&p)));
        assert!(!registry.insert(Arc::clone(&p)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_at_most_once() {
        let registry = PeerRegistry::with_capacity(4);
        let p = peer();
        let key = p.key();
        registry.insert(p);

        assert!(registry.remove(key).is_some());
        assert!(registry.remove(key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_detached_from_the_map() {
        let registry = PeerRegistry::with_capacity(4);
        let a = peer();
        let b = peer();
        registry.insert(Arc::clone(&a));
        registry.insert(Arc::clone(&b));

        let snap = registry.snapshot();
        registry.remove(a.key());
        assert_eq!(snap.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn touch_advances_last_received() {
        let p = peer();
        let before = p.last_received_at();
        std::thread::sleep(std::time::Duration::from_millis(2));
        p.touch();
        assert!(p.last_received_at() > before);
    }

    #[test]
    fn attachment_roundtrip() {
        let p = peer();
        p.set_attachment(Box::new(41u32));
        let seen = p.with_attachment::<u32, _>(|v| {
            *v += 1;
            *v
        });
        assert_eq!(seen, Some(42));
        // wrong type is a clean miss
        assert_eq!(p.with_attachment::<String, _>(|s| s.clone()), None);
    }

    #[test]
    fn factory_default_accepts() {
        let factory = accept_all_factory();
        assert!(factory(PeerKey::next(), None).is_some());
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        use std::sync::Mutex as StdMutex;

        let hooks = PeerHooks::default();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let order = Arc::clone(&order);
            hooks.on_connected(move |_| order.lock().unwrap().push(tag));
        }

        hooks.notify_connected(&peer());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn disconnect_hook_sees_the_reason() {
        use crate::error::DisconnectReason;
        use std::sync::Mutex as StdMutex;

        let hooks = PeerHooks::default();
        let seen = Arc::new(StdMutex::new(None));
        let seen_clone = Arc::clone(&seen);
        hooks.on_disconnected(move |_, reason| {
            *seen_clone.lock().unwrap() = Some(reason);
        });

        hooks.notify_disconnected(&peer(), DisconnectReason::Error);
        assert_eq!(*seen.lock().unwrap(), Some(DisconnectReason::Error));
    }
}
