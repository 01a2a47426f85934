use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide count of live [`crate::PeerInfo`] instances.
///
/// This is a deliberate carry-over of an upstream anti-pattern: a global counter that
/// every `PeerInfo` reaches into on construction/destruction. A dependency-injected
/// registry handle would be preferable in new code, but the upstream design threads a
/// bare global through the whole peer-manager, so we preserve it rather than silently
/// changing observable behavior (`known_peer_count()` would otherwise need a handle
/// plumbed through every caller).
static N_KNOWN_PEERS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn increment() {
    N_KNOWN_PEERS.fetch_add(1, Ordering::AcqRel);
}

pub(crate) fn decrement() {
    let prev = N_KNOWN_PEERS.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "n_known_peers underflow");
}

/// Number of `PeerInfo` instances currently alive in this process.
pub fn known_peer_count() -> usize {
    N_KNOWN_PEERS.load(Ordering::Acquire)
}
