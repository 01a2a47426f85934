use crate::band::{Direction, Priority};

/// The I/O side of a peer connection, as seen by the scheduler. A [`crate::BandwidthTree`]
/// node holds only a weak reference to one of these; the scheduler upgrades it for the
/// duration of a single `allocate` tick, so a peer being torn down concurrently just drops
/// out of that tick's working set instead of dangling.
pub trait PeerIo: Send + Sync {
    /// Send or receive up to `max_bytes` in `dir`, returning how much was actually used.
    fn flush(&self, dir: Direction, max_bytes: usize) -> usize;

    /// Flush handshake/keepalive/protocol-level messages, ignoring rate limits.
    fn flush_outgoing_protocol_msgs(&self);

    fn set_priority(&self, priority: Priority);
    fn priority(&self) -> Priority;

    fn set_enabled(&self, dir: Direction, enabled: bool);
    fn has_bandwidth_left(&self, dir: Direction) -> bool;
}
