use std::net::SocketAddr;

use crate::flags::{ADDED_F_CONNECTABLE, ADDED_F_SEED, ADDED_F_UTP};
use crate::registry;
use crate::tri_state::TriState;

/// The minimum we'll wait before attempting to reconnect to a peer.
const MINIMUM_RECONNECT_INTERVAL_SECS: u64 = 5;

/// Where a peer address was learned from. Lower values are more trustworthy; when a
/// peer is rediscovered via a second source, [`PeerInfo::found_at`] keeps the best one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FoundFrom {
    Incoming = 0,
    Tracker = 1,
    Resume = 2,
    Pex = 3,
    Dht = 4,
    Lpd = 5,
}

/// Stable per-address peer state, kept across (re)connections: discovery provenance,
/// reachability, failure counts, and the reconnect back-off derived from them.
///
/// Never moved once created (the address is the identity); destroyed when the owning
/// torrent drops it.
#[derive(Debug)]
pub struct PeerInfo {
    socket_address: SocketAddr,
    from_first: FoundFrom,
    from_best: FoundFrom,
    pex_flags: u8,
    is_seed: bool,
    is_connectable: TriState,
    supports_utp: TriState,
    is_banned: bool,
    is_connected: bool,
    blocklisted_cache: TriState,
    connection_attempted_at: u64,
    connection_changed_at: u64,
    piece_data_at: u64,
    num_consecutive_fails: u8,
}

impl PeerInfo {
    pub fn new(socket_address: SocketAddr, from: FoundFrom, pex_flags: u8) -> Self {
        registry::increment();
        let mut info = Self {
            socket_address,
            from_first: from,
            from_best: from,
            pex_flags: 0,
            is_seed: false,
            is_connectable: None,
            supports_utp: None,
            is_banned: false,
            is_connected: false,
            blocklisted_cache: None,
            connection_attempted_at: 0,
            connection_changed_at: 0,
            piece_data_at: 0,
            num_consecutive_fails: 0,
        };
        info.set_pex_flags(pex_flags);
        info
    }

    pub fn socket_address(&self) -> SocketAddr {
        self.socket_address
    }

    pub fn from_first(&self) -> FoundFrom {
        self.from_first
    }

    pub fn from_best(&self) -> FoundFrom {
        self.from_best
    }

    /// Record a (re)discovery of this peer from `from`, keeping the most trustworthy
    /// provenance seen so far.
    pub fn found_at(&mut self, from: FoundFrom) {
        self.from_best = self.from_best.min(from);
    }

    pub fn is_banned(&self) -> bool {
        self.is_banned
    }

    pub fn ban(&mut self) {
        self.is_banned = true;
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn is_seed(&self) -> bool {
        self.is_seed
    }

    pub fn blocklisted_cache(&self) -> TriState {
        self.blocklisted_cache
    }

    pub fn set_blocklisted_cache(&mut self, value: TriState) {
        self.blocklisted_cache = value;
    }

    pub fn note_piece_data(&mut self, now: u64) {
        self.piece_data_at = now;
    }

    pub fn note_connection_attempt(&mut self, now: u64) {
        self.connection_attempted_at = now;
    }

    pub fn set_connected(&mut self, now: u64, connected: bool) {
        if connected {
            self.num_consecutive_fails = 0;
            self.piece_data_at = 0;
        }
        self.is_connected = connected;
        self.connection_changed_at = now;
    }

    pub fn on_connection_failed(&mut self) {
        self.num_consecutive_fails = self.num_consecutive_fails.saturating_add(1);
    }

    pub fn connection_failure_count(&self) -> u8 {
        self.num_consecutive_fails
    }

    fn step(&self) -> u8 {
        let unreachable = matches!(self.is_connectable, Some(false));
        let mut step = self.num_consecutive_fails;
        if unreachable {
            step = step.saturating_add(2);
        }
        step
    }

    /// Seconds to wait before the next reconnect attempt is allowed.
    pub fn reconnect_interval_secs(&self, now: u64) -> u64 {
        let unreachable = matches!(self.is_connectable, Some(false));
        if !unreachable
            && now.saturating_sub(self.piece_data_at) <= MINIMUM_RECONNECT_INTERVAL_SECS * 2
        {
            return MINIMUM_RECONNECT_INTERVAL_SECS;
        }

        match self.step() {
            0 => 0,
            1 => 10,
            2 => 60 * 2,
            3 => 60 * 15,
            4 => 60 * 30,
            5 => 60 * 60,
            _ => 60 * 120,
        }
    }

    pub fn reconnect_interval_has_passed(&self, now: u64) -> bool {
        let last = self.connection_attempted_at.max(self.connection_changed_at);
        now.saturating_sub(last) >= self.reconnect_interval_secs(now)
    }

    /// Apply a freshly-received `added.f` byte: SEED is taken as authoritative,
    /// CONNECTABLE/UTP become *definite* true (never demoted back to unknown).
    pub fn set_pex_flags(&mut self, pex_flags: u8) {
        self.pex_flags = pex_flags;

        if pex_flags & ADDED_F_CONNECTABLE != 0 {
            self.is_connectable = Some(true);
        }
        if pex_flags & ADDED_F_UTP != 0 {
            self.supports_utp = Some(true);
        }
        self.is_seed = pex_flags & ADDED_F_SEED != 0;
    }

    pub fn is_connectable(&self) -> TriState {
        self.is_connectable
    }

    pub fn set_is_connectable(&mut self, value: TriState) {
        self.is_connectable = value;
    }

    pub fn supports_utp(&self) -> TriState {
        self.supports_utp
    }

    pub fn set_supports_utp(&mut self, value: TriState) {
        self.supports_utp = value;
    }

    /// `added.f` byte-out: base flags OR-ed with the live SEED bit, plus CONNECTABLE/UTP
    /// forced to match the tri-state when it's definite (cleared, not just left unset,
    /// when definitely false).
    pub fn pex_flags(&self) -> u8 {
        let mut ret = self.pex_flags;

        if let Some(connectable) = self.is_connectable {
            if connectable {
                ret |= ADDED_F_CONNECTABLE;
            } else {
                ret &= !ADDED_F_CONNECTABLE;
            }
        }

        if let Some(utp) = self.supports_utp {
            if utp {
                ret |= ADDED_F_UTP;
            } else {
                ret &= !ADDED_F_UTP;
            }
        }

        if self.is_seed {
            ret |= ADDED_F_SEED;
        }

        ret
    }
}

impl Drop for PeerInfo {
    fn drop(&mut self) {
        registry::decrement();
    }
}
