//! Ties the bandwidth scheduler, peer bookkeeping, metadata acquisition and
//! global-IP discovery into one periodically-driven runtime, the way `Session` wires
//! together a torrent client's subsystems.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use buffers::ByteBufOwned;
use bt_bandwidth::{BandwidthTree, NodeId};
use bt_core::torrent_metainfo::TorrentMetaV1;
use bt_core::Id20;
use bt_global_ip::GlobalIpCache;
use bt_metadata::{IdleTickOutcome, MetadataAssembler};
use bt_peer_info::{FoundFrom, PeerInfo};
use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn, Instrument};

pub use bt_bandwidth;
pub use bt_global_ip;
pub use bt_metadata;
pub use bt_peer_info;

/// How often the bandwidth tree is drained. The teacher's own tracker/DHT loops run
/// on a similar cadence; a tighter interval buys fairness at the cost of more wakeups.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

struct TorrentMetadataState {
    assembler: MetadataAssembler,
    base: TorrentMetaV1<ByteBufOwned>,
}

struct Inner {
    bandwidth: Mutex<BandwidthTree>,
    root: NodeId,
    peers: Mutex<HashMap<SocketAddr, PeerInfo>>,
    metadata: Mutex<HashMap<Id20, TorrentMetadataState>>,
    global_ip: Arc<GlobalIpCache>,
}

/// The runtime's single entry point. Cheaply cloneable (an `Arc` around its state);
/// the background tick loop holds its own clone and is torn down via `DropGuard` when
/// the last handle goes away.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
    _cancel_guard: Arc<DropGuard>,
}

impl Runtime {
    pub fn new(global_ip: Arc<GlobalIpCache>) -> Self {
        let mut bandwidth = BandwidthTree::new();
        let root = bandwidth.insert();

        let inner = Arc::new(Inner {
            bandwidth: Mutex::new(bandwidth),
            root,
            peers: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            global_ip,
        });

        let cancel = CancellationToken::new();
        spawn_tick_loop(inner.clone(), cancel.clone(), DEFAULT_TICK_INTERVAL);

        Self {
            inner,
            _cancel_guard: Arc::new(cancel.drop_guard()),
        }
    }

    /// Bandwidth-tree node serving as the root of the allocation tree; new per-torrent
    /// or per-peer nodes should be parented under this (or a descendant of it).
    pub fn bandwidth_root(&self) -> NodeId {
        self.inner.root
    }

    pub fn with_bandwidth<R>(&self, f: impl FnOnce(&mut BandwidthTree) -> R) -> R {
        f(&mut self.inner.bandwidth.lock())
    }

    /// Runs one scheduler tick: refills budgets from `desired_bps` and drains the
    /// live peer set in the two-phase order described for `BandwidthNode::allocate`.
    pub fn tick(&self, period_ms: u64) {
        self.inner.bandwidth.lock().allocate(self.inner.root, period_ms);
    }

    pub fn register_peer(&self, addr: SocketAddr, from: FoundFrom, pex_flags: u8) {
        self.inner
            .peers
            .lock()
            .entry(addr)
            .and_modify(|p| p.found_at(from))
            .or_insert_with(|| PeerInfo::new(addr, from, pex_flags));
    }

    pub fn unregister_peer(&self, addr: &SocketAddr) {
        self.inner.peers.lock().remove(addr);
    }

    pub fn with_peer<R>(&self, addr: &SocketAddr, f: impl FnOnce(&mut PeerInfo) -> R) -> Option<R> {
        self.inner.peers.lock().get_mut(addr).map(f)
    }

    pub fn known_peer_count(&self) -> usize {
        bt_peer_info::known_peer_count()
    }

    /// Begin incrementally reconstructing `info_hash`'s info dict. `base` carries the
    /// surrounding fields (trackers, comment, ...) already known from the magnet link.
    pub fn start_metadata_acquisition(
        &self,
        info_hash: Id20,
        total_size: u32,
        base: TorrentMetaV1<ByteBufOwned>,
    ) -> Result<(), bt_metadata::InitError> {
        let assembler = MetadataAssembler::init(info_hash, total_size)?;
        self.inner
            .metadata
            .lock()
            .insert(info_hash, TorrentMetadataState { assembler, base });
        Ok(())
    }

    pub fn accept_metadata_piece(&self, info_hash: &Id20, piece: u32, data: &[u8]) {
        if let Some(state) = self.inner.metadata.lock().get_mut(info_hash) {
            state.assembler.accept_piece(piece, data);
        }
    }

    pub fn metadata_next_request(&self, info_hash: &Id20, now: u64) -> Option<u32> {
        self.inner
            .metadata
            .lock()
            .get_mut(info_hash)
            .and_then(|state| state.assembler.next_request(now))
    }

    pub fn metadata_progress(&self, info_hash: &Id20) -> f64 {
        self.inner
            .metadata
            .lock()
            .get(info_hash)
            .map(|state| state.assembler.progress())
            .unwrap_or(1.0)
    }

    /// Advances one in-progress metadata acquisition. Returns the synthesized
    /// metainfo and tears the assembler down on success; leaves it running and resets
    /// `pieces_needed` on a validation failure.
    pub fn metadata_idle_tick(&self, info_hash: &Id20) -> Option<TorrentMetaV1<ByteBufOwned>> {
        let mut metadata = self.inner.metadata.lock();
        let state = metadata.get_mut(info_hash)?;
        match state.assembler.idle_tick(&state.base) {
            IdleTickOutcome::Complete(meta) => {
                metadata.remove(info_hash);
                Some(meta)
            }
            IdleTickOutcome::Pending => None,
            IdleTickOutcome::Redownload => {
                warn!(info_hash = %info_hash.as_string(), "metadata validation failed, redownloading");
                None
            }
        }
    }

    pub fn global_ip(&self) -> &Arc<GlobalIpCache> {
        &self.inner.global_ip
    }
}

fn spawn_tick_loop(inner: Arc<Inner>, cancel: CancellationToken, interval: Duration) {
    let span = tracing::info_span!("bandwidth_tick_loop");
    tokio::task::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            let period_ms = interval.as_millis() as u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("tick loop cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        inner.bandwidth.lock().allocate(inner.root, period_ms);
                    }
                }
            }
        }
        .instrument(span),
    );
    info!("bandwidth tick loop started");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_global_ip::{FetchResponse, HttpFetcher, TokioTimerMaker};

    struct NeverFetcher;
    impl HttpFetcher for NeverFetcher {
        fn fetch(
            &self,
            _url: &str,
            _family: bt_global_ip::Family,
            _sndbuf: usize,
            _rcvbuf: usize,
            _on_response: Box<dyn FnOnce(FetchResponse) + Send>,
        ) {
        }
    }

    fn make_runtime() -> Runtime {
        let timer_maker = TokioTimerMaker;
        let global_ip = GlobalIpCache::new(&timer_maker, Arc::new(NeverFetcher), Arc::new(|_| None));
        Runtime::new(global_ip)
    }

    #[tokio::test]
    async fn registers_and_unregisters_peers() {
        let rt = make_runtime();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        rt.register_peer(addr, FoundFrom::Tracker, 0);
        assert!(rt.with_peer(&addr, |_| ()).is_some());
        rt.unregister_peer(&addr);
        assert!(rt.with_peer(&addr, |_| ()).is_none());
    }

    #[tokio::test]
    async fn tick_does_not_panic_on_an_empty_tree() {
        let rt = make_runtime();
        rt.tick(1000);
    }

    #[tokio::test]
    async fn metadata_acquisition_completes_when_fully_delivered() {
        let rt = make_runtime();
        let info = bt_core::torrent_metainfo::TorrentMetaV1Info {
            name: Some(ByteBufOwned::from(b"f.bin".to_vec())),
            pieces: ByteBufOwned::from(vec![0u8; 20]),
            piece_length: 16384,
            length: Some(10),
            md5sum: None,
            files: None,
        };
        let mut encoded = Vec::new();
        bencode::bencode_serialize_to_writer(&info, &mut encoded).unwrap();

        let mut hasher = <sha1w::Sha1 as sha1w::ISha1>::new();
        sha1w::ISha1::update(&mut hasher, &encoded);
        let info_hash = Id20::new(sha1w::ISha1::finish(hasher));

        let base = TorrentMetaV1 {
            announce: None,
            announce_list: vec![],
            info: info.clone(),
            comment: None,
            created_by: None,
            encoding: None,
            publisher: None,
            publisher_url: None,
            creation_date: None,
            source: None,
            url_list: vec![],
            info_hash,
        };

        rt.start_metadata_acquisition(info_hash, encoded.len() as u32, base)
            .unwrap();
        rt.accept_metadata_piece(&info_hash, 0, &encoded);
        assert_eq!(rt.metadata_progress(&info_hash), 1.0);

        let completed = rt.metadata_idle_tick(&info_hash).expect("should complete");
        assert_eq!(completed.info.length, Some(10));
    }
}
