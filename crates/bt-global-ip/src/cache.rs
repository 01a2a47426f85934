use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};

use crate::address::{is_global_unicast, Family};
use crate::fetcher::{FetchResponse, HttpFetcher};
use crate::timer::{Timer, TimerMaker};

const UPKEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RETRY_UPKEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Only ever one real instance runs per process; this purely guards fetch callbacks
/// that may fire after the owning cache has already been dropped.
static CACHE_EXISTS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdatingState {
    No,
    Yes,
    Abort,
}

struct FamilyState {
    source_addr: Mutex<Option<IpAddr>>,
    global_addr: Mutex<Option<IpAddr>>,
    has_protocol: AtomicBool,
    updating: Mutex<UpdatingState>,
    updating_cv: Condvar,
    service_index: AtomicUsize,
    timer: Mutex<Box<dyn Timer>>,
}

fn idx(family: Family) -> usize {
    match family {
        Family::V4 => 0,
        Family::V6 => 1,
    }
}

/// Per-family (v4, v6) discovery of this host's source address (via a connected UDP
/// probe) and global address (via an HTTP IP-query service), refreshed on an
/// independent timer per family.
pub struct GlobalIpCache {
    states: [FamilyState; 2],
    fetcher: Arc<dyn HttpFetcher>,
    bind_addr: Arc<dyn Fn(Family) -> Option<IpAddr> + Send + Sync>,
}

impl GlobalIpCache {
    pub fn new(
        timer_maker: &dyn TimerMaker,
        fetcher: Arc<dyn HttpFetcher>,
        bind_addr: Arc<dyn Fn(Family) -> Option<IpAddr> + Send + Sync>,
    ) -> Arc<Self> {
        CACHE_EXISTS.fetch_add(1, Ordering::SeqCst);
        Arc::new_cyclic(|weak: &Weak<GlobalIpCache>| {
            let states = Family::ALL.map(|family| {
                let mut timer = timer_maker.create();
                let weak_for_cb = weak.clone();
                timer.set_callback(Arc::new(move || {
                    if let Some(cache) = weak_for_cb.upgrade() {
                        cache.update_addr(family);
                    }
                }));
                timer.set_interval(UPKEEP_INTERVAL);
                FamilyState {
                    source_addr: Mutex::new(None),
                    global_addr: Mutex::new(None),
                    has_protocol: AtomicBool::new(true),
                    updating: Mutex::new(UpdatingState::No),
                    updating_cv: Condvar::new(),
                    service_index: AtomicUsize::new(0),
                    timer: Mutex::new(timer),
                }
            });
            Self {
                states,
                fetcher,
                bind_addr,
            }
        })
    }

    pub fn source_addr(&self, family: Family) -> Option<IpAddr> {
        *self.states[idx(family)].source_addr.lock()
    }

    pub fn global_addr(&self, family: Family) -> Option<IpAddr> {
        *self.states[idx(family)].global_addr.lock()
    }

    /// Stops both timers and marks both families `Abort`. Returns `false` (and leaves
    /// whichever families were busy alone) if an update is currently in flight; the
    /// caller is expected to retry.
    pub fn try_shutdown(&self) -> bool {
        for family in Family::ALL {
            self.states[idx(family)].timer.lock().stop();
        }

        for family in Family::ALL {
            let state = &self.states[idx(family)];
            let Some(mut guard) = state.updating.try_lock() else {
                return false;
            };
            if *guard == UpdatingState::Yes {
                return false;
            }
            *guard = UpdatingState::Abort;
        }
        true
    }

    fn set_is_updating(&self, family: Family) -> bool {
        let state = &self.states[idx(family)];
        let mut guard = state.updating.lock();
        while *guard != UpdatingState::No && *guard != UpdatingState::Abort {
            state.updating_cv.wait(&mut guard);
        }
        if *guard != UpdatingState::No {
            return false;
        }
        *guard = UpdatingState::Yes;
        true
    }

    fn unset_is_updating(&self, family: Family) {
        let state = &self.states[idx(family)];
        let mut guard = state.updating.lock();
        debug_assert_eq!(*guard, UpdatingState::Yes);
        *guard = UpdatingState::No;
        drop(guard);
        state.updating_cv.notify_one();
    }

    fn set_source_addr(&self, family: Family, addr: IpAddr) {
        *self.states[idx(family)].source_addr.lock() = Some(addr);
        trace!(family = family.as_str(), %addr, "cached source address");
    }

    fn set_global_addr(&self, family: Family, addr: IpAddr) -> bool {
        if Family::of(addr) != family || !is_global_unicast(addr) {
            return false;
        }
        *self.states[idx(family)].global_addr.lock() = Some(addr);
        trace!(family = family.as_str(), %addr, "cached global address");
        true
    }

    fn unset_global_addr(&self, family: Family) {
        self.states[idx(family)].global_addr.lock().take();
        trace!(family = family.as_str(), "unset global address cache");
    }

    fn unset_addr(&self, family: Family) {
        self.states[idx(family)].source_addr.lock().take();
        trace!(family = family.as_str(), "unset source address cache");
        self.unset_global_addr(family);
    }

    fn set_timer_interval(&self, family: Family, interval: Duration) {
        self.states[idx(family)].timer.lock().set_interval(interval);
    }

    fn stop_timer(&self, family: Family) {
        self.states[idx(family)].timer.lock().stop();
    }

    fn has_protocol(&self, family: Family) -> bool {
        self.states[idx(family)].has_protocol.load(Ordering::SeqCst)
    }

    fn update_addr(self: &Arc<Self>, family: Family) {
        self.update_source_addr(family);
        if self.has_protocol(family) {
            self.update_global_addr(family);
        }
    }

    fn update_source_addr(self: &Arc<Self>, family: Family) {
        if !self.set_is_updating(family) {
            return;
        }

        let bind_ip = (self.bind_addr)(family).unwrap_or_else(|| family.any_addr());
        match probe_source_address(family, bind_ip) {
            Ok(addr) => {
                self.set_source_addr(family, addr);
                info!(family = family.as_str(), %addr, "updated source address");
            }
            Err(err) => {
                self.unset_addr(family);
                self.set_timer_interval(family, RETRY_UPKEEP_INTERVAL);
                debug!(family = family.as_str(), error = %err, "couldn't obtain source address");
                if is_eafnosupport(&err) {
                    self.stop_timer(family);
                    self.states[idx(family)]
                        .has_protocol
                        .store(false, Ordering::SeqCst);
                    info!(family = family.as_str(), "this machine does not support this protocol");
                }
            }
        }

        self.unset_is_updating(family);
    }

    fn update_global_addr(self: &Arc<Self>, family: Family) {
        let state = &self.states[idx(family)];
        if state.service_index.load(Ordering::SeqCst) == 0 && !self.set_is_updating(family) {
            return;
        }

        let url = family.ip_query_url();
        let weak = Arc::downgrade(self);
        self.fetcher.fetch(
            url,
            family,
            4096,
            4096,
            Box::new(move |response| {
                if CACHE_EXISTS.load(Ordering::SeqCst) == 0 {
                    return;
                }
                if let Some(cache) = weak.upgrade() {
                    cache.on_response_ip_query(family, response);
                }
            }),
        );
    }

    fn on_response_ip_query(self: &Arc<Self>, family: Family, response: FetchResponse) {
        let state = &self.states[idx(family)];
        let mut success = false;

        if response.status == 200 {
            if let Ok(addr) = response.body.trim().parse::<IpAddr>() {
                if self.set_global_addr(family, addr) {
                    success = true;
                    self.set_timer_interval(family, UPKEEP_INTERVAL);
                    info!(family = family.as_str(), %addr, "updated global address");
                }
            }
        }

        if !success {
            let next = state.service_index.fetch_add(1, Ordering::SeqCst) + 1;
            // we only ever have one query service per family; this branch exists so
            // a second one can be dropped in without touching the state machine.
            if next < 1 {
                self.update_global_addr(family);
                return;
            }

            debug!(family = family.as_str(), "couldn't obtain global address");
            self.unset_global_addr(family);
            self.set_timer_interval(family, RETRY_UPKEEP_INTERVAL);
        }

        state.service_index.store(0, Ordering::SeqCst);
        self.unset_is_updating(family);
    }
}

impl Drop for GlobalIpCache {
    fn drop(&mut self) {
        for family in Family::ALL {
            let guard = self.states[idx(family)].updating.lock();
            if *guard != UpdatingState::Abort {
                debug!("destructed while some global IP queries were pending");
            }
        }
        CACHE_EXISTS.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connects a UDP socket to a well-known global-unicast destination without sending
/// anything, purely so the OS picks (and we can read back via `getsockname`) the
/// source address it would use for real traffic of this family.
fn probe_source_address(family: Family, bind_ip: IpAddr) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
    socket.connect(family.probe_destination())?;
    Ok(socket.local_addr()?.ip())
}

fn is_eafnosupport(err: &std::io::Error) -> bool {
    #[cfg(target_os = "linux")]
    {
        err.raw_os_error() == Some(97) // EAFNOSUPPORT
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = err;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    struct MockTimerShared {
        interval: Mutex<Duration>,
        stopped: StdAtomicBool,
    }

    struct MockTimer {
        shared: Arc<MockTimerShared>,
    }

    impl Timer for MockTimer {
        fn set_callback(&mut self, _cb: Arc<dyn Fn() + Send + Sync>) {}
        fn set_interval(&mut self, interval: Duration) {
            *self.shared.interval.lock() = interval;
        }
        fn stop(&mut self) {
            self.shared.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct MockTimerMaker {
        created: Mutex<Vec<Arc<MockTimerShared>>>,
    }

    impl MockTimerMaker {
        fn new() -> Self {
            Self {
                created: Mutex::new(Vec::new()),
            }
        }
    }

    impl TimerMaker for MockTimerMaker {
        fn create(&self) -> Box<dyn Timer> {
            let shared = Arc::new(MockTimerShared {
                interval: Mutex::new(Duration::ZERO),
                stopped: StdAtomicBool::new(false),
            });
            self.created.lock().push(shared.clone());
            Box::new(MockTimer { shared })
        }
    }

    struct MockFetcher {
        pending: Mutex<Option<Box<dyn FnOnce(FetchResponse) + Send>>>,
    }

    impl MockFetcher {
        fn new() -> Self {
            Self {
                pending: Mutex::new(None),
            }
        }

        fn resolve(&self, response: FetchResponse) {
            let cb = self.pending.lock().take().expect("no fetch in flight");
            cb(response);
        }
    }

    impl HttpFetcher for MockFetcher {
        fn fetch(
            &self,
            _url: &str,
            _family: Family,
            _sndbuf: usize,
            _rcvbuf: usize,
            on_response: Box<dyn FnOnce(FetchResponse) + Send>,
        ) {
            *self.pending.lock() = Some(on_response);
        }
    }

    fn no_bind_addr() -> Arc<dyn Fn(Family) -> Option<IpAddr> + Send + Sync> {
        Arc::new(|_| None)
    }

    #[test]
    fn new_cache_has_no_addresses_cached() {
        let timer_maker = MockTimerMaker::new();
        let fetcher = Arc::new(MockFetcher::new());
        let cache = GlobalIpCache::new(&timer_maker, fetcher, no_bind_addr());

        for family in Family::ALL {
            assert_eq!(cache.source_addr(family), None);
            assert_eq!(cache.global_addr(family), None);
        }
    }

    #[test]
    fn successful_global_update_resets_interval_to_upkeep() {
        let timer_maker = MockTimerMaker::new();
        let fetcher = Arc::new(MockFetcher::new());
        let cache = GlobalIpCache::new(&timer_maker, fetcher.clone(), no_bind_addr());

        cache.update_global_addr(Family::V4);
        fetcher.resolve(FetchResponse {
            status: 200,
            body: "8.8.8.8\n".to_string(),
        });

        assert_eq!(
            cache.global_addr(Family::V4),
            Some("8.8.8.8".parse().unwrap())
        );
        let v4_timer = timer_maker.created.lock()[0].clone();
        assert_eq!(*v4_timer.interval.lock(), UPKEEP_INTERVAL);
    }

    #[test]
    fn failed_global_update_sets_retry_interval_and_clears_cache() {
        let timer_maker = MockTimerMaker::new();
        let fetcher = Arc::new(MockFetcher::new());
        let cache = GlobalIpCache::new(&timer_maker, fetcher.clone(), no_bind_addr());

        cache.update_global_addr(Family::V6);
        fetcher.resolve(FetchResponse {
            status: 503,
            body: String::new(),
        });

        assert_eq!(cache.global_addr(Family::V6), None);
        let v6_timer = timer_maker.created.lock()[1].clone();
        assert_eq!(*v6_timer.interval.lock(), RETRY_UPKEEP_INTERVAL);
    }

    #[test]
    fn try_shutdown_fails_while_update_in_flight_then_succeeds() {
        let timer_maker = MockTimerMaker::new();
        let fetcher = Arc::new(MockFetcher::new());
        let cache = GlobalIpCache::new(&timer_maker, fetcher.clone(), no_bind_addr());

        cache.update_global_addr(Family::V4);
        assert!(!cache.try_shutdown());

        fetcher.resolve(FetchResponse {
            status: 200,
            body: "1.2.3.4".to_string(),
        });
        assert!(cache.try_shutdown());
    }

    #[test]
    fn callback_after_cache_dropped_is_a_noop() {
        let timer_maker = MockTimerMaker::new();
        let fetcher = Arc::new(MockFetcher::new());
        let cache = GlobalIpCache::new(&timer_maker, fetcher.clone(), no_bind_addr());

        cache.update_global_addr(Family::V4);
        drop(cache);

        // must not panic: the callback's Weak upgrade fails silently.
        fetcher.resolve(FetchResponse {
            status: 200,
            body: "1.2.3.4".to_string(),
        });
    }

    #[test]
    fn rejects_non_global_addresses_from_the_query_service() {
        let timer_maker = MockTimerMaker::new();
        let fetcher = Arc::new(MockFetcher::new());
        let cache = GlobalIpCache::new(&timer_maker, fetcher.clone(), no_bind_addr());

        cache.update_global_addr(Family::V4);
        fetcher.resolve(FetchResponse {
            status: 200,
            body: "10.0.0.1".to_string(),
        });

        assert_eq!(cache.global_addr(Family::V4), None);
    }
}
