//! Filepath: src/epoch.rs
//!
//! Epoch-based deferred reclamation.
//!
//! Threads [`join`](Reclaimer::join) the current epoch while they touch shared
//! memory. Objects unlinked from shared structures are
//! [`retire`](Reclaimer::retire)d into the current epoch. A background ticker
//! periodically reclaims the oldest epochs nobody is active in, then opens a
//! new epoch.
//!
//! # Invariants
//! - The current epoch is never reclaimed.
//! - Epochs are reclaimed strictly in creation order, and never while a guard
//!   is active in them.
//! - `join` never blocks. A joiner announces itself in `joining`, increments
//!   the loaded epoch's `active` count, and re-checks that the epoch is still
//!   current, undoing and retrying if not. `perform_gc` reclaims nothing while
//!   a join is in flight, so a joiner never registers on an epoch that is
//!   already being reclaimed.
//! - Retiring joins first, so the object lands in an epoch that was current
//!   after the object was unlinked.
//!
//! ```rust
//! use olckv::epoch::EpochManager;
//!
//! let manager = EpochManager::manual();
//! let reclaimer = manager.reclaimer();
//!
//! let guard = reclaimer.join();
//! // SAFETY: freshly leaked and never shared.
//! unsafe { reclaimer.retire_boxed(Box::into_raw(Box::new(7_u64))) };
//! drop(guard);
//!
//! manager.tick();
//! manager.tick();
//! assert_eq!(manager.stats().reclaimed, 1);
//! ```

use std::collections::VecDeque;
use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, EPOCH_ORD, READ_ORD, RELAXED, UNLOCK_ORD};
use crate::tracing_helpers::{debug_log, error_log, trace_log};

pub(crate) mod reclaim;

// ============================================================================
//  Garbage List
// ============================================================================

/// Destructor for a retired object.
pub type ReclaimFn = unsafe fn(*mut u8);

/// One retired object, linked into its epoch's list.
struct Garbage {
    ptr: *mut u8,
    reclaim: ReclaimFn,
    next: *mut Garbage,
}

/// Run the destructors of a detached garbage list. Returns how many ran.
///
/// # Safety
/// The list must be detached from its epoch and no thread may still read
/// the retired objects.
unsafe fn free_list(mut head: *mut Garbage) -> usize {
    let mut freed: usize = 0;

    while !head.is_null() {
        // SAFETY: every node was leaked from a Box in `retire`, and the
        // caller owns the detached list.
        let node: Box<Garbage> = unsafe { Box::from_raw(head) };
        // SAFETY: the retirer paired `ptr` with a matching destructor.
        unsafe { (node.reclaim)(node.ptr) };
        head = node.next;
        freed += 1;
    }

    freed
}

// ============================================================================
//  Epoch
// ============================================================================

/// One epoch: an active-guard count and the objects retired during it.
struct Epoch {
    id: u64,
    active: AtomicUsize,
    garbage: AtomicPtr<Garbage>,

    // Keeps newer epochs alive while this one is, so their garbage can never
    // be freed ahead of an older guard.
    successor: OnceLock<Arc<Epoch>>,
}

impl Epoch {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            active: AtomicUsize::new(0),
            garbage: AtomicPtr::new(StdPtr::null_mut()),
            successor: OnceLock::new(),
        })
    }

    fn push(&self, node: *mut Garbage) {
        let mut head: *mut Garbage = self.garbage.load(READ_ORD);

        loop {
            // SAFETY: `node` is not yet published.
            unsafe { (*node).next = head };

            match self
                .garbage
                .compare_exchange_weak(head, node, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn take_garbage(&self) -> *mut Garbage {
        self.garbage.swap(StdPtr::null_mut(), CAS_SUCCESS)
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // Only reached once every guard of this epoch and of all older epochs
        // is gone.
        // SAFETY: exclusive access, nobody can reach the retired objects.
        unsafe { free_list(self.take_garbage()) };

        // Unroll the successor chain so a long chain cannot overflow the stack.
        let mut next: Option<Arc<Self>> = self.successor.take();
        while let Some(epoch) = next {
            next = match Arc::try_unwrap(epoch) {
                Ok(mut epoch) => epoch.successor.take(),
                Err(_) => None,
            };
        }
    }
}

// ============================================================================
//  EpochGuard
// ============================================================================

/// Membership in one epoch. Retired objects stay alive while it exists.
///
/// The guard decrements exactly the epoch it joined, even if the global
/// epoch has moved on since.
#[must_use = "dropping the guard immediately leaves the epoch"]
pub struct EpochGuard {
    epoch: Arc<Epoch>,
}

impl EpochGuard {
    /// Id of the joined epoch.
    #[must_use]
    pub fn epoch_id(&self) -> u64 {
        self.epoch.id
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.epoch.active.fetch_sub(1, UNLOCK_ORD);
    }
}

impl StdFmt::Debug for EpochGuard {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("EpochGuard")
            .field("epoch", &self.epoch.id)
            .finish()
    }
}

// ============================================================================
//  Shared State
// ============================================================================

/// Counters reported by [`EpochManager::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochStats {
    /// Objects whose destructor ran.
    pub reclaimed: u64,

    /// Epochs created since start, including the first.
    pub epochs_created: u64,

    /// Epochs not yet reclaimed, including the current one.
    pub live_epochs: usize,

    /// Objects retired but not yet reclaimed.
    pub pending: u64,
}

struct EpochState {
    // Owns one strong count (`Arc::into_raw`). The same epoch is also the
    // back of `epochs`.
    current: AtomicPtr<Epoch>,
    joining: AtomicUsize,
    epochs: Mutex<VecDeque<Arc<Epoch>>>,
    next_id: AtomicU64,
    reclaimed: AtomicU64,
    retired: AtomicU64,

    stop: Mutex<bool>,
    stop_signal: Condvar,
}

impl EpochState {
    fn new() -> Self {
        let first: Arc<Epoch> = Epoch::new(0);

        Self {
            current: AtomicPtr::new(Arc::into_raw(Arc::clone(&first)).cast_mut()),
            joining: AtomicUsize::new(0),
            epochs: Mutex::new(VecDeque::from([first])),
            next_id: AtomicU64::new(1),
            reclaimed: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            stop: Mutex::new(false),
            stop_signal: Condvar::new(),
        }
    }

    fn join(&self) -> EpochGuard {
        self.joining.fetch_add(1, EPOCH_ORD);

        let epoch: Arc<Epoch> = loop {
            let ptr: *mut Epoch = self.current.load(EPOCH_ORD);
            // SAFETY: `ptr` was current, and gc frees no epoch while
            // `joining` is non-zero.
            let candidate: &Epoch = unsafe { &*ptr };
            candidate.active.fetch_add(1, EPOCH_ORD);

            if self.current.load(EPOCH_ORD) == ptr {
                // SAFETY: `ptr` came from `Arc::into_raw` and the epoch is
                // still alive (see above).
                break unsafe {
                    Arc::increment_strong_count(ptr);
                    Arc::from_raw(ptr)
                };
            }

            candidate.active.fetch_sub(1, EPOCH_ORD);
        };

        self.joining.fetch_sub(1, EPOCH_ORD);
        EpochGuard { epoch }
    }

    /// Id of the current epoch.
    fn current_id(&self) -> u64 {
        self.joining.fetch_add(1, EPOCH_ORD);
        // SAFETY: as in `join`.
        let id: u64 = unsafe { (*self.current.load(EPOCH_ORD)).id };
        self.joining.fetch_sub(1, EPOCH_ORD);
        id
    }

    fn retire(&self, ptr: *mut u8, reclaim: ReclaimFn) {
        let node: *mut Garbage = Box::into_raw(Box::new(Garbage {
            ptr,
            reclaim,
            next: StdPtr::null_mut(),
        }));

        // The joined epoch was current after the caller unlinked `ptr`, and
        // cannot be reclaimed while the guard is held.
        let guard: EpochGuard = self.join();
        guard.epoch.push(node);
        self.retired.fetch_add(1, RELAXED);
    }

    fn create_new_epoch(&self) -> u64 {
        let id: u64 = self.next_id.fetch_add(1, RELAXED);
        let epoch: Arc<Epoch> = Epoch::new(id);

        let mut epochs = self.epochs.lock();
        if let Some(previous) = epochs.back() {
            // Successors are only set here, under `epochs`, once per epoch.
            let _ = previous.successor.set(Arc::clone(&epoch));
        }
        epochs.push_back(Arc::clone(&epoch));

        let new: *mut Epoch = Arc::into_raw(epoch).cast_mut();
        let old: *mut Epoch = self.current.swap(new, EPOCH_ORD);
        // SAFETY: `old` carried the count taken by `into_raw`. `epochs` still
        // holds the epoch, so in-flight joiners keep a live target.
        drop(unsafe { Arc::from_raw(old) });

        id
    }

    fn perform_gc(&self) -> usize {
        let mut epochs = self.epochs.lock();
        let mut freed: usize = 0;

        while let Some(oldest) = epochs.front() {
            if StdPtr::eq(Arc::as_ptr(oldest), self.current.load(EPOCH_ORD)) {
                break;
            }
            if self.joining.load(EPOCH_ORD) > 0 {
                trace_log!("gc deferred by in-flight join");
                break;
            }
            if oldest.active.load(EPOCH_ORD) > 0 {
                trace_log!(epoch = oldest.id, "gc blocked by active guards");
                break;
            }

            // SAFETY: the epoch is no longer current and has no guards, so
            // no retirer can still push to it and no join is in flight.
            // Older epochs were reclaimed before it.
            freed += unsafe { free_list(oldest.take_garbage()) };
            epochs.pop_front();
        }
        drop(epochs);

        if freed > 0 {
            self.reclaimed.fetch_add(freed as u64, RELAXED);
            trace_log!(freed, "epoch gc reclaimed objects");
        }

        freed
    }

    fn stats(&self) -> EpochStats {
        let reclaimed: u64 = self.reclaimed.load(RELAXED);

        EpochStats {
            reclaimed,
            epochs_created: self.next_id.load(RELAXED),
            live_epochs: self.epochs.lock().len(),
            pending: self.retired.load(RELAXED).saturating_sub(reclaimed),
        }
    }
}

impl Drop for EpochState {
    fn drop(&mut self) {
        // SAFETY: release the count owned by `current`. No joiner remains.
        drop(unsafe { Arc::from_raw(*self.current.get_mut()) });
    }
}

// ============================================================================
//  Reclaimer
// ============================================================================

/// Cloneable handle for joining epochs and retiring objects.
#[derive(Clone)]
pub struct Reclaimer {
    state: Arc<EpochState>,
}

impl Reclaimer {
    /// Join the current epoch.
    pub fn join(&self) -> EpochGuard {
        self.state.join()
    }

    /// Defer `reclaim(ptr)` until no guard can still observe `ptr`.
    ///
    /// # Safety
    /// `ptr` must already be unreachable for threads that join later,
    /// `reclaim` must be the matching destructor, and `ptr` must not be
    /// retired twice.
    pub unsafe fn retire(&self, ptr: *mut u8, reclaim: ReclaimFn) {
        self.state.retire(ptr, reclaim);
    }

    /// Retire an object leaked with `Box::into_raw`. Null is ignored.
    ///
    /// # Safety
    /// `ptr` must come from `Box::<T>::into_raw`, must already be unlinked
    /// from every shared structure, and must not be retired twice.
    pub unsafe fn retire_boxed<T: Send + 'static>(&self, ptr: *mut T) {
        if ptr.is_null() {
            return;
        }
        self.state
            .retire(ptr.cast::<u8>(), reclaim::reclaim_boxed::<T>);
    }
}

impl StdFmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Reclaimer")
            .field("stats", &self.state.stats())
            .finish()
    }
}

// ============================================================================
//  EpochManager
// ============================================================================

/// Owner of the epoch state and its background ticker.
///
/// Dropping the manager stops the ticker. Garbage left over is freed once the
/// last [`Reclaimer`] and [`EpochGuard`] referencing it are gone.
pub struct EpochManager {
    reclaimer: Reclaimer,
    ticker: Option<JoinHandle<()>>,
}

impl EpochManager {
    /// Start a manager whose ticker advances every `interval`.
    #[must_use]
    pub fn start(interval: Duration) -> Self {
        let state: Arc<EpochState> = Arc::new(EpochState::new());
        let ticker_state: Arc<EpochState> = Arc::clone(&state);

        let ticker: JoinHandle<()> = std::thread::spawn(move || run_ticker(&ticker_state, interval));
        debug_log!(?interval, "epoch ticker started");

        Self {
            reclaimer: Reclaimer { state },
            ticker: Some(ticker),
        }
    }

    /// A manager without a ticker. Epochs only advance through
    /// [`tick`](Self::tick).
    #[must_use]
    pub fn manual() -> Self {
        Self {
            reclaimer: Reclaimer {
                state: Arc::new(EpochState::new()),
            },
            ticker: None,
        }
    }

    /// A handle for joining and retiring.
    #[must_use]
    pub fn reclaimer(&self) -> Reclaimer {
        self.reclaimer.clone()
    }

    /// Join the current epoch.
    pub fn join(&self) -> EpochGuard {
        self.reclaimer.join()
    }

    /// Reclaim what can be reclaimed. Returns the number of objects freed.
    pub fn perform_gc(&self) -> usize {
        self.reclaimer.state.perform_gc()
    }

    /// Open a new epoch. Returns its id.
    pub fn create_new_epoch(&self) -> u64 {
        self.reclaimer.state.create_new_epoch()
    }

    /// One ticker step: [`perform_gc`](Self::perform_gc), then
    /// [`create_new_epoch`](Self::create_new_epoch).
    pub fn tick(&self) -> usize {
        let freed: usize = self.perform_gc();
        self.create_new_epoch();
        freed
    }

    /// Id of the current epoch.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.reclaimer.state.current_id()
    }

    /// Reclamation counters.
    #[must_use]
    pub fn stats(&self) -> EpochStats {
        self.reclaimer.state.stats()
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        let Some(ticker) = self.ticker.take() else {
            return;
        };

        let state: &EpochState = &self.reclaimer.state;
        *state.stop.lock() = true;
        state.stop_signal.notify_all();

        if ticker.join().is_err() {
            error_log!("epoch ticker panicked");
        }
        debug_log!(stats = ?state.stats(), "epoch ticker stopped");
    }
}

impl StdFmt::Debug for EpochManager {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("EpochManager")
            .field("ticking", &self.ticker.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_ticker(state: &EpochState, interval: Duration) {
    loop {
        state.perform_gc();
        let _epoch: u64 = state.create_new_epoch();
        trace_log!(epoch = _epoch, "epoch advanced");

        let mut stop = state.stop.lock();
        if !*stop {
            let _ = state.stop_signal.wait_for(&mut stop, interval);
        }
        if *stop {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Sets a flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn flagged() -> (*mut DropFlag, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (Box::into_raw(Box::new(DropFlag(Arc::clone(&flag)))), flag)
    }

    fn is_set(flag: &AtomicBool) -> bool {
        flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[test]
    fn test_current_epoch_is_never_reclaimed() {
        let manager = EpochManager::manual();
        let (ptr, flag) = flagged();

        // SAFETY: `ptr` is a fresh, unshared Box.
        unsafe { manager.reclaimer().retire_boxed(ptr) };

        assert_eq!(manager.perform_gc(), 0);
        assert!(!is_set(&flag));
        assert_eq!(manager.stats().pending, 1);
    }

    #[test]
    fn test_retired_object_freed_after_epoch_advances() {
        let manager = EpochManager::manual();
        let (ptr, flag) = flagged();

        // SAFETY: `ptr` is a fresh, unshared Box.
        unsafe { manager.reclaimer().retire_boxed(ptr) };
        manager.create_new_epoch();

        assert_eq!(manager.perform_gc(), 1);
        assert!(is_set(&flag));

        let stats: EpochStats = manager.stats();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.live_epochs, 1);
    }

    #[test]
    fn test_active_guard_blocks_reclamation() {
        let manager = EpochManager::manual();
        let guard: EpochGuard = manager.join();
        let (ptr, flag) = flagged();

        // SAFETY: `ptr` is a fresh, unshared Box.
        unsafe { manager.reclaimer().retire_boxed(ptr) };
        manager.tick();
        manager.tick();

        assert!(!is_set(&flag));

        drop(guard);
        manager.tick();

        assert!(is_set(&flag));
    }

    #[test]
    fn test_older_guard_blocks_newer_epochs() {
        let manager = EpochManager::manual();
        let old: EpochGuard = manager.join();
        manager.create_new_epoch();

        let (ptr, flag) = flagged();
        // SAFETY: `ptr` is a fresh, unshared Box.
        unsafe { manager.reclaimer().retire_boxed(ptr) };
        manager.create_new_epoch();

        // Epoch 1 is idle, but epoch 0 still has a guard.
        assert_eq!(manager.perform_gc(), 0);
        assert!(!is_set(&flag));
        assert_eq!(manager.stats().live_epochs, 3);

        drop(old);
        assert_eq!(manager.perform_gc(), 1);
        assert!(is_set(&flag));
    }

    #[test]
    fn test_guard_decrements_joined_epoch() {
        let manager = EpochManager::manual();
        let guard: EpochGuard = manager.join();
        let joined: u64 = guard.epoch_id();

        manager.create_new_epoch();
        assert_ne!(manager.current_epoch(), joined);

        drop(guard);
        manager.perform_gc();

        assert_eq!(manager.stats().live_epochs, 1);
    }

    #[test]
    fn test_leftover_garbage_freed_on_drop() {
        let (ptr, flag) = flagged();
        {
            let manager = EpochManager::manual();
            // SAFETY: `ptr` is a fresh, unshared Box.
            unsafe { manager.reclaimer().retire_boxed(ptr) };
        }

        assert!(is_set(&flag));
    }

    #[test]
    fn test_leaked_guard_keeps_garbage_alive() {
        let (ptr, flag) = flagged();
        let guard: EpochGuard;
        {
            let manager = EpochManager::manual();
            guard = manager.join();
            manager.create_new_epoch();
            // SAFETY: `ptr` is a fresh, unshared Box.
            unsafe { manager.reclaimer().retire_boxed(ptr) };
        }

        assert!(!is_set(&flag));
        drop(guard);
        assert!(is_set(&flag));
    }

    #[test]
    fn test_ticker_reclaims_and_stops() {
        let manager = EpochManager::start(Duration::from_millis(1));
        let (ptr, flag) = flagged();

        // SAFETY: `ptr` is a fresh, unshared Box.
        unsafe { manager.reclaimer().retire_boxed(ptr) };

        for _ in 0..1000 {
            if is_set(&flag) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(is_set(&flag));
        assert!(manager.stats().epochs_created > 1);
        drop(manager);
    }

    #[test]
    fn test_drop_stops_long_interval_ticker_promptly() {
        let started = std::time::Instant::now();
        drop(EpochManager::start(Duration::from_secs(60)));

        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_join_races_epoch_advance() {
        use std::sync::atomic::Ordering;

        const CANARY: u64 = 0xC0FF_EE00_D15E_A5E5;

        let manager = EpochManager::manual();
        let slot: AtomicPtr<u64> = AtomicPtr::new(Box::into_raw(Box::new(CANARY)));
        let stop = AtomicBool::new(false);
        let swaps = AtomicU64::new(0);

        std::thread::scope(|s| {
            // Advance and reclaim as fast as possible.
            s.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    manager.tick();
                }
            });

            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let reclaimer = manager.reclaimer();
                    let (slot, swaps) = (&slot, &swaps);
                    s.spawn(move || {
                        for i in 0..5_000u64 {
                            let guard: EpochGuard = reclaimer.join();
                            // SAFETY: the slot's object is retired only after it
                            // is swapped out, and `guard` pins it.
                            assert_eq!(unsafe { *slot.load(Ordering::Acquire) }, CANARY);

                            if i % 4 == 0 {
                                let old = slot.swap(Box::into_raw(Box::new(CANARY)), Ordering::AcqRel);
                                // SAFETY: `old` is unlinked and retired once.
                                unsafe { reclaimer.retire_boxed(old) };
                                swaps.fetch_add(1, Ordering::Relaxed);
                            }
                            drop(guard);
                        }
                    })
                })
                .collect();

            // Joiners in the test thread while the ticker spins.
            for _ in 0..5_000 {
                let guard: EpochGuard = manager.join();
                assert!(guard.epoch_id() <= manager.current_epoch());
            }

            for w in workers {
                w.join().expect("worker panicked");
            }
            stop.store(true, Ordering::Relaxed);
        });

        manager.tick();
        manager.tick();
        let stats: EpochStats = manager.stats();
        assert_eq!(stats.reclaimed, swaps.load(Ordering::Relaxed));
        assert_eq!(stats.pending, 0);

        // SAFETY: every worker is gone; the last object was never retired.
        drop(unsafe { Box::from_raw(slot.load(Ordering::Acquire)) });
    }

    #[test]
    fn test_concurrent_retire_and_join() {
        let manager = Arc::new(EpochManager::start(Duration::from_millis(1)));
        let drops = Arc::new(AtomicU64::new(0));

        struct Counted(Arc<AtomicU64>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reclaimer = manager.reclaimer();
                let drops = Arc::clone(&drops);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = reclaimer.join();
                        let ptr = Box::into_raw(Box::new(Counted(Arc::clone(&drops))));
                        // SAFETY: `ptr` is a fresh, unshared Box.
                        unsafe { reclaimer.retire_boxed(ptr) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("worker panicked");
        }

        let manager = Arc::try_unwrap(manager).expect("workers finished");
        drop(manager);

        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 4000);
    }
}
