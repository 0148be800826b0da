//! Per-thread segment arenas.
//!
//! Each allocating thread gets a segment of its own so the common
//! allocation path contends on nothing but that segment's lock. When a
//! thread's segment runs dry it is handed a different one, stealing an
//! already-assigned segment if necessary; the evicted thread simply
//! re-enters the arena on its next allocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::constants::MAX_BARREN_SWEEPS;
use crate::segment::{Segment, SegmentState};

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique, non-zero token identifying the calling thread.
///
/// 0 is reserved to mean "unassigned" in segment state.
pub(crate) fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// A segment picked during an assignment sweep, with its lock held.
struct Candidate<'a> {
    index: usize,
    guard: MutexGuard<'a, SegmentState>,
    fragmentation: f64,
    free_space: u64,
}

/// Assigns segments to calling threads.
pub(crate) struct ArenaManager {
    /// Thread token to segment index. Mutable only under its own lock.
    arenas: Mutex<HashMap<u64, usize>>,
    /// Serializes reassignment sweeps.
    assign_lock: Mutex<()>,
}

impl ArenaManager {
    pub(crate) fn new() -> Self {
        Self {
            arenas: Mutex::new(HashMap::new()),
            assign_lock: Mutex::new(()),
        }
    }

    /// Returns the calling thread's segment with its lock held, assigning a
    /// new one when the thread has none or its segment is contended.
    pub(crate) fn enter<'a>(
        &self,
        segments: &'a [Segment],
        token: u64,
        min_free: u64,
    ) -> (usize, MutexGuard<'a, SegmentState>) {
        let mapped = self.arenas.lock().get(&token).copied();
        if let Some(index) = mapped {
            if let Some(guard) = segments[index].state.try_lock() {
                return (index, guard);
            }
        }

        self.assign(segments, token, None, min_free)
    }

    /// Moves the thread onto a different segment.
    ///
    /// Prefers unassigned segments with enough free space, ranked by lowest
    /// fragmentation then most free space; otherwise steals the best
    /// already-assigned segment and evicts its owner's mapping. While no
    /// segment has enough free space the sweep retries, yielding between
    /// passes; after a bounded number of barren sweeps it settles for the
    /// fullest lockable segment so the caller's allocation attempt can fail
    /// cleanly instead of spinning forever.
    pub(crate) fn assign<'a>(
        &self,
        segments: &'a [Segment],
        token: u64,
        current: Option<(usize, MutexGuard<'a, SegmentState>)>,
        min_free: u64,
    ) -> (usize, MutexGuard<'a, SegmentState>) {
        let _assign = self.assign_lock.lock();

        if let Some((index, mut guard)) = current {
            self.arenas.lock().remove(&token);
            guard.assigned = 0;
            debug!(segment = index, token, "released exhausted segment");
            drop(guard);
        }

        let mut barren_sweeps = 0u32;
        loop {
            let threshold = if barren_sweeps < MAX_BARREN_SWEEPS {
                Some(min_free)
            } else {
                None
            };

            let (unassigned, assigned) = self.sweep(segments, threshold);

            if let Some(candidate) = unassigned {
                drop(assigned);
                return self.finish(token, candidate, None);
            }
            if let Some(candidate) = assigned {
                let evicted = candidate.guard.assigned;
                debug!(segment = candidate.index, token, evicted, "stealing segment");
                return self.finish(token, candidate, Some(evicted));
            }

            barren_sweeps = barren_sweeps.saturating_add(1);
            thread::yield_now();
        }
    }

    /// One pass over all segments, keeping the best unassigned and best
    /// assigned candidates locked. `threshold` of `None` accepts any
    /// lockable segment regardless of free space.
    fn sweep<'a>(
        &self,
        segments: &'a [Segment],
        threshold: Option<u64>,
    ) -> (Option<Candidate<'a>>, Option<Candidate<'a>>) {
        let mut best_unassigned: Option<Candidate<'a>> = None;
        let mut best_assigned: Option<Candidate<'a>> = None;

        for (index, segment) in segments.iter().enumerate() {
            let Some(guard) = segment.state.try_lock() else {
                continue;
            };
            if let Some(min_free) = threshold {
                if guard.free_space <= min_free {
                    continue;
                }
            }

            let candidate = Candidate {
                index,
                fragmentation: guard.fragmentation(),
                free_space: guard.free_space,
                guard,
            };
            let slot = if candidate.guard.assigned != 0 {
                &mut best_assigned
            } else {
                &mut best_unassigned
            };
            let better = match slot {
                None => true,
                Some(best) => {
                    candidate.fragmentation < best.fragmentation
                        || (candidate.fragmentation == best.fragmentation
                            && candidate.free_space > best.free_space)
                }
            };
            if better {
                *slot = Some(candidate);
            }
        }

        (best_unassigned, best_assigned)
    }

    /// Records the assignment and hands the locked segment to the caller.
    fn finish<'a>(
        &self,
        token: u64,
        mut candidate: Candidate<'a>,
        evicted: Option<u64>,
    ) -> (usize, MutexGuard<'a, SegmentState>) {
        candidate.guard.assigned = token;

        let mut arenas = self.arenas.lock();
        if let Some(evicted) = evicted {
            arenas.remove(&evicted);
        }
        arenas.insert(token, candidate.index);

        (candidate.index, candidate.guard)
    }
}
