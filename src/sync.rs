//! The per-cell lock table: mutual exclusion over the shared road surface.
//!
//! One lock exists per occupiable (non-empty) cell, built once when the
//! grid loads and living for the whole run. Multi-cell reservations are
//! all-or-nothing and always acquire in canonical row-major order, which
//! is what rules out circular-wait deadlock between overlapping requests.

use log::trace;
use smallvec::SmallVec;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::util::{CancelToken, Cancelled};
use crate::{CellCoord, CellType, Grid};

/// How long a bounded acquisition attempt waits before giving up.
pub(crate) const DEFAULT_PATIENCE: Duration = Duration::from_millis(5);

/// Slice length between cancellation re-checks during a blocking acquire.
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Selects which mutual-exclusion primitive backs each cell lock.
///
/// The two strategies are behaviourally equivalent from an agent's point
/// of view; the choice is made once per run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LockStrategy {
    /// Binary counting-semaphore style locks.
    #[default]
    Semaphore,
    /// Monitor (held-flag plus condition) style locks.
    Monitor,
}

/// One mutual-exclusion lock per occupiable grid cell.
pub struct LockTable {
    rows: u32,
    cols: u32,
    locks: Vec<Option<CellLock>>,
    strategy: LockStrategy,
    patience: Duration,
}

impl LockTable {
    /// Builds the lock table for `grid`, one lock per non-empty cell.
    pub fn new(grid: &Grid, strategy: LockStrategy) -> Self {
        Self::with_patience(grid, strategy, DEFAULT_PATIENCE)
    }

    /// As [LockTable::new], with an explicit bounded-wait patience for
    /// [LockTable::try_acquire].
    pub fn with_patience(grid: &Grid, strategy: LockStrategy, patience: Duration) -> Self {
        let locks = grid
            .coords()
            .map(|coord| {
                (grid.cell(coord) != CellType::Empty).then(|| CellLock::new(strategy))
            })
            .collect();
        Self {
            rows: grid.rows(),
            cols: grid.cols(),
            locks,
            strategy,
            patience,
        }
    }

    /// The strategy the table was built with.
    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    /// Blocks until the lock for `cell` is claimed, or until `token` is
    /// cancelled, in which case ownership is not claimed. Cells without a
    /// lock succeed immediately.
    pub fn acquire(&self, cell: CellCoord, token: &CancelToken) -> Result<(), Cancelled> {
        match self.lock_at(cell) {
            Some(lock) => lock.acquire(token),
            None => Ok(()),
        }
    }

    /// Attempts to claim the lock for `cell`, waiting at most the table's
    /// patience. Returns whether it succeeded. Cells without a lock always
    /// succeed.
    pub fn try_acquire(&self, cell: CellCoord) -> bool {
        match self.lock_at(cell) {
            Some(lock) => lock.try_acquire(self.patience),
            None => true,
        }
    }

    /// Releases the lock for `cell`. Never fails: releasing a cell without
    /// a lock, or whose lock is already free, is a no-op.
    pub fn release(&self, cell: CellCoord) {
        if let Some(lock) = self.lock_at(cell) {
            lock.release();
        }
    }

    /// Atomically reserves every cell in `cells`: either all of them end
    /// up held by the caller, or none do.
    ///
    /// The request is acquired in canonical row-major order regardless of
    /// the order given, so two agents reserving overlapping cell sets can
    /// never deadlock each other. On the first cell that cannot be claimed
    /// within the table's patience, every lock already claimed by this
    /// call is released and the call reports failure.
    pub fn try_acquire_path(&self, cells: &[CellCoord]) -> bool {
        let mut ordered: SmallVec<[CellCoord; 8]> = SmallVec::from_slice(cells);
        ordered.sort_unstable();
        for (done, &cell) in ordered.iter().enumerate() {
            if !self.try_acquire(cell) {
                trace!("path reservation failed at {cell}, rolling back {done} cells");
                for &held in &ordered[..done] {
                    self.release(held);
                }
                return false;
            }
        }
        true
    }

    /// Releases every cell in `cells`. Best-effort; cells without a lock
    /// are ignored.
    pub fn release_path(&self, cells: &[CellCoord]) {
        for &cell in cells {
            self.release(cell);
        }
    }

    /// Non-blocking point query of the lock state of `cell`.
    ///
    /// Observation only: the answer may be stale by the time the caller
    /// acts on it, and a cell reported free may be claimed by another
    /// agent immediately afterwards.
    pub fn is_occupied(&self, cell: CellCoord) -> bool {
        self.lock_at(cell).is_some_and(CellLock::is_locked)
    }

    /// The number of cells currently held. Diagnostic only.
    pub fn occupied_count(&self) -> usize {
        self.locks
            .iter()
            .flatten()
            .filter(|lock| lock.is_locked())
            .count()
    }

    fn lock_at(&self, cell: CellCoord) -> Option<&CellLock> {
        if cell.row >= self.rows || cell.col >= self.cols {
            return None;
        }
        self.locks[cell.row as usize * self.cols as usize + cell.col as usize].as_ref()
    }
}

/// A single cell's lock, in one of the two strategy flavours.
enum CellLock {
    Semaphore(SemaphoreCell),
    Monitor(MonitorCell),
}

impl CellLock {
    fn new(strategy: LockStrategy) -> Self {
        match strategy {
            LockStrategy::Semaphore => CellLock::Semaphore(SemaphoreCell::new()),
            LockStrategy::Monitor => CellLock::Monitor(MonitorCell::new()),
        }
    }

    fn acquire(&self, token: &CancelToken) -> Result<(), Cancelled> {
        match self {
            CellLock::Semaphore(cell) => cell.acquire(token),
            CellLock::Monitor(cell) => cell.acquire(token),
        }
    }

    fn try_acquire(&self, patience: Duration) -> bool {
        match self {
            CellLock::Semaphore(cell) => cell.try_acquire(patience),
            CellLock::Monitor(cell) => cell.try_acquire(patience),
        }
    }

    fn release(&self) {
        match self {
            CellLock::Semaphore(cell) => cell.release(),
            CellLock::Monitor(cell) => cell.release(),
        }
    }

    fn is_locked(&self) -> bool {
        match self {
            CellLock::Semaphore(cell) => cell.is_locked(),
            CellLock::Monitor(cell) => cell.is_locked(),
        }
    }
}

/// Binary semaphore: a permit count that never exceeds one.
struct SemaphoreCell {
    permits: Mutex<u8>,
    available: Condvar,
}

impl SemaphoreCell {
    fn new() -> Self {
        Self {
            permits: Mutex::new(1),
            available: Condvar::new(),
        }
    }

    fn acquire(&self, token: &CancelToken) -> Result<(), Cancelled> {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if token.is_cancelled() {
                return Err(Cancelled);
            }
            if *permits > 0 {
                *permits -= 1;
                return Ok(());
            }
            let (guard, _) = self
                .available
                .wait_timeout(permits, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
    }

    fn try_acquire(&self, patience: Duration) -> bool {
        let deadline = Instant::now() + patience;
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .available
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
    }

    fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        // The count is clamped at one permit, so releasing a free lock
        // stays a no-op.
        if *permits == 0 {
            *permits = 1;
            self.available.notify_one();
        }
    }

    fn is_locked(&self) -> bool {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner) == 0
    }
}

/// Monitor: a held flag guarded by a mutex, with a condition to wait on.
struct MonitorCell {
    held: Mutex<bool>,
    freed: Condvar,
}

impl MonitorCell {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self, token: &CancelToken) -> Result<(), Cancelled> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if token.is_cancelled() {
                return Err(Cancelled);
            }
            if !*held {
                *held = true;
                return Ok(());
            }
            let (guard, _) = self
                .freed
                .wait_timeout(held, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }
    }

    fn try_acquire(&self, patience: Duration) -> bool {
        let deadline = Instant::now() + patience;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if !*held {
                *held = true;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .freed
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            held = guard;
        }
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        self.freed.notify_one();
    }

    fn is_locked(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use once_cell::sync::Lazy;

    /// A 3x3 grid whose centre row is road and the rest empty.
    static GRID: Lazy<Grid> = Lazy::new(|| {
        let codes = [0, 0, 0, 2, 2, 2, 0, 0, 0];
        let cells = codes
            .iter()
            .map(|&code| CellType::from_code(code).unwrap())
            .collect();
        Grid::new(3, 3, cells)
    });

    fn both_strategies() -> [LockTable; 2] {
        [
            LockTable::new(&GRID, LockStrategy::Semaphore),
            LockTable::new(&GRID, LockStrategy::Monitor),
        ]
    }

    #[test]
    fn acquire_then_release() {
        for table in both_strategies() {
            let cell = CellCoord::new(1, 1);
            assert!(!table.is_occupied(cell));
            assert!(table.try_acquire(cell));
            assert!(table.is_occupied(cell));
            assert!(!table.try_acquire(cell));
            table.release(cell);
            assert!(!table.is_occupied(cell));
            assert!(table.try_acquire(cell));
        }
    }

    #[test]
    fn releasing_a_free_lock_is_harmless() {
        for table in both_strategies() {
            let cell = CellCoord::new(1, 0);
            table.release(cell);
            table.release(cell);
            // The lock still behaves as a binary lock afterwards.
            assert!(table.try_acquire(cell));
            assert!(!table.try_acquire(cell));
            table.release(cell);
        }
    }

    #[test]
    fn lockless_cells_always_succeed() {
        for table in both_strategies() {
            let empty = CellCoord::new(0, 0);
            let outside = CellCoord::new(9, 9);
            for cell in [empty, outside] {
                assert!(table.try_acquire(cell));
                assert!(table.try_acquire(cell));
                assert!(!table.is_occupied(cell));
                table.release(cell);
            }
        }
    }

    #[test]
    fn path_reservation_is_all_or_nothing() {
        for table in both_strategies() {
            let path = [
                CellCoord::new(1, 0),
                CellCoord::new(1, 1),
                CellCoord::new(1, 2),
            ];
            // Pre-hold the middle cell so the reservation must fail.
            assert!(table.try_acquire(path[1]));
            assert!(!table.try_acquire_path(&path));
            assert!(!table.is_occupied(path[0]));
            assert!(!table.is_occupied(path[2]));

            table.release(path[1]);
            assert!(table.try_acquire_path(&path));
            for cell in path {
                assert!(table.is_occupied(cell));
            }
            table.release_path(&path);
            assert_eq!(table.occupied_count(), 0);
        }
    }

    #[test]
    fn blocking_acquire_observes_cancellation() {
        for table in both_strategies() {
            let cell = CellCoord::new(1, 2);
            assert!(table.try_acquire(cell));
            let token = CancelToken::new();
            token.cancel();
            assert_eq!(table.acquire(cell, &token), Err(Cancelled));
            // The failed acquire claimed nothing; one release frees it.
            table.release(cell);
            assert!(!table.is_occupied(cell));
        }
    }
}
