use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use concurrent_map::ConcurrentMap;
use inline_array::InlineArray;

use crate::{
    ETag, Page, Properties, ReplicaId, ReplicaStore, RowKey, StoreError,
    StoreResult, TableRow,
};

// Partition and row keys never contain control characters, so a NUL
// separator keeps the encoded order identical to the (pk, rk) order.
const KEY_SEPARATOR: u8 = 0;

fn encode_key(key: &RowKey) -> InlineArray {
    let mut buf = Vec::with_capacity(
        key.partition_key.len() + 1 + key.row_key.len(),
    );
    buf.extend_from_slice(key.partition_key.as_bytes());
    buf.push(KEY_SEPARATOR);
    buf.extend_from_slice(key.row_key.as_bytes());
    InlineArray::from(&*buf)
}

fn partition_bounds(partition: &str) -> (InlineArray, InlineArray) {
    let mut lo = partition.as_bytes().to_vec();
    let mut hi = lo.clone();
    lo.push(KEY_SEPARATOR);
    hi.push(KEY_SEPARATOR + 1);
    (InlineArray::from(&*lo), InlineArray::from(&*hi))
}

/// A lock-free in-memory table store.
///
/// Besides backing tests and single-process deployments, it can be
/// told to fail: `set_reachable(false)` takes it offline,
/// `fail_next(n)` makes the next `n` calls fail as if the network
/// dropped them, and `time_out_next(n)` makes them time out.
pub struct MemoryTable {
    id: ReplicaId,
    rows: ConcurrentMap<InlineArray, TableRow>,
    next_etag: AtomicU64,
    reachable: AtomicBool,
    failures_pending: AtomicUsize,
    timeouts_pending: AtomicUsize,
    calls: AtomicU64,
}

impl fmt::Debug for MemoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTable")
            .field("id", &self.id)
            .field("rows", &self.len())
            .field("reachable", &self.is_reachable())
            .finish()
    }
}

impl MemoryTable {
    /// Creates an empty, reachable table.
    pub fn new<I: Into<ReplicaId>>(id: I) -> MemoryTable {
        MemoryTable {
            id: id.into(),
            rows: ConcurrentMap::default(),
            next_etag: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            failures_pending: AtomicUsize::new(0),
            timeouts_pending: AtomicUsize::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Takes the table offline or brings it back. Offline calls fail
    /// with `StoreError::Unreachable` without touching any row.
    pub fn set_reachable(&self, reachable: bool) {
        log::debug!("replica {} reachable: {}", self.id, reachable);
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Whether the table is currently online.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Makes the next `n` calls fail with `StoreError::Unreachable`.
    pub fn fail_next(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` calls fail with `StoreError::Timeout`. The
    /// timed out calls leave every row untouched.
    pub fn time_out_next(&self, n: usize) {
        self.timeouts_pending.store(n, Ordering::SeqCst);
    }

    /// The number of calls made against this table, failed ones
    /// included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// The number of rows held, tombstones included.
    pub fn len(&self) -> usize {
        self.rows.iter().count()
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every row in key order, bypassing reachability. Meant for
    /// inspecting a replica directly.
    pub fn snapshot(&self) -> Vec<TableRow> {
        self.rows.iter().map(|(_, row)| row).collect()
    }

    fn check_reachable(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if !self.is_reachable() {
            return Err(StoreError::Unreachable(format!(
                "replica {} is offline",
                self.id
            )));
        }

        if take_one(&self.timeouts_pending) {
            return Err(StoreError::Timeout);
        }

        if take_one(&self.failures_pending) {
            return Err(StoreError::Unreachable(format!(
                "injected failure on replica {}",
                self.id
            )));
        }

        Ok(())
    }

    fn new_etag(&self) -> ETag {
        let n = self.next_etag.fetch_add(1, Ordering::Relaxed);
        ETag(format!("W/\"{}:{}\"", self.id, n))
    }
}

fn take_one(pending: &AtomicUsize) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ReplicaStore for MemoryTable {
    fn id(&self) -> &ReplicaId {
        &self.id
    }

    fn get(&self, key: &RowKey) -> StoreResult<Option<TableRow>> {
        self.check_reachable()?;
        Ok(self.rows.get(&encode_key(key)))
    }

    fn insert(&self, key: &RowKey, properties: Properties) -> StoreResult<ETag> {
        self.check_reachable()?;

        let etag = self.new_etag();
        let row = TableRow { key: key.clone(), properties, etag: etag.clone() };

        let absent: Option<&TableRow> = None;
        match self.rows.cas(encode_key(key), absent, Some(row)) {
            Ok(_) => Ok(etag),
            Err(_) => Err(StoreError::AlreadyExists),
        }
    }

    fn replace(
        &self,
        key: &RowKey,
        properties: Properties,
        expected: &ETag,
    ) -> StoreResult<ETag> {
        self.check_reachable()?;

        let encoded = encode_key(key);
        let current = match self.rows.get(&encoded) {
            Some(current) => current,
            None => return Err(StoreError::NotFound),
        };
        if &current.etag != expected {
            return Err(StoreError::PreconditionFailed);
        }

        let etag = self.new_etag();
        let row = TableRow { key: key.clone(), properties, etag: etag.clone() };

        match self.rows.cas(encoded, Some(&current), Some(row)) {
            Ok(_) => Ok(etag),
            Err(_) => Err(StoreError::PreconditionFailed),
        }
    }

    fn query(
        &self,
        partition: Option<&str>,
        after: Option<&RowKey>,
        limit: usize,
    ) -> StoreResult<Page> {
        self.check_reachable()?;

        let (mut lo, hi) = match partition {
            Some(pk) => {
                let (lo, hi) = partition_bounds(pk);
                (Bound::Included(lo), Bound::Excluded(hi))
            }
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        if let Some(after) = after {
            let after = encode_key(after);
            let past_lo = match &lo {
                Bound::Included(lo) => &after >= lo,
                _ => true,
            };
            if let Bound::Excluded(hi) = &hi {
                if &after >= hi {
                    return Ok(Page::default());
                }
            }
            if past_lo {
                lo = Bound::Excluded(after);
            }
        }

        let limit = limit.max(1);
        let rows: Vec<TableRow> = self
            .rows
            .range((lo, hi))
            .take(limit)
            .map(|(_, row)| row)
            .collect();

        let continuation = if rows.len() == limit {
            rows.last().map(|row| row.key.clone())
        } else {
            None
        };

        Ok(Page { rows, continuation })
    }
}
