use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{Mock, MockKind};

/// How a mock was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    /// Removed from its pool.
    Deleted,
    /// Kept in the unfiltered pool for later connections.
    Reused,
}

/// Consumption tally for one mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockUsage {
    pub id: u64,
    pub name: String,
    /// `Deleted` once the mock left its pool, `Reused` until then.
    pub kind: UsageKind,
    pub uses: u64,
}

/// Concurrent mock pools.
///
/// `filtered` holds command-phase mocks, each served at most once.
/// `unfiltered` holds handshake mocks which may be served to many connections.
/// Both are sharded maps; no operation takes a store-wide lock.
#[derive(Debug, Default)]
pub struct MockStore {
    filtered: DashMap<u64, Arc<Mock>>,
    unfiltered: DashMap<u64, Arc<Mock>>,
    next_id: AtomicU64,
    usage: DashMap<u64, MockUsage>,
    total_uses: AtomicU64,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split recorded mocks into pools by their `type` metadata.
    pub fn from_mocks(mocks: Vec<Mock>) -> Self {
        let (handshake, commands): (Vec<_>, Vec<_>) =
            mocks.into_iter().partition(Mock::is_handshake);
        let store = Self::new();
        store.set_unfiltered(handshake);
        store.set_filtered(commands);
        store
    }

    /// Replace the filtered pool. Mocks without a sort order are ordered as given.
    pub fn set_filtered(&self, mocks: Vec<Mock>) {
        self.filtered.clear();
        for (index, mock) in mocks.into_iter().enumerate() {
            let mock = self.admit(mock, index);
            self.filtered.insert(mock.id, Arc::new(mock));
        }
    }

    /// Replace the unfiltered pool.
    pub fn set_unfiltered(&self, mocks: Vec<Mock>) {
        self.unfiltered.clear();
        for (index, mock) in mocks.into_iter().enumerate() {
            let mock = self.admit(mock, index);
            self.unfiltered.insert(mock.id, Arc::new(mock));
        }
    }

    fn admit(&self, mut mock: Mock, index: usize) -> Mock {
        mock.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if mock.sort_order == 0 {
            mock.sort_order = index as i64 + 1;
        }
        mock.is_filtered = true;
        mock.is_used = false;
        mock
    }

    /// Filtered mocks of `kind`, in recording order.
    pub fn filtered_by_kind(&self, kind: MockKind) -> Vec<Arc<Mock>> {
        snapshot(&self.filtered, kind)
    }

    /// Unfiltered mocks of `kind`, in recording order; reused mocks last.
    pub fn unfiltered_by_kind(&self, kind: MockKind) -> Vec<Arc<Mock>> {
        snapshot(&self.unfiltered, kind)
    }

    /// Remove a filtered mock. Returns false if another session took it first.
    pub fn delete_filtered(&self, mock: &Mock) -> bool {
        let removed = self.filtered.remove(&mock.id).is_some();
        if removed {
            self.record(mock, UsageKind::Deleted);
        }
        removed
    }

    /// Remove an unfiltered mock. Returns false if it is already gone.
    pub fn delete_unfiltered(&self, mock: &Mock) -> bool {
        let removed = self.unfiltered.remove(&mock.id).is_some();
        if removed {
            self.record(mock, UsageKind::Deleted);
        }
        removed
    }

    /// Replace an unfiltered mock in place. Returns false if it is gone.
    pub fn update_unfiltered(&self, mock: Mock) -> bool {
        match self.unfiltered.get_mut(&mock.id) {
            Some(mut entry) => {
                *entry = Arc::new(mock);
                true
            }
            None => false,
        }
    }

    /// Mark a handshake mock as consumed but keep it available.
    ///
    /// A fresh mock is re-filed with `is_filtered = false` and sorted behind
    /// every fresh mock; an already reused one is only flagged.
    pub fn reuse_unfiltered(&self, mock: &Mock) -> bool {
        if !mock.is_filtered {
            self.flag_used(mock);
            return self.unfiltered.contains_key(&mock.id);
        }
        let mut updated = mock.clone();
        updated.is_filtered = false;
        updated.sort_order = i64::MAX;
        updated.is_used = true;
        let kept = self.update_unfiltered(updated);
        if kept {
            self.record(mock, UsageKind::Reused);
        }
        kept
    }

    /// Record a use without changing either pool.
    pub fn flag_used(&self, mock: &Mock) {
        self.record(mock, UsageKind::Reused);
    }

    fn record(&self, mock: &Mock, kind: UsageKind) {
        debug!(mock = %mock.name, id = mock.id, ?kind, "Mock consumed");
        self.total_uses.fetch_add(1, Ordering::Relaxed);
        self.usage
            .entry(mock.id)
            .and_modify(|usage| {
                usage.uses += 1;
                if kind == UsageKind::Deleted {
                    usage.kind = kind;
                }
            })
            .or_insert_with(|| MockUsage {
                id: mock.id,
                name: mock.name.clone(),
                kind,
                uses: 1,
            });
    }

    /// One tally per consumed mock, in admission order.
    pub fn consumed(&self) -> Vec<MockUsage> {
        let mut usage: Vec<_> = self.usage.iter().map(|e| e.value().clone()).collect();
        usage.sort_by_key(|u| u.id);
        usage
    }

    /// Total consumptions across all mocks.
    pub fn consumed_count(&self) -> u64 {
        self.total_uses.load(Ordering::Relaxed)
    }

    pub fn filtered_len(&self) -> usize {
        self.filtered.len()
    }

    pub fn unfiltered_len(&self) -> usize {
        self.unfiltered.len()
    }

    /// Names of filtered mocks nobody asked for, in recording order.
    pub fn unused_filtered(&self) -> Vec<String> {
        let mut remaining: Vec<_> = self
            .filtered
            .iter()
            .map(|entry| (entry.sort_order, entry.id, entry.name.clone()))
            .collect();
        remaining.sort();
        remaining.into_iter().map(|(_, _, name)| name).collect()
    }
}

fn snapshot(pool: &DashMap<u64, Arc<Mock>>, kind: MockKind) -> Vec<Arc<Mock>> {
    let mut mocks: Vec<Arc<Mock>> = pool
        .iter()
        .filter(|entry| entry.kind == kind)
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    mocks.sort_by_key(|m| (m.sort_order, m.id));
    mocks
}
