use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("request expired")]
    Expired,

    #[error("request not found")]
    Missing,

    #[error("request is already being processed")]
    Claimed,
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub ttl: Duration,
    pub expired_retention: Duration,
    /// Hex characters per id.
    pub id_len: usize,
}

impl StoreConfig {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            expired_retention: Duration::from_secs(3600),
            id_len: 12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry<T> {
    pub id: String,
    pub value: T,
    pub created_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub forgotten: usize,
}

enum Slot<T> {
    Pending { entry: Entry<T>, claimed: bool },
    Expired { expired_at: Instant },
}

pub struct RequestStore<T> {
    cfg: StoreConfig,
    slots: RwLock<HashMap<String, Slot<T>>>,
}

impl<T: Clone> RequestStore<T> {
    pub fn new(cfg: StoreConfig) -> Self {
        Self { cfg, slots: RwLock::new(HashMap::new()) }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// Stores `value` under a fresh id, expiring `ttl` from now.
    pub async fn put(&self, value: T) -> String {
        let mut slots = self.slots.write().await;
        let id = loop {
            let candidate = short_id(self.cfg.id_len);
            if !slots.contains_key(&candidate) {
                break candidate;
            }
        };
        let created_at = Instant::now();
        let entry = Entry {
            id: id.clone(),
            value,
            created_at,
            expires_at: created_at + self.cfg.ttl,
        };
        slots.insert(id.clone(), Slot::Pending { entry, claimed: false });
        id
    }

    pub async fn get(&self, id: &str) -> Result<Entry<T>> {
        let slots = self.slots.read().await;
        match slots.get(id) {
            None => Err(StoreError::Missing),
            Some(Slot::Expired { .. }) => Err(StoreError::Expired),
            Some(Slot::Pending { entry, .. }) if Instant::now() >= entry.expires_at => {
                Err(StoreError::Expired)
            }
            Some(Slot::Pending { entry, .. }) => Ok(entry.clone()),
        }
    }

    /// Marks a live entry as taken. Exactly one caller wins per id until
    /// [`release`](Self::release) is called.
    pub async fn claim(&self, id: &str) -> Result<Entry<T>> {
        let mut slots = self.slots.write().await;
        let now = Instant::now();
        let slot = slots.get_mut(id).ok_or(StoreError::Missing)?;
        if let Some(expired_at) = overdue(slot, now) {
            *slot = Slot::Expired { expired_at };
            return Err(StoreError::Expired);
        }
        match slot {
            Slot::Expired { .. } => Err(StoreError::Expired),
            Slot::Pending { claimed: true, .. } => Err(StoreError::Claimed),
            Slot::Pending { entry, claimed } => {
                *claimed = true;
                Ok(entry.clone())
            }
        }
    }

    /// Gives a claimed entry back, e.g. when the job queue refused it.
    pub async fn release(&self, id: &str) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get_mut(id) {
            Some(Slot::Pending { claimed, .. }) if *claimed => {
                *claimed = false;
                true
            }
            _ => false,
        }
    }

    /// Forgets the id entirely; later lookups see `Missing`.
    pub async fn remove(&self, id: &str) -> Option<T> {
        match self.slots.write().await.remove(id) {
            Some(Slot::Pending { entry, .. }) => Some(entry.value),
            _ => None,
        }
    }

    /// Turns overdue entries into tombstones and drops tombstones older
    /// than the retention window. Claimed entries are left to their owner.
    pub async fn sweep(&self) -> SweepStats {
        let now = Instant::now();
        let retention = self.cfg.expired_retention;
        let mut stats = SweepStats::default();
        let mut slots = self.slots.write().await;

        for slot in slots.values_mut() {
            if matches!(slot, Slot::Pending { claimed: true, .. }) {
                continue;
            }
            if let Some(expired_at) = overdue(slot, now) {
                *slot = Slot::Expired { expired_at };
                stats.expired += 1;
            }
        }

        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Expired { expired_at } => now < *expired_at + retention,
            Slot::Pending { .. } => true,
        });
        stats.forgotten = before - slots.len();

        if stats != SweepStats::default() {
            debug!(expired = stats.expired, forgotten = stats.forgotten, live = slots.len(), "choicestore: swept");
        }
        stats
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn overdue<T>(slot: &Slot<T>, now: Instant) -> Option<Instant> {
    match slot {
        Slot::Pending { entry, .. } if now >= entry.expires_at => Some(entry.expires_at),
        _ => None,
    }
}

fn short_id(len: usize) -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(len.clamp(4, 32));
    id
}
