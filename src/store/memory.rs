//! In-process shared store.
//!
//! Each key is guarded by its DashMap shard lock for the duration of an
//! operation, which makes every operation atomic per key. Several registries
//! holding the same `Arc<MemoryStore>` enforce one limit between them.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{
    refill_and_take, SharedStore, StoreError, StoreResult, TokenTake, TOKEN_STATE_TTL_MS,
    WINDOW_CLEANUP_GRACE_MS,
};
use crate::ratelimit::{Clock, SystemClock};

/// Expired keys are swept once every this many new keys.
const SWEEP_EVERY: u64 = 1024;

enum Stored {
    Counter(u64),
    /// Members ordered by `(score, member)`
    Window(BTreeSet<(u64, String)>),
    Bucket { tokens: Option<f64>, last: Option<u64> },
    List(VecDeque<String>),
}

struct Slot {
    value: Stored,
    /// Epoch millis at which the key disappears
    expires_at: Option<u64>,
}

impl Slot {
    fn new(value: Stored) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A [`SharedStore`] held in process memory.
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    inserts: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            inserts: AtomicU64::new(0),
        }
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.slots.iter().filter(|slot| !slot.is_expired(now)).count()
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        let purged = before.saturating_sub(self.slots.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired keys");
        }
        purged
    }

    /// Lock `key`, replacing it with `fresh()` if absent or expired.
    ///
    /// Creating a new key occasionally sweeps expired ones first, so keys
    /// that are never touched again do not accumulate.
    fn slot(&self, key: &str, fresh: fn() -> Stored) -> RefMut<'_, String, Slot> {
        if !self.slots.contains_key(key)
            && self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1
        {
            self.purge_expired();
        }

        let now = self.clock.now_millis();
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(fresh()));
        if slot.is_expired(now) {
            trace!(key = key, "Key expired");
            *slot = Slot::new(fresh());
        }
        slot
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr_window(&self, key: &str, window_ms: u64) -> StoreResult<u64> {
        let now = self.clock.now_millis();
        let mut guard = self.slot(key, || Stored::Counter(0));
        let slot = &mut *guard;

        let Stored::Counter(value) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        *value += 1;
        if *value == 1 {
            slot.expires_at = Some(now.saturating_add(window_ms));
        }
        Ok(*value)
    }

    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        member: &str,
    ) -> StoreResult<u64> {
        let mut guard = self.slot(key, || Stored::Window(BTreeSet::new()));
        let slot = &mut *guard;

        let Stored::Window(members) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        members.insert((now_ms, member.to_string()));

        let min_score = now_ms.saturating_sub(window_ms);
        let retained = members.split_off(&(min_score, String::new()));
        *members = retained;

        slot.expires_at = Some(
            self.clock
                .now_millis()
                .saturating_add(window_ms)
                .saturating_add(WINDOW_CLEANUP_GRACE_MS),
        );
        Ok(members.len() as u64)
    }

    async fn take_tokens(
        &self,
        key: &str,
        capacity: f64,
        refill_per_ms: f64,
        now_ms: u64,
        requested: f64,
    ) -> StoreResult<TokenTake> {
        let mut guard = self.slot(key, || Stored::Bucket {
            tokens: None,
            last: None,
        });
        let slot = &mut *guard;

        let Stored::Bucket { tokens, last } = &mut slot.value else {
            return Err(wrong_type(key));
        };
        let take = refill_and_take(
            tokens.unwrap_or(capacity),
            last.unwrap_or(now_ms),
            capacity,
            refill_per_ms,
            now_ms,
            requested,
        );
        *tokens = Some(take.tokens);
        *last = Some(last.map_or(now_ms, |last| last.max(now_ms)));

        slot.expires_at = Some(self.clock.now_millis().saturating_add(TOKEN_STATE_TTL_MS));
        Ok(take)
    }

    async fn queue_len(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now_millis();
        let Some(slot) = self.slots.get(key) else {
            return Ok(0);
        };
        match &slot.value {
            _ if slot.is_expired(now) => Ok(0),
            Stored::List(items) => Ok(items.len() as u64),
            _ => Err(wrong_type(key)),
        }
    }

    async fn queue_push(&self, key: &str, item: &str) -> StoreResult<()> {
        let mut guard = self.slot(key, || Stored::List(VecDeque::new()));
        match &mut guard.value {
            Stored::List(items) => {
                items.push_back(item.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn queue_pop(&self, key: &str) -> StoreResult<Option<String>> {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(None);
        };
        if slot.is_expired(self.clock.now_millis()) {
            drop(slot);
            self.slots.remove(key);
            return Ok(None);
        }

        let Stored::List(items) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        let item = items.pop_front();
        let drained = items.is_empty();
        drop(slot);

        // Emptied lists disappear, as they do in Redis
        if drained {
            self.slots
                .remove_if(key, |_, slot| matches!(&slot.value, Stored::List(items) if items.is_empty()));
        }
        Ok(item)
    }
}
