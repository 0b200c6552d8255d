//! Keyed state with reverse and incremental logs.
//!
//! A stateful unit's state is a key to value map. Every mutation in batch
//! `b` records the key's pre-image in `reverse_log[b]` (first touch only)
//! and its post-image in `incremental_log[b]`. Committing `b` discards both
//! sub-maps; a survivor rollback walks the reverse log backwards instead.
//! The pre-image `0` is the sentinel for "did not exist before this batch":
//! rolling back such an entry deletes the key.

use crate::functions::Reducer;
use crate::message::STATE_NOT_FOUND;
use std::collections::{BTreeMap, HashMap};

/// Pre-image sentinel: the key did not exist before the batch touched it.
pub const ABSENT_PRE_IMAGE: i64 = 0;

/// Keyed state plus the per-batch reverse and incremental logs.
#[derive(Debug, Default)]
pub struct StateTable {
    state: HashMap<String, i64>,
    reverse_log: HashMap<i64, HashMap<String, i64>>,
    incremental_log: HashMap<i64, HashMap<String, i64>>,
}

impl StateTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one message to the key's state under the given reducer,
    /// recording pre- and post-images for the batch. Returns the post-image.
    pub fn apply(&mut self, batch_id: i64, key: &str, value: i64, reducer: &dyn Reducer) -> i64 {
        let prior = self.state.get(key).copied();
        self.reverse_log
            .entry(batch_id)
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| prior.unwrap_or(ABSENT_PRE_IMAGE));
        let post = reducer.reduce(prior, value);
        self.state.insert(key.to_string(), post);
        self.incremental_log
            .entry(batch_id)
            .or_default()
            .insert(key.to_string(), post);
        post
    }

    /// Current value for a key, or the not-found sentinel.
    pub fn get(&self, key: &str) -> i64 {
        self.state.get(key).copied().unwrap_or(STATE_NOT_FOUND)
    }

    /// Pre-image recorded for a key in a batch's reverse sub-map, or the
    /// not-found sentinel if the sub-map or entry is gone.
    pub fn reverse_image(&self, batch_id: i64, key: &str) -> i64 {
        self.reverse_log
            .get(&batch_id)
            .and_then(|log| log.get(key))
            .copied()
            .unwrap_or(STATE_NOT_FOUND)
    }

    /// Post-image recorded for a key in a batch's incremental sub-map, or
    /// the not-found sentinel.
    pub fn incremental_image(&self, batch_id: i64, key: &str) -> i64 {
        self.incremental_log
            .get(&batch_id)
            .and_then(|log| log.get(key))
            .copied()
            .unwrap_or(STATE_NOT_FOUND)
    }

    /// True while the batch has an incremental sub-map (not yet committed).
    pub fn has_incremental_batch(&self, batch_id: i64) -> bool {
        self.incremental_log.contains_key(&batch_id)
    }

    /// Drops both per-batch sub-maps after the batch commits.
    pub fn discard_batch(&mut self, batch_id: i64) {
        self.reverse_log.remove(&batch_id);
        self.incremental_log.remove(&batch_id);
    }

    /// Survivor rollback: walks the reverse log backwards from the highest
    /// logged batch down to `target + 1`, restoring each key's pre-image
    /// (deleting keys whose pre-image is the absent sentinel), and discards
    /// the rolled-back sub-maps.
    pub fn rollback(&mut self, target: i64) {
        let mut batches: Vec<i64> = self
            .reverse_log
            .keys()
            .copied()
            .filter(|b| *b > target)
            .collect();
        batches.sort_unstable_by(|a, b| b.cmp(a));
        for batch in batches {
            if let Some(log) = self.reverse_log.remove(&batch) {
                for (key, pre_image) in log {
                    if pre_image == ABSENT_PRE_IMAGE {
                        self.state.remove(&key);
                    } else {
                        self.state.insert(key, pre_image);
                    }
                }
            }
            self.incremental_log.remove(&batch);
        }
    }

    /// Clears state and both logs (recovery to "nothing committed yet").
    pub fn clear(&mut self) {
        self.state.clear();
        self.reverse_log.clear();
        self.incremental_log.clear();
    }

    /// Full-state snapshot for a checkpoint record.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.state.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Post-image entries of one batch for an incremental record.
    pub fn incremental_entries(&self, batch_id: i64) -> BTreeMap<String, i64> {
        self.incremental_log
            .get(&batch_id)
            .map(|log| log.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    /// Replaces state with reconstructed entries and clears both logs
    /// (failed-unit recovery).
    pub fn restore(&mut self, entries: BTreeMap<String, i64>) {
        self.state = entries.into_iter().collect();
        self.reverse_log.clear();
        self.incremental_log.clear();
    }

    /// Number of live keys (diagnostic).
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// True when no key is live.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}
