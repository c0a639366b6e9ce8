//! CacheMachine: the ordered, threadsafe, bounded queue every kernel reads
//! from and writes to (spec ยง4.1). Guarded by a plain `Mutex` + `Condvar`
//! pair rather than a channel, since consumers need three distinct wait
//! predicates (`wait_for_next`, `wait_until_finished`, `wait_for_count`) over
//! the same piece of state -- a shape a channel doesn't expose directly.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::batch::CacheData;
use crate::config::CacheConfig;
use crate::errors::{Error, Result};
use crate::metrics::{CACHE_DEPTH_GAUGE_VEC, CACHE_ROWS_ADDED_COUNTER_VEC};

struct State {
    queue: VecDeque<CacheData>,
    finished: bool,
    rows_added: u64,
}

pub struct CacheMachine {
    /// Identifies the owning kernel for metrics and log lines; not used to
    /// keep the kernel alive (see DESIGN.md on the logging back-link).
    owner_kernel_id: String,
    config: CacheConfig,
    state: Mutex<State>,
    cv: Condvar,
}

impl CacheMachine {
    pub fn new(owner_kernel_id: impl Into<String>, config: CacheConfig) -> Self {
        CacheMachine {
            owner_kernel_id: owner_kernel_id.into(),
            config,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                finished: false,
                rows_added: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Appends `item` unless it is rejected: an empty batch is rejected when
    /// `allow_empty` is false and the cache was configured to drop empties.
    /// Blocks while the queue is already at `config.get_capacity()`, waking
    /// when `pull_cache_data` frees a slot. Returns whether the item was
    /// accepted.
    pub fn add_to_cache(&self, item: CacheData, allow_empty: bool) -> Result<bool> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(Error::closed_cache());
        }
        while state.queue.len() >= self.config.get_capacity() {
            self.cv.wait(&mut state);
            if state.finished {
                return Err(Error::closed_cache());
            }
        }
        if item.is_empty() && !allow_empty && self.config.drops_empty_batches() {
            return Ok(false);
        }
        state.queue.push_back(item);
        state.rows_added += 1;
        CACHE_DEPTH_GAUGE_VEC
            .with_label_values(&[&self.owner_kernel_id])
            .set(state.queue.len() as i64);
        CACHE_ROWS_ADDED_COUNTER_VEC
            .with_label_values(&[&self.owner_kernel_id])
            .inc();
        self.cv.notify_all();
        Ok(true)
    }

    /// Removes and returns the head item, or `None` if the cache is
    /// finished and drained. Blocks while the queue is empty but the
    /// producer has not yet called `finish()`.
    pub fn pull_cache_data(&self) -> Option<CacheData> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                CACHE_DEPTH_GAUGE_VEC
                    .with_label_values(&[&self.owner_kernel_id])
                    .set(state.queue.len() as i64);
                self.cv.notify_all();
                return Some(item);
            }
            if state.finished {
                return None;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Blocks until either an item is available (`true`) or the cache is
    /// finished and drained (`false`). Does not consume the item -- callers
    /// that want it still call `pull_cache_data`.
    pub fn wait_for_next(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if !state.queue.is_empty() {
                return true;
            }
            if state.finished {
                return false;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Marks the cache finished; no more items will be accepted. Idempotent.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        self.cv.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn wait_until_finished(&self) {
        let mut state = self.state.lock();
        while !state.finished {
            self.cv.wait(&mut state);
        }
    }

    /// Blocks until the cache has accepted at least `n` items in total --
    /// additions, not subtractions, so draining the queue never moves this
    /// backwards.
    pub fn wait_for_count(&self, n: u64) {
        let mut state = self.state.lock();
        while state.rows_added < n {
            self.cv.wait(&mut state);
        }
    }

    pub fn total_rows_added(&self) -> u64 {
        self.state.lock().rows_added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::CacheData;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn sample_batch(rows: &[i32]) -> CacheData {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, false)]));
        let array = Arc::new(Int32Array::from(rows.to_vec()));
        CacheData::from_batch(RecordBatch::try_new(schema, vec![array]).unwrap())
    }

    #[test]
    fn pull_returns_items_in_insertion_order() {
        let cache = CacheMachine::new("k0", CacheConfig::new());
        cache.add_to_cache(sample_batch(&[1]), true).unwrap();
        cache.add_to_cache(sample_batch(&[2]), true).unwrap();
        cache.finish();

        let first = cache.pull_cache_data().unwrap().materialize().unwrap();
        let second = cache.pull_cache_data().unwrap().materialize().unwrap();
        assert_eq!(first.column(0).as_ref(), sample_batch(&[1]).materialize().unwrap().column(0).as_ref());
        assert_eq!(second.column(0).as_ref(), sample_batch(&[2]).materialize().unwrap().column(0).as_ref());
        assert!(cache.pull_cache_data().is_none());
    }

    #[test]
    fn closed_cache_rejects_further_additions() {
        let cache = CacheMachine::new("k0", CacheConfig::new());
        cache.finish();
        let err = cache.add_to_cache(sample_batch(&[1]), true).unwrap_err();
        assert!(matches!(err.inner(), crate::errors::ErrorInner::ClosedCache));
    }

    #[test]
    fn empty_batches_dropped_unless_allowed() {
        let cache = CacheMachine::new("k0", CacheConfig::new().drop_empty_batches(true));
        let accepted = cache.add_to_cache(sample_batch(&[]), false).unwrap();
        assert!(!accepted);
        assert_eq!(cache.total_rows_added(), 0);
        let accepted = cache.add_to_cache(sample_batch(&[]), true).unwrap();
        assert!(accepted);
        assert_eq!(cache.total_rows_added(), 1);
    }

    #[test]
    fn wait_for_count_unblocks_once_threshold_reached() {
        let cache = Arc::new(CacheMachine::new("k0", CacheConfig::new()));
        let producer = {
            let cache = cache.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cache.add_to_cache(sample_batch(&[1]), true).unwrap();
                cache.add_to_cache(sample_batch(&[2]), true).unwrap();
            })
        };
        cache.wait_for_count(2);
        assert_eq!(cache.total_rows_added(), 2);
        producer.join().unwrap();
    }

    #[test]
    fn add_to_cache_blocks_until_capacity_frees_up() {
        let cache = Arc::new(CacheMachine::new("k0", CacheConfig::new().capacity(1)));
        cache.add_to_cache(sample_batch(&[1]), true).unwrap();

        let producer = {
            let cache = cache.clone();
            thread::spawn(move || {
                cache.add_to_cache(sample_batch(&[2]), true).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.total_rows_added(), 1, "second add should still be blocked on capacity");

        cache.pull_cache_data().unwrap();
        producer.join().unwrap();
        assert_eq!(cache.total_rows_added(), 2);
    }

    #[test]
    fn add_to_cache_wakes_with_closed_error_if_finished_while_blocked() {
        let cache = Arc::new(CacheMachine::new("k0", CacheConfig::new().capacity(1)));
        cache.add_to_cache(sample_batch(&[1]), true).unwrap();

        let closer = {
            let cache = cache.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cache.finish();
            })
        };
        let err = cache.add_to_cache(sample_batch(&[2]), true).unwrap_err();
        assert!(matches!(err.inner(), crate::errors::ErrorInner::ClosedCache));
        closer.join().unwrap();
    }

    #[test]
    fn wait_for_next_reports_drained_finish() {
        let cache = Arc::new(CacheMachine::new("k0", CacheConfig::new()));
        let producer = {
            let cache = cache.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cache.finish();
            })
        };
        assert!(!cache.wait_for_next());
        producer.join().unwrap();
    }
}
