//! Executor and cache-machine configuration, built the way `tikv_util`'s
//! worker pool exposes a `Builder` rather than free-standing constructor
//! arguments.

const DEFAULT_THREAD_COUNT: usize = 4;
const DEFAULT_PENDING_CAPACITY: usize = usize::MAX;
const DEFAULT_CACHE_CAPACITY: usize = usize::MAX;

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    thread_count: usize,
    pending_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            thread_count: DEFAULT_THREAD_COUNT,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    #[must_use]
    pub fn pending_capacity(mut self, pending_capacity: usize) -> Self {
        self.pending_capacity = pending_capacity;
        self
    }

    pub fn get_thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn get_pending_capacity(&self) -> usize {
        self.pending_capacity
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    capacity: usize,
    drop_empty_batches: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: DEFAULT_CACHE_CAPACITY,
            drop_empty_batches: false,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// When set, `CacheMachine::add_to_cache` rejects empty batches unless
    /// the caller explicitly passes `allow_empty = true`.
    #[must_use]
    pub fn drop_empty_batches(mut self, drop: bool) -> Self {
        self.drop_empty_batches = drop;
        self
    }

    pub fn get_capacity(&self) -> usize {
        self.capacity
    }

    pub fn drops_empty_batches(&self) -> bool {
        self.drop_empty_batches
    }
}
