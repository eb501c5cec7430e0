use crate::backend::{DispatchBackend, OutputTree, ShardHandlers, ShardedExecutable};
use crate::dispatch::{CompilationError, DispatchError};
use crate::signature::CallSignature;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// One-shot broadcast completion signal: a single writer fires it exactly
/// once, any number of waiters block until it has fired.
///
/// The notify acts as a release boundary and the wait as an acquire boundary,
/// so everything written before `notify` is visible to every woken waiter.
pub(crate) struct Notification {
    fired: AtomicBool,
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Fire the signal, waking every current and future waiter.
    pub fn notify(&self) {
        let mut done = self.state.lock().expect("notification mutex poisoned");
        *done = true;
        self.fired.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Whether the signal has fired, without blocking.
    pub fn is_notified(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Block until the signal fires. No timeout, no cancellation.
    pub fn wait(&self) {
        if self.is_notified() {
            return;
        }
        let mut done = self.state.lock().expect("notification mutex poisoned");
        while !*done {
            done = self
                .condvar
                .wait(done)
                .expect("notification mutex poisoned");
        }
    }
}

/// Terminal error recorded in a cache entry.
#[derive(Clone, Debug)]
pub(crate) enum EntryError {
    /// The slow path failed to compile; permanent for this signature.
    Compilation(CompilationError),
    /// The fast-path payload declared an unsupported protocol version. The
    /// entry is removed from the map; this outcome only wakes its waiters.
    Version {
        supported: u32,
        provided: u32,
    },
}

impl EntryError {
    pub fn into_dispatch(self) -> DispatchError {
        match self {
            EntryError::Compilation(err) => DispatchError::Compilation(err),
            EntryError::Version {
                supported,
                provided,
            } => DispatchError::IncompatibleFastPathVersion {
                supported,
                provided,
            },
        }
    }
}

/// Executable and handlers installed for one signature.
pub(crate) struct FastPathEntry<B: DispatchBackend> {
    pub executable: Arc<dyn ShardedExecutable<B>>,
    pub handlers: Arc<dyn ShardHandlers<B>>,
    pub out_tree: Arc<dyn OutputTree<B>>,
}

/// Terminal state of a cache entry.
pub(crate) enum EntryOutcome<B: DispatchBackend> {
    /// The compiled fast path is installed.
    Executable(FastPathEntry<B>),
    /// No fast path exists for this signature; every call takes the slow path.
    Fallback,
    /// Compilation (or installation) failed.
    Failed(EntryError),
}

/// Per-signature record with single-flight synchronization state.
///
/// Created pending by the thread that misses, resolved exactly once, never
/// transitions back. The outcome is fully written before the notification
/// fires.
pub(crate) struct CacheEntry<B: DispatchBackend> {
    complete: Notification,
    outcome: OnceLock<EntryOutcome<B>>,
}

impl<B: DispatchBackend> CacheEntry<B> {
    fn new() -> Self {
        Self {
            complete: Notification::new(),
            outcome: OnceLock::new(),
        }
    }

    /// Record the terminal state and wake every waiter. Must be called
    /// exactly once, by the thread that reserved the entry.
    pub fn resolve(&self, outcome: EntryOutcome<B>) {
        if self.outcome.set(outcome).is_err() {
            unreachable!("a cache entry resolves exactly once");
        }
        self.complete.notify();
    }

    /// Block until the entry is terminal, then read its outcome.
    pub fn wait(&self) -> &EntryOutcome<B> {
        self.complete.wait();
        self.outcome
            .get()
            .expect("a notified entry has an outcome")
    }
}

/// Result of a cache probe.
pub(crate) enum CacheLookup<B: DispatchBackend> {
    /// The signature is known; the entry may still be pending.
    Existing(Arc<CacheEntry<B>>),
    /// The signature was unknown; a pending entry was inserted and this
    /// thread now owns the slow-path invocation for it.
    Reserved(Arc<CacheEntry<B>>),
}

/// The per-function signature table. Append-only for the lifetime of the
/// dispatch object; the mutex is held only for probe/insert/remove, never
/// while waiting on an entry.
pub(crate) struct DispatchCache<B: DispatchBackend> {
    entries: spin::Mutex<HashMap<CallSignature, Arc<CacheEntry<B>>>>,
}

impl<B: DispatchBackend> DispatchCache<B> {
    pub fn new() -> Self {
        Self {
            entries: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Atomically find the entry for `signature`, reserving a pending one on
    /// miss. Reserving under the map lock is what guarantees at most one
    /// slow-path invocation per signature.
    pub fn lookup_or_reserve(&self, signature: &CallSignature) -> CacheLookup<B> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(signature) {
            return CacheLookup::Existing(entry.clone());
        }

        let entry = Arc::new(CacheEntry::new());
        entries.insert(signature.clone(), entry.clone());
        CacheLookup::Reserved(entry)
    }

    /// Forget a signature. Only used when a fast-path payload is rejected,
    /// which must never be cached.
    pub fn remove(&self, signature: &CallSignature) {
        self.entries.lock().remove(signature);
    }

    /// Number of distinct signatures seen.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether any signature has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
