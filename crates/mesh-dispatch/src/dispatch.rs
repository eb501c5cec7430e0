use crate::backend::{
    DispatchBackend, ShardedExecutable, SlowPath, SlowPathOutput, FAST_PATH_VERSION,
};
use crate::cache::{CacheEntry, CacheLookup, DispatchCache, EntryError, EntryOutcome, FastPathEntry};
use crate::config::GlobalConfig;
use crate::signature::{CallSignature, SignatureError};
use crate::state;
use core::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

/// The slow path failed to produce a compiled artifact.
///
/// Recorded once in the signature's cache entry and re-raised to every
/// waiter and every later call with that signature.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("compilation failed for this call signature\nCaused by:\n  {reason}")]
pub struct CompilationError {
    /// What went wrong in the slow path.
    pub reason: String,
}

/// Errors surfaced while executing a compiled artifact across devices.
///
/// Never cached: execution failures may be argument-dependent, so a later
/// call with the same signature retries fresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// A device failed while running its shard of the program.
    #[error("device {device} failed during sharded execution\nCaused by:\n  {reason}")]
    DeviceFailure {
        /// The failing device.
        device: usize,
        /// What the device reported.
        reason: String,
    },

    /// A device ran out of memory.
    #[error("device {device} is out of memory\nCaused by:\n  {reason}")]
    OutOfMemory {
        /// The failing device.
        device: usize,
        /// What the device reported.
        reason: String,
    },

    /// The sharded buffers do not line up with the executable's layout.
    #[error("the sharded buffers are malformed\nCaused by:\n  {reason}")]
    MalformedShards {
        /// Which invariant the buffers violate.
        reason: String,
    },
}

/// Errors surfaced by [`MeshDispatch::call`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The slow path handed back a fast-path payload for a protocol this
    /// dispatcher does not speak. Raised immediately, never cached.
    #[error(
        "the fast path payload declares protocol version {provided}, but this dispatcher supports version {supported}"
    )]
    IncompatibleFastPathVersion {
        /// The version this dispatcher supports.
        supported: u32,
        /// The version the payload declared.
        provided: u32,
    },

    /// A compilation error happened during dispatch.
    #[error("a compilation error happened during dispatch\nCaused by:\n  {0}")]
    Compilation(#[from] CompilationError),

    /// An execution error happened during dispatch.
    #[error("an execution error happened during dispatch\nCaused by:\n  {0}")]
    Execution(#[from] ExecutionError),
}

/// Introspection handle describing the wrapped function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionInfo {
    name: String,
}

impl FunctionInfo {
    /// Describe a function by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The wrapped function's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for FunctionInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Execute a compiled artifact across all local devices.
///
/// `args` is argument-major, shaped `[num_args][num_devices]`; the result is
/// output-major, shaped `[num_outputs][num_devices]`. The transposition to
/// device-major and back lives here so handler output and result assembly
/// stay consistent with the sharding model.
pub fn execute_sharded<B: DispatchBackend>(
    executable: &dyn ShardedExecutable<B>,
    args: Vec<Vec<B::Buffer>>,
) -> Result<Vec<Vec<B::Buffer>>, ExecutionError> {
    let num_devices = executable.num_devices();
    for (index, shards) in args.iter().enumerate() {
        if shards.len() != num_devices {
            return Err(ExecutionError::MalformedShards {
                reason: format!(
                    "argument {index} has {} shards for {num_devices} devices",
                    shards.len()
                ),
            });
        }
    }

    let mut outputs: Vec<Vec<B::Buffer>> = Vec::new();
    for device in 0..num_devices {
        let device_args: Vec<B::Buffer> =
            args.iter().map(|shards| shards[device].clone()).collect();
        let device_outputs = executable.execute_on_device(device, &device_args)?;

        if device == 0 {
            outputs = device_outputs
                .into_iter()
                .map(|buffer| {
                    let mut shards = Vec::with_capacity(num_devices);
                    shards.push(buffer);
                    shards
                })
                .collect();
        } else {
            if device_outputs.len() != outputs.len() {
                return Err(ExecutionError::MalformedShards {
                    reason: format!(
                        "device {device} produced {} outputs, expected {}",
                        device_outputs.len(),
                        outputs.len()
                    ),
                });
            }
            for (shards, buffer) in outputs.iter_mut().zip(device_outputs) {
                shards.push(buffer);
            }
        }
    }

    Ok(outputs)
}

/// Memoized multi-device dispatcher for one function.
///
/// Bookkeeps the signatures seen for the wrapped function and routes each
/// call either through a cached compiled artifact or through the slow path.
/// Thread-safe; calls execute on the calling thread.
pub struct MeshDispatch<B: DispatchBackend> {
    backend: B,
    function: FunctionInfo,
    slow_path: Arc<dyn SlowPath<B>>,
    // Positions of the static arguments, sorted and deduplicated.
    static_args: Vec<usize>,
    always_fallback: bool,
    cache: DispatchCache<B>,
}

impl<B: DispatchBackend> MeshDispatch<B> {
    /// Create a dispatcher for one function.
    ///
    /// `static_args` lists the positions of the arguments excluded from the
    /// dynamic signature and compared by value instead. The always-fallback
    /// flag is fixed here from the global configuration.
    pub fn new(
        backend: B,
        function: FunctionInfo,
        slow_path: Arc<dyn SlowPath<B>>,
        mut static_args: Vec<usize>,
    ) -> Self {
        static_args.sort_unstable();
        static_args.dedup();
        let always_fallback = GlobalConfig::get().dispatch.force_fallback;

        Self {
            backend,
            function,
            slow_path,
            static_args,
            always_fallback,
            cache: DispatchCache::new(),
        }
    }

    /// Declare that no fast path exists for this function; every call takes
    /// the slow path and the cache stays empty.
    pub fn fallback_only(mut self) -> Self {
        self.always_fallback = true;
        self
    }

    /// The wrapped function's introspection handle.
    pub fn function(&self) -> &FunctionInfo {
        &self.function
    }

    /// Number of distinct call signatures seen so far.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Whether any call signature has been recorded yet.
    pub fn cache_is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Dispatch one call.
    ///
    /// On the first call with a given signature the slow path compiles and
    /// its result is returned as-is; repeat calls reuse the installed
    /// executable. Concurrent callers racing on one signature trigger exactly
    /// one slow-path invocation.
    pub fn call(&self, args: &[B::Arg]) -> Result<B::Output, DispatchError> {
        if self.always_fallback {
            return self.slow_path_only(args);
        }

        let signature = match self.signature(args) {
            Ok(signature) => signature,
            Err(err) => {
                log::debug!("falling back to the slow path for `{}`: {err}", self.function);
                return self.slow_path_only(args);
            }
        };

        match self.cache.lookup_or_reserve(&signature) {
            CacheLookup::Reserved(entry) => self.compile(&signature, &entry, args),
            CacheLookup::Existing(entry) => match entry.wait() {
                EntryOutcome::Failed(err) => Err(err.clone().into_dispatch()),
                EntryOutcome::Fallback => self.slow_path_only(args),
                EntryOutcome::Executable(fast) => self.run_fast_path(fast, args),
            },
        }
    }

    fn slow_path_only(&self, args: &[B::Arg]) -> Result<B::Output, DispatchError> {
        Ok(self.slow_path.call(args)?.output)
    }

    /// Compute this call's signature; any argument the backend cannot
    /// describe aborts the computation.
    fn signature(&self, args: &[B::Arg]) -> Result<CallSignature, SignatureError> {
        let wide_precision = state::resolved_wide_precision();

        let mut dynamic_args = Vec::with_capacity(args.len());
        let mut static_args = Vec::with_capacity(self.static_args.len());
        for (position, arg) in args.iter().enumerate() {
            if self.static_args.binary_search(&position).is_ok() {
                static_args.push(self.backend.static_token(arg));
            } else {
                dynamic_args.push(self.backend.arg_signature(arg, wide_precision)?);
            }
        }

        Ok(CallSignature {
            dynamic_args,
            static_args,
            wide_precision,
            global_context: state::global_extra_context(),
            local_context: state::local_extra_context(),
        })
    }

    /// This thread reserved the entry: run the slow path once and install the
    /// terminal state for every waiter.
    fn compile(
        &self,
        signature: &CallSignature,
        entry: &CacheEntry<B>,
        args: &[B::Arg],
    ) -> Result<B::Output, DispatchError> {
        log::debug!(
            "dispatch cache miss for `{}`, taking the slow path",
            self.function
        );

        match self.slow_path.call(args) {
            Err(err) => {
                entry.resolve(EntryOutcome::Failed(EntryError::Compilation(err.clone())));
                Err(err.into())
            }
            Ok(SlowPathOutput {
                output,
                fast_path: None,
            }) => {
                log::debug!(
                    "no fast path for `{}`, signature marked slow-path only",
                    self.function
                );
                entry.resolve(EntryOutcome::Fallback);
                Ok(output)
            }
            Ok(SlowPathOutput {
                fast_path: Some(data),
                ..
            }) if data.version != FAST_PATH_VERSION => {
                // Never cached: forget the signature, then wake the waiters
                // with the same error.
                self.cache.remove(signature);
                entry.resolve(EntryOutcome::Failed(EntryError::Version {
                    supported: FAST_PATH_VERSION,
                    provided: data.version,
                }));
                Err(DispatchError::IncompatibleFastPathVersion {
                    supported: FAST_PATH_VERSION,
                    provided: data.version,
                })
            }
            Ok(SlowPathOutput {
                output,
                fast_path: Some(data),
            }) => {
                entry.resolve(EntryOutcome::Executable(FastPathEntry {
                    executable: data.executable,
                    handlers: data.handlers,
                    out_tree: data.out_tree,
                }));
                // The slow path already ran the computation. Re-executing here
                // could observe donated (invalidated) argument buffers.
                Ok(output)
            }
        }
    }

    fn run_fast_path(
        &self,
        fast: &FastPathEntry<B>,
        args: &[B::Arg],
    ) -> Result<B::Output, DispatchError> {
        let dynamic = self.dynamic_args(args);
        let sharded = fast.handlers.shard_args(&dynamic);
        let outputs = execute_sharded::<B>(fast.executable.as_ref(), sharded)?;
        let leaves = fast.handlers.build_outputs(outputs);
        Ok(fast.out_tree.unflatten(leaves))
    }

    fn dynamic_args(&self, args: &[B::Arg]) -> Vec<B::Arg> {
        args.iter()
            .enumerate()
            .filter(|(position, _)| self.static_args.binary_search(position).is_err())
            .map(|(_, arg)| arg.clone())
            .collect()
    }
}
