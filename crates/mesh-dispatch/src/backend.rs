use crate::array::ShardedArray;
use crate::dispatch::{CompilationError, ExecutionError};
use crate::signature::{ArgSignature, SignatureError, StaticToken};
use std::sync::Arc;

/// Protocol version of the fast-path installation payload this crate
/// understands.
///
/// A forward-compatibility guard: a slow path built against a different
/// dispatch protocol declares a different version and is rejected instead of
/// silently misinterpreting the payload.
pub const FAST_PATH_VERSION: u32 = 1;

/// Types and argument introspection a runtime integration provides to the
/// dispatch layer.
pub trait DispatchBackend: Send + Sync + 'static {
    /// A host-side argument or materialized value.
    type Arg: Clone + Send + Sync;
    /// A per-device buffer handle. Cloning must be cheap, buffers are shared
    /// by reference across results.
    type Buffer: Clone + Send + Sync;
    /// The nested output container rebuilt by an [`OutputTree`].
    type Output: Send;

    /// Compute the dispatch signature of one dynamic argument.
    ///
    /// A failure is not surfaced to the caller; it routes the whole call to
    /// the slow path.
    fn arg_signature(
        &self,
        arg: &Self::Arg,
        wide_precision: bool,
    ) -> Result<ArgSignature, SignatureError>;

    /// Value token comparing a static argument across calls.
    fn static_token(&self, arg: &Self::Arg) -> StaticToken;
}

/// The non-cached computation path: argument flattening, compilation and
/// shard-layout derivation.
///
/// Invoked at most once per signature by the dispatch cache, and once per
/// call for signatures that resolved to fallback.
pub trait SlowPath<B: DispatchBackend>: Send + Sync {
    /// Run the call end to end, optionally returning the payload that enables
    /// the fast path for this call's signature.
    fn call(&self, args: &[B::Arg]) -> Result<SlowPathOutput<B>, CompilationError>;
}

/// What one slow-path invocation produces.
#[derive(new)]
pub struct SlowPathOutput<B: DispatchBackend> {
    /// The already-computed result of this call. Authoritative: the caller
    /// must return it as-is, arguments may have been donated while computing
    /// it.
    pub output: B::Output,
    /// Fast-path installation payload; `None` marks the signature as
    /// slow-path only.
    pub fast_path: Option<FastPathData<B>>,
}

/// Fast-path installation payload extracted from a slow-path invocation.
#[derive(new)]
pub struct FastPathData<B: DispatchBackend> {
    /// Declared payload protocol version, checked against
    /// [`FAST_PATH_VERSION`].
    pub version: u32,
    /// The compiled executable for this signature.
    pub executable: Arc<dyn ShardedExecutable<B>>,
    /// Argument and output converters for this signature.
    pub handlers: Arc<dyn ShardHandlers<B>>,
    /// Rebuilds the nested output from flat result leaves.
    pub out_tree: Arc<dyn OutputTree<B>>,
}

impl<B: DispatchBackend> Clone for FastPathData<B> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            executable: self.executable.clone(),
            handlers: self.handlers.clone(),
            out_tree: self.out_tree.clone(),
        }
    }
}

/// Argument and output converters installed alongside a compiled executable.
pub trait ShardHandlers<B: DispatchBackend>: Send + Sync {
    /// Convert the flat dynamic arguments into per-argument, per-device
    /// buffers, shaped `[num_args][num_devices]`.
    fn shard_args(&self, args: &[B::Arg]) -> Vec<Vec<B::Buffer>>;

    /// Convert per-output device buffer groups, shaped
    /// `[num_outputs][num_devices]`, into flat result leaves.
    fn build_outputs(&self, outputs: Vec<Vec<B::Buffer>>) -> Vec<ShardedArray<B>>;
}

/// A compiled artifact executable on every local device.
pub trait ShardedExecutable<B: DispatchBackend>: Send + Sync {
    /// Number of local devices this executable addresses.
    fn num_devices(&self) -> usize;

    /// Run the program on one device with that device's argument shards.
    fn execute_on_device(
        &self,
        device: usize,
        args: &[B::Buffer],
    ) -> Result<Vec<B::Buffer>, ExecutionError>;
}

/// Output-reconstruction descriptor: rebuilds the nested result container
/// from the flat sequence of result leaves.
pub trait OutputTree<B: DispatchBackend>: Send + Sync {
    /// Reassemble the nested output.
    fn unflatten(&self, leaves: Vec<ShardedArray<B>>) -> B::Output;
}
