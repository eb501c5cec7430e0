#![warn(missing_docs)]

//! Memoized multi-device dispatch cache.
//!
//! A function that was jit-compiled once per distinct call shape is recognized
//! on repeat calls, its compiled artifact is fetched from an append-only cache
//! keyed by a structural [call signature](signature::CallSignature), and the
//! call is routed through device-sharded buffers without re-entering the
//! compilation path. Concurrent callers that race on the same signature are
//! coordinated with single-flight semantics: at most one thread compiles,
//! everyone else blocks on the entry's completion signal and shares the
//! installed artifact.
//!
//! Compilation itself, argument tree flattening and the device buffers are
//! external collaborators, reached through the traits in [`backend`].

#[macro_use]
extern crate derive_new;

mod cache;

/// Distributed array result wrapper.
pub mod array;
/// Collaborator traits and the fast-path installation payload.
pub mod backend;
/// Global configuration.
pub mod config;
/// The dispatch orchestrator.
pub mod dispatch;
/// Sharding specification value model.
pub mod sharding;
/// Call signatures and opaque tokens.
pub mod signature;
/// Process-wide and thread-local dispatch state.
pub mod state;

pub use array::{AbstractValue, ShardedArray};
pub use backend::{
    DispatchBackend, FastPathData, OutputTree, ShardHandlers, ShardedExecutable, SlowPath,
    SlowPathOutput, FAST_PATH_VERSION,
};
pub use dispatch::{
    execute_sharded, CompilationError, DispatchError, ExecutionError, FunctionInfo, MeshDispatch,
};
pub use sharding::{
    AxisSelector, InvalidShardingSpec, MeshMapping, ShardIndices, Sharding, ShardingSpec,
};
pub use signature::{ArgSignature, CallSignature, DType, OpaqueToken, SignatureError, StaticToken};
