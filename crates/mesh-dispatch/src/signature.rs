use core::any::{Any, TypeId};
use core::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// Element types understood by the dispatch layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 32-bit unsigned integer.
    U32,
    /// Boolean.
    Bool,
}

impl DType {
    /// Canonical dtype under the given precision mode.
    ///
    /// When wide precision is off, 64-bit types demote to their 32-bit
    /// counterparts so calls that only differ in declared width share one
    /// compiled artifact.
    pub fn canonicalize(self, wide_precision: bool) -> Self {
        if wide_precision {
            return self;
        }
        match self {
            DType::F64 => DType::F32,
            DType::I64 => DType::I32,
            other => other,
        }
    }
}

/// Shape, dtype and specialization flag of one dynamic argument.
#[derive(new, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArgSignature {
    /// Canonicalized element type.
    pub dtype: DType,
    /// Dimensions of the argument.
    pub shape: Vec<usize>,
    /// Whether the value's type is weakly held and may specialize further.
    pub weak_type: bool,
}

/// The argument-signature collaborator could not describe an argument.
///
/// Not a hard error: the orchestrator absorbs it and routes the call to the
/// slow path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot compute a dispatch signature for this argument\nCaused by:\n  {reason}")]
pub struct SignatureError {
    /// Why the argument could not be described.
    pub reason: String,
}

/// Identity-compared handle to an opaque configuration object.
///
/// Extra-context objects are expected to be stable for the process lifetime,
/// so pointer identity is the comparison contract: two tokens are equal when
/// they refer to the same allocation.
#[derive(Clone)]
pub struct OpaqueToken {
    value: Arc<dyn Any + Send + Sync>,
}

impl OpaqueToken {
    /// Wrap a configuration object into a token.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    /// Access the wrapped object when its concrete type is known.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.value) as *const () as usize
    }
}

impl PartialEq for OpaqueToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl Eq for OpaqueToken {}

impl Hash for OpaqueToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl core::fmt::Debug for OpaqueToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "OpaqueToken({:#x})", self.address())
    }
}

/// Value-compared key over a heterogeneous static argument.
///
/// Allows static arguments of different concrete types to live in a single
/// signature. Equality downcasts; hashing folds the type id with a
/// fixed-seed hash of the value so it stays reproducible across processes.
#[derive(Clone)]
pub struct StaticToken {
    value: Arc<dyn DynKey>,
}

impl StaticToken {
    /// Wrap a static argument descriptor into a token.
    pub fn new<T: 'static + PartialEq + Eq + Hash + core::fmt::Debug + Send + Sync>(
        value: T,
    ) -> Self {
        Self {
            value: Arc::new(value),
        }
    }
}

impl PartialEq for StaticToken {
    fn eq(&self, other: &Self) -> bool {
        self.value.dyn_eq(other.value.as_ref())
    }
}

impl Eq for StaticToken {}

impl Hash for StaticToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.dyn_type_id().hash(state);
        self.value.dyn_hash(state);
    }
}

impl core::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.value.fmt(f)
    }
}

/// Object-safe value equality and hashing for static argument keys.
trait DynKey: core::fmt::Debug + Send + Sync {
    fn dyn_type_id(&self) -> TypeId;
    fn dyn_eq(&self, other: &dyn DynKey) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn as_any(&self) -> &dyn Any;
}

impl<T: 'static + PartialEq + Eq + Hash + core::fmt::Debug + Send + Sync> DynKey for T {
    fn dyn_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn dyn_eq(&self, other: &dyn DynKey) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn dyn_hash(&self, state: &mut dyn Hasher) {
        // The outer hasher carries random per-process state; the value hash
        // must not, so signatures stay comparable to persisted hashes.
        let hash = foldhash::fast::FixedState::with_seed(0).hash_one(self);
        state.write_u64(hash);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Structural fingerprint of one invocation, used as the dispatch cache key.
///
/// Two calls with equal signatures are dispatchable to the same compiled
/// artifact without recompilation. Created once per call, never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallSignature {
    /// Descriptors of the dynamic arguments, in positional order.
    pub dynamic_args: Vec<ArgSignature>,
    /// Value tokens of the static arguments, in positional order.
    pub static_args: Vec<StaticToken>,
    /// Resolved wide-precision mode of the call.
    pub wide_precision: bool,
    /// Process-wide extra context at call time.
    pub global_context: Option<OpaqueToken>,
    /// Thread-local extra context at call time.
    pub local_context: Option<OpaqueToken>,
}
