use crate::backend::DispatchBackend;
use crate::sharding::{ShardIndices, ShardingSpec};
use crate::signature::DType;

/// Shape and dtype carrier attached to a compiled artifact's outputs.
#[derive(new, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AbstractValue {
    shape: Vec<usize>,
    dtype: DType,
}

impl AbstractValue {
    /// Dimensions of the logical array.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type of the logical array.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Rank of the logical array.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Element count, the product of all dimensions.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One logical output array backed by one buffer per device.
///
/// The wrapper owns its buffer sequence; the underlying device memory is
/// shared by reference and may back several wrappers across calls. The
/// materialized-value and one-replica slots are write-once caches, cleared
/// only when the buffer sequence is replaced.
#[derive(new)]
pub struct ShardedArray<B: DispatchBackend> {
    aval: AbstractValue,
    sharding_spec: ShardingSpec,
    device_buffers: Vec<B::Buffer>,
    indices: ShardIndices,
    #[new(default)]
    materialized: Option<B::Arg>,
    #[new(default)]
    one_replica_indices: Option<Vec<usize>>,
}

impl<B: DispatchBackend> ShardedArray<B> {
    /// The abstract value describing the logical array.
    pub fn aval(&self) -> &AbstractValue {
        &self.aval
    }

    /// Dimensions of the logical array.
    pub fn shape(&self) -> &[usize] {
        self.aval.shape()
    }

    /// Element type of the logical array.
    pub fn dtype(&self) -> DType {
        self.aval.dtype()
    }

    /// Rank of the logical array.
    pub fn ndim(&self) -> usize {
        self.aval.ndim()
    }

    /// Element count, the product of all dimensions.
    pub fn size(&self) -> usize {
        self.aval.size()
    }

    /// How the array maps onto the device mesh.
    pub fn sharding_spec(&self) -> &ShardingSpec {
        &self.sharding_spec
    }

    /// The logical region each device buffer holds, in device order.
    pub fn indices(&self) -> &ShardIndices {
        &self.indices
    }

    /// The per-device buffers, in device order.
    pub fn device_buffers(&self) -> &[B::Buffer] {
        &self.device_buffers
    }

    /// Mutable access to the per-device buffers.
    ///
    /// The borrow may replace buffers in place, so both lazy caches are
    /// invalidated up front.
    pub fn device_buffers_mut(&mut self) -> &mut [B::Buffer] {
        self.materialized = None;
        self.one_replica_indices = None;
        &mut self.device_buffers
    }

    /// Replace the per-device buffers, invalidating the lazy caches.
    pub fn set_device_buffers(&mut self, buffers: Vec<B::Buffer>) {
        self.device_buffers = buffers;
        self.materialized = None;
        self.one_replica_indices = None;
    }

    /// The materialized whole-array value, if it has been computed.
    pub fn materialized(&self) -> Option<&B::Arg> {
        self.materialized.as_ref()
    }

    /// Store the materialized whole-array value computed by a collaborator.
    pub fn set_materialized(&mut self, value: B::Arg) -> &B::Arg {
        self.materialized.insert(value)
    }

    /// Buffer positions covering one full replica of the array.
    ///
    /// Derived from the shard indices on first access and cached until the
    /// buffers are replaced.
    pub fn one_replica_indices(&mut self) -> &[usize] {
        let indices = &self.indices;
        self.one_replica_indices
            .get_or_insert_with(|| indices.one_replica())
    }
}

impl<B: DispatchBackend> Clone for ShardedArray<B> {
    fn clone(&self) -> Self {
        Self {
            aval: self.aval.clone(),
            sharding_spec: self.sharding_spec.clone(),
            device_buffers: self.device_buffers.clone(),
            indices: self.indices.clone(),
            materialized: self.materialized.clone(),
            one_replica_indices: self.one_replica_indices.clone(),
        }
    }
}

impl<B: DispatchBackend> core::fmt::Debug for ShardedArray<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShardedArray")
            .field("aval", &self.aval)
            .field("sharding_spec", &self.sharding_spec)
            .field("num_buffers", &self.device_buffers.len())
            .field("materialized", &self.materialized.is_some())
            .finish()
    }
}
