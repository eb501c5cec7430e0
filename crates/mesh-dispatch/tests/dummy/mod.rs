#![allow(dead_code)]

//! Host-only fake backend: arguments are small host arrays, "device" buffers
//! are shards of them, and the compiled artifact is an elementwise adder.

use mesh_dispatch::{
    AbstractValue, ArgSignature, CompilationError, DType, DispatchBackend, ExecutionError,
    FastPathData, MeshMapping, OutputTree, ShardHandlers, ShardedArray, ShardedExecutable,
    Sharding, ShardingSpec, SignatureError, SlowPath, SlowPathOutput, StaticToken,
    FAST_PATH_VERSION,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Local device count of the fake mesh.
pub const NUM_DEVICES: usize = 2;

/// A host array with a declared dtype. Values are stored as `f32` regardless
/// of the declared dtype; only the signature cares about the distinction.
#[derive(Clone, Debug, PartialEq)]
pub struct HostArray {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl HostArray {
    pub fn f32(shape: Vec<usize>, values: &[f32]) -> Self {
        Self::with_dtype(DType::F32, shape, values)
    }

    pub fn with_dtype(dtype: DType, shape: Vec<usize>, values: &[f32]) -> Self {
        assert_eq!(shape.iter().product::<usize>(), values.len());
        Self {
            dtype,
            shape,
            data: values.to_vec(),
        }
    }

    /// A boolean scalar, typically used as a static argument.
    pub fn flag(value: bool) -> Self {
        Self {
            dtype: DType::Bool,
            shape: vec![],
            data: vec![if value { 1.0 } else { 0.0 }],
        }
    }

    /// Hashable view of the values, for static tokens.
    pub fn bits(&self) -> Vec<u32> {
        self.data.iter().map(|value| value.to_bits()).collect()
    }
}

pub struct DummyBackend;

impl DispatchBackend for DummyBackend {
    type Arg = HostArray;
    type Buffer = Arc<HostArray>;
    type Output = Vec<ShardedArray<DummyBackend>>;

    fn arg_signature(
        &self,
        arg: &Self::Arg,
        wide_precision: bool,
    ) -> Result<ArgSignature, SignatureError> {
        if arg.dtype == DType::Bool {
            return Err(SignatureError {
                reason: "boolean arguments have no device representation".into(),
            });
        }
        Ok(ArgSignature::new(
            arg.dtype.canonicalize(wide_precision),
            arg.shape.clone(),
            false,
        ))
    }

    fn static_token(&self, arg: &Self::Arg) -> StaticToken {
        StaticToken::new((arg.dtype, arg.shape.clone(), arg.bits()))
    }
}

/// Elementwise addition of all argument shards on one device.
pub struct AddExecutable {
    fail_remaining: AtomicUsize,
}

impl AddExecutable {
    pub fn reliable() -> Self {
        Self::flaky(0)
    }

    /// Fail the next `failures` device executions, then recover.
    pub fn flaky(failures: usize) -> Self {
        Self {
            fail_remaining: AtomicUsize::new(failures),
        }
    }
}

impl ShardedExecutable<DummyBackend> for AddExecutable {
    fn num_devices(&self) -> usize {
        NUM_DEVICES
    }

    fn execute_on_device(
        &self,
        device: usize,
        args: &[Arc<HostArray>],
    ) -> Result<Vec<Arc<HostArray>>, ExecutionError> {
        let injected = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(ExecutionError::DeviceFailure {
                device,
                reason: "injected device failure".into(),
            });
        }

        let mut acc = args[0].data.clone();
        for arg in &args[1..] {
            for (value, other) in acc.iter_mut().zip(&arg.data) {
                *value += other;
            }
        }
        Ok(vec![Arc::new(HostArray::with_dtype(
            args[0].dtype,
            args[0].shape.clone(),
            &acc,
        ))])
    }
}

/// Splits every argument's leading axis across the devices and rebuilds
/// outputs as leading-axis-chunked sharded arrays.
pub struct DummyHandlers;

impl ShardHandlers<DummyBackend> for DummyHandlers {
    fn shard_args(&self, args: &[HostArray]) -> Vec<Vec<Arc<HostArray>>> {
        args.iter().map(|arg| split_rows(arg, NUM_DEVICES)).collect()
    }

    fn build_outputs(
        &self,
        outputs: Vec<Vec<Arc<HostArray>>>,
    ) -> Vec<ShardedArray<DummyBackend>> {
        outputs.into_iter().map(assemble_sharded).collect()
    }
}

/// The flat leaves are the nested output.
pub struct IdentityTree;

impl OutputTree<DummyBackend> for IdentityTree {
    fn unflatten(&self, leaves: Vec<ShardedArray<DummyBackend>>) -> Vec<ShardedArray<DummyBackend>> {
        leaves
    }
}

pub enum SlowPathMode {
    /// Install an adder executable declaring the given payload version.
    Compile {
        version: u32,
        executable: Arc<AddExecutable>,
    },
    /// No fast path for any signature.
    FallbackOnly,
    /// Compilation fails.
    Fail(String),
}

/// Counting slow path over [`host_eval`].
pub struct DummySlowPath {
    calls: AtomicUsize,
    mode: SlowPathMode,
}

impl DummySlowPath {
    pub fn compiling() -> Self {
        Self::with_version(FAST_PATH_VERSION)
    }

    pub fn with_version(version: u32) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode: SlowPathMode::Compile {
                version,
                executable: Arc::new(AddExecutable::reliable()),
            },
        }
    }

    pub fn with_executable(executable: Arc<AddExecutable>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode: SlowPathMode::Compile {
                version: FAST_PATH_VERSION,
                executable,
            },
        }
    }

    pub fn fallback_only() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode: SlowPathMode::FallbackOnly,
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode: SlowPathMode::Fail(reason.into()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SlowPath<DummyBackend> for DummySlowPath {
    fn call(
        &self,
        args: &[HostArray],
    ) -> Result<SlowPathOutput<DummyBackend>, CompilationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            SlowPathMode::Fail(reason) => Err(CompilationError {
                reason: reason.clone(),
            }),
            SlowPathMode::FallbackOnly => Ok(SlowPathOutput::new(host_eval(args), None)),
            SlowPathMode::Compile {
                version,
                executable,
            } => {
                // Widen the race window for concurrent callers.
                std::thread::sleep(Duration::from_millis(20));
                Ok(SlowPathOutput::new(
                    host_eval(args),
                    Some(FastPathData::new(
                        *version,
                        executable.clone(),
                        Arc::new(DummyHandlers),
                        Arc::new(IdentityTree),
                    )),
                ))
            }
        }
    }
}

/// Reference result: elementwise sum of all non-boolean arguments, kept whole
/// on a single replicated buffer.
pub fn host_eval(args: &[HostArray]) -> Vec<ShardedArray<DummyBackend>> {
    let dynamic: Vec<&HostArray> = args.iter().filter(|arg| arg.dtype != DType::Bool).collect();
    let mut acc = dynamic[0].data.clone();
    for arg in &dynamic[1..] {
        for (value, other) in acc.iter_mut().zip(&arg.data) {
            *value += other;
        }
    }

    let result = HostArray::with_dtype(dynamic[0].dtype, dynamic[0].shape.clone(), &acc);
    let shape = result.shape.clone();
    let spec = ShardingSpec::new(vec![Sharding::NoSharding; shape.len()], vec![]).unwrap();
    let indices = spec.indices(&shape).unwrap();
    vec![ShardedArray::new(
        AbstractValue::new(shape, result.dtype),
        spec,
        vec![Arc::new(result)],
        indices,
    )]
}

/// Concatenate every output's shards back into flat host values.
pub fn collected(outputs: &[ShardedArray<DummyBackend>]) -> Vec<f32> {
    outputs
        .iter()
        .flat_map(|array| {
            array
                .device_buffers()
                .iter()
                .flat_map(|buffer| buffer.data.iter().copied())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn split_rows(arg: &HostArray, devices: usize) -> Vec<Arc<HostArray>> {
    let rows = arg.shape[0];
    assert_eq!(rows % devices, 0, "test arrays shard evenly");
    let shard_rows = rows / devices;
    let row_elems: usize = arg.shape[1..].iter().product();

    let mut shape = arg.shape.clone();
    shape[0] = shard_rows;
    arg.data
        .chunks(shard_rows * row_elems)
        .map(|values| Arc::new(HostArray::with_dtype(arg.dtype, shape.clone(), values)))
        .collect()
}

fn assemble_sharded(shards: Vec<Arc<HostArray>>) -> ShardedArray<DummyBackend> {
    let mut shape = shards[0].shape.clone();
    shape[0] *= shards.len();

    let mut sharding = vec![Sharding::NoSharding; shape.len()];
    sharding[0] = Sharding::Chunked {
        chunks: shards.len(),
    };
    let spec = ShardingSpec::new(sharding, vec![MeshMapping::ShardedAxis { axis: 0 }]).unwrap();
    let indices = spec.indices(&shape).unwrap();

    ShardedArray::new(
        AbstractValue::new(shape, shards[0].dtype),
        spec,
        shards,
        indices,
    )
}
