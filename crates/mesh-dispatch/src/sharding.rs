use core::fmt::Display;
use thiserror::Error;

/// How one array axis is laid out across the device mesh.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Sharding {
    /// The axis is kept whole and replicated within its mesh dimension.
    NoSharding,
    /// The axis is split into `chunks` equal pieces along a mesh dimension.
    Chunked {
        /// Number of pieces the axis is split into.
        chunks: usize,
    },
    /// The axis is consumed entirely by a mesh dimension, one slice per index.
    Unstacked {
        /// Length of the axis, which equals the mesh dimension size.
        size: usize,
    },
}

impl Sharding {
    /// Whether a mesh dimension can draw a chunk coordinate from this axis.
    pub fn is_sharded(&self) -> bool {
        !matches!(self, Sharding::NoSharding)
    }
}

impl Display for Sharding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Sharding::NoSharding => write!(f, "NoSharding()"),
            Sharding::Chunked { chunks } => write!(f, "Chunked({chunks})"),
            Sharding::Unstacked { size } => write!(f, "Unstacked({size})"),
        }
    }
}

/// What one logical mesh axis of a [`ShardingSpec`] maps to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MeshMapping {
    /// The mesh axis enumerates the chunks of the sharded array axis `axis`.
    ShardedAxis {
        /// Index into the sharding descriptor sequence.
        axis: usize,
    },
    /// The mesh axis replicates the data `replicas` times.
    Replicated {
        /// Replication factor of this mesh axis.
        replicas: usize,
    },
}

impl Display for MeshMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MeshMapping::ShardedAxis { axis } => write!(f, "ShardedAxis(axis={axis})"),
            MeshMapping::Replicated { replicas } => write!(f, "Replicated(replicas={replicas})"),
        }
    }
}

/// Errors rejected at [`ShardingSpec`] construction or index derivation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidShardingSpec {
    /// A mesh mapping entry points outside the sharding descriptor sequence.
    #[error(
        "mesh mapping entry {entry} references axis {axis}, but the spec only has {len} sharding descriptors"
    )]
    AxisOutOfRange {
        /// Position of the offending mesh mapping entry.
        entry: usize,
        /// The referenced axis.
        axis: usize,
        /// Length of the sharding descriptor sequence.
        len: usize,
    },

    /// A mesh mapping entry references an axis that has no chunks to enumerate.
    #[error("mesh mapping entry {entry} references axis {axis}, which is not sharded")]
    AxisNotSharded {
        /// Position of the offending mesh mapping entry.
        entry: usize,
        /// The referenced axis.
        axis: usize,
    },

    /// Two mesh mapping entries enumerate the chunks of the same axis.
    #[error("mesh mapping entries {first} and {second} both reference axis {axis}")]
    AxisReused {
        /// Position of the first entry referencing the axis.
        first: usize,
        /// Position of the second entry referencing the axis.
        second: usize,
        /// The doubly-mapped axis.
        axis: usize,
    },

    /// The shape's rank differs from the number of sharding descriptors.
    #[error("the sharding spec describes {expected} axes, but the shape has rank {actual}")]
    RankMismatch {
        /// Number of sharding descriptors.
        expected: usize,
        /// Rank of the provided shape.
        actual: usize,
    },

    /// A chunked axis length is not divisible by its chunk count.
    #[error("axis {axis} of length {dim} cannot be split into {chunks} equal chunks")]
    UnevenChunks {
        /// The chunked axis.
        axis: usize,
        /// Length of the axis.
        dim: usize,
        /// Requested chunk count.
        chunks: usize,
    },

    /// An unstacked axis length differs from the declared unstack size.
    #[error("axis {axis} of length {dim} cannot be unstacked at size {size}")]
    UnstackedSizeMismatch {
        /// The unstacked axis.
        axis: usize,
        /// Length of the axis.
        dim: usize,
        /// Declared unstack size.
        size: usize,
    },
}

/// How one logical array maps onto the device mesh.
///
/// Immutable after construction. Equality and hashing are structural, so a
/// spec can participate in cache keys and be attached verbatim to results.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardingSpec {
    sharding: Vec<Sharding>,
    mesh_mapping: Vec<MeshMapping>,
}

impl ShardingSpec {
    /// Create a validated sharding spec.
    ///
    /// Every `ShardedAxis` entry must reference an in-range, sharded axis
    /// descriptor, and no axis may be referenced twice: a second entry would
    /// overwrite the first one's chunk coordinate during index derivation,
    /// mislabeling the layout.
    pub fn new(
        sharding: Vec<Sharding>,
        mesh_mapping: Vec<MeshMapping>,
    ) -> Result<Self, InvalidShardingSpec> {
        let mut referenced: Vec<(usize, usize)> = Vec::new();
        for (entry, mapping) in mesh_mapping.iter().enumerate() {
            if let MeshMapping::ShardedAxis { axis } = mapping {
                match sharding.get(*axis) {
                    None => {
                        return Err(InvalidShardingSpec::AxisOutOfRange {
                            entry,
                            axis: *axis,
                            len: sharding.len(),
                        });
                    }
                    Some(descriptor) if !descriptor.is_sharded() => {
                        return Err(InvalidShardingSpec::AxisNotSharded { entry, axis: *axis });
                    }
                    Some(_) => {}
                }
                if let Some((_, first)) = referenced.iter().find(|(seen, _)| seen == axis) {
                    return Err(InvalidShardingSpec::AxisReused {
                        first: *first,
                        second: entry,
                        axis: *axis,
                    });
                }
                referenced.push((*axis, entry));
            }
        }

        Ok(Self {
            sharding,
            mesh_mapping,
        })
    }

    /// The per-axis sharding descriptors.
    pub fn sharding(&self) -> &[Sharding] {
        &self.sharding
    }

    /// The logical mesh axes.
    pub fn mesh_mapping(&self) -> &[MeshMapping] {
        &self.mesh_mapping
    }

    /// Number of devices addressed by this spec, replicas included.
    pub fn num_devices(&self) -> usize {
        self.mesh_dims().product()
    }

    /// Derive the logical region each device holds for an array of `shape`.
    ///
    /// Devices are enumerated row-major over the mesh mapping dimensions, so
    /// the returned regions line up with a row-major device buffer sequence.
    pub fn indices(&self, shape: &[usize]) -> Result<ShardIndices, InvalidShardingSpec> {
        if shape.len() != self.sharding.len() {
            return Err(InvalidShardingSpec::RankMismatch {
                expected: self.sharding.len(),
                actual: shape.len(),
            });
        }
        for (axis, descriptor) in self.sharding.iter().enumerate() {
            match *descriptor {
                Sharding::Chunked { chunks } if shape[axis] % chunks != 0 => {
                    return Err(InvalidShardingSpec::UnevenChunks {
                        axis,
                        dim: shape[axis],
                        chunks,
                    });
                }
                Sharding::Unstacked { size } if shape[axis] != size => {
                    return Err(InvalidShardingSpec::UnstackedSizeMismatch {
                        axis,
                        dim: shape[axis],
                        size,
                    });
                }
                _ => {}
            }
        }

        let dims: Vec<usize> = self.mesh_dims().collect();
        let num_devices: usize = dims.iter().product();
        let mut regions = Vec::with_capacity(num_devices);

        for device in 0..num_devices {
            // Row-major mesh coordinates of this device.
            let mut remainder = device;
            let mut coords = vec![0; dims.len()];
            for (dim, size) in dims.iter().enumerate().rev() {
                coords[dim] = remainder % size;
                remainder /= size;
            }

            let mut region = vec![AxisSelector::Full; self.sharding.len()];
            for (entry, mapping) in self.mesh_mapping.iter().enumerate() {
                if let MeshMapping::ShardedAxis { axis } = mapping {
                    let coord = coords[entry];
                    region[*axis] = match self.sharding[*axis] {
                        Sharding::Chunked { chunks } => {
                            let chunk_size = shape[*axis] / chunks;
                            AxisSelector::Slice {
                                start: coord * chunk_size,
                                end: (coord + 1) * chunk_size,
                            }
                        }
                        Sharding::Unstacked { .. } => AxisSelector::Index(coord),
                        // Rejected at construction.
                        Sharding::NoSharding => AxisSelector::Full,
                    };
                }
            }
            regions.push(region);
        }

        Ok(ShardIndices { regions })
    }

    fn mesh_dims(&self) -> impl Iterator<Item = usize> + '_ {
        self.mesh_mapping.iter().map(|mapping| match *mapping {
            MeshMapping::ShardedAxis { axis } => match self.sharding[axis] {
                Sharding::Chunked { chunks } => chunks,
                Sharding::Unstacked { size } => size,
                // Rejected at construction.
                Sharding::NoSharding => 1,
            },
            MeshMapping::Replicated { replicas } => replicas,
        })
    }
}

impl Display for ShardingSpec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ShardingSpec(sharding=[")?;
        for (index, descriptor) in self.sharding.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, "{descriptor}")?;
        }
        write!(f, "], mesh_mapping=[")?;
        for (index, mapping) in self.mesh_mapping.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, "{mapping}")?;
        }
        write!(f, "])")
    }
}

/// Selection of one array axis within a device's [`ShardRegion`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AxisSelector {
    /// The device holds the whole axis.
    Full,
    /// The device holds `start..end` of the axis.
    Slice {
        /// First element held, inclusive.
        start: usize,
        /// Last element held, exclusive.
        end: usize,
    },
    /// The axis is consumed; the device holds the slice at this index.
    Index(usize),
}

/// The logical array region one device holds, one selector per axis.
pub type ShardRegion = Vec<AxisSelector>;

/// Per-device logical regions derived from a [`ShardingSpec`] and a shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardIndices {
    regions: Vec<ShardRegion>,
}

impl ShardIndices {
    /// The region each device holds, in device order.
    pub fn regions(&self) -> &[ShardRegion] {
        &self.regions
    }

    /// Number of device shards.
    pub fn num_shards(&self) -> usize {
        self.regions.len()
    }

    /// Device indices covering each distinct region exactly once.
    ///
    /// Selecting these buffers yields one full replica of the array.
    pub fn one_replica(&self) -> Vec<usize> {
        let mut seen: Vec<&ShardRegion> = Vec::new();
        let mut selected = Vec::new();
        for (device, region) in self.regions.iter().enumerate() {
            if !seen.contains(&region) {
                seen.push(region);
                selected.push(device);
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn chunked_spec() -> ShardingSpec {
        ShardingSpec::new(
            vec![Sharding::Chunked { chunks: 2 }, Sharding::NoSharding],
            vec![
                MeshMapping::ShardedAxis { axis: 0 },
                MeshMapping::Replicated { replicas: 2 },
            ],
        )
        .unwrap()
    }

    #[test]
    fn construction_rejects_out_of_range_axis() {
        let result = ShardingSpec::new(
            vec![Sharding::NoSharding],
            vec![MeshMapping::ShardedAxis { axis: 3 }],
        );

        assert_eq!(
            result.unwrap_err(),
            InvalidShardingSpec::AxisOutOfRange {
                entry: 0,
                axis: 3,
                len: 1
            }
        );
    }

    #[test]
    fn construction_rejects_unsharded_reference() {
        let result = ShardingSpec::new(
            vec![Sharding::NoSharding],
            vec![MeshMapping::ShardedAxis { axis: 0 }],
        );

        assert_eq!(
            result.unwrap_err(),
            InvalidShardingSpec::AxisNotSharded { entry: 0, axis: 0 }
        );
    }

    #[test]
    fn construction_rejects_a_doubly_mapped_axis() {
        // Two entries drawing from one chunked axis would claim 4 devices
        // while only 2 distinct regions exist.
        let result = ShardingSpec::new(
            vec![Sharding::Chunked { chunks: 2 }],
            vec![
                MeshMapping::ShardedAxis { axis: 0 },
                MeshMapping::ShardedAxis { axis: 0 },
            ],
        );

        assert_eq!(
            result.unwrap_err(),
            InvalidShardingSpec::AxisReused {
                first: 0,
                second: 1,
                axis: 0
            }
        );
    }

    #[test]
    fn round_trips_through_accessors() {
        let spec = chunked_spec();
        let rebuilt =
            ShardingSpec::new(spec.sharding().to_vec(), spec.mesh_mapping().to_vec()).unwrap();

        assert_eq!(spec, rebuilt);
    }

    #[test]
    fn equal_specs_hash_identically() {
        let mut set = HashSet::new();
        set.insert(chunked_spec());

        assert!(set.contains(&chunked_spec()));
        assert!(!set.contains(
            &ShardingSpec::new(
                vec![Sharding::Chunked { chunks: 4 }, Sharding::NoSharding],
                vec![MeshMapping::ShardedAxis { axis: 0 }],
            )
            .unwrap()
        ));
    }

    #[test]
    fn chunked_indices_cover_the_array() {
        let spec = chunked_spec();
        let indices = spec.indices(&[4, 3]).unwrap();

        assert_eq!(spec.num_devices(), 4);
        assert_eq!(
            indices.regions(),
            &[
                vec![AxisSelector::Slice { start: 0, end: 2 }, AxisSelector::Full],
                vec![AxisSelector::Slice { start: 0, end: 2 }, AxisSelector::Full],
                vec![AxisSelector::Slice { start: 2, end: 4 }, AxisSelector::Full],
                vec![AxisSelector::Slice { start: 2, end: 4 }, AxisSelector::Full],
            ]
        );
        assert_eq!(indices.one_replica(), vec![0, 2]);
    }

    #[test]
    fn unstacked_indices_consume_the_axis() {
        let spec = ShardingSpec::new(
            vec![Sharding::Unstacked { size: 3 }],
            vec![MeshMapping::ShardedAxis { axis: 0 }],
        )
        .unwrap();
        let indices = spec.indices(&[3]).unwrap();

        assert_eq!(
            indices.regions(),
            &[
                vec![AxisSelector::Index(0)],
                vec![AxisSelector::Index(1)],
                vec![AxisSelector::Index(2)],
            ]
        );
        assert_eq!(indices.one_replica(), vec![0, 1, 2]);
    }

    #[test]
    fn uneven_chunks_are_rejected() {
        let spec = ShardingSpec::new(
            vec![Sharding::Chunked { chunks: 2 }],
            vec![MeshMapping::ShardedAxis { axis: 0 }],
        )
        .unwrap();

        assert_eq!(
            spec.indices(&[5]).unwrap_err(),
            InvalidShardingSpec::UnevenChunks {
                axis: 0,
                dim: 5,
                chunks: 2
            }
        );
    }

    #[test]
    fn diagnostics_render_the_layout() {
        assert_eq!(
            chunked_spec().to_string(),
            "ShardingSpec(sharding=[Chunked(2),NoSharding()], \
             mesh_mapping=[ShardedAxis(axis=0),Replicated(replicas=2)])"
        );
    }
}
