//! The loop nest a kernel's one-dimensional domain `0 <= i < n` is lowered to.
//!
//! A [LoopNest] starts as the single loop `i` and is refined by splitting. After
//! the STREAM pipeline it has the form:
//!
//! ```text
//! i_outer        stride 2^18  extent ceil(n / 2^18)  group 0  slabs (0, 1)
//! i_inner_outer  stride 8     extent 2^15            sequential
//! i_inner_inner  stride 1     extent 8               lane 0
//! ```
//!
//! The global index is always `sum(stride * dim)` over all dimensions and each
//! dimension's stride equals the next inner dimension's stride times its extent,
//! so the dimensions below the outermost enumerate one block exactly once.

use crate::common::DimSize;

use itertools::Itertools;
use nonzero::nonzero as nz;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    /// Ordered outermost first. Never empty.
    dims: Vec<LoopDim>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDim {
    pub name: String,
    /// This dimension's coefficient in the global index.
    pub stride: DimSize,
    pub extent: Extent,
    pub tag: DimTag,
    pub slabs: Slabs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// `ceil(n / k)` iterations, where `n` is the symbolic domain size.
    CeilDiv(DimSize),
    Fixed(DimSize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimTag {
    Sequential,
    /// Dispatched to independent parallel tasks along the given grid axis.
    Group(u8),
    /// Mapped to SIMD program instances along the given axis.
    Lane(u8),
}

/// Iterations of a dimension emitted as separate, guarded paths: `head` at the
/// start of the range and `tail` at its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slabs {
    pub head: u8,
    pub tail: u8,
}

/// Which of the emitted code paths executes an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlabPath {
    /// Whole blocks; no bounds checks.
    Full,
    /// The final, possibly partial block (or every block, if the outermost
    /// dimension has no tail slab); every lane is bounds-checked.
    Boundary,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("No loop dimension named {0}")]
    UnknownDim(String),
    #[error("Loop dimension {name} already exists")]
    DuplicateDim { name: String },
    #[error("Cannot split {name} (extent {extent}) by {factor}: extent is not a multiple")]
    IndivisibleSplit {
        name: String,
        extent: DimSize,
        factor: DimSize,
    },
    #[error("Split factor must be greater than 1")]
    TrivialSplit,
    #[error("Stride of {0} overflows")]
    StrideOverflow(String),
    #[error("Slabs {0:?} are unsupported on {1}; only a single tail slab on the outermost dimension is")]
    UnsupportedSlabs(Slabs, String),
    #[error("{0} is tagged for group dispatch but is not the outermost dimension")]
    MisplacedGroup(String),
    #[error("{0} is tagged for lane dispatch but is not the innermost, fixed-extent dimension")]
    MisplacedLane(String),
    #[error("More than one dimension is tagged {0:?}")]
    DuplicateTag(DimTag),
}

impl LoopNest {
    /// The unsplit loop `0 <= iname < n`.
    pub fn new(iname: &str) -> Self {
        LoopNest {
            dims: vec![LoopDim {
                name: iname.to_string(),
                stride: nz!(1u32),
                extent: Extent::CeilDiv(nz!(1u32)),
                tag: DimTag::Sequential,
                slabs: Slabs::default(),
            }],
        }
    }

    pub fn dims(&self) -> &[LoopDim] {
        &self.dims
    }

    pub fn outermost(&self) -> &LoopDim {
        &self.dims[0]
    }

    pub fn get(&self, name: &str) -> Option<&LoopDim> {
        self.dims.iter().find(|d| d.name == name)
    }

    pub fn group_dim(&self) -> Option<&LoopDim> {
        self.dims
            .iter()
            .find(|d| matches!(d.tag, DimTag::Group(_)))
    }

    pub fn lane_dim(&self) -> Option<&LoopDim> {
        self.dims.iter().find(|d| matches!(d.tag, DimTag::Lane(_)))
    }

    /// Elements covered by one iteration of the outermost dimension.
    pub fn block_size(&self) -> DimSize {
        self.outermost().stride
    }

    pub fn has_tail_slab(&self) -> bool {
        self.outermost().slabs.tail > 0
    }

    /// Iterations of the outermost dimension for a domain of size `n`.
    pub fn block_count(&self, n: u32) -> u32 {
        n.div_ceil(self.block_size().get())
    }

    /// Outermost iterations which execute on the [SlabPath::Full] path.
    pub fn full_block_count(&self, n: u32) -> u32 {
        if self.dims.len() == 1 {
            self.block_count(n)
        } else if self.has_tail_slab() {
            n / self.block_size().get()
        } else {
            0
        }
    }

    /// Split dimension `name` into `{name}_outer` and `{name}_inner`, where the inner
    /// dimension has extent `factor`.
    pub fn split(
        &mut self,
        name: &str,
        factor: DimSize,
        outer_tag: DimTag,
        inner_tag: DimTag,
        slabs: Slabs,
    ) -> Result<(), ScheduleError> {
        let Some(idx) = self.dims.iter().position(|d| d.name == name) else {
            return Err(ScheduleError::UnknownDim(name.to_string()));
        };
        if factor.get() == 1 {
            return Err(ScheduleError::TrivialSplit);
        }
        let outer_name = format!("{name}_outer");
        let inner_name = format!("{name}_inner");
        for new_name in [&outer_name, &inner_name] {
            if self.get(new_name).is_some() {
                return Err(ScheduleError::DuplicateDim {
                    name: new_name.clone(),
                });
            }
        }
        if slabs.head != 0 || slabs.tail > 1 || (slabs.tail == 1 && idx != 0) {
            return Err(ScheduleError::UnsupportedSlabs(slabs, name.to_string()));
        }

        let original = &self.dims[idx];
        let outer_stride = original
            .stride
            .checked_mul(factor)
            .ok_or_else(|| ScheduleError::StrideOverflow(outer_name.clone()))?;
        let outer_extent = match original.extent {
            Extent::CeilDiv(_) => Extent::CeilDiv(outer_stride),
            Extent::Fixed(extent) => match DimSize::new(extent.get() / factor.get()) {
                Some(steps) if extent.get() % factor.get() == 0 => Extent::Fixed(steps),
                _ => {
                    return Err(ScheduleError::IndivisibleSplit {
                        name: name.to_string(),
                        extent,
                        factor,
                    })
                }
            },
        };
        let outer = LoopDim {
            name: outer_name,
            stride: outer_stride,
            extent: outer_extent,
            tag: outer_tag,
            slabs,
        };
        let inner = LoopDim {
            name: inner_name,
            stride: original.stride,
            extent: Extent::Fixed(factor),
            tag: inner_tag,
            slabs: Slabs::default(),
        };
        self.dims.splice(idx..=idx, [outer, inner]);
        Ok(())
    }

    /// Check that the nest has a shape code generators can lower: group dispatch
    /// only on the outermost dimension, lane dispatch only on the innermost, and
    /// at most one of each.
    pub fn check_emittable(&self) -> Result<(), ScheduleError> {
        for (idx, dim) in self.dims.iter().enumerate() {
            match dim.tag {
                DimTag::Group(_) if idx != 0 => {
                    return Err(ScheduleError::MisplacedGroup(dim.name.clone()))
                }
                DimTag::Lane(_)
                    if idx + 1 != self.dims.len() || matches!(dim.extent, Extent::CeilDiv(_)) =>
                {
                    return Err(ScheduleError::MisplacedLane(dim.name.clone()))
                }
                _ => {}
            }
        }
        if let Some(tag) = self
            .dims
            .iter()
            .map(|d| d.tag)
            .filter(|t| *t != DimTag::Sequential)
            .duplicates()
            .next()
        {
            return Err(ScheduleError::DuplicateTag(tag));
        }
        Ok(())
    }

    /// The global indices visited by the lowered loop nest for a domain of size
    /// `n`, in emission order, with the path that visits each.
    ///
    /// Boundary paths stop a sequential dimension as soon as its first visited index
    /// reaches `n` and mask off lanes at or beyond `n`, so only indices in `[0, n)`
    /// are returned.
    pub fn footprint(&self, n: u32) -> Vec<(SlabPath, u32)> {
        let mut visited = Vec::with_capacity(n as usize);
        self.for_each_index(n, |path, idx| visited.push((path, idx)));
        visited
    }

    /// Call `f` for each entry of [LoopNest::footprint], without collecting them.
    pub fn for_each_index<F: FnMut(SlabPath, u32)>(&self, n: u32, mut f: F) {
        let full_blocks = self.full_block_count(n);
        let block_size = self.block_size().get();
        for block in 0..self.block_count(n) {
            let path = if block < full_blocks {
                SlabPath::Full
            } else {
                SlabPath::Boundary
            };
            self.visit_inner(1, block * block_size, path, n, &mut f);
        }
    }

    fn visit_inner<F: FnMut(SlabPath, u32)>(
        &self,
        depth: usize,
        base: u32,
        path: SlabPath,
        n: u32,
        f: &mut F,
    ) {
        let Some(dim) = self.dims.get(depth) else {
            if path == SlabPath::Full || base < n {
                f(path, base);
            }
            return;
        };
        let Extent::Fixed(extent) = dim.extent else {
            unreachable!("only the outermost dimension has a symbolic extent");
        };
        for step in 0..extent.get() {
            let idx = base + dim.stride.get() * step;
            if path == SlabPath::Boundary && dim.tag == DimTag::Sequential && idx >= n {
                break;
            }
            self.visit_inner(depth + 1, idx, path, n, f);
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extent::CeilDiv(k) if k.get() == 1 => write!(f, "n"),
            Extent::CeilDiv(k) => write!(f, "ceil(n/{k})"),
            Extent::Fixed(e) => write!(f, "{e}"),
        }
    }
}

impl fmt::Display for DimTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimTag::Sequential => write!(f, "seq"),
            DimTag::Group(axis) => write!(f, "g.{axis}"),
            DimTag::Lane(axis) => write!(f, "l.{axis}"),
        }
    }
}
