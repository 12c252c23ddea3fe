use crate::common::{DimSize, Dtype, BLOCK_SIZE, LANE_WIDTH, LOOP_INDEX, SIZE_PARAM};
use crate::kernel::{Assumption, KernelDescriptor};
use crate::schedule::{DimTag, ScheduleError, Slabs};

use enum_dispatch::enum_dispatch;
use indexmap::IndexMap;
use itertools::Itertools;
use log::debug;
use std::fmt;

#[enum_dispatch]
pub trait TransformT {
    /// Rewrite a descriptor. Transforms are pure: the input is consumed and a new
    /// descriptor (or an error) is returned.
    fn apply(&self, knl: KernelDescriptor) -> Result<KernelDescriptor, TransformError>;
}

/// A rewrite of a [KernelDescriptor].
///
/// The set of transforms is closed; a pipeline is an ordered slice of them applied
/// with [apply_transforms].
#[derive(Debug, Clone, PartialEq)]
#[enum_dispatch(TransformT)]
pub enum Transform {
    /// Record a precondition on the domain size.
    Assume(Assume),
    /// Split a loop dimension into an outer and inner dimension.
    Split(Split),
    /// Mark every statement's write as a non-temporal store.
    TagStreamingStore(TagStreamingStore),
    /// Assign an element type to operands.
    InferTypes(InferTypes),
    /// Fix the parameter order of the generated unit.
    FixArgumentOrder(FixArgumentOrder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assume(pub Assumption);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub iname: String,
    pub factor: DimSize,
    pub outer_tag: DimTag,
    pub inner_tag: DimTag,
    pub slabs: Slabs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagStreamingStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferTypes {
    pub dtypes: IndexMap<String, Dtype>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixArgumentOrder {
    pub order: Vec<String>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TransformError {
    #[error("Kernel {kernel}: {source}")]
    Schedule {
        kernel: String,
        #[source]
        source: ScheduleError,
    },
    #[error("Kernel {kernel}: operand {operand} is used but has no type")]
    MissingType { kernel: String, operand: String },
    #[error("Kernel {kernel} has no operand named {operand}")]
    UnknownOperand { kernel: String, operand: String },
    #[error("Kernel {kernel}: operand {operand} is already typed {existing}, not {requested}")]
    ConflictingType {
        kernel: String,
        operand: String,
        existing: Dtype,
        requested: Dtype,
    },
    #[error("Kernel {kernel}: argument {name} appears more than once in the argument order")]
    DuplicateArgument { kernel: String, name: String },
    #[error("Kernel {kernel}: argument {name} is missing from the argument order")]
    MissingArgument { kernel: String, name: String },
}

/// The transforms applied to every STREAM kernel, in order.
///
/// `operands` is the comma-separated operand list the kernel was declared with;
/// names are trimmed. It determines both the typed operands and the leading
/// parameters of the generated unit.
pub fn stream_pipeline(operands: &str, dtype: Dtype, streaming_stores: bool) -> Vec<Transform> {
    let names = operands
        .split(',')
        .map(|v| v.trim().to_string())
        .collect::<Vec<_>>();

    let mut transforms = vec![
        Transform::Assume(Assume(Assumption::SizePositive)),
        Transform::Split(Split {
            iname: LOOP_INDEX.to_string(),
            factor: BLOCK_SIZE,
            outer_tag: DimTag::Group(0),
            inner_tag: DimTag::Sequential,
            slabs: Slabs { head: 0, tail: 1 },
        }),
        Transform::Split(Split {
            iname: format!("{LOOP_INDEX}_inner"),
            factor: LANE_WIDTH,
            outer_tag: DimTag::Sequential,
            inner_tag: DimTag::Lane(0),
            slabs: Slabs::default(),
        }),
    ];
    if streaming_stores {
        transforms.push(Transform::TagStreamingStore(TagStreamingStore));
    }
    transforms.push(Transform::InferTypes(InferTypes {
        dtypes: names.iter().map(|v| (v.clone(), dtype)).collect(),
    }));
    transforms.push(Transform::FixArgumentOrder(FixArgumentOrder {
        order: names
            .into_iter()
            .chain(std::iter::once(SIZE_PARAM.to_string()))
            .collect(),
    }));
    transforms
}

/// Apply `transforms` to `knl` in order, stopping at the first error.
pub fn apply_transforms(
    knl: KernelDescriptor,
    transforms: &[Transform],
) -> Result<KernelDescriptor, TransformError> {
    transforms.iter().try_fold(knl, |knl, transform| {
        debug!("Applying {} to {}", transform, knl.name);
        transform.apply(knl)
    })
}

impl TransformT for Assume {
    fn apply(&self, mut knl: KernelDescriptor) -> Result<KernelDescriptor, TransformError> {
        if !knl.assumes(self.0) {
            knl.domain.assumptions.push(self.0);
        }
        Ok(knl)
    }
}

impl TransformT for Split {
    fn apply(&self, mut knl: KernelDescriptor) -> Result<KernelDescriptor, TransformError> {
        if let Err(source) = knl.nest.split(
            &self.iname,
            self.factor,
            self.outer_tag,
            self.inner_tag,
            self.slabs,
        ) {
            return Err(TransformError::Schedule {
                kernel: knl.name,
                source,
            });
        }
        Ok(knl)
    }
}

impl TransformT for TagStreamingStore {
    fn apply(&self, mut knl: KernelDescriptor) -> Result<KernelDescriptor, TransformError> {
        // Each statement writes element `i` of its destination exactly once.
        for statement in &mut knl.statements {
            statement.streaming_store = true;
        }
        Ok(knl)
    }
}

impl TransformT for InferTypes {
    fn apply(&self, mut knl: KernelDescriptor) -> Result<KernelDescriptor, TransformError> {
        for (name, &dtype) in &self.dtypes {
            let Some(operand) = knl.operands.get_mut(name) else {
                return Err(TransformError::UnknownOperand {
                    kernel: knl.name,
                    operand: name.clone(),
                });
            };
            match operand.dtype {
                Some(existing) if existing != dtype => {
                    return Err(TransformError::ConflictingType {
                        kernel: knl.name,
                        operand: name.clone(),
                        existing,
                        requested: dtype,
                    });
                }
                _ => operand.dtype = Some(dtype),
            }
        }

        let untyped = knl
            .referenced_operands()
            .into_iter()
            .find(|name| knl.operands.get(*name).and_then(|o| o.dtype).is_none())
            .map(str::to_string);
        if let Some(operand) = untyped {
            return Err(TransformError::MissingType {
                kernel: knl.name,
                operand,
            });
        }
        Ok(knl)
    }
}

impl TransformT for FixArgumentOrder {
    fn apply(&self, mut knl: KernelDescriptor) -> Result<KernelDescriptor, TransformError> {
        if let Some(name) = self.order.iter().duplicates().next() {
            return Err(TransformError::DuplicateArgument {
                kernel: knl.name,
                name: name.clone(),
            });
        }
        if let Some(name) = self
            .order
            .iter()
            .find(|name| **name != knl.domain.size_param && !knl.operands.contains_key(*name))
        {
            return Err(TransformError::UnknownOperand {
                kernel: knl.name,
                operand: name.clone(),
            });
        }
        let missing = knl
            .operands
            .keys()
            .chain(std::iter::once(&knl.domain.size_param))
            .find(|name| !self.order.contains(*name))
            .cloned();
        if let Some(name) = missing {
            return Err(TransformError::MissingArgument {
                kernel: knl.name,
                name,
            });
        }
        knl.argument_order = Some(self.order.clone());
        Ok(knl)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Assume(Assume(assumption)) => write!(f, "Assume({assumption})"),
            Transform::Split(split) => write!(
                f,
                "Split({} by {}, outer {}, inner {}, slabs ({}, {}))",
                split.iname,
                split.factor,
                split.outer_tag,
                split.inner_tag,
                split.slabs.head,
                split.slabs.tail
            ),
            Transform::TagStreamingStore(_) => write!(f, "TagStreamingStore"),
            Transform::InferTypes(infer) => write!(
                f,
                "InferTypes({})",
                infer
                    .dtypes
                    .iter()
                    .map(|(name, dtype)| format!("{name}: {dtype}"))
                    .join(", ")
            ),
            Transform::FixArgumentOrder(fix) => {
                write!(f, "FixArgumentOrder({})", fix.order.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Extent;
    use nonzero::nonzero as nz;

    fn triad() -> KernelDescriptor {
        KernelDescriptor::new("triad", "a[i] = b[i] + scalar * c[i]", "a,b,c,scalar").unwrap()
    }

    #[test]
    fn test_stream_pipeline_order() {
        let pipeline = stream_pipeline("a,b", Dtype::Float64, false);
        let names = pipeline
            .iter()
            .map(|t| match t {
                Transform::Assume(_) => "Assume",
                Transform::Split(_) => "Split",
                Transform::TagStreamingStore(_) => "TagStreamingStore",
                Transform::InferTypes(_) => "InferTypes",
                Transform::FixArgumentOrder(_) => "FixArgumentOrder",
            })
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            ["Assume", "Split", "Split", "InferTypes", "FixArgumentOrder"]
        );

        let pipeline = stream_pipeline("a,b", Dtype::Float64, true);
        assert_eq!(pipeline.len(), 6);
        assert_eq!(
            pipeline[3],
            Transform::TagStreamingStore(TagStreamingStore)
        );
    }

    #[test]
    fn test_stream_pipeline_on_triad() {
        let knl = apply_transforms(triad(), &stream_pipeline("a,b,c,scalar", Dtype::Float32, true))
            .unwrap();
        assert!(knl.assumes(Assumption::SizePositive));
        assert_eq!(knl.parameters(), ["a", "b", "c", "scalar", "n"]);
        assert!(knl
            .operands
            .values()
            .all(|o| o.dtype == Some(Dtype::Float32)));
        assert!(knl.statements.iter().all(|s| s.streaming_store));
        assert_eq!(knl.nest.dims().len(), 3);
        assert_eq!(knl.nest.outermost().extent, Extent::CeilDiv(BLOCK_SIZE));
    }

    #[test]
    fn test_argument_order_follows_pipeline_not_declaration() {
        let knl = KernelDescriptor::new("triad", "a[i] = b[i] + scalar * c[i]", "scalar, c, b, a")
            .unwrap();
        let knl =
            apply_transforms(knl, &stream_pipeline("a, b, c, scalar", Dtype::Float64, false))
                .unwrap();
        assert_eq!(knl.parameters(), ["a", "b", "c", "scalar", "n"]);
    }

    #[test]
    fn test_assume_is_idempotent() {
        let t = Transform::Assume(Assume(Assumption::SizePositive));
        let knl = apply_transforms(triad(), &[t.clone(), t]).unwrap();
        assert_eq!(knl.domain.assumptions, [Assumption::SizePositive]);
    }

    #[test]
    fn test_infer_types_requires_every_used_operand() {
        let err = apply_transforms(triad(), &stream_pipeline("a,b,c", Dtype::Float64, false))
            .unwrap_err();
        assert_eq!(
            err,
            TransformError::MissingType {
                kernel: "triad".to_string(),
                operand: "scalar".to_string()
            }
        );
    }

    #[test]
    fn test_infer_types_rejects_unknown_operand() {
        let err = apply_transforms(
            triad(),
            &stream_pipeline("a,b,c,scalar,d", Dtype::Float64, false),
        )
        .unwrap_err();
        assert_eq!(
            err,
            TransformError::UnknownOperand {
                kernel: "triad".to_string(),
                operand: "d".to_string()
            }
        );
    }

    #[test]
    fn test_infer_types_rejects_retyping() {
        let f32s = Transform::InferTypes(InferTypes {
            dtypes: [("a".to_string(), Dtype::Float32)].into_iter().collect(),
        });
        let f64s = Transform::InferTypes(InferTypes {
            dtypes: [("a".to_string(), Dtype::Float64)].into_iter().collect(),
        });
        let knl = KernelDescriptor::new("init", "a[i] = 1", "a").unwrap();
        assert!(matches!(
            apply_transforms(knl, &[f32s, f64s]),
            Err(TransformError::ConflictingType { .. })
        ));
    }

    #[test]
    fn test_fix_argument_order_errors() {
        let fix = |order: &[&str]| {
            Transform::FixArgumentOrder(FixArgumentOrder {
                order: order.iter().map(|s| s.to_string()).collect(),
            })
        };
        let knl = KernelDescriptor::new("copy", "a[i] = b[i]", "a,b").unwrap();
        assert!(matches!(
            apply_transforms(knl.clone(), &[fix(&["a", "b", "a", "n"])]),
            Err(TransformError::DuplicateArgument { name, .. }) if name == "a"
        ));
        assert!(matches!(
            apply_transforms(knl.clone(), &[fix(&["a", "n"])]),
            Err(TransformError::MissingArgument { name, .. }) if name == "b"
        ));
        assert!(matches!(
            apply_transforms(knl.clone(), &[fix(&["a", "b"])]),
            Err(TransformError::MissingArgument { name, .. }) if name == "n"
        ));
        assert!(matches!(
            apply_transforms(knl.clone(), &[fix(&["a", "b", "z", "n"])]),
            Err(TransformError::UnknownOperand { operand, .. }) if operand == "z"
        ));
        let fixed = apply_transforms(knl, &[fix(&["n", "b", "a"])]).unwrap();
        assert_eq!(fixed.parameters(), ["n", "b", "a"]);
    }

    #[test]
    fn test_split_errors_carry_kernel_name() {
        let split = Transform::Split(Split {
            iname: "j".to_string(),
            factor: nz!(8u32),
            outer_tag: DimTag::Sequential,
            inner_tag: DimTag::Sequential,
            slabs: Slabs::default(),
        });
        assert_eq!(
            apply_transforms(triad(), &[split]),
            Err(TransformError::Schedule {
                kernel: "triad".to_string(),
                source: ScheduleError::UnknownDim("j".to_string()),
            })
        );
    }

    #[test]
    fn test_transform_display() {
        let pipeline = stream_pipeline("a, scalar", Dtype::Float64, true);
        let rendered = pipeline.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        assert_eq!(
            rendered,
            [
                "Assume(n > 0)",
                "Split(i by 262144, outer g.0, inner seq, slabs (0, 1))",
                "Split(i_inner by 8, outer seq, inner l.0, slabs (0, 0))",
                "TagStreamingStore",
                "InferTypes(a: f64, scalar: f64)",
                "FixArgumentOrder(a, scalar, n)",
            ]
        );
    }
}
