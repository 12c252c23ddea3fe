pub mod c_utils;
mod c;
mod header;
mod ispc;

use crate::common::Dtype;
use crate::kernel::{Assumption, KernelDescriptor, Statement};
use crate::pprint::pprint_write;
use crate::schedule::{DimTag, Extent, LoopDim, LoopNest, ScheduleError, SlabPath};
use crate::expr::OperandRole;
use crate::utils::LinePrefixWrite;

use itertools::Itertools;
use log::{debug, warn};
use std::fmt;

pub use self::c::CCodeGenerator;
pub use self::header::HeaderEmitter;
pub use self::ispc::IspcCodeGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
pub enum TargetId {
    /// Intel SPMD Program Compiler: tasks for blocks, program instances for lanes.
    #[default]
    Ispc,
    /// C with OpenMP: `parallel for` over blocks, `simd` over lanes.
    C,
}

pub trait CodeGen {
    fn target_id(&self) -> TargetId;

    /// Write the generated unit for an already-validated kernel.
    fn emit_kernel<W: fmt::Write>(&self, plan: &KernelPlan, out: &mut W) -> fmt::Result;
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EmitError {
    #[error("Kernel {kernel}: operand {operand} has no type")]
    MissingType { kernel: String, operand: String },
    #[error("Kernel {kernel} has no operands")]
    NoOperands { kernel: String },
    #[error("Kernel {kernel}: operands mix types {first} and {second}")]
    MixedTypes {
        kernel: String,
        first: Dtype,
        second: Dtype,
    },
    #[error("Kernel {kernel}: argument {name} is not an operand or the size parameter")]
    UndeclaredArgument { kernel: String, name: String },
    #[error("Kernel {kernel}: {name} is missing from the argument order")]
    MissingArgument { kernel: String, name: String },
    #[error("Kernel {kernel}: argument {name} appears more than once")]
    DuplicateArgument { kernel: String, name: String },
    #[error("Kernel {kernel}: {source}")]
    Schedule {
        kernel: String,
        #[source]
        source: ScheduleError,
    },
    #[error("Formatting error")]
    Fmt(#[from] fmt::Error),
}

/// A kernel checked for emission, with the facts every target needs.
pub struct KernelPlan<'a> {
    pub knl: &'a KernelDescriptor,
    pub function_name: String,
    /// The element type shared by every operand.
    pub dtype: Dtype,
    pub params: Vec<Param<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param<'a> {
    pub name: &'a str,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Array { written: bool },
    Scalar,
    Size,
}

/// Emit `knl` for `target`, optionally preceded by its schedule as a comment.
pub fn emit<W: fmt::Write>(
    knl: &KernelDescriptor,
    target: TargetId,
    include_schedule: bool,
    out: &mut W,
) -> Result<(), EmitError> {
    let plan = KernelPlan::new(knl)?;
    if include_schedule {
        let mut commenting_out = LinePrefixWrite::new(&mut *out, "// ");
        pprint_write(&mut commenting_out, knl)?;
    }
    match target {
        TargetId::Ispc => emit_with(&IspcCodeGenerator, &plan, out),
        TargetId::C => emit_with(&CCodeGenerator, &plan, out),
    }
}

fn emit_with<G: CodeGen, W: fmt::Write>(
    generator: &G,
    plan: &KernelPlan,
    out: &mut W,
) -> Result<(), EmitError> {
    generator.emit_kernel(plan, out)?;
    debug!("Emitted {} for {:?}", plan.function_name, generator.target_id());
    Ok(())
}

impl<'a> KernelPlan<'a> {
    pub fn new(knl: &'a KernelDescriptor) -> Result<Self, EmitError> {
        knl.nest
            .check_emittable()
            .map_err(|source| EmitError::Schedule {
                kernel: knl.name.clone(),
                source,
            })?;

        let mut dtype = None;
        for (name, operand) in &knl.operands {
            let Some(operand_dtype) = operand.dtype else {
                return Err(EmitError::MissingType {
                    kernel: knl.name.clone(),
                    operand: name.clone(),
                });
            };
            match dtype {
                Some(first) if first != operand_dtype => {
                    return Err(EmitError::MixedTypes {
                        kernel: knl.name.clone(),
                        first,
                        second: operand_dtype,
                    })
                }
                _ => dtype = Some(operand_dtype),
            }
        }
        let Some(dtype) = dtype else {
            return Err(EmitError::NoOperands {
                kernel: knl.name.clone(),
            });
        };

        let argument_order = match &knl.argument_order {
            Some(order) => order.iter().map(String::as_str).collect::<Vec<_>>(),
            None => knl
                .operands
                .keys()
                .map(String::as_str)
                .chain(std::iter::once(knl.domain.size_param.as_str()))
                .collect(),
        };
        if let Some(name) = argument_order.iter().duplicates().next() {
            return Err(EmitError::DuplicateArgument {
                kernel: knl.name.clone(),
                name: name.to_string(),
            });
        }
        let mut params = Vec::with_capacity(argument_order.len());
        for name in argument_order {
            let kind = if name == knl.domain.size_param {
                ParamKind::Size
            } else if let Some(operand) = knl.operands.get(name) {
                match operand.role {
                    OperandRole::Array => ParamKind::Array {
                        written: operand.written,
                    },
                    OperandRole::Scalar => ParamKind::Scalar,
                }
            } else {
                return Err(EmitError::UndeclaredArgument {
                    kernel: knl.name.clone(),
                    name: name.to_string(),
                });
            };
            params.push(Param { name, kind });
        }
        if let Some(name) = knl
            .operands
            .keys()
            .map(String::as_str)
            .chain(std::iter::once(knl.domain.size_param.as_str()))
            .find(|name| !params.iter().any(|p| p.name == *name))
        {
            return Err(EmitError::MissingArgument {
                kernel: knl.name.clone(),
                name: name.to_string(),
            });
        }

        let plan = KernelPlan {
            knl,
            function_name: knl.function_name(),
            dtype,
            params,
        };
        if knl.statements.iter().any(|s| s.streaming_store) && plan.streaming_base().is_none() {
            warn!(
                "{} requests streaming stores but has no unit-stride lane dimension; using ordinary stores",
                plan.function_name
            );
        }
        Ok(plan)
    }

    pub fn nest(&self) -> &'a LoopNest {
        &self.knl.nest
    }

    pub fn size_param(&self) -> &'a str {
        &self.knl.domain.size_param
    }

    /// Name of the variable holding the global element index.
    pub fn index_name(&self) -> &'a str {
        &self.knl.domain.iname
    }

    pub fn lane_dim(&self) -> Option<&'a LoopDim> {
        self.nest().lane_dim()
    }

    /// Whether the nest was split at all. An unsplit nest is a plain loop whose
    /// variable is the global index itself.
    pub fn is_split(&self) -> bool {
        self.nest().dims().len() > 1
    }

    /// The code paths emitted inside one iteration of the outermost dimension.
    pub fn paths(&self) -> &'static [SlabPath] {
        if !self.is_split() {
            &[SlabPath::Full]
        } else if self.nest().has_tail_slab() {
            &[SlabPath::Full, SlabPath::Boundary]
        } else {
            &[SlabPath::Boundary]
        }
    }

    /// `sum(stride * dim)` over the dimensions `dims[..=depth]`.
    pub fn partial_index(&self, depth: usize) -> String {
        self.nest().dims()[..=depth]
            .iter()
            .map(|dim| {
                if dim.stride.get() == 1 {
                    dim.name.clone()
                } else {
                    format!("{} * {}", dim.stride, dim.name)
                }
            })
            .join(" + ")
    }

    /// The global element index in terms of every loop dimension.
    pub fn global_index(&self) -> String {
        self.partial_index(self.nest().dims().len() - 1)
    }

    /// The index of lane 0 when the innermost dimension is a unit-stride lane
    /// dimension, which is what a vector-wide streaming store needs.
    pub fn streaming_base(&self) -> Option<String> {
        let dims = self.nest().dims();
        let lane = self.lane_dim()?;
        if lane.stride.get() != 1 || dims.len() < 2 {
            return None;
        }
        Some(self.partial_index(dims.len() - 2))
    }

    /// Whether `statement` is written with a streaming store on `path`. Boundary
    /// paths always use ordinary, masked stores.
    pub fn uses_streaming_store(&self, statement: &Statement, path: SlabPath) -> bool {
        statement.streaming_store && path == SlabPath::Full && self.streaming_base().is_some()
    }

    /// The continuation test of the fixed-extent, sequential dimension at `depth`.
    /// On the boundary path the loop also stops once its first index reaches `n`.
    pub fn loop_condition(&self, depth: usize, path: SlabPath) -> String {
        let dim = &self.nest().dims()[depth];
        let bound = match dim.extent {
            Extent::Fixed(extent) => format!("{} < {extent}", dim.name),
            Extent::CeilDiv(_) => format!("{} < {}", dim.name, self.block_count_expr()),
        };
        match path {
            SlabPath::Full => bound,
            SlabPath::Boundary => format!(
                "{bound} && {} < {}",
                self.partial_index(depth),
                self.size_param()
            ),
        }
    }

    /// Iterations of the outermost dimension, as an expression in the size parameter.
    pub fn block_count_expr(&self) -> String {
        let n = self.size_param();
        let block = self.nest().block_size().get();
        if block == 1 {
            n.to_string()
        } else if self.knl.assumes(Assumption::SizePositive) {
            // `n + block - 1` can overflow the index type; `n - 1` cannot when `n > 0`.
            format!("({n} - 1) / {block} + 1")
        } else {
            format!("({n} + {}) / {block}", block - 1)
        }
    }

    /// Condition under which the current outermost iteration is a full block.
    pub fn full_block_condition(&self) -> String {
        format!(
            "{} < {} / {}",
            self.nest().outermost().name,
            self.size_param(),
            self.nest().block_size()
        )
    }

    /// The grid axis blocks are dispatched along, if the outermost dimension is
    /// dispatched to parallel tasks.
    pub fn group_axis(&self) -> Option<u8> {
        match self.nest().outermost().tag {
            DimTag::Group(axis) => Some(axis),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{apply_transforms, stream_pipeline, FixArgumentOrder, Transform};

    fn transformed(name: &str, insns: &str, vars: &str, streaming: bool) -> KernelDescriptor {
        let knl = KernelDescriptor::new(name, insns, vars).unwrap();
        apply_transforms(knl, &stream_pipeline(vars, Dtype::Float64, streaming)).unwrap()
    }

    fn emit_string(knl: &KernelDescriptor, target: TargetId) -> Result<String, EmitError> {
        let mut out = String::new();
        emit(knl, target, false, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_plan_for_triad() {
        let knl = transformed("triad", "a[i] = b[i] + scalar * c[i]", "a,b,c,scalar", true);
        let plan = KernelPlan::new(&knl).unwrap();
        assert_eq!(plan.function_name, "stream_triad_tasks");
        assert_eq!(plan.dtype, Dtype::Float64);
        assert_eq!(
            plan.params,
            [
                Param { name: "a", kind: ParamKind::Array { written: true } },
                Param { name: "b", kind: ParamKind::Array { written: false } },
                Param { name: "c", kind: ParamKind::Array { written: false } },
                Param { name: "scalar", kind: ParamKind::Scalar },
                Param { name: "n", kind: ParamKind::Size },
            ]
        );
        assert_eq!(
            plan.global_index(),
            "262144 * i_outer + 8 * i_inner_outer + i_inner_inner"
        );
        assert_eq!(
            plan.streaming_base().as_deref(),
            Some("262144 * i_outer + 8 * i_inner_outer")
        );
        assert_eq!(plan.block_count_expr(), "(n - 1) / 262144 + 1");
        assert_eq!(plan.full_block_condition(), "i_outer < n / 262144");
        assert_eq!(plan.paths(), [SlabPath::Full, SlabPath::Boundary]);
        assert_eq!(plan.group_axis(), Some(0));
    }

    #[test]
    fn test_untyped_kernel_fails_to_emit() {
        let knl = KernelDescriptor::new("copy", "a[i] = b[i]", "a,b").unwrap();
        assert_eq!(
            emit_string(&knl, TargetId::Ispc),
            Err(EmitError::MissingType {
                kernel: "copy".to_string(),
                operand: "a".to_string()
            })
        );
    }

    #[test]
    fn test_argument_order_must_name_operands() {
        let mut knl = transformed("copy", "a[i] = b[i]", "a,b", false);
        knl.argument_order = Some(vec!["a".into(), "x".into(), "n".into()]);
        assert_eq!(
            emit_string(&knl, TargetId::C),
            Err(EmitError::UndeclaredArgument {
                kernel: "copy".to_string(),
                name: "x".to_string()
            })
        );

        knl.argument_order = Some(vec!["a".into(), "n".into()]);
        assert!(matches!(
            emit_string(&knl, TargetId::C),
            Err(EmitError::MissingArgument { name, .. }) if name == "b"
        ));
    }

    #[test]
    fn test_mixed_types_fail_to_emit() {
        let mut knl = transformed("copy", "a[i] = b[i]", "a,b", false);
        knl.operands["b"].dtype = Some(Dtype::Float32);
        assert!(matches!(
            emit_string(&knl, TargetId::Ispc),
            Err(EmitError::MixedTypes { .. })
        ));
    }

    #[test]
    fn test_include_schedule_writes_comment() {
        let knl = transformed("copy", "a[i] = b[i]", "a,b", false);
        let mut out = String::new();
        emit(&knl, TargetId::Ispc, true, &mut out).unwrap();
        let comment_lines = out
            .lines()
            .take_while(|l| l.starts_with("//"))
            .collect::<Vec<_>>();
        assert_eq!(comment_lines[0], "// stream_copy_tasks:");
        assert!(comment_lines.iter().any(|l| l.contains("i_inner_inner")));
        assert_eq!(comment_lines.iter().filter(|l| **l == "//").count(), 2);
        assert!(!comment_lines.contains(&"// "));
        assert!(out.contains("export void stream_copy_tasks("));
    }

    #[test]
    fn test_reordered_arguments_reach_the_plan() {
        let knl = transformed("scale", "a[i] = scalar * b[i]", "a,b,scalar", false);
        let reorder = Transform::FixArgumentOrder(FixArgumentOrder {
            order: vec!["n".into(), "scalar".into(), "b".into(), "a".into()],
        });
        let knl = apply_transforms(knl, &[reorder]).unwrap();
        let plan = KernelPlan::new(&knl).unwrap();
        assert_eq!(
            plan.params.iter().map(|p| p.name).collect::<Vec<_>>(),
            ["n", "scalar", "b", "a"]
        );
    }
}
