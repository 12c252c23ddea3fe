use super::c_utils::{c_type, render_rhs, C_INDEX_TYPE};
use super::{CodeGen, KernelPlan, ParamKind, TargetId};
use crate::schedule::{DimTag, SlabPath};
use crate::utils::indent;

use itertools::Itertools;
use std::fmt;

/// Lowers a kernel to a C function parallelized with OpenMP: blocks are
/// distributed over threads and the lane dimension is a `simd` loop.
#[derive(Default)]
pub struct CCodeGenerator;

impl CodeGen for CCodeGenerator {
    fn target_id(&self) -> TargetId {
        TargetId::C
    }

    fn emit_kernel<W: fmt::Write>(&self, plan: &KernelPlan, out: &mut W) -> fmt::Result {
        let params = plan
            .params
            .iter()
            .map(|p| param_decl(plan, p.name, p.kind))
            .join(", ");
        let outer = plan.nest().outermost();

        writeln!(out, "void {}({params}) {{", plan.function_name)?;
        if plan.group_axis().is_some() {
            writeln!(out, "{}#pragma omp parallel for schedule(static)", indent(1))?;
        }
        writeln!(
            out,
            "{}for ({C_INDEX_TYPE} {} = 0; {}; ++{}) {{",
            indent(1),
            outer.name,
            plan.loop_condition(0, SlabPath::Full),
            outer.name
        )?;
        match plan.paths() {
            [path] => emit_path(plan, *path, 1, 2, out)?,
            _ => {
                writeln!(out, "{}if ({}) {{", indent(2), plan.full_block_condition())?;
                emit_path(plan, SlabPath::Full, 1, 3, out)?;
                writeln!(out, "{}}} else {{", indent(2))?;
                emit_path(plan, SlabPath::Boundary, 1, 3, out)?;
                writeln!(out, "{}}}", indent(2))?;
            }
        }
        writeln!(out, "{}}}", indent(1))?;
        writeln!(out, "}}")
    }
}

fn param_decl(plan: &KernelPlan, name: &str, kind: ParamKind) -> String {
    let ty = c_type(plan.dtype);
    match kind {
        ParamKind::Array { written: true } => format!("{ty} *__restrict__ {name}"),
        ParamKind::Array { written: false } => format!("const {ty} *__restrict__ {name}"),
        ParamKind::Scalar => format!("const {ty} {name}"),
        ParamKind::Size => format!("const {C_INDEX_TYPE} {name}"),
    }
}

fn emit_path<W: fmt::Write>(
    plan: &KernelPlan,
    path: SlabPath,
    dim_idx: usize,
    depth: usize,
    out: &mut W,
) -> fmt::Result {
    let Some(dim) = plan.nest().dims().get(dim_idx) else {
        return emit_statements(plan, path, depth, out);
    };
    // Lanes are masked individually rather than cut short.
    let condition = match dim.tag {
        DimTag::Lane(_) => {
            writeln!(out, "{}#pragma omp simd", indent(depth))?;
            plan.loop_condition(dim_idx, SlabPath::Full)
        }
        _ => plan.loop_condition(dim_idx, path),
    };
    writeln!(
        out,
        "{}for ({C_INDEX_TYPE} {} = 0; {condition}; ++{}) {{",
        indent(depth),
        dim.name,
        dim.name
    )?;
    emit_path(plan, path, dim_idx + 1, depth + 1, out)?;
    writeln!(out, "{}}}", indent(depth))
}

fn emit_statements<W: fmt::Write>(
    plan: &KernelPlan,
    path: SlabPath,
    mut depth: usize,
    out: &mut W,
) -> fmt::Result {
    let index = plan.index_name();
    if plan.is_split() {
        writeln!(
            out,
            "{}const {C_INDEX_TYPE} {index} = {};",
            indent(depth),
            plan.global_index()
        )?;
    }
    let guarded = path == SlabPath::Boundary && plan.lane_dim().is_some();
    if guarded {
        writeln!(out, "{}if ({index} < {}) {{", indent(depth), plan.size_param())?;
        depth += 1;
    }
    for statement in &plan.knl.statements {
        let rhs = render_rhs(&statement.rhs, index, plan.dtype, TargetId::C);
        if plan.uses_streaming_store(statement, path) {
            writeln!(
                out,
                "{}__builtin_nontemporal_store({rhs}, &{}[{index}]);",
                indent(depth),
                statement.dest
            )?;
        } else {
            writeln!(out, "{}{}[{index}] = {rhs};", indent(depth), statement.dest)?;
        }
    }
    if guarded {
        writeln!(out, "{}}}", indent(depth - 1))?;
    }
    Ok(())
}
