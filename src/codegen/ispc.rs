use super::c_utils::{ispc_type, render_rhs, ISPC_INDEX_TYPE};
use super::{CodeGen, KernelPlan, ParamKind, TargetId};
use crate::schedule::{DimTag, SlabPath};
use crate::utils::indent;

use itertools::Itertools;
use std::fmt;

/// Lowers a kernel to an ISPC task over one block plus an exported entry point
/// which launches one task per block.
///
/// The lane dimension becomes the gang of program instances, so the global index
/// is `varying`; every other dimension is a `uniform` loop.
#[derive(Default)]
pub struct IspcCodeGenerator;

impl CodeGen for IspcCodeGenerator {
    fn target_id(&self) -> TargetId {
        TargetId::Ispc
    }

    fn emit_kernel<W: fmt::Write>(&self, plan: &KernelPlan, out: &mut W) -> fmt::Result {
        let params = plan
            .params
            .iter()
            .map(|p| param_decl(plan, p.name, p.kind))
            .join(", ");
        let outer = plan.nest().outermost();

        if let Some(axis) = plan.group_axis() {
            writeln!(out, "task void {}_inner({params}) {{", plan.function_name)?;
            writeln!(
                out,
                "{}uniform {ISPC_INDEX_TYPE} const {} = taskIndex{axis};",
                indent(1),
                outer.name
            )?;
            emit_block(plan, 1, out)?;
            writeln!(out, "}}")?;
            writeln!(out)?;
        }

        writeln!(out, "export void {}({params}) {{", plan.function_name)?;
        if let Some(lane) = plan.lane_dim() {
            writeln!(out, "{}assert(programCount == {});", indent(1), lane.extent)?;
        }
        if plan.group_axis().is_some() {
            writeln!(
                out,
                "{}launch[{}] {}_inner({});",
                indent(1),
                plan.block_count_expr(),
                plan.function_name,
                plan.params.iter().map(|p| p.name).join(", ")
            )?;
        } else {
            writeln!(
                out,
                "{}for (uniform {ISPC_INDEX_TYPE} {} = 0; {}; ++{}) {{",
                indent(1),
                outer.name,
                plan.loop_condition(0, SlabPath::Full),
                outer.name
            )?;
            emit_block(plan, 2, out)?;
            writeln!(out, "{}}}", indent(1))?;
        }
        writeln!(out, "}}")
    }
}

fn param_decl(plan: &KernelPlan, name: &str, kind: ParamKind) -> String {
    let ty = ispc_type(plan.dtype);
    match kind {
        ParamKind::Array { written: true } => format!("uniform {ty} *uniform {name}"),
        ParamKind::Array { written: false } => format!("uniform {ty} const *uniform {name}"),
        ParamKind::Scalar => format!("uniform {ty} const {name}"),
        ParamKind::Size => format!("uniform {ISPC_INDEX_TYPE} const {name}"),
    }
}

/// The body of one outermost iteration, whose variable is already bound.
fn emit_block<W: fmt::Write>(plan: &KernelPlan, depth: usize, out: &mut W) -> fmt::Result {
    if let Some(lane) = plan.lane_dim() {
        writeln!(
            out,
            "{}varying {ISPC_INDEX_TYPE} const {} = programIndex;",
            indent(depth),
            lane.name
        )?;
    }
    match plan.paths() {
        [path] => emit_path(plan, *path, 1, depth, out),
        _ => {
            writeln!(out, "{}if ({}) {{", indent(depth), plan.full_block_condition())?;
            emit_path(plan, SlabPath::Full, 1, depth + 1, out)?;
            writeln!(out, "{}}} else {{", indent(depth))?;
            emit_path(plan, SlabPath::Boundary, 1, depth + 1, out)?;
            writeln!(out, "{}}}", indent(depth))
        }
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
    if let DimTag::Lane(_) = dim.tag {
        return emit_statements(plan, path, depth, out);
    }
    writeln!(
        out,
        "{}for (uniform {ISPC_INDEX_TYPE} {} = 0; {}; ++{}) {{",
        indent(depth),
        dim.name,
        plan.loop_condition(dim_idx, path),
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
    let guarded = path == SlabPath::Boundary && plan.lane_dim().is_some();
    // Streaming stores address the gang's base, not `i`.
    let reads_index = guarded
        || plan
            .knl
            .statements
            .iter()
            .any(|s| !plan.uses_streaming_store(s, path) || s.rhs.uses_index());
    if plan.is_split() && reads_index {
        let variability = if plan.lane_dim().is_some() {
            "varying"
        } else {
            "uniform"
        };
        writeln!(
            out,
            "{}{variability} {ISPC_INDEX_TYPE} const {index} = {};",
            indent(depth),
            plan.global_index()
        )?;
    }
    if guarded {
        writeln!(out, "{}if ({index} < {}) {{", indent(depth), plan.size_param())?;
        depth += 1;
    }
    for statement in &plan.knl.statements {
        let rhs = render_rhs(&statement.rhs, index, plan.dtype, TargetId::Ispc);
        match plan
            .streaming_base()
            .filter(|_| plan.uses_streaming_store(statement, path))
        {
            Some(base) => writeln!(
                out,
                "{}streaming_store({} + ({base}), {rhs});",
                indent(depth),
                statement.dest
            )?,
            None => writeln!(out, "{}{}[{index}] = {rhs};", indent(depth), statement.dest)?,
        }
    }
    if guarded {
        writeln!(out, "{}}}", indent(depth - 1))?;
    }
    Ok(())
}
