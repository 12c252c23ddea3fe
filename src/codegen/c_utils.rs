use crate::{
    common::Dtype,
    expr::{float_literal, Expr},
};

use super::TargetId;

use std::fmt::Write;

/// Type of the domain size and of every loop index in generated C.
pub const C_INDEX_TYPE: &str = "int32_t";

/// Type of the domain size and of every loop index in generated ISPC.
pub const ISPC_INDEX_TYPE: &str = "int32";

pub fn c_type(dtype: Dtype) -> &'static str {
    match dtype {
        Dtype::Float32 => "float",
        Dtype::Float64 => "double",
    }
}

pub fn ispc_type(dtype: Dtype) -> &'static str {
    match dtype {
        Dtype::Float32 => "float",
        Dtype::Float64 => "double",
    }
}

/// A floating-point constant of type `dtype`.
///
/// ISPC treats unsuffixed constants as `float`, so doubles need a `d` suffix there.
pub fn typed_literal(value: f64, dtype: Dtype, target: TargetId) -> String {
    let digits = float_literal(value);
    match (dtype, target) {
        (Dtype::Float32, _) => format!("{digits}f"),
        (Dtype::Float64, TargetId::Ispc) => format!("{digits}d"),
        (Dtype::Float64, TargetId::C) => digits,
    }
}

/// Render the right-hand side of a statement, reading array elements at `index`.
pub fn render_rhs(expr: &Expr, index: &str, dtype: Dtype, target: TargetId) -> String {
    let type_name = match target {
        TargetId::Ispc => ispc_type(dtype),
        TargetId::C => c_type(dtype),
    };
    let mut rendered = String::new();
    // Writing to a String cannot fail.
    let _ = expr.render(&mut rendered, &mut |leaf, out| match leaf {
        Expr::Literal(v) => write!(out, "{}", typed_literal(*v, dtype, target)),
        Expr::Scalar(name) => write!(out, "{name}"),
        Expr::Element(name) => write!(out, "{name}[{index}]"),
        Expr::Index => write!(out, "({type_name}){index}"),
        Expr::Neg(_) | Expr::Binary { .. } => unreachable!("render only passes leaves"),
    });
    rendered
}
