use std::fmt;

/// The right-hand side of an elementwise assignment.
///
/// Array elements are always subscripted by the kernel's loop index, so an
/// [Expr] describes the value of one output element in terms of the same
/// element of its inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    /// A scalar operand, e.g. `scalar`.
    Scalar(String),
    /// An array operand read at the loop index, e.g. `b[i]`.
    Element(String),
    /// The loop index itself.
    Index,
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// How an operand is referenced by a kernel's statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandRole {
    Array,
    Scalar,
}

impl BinOp {
    /// Left and right binding powers for precedence climbing.
    pub fn binding_power(&self) -> (u8, u8) {
        match self {
            BinOp::Add | BinOp::Sub => (1, 2),
            BinOp::Mul | BinOp::Div => (3, 4),
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }
}

impl Expr {
    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Visit every operand referenced by this expression, left to right.
    pub fn visit_operands<'a>(&'a self, f: &mut impl FnMut(&'a str, OperandRole)) {
        match self {
            Expr::Literal(_) | Expr::Index => {}
            Expr::Scalar(name) => f(name, OperandRole::Scalar),
            Expr::Element(name) => f(name, OperandRole::Array),
            Expr::Neg(inner) => inner.visit_operands(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit_operands(f);
                rhs.visit_operands(f);
            }
        }
    }

    /// Whether the loop index appears as a value, e.g. in `2 * i`.
    pub fn uses_index(&self) -> bool {
        match self {
            Expr::Index => true,
            Expr::Literal(_) | Expr::Scalar(_) | Expr::Element(_) => false,
            Expr::Neg(inner) => inner.uses_index(),
            Expr::Binary { lhs, rhs, .. } => lhs.uses_index() || rhs.uses_index(),
        }
    }

    /// Render the expression, delegating leaves to `leaf`.
    ///
    /// Parentheses are only written where precedence requires them, so a
    /// parsed and re-rendered expression keeps its evaluation order.
    pub fn render<W, F>(&self, out: &mut W, leaf: &mut F) -> fmt::Result
    where
        W: fmt::Write,
        F: FnMut(&Expr, &mut W) -> fmt::Result,
    {
        self.render_prec(out, leaf, 0)
    }

    fn render_prec<W, F>(&self, out: &mut W, leaf: &mut F, min_bp: u8) -> fmt::Result
    where
        W: fmt::Write,
        F: FnMut(&Expr, &mut W) -> fmt::Result,
    {
        match self {
            Expr::Literal(_) | Expr::Scalar(_) | Expr::Element(_) | Expr::Index => leaf(self, out),
            Expr::Neg(inner) => {
                out.write_char('-')?;
                // `--x` would lex as a decrement.
                if matches!(**inner, Expr::Neg(_)) || matches!(**inner, Expr::Literal(v) if v < 0.0)
                {
                    out.write_char('(')?;
                    inner.render_prec(out, leaf, 0)?;
                    return out.write_char(')');
                }
                inner.render_prec(out, leaf, u8::MAX)
            }
            Expr::Binary { op, lhs, rhs } => {
                let (l_bp, r_bp) = op.binding_power();
                let parenthesize = l_bp < min_bp;
                if parenthesize {
                    out.write_char('(')?;
                }
                lhs.render_prec(out, leaf, l_bp)?;
                write!(out, " {} ", op.symbol())?;
                rhs.render_prec(out, leaf, r_bp)?;
                if parenthesize {
                    out.write_char(')')?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, &mut |leaf, out| match leaf {
            Expr::Literal(v) => write!(out, "{v}"),
            Expr::Scalar(name) => write!(out, "{name}"),
            Expr::Element(name) => write!(out, "{name}[i]"),
            Expr::Index => write!(out, "i"),
            _ => unreachable!(),
        })
    }
}

/// Format a literal so it reads as a floating-point constant in C-like languages.
pub fn float_literal(value: f64) -> String {
    let s = format!("{value:?}");
    if s.contains(['.', 'e', 'E']) || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{s}.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triad_rhs() -> Expr {
        Expr::binary(
            BinOp::Add,
            Expr::Element("b".into()),
            Expr::binary(
                BinOp::Mul,
                Expr::Scalar("scalar".into()),
                Expr::Element("c".into()),
            ),
        )
    }

    #[test]
    fn test_display_omits_unneeded_parens() {
        assert_eq!(triad_rhs().to_string(), "b[i] + scalar * c[i]");
    }

    #[test]
    fn test_display_keeps_needed_parens() {
        let e = Expr::binary(
            BinOp::Mul,
            Expr::binary(BinOp::Add, Expr::Element("b".into()), Expr::Literal(1.0)),
            Expr::Scalar("s".into()),
        );
        assert_eq!(e.to_string(), "(b[i] + 1) * s");

        let e = Expr::binary(
            BinOp::Sub,
            Expr::Element("a".into()),
            Expr::binary(BinOp::Sub, Expr::Element("b".into()), Expr::Element("c".into())),
        );
        assert_eq!(e.to_string(), "a[i] - (b[i] - c[i])");
    }

    #[test]
    fn test_visit_operands_in_order() {
        let rhs = triad_rhs();
        let mut seen = vec![];
        rhs.visit_operands(&mut |name, role| seen.push((name, role)));
        assert_eq!(
            seen,
            vec![
                ("b", OperandRole::Array),
                ("scalar", OperandRole::Scalar),
                ("c", OperandRole::Array)
            ]
        );
    }

    #[test]
    fn test_uses_index() {
        assert!(!triad_rhs().uses_index());
        let e = Expr::binary(BinOp::Mul, Expr::Literal(2.0), Expr::Neg(Box::new(Expr::Index)));
        assert!(e.uses_index());
    }

    #[test]
    fn test_float_literal() {
        assert_eq!(float_literal(1.0), "1.0");
        assert_eq!(float_literal(0.0), "0.0");
        assert_eq!(float_literal(2.5), "2.5");
        assert_eq!(float_literal(1e-30), "1e-30");
    }
}
