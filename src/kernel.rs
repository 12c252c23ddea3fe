use crate::common::{Dtype, LOOP_INDEX, SIZE_PARAM};
use crate::expr::{Expr, OperandRole};
use crate::parse::{parse_assignment, ParseError};
use crate::schedule::LoopNest;

use indexmap::IndexMap;
use std::fmt;

/// An elementwise kernel over the domain `0 <= i < n`, together with the
/// schedule and typing decisions made for it so far.
///
/// A descriptor is built once per kernel by [KernelDescriptor::new], threaded by
/// value through [crate::transform::Transform]s, and finally read by a
/// [crate::codegen::CodeGen].
#[derive(Debug, Clone, PartialEq)]
pub struct KernelDescriptor {
    pub name: String,
    pub domain: Domain,
    pub statements: Vec<Statement>,
    /// Operands in declaration order.
    pub operands: IndexMap<String, Operand>,
    pub nest: LoopNest,
    pub argument_order: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub iname: String,
    pub size_param: String,
    pub assumptions: Vec<Assumption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assumption {
    /// `n > 0`
    SizePositive,
}

/// `dest[i] = rhs`
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub dest: String,
    pub rhs: Expr,
    /// Write `dest` with a non-temporal (cache-bypassing) store.
    pub streaming_store: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub role: OperandRole,
    pub dtype: Option<Dtype>,
    /// Whether any statement assigns to this operand.
    pub written: bool,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DescriptorError {
    #[error("Kernel {kernel}, line {line}: {source}")]
    Parse {
        kernel: String,
        line: usize,
        #[source]
        source: ParseError,
    },
    #[error("Kernel {kernel} has no statements")]
    NoStatements { kernel: String },
    #[error("Kernel {kernel} references undeclared operand {operand}")]
    UndeclaredOperand { kernel: String, operand: String },
    #[error("Kernel {kernel} declares operand {operand} more than once")]
    DuplicateOperand { kernel: String, operand: String },
    #[error("Kernel {kernel} declares operand {operand} but never uses it")]
    UnusedOperand { kernel: String, operand: String },
    #[error("Kernel {kernel} uses {operand} both as an array and as a scalar")]
    ConflictingRole { kernel: String, operand: String },
    #[error("Kernel {kernel}: {operand} is reserved for the loop domain")]
    ReservedOperand { kernel: String, operand: String },
    #[error("Kernel {kernel}: empty operand name in {list:?}")]
    EmptyOperandName { kernel: String, list: String },
}

impl KernelDescriptor {
    /// Build a descriptor from one `dest[i] = expr` assignment per non-blank line
    /// and a comma-separated list of operand names.
    ///
    /// # Examples
    /// ```
    /// # use streamgen::kernel::KernelDescriptor;
    /// let knl = KernelDescriptor::new("copy", "a[i] = b[i]", "a, b").unwrap();
    /// assert_eq!(knl.operands.keys().collect::<Vec<_>>(), ["a", "b"]);
    /// assert_eq!(knl.statements[0].rhs.to_string(), "b[i]");
    /// ```
    pub fn new(name: &str, instructions: &str, operands: &str) -> Result<Self, DescriptorError> {
        let declared = parse_operand_list(name, operands)?;

        let mut statements = Vec::new();
        for (line_idx, line) in instructions.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (dest, rhs) = parse_assignment(line).map_err(|source| DescriptorError::Parse {
                kernel: name.to_string(),
                line: line_idx + 1,
                source,
            })?;
            statements.push(Statement {
                dest,
                rhs,
                streaming_store: false,
            });
        }
        if statements.is_empty() {
            return Err(DescriptorError::NoStatements {
                kernel: name.to_string(),
            });
        }

        // Every declared operand must be referenced, consistently as an array or
        // as a scalar, and nothing undeclared may be referenced.
        let mut uses: Vec<(&str, OperandRole, bool)> = Vec::new();
        for statement in &statements {
            uses.push((statement.dest.as_str(), OperandRole::Array, true));
            statement
                .rhs
                .visit_operands(&mut |operand, role| uses.push((operand, role, false)));
        }
        let mut roles: IndexMap<&str, (OperandRole, bool)> = IndexMap::new();
        for (operand, role, written) in uses {
            if !declared.iter().any(|d| d == operand) {
                return Err(DescriptorError::UndeclaredOperand {
                    kernel: name.to_string(),
                    operand: operand.to_string(),
                });
            }
            let entry = roles.entry(operand).or_insert((role, false));
            if entry.0 != role {
                return Err(DescriptorError::ConflictingRole {
                    kernel: name.to_string(),
                    operand: operand.to_string(),
                });
            }
            entry.1 |= written;
        }

        let mut operand_map = IndexMap::with_capacity(declared.len());
        for operand in declared {
            let Some(&(role, written)) = roles.get(operand.as_str()) else {
                return Err(DescriptorError::UnusedOperand {
                    kernel: name.to_string(),
                    operand,
                });
            };
            operand_map.insert(
                operand,
                Operand {
                    role,
                    dtype: None,
                    written,
                },
            );
        }

        Ok(KernelDescriptor {
            name: name.to_string(),
            domain: Domain {
                iname: LOOP_INDEX.to_string(),
                size_param: SIZE_PARAM.to_string(),
                assumptions: vec![],
            },
            statements,
            operands: operand_map,
            nest: LoopNest::new(LOOP_INDEX),
            argument_order: None,
        })
    }

    /// Name of the generated callable unit.
    pub fn function_name(&self) -> String {
        format!("stream_{}_tasks", self.name)
    }

    pub fn assumes(&self, assumption: Assumption) -> bool {
        self.domain.assumptions.contains(&assumption)
    }

    /// Operand names referenced by any statement, in first-use order.
    pub fn referenced_operands(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for statement in &self.statements {
            if !seen.contains(&statement.dest.as_str()) {
                seen.push(&statement.dest);
            }
            statement.rhs.visit_operands(&mut |operand, _| {
                if !seen.contains(&operand) {
                    seen.push(operand);
                }
            });
        }
        seen
    }

    /// The parameter list of the generated unit: the fixed argument order if one
    /// was set, otherwise the operands in declaration order followed by the size.
    pub fn parameters(&self) -> Vec<String> {
        match &self.argument_order {
            Some(order) => order.clone(),
            None => self
                .operands
                .keys()
                .cloned()
                .chain(std::iter::once(self.domain.size_param.clone()))
                .collect(),
        }
    }
}

fn parse_operand_list(kernel: &str, operands: &str) -> Result<Vec<String>, DescriptorError> {
    let mut names: Vec<String> = Vec::new();
    for raw in operands.split(',') {
        let operand = raw.trim();
        if operand.is_empty() {
            return Err(DescriptorError::EmptyOperandName {
                kernel: kernel.to_string(),
                list: operands.to_string(),
            });
        }
        if operand == LOOP_INDEX || operand == SIZE_PARAM {
            return Err(DescriptorError::ReservedOperand {
                kernel: kernel.to_string(),
                operand: operand.to_string(),
            });
        }
        if names.iter().any(|n| n == operand) {
            return Err(DescriptorError::DuplicateOperand {
                kernel: kernel.to_string(),
                operand: operand.to_string(),
            });
        }
        names.push(operand.to_string());
    }
    Ok(names)
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[i] = {}", self.dest, self.rhs)?;
        if self.streaming_store {
            write!(f, "  (streaming store)")?;
        }
        Ok(())
    }
}

impl fmt::Display for Assumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assumption::SizePositive => write!(f, "{SIZE_PARAM} > 0"),
        }
    }
}

impl fmt::Display for OperandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandRole::Array => write!(f, "array"),
            OperandRole::Scalar => write!(f, "scalar"),
        }
    }
}
