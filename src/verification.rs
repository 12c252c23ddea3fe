//! Interprets transformed kernels on concrete arrays, and replays the STREAM
//! benchmark sequence through that interpreter to validate its results.
#![cfg(feature = "verification")]

use crate::common::Dtype;
use crate::expr::{BinOp, Expr, OperandRole};
use crate::kernel::KernelDescriptor;
use crate::schedule::ScheduleError;
use crate::stream::{GenerateError, GenerateOptions, StreamKernel};

use indexmap::IndexMap;
use log::{debug, info, warn};
use ndarray::prelude::*;
use num_traits::Float;
use std::fmt;

/// Concrete values for a kernel's operands. The domain size is the length of
/// the arrays, which must all agree.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelArgs<T> {
    pub arrays: IndexMap<String, Array1<T>>,
    pub scalars: IndexMap<String, T>,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum VerificationError {
    #[error("No value bound for operand {0}")]
    MissingArgument(String),
    #[error("Array {name} has {len} elements, but the domain has {n}")]
    LengthMismatch { name: String, len: usize, n: usize },
    #[error("Domain of {0} elements does not fit the 32-bit index type")]
    SizeTooLarge(usize),
    #[error("Operand {operand} has type {dtype:?}, which does not match the interpreter")]
    TypeMismatch { operand: String, dtype: Option<Dtype> },
    #[error("Literal {0} is not representable")]
    UnrepresentableLiteral(f64),
    #[error("At least one benchmark iteration is required")]
    NoIterations,
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
}

impl<T> KernelArgs<T> {
    pub fn new() -> Self {
        KernelArgs {
            arrays: IndexMap::new(),
            scalars: IndexMap::new(),
        }
    }

    pub fn array(mut self, name: &str, values: Array1<T>) -> Self {
        self.arrays.insert(name.to_string(), values);
        self
    }

    pub fn scalar(mut self, name: &str, value: T) -> Self {
        self.scalars.insert(name.to_string(), value);
        self
    }
}

impl<T> Default for KernelArgs<T> {
    fn default() -> Self {
        KernelArgs::new()
    }
}

/// Run the kernel's definition, statement by statement, for `i` in `0..n`.
///
/// Ignores the loop nest. Useful as the ground truth for [execute_scheduled].
pub fn execute_reference<T: Float>(
    knl: &KernelDescriptor,
    args: &mut KernelArgs<T>,
) -> Result<(), VerificationError> {
    let n = check_args(knl, args)?;
    for i in 0..n {
        execute_statements(knl, args, i)?;
    }
    Ok(())
}

/// Run the kernel the way the emitted code does: block by block, through the
/// full-block or boundary path, visiting lanes in gang order.
pub fn execute_scheduled<T: Float>(
    knl: &KernelDescriptor,
    args: &mut KernelArgs<T>,
) -> Result<(), VerificationError> {
    knl.nest.check_emittable()?;
    let n = check_args(knl, args)?;
    let n = u32::try_from(n).map_err(|_| VerificationError::SizeTooLarge(n))?;

    let mut result = Ok(());
    knl.nest.for_each_index(n, |_, i| {
        if result.is_ok() {
            result = execute_statements(knl, args, i as usize);
        }
    });
    result
}

/// Validate and return the domain size.
fn check_args<T: Float>(
    knl: &KernelDescriptor,
    args: &KernelArgs<T>,
) -> Result<usize, VerificationError> {
    let mut n = None;
    for (name, operand) in &knl.operands {
        if operand.dtype.map(|d| usize::from(d.size())) != Some(std::mem::size_of::<T>()) {
            return Err(VerificationError::TypeMismatch {
                operand: name.clone(),
                dtype: operand.dtype,
            });
        }
        match operand.role {
            OperandRole::Scalar => {
                if !args.scalars.contains_key(name) {
                    return Err(VerificationError::MissingArgument(name.clone()));
                }
            }
            OperandRole::Array => {
                let Some(values) = args.arrays.get(name) else {
                    return Err(VerificationError::MissingArgument(name.clone()));
                };
                match n {
                    None => n = Some(values.len()),
                    Some(n) if n != values.len() => {
                        return Err(VerificationError::LengthMismatch {
                            name: name.clone(),
                            len: values.len(),
                            n,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
    }
    // Every kernel writes an array, so `n` is always bound here.
    let n = n.unwrap_or(0);
    if i32::try_from(n).is_err() {
        return Err(VerificationError::SizeTooLarge(n));
    }
    Ok(n)
}

fn execute_statements<T: Float>(
    knl: &KernelDescriptor,
    args: &mut KernelArgs<T>,
    i: usize,
) -> Result<(), VerificationError> {
    for statement in &knl.statements {
        let value = evaluate(&statement.rhs, args, i)?;
        let dest = args
            .arrays
            .get_mut(&statement.dest)
            .ok_or_else(|| VerificationError::MissingArgument(statement.dest.clone()))?;
        dest[i] = value;
    }
    Ok(())
}

fn evaluate<T: Float>(
    expr: &Expr,
    args: &KernelArgs<T>,
    i: usize,
) -> Result<T, VerificationError> {
    Ok(match expr {
        Expr::Literal(v) => T::from(*v).ok_or(VerificationError::UnrepresentableLiteral(*v))?,
        Expr::Scalar(name) => *args
            .scalars
            .get(name)
            .ok_or_else(|| VerificationError::MissingArgument(name.clone()))?,
        Expr::Element(name) => args
            .arrays
            .get(name)
            .ok_or_else(|| VerificationError::MissingArgument(name.clone()))?[i],
        Expr::Index => T::from(i).ok_or(VerificationError::SizeTooLarge(i))?,
        Expr::Neg(inner) => -evaluate(inner, args, i)?,
        Expr::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs, args, i)?;
            let rhs = evaluate(rhs, args, i)?;
            match op {
                BinOp::Add => lhs + rhs,
                BinOp::Sub => lhs - rhs,
                BinOp::Mul => lhs * rhs,
                BinOp::Div => lhs / rhs,
            }
        }
    })
}

/// The outcome of checking one of the benchmark arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValidation {
    pub name: &'static str,
    /// The value every element should hold.
    pub expected: f64,
    /// Average absolute error divided by `expected`.
    pub avg_rel_err: f64,
    /// Elements whose own relative error exceeds the tolerance.
    pub failures: usize,
    pub epsilon: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamValidation {
    pub arrays: Vec<ArrayValidation>,
}

impl ArrayValidation {
    pub fn passed(&self) -> bool {
        self.avg_rel_err <= self.epsilon
    }
}

impl StreamValidation {
    pub fn passed(&self) -> bool {
        self.arrays.iter().all(ArrayValidation::passed)
    }
}

const BENCHMARK_SCALAR: f64 = 3.0;

/// Run the STREAM sequence on arrays of `size` elements: `init`, `selfscale` by
/// 2, then `ntimes` rounds of `copy`, `scale`, `add` and `triad`. Every kernel
/// runs through [execute_scheduled]; the results are then checked with
/// [check_stream_results].
pub fn run_stream_benchmark(
    size: usize,
    ntimes: usize,
    stream_type: Dtype,
) -> Result<StreamValidation, VerificationError> {
    match stream_type {
        Dtype::Float32 => run_stream_benchmark_typed::<f32>(size, ntimes, stream_type),
        Dtype::Float64 => run_stream_benchmark_typed::<f64>(size, ntimes, stream_type),
    }
}

fn run_stream_benchmark_typed<T: Float>(
    size: usize,
    ntimes: usize,
    stream_type: Dtype,
) -> Result<StreamValidation, VerificationError> {
    if ntimes == 0 {
        return Err(VerificationError::NoIterations);
    }
    let options = GenerateOptions::new(stream_type);
    let init = StreamKernel::Init.descriptor(&options)?;
    let selfscale = StreamKernel::SelfScale.descriptor(&options)?;
    let copy = StreamKernel::Copy.descriptor(&options)?;
    let scale = StreamKernel::Scale.descriptor(&options)?;
    let add = StreamKernel::Add.descriptor(&options)?;
    let triad = StreamKernel::Triad.descriptor(&options)?;
    let two = T::from(2.0).ok_or(VerificationError::UnrepresentableLiteral(2.0))?;
    let scalar = T::from(BENCHMARK_SCALAR)
        .ok_or(VerificationError::UnrepresentableLiteral(BENCHMARK_SCALAR))?;

    let mut arrays = [
        Array1::<T>::zeros(size),
        Array1::<T>::zeros(size),
        Array1::<T>::zeros(size),
    ];
    const A: usize = 0;
    const B: usize = 1;
    const C: usize = 2;

    call(&init, &mut arrays, &[A, B, C], None)?;
    call(&selfscale, &mut arrays, &[A], Some(two))?;
    for k in 0..ntimes {
        debug!("STREAM iteration {k}");
        call(&copy, &mut arrays, &[C, A], None)?;
        call(&scale, &mut arrays, &[B, C], Some(scalar))?;
        call(&add, &mut arrays, &[C, A, B], None)?;
        call(&triad, &mut arrays, &[A, B, C], Some(scalar))?;
    }

    let [a, b, c] = &arrays;
    let validation = check_stream_results(a.view(), b.view(), c.view(), ntimes, stream_type);
    info!(
        "STREAM validation on {size} {stream_type} elements, {ntimes} iterations: {}",
        if validation.passed() { "passed" } else { "failed" }
    );
    Ok(validation)
}

/// Call `knl` the way the STREAM driver does: positionally, binding its array
/// parameters to `slots` in order and its scalar parameter to `scalar`.
fn call<T: Float>(
    knl: &KernelDescriptor,
    arrays: &mut [Array1<T>; 3],
    slots: &[usize],
    scalar: Option<T>,
) -> Result<(), VerificationError> {
    let mut args = KernelArgs::new();
    let mut bound = Vec::with_capacity(slots.len());
    let mut slots = slots.iter();
    for param in knl.parameters() {
        let Some(operand) = knl.operands.get(&param) else {
            continue;
        };
        match operand.role {
            OperandRole::Array => {
                let Some(&slot) = slots.next() else {
                    return Err(VerificationError::MissingArgument(param));
                };
                let values = std::mem::replace(&mut arrays[slot], Array1::zeros(0));
                args.arrays.insert(param.clone(), values);
                bound.push((param, slot));
            }
            OperandRole::Scalar => {
                let value = scalar.ok_or_else(|| VerificationError::MissingArgument(param.clone()))?;
                args.scalars.insert(param, value);
            }
        }
    }

    let result = execute_scheduled(knl, &mut args);
    for (param, slot) in bound {
        if let Some(values) = args.arrays.swap_remove(&param) {
            arrays[slot] = values;
        }
    }
    result
}

/// Check `a`, `b` and `c` against the values `ntimes` rounds of the STREAM
/// sequence produce, the way the STREAM benchmark's own validation does.
pub fn check_stream_results<'a, T: Float>(
    a: ArrayView1<'a, T>,
    b: ArrayView1<'a, T>,
    c: ArrayView1<'a, T>,
    ntimes: usize,
    stream_type: Dtype,
) -> StreamValidation {
    let cast = |v: f64| T::from(v).unwrap_or_else(T::nan);
    let scalar = cast(BENCHMARK_SCALAR);
    let mut aj = cast(1.0);
    let mut bj = cast(2.0);
    let mut cj = cast(0.0);
    aj = cast(2.0) * aj;
    for _ in 0..ntimes {
        cj = aj;
        bj = scalar * cj;
        cj = aj + bj;
        aj = bj + scalar * cj;
    }

    let epsilon = stream_type.validation_epsilon();
    let arrays = [("a", a, aj), ("b", b, bj), ("c", c, cj)]
        .into_iter()
        .map(|(name, values, expected)| {
            let sum_err = values
                .iter()
                .fold(T::zero(), |acc, &v| acc + (v - expected).abs());
            let len = cast(values.len().max(1) as f64);
            let avg_rel_err = (sum_err / len / expected).abs().to_f64().unwrap_or(f64::NAN);
            let failures = values
                .iter()
                .filter(|&&v| {
                    (v / expected - T::one()).abs().to_f64().unwrap_or(f64::NAN) > epsilon
                })
                .count();
            let check = ArrayValidation {
                name,
                expected: expected.to_f64().unwrap_or(f64::NAN),
                avg_rel_err,
                failures,
                epsilon,
            };
            if !check.passed() {
                warn!(
                    "Failed validation on array {}[]: AvgRelAbsErr {:e} > epsilon {:e}; {} elements differ",
                    name, check.avg_rel_err, epsilon, check.failures
                );
            }
            check
        })
        .collect();
    StreamValidation { arrays }
}

impl fmt::Display for StreamValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            writeln!(
                f,
                "Solution Validates: avg error less than {:e} on all three arrays",
                self.arrays.first().map_or(0.0, |a| a.epsilon)
            )?;
        }
        for check in &self.arrays {
            writeln!(
                f,
                "  {}[]: expected {:e}, AvgRelAbsErr {:e}, {} failing elements",
                check.name, check.expected, check.avg_rel_err, check.failures
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BLOCK_SIZE;
    use proptest::prelude::*;

    fn descriptor(kernel: StreamKernel, stream_type: Dtype) -> KernelDescriptor {
        kernel.descriptor(&GenerateOptions::new(stream_type)).unwrap()
    }

    fn triad_args(n: usize) -> KernelArgs<f64> {
        KernelArgs::new()
            .array("a", Array1::zeros(n))
            .array("b", Array1::from_iter((0..n).map(|i| i as f64)))
            .array("c", Array1::from_iter((0..n).map(|i| (n - i) as f64 * 0.5)))
            .scalar("scalar", 3.0)
    }

    #[test]
    fn test_scheduled_triad_matches_reference_at_boundaries() {
        let knl = descriptor(StreamKernel::Triad, Dtype::Float64);
        let b = BLOCK_SIZE.get() as usize;
        for n in [1, 7, 9, b - 1, b, b + 5] {
            let mut reference = triad_args(n);
            execute_reference(&knl, &mut reference).unwrap();
            let mut scheduled = triad_args(n);
            execute_scheduled(&knl, &mut scheduled).unwrap();
            assert_eq!(reference, scheduled, "n = {n}");
            assert_eq!(scheduled.arrays["a"][n - 1], (n - 1) as f64 + 3.0 * 0.5);
        }
    }

    #[test]
    fn test_init_writes_every_array() {
        let knl = descriptor(StreamKernel::Init, Dtype::Float32);
        let mut args = KernelArgs::new()
            .array("a", Array1::from_elem(10, f32::NAN))
            .array("b", Array1::from_elem(10, f32::NAN))
            .array("c", Array1::from_elem(10, f32::NAN));
        execute_scheduled(&knl, &mut args).unwrap();
        assert_eq!(args.arrays["a"], Array1::from_elem(10, 1.0));
        assert_eq!(args.arrays["b"], Array1::from_elem(10, 2.0));
        assert_eq!(args.arrays["c"], Array1::from_elem(10, 0.0));
    }

    #[test]
    fn test_argument_errors() {
        let knl = descriptor(StreamKernel::Copy, Dtype::Float64);
        let mut missing = KernelArgs::new().array("a", Array1::<f64>::zeros(4));
        assert_eq!(
            execute_scheduled(&knl, &mut missing),
            Err(VerificationError::MissingArgument("b".to_string()))
        );

        let mut mismatched = KernelArgs::new()
            .array("a", Array1::<f64>::zeros(4))
            .array("b", Array1::<f64>::zeros(5));
        assert!(matches!(
            execute_scheduled(&knl, &mut mismatched),
            Err(VerificationError::LengthMismatch { len: 5, n: 4, .. })
        ));

        let mut wrong_type = KernelArgs::new()
            .array("a", Array1::<f32>::zeros(4))
            .array("b", Array1::<f32>::zeros(4));
        assert!(matches!(
            execute_scheduled(&knl, &mut wrong_type),
            Err(VerificationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_stream_benchmark_validates() {
        for stream_type in [Dtype::Float32, Dtype::Float64] {
            let validation = run_stream_benchmark(1000, 3, stream_type).unwrap();
            assert!(validation.passed(), "{stream_type}: {validation}");
            assert_eq!(
                validation.arrays.iter().map(|a| a.name).collect::<Vec<_>>(),
                ["a", "b", "c"]
            );
            assert!(validation.arrays.iter().all(|a| a.failures == 0));
        }
    }

    #[test]
    fn test_stream_benchmark_requires_an_iteration() {
        assert_eq!(
            run_stream_benchmark(16, 0, Dtype::Float64),
            Err(VerificationError::NoIterations)
        );
    }

    #[test]
    fn test_check_stream_results_detects_corruption() {
        // After one round: a = 2, c = 2 -> b = 6, c = 8, a = 30.
        let n = 100;
        let a = Array1::from_elem(n, 30.0f64);
        let b = Array1::from_elem(n, 6.0f64);
        let mut c = Array1::from_elem(n, 8.0f64);
        assert!(check_stream_results(a.view(), b.view(), c.view(), 1, Dtype::Float64).passed());

        c[17] = 9.0;
        let validation = check_stream_results(a.view(), b.view(), c.view(), 1, Dtype::Float64);
        assert!(!validation.passed());
        assert_eq!(validation.arrays[2].failures, 1);
        assert!(validation.arrays[..2].iter().all(ArrayValidation::passed));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_scheduled_matches_reference_for_any_size(n in 1usize..300_000) {
            let knl = descriptor(StreamKernel::Triad, Dtype::Float64);
            let mut reference = triad_args(n);
            execute_reference(&knl, &mut reference).unwrap();
            let mut scheduled = triad_args(n);
            execute_scheduled(&knl, &mut scheduled).unwrap();
            prop_assert_eq!(reference, scheduled);
        }
    }
}
