pub mod codegen;
pub mod common;
pub mod expr;
pub mod kernel;
pub mod parse;
pub mod pprint;
pub mod schedule;
pub mod stream;
pub mod transform;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;
