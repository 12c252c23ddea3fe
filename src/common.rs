use nonzero::nonzero as nz;
use std::fmt::Display;
use std::num::NonZeroU32;
use std::str::FromStr;

pub type DimSize = NonZeroU32;

/// Elements processed by one parallel task.
pub const BLOCK_SIZE: DimSize = nz!(262144u32); // 2^18

/// Width of the SIMD gang within a block.
pub const LANE_WIDTH: DimSize = nz!(8u32);

/// Name of the loop index of every kernel's domain.
pub const LOOP_INDEX: &str = "i";

/// Name of the symbolic domain size, which is always the last parameter.
pub const SIZE_PARAM: &str = "n";

/// The element type ("stream type") of a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Float32,
    Float64,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unrecognized stream type {0:?}; expected one of float32, float64")]
    UnknownStreamType(String),
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Float32 => 4,
            Dtype::Float64 => 8,
        }
    }

    /// Tolerance on the average relative error used when validating STREAM results.
    pub fn validation_epsilon(&self) -> f64 {
        match self {
            Dtype::Float32 => 1e-6,
            Dtype::Float64 => 1e-13,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Float64 => write!(f, "f64"),
        }
    }
}

impl FromStr for Dtype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "float32" => Ok(Dtype::Float32),
            "float64" => Ok(Dtype::Float64),
            other => Err(ConfigError::UnknownStreamType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_is_a_multiple_of_lane_width() {
        assert_eq!(BLOCK_SIZE.get() % LANE_WIDTH.get(), 0);
    }

    #[test]
    fn test_parse_stream_type() {
        assert_eq!("float64".parse::<Dtype>(), Ok(Dtype::Float64));
        assert_eq!(" float32 ".parse::<Dtype>(), Ok(Dtype::Float32));
        for alias in ["f32", "float", "f64", "double", "Float64"] {
            assert_eq!(
                alias.parse::<Dtype>(),
                Err(ConfigError::UnknownStreamType(alias.to_string()))
            );
        }
        assert_eq!(
            "int32".parse::<Dtype>(),
            Err(ConfigError::UnknownStreamType("int32".to_string()))
        );
        assert!("".parse::<Dtype>().is_err());
    }

    #[test]
    fn test_wider_type_has_tighter_epsilon() {
        assert!(Dtype::Float64.validation_epsilon() < Dtype::Float32.validation_epsilon());
        assert_eq!(Dtype::Float64.size(), 2 * Dtype::Float32.size());
    }
}
