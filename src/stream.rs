//! The six STREAM kernels and the entry points which turn them into source text.

use crate::codegen::{self, EmitError, HeaderEmitter, TargetId};
use crate::common::{ConfigError, Dtype};
use crate::kernel::{DescriptorError, KernelDescriptor};
use crate::transform::{apply_transforms, stream_pipeline, TransformError};

use log::{debug, error, info};
use strum::IntoEnumIterator;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumIter,
    strum::Display,
    strum::IntoStaticStr,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
pub enum StreamKernel {
    Init,
    #[value(name = "selfscale")]
    SelfScale,
    Copy,
    Scale,
    Add,
    Triad,
}

/// Settings shared by every kernel of a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateOptions {
    pub stream_type: Dtype,
    pub target: TargetId,
    pub streaming_stores: bool,
    pub include_schedule: bool,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum GenerateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

impl StreamKernel {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// The kernel's assignments, one per line.
    pub fn instructions(&self) -> &'static str {
        match self {
            StreamKernel::Init => {
                "
                a[i] = 1
                b[i] = 2
                c[i] = 0
                "
            }
            StreamKernel::SelfScale => "a[i] = scalar *a[i]",
            StreamKernel::Copy => "a[i] = b[i]",
            StreamKernel::Scale => "a[i] = scalar * b[i]",
            StreamKernel::Add => "a[i] = b[i] + c[i]",
            StreamKernel::Triad => "a[i] = b[i] + scalar * c[i]",
        }
    }

    /// The kernel's operands, in parameter order.
    pub fn operands(&self) -> &'static str {
        match self {
            StreamKernel::Init => "a,b,c",
            StreamKernel::SelfScale => "a, scalar",
            StreamKernel::Copy => "a,b",
            StreamKernel::Scale => "a,b,scalar",
            StreamKernel::Add => "a,b,c",
            StreamKernel::Triad => "a,b,c,scalar",
        }
    }

    /// Build and transform this kernel without emitting it.
    pub fn descriptor(&self, options: &GenerateOptions) -> Result<KernelDescriptor, GenerateError> {
        transformed_descriptor(
            self.name(),
            self.instructions(),
            self.operands(),
            options,
        )
    }
}

impl GenerateOptions {
    /// Options for the ISPC target without streaming stores or schedule comments.
    pub fn new(stream_type: Dtype) -> Self {
        GenerateOptions {
            stream_type,
            target: TargetId::default(),
            streaming_stores: false,
            include_schedule: false,
        }
    }

    /// Like [GenerateOptions::new], reading the stream type from its name.
    pub fn for_stream_type(name: &str) -> Result<Self, GenerateError> {
        Ok(GenerateOptions::new(name.parse()?))
    }
}

/// Generate the ISPC source of one kernel.
///
/// # Examples
/// ```
/// # use streamgen::common::Dtype;
/// # use streamgen::stream::generate;
/// let src = generate("copy", "a[i] = b[i]", "a,b", Dtype::Float64, false).unwrap();
/// assert!(src.contains("export void stream_copy_tasks("));
/// ```
pub fn generate(
    kernel_name: &str,
    statements: &str,
    operand_names: &str,
    element_type: Dtype,
    use_streaming_stores: bool,
) -> Result<String, GenerateError> {
    let options = GenerateOptions {
        streaming_stores: use_streaming_stores,
        ..GenerateOptions::new(element_type)
    };
    generate_with(&options, kernel_name, statements, operand_names)
}

/// Generate the source of one kernel for any target.
pub fn generate_with(
    options: &GenerateOptions,
    kernel_name: &str,
    statements: &str,
    operand_names: &str,
) -> Result<String, GenerateError> {
    let knl = transformed_descriptor(kernel_name, statements, operand_names, options)?;
    let mut out = String::new();
    codegen::emit(&knl, options.target, options.include_schedule, &mut out)?;
    Ok(out)
}

/// Generate `kernels`, each followed by a blank line, after the target's
/// header. Every kernel is attempted; if any fails, the first error is returned
/// and no text is.
pub fn generate_kernels(
    options: &GenerateOptions,
    kernels: &[StreamKernel],
) -> Result<String, GenerateError> {
    let mut out = String::new();
    HeaderEmitter::new()
        .emit(options.target, &mut out)
        .map_err(EmitError::from)?;

    let mut first_error = None;
    for kernel in kernels {
        match generate_with(options, kernel.name(), kernel.instructions(), kernel.operands()) {
            Ok(src) => {
                out.push_str(&src);
                out.push('\n');
            }
            Err(e) => {
                error!("Failed to generate {kernel}: {e}");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    info!(
        "Generated {} kernels for {:?} with stream type {}",
        kernels.len(),
        options.target,
        options.stream_type
    );
    Ok(out)
}

/// Generate all six STREAM kernels.
pub fn generate_all(options: &GenerateOptions) -> Result<String, GenerateError> {
    generate_kernels(options, &StreamKernel::iter().collect::<Vec<_>>())
}

fn transformed_descriptor(
    kernel_name: &str,
    statements: &str,
    operand_names: &str,
    options: &GenerateOptions,
) -> Result<KernelDescriptor, GenerateError> {
    let knl = KernelDescriptor::new(kernel_name, statements, operand_names)?;
    let pipeline = stream_pipeline(operand_names, options.stream_type, options.streaming_stores);
    debug!("Transforming {kernel_name} with {} transforms", pipeline.len());
    Ok(apply_transforms(knl, &pipeline)?)
}
