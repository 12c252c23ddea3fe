use anyhow::Result;
use clap::Parser;
use std::fmt::Write;
use std::io;
use strum::IntoEnumIterator;

use streamgen::codegen::TargetId;
use streamgen::common::Dtype;
use streamgen::pprint::pprint_write;
use streamgen::stream::{generate_kernels, GenerateOptions, StreamKernel};
use streamgen::utils::ToWriteFmt;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Element type of every array and scalar
    #[arg(long, value_enum)]
    stream_type: Dtype,

    /// Target language
    #[arg(long, value_enum, default_value_t = TargetId::Ispc)]
    target: TargetId,

    /// Write results with non-temporal stores
    #[arg(long)]
    streaming_stores: bool,

    /// Precede each kernel with its loop nest as a comment
    #[arg(long)]
    include_schedule: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    #[command(about = "Print generated source for STREAM kernels (default: all)")]
    Emit {
        #[arg(value_enum)]
        kernels: Vec<StreamKernel>,
    },
    #[command(about = "Print the transformed loop nest and operands of STREAM kernels")]
    Show {
        #[arg(value_enum)]
        kernels: Vec<StreamKernel>,
    },
    #[cfg(feature = "verification")]
    #[command(about = "Run and validate the STREAM sequence with the loop-nest interpreter")]
    Check {
        #[arg(long, default_value = "1000000")]
        size: usize,
        #[arg(long, default_value = "10")]
        ntimes: usize,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let options = GenerateOptions {
        stream_type: args.stream_type,
        target: args.target,
        streaming_stores: args.streaming_stores,
        include_schedule: args.include_schedule,
    };
    let mut stdout = ToWriteFmt(io::stdout().lock());

    match &args.command {
        Command::Emit { kernels } => {
            let src = generate_kernels(&options, &selected(kernels))?;
            stdout.write_str(&src)?;
        }
        Command::Show { kernels } => {
            for (idx, kernel) in selected(kernels).into_iter().enumerate() {
                if idx > 0 {
                    writeln!(stdout)?;
                }
                pprint_write(&mut stdout, &kernel.descriptor(&options)?)?;
            }
        }
        #[cfg(feature = "verification")]
        Command::Check { size, ntimes } => {
            let start_time = std::time::Instant::now();
            let validation =
                streamgen::verification::run_stream_benchmark(*size, *ntimes, options.stream_type)?;
            log::info!("STREAM check took {:?}", start_time.elapsed());
            write!(stdout, "{validation}")?;
            if !validation.passed() {
                anyhow::bail!("STREAM validation failed");
            }
        }
    }
    Ok(())
}

fn selected(kernels: &[StreamKernel]) -> Vec<StreamKernel> {
    if kernels.is_empty() {
        StreamKernel::iter().collect()
    } else {
        kernels.to_vec()
    }
}
