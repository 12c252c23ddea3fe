use super::TargetId;

use std::fmt;

/// Emits the preamble shared by all kernels of one generated source file.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderEmitter;

impl HeaderEmitter {
    pub fn new() -> Self {
        HeaderEmitter
    }

    pub fn emit<W: fmt::Write>(&self, target: TargetId, out: &mut W) -> fmt::Result {
        writeln!(
            out,
            "// STREAM kernels generated by streamgen {}",
            env!("CARGO_PKG_VERSION")
        )?;
        match target {
            TargetId::Ispc => {}
            TargetId::C => {
                writeln!(out, "#include <stdint.h>")?;
            }
        }
        out.write_char('\n')
    }
}
