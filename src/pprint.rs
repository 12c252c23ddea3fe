use crate::kernel::KernelDescriptor;

use prettytable::{self, format, row, Table};
use std::fmt;

/// Pretty-print a [KernelDescriptor] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(out: &mut W, knl: &KernelDescriptor) -> fmt::Result {
    writeln!(out, "{}:", knl.function_name())?;
    for statement in &knl.statements {
        writeln!(out, "  {statement}")?;
    }
    for assumption in &knl.domain.assumptions {
        writeln!(out, "  assuming {assumption}")?;
    }
    writeln!(out)?;
    write!(out, "{}", nest_table(knl))?;
    writeln!(out)?;
    write!(out, "{}", operand_table(knl))
}

pub fn pprint_string(knl: &KernelDescriptor) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = pprint_write(&mut out, knl);
    out
}

fn nest_table(knl: &KernelDescriptor) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Loop", "Stride", "Extent", "Tag", "Slabs"]);
    for dim in knl.nest.dims() {
        table.add_row(row![
            dim.name,
            dim.stride,
            dim.extent,
            dim.tag,
            format!("({}, {})", dim.slabs.head, dim.slabs.tail)
        ]);
    }
    table.set_format(compact_format());
    table
}

fn operand_table(knl: &KernelDescriptor) -> Table {
    let parameters = knl.parameters();
    let mut table = Table::new();
    table.set_titles(row!["Operand", "Role", "Type", "Access", "Position"]);
    for (name, operand) in &knl.operands {
        let dtype = operand
            .dtype
            .map(|d| d.to_string())
            .unwrap_or_else(|| "?".to_string());
        let access = if operand.written { "write" } else { "read" };
        let position = parameters
            .iter()
            .position(|p| p == name)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(row![name, operand.role, dtype, access, position]);
    }
    table.set_format(compact_format());
    table
}

fn compact_format() -> format::TableFormat {
    format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build()
}
