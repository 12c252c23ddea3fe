use std::fmt;
use std::io;

const INDENT_SIZE: usize = 2;

/// Wraps an [io::Write] for use as a [fmt::Write].
pub struct ToWriteFmt<T: io::Write>(pub T);

// Wraps a [fmt::Write] to prepend [str] to each line.
pub struct LinePrefixWrite<'a, W: fmt::Write>(W, &'a str, bool);

impl<T: io::Write> fmt::Write for ToWriteFmt<T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl<'a, W: fmt::Write> LinePrefixWrite<'a, W> {
    pub fn new(inner: W, line_prefix: &'a str) -> Self {
        LinePrefixWrite(inner, line_prefix, true)
    }
}

impl<W: fmt::Write> fmt::Write for LinePrefixWrite<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for line in s.split_inclusive('\n') {
            if self.2 {
                // Empty lines get the prefix without its trailing whitespace.
                if line == "\n" {
                    self.0.write_str(self.1.trim_end())?;
                } else {
                    self.0.write_str(self.1)?;
                }
            }
            self.0.write_str(line)?;
            self.2 = line.ends_with('\n');
        }
        Ok(())
    }
}

pub fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_line_prefix_write_prefixes_each_line() {
        let mut out = String::new();
        {
            let mut w = LinePrefixWrite::new(&mut out, "// ");
            write!(w, "one\ntw").unwrap();
            writeln!(w, "o").unwrap();
            writeln!(w, "three").unwrap();
        }
        assert_eq!(out, "// one\n// two\n// three\n");
    }

    #[test]
    fn test_line_prefix_write_trims_prefix_on_empty_lines() {
        let mut out = String::new();
        {
            let mut w = LinePrefixWrite::new(&mut out, "// ");
            write!(w, "one\n\n").unwrap();
            writeln!(w).unwrap();
            write!(w, "").unwrap();
            writeln!(w, "two").unwrap();
        }
        assert_eq!(out, "// one\n//\n//\n// two\n");
    }

    #[test]
    fn test_indent() {
        assert_eq!(indent(0), "");
        assert_eq!(indent(2), "    ");
    }
}
