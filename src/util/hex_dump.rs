use std::fmt::{Debug, Display, Formatter, Write};

/// Renders a byte buffer as a memory dump for trace logging: 16 bytes per line, offset, hex in
///  two-byte groups, and the ASCII representation with '.' for anything unprintable.
///
/// The formatting is deferred until the value is actually displayed, so passing a `HexDump` to a
///  disabled `trace!` costs nothing.
pub struct HexDump<'a>(pub &'a [u8]);

impl Display for HexDump<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (line_no, line) in self.0.chunks(16).enumerate() {
            let mut hex = String::with_capacity(40);
            for (i, pair) in line.chunks(2).enumerate() {
                if i > 0 {
                    hex.push(' ');
                }
                for b in pair {
                    write!(hex, "{:02x}", b)?;
                }
            }

            let ascii = line.iter()
                .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
                .collect::<String>();

            writeln!(f, "{:>6x}: {:<39} {}", line_no * 16, hex, ascii)?;
        }
        Ok(())
    }
}

impl Debug for HexDump<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_single_line() {
        let dump = HexDump(b"A\x00BC").to_string();
        assert!(dump.starts_with("     0: 4100 4243 "));
        assert!(dump.ends_with(" A.BC\n"));
        assert_eq!(dump.len(), 8 + 39 + 1 + 4 + 1);
    }

    #[test]
    fn test_multiple_lines() {
        let data = (0u8..20).collect::<Vec<_>>();
        let dump = HexDump(&data).to_string();
        let lines = dump.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("     0: 0001 0203 0405 0607 0809 0a0b 0c0d 0e0f"));
        assert!(lines[1].starts_with("    10: 1011 1213"));
    }

    #[test]
    fn test_empty() {
        assert_eq!(HexDump(&[]).to_string(), "");
    }
}
