use std::fmt;

/// Renders bytes as a quoted byte-string literal, e.g. `b'ls\r\n'`.
///
/// Printable ASCII passes through; `\t`, `\n`, `\r` and the backslash use their
/// short escapes; everything else becomes `\xNN`. Single quotes delimit the
/// literal unless the data contains `'` and no `"`.
#[derive(Clone, Copy)]
pub struct ByteLiteral<'a>(pub &'a [u8]);

impl ByteLiteral<'_> {
    fn quote(&self) -> u8 {
        if self.0.contains(&b'\'') && !self.0.contains(&b'"') {
            b'"'
        } else {
            b'\''
        }
    }
}

impl fmt::Display for ByteLiteral<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = self.quote();
        f.write_str("b")?;
        f.write_str(if quote == b'"' { "\"" } else { "'" })?;

        for &b in self.0 {
            match b {
                b'\\' => f.write_str("\\\\")?,
                b'\t' => f.write_str("\\t")?,
                b'\n' => f.write_str("\\n")?,
                b'\r' => f.write_str("\\r")?,
                _ if b == quote => write!(f, "\\{}", b as char)?,
                0x20..=0x7e => write!(f, "{}", b as char)?,
                _ => write!(f, "\\x{b:02x}")?,
            }
        }

        f.write_str(if quote == b'"' { "\"" } else { "'" })
    }
}

impl fmt::Debug for ByteLiteral<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
