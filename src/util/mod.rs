use std::fmt;
use std::io;

use crate::disk::DiskError;

const PADDING_BYTE: u8 = 0xa0;

/// Write a hexdump of the provided byte slice.
pub fn hexdump(
    f: &mut fmt::Formatter,
    prefix: &str,
    buffer: &[u8],
) -> std::result::Result<(), std::fmt::Error> {
    const COLUMNS: usize = 16;
    let mut offset: usize = 0;
    if buffer.is_empty() {
        // For a zero-length buffer, at least print an offset instead of
        // nothing.
        write!(f, "{}{:04x}: ", prefix, 0)?;
    }
    while offset < buffer.len() {
        write!(f, "{}{:04x}: ", prefix, offset)?;

        // Determine row byte range
        let next_offset = offset + COLUMNS;
        let (row_size, padding) = if next_offset <= buffer.len() {
            (COLUMNS, 0)
        } else {
            (buffer.len() - offset, next_offset - buffer.len())
        };
        let row = &buffer[offset..offset + row_size];

        // Print hex representation
        for b in row {
            write!(f, "{:02x} ", b)?;
        }
        for _ in 0..padding {
            write!(f, "   ")?;
        }

        // Print ASCII representation
        for b in row {
            write!(
                f,
                "{}",
                match *b {
                    c @ 0x20..=0x7E => c as char,
                    _ => '.',
                }
            )?;
        }

        offset += COLUMNS;
        if offset < buffer.len() {
            writeln!(f)?;
        }
    }
    Ok(())
}

pub struct Hex<'a>(pub &'a [u8]);
impl<'a> fmt::Display for Hex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        hexdump(f, "", self.0)
    }
}

pub fn hex(bytes: &[u8]) -> Hex {
    Hex(bytes)
}

/// Encode `name` one byte per character into `output`, padding the
/// remainder with 0xA0.  Characters above U+00FF, and U+00A0 itself (which
/// would read back as padding), are rejected.
pub fn encode_padded(name: &str, output: &mut [u8]) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(output.len());
    for c in name.chars() {
        let code = c as u32;
        if code > 0xFF || code == PADDING_BYTE as u32 {
            return Err(DiskError::InvalidFilename.into());
        }
        bytes.push(code as u8);
    }
    if bytes.len() > output.len() {
        return Err(DiskError::FilenameTooLong.into());
    }
    output[..bytes.len()].copy_from_slice(&bytes);
    output[bytes.len()..]
        .iter_mut()
        .for_each(|b| *b = PADDING_BYTE);
    Ok(())
}

/// Decode a 0xA0-padded field, stopping at the first padding byte.
pub fn decode_padded(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|b| **b != PADDING_BYTE)
        .map(|b| *b as char)
        .collect()
}
