//! Small helpers shared across the broker.

use std::fmt::Write;

/// Format a byte slice as space-separated lowercase hex, for raw-frame
/// log lines.
pub fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[]), "");
        assert_eq!(to_hex(&[0x20, 0x02, 0x00, 0x00]), "20 02 00 00");
        assert_eq!(to_hex(&[0xff]), "ff");
    }
}
