//! The DSCP/TOS name table: a small, caller-visible lookup so a CLI or
//! config file can accept `AF42`/`EF`/`0x90` interchangeably instead of
//! making every caller memorise codepoint arithmetic.

use crate::error::{NetError, NetResult};

/// `(name, byte)` pairs, DSCP 6-bit codepoint already shifted into the top
/// 6 bits (low 2 ECN bits zero). Order is significant: `CS0` is listed
/// before `DF`, so a caller doing a reverse (byte → name) lookup via
/// [`name_for`] sees `CS0` for the shared value `0x00` — see DESIGN.md for
/// why this order, not the reverse, was chosen.
const TABLE: &[(&str, u8)] = &[
    ("CS0", 0x00),
    ("CS1", 0x20),
    ("CS2", 0x40),
    ("CS3", 0x60),
    ("CS4", 0x80),
    ("CS5", 0xA0),
    ("CS6", 0xC0),
    ("CS7", 0xE0),
    ("AF11", 0x28),
    ("AF12", 0x30),
    ("AF13", 0x38),
    ("AF21", 0x48),
    ("AF22", 0x50),
    ("AF23", 0x58),
    ("AF31", 0x68),
    ("AF32", 0x70),
    ("AF33", 0x78),
    ("AF41", 0x88),
    ("AF42", 0x90),
    ("AF43", 0x98),
    ("EF", 0xB8),
    ("LE", 0x04),
    ("voice-admit", 0xB0),
    ("DF", 0x00),
    ("Maximize-Throughput", 0x08),
    ("Minimize-Delay", 0x10),
];

const ECN_MASK: u8 = 0b0000_0011;

/// Exact, case-sensitive by-name lookup. First match wins, which only
/// matters for the `CS0`/`DF` collision at `0x00`.
pub fn lookup(name: &str) -> Option<u8> {
    TABLE.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

/// Reverse lookup: the first table entry whose byte equals `code`.
pub fn name_for(code: u8) -> Option<&'static str> {
    TABLE.iter().find(|(_, v)| *v == code).map(|(n, _)| *n)
}

/// Parses a DSCP/TOS argument that is either a table name or a numeric
/// literal (decimal, `0x`, `0o`, `0b`). Rejects any value with a nonzero
/// ECN (low 2) bit.
pub fn parse(s: &str) -> NetResult<u8> {
    let byte = if let Some(v) = lookup(s) {
        v
    } else {
        parse_numeric(s)?
    };
    if byte & ECN_MASK != 0 {
        return Err(NetError::argument(format!(
            "DSCP/TOS byte {byte:#04x} has nonzero ECN bits"
        )));
    }
    Ok(byte)
}

fn parse_numeric(s: &str) -> NetResult<u8> {
    let (digits, radix) = if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (rest, 16)
    } else if let Some(rest) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (rest, 8)
    } else if let Some(rest) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (rest, 2)
    } else {
        (s, 10)
    };
    u8::from_str_radix(digits, radix)
        .map_err(|_| NetError::argument(format!("'{s}' is not a known DSCP name or numeric literal")))
}
