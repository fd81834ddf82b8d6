//! Byte-level decoding and value rendering for field steps.

use crate::definition::{ByteOrder, Encoding, FieldDef, PrintMode};
use crate::output::Line;
use crate::store::{Variable, Width};

/// Bytes reordered most significant first
pub(crate) fn logical_bytes(bytes: &[u8], order: ByteOrder) -> Vec<u8> {
    match order {
        ByteOrder::Big => bytes.to_vec(),
        ByteOrder::Little => bytes.iter().rev().copied().collect(),
    }
}

/// Unsigned integer from the (at most 8) most significant bytes
pub(crate) fn read_uint(bytes: &[u8], order: ByteOrder) -> u64 {
    logical_bytes(bytes, order)
        .iter()
        .take(8)
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Two's-complement sign extension of an `n`-byte value
pub(crate) fn sign_extend(value: u64, n: usize) -> i64 {
    match n {
        0 => 0,
        n if n >= 8 => value as i64,
        n => {
            let shift = 64 - n as u32 * 8;
            ((value << shift) as i64) >> shift
        }
    }
}

/// Uppercase hex digits, no separators
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Decodes text, dropping trailing NULs
pub(crate) fn decode_text(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Ascii => trim_nul(bytes)
            .iter()
            .map(|&b| {
                if (0x20..0x7F).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect(),
        Encoding::Utf8 => String::from_utf8_lossy(trim_nul(bytes)).into_owned(),
        Encoding::Latin1 => trim_nul(bytes).iter().map(|&b| b as char).collect(),
        Encoding::Utf16Le | Encoding::Utf16Be => {
            let units = bytes.chunks_exact(2).map(|pair| match encoding {
                Encoding::Utf16Le => u16::from_le_bytes([pair[0], pair[1]]),
                _ => u16::from_be_bytes([pair[0], pair[1]]),
            });
            let text: String = char::decode_utf16(units)
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect();
            text.trim_end_matches('\0').to_string()
        }
    }
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Numeric value of a field, after mask and shift
pub(crate) fn field_value(field: &FieldDef, bytes: &[u8], order: ByteOrder) -> u64 {
    let raw = read_uint(bytes, order);
    field.bits.map_or(raw, |bits| bits.extract(raw))
}

/// Result of rendering one field
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rendered {
    /// Right-hand side of the field's line
    pub(crate) value: String,
    /// Follow-up lines (one per set flag)
    pub(crate) extra: Vec<Line>,
    /// False when the value fell outside the option or flag table
    pub(crate) known: bool,
}

impl Rendered {
    fn known(value: String) -> Self {
        Self {
            value,
            extra: Vec::new(),
            known: true,
        }
    }
}

/// Renders a field's bytes according to its print mode
pub(crate) fn render(field: &FieldDef, bytes: &[u8], order: ByteOrder) -> Rendered {
    let numeric = field.bits.is_some() || bytes.len() <= 8;
    let value = field_value(field, bytes, order);

    match field.print {
        PrintMode::Raw if field.bits.is_some() => Rendered::known(format!("{:X}", value)),
        PrintMode::Raw => Rendered::known(hex_string(bytes)),
        PrintMode::Text => Rendered::known(decode_text(bytes, field.encoding)),
        PrintMode::Hex | PrintMode::Signed | PrintMode::Unsigned if !numeric => {
            Rendered::known(hex_string(&logical_bytes(bytes, order)))
        }
        PrintMode::Hex => Rendered::known(format!("{:X}", value)),
        PrintMode::Unsigned => Rendered::known(value.to_string()),
        PrintMode::Signed if field.bits.is_some() => Rendered::known(value.to_string()),
        PrintMode::Signed => Rendered::known(sign_extend(value, bytes.len()).to_string()),
        PrintMode::Options => render_option(field, bytes, order, value),
        PrintMode::Flags => render_flags(field, value),
    }
}

fn render_option(field: &FieldDef, bytes: &[u8], order: ByteOrder, value: u64) -> Rendered {
    let logical = logical_bytes(bytes, order);
    let found = field.options.iter().find(|option| match field.bits {
        Some(_) => pattern_value(&option.pattern) == Some(value),
        None => option.pattern == logical,
    });
    match found {
        Some(option) => Rendered::known(option.name.clone()),
        None => Rendered {
            value: String::new(),
            extra: Vec::new(),
            known: false,
        },
    }
}

fn pattern_value(pattern: &[u8]) -> Option<u64> {
    (pattern.len() <= 8).then(|| pattern.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

fn render_flags(field: &FieldDef, value: u64) -> Rendered {
    let set: Vec<_> = field
        .flags
        .iter()
        .filter(|flag| value & flag.mask != 0)
        .collect();
    let covered = field.flags.iter().fold(0u64, |acc, flag| acc | flag.mask);

    Rendered {
        value: set
            .iter()
            .map(|flag| flag.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        extra: set
            .iter()
            .map(|flag| Line::new(flag.name.clone(), flag.meaning.clone()))
            .collect(),
        known: value & !covered == 0,
    }
}

/// Variable captured from a field: raw bytes plus its numeric value
pub(crate) fn capture(field: &FieldDef, bytes: &[u8], order: ByteOrder) -> Variable {
    let width = Width::fitting(bytes.len());
    let value = field_value(field, bytes, order);
    let variable = if field.print == PrintMode::Signed && field.bits.is_none() {
        Variable::signed(width, sign_extend(value, bytes.len().min(8)))
    } else {
        Variable::unsigned(width, value)
    };
    variable.with_raw(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{BitField, FlagEntry, OptionEntry, SizeMode};
    use crate::store::Value;

    fn field(size: usize, print: PrintMode) -> FieldDef {
        let mut field = FieldDef::new("f", SizeMode::Fixed(size));
        field.print = print;
        field
    }

    #[test]
    fn test_read_uint() {
        assert_eq!(read_uint(&[0x01, 0x00, 0x00, 0x00], ByteOrder::Little), 1);
        assert_eq!(read_uint(&[0x01, 0x00, 0x00, 0x00], ByteOrder::Big), 0x0100_0000);
        assert_eq!(read_uint(&[], ByteOrder::Big), 0);
        assert_eq!(read_uint(&[0xAA; 10], ByteOrder::Big), 0xAAAA_AAAA_AAAA_AAAA);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xFF, 1), -1);
        assert_eq!(sign_extend(0x7F, 1), 127);
        assert_eq!(sign_extend(0xFFFE, 2), -2);
        assert_eq!(sign_extend(0x00FF_FFFF, 3), -1);
        assert_eq!(sign_extend(u64::MAX, 8), -1);
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"ab\x01c\0\0", Encoding::Ascii), "ab.c");
        assert_eq!(decode_text("h\u{e9}".as_bytes(), Encoding::Utf8), "h\u{e9}");
        assert_eq!(decode_text(&[0x68, 0xE9], Encoding::Latin1), "h\u{e9}");
        assert_eq!(decode_text(&[0x68, 0x00, 0x69, 0x00, 0, 0], Encoding::Utf16Le), "hi");
        assert_eq!(decode_text(&[0x00, 0x68, 0x00, 0x69], Encoding::Utf16Be), "hi");
    }

    #[test]
    fn test_render_numeric_modes() {
        let bytes = [0xFE, 0xFF];
        let little = ByteOrder::Little;
        assert_eq!(render(&field(2, PrintMode::Raw), &bytes, little).value, "FEFF");
        assert_eq!(render(&field(2, PrintMode::Hex), &bytes, little).value, "FFFE");
        assert_eq!(render(&field(2, PrintMode::Unsigned), &bytes, little).value, "65534");
        assert_eq!(render(&field(2, PrintMode::Signed), &bytes, little).value, "-2");
    }

    #[test]
    fn test_render_wide_field_as_hex() {
        let bytes: Vec<u8> = (1..=10).collect();
        let rendered = render(&field(10, PrintMode::Unsigned), &bytes, ByteOrder::Little);
        assert_eq!(rendered.value, "0A090807060504030201");
    }

    #[test]
    fn test_render_bit_field() {
        let mut f = field(1, PrintMode::Unsigned);
        f.bits = Some(BitField {
            mask: 0xF0,
            shift: 4,
        });
        assert_eq!(render(&f, &[0xA5], ByteOrder::Big).value, "10");
    }

    #[test]
    fn test_render_options() {
        let mut f = field(2, PrintMode::Options);
        f.options = vec![
            OptionEntry {
                name: "One".into(),
                pattern: vec![0x00, 0x01],
            },
            OptionEntry {
                name: "Two".into(),
                pattern: vec![0x00, 0x02],
            },
        ];
        let rendered = render(&f, &[0x02, 0x00], ByteOrder::Little);
        assert!(rendered.known);
        assert_eq!(rendered.value, "Two");

        let rendered = render(&f, &[0x02, 0x00], ByteOrder::Big);
        assert!(!rendered.known);
        assert_eq!(rendered.value, "");
    }

    #[test]
    fn test_render_flags() {
        let mut f = field(1, PrintMode::Flags);
        f.flags = vec![
            FlagEntry {
                name: "R".into(),
                mask: 0x01,
                meaning: "readable".into(),
            },
            FlagEntry {
                name: "W".into(),
                mask: 0x02,
                meaning: "writable".into(),
            },
        ];
        let rendered = render(&f, &[0x03], ByteOrder::Big);
        assert!(rendered.known);
        assert_eq!(rendered.value, "R, W");
        assert_eq!(rendered.extra[1], Line::new("W", "writable"));

        let rendered = render(&f, &[0x05], ByteOrder::Big);
        assert!(!rendered.known);
        assert_eq!(rendered.value, "R");
    }

    #[test]
    fn test_capture() {
        let var = capture(&field(2, PrintMode::Signed), &[0xFF, 0xFF], ByteOrder::Big);
        assert_eq!(var.width, Width::Word);
        assert_eq!(var.value, Value::Signed(-1));
        assert_eq!(var.raw, vec![0xFF, 0xFF]);

        let var = capture(&field(3, PrintMode::Raw), &[0x01, 0x02, 0x03], ByteOrder::Little);
        assert_eq!(var.width, Width::Dword);
        assert_eq!(var.value, Value::Unsigned(0x030201));
    }
}
