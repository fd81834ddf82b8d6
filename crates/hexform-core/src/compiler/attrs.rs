//! Attribute extraction and literal parsing for definition elements.
//!
//! Every element's attributes are collected up front into an [`Attrs`]. Handlers
//! take what they understand; [`Attrs::finish`] then rejects anything left over,
//! so a misspelled attribute is an error rather than silently ignored.

use crate::error::{CompileError, CompileErrorKind, Position};
use crate::store::Width;
use quick_xml::events::BytesStart;
use std::str::FromStr;

/// Attributes of one element, with consumption tracking
pub(crate) struct Attrs {
    element: String,
    position: Position,
    entries: Vec<(String, String, bool)>,
}

impl Attrs {
    /// Collects and unescapes the attributes of `start`
    pub(crate) fn parse(
        start: &BytesStart<'_>,
        element: &str,
        position: Position,
    ) -> Result<Self, CompileError> {
        let syntax = |message: String| {
            CompileError::new(position, element, CompileErrorKind::Syntax(message))
        };

        let mut entries = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| syntax(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| syntax(e.to_string()))?
                .into_owned();
            entries.push((key, value, false));
        }

        Ok(Self {
            element: element.to_string(),
            position,
            entries,
        })
    }

    /// Builds an error located at this element
    pub(crate) fn error(&self, kind: CompileErrorKind) -> CompileError {
        CompileError::new(self.position, self.element.clone(), kind)
    }

    /// Builds an invalid-value error for `key`
    pub(crate) fn invalid(&self, key: &str, value: &str, reason: impl Into<String>) -> CompileError {
        self.error(CompileErrorKind::InvalidAttribute {
            attribute: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        })
    }

    /// Returns true if `key` is present and not yet taken
    pub(crate) fn has(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _, used)| k == key && !used)
    }

    /// Takes an optional attribute
    pub(crate) fn take(&mut self, key: &str) -> Option<String> {
        self.entries
            .iter_mut()
            .find(|(k, _, used)| k == key && !*used)
            .map(|(_, value, used)| {
                *used = true;
                value.clone()
            })
    }

    /// Takes a required attribute
    pub(crate) fn required(&mut self, key: &str) -> Result<String, CompileError> {
        self.take(key)
            .ok_or_else(|| self.error(CompileErrorKind::MissingAttribute(key.to_string())))
    }

    /// Takes a boolean attribute, absent meaning false
    pub(crate) fn flag(&mut self, key: &str) -> Result<bool, CompileError> {
        match self.take(key).as_deref() {
            None | Some("false") => Ok(false),
            Some("true") => Ok(true),
            Some(other) => Err(self.invalid(key, other, "expected 'true' or 'false'")),
        }
    }

    /// Takes an attribute parsed with [`FromStr`]
    pub(crate) fn number<T: FromStr>(&mut self, key: &str) -> Result<Option<T>, CompileError> {
        match self.take(key) {
            None => Ok(None),
            Some(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, &text, "expected a non-negative integer")),
        }
    }

    /// Takes a variable width of 1, 2, 4 or 8 bytes
    pub(crate) fn width(&mut self, key: &str) -> Result<Option<Width>, CompileError> {
        let Some(text) = self.take(key) else {
            return Ok(None);
        };
        text.trim()
            .parse::<usize>()
            .ok()
            .and_then(Width::from_bytes)
            .map(Some)
            .ok_or_else(|| self.invalid(key, &text, "expected 1, 2, 4 or 8"))
    }

    /// Takes an even-length hex byte pattern
    pub(crate) fn hex(&mut self, key: &str) -> Result<Option<Vec<u8>>, CompileError> {
        match self.take(key) {
            None => Ok(None),
            Some(text) => parse_hex(&text)
                .map(Some)
                .ok_or_else(|| self.error(CompileErrorKind::MalformedHex(text))),
        }
    }

    /// Takes a required hex byte pattern
    pub(crate) fn required_hex(&mut self, key: &str) -> Result<Vec<u8>, CompileError> {
        let text = self.required(key)?;
        parse_hex(&text).ok_or_else(|| self.error(CompileErrorKind::MalformedHex(text)))
    }

    /// Rejects attributes nobody took
    pub(crate) fn finish(self) -> Result<(), CompileError> {
        match self.entries.iter().find(|(_, _, used)| !used) {
            Some((key, _, _)) => Err(self.error(CompileErrorKind::UnexpectedAttribute(key.clone()))),
            None => Ok(()),
        }
    }
}

/// Parses an even-length, non-empty hex string
pub(crate) fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() || text.len() % 2 != 0 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Big-endian integer value of at most 8 bytes
pub(crate) fn hex_value(bytes: &[u8]) -> Option<u64> {
    if bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

/// Parses a decimal (optionally negative) or `0x`-prefixed integer literal
pub(crate) fn parse_literal(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as i64);
    }
    text.parse().ok()
}

/// Returns true for `[A-Za-z_][A-Za-z0-9_.]*`
pub(crate) fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
