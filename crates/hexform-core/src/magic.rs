//! Signature matching.
//!
//! Decides whether a buffer belongs to a format by trying its magic candidates
//! in document order. Each candidate is a straight-line program of literal
//! matches and raw reads; the first one to complete every step wins. Candidates
//! run against their own transient [`VariableStore`], so detection never touches
//! the state of a real interpretation run.

use crate::definition::{Definition, MagicStep, Operand, Signature};
use crate::interpreter::decode::read_uint;
use crate::store::{Variable, VariableStore};
use tracing::trace;

/// Runs the magic candidates of one definition
#[derive(Debug, Clone, Copy)]
pub struct SignatureMatcher<'d> {
    definition: &'d Definition,
}

impl<'d> SignatureMatcher<'d> {
    /// Creates a matcher for `definition`
    pub fn new(definition: &'d Definition) -> Self {
        Self { definition }
    }

    /// Index of the first candidate accepting `data`
    pub fn matching_signature(&self, data: &[u8]) -> Option<usize> {
        self.definition
            .signatures()
            .iter()
            .position(|signature| self.accepts(signature, data))
    }

    /// Returns true if any candidate accepts `data`
    pub fn matches(&self, data: &[u8]) -> bool {
        self.matching_signature(data).is_some()
    }

    fn accepts(&self, signature: &Signature, data: &[u8]) -> bool {
        let mut store = VariableStore::new(self.definition.variables().len());
        let mut cursor = 0usize;

        for (index, step) in signature.steps.iter().enumerate() {
            let ok = match step {
                MagicStep::Match { pattern, offset } => {
                    let Some(at) = position(*offset, cursor, &store) else {
                        return false;
                    };
                    match slice(data, at, pattern.len()) {
                        Some(bytes) => {
                            cursor = at + pattern.len();
                            bytes == pattern.as_slice()
                        }
                        None => false,
                    }
                }
                MagicStep::Read { var, width, offset } => {
                    let Some(at) = position(*offset, cursor, &store) else {
                        return false;
                    };
                    match slice(data, at, width.bytes()) {
                        Some(bytes) => {
                            let order = self.definition.endianness().resolve(&store);
                            let value = read_uint(bytes, order);
                            store.set(*var, Variable::unsigned(*width, value).with_raw(bytes));
                            cursor = at + width.bytes();
                            true
                        }
                        None => false,
                    }
                }
            };
            if !ok {
                trace!(
                    "Signature of '{}' rejected at step {}",
                    self.definition.name(),
                    index
                );
                return false;
            }
        }
        trace!("Signature of '{}' accepted", self.definition.name());
        true
    }
}

/// Absolute position of a step; negative offsets never match
fn position(offset: Option<Operand>, cursor: usize, store: &VariableStore) -> Option<usize> {
    match offset {
        None => Some(cursor),
        Some(Operand::Literal(value)) => usize::try_from(value).ok(),
        Some(Operand::Var(var)) => usize::try_from(store.integer(var).unwrap_or(0)).ok(),
    }
}

fn slice(data: &[u8], at: usize, len: usize) -> Option<&[u8]> {
    data.get(at..at.checked_add(len)?)
}

/// Returns true if any magic candidate of `definition` accepts `data`
pub fn detect(definition: &Definition, data: &[u8]) -> bool {
    SignatureMatcher::new(definition).matches(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn definition(magic: &str) -> Definition {
        let source = format!(
            r#"<format name="Magic" short="MAG">
  <endianness order="little"/>
  <magic>{magic}</magic>
  <colors/>
  <field-defs><field id="f"><size fixed="1"/></field></field-defs>
  <run/>
</format>"#
        );
        compile(&source).unwrap()
    }

    #[test]
    fn test_first_matching_candidate() {
        let def = definition(
            r#"<signature><match value="4142"/></signature>
<signature><match value="4344"/></signature>"#,
        );
        let matcher = SignatureMatcher::new(&def);
        assert_eq!(matcher.matching_signature(b"AB.."), Some(0));
        assert_eq!(matcher.matching_signature(b"CD.."), Some(1));
        assert_eq!(matcher.matching_signature(b"XY.."), None);
        assert!(!detect(&def, b"A"));
    }

    #[test]
    fn test_cursor_follows_steps() {
        let def = definition(r#"<signature><match value="01"/><match value="02"/></signature>"#);
        assert!(detect(&def, &[1, 2]));
        assert!(!detect(&def, &[1, 3, 2]));
    }

    #[test]
    fn test_absolute_offset() {
        let def = definition(r#"<signature><match value="5A" offset="3"/><match value="5B"/></signature>"#);
        assert!(detect(&def, &[0, 0, 0, 0x5A, 0x5B]));
        assert!(!detect(&def, &[0x5A, 0x5B]));
    }

    #[test]
    fn test_read_drives_offset() {
        let def = definition(
            r#"<signature><read var="at" size="2"/><match value="FF" offset="at"/></signature>"#,
        );
        assert!(detect(&def, &[0x04, 0x00, 0, 0, 0xFF]));
        assert!(!detect(&def, &[0x04, 0x00, 0xFF]));
        assert!(!detect(&def, &[0x04]));
    }

    #[test]
    fn test_offset_near_address_limit_rejects() {
        let def = definition(
            r#"<signature><read var="at" size="8"/><match value="00" offset="at"/></signature>
<signature><read var="at" size="8"/><read var="n" size="1" offset="at"/></signature>"#,
        );
        assert!(!detect(&def, &[0xFF; 8]));
        assert!(!detect(&def, &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]));
    }

    #[test]
    fn test_candidates_are_isolated() {
        let def = definition(
            r#"<signature><read var="n" size="1"/><match value="EE"/></signature>
<signature><match value="00" offset="n"/></signature>"#,
        );
        // The first candidate stores n = 1 before failing; the second reads n as 0.
        assert!(!detect(&def, &[0x01, 0x00]));
        assert!(detect(&def, &[0x00, 0x00]));
        assert!(detect(&def, &[0x01, 0xEE]));
    }
}
