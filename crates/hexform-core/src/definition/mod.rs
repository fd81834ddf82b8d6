//! The compiled representation of one binary format.
//!
//! A [`Definition`] is produced once by the [compiler](crate::compiler) and is
//! read-only afterwards; it holds no interior mutability and can be shared across
//! threads and reused for any number of runs. Cross references between its tables
//! are plain indices ([`FieldId`], [`BlockId`], [`ColorId`], [`VarId`]) resolved at
//! compile time.

mod step;

use crate::store::{VariableStore, Width};

pub use step::{
    skip_span, ExecStep, FieldStep, Guard, LoopCondition, LoopGuard, Operand, PrintStep, Step,
    StepKind, VarTest,
};

/// Id of the reserved field definition labelling uncovered bytes
pub const UNUSED_FIELD_ID: &str = "unused";

/// Index into [`Definition::fields`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub usize);

/// Index into [`Definition::blocks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// Index into [`Definition::colors`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColorId(pub usize);

/// Index of an interned variable name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// Display style used to tag output ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Color {
    /// Document id
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Numeric palette index handed to the presentation layer
    pub index: u32,
    /// Background (true) or foreground (false) coloring
    pub background: bool,
}

/// How a field's byte count is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeMode {
    /// Constant number of bytes
    Fixed(usize),
    /// Everything from the cursor to the end of the buffer
    Remaining,
    /// Up to and including the first occurrence of this byte
    Terminated(u8),
}

/// Text decoding applied by [`PrintMode::Text`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// 7-bit ASCII, non-printables shown as `.`
    #[default]
    Ascii,
    /// UTF-8 with replacement of invalid sequences
    Utf8,
    /// ISO-8859-1
    Latin1,
    /// UTF-16, little-endian code units
    Utf16Le,
    /// UTF-16, big-endian code units
    Utf16Be,
}

impl Encoding {
    /// Parses the document spelling of an encoding
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ascii" => Some(Encoding::Ascii),
            "utf8" => Some(Encoding::Utf8),
            "latin1" => Some(Encoding::Latin1),
            "utf16le" => Some(Encoding::Utf16Le),
            "utf16be" => Some(Encoding::Utf16Be),
            _ => None,
        }
    }
}

/// How a decoded field is rendered in its description line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    /// Bytes in buffer order as hex
    Raw,
    /// Unsigned value as hex digits
    Hex,
    /// Signed decimal
    Signed,
    /// Unsigned decimal
    Unsigned,
    /// Decoded text
    Text,
    /// Name of the matching [`OptionEntry`]
    Options,
    /// Names of the set [`FlagEntry`] bits
    Flags,
}

impl PrintMode {
    /// Parses the document spelling of a print mode
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(PrintMode::Raw),
            "hex" => Some(PrintMode::Hex),
            "int" => Some(PrintMode::Signed),
            "uint" => Some(PrintMode::Unsigned),
            "text" => Some(PrintMode::Text),
            "options" => Some(PrintMode::Options),
            "flags" => Some(PrintMode::Flags),
            _ => None,
        }
    }
}

/// One-of-N value table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionEntry {
    /// Displayed name
    pub name: String,
    /// Byte pattern, most significant byte first
    pub pattern: Vec<u8>,
}

/// Bitflag table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagEntry {
    /// Displayed name
    pub name: String,
    /// Bits belonging to this flag
    pub mask: u64,
    /// Longer explanation shown next to the name
    pub meaning: String,
}

/// Mask and shift for sub-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    /// Bits kept from the raw value
    pub mask: u64,
    /// Right shift applied after masking
    pub shift: u32,
}

impl BitField {
    /// Extracts this field from a raw integer
    pub fn extract(&self, raw: u64) -> u64 {
        (raw & self.mask).checked_shr(self.shift).unwrap_or(0)
    }
}

/// Shape of a field: size rule, decoding and presentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Document id
    pub id: String,
    /// Label for ranges and description lines
    pub name: String,
    /// Short navigation label
    pub tag: Option<String>,
    /// Primary color
    pub color: Option<ColorId>,
    /// Secondary color
    pub accent: Option<ColorId>,
    /// Hover text for the description line
    pub tooltip: Option<String>,
    /// Size rule
    pub size: SizeMode,
    /// Present on masked and shifted sub-fields
    pub bits: Option<BitField>,
    /// Text encoding
    pub encoding: Encoding,
    /// Rendering mode
    pub print: PrintMode,
    /// Value table for [`PrintMode::Options`]
    pub options: Vec<OptionEntry>,
    /// Value table for [`PrintMode::Flags`]
    pub flags: Vec<FlagEntry>,
}

impl FieldDef {
    /// Plain field with default presentation
    pub fn new(id: impl Into<String>, size: SizeMode) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tag: None,
            color: None,
            accent: None,
            tooltip: None,
            size,
            bits: None,
            encoding: Encoding::default(),
            print: PrintMode::Raw,
            options: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// The stand-in for the reserved `unused` field when a document omits it
    pub fn unused() -> Self {
        let mut field = Self::new(UNUSED_FIELD_ID, SizeMode::Remaining);
        field.name = "unused data".to_string();
        field
    }
}

/// Concrete byte order for one read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first
    Big,
    /// Least significant byte first
    Little,
}

/// Byte order policy of a format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endianness {
    /// Always big-endian
    Big,
    /// Always little-endian
    Little,
    /// Chosen at run time by comparing a captured variable with two patterns
    Variable {
        /// Variable whose raw bytes decide the order
        var: VarId,
        /// Raw bytes meaning big-endian
        big: Vec<u8>,
        /// Raw bytes meaning little-endian
        little: Vec<u8>,
    },
}

impl Endianness {
    /// Resolves the policy against the current variables.
    ///
    /// An undetermined variable order reads as big-endian.
    pub fn resolve(&self, store: &VariableStore) -> ByteOrder {
        match self {
            Endianness::Big => ByteOrder::Big,
            Endianness::Little => ByteOrder::Little,
            Endianness::Variable { var, big, little } => match store.get(*var) {
                Some(v) if v.raw == *little => ByteOrder::Little,
                Some(v) if v.raw == *big => ByteOrder::Big,
                _ => ByteOrder::Big,
            },
        }
    }
}

/// One step of a signature program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MagicStep {
    /// Literal byte comparison
    Match {
        /// Expected bytes
        pattern: Vec<u8>,
        /// Absolute position, else the signature cursor
        offset: Option<Operand>,
    },
    /// Raw capture into a transient variable
    Read {
        /// Destination
        var: VarId,
        /// Bytes to read
        width: Width,
        /// Absolute position, else the signature cursor
        offset: Option<Operand>,
    },
}

/// One candidate detection program
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    /// Straight-line steps, no control flow
    pub steps: Vec<MagicStep>,
}

/// Named subprogram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Document id
    pub id: String,
    /// Body
    pub steps: Vec<Step>,
}

/// A compiled format definition
#[derive(Debug, Clone)]
pub struct Definition {
    pub(crate) name: String,
    pub(crate) short_name: String,
    pub(crate) endianness: Endianness,
    pub(crate) colors: Vec<Color>,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) signatures: Vec<Signature>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) program: Vec<Step>,
    pub(crate) variables: Vec<String>,
    pub(crate) unused: FieldId,
}

impl Definition {
    /// Display name of the format
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short name of the format
    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// Byte order policy
    pub fn endianness(&self) -> &Endianness {
        &self.endianness
    }

    /// Color table
    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    /// Field table
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Magic candidates, in trial order
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Subprograms
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Main run-step program
    pub fn program(&self) -> &[Step] {
        &self.program
    }

    /// Interned variable names, indexed by [`VarId`]
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Looks up a field definition
    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0]
    }

    /// Looks up a block
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    /// Looks up a color
    pub fn color(&self, id: ColorId) -> &Color {
        &self.colors[id.0]
    }

    /// The reserved field labelling uncovered bytes
    pub fn unused_field(&self) -> &FieldDef {
        self.field(self.unused)
    }

    /// Finds a field by document id
    pub fn find_field(&self, id: &str) -> Option<FieldId> {
        self.fields.iter().position(|f| f.id == id).map(FieldId)
    }

    /// Finds a variable by name
    pub fn find_variable(&self, name: &str) -> Option<VarId> {
        self.variables.iter().position(|v| v == name).map(VarId)
    }

    /// Name of an interned variable
    pub fn variable_name(&self, id: VarId) -> &str {
        &self.variables[id.0]
    }

    /// Palette index and background flag of an optional color, defaulting to `(0, false)`
    pub fn color_style(&self, id: Option<ColorId>) -> (u32, bool) {
        id.map(|c| self.color(c))
            .map_or((0, false), |c| (c.index, c.background))
    }
}
