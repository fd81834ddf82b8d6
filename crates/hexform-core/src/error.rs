//! Error types for the hexform-core library.
//!
//! Two independent domains live here. [`CompileError`] describes a malformed or
//! contradictory definition document and always carries the document position of
//! the offending element. [`Error`] wraps it together with the I/O failures of the
//! convenience entry points.
//!
//! Problems with the *data* being analyzed are not errors at all: a run that hits
//! them halts gracefully and reports an [`Outcome`](crate::interpreter::Outcome).

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for hexform operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all hexform operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The definition document was rejected by the compiler
    #[error("invalid format definition: {0}")]
    Compile(#[from] CompileError),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Returns true if processing of other inputs can continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FileRead { .. } | Self::FileWrite { .. })
    }
}

/// A location inside a definition document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// 1-based line number
    pub line: usize,
    /// 1-based column, counted in characters
    pub column: usize,
    /// Byte offset from the start of the document
    pub offset: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Structural error found while compiling a definition document.
///
/// Compilation is atomic: when this is returned no partial definition exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {position}, <{element}>: {kind}")]
pub struct CompileError {
    /// Where the offending element starts
    pub position: Position,
    /// Name of the offending element
    pub element: String,
    /// What went wrong
    pub kind: CompileErrorKind,
}

impl CompileError {
    /// Creates a new compile error
    pub fn new(position: Position, element: impl Into<String>, kind: CompileErrorKind) -> Self {
        Self {
            position,
            element: element.into(),
            kind,
        }
    }
}

/// Category of a [`CompileError`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompileErrorKind {
    /// The markup itself is not well formed
    #[error("malformed markup: {0}")]
    Syntax(String),

    /// Element is not legal at this nesting level
    #[error("element is not allowed here")]
    UnexpectedElement,

    /// Character data where only elements are allowed
    #[error("unexpected text content '{0}'")]
    UnexpectedText(String),

    /// A required attribute is absent
    #[error("missing required attribute '{0}'")]
    MissingAttribute(String),

    /// Attribute not understood by this element
    #[error("unknown attribute '{0}'")]
    UnexpectedAttribute(String),

    /// Attribute present but not well typed
    #[error("invalid value '{value}' for attribute '{attribute}': {reason}")]
    InvalidAttribute {
        /// Attribute name
        attribute: String,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// Hex literal of odd length or with non-hex digits
    #[error("malformed hexadecimal literal '{0}'")]
    MalformedHex(String),

    /// Single-valued element or attribute given more than once
    #[error("'{0}' may only be given once")]
    Duplicate(String),

    /// `mask` or `shift` on a field whose size is not fixed
    #[error("bit masks are only allowed on fixed-size fields")]
    MaskOnVariableSize,

    /// A required child element or top-level section is absent
    #[error("missing required element <{0}>")]
    MissingElement(String),

    /// Reference to a field, block or color that is never defined
    #[error("undefined {kind} '{name}'")]
    Undefined {
        /// Which table the reference points into
        kind: &'static str,
        /// The unresolved id
        name: String,
    },

    /// Elements nested deeper than the compiler accepts
    #[error("nesting exceeds {0} levels")]
    TooDeep(usize),

    /// Any other constraint violation
    #[error("{0}")]
    Invalid(String),
}
