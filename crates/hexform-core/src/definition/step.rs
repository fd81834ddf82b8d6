//! Run-step vocabulary.
//!
//! Programs are flat lists. Guarded constructs are paired start/end markers, so a
//! failed guard skips its body with a nesting-counted scan instead of walking a
//! tree.

use super::{BlockId, FieldId, VarId};
use crate::store::{ArithOp, Width};

/// A numeric operand: literal or variable reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Constant
    Literal(i64),
    /// Current value of a variable
    Var(VarId),
}

/// Comparison applied to a variable by a match guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarTest {
    /// Equal to the operand
    Equals(Operand),
    /// Strictly greater than the operand
    Greater(Operand),
    /// Shares at least one set bit with the operand
    BitSet(Operand),
    /// Has been written
    Defined,
}

/// Condition opening a match body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Test against a variable
    Var {
        /// Variable under test
        var: VarId,
        /// Comparison
        test: VarTest,
    },
    /// Compare buffer bytes at the cursor
    Bytes {
        /// Expected bytes
        pattern: Vec<u8>,
        /// Reverse the pattern when the active order is little-endian
        convert: bool,
    },
}

/// What keeps a loop running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCondition {
    /// Bytes remain after the cursor
    Remaining,
    /// Variable is undefined or below the target
    Until {
        /// Counter variable
        var: VarId,
        /// Value that ends the loop
        target: Operand,
    },
    /// No condition of its own; relies on the iteration cap
    Always,
}

/// Loop guard with an optional iteration cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopGuard {
    /// Continuation condition
    pub condition: LoopCondition,
    /// Maximum number of body executions
    pub max_iterations: Option<u64>,
}

/// Decode one field at the cursor (or an explicit offset)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldStep {
    /// Field shape
    pub field: FieldId,
    /// Capture destination
    pub var: Option<VarId>,
    /// Absolute offset; the cursor is restored afterwards
    pub offset: Option<Operand>,
    /// Size override, interpreted per size mode
    pub limit: Option<Operand>,
    /// Output tab for the description line
    pub tab: Option<String>,
}

/// Emit a variable as a description line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintStep {
    /// Left-hand label
    pub label: String,
    /// Variable to print
    pub var: VarId,
    /// Output tab
    pub tab: Option<String>,
    /// Emit nothing when the variable is undefined
    pub suppress_undefined: bool,
    /// Render integers as hex
    pub hex: bool,
}

/// Arithmetic on a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStep {
    /// Target
    pub var: VarId,
    /// Operation
    pub op: ArithOp,
    /// Signed variant
    pub signed: bool,
    /// Right-hand side
    pub operand: Operand,
    /// Result width override
    pub width: Option<Width>,
}

/// One instruction of a run program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Decode a field
    Field(FieldStep),
    /// Open a guarded body
    MatchStart(Guard),
    /// Close a guarded body
    MatchEnd,
    /// Open a loop body
    LoopStart(LoopGuard),
    /// Close a loop body
    LoopEnd,
    /// Open an exclusive-choice scope
    SelectionStart,
    /// Close an exclusive-choice scope
    SelectionEnd,
    /// Call a subprogram
    Block(BlockId),
    /// Print a variable
    Print(PrintStep),
    /// Arithmetic
    Exec(ExecStep),
    /// Start a new description section
    Section(String),
    /// Materialize an open output tab
    Insert(String),
}

/// Paired constructs that can be skipped as a span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// `MatchStart` .. `MatchEnd`
    Match,
    /// `LoopStart` .. `LoopEnd`
    Loop,
    /// `SelectionStart` .. `SelectionEnd`
    Selection,
}

impl Step {
    /// Returns true if this step opens a span of `kind`
    pub fn opens(&self, kind: StepKind) -> bool {
        matches!(
            (self, kind),
            (Step::MatchStart(_), StepKind::Match)
                | (Step::LoopStart(_), StepKind::Loop)
                | (Step::SelectionStart, StepKind::Selection)
        )
    }

    /// Returns true if this step closes a span of `kind`
    pub fn closes(&self, kind: StepKind) -> bool {
        matches!(
            (self, kind),
            (Step::MatchEnd, StepKind::Match)
                | (Step::LoopEnd, StepKind::Loop)
                | (Step::SelectionEnd, StepKind::Selection)
        )
    }
}

/// Index just past the end marker closing the span that is open at `from`.
///
/// `from` is the index of the first step inside the span (or of its start
/// marker's successor). Nested spans of the same kind are counted. A missing end
/// marker yields the program length.
pub fn skip_span(steps: &[Step], from: usize, kind: StepKind) -> usize {
    let mut depth = 0usize;
    for (i, step) in steps.iter().enumerate().skip(from) {
        if step.opens(kind) {
            depth += 1;
        } else if step.closes(kind) {
            if depth == 0 {
                return i + 1;
            }
            depth -= 1;
        }
    }
    steps.len()
}
