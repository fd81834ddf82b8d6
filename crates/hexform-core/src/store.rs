//! Run-local variable storage.
//!
//! Every quantity a definition computes or captures lives in a [`VariableStore`]:
//! field captures, signature reads and the targets of `exec` arithmetic. Variables
//! are scalars of a fixed byte [`Width`] holding either an integer or an exact
//! [`Ratio`]. Rationals only arise from division; integer reads of them truncate
//! toward zero and then wrap to the variable's width.
//!
//! Variable names are interned by the compiler, so the store is a flat slot
//! vector indexed by [`VarId`].

use crate::definition::VarId;
use std::fmt;

/// Byte width of a scalar variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    /// 1 byte
    Byte = 1,
    /// 2 bytes
    Word = 2,
    /// 4 bytes
    Dword = 4,
    /// 8 bytes
    Qword = 8,
}

impl Width {
    /// Number of bytes
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Exact width for a byte count of 1, 2, 4 or 8
    pub fn from_bytes(n: usize) -> Option<Self> {
        match n {
            1 => Some(Width::Byte),
            2 => Some(Width::Word),
            4 => Some(Width::Dword),
            8 => Some(Width::Qword),
            _ => None,
        }
    }

    /// Smallest width able to hold `n` bytes, saturating at 8
    pub fn fitting(n: usize) -> Self {
        match n {
            0 | 1 => Width::Byte,
            2 => Width::Word,
            3 | 4 => Width::Dword,
            _ => Width::Qword,
        }
    }

    fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// Wraps an unsigned value to this width
    pub fn truncate_unsigned(self, value: u64) -> u64 {
        match self {
            Width::Qword => value,
            _ => value & ((1u64 << self.bits()) - 1),
        }
    }

    /// Wraps a signed value to this width (two's complement)
    pub fn truncate_signed(self, value: i64) -> i64 {
        let shift = 64 - self.bits();
        (value << shift) >> shift
    }
}

/// Exact rational number, always reduced with a positive denominator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ratio {
    num: i128,
    den: i128,
}

impl Ratio {
    /// Zero (0/1)
    pub const ZERO: Self = Ratio { num: 0, den: 1 };

    /// Creates a reduced rational. A zero denominator yields [`Ratio::ZERO`].
    pub fn new(num: i128, den: i128) -> Self {
        if den == 0 || num == 0 {
            return Self::ZERO;
        }
        let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
        let g = gcd(num.unsigned_abs(), den.unsigned_abs()) as i128;
        Ratio {
            num: num / g,
            den: den / g,
        }
    }

    /// Numerator (carries the sign)
    pub fn numerator(&self) -> i128 {
        self.num
    }

    /// Denominator (always positive)
    pub fn denominator(&self) -> i128 {
        self.den
    }

    /// Integer part, truncated toward zero
    pub fn truncate(&self) -> i128 {
        self.num / self.den
    }

    /// Returns true if the denominator is one
    pub fn is_integer(&self) -> bool {
        self.den == 1
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integer() {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// The payload of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// Unsigned integer
    Unsigned(u64),
    /// Signed integer
    Signed(i64),
    /// Exact quotient produced by division
    Rational(Ratio),
}

impl Value {
    /// Integer view, rationals truncated toward zero
    pub fn to_i128(&self) -> i128 {
        match *self {
            Value::Unsigned(v) => v as i128,
            Value::Signed(v) => v as i128,
            Value::Rational(r) => r.truncate(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Rational(r) => write!(f, "{}", r),
        }
    }
}

/// A named scalar in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// Storage width
    pub width: Width,
    /// Current value
    pub value: Value,
    /// Bytes the value was captured from, empty for computed values
    pub raw: Vec<u8>,
}

impl Variable {
    /// Creates an unsigned variable, wrapping the value to `width`
    pub fn unsigned(width: Width, value: u64) -> Self {
        Self {
            width,
            value: Value::Unsigned(width.truncate_unsigned(value)),
            raw: Vec::new(),
        }
    }

    /// Creates a signed variable, wrapping the value to `width`
    pub fn signed(width: Width, value: i64) -> Self {
        Self {
            width,
            value: Value::Signed(width.truncate_signed(value)),
            raw: Vec::new(),
        }
    }

    /// Attaches the captured source bytes
    pub fn with_raw(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.raw = raw.into();
        self
    }

    /// Integer view at this variable's width.
    ///
    /// Rationals truncate toward zero and are then wrapped like any other write,
    /// as signed when the quotient is negative.
    pub fn integer(&self) -> i128 {
        match self.value {
            Value::Unsigned(v) => self.width.truncate_unsigned(v) as i128,
            Value::Signed(v) => self.width.truncate_signed(v) as i128,
            Value::Rational(r) => {
                let t = r.truncate();
                if t < 0 {
                    self.width.truncate_signed(t as i64) as i128
                } else {
                    self.width.truncate_unsigned(t as u64) as i128
                }
            }
        }
    }

    /// Unsigned view at this variable's width
    pub fn as_u64(&self) -> u64 {
        self.width.truncate_unsigned(self.integer() as u64)
    }

    /// Signed view at this variable's width
    pub fn as_i64(&self) -> i64 {
        self.width.truncate_signed(self.integer() as i64)
    }
}

/// Arithmetic performed by an `exec` step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// Replace the value
    Set,
    /// Remainder
    Mod,
    /// Sum
    Add,
    /// Difference (saturating at zero when unsigned)
    Sub,
    /// Product
    Mul,
    /// Exact quotient
    Div,
}

impl ArithOp {
    /// Parses the document spelling of an operation
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "set" => Some(ArithOp::Set),
            "mod" => Some(ArithOp::Mod),
            "add" => Some(ArithOp::Add),
            "sub" => Some(ArithOp::Sub),
            "mul" => Some(ArithOp::Mul),
            "div" => Some(ArithOp::Div),
            _ => None,
        }
    }
}

/// Typed scalar storage for one interpretation run
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    slots: Vec<Option<Variable>>,
}

impl VariableStore {
    /// Creates a store with `count` undefined slots
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
        }
    }

    /// Returns the variable if it has been defined
    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Returns true once the variable has been written
    pub fn is_defined(&self, id: VarId) -> bool {
        self.get(id).is_some()
    }

    /// Defines or replaces a variable
    pub fn set(&mut self, id: VarId, variable: Variable) {
        if id.0 >= self.slots.len() {
            self.slots.resize(id.0 + 1, None);
        }
        self.slots[id.0] = Some(variable);
    }

    /// Integer value of a defined variable
    pub fn integer(&self, id: VarId) -> Option<i128> {
        self.get(id).map(Variable::integer)
    }

    /// Number of defined variables
    pub fn defined_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Applies `op` to the target variable in place.
    ///
    /// `operand` is the already resolved right-hand side; `None` reads as zero.
    /// The result keeps the target's width unless `width` overrides it.
    pub fn apply(
        &mut self,
        target: VarId,
        op: ArithOp,
        signed: bool,
        operand: Option<Value>,
        width: Option<Width>,
    ) {
        let current = self.get(target);
        let width = width
            .or_else(|| current.map(|v| v.width))
            .unwrap_or(Width::Qword);
        let rhs = operand.unwrap_or(Value::Unsigned(0));

        let value = match (op, rhs) {
            (ArithOp::Set, Value::Rational(r)) => Value::Rational(r),
            (ArithOp::Div, _) => {
                let lhs = current.map_or(0, Variable::integer);
                let (lhs, rhs) = if signed {
                    (lhs as i64 as i128, rhs.to_i128() as i64 as i128)
                } else {
                    (lhs as u64 as i128, rhs.to_i128() as u64 as i128)
                };
                Value::Rational(Ratio::new(lhs, rhs))
            }
            (ArithOp::Set, _) => integer_op(current, rhs, signed, width, |_, r| r, |_, r| r),
            (ArithOp::Mod, _) => integer_op(
                current,
                rhs,
                signed,
                width,
                |l, r| l.checked_rem(r).unwrap_or(0),
                |l, r| l.checked_rem(r).unwrap_or(0),
            ),
            (ArithOp::Add, _) => {
                integer_op(current, rhs, signed, width, i64::wrapping_add, u64::wrapping_add)
            }
            (ArithOp::Sub, _) => {
                integer_op(current, rhs, signed, width, i64::wrapping_sub, u64::saturating_sub)
            }
            (ArithOp::Mul, _) => {
                integer_op(current, rhs, signed, width, i64::wrapping_mul, u64::wrapping_mul)
            }
        };

        self.set(
            target,
            Variable {
                width,
                value,
                raw: Vec::new(),
            },
        );
    }
}

/// Integer arithmetic at `width`, signed or unsigned.
///
/// Modulo by zero yields zero in both flavors.
fn integer_op(
    current: Option<&Variable>,
    rhs: Value,
    signed: bool,
    width: Width,
    signed_op: fn(i64, i64) -> i64,
    unsigned_op: fn(u64, u64) -> u64,
) -> Value {
    if signed {
        let lhs = current.map_or(0, Variable::as_i64);
        Value::Signed(width.truncate_signed(signed_op(lhs, rhs.to_i128() as i64)))
    } else {
        let lhs = current.map_or(0, Variable::as_u64);
        Value::Unsigned(width.truncate_unsigned(unsigned_op(lhs, rhs.to_i128() as u64)))
    }
}
