//! Definition document compiler and validator.
//!
//! Turns an XML definition document into a [`Definition`]. Parsing is a single
//! streaming pass over `quick-xml` events with a stack of open frames. The frame
//! on top decides which child elements are legal, so each section has its own
//! small parser that is pushed when its start tag is seen and popped at its end
//! tag.
//!
//! ## Checks
//!
//! - required attributes are present and well typed, unknown ones are rejected
//! - child elements are legal at the current nesting level
//! - single-valued elements (a field's `size`, `mask`, ...) appear once
//! - hex literals have even length and valid digits
//! - `mask`/`shift` only appear on fixed-size fields (checked when the field closes)
//! - every required top-level section is present
//! - field, block and color references resolve (checked at the end of the
//!   document, so forward references are fine)
//!
//! The first violation aborts compilation; no partial definition is produced.
//!
//! ## Example
//!
//! ```
//! let definition = hexform_core::compile(r#"
//!     <format name="Example" short="EX">
//!       <endianness order="little"/>
//!       <magic><signature><match value="4558"/></signature></magic>
//!       <colors><color id="hdr" index="1"/></colors>
//!       <field-defs>
//!         <field id="magic" color="hdr"><size fixed="2"/></field>
//!       </field-defs>
//!       <run><field ref="magic"/></run>
//!     </format>
//! "#)?;
//! assert_eq!(definition.short_name(), "EX");
//! # Ok::<(), hexform_core::CompileError>(())
//! ```

mod attrs;

use crate::definition::{
    BitField, Block, BlockId, Color, ColorId, Definition, Encoding, Endianness, ExecStep, FieldDef,
    FieldId, FieldStep, FlagEntry, Guard, LoopCondition, LoopGuard, MagicStep, Operand,
    OptionEntry, PrintMode, PrintStep, Signature, SizeMode, Step, StepKind, VarId, VarTest,
    UNUSED_FIELD_ID,
};
use crate::error::{CompileError, CompileErrorKind, Error, Position, Result};
use crate::store::ArithOp;
use attrs::{hex_value, is_identifier, parse_literal, Attrs};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Deepest element nesting accepted
pub const MAX_NESTING: usize = 128;

/// Top-level sections that must appear exactly once
const REQUIRED_SECTIONS: [&str; 5] = ["endianness", "magic", "colors", "field-defs", "run"];

/// Compiles a definition document
pub fn compile(source: &str) -> std::result::Result<Definition, CompileError> {
    Compiler::new(source).compile()
}

/// Reads and compiles a definition document from disk
pub fn compile_file(path: impl AsRef<Path>) -> Result<Definition> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
    let definition = compile(&source)?;
    debug!("Compiled {} from {}", definition.name(), path.display());
    Ok(definition)
}

/// Byte offset to line/column translation
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    fn position(&self, source: &str, offset: usize) -> Position {
        let offset = offset.min(source.len());
        let line = self.starts.partition_point(|&s| s <= offset);
        let start = self.starts[line - 1];
        let column = source
            .get(start..offset)
            .map_or(offset - start, |s| s.chars().count())
            + 1;
        Position {
            line,
            column,
            offset,
        }
    }
}

struct Symbol<T> {
    name: String,
    element: String,
    position: Position,
    value: Option<T>,
}

/// Ids seen so far, defined or only referenced
struct SymbolTable<T> {
    index: HashMap<String, usize>,
    symbols: Vec<Symbol<T>>,
}

impl<T> SymbolTable<T> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            symbols: Vec::new(),
        }
    }

    /// Slot for `name`, created on first mention
    fn slot(&mut self, name: &str, element: &str, position: Position) -> usize {
        if let Some(&slot) = self.index.get(name) {
            return slot;
        }
        let slot = self.symbols.len();
        self.index.insert(name.to_string(), slot);
        self.symbols.push(Symbol {
            name: name.to_string(),
            element: element.to_string(),
            position,
            value: None,
        });
        slot
    }

    fn is_defined(&self, name: &str) -> bool {
        self.index
            .get(name)
            .is_some_and(|&slot| self.symbols[slot].value.is_some())
    }

    fn define(&mut self, slot: usize, value: T) {
        self.symbols[slot].value = Some(value);
    }

    /// Every slot must be defined; reports the first use of the first one that is not
    fn resolve(self, kind: &'static str) -> std::result::Result<Vec<T>, CompileError> {
        self.symbols
            .into_iter()
            .map(|s| {
                s.value.ok_or_else(|| {
                    CompileError::new(
                        s.position,
                        s.element,
                        CompileErrorKind::Undefined { kind, name: s.name },
                    )
                })
            })
            .collect()
    }
}

/// Interned variable names
#[derive(Default)]
struct VarTable {
    index: HashMap<String, VarId>,
    names: Vec<String>,
}

impl VarTable {
    fn intern(&mut self, name: &str) -> VarId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = VarId(self.names.len());
        self.index.insert(name.to_string(), id);
        self.names.push(name.to_string());
        id
    }
}

/// A field definition between its start and end tags
struct FieldBuilder {
    slot: usize,
    id: String,
    name: String,
    tag: Option<String>,
    color: Option<ColorId>,
    accent: Option<ColorId>,
    tooltip: Option<String>,
    size: Option<SizeMode>,
    mask: Option<Vec<u8>>,
    shift: Option<u32>,
    encoding: Option<Encoding>,
    print: Option<PrintMode>,
    options: Option<Vec<OptionEntry>>,
    flags: Option<Vec<FlagEntry>>,
}

impl FieldBuilder {
    fn build(self, element: &str, position: Position) -> std::result::Result<FieldDef, CompileError> {
        let error = |kind| CompileError::new(position, element, kind);
        let size = self
            .size
            .ok_or_else(|| error(CompileErrorKind::MissingElement("size".into())))?;

        let bits = if self.mask.is_some() || self.shift.is_some() {
            let SizeMode::Fixed(n) = size else {
                return Err(error(CompileErrorKind::MaskOnVariableSize));
            };
            if n > 8 {
                return Err(error(CompileErrorKind::Invalid(format!(
                    "bit fields are limited to 8 bytes, this one has {}",
                    n
                ))));
            }
            let full = if n == 8 { u64::MAX } else { (1u64 << (n * 8)) - 1 };
            let mask = match &self.mask {
                Some(bytes) if bytes.len() > n => {
                    return Err(error(CompileErrorKind::Invalid(format!(
                        "mask of {} bytes is wider than the {}-byte field",
                        bytes.len(),
                        n
                    ))))
                }
                Some(bytes) => hex_value(bytes).unwrap_or(full),
                None => full,
            };
            Some(BitField {
                mask,
                shift: self.shift.unwrap_or(0),
            })
        } else {
            None
        };

        let print = self.print.unwrap_or(if self.encoding.is_some() {
            PrintMode::Text
        } else {
            PrintMode::Raw
        });
        let options = self.options.unwrap_or_default();
        let flags = self.flags.unwrap_or_default();
        if print == PrintMode::Options && options.is_empty() {
            return Err(error(CompileErrorKind::MissingElement("options".into())));
        }
        if print == PrintMode::Flags && flags.is_empty() {
            return Err(error(CompileErrorKind::MissingElement("flags".into())));
        }
        if let (SizeMode::Fixed(n), None) = (size, bits) {
            if let Some(option) = options.iter().find(|o| o.pattern.len() != n) {
                return Err(error(CompileErrorKind::Invalid(format!(
                    "option '{}' has {} bytes but the field has {}",
                    option.name,
                    option.pattern.len(),
                    n
                ))));
            }
        }

        Ok(FieldDef {
            id: self.id,
            name: self.name,
            tag: self.tag,
            color: self.color,
            accent: self.accent,
            tooltip: self.tooltip,
            size,
            bits,
            encoding: self.encoding.unwrap_or_default(),
            print,
            options,
            flags,
        })
    }
}

/// Parser state for one open element
enum Frame {
    Document,
    Format,
    Magic,
    Signature(Vec<MagicStep>),
    Colors,
    FieldDefs,
    Field(Box<FieldBuilder>),
    Options,
    Flags,
    BlockDefs,
    BlockDef { slot: usize, id: String, steps: Vec<Step> },
    Run(Vec<Step>),
    Nested(StepKind),
    Leaf,
}

/// Which children an open element accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Document,
    Format,
    Magic,
    Signature,
    Colors,
    FieldDefs,
    Field,
    Options,
    Flags,
    BlockDefs,
    Program,
    Leaf,
}

impl Frame {
    fn context(&self) -> Context {
        match self {
            Frame::Document => Context::Document,
            Frame::Format => Context::Format,
            Frame::Magic => Context::Magic,
            Frame::Signature(_) => Context::Signature,
            Frame::Colors => Context::Colors,
            Frame::FieldDefs => Context::FieldDefs,
            Frame::Field(_) => Context::Field,
            Frame::Options => Context::Options,
            Frame::Flags => Context::Flags,
            Frame::BlockDefs => Context::BlockDefs,
            Frame::BlockDef { .. } | Frame::Run(_) | Frame::Nested(_) => Context::Program,
            Frame::Leaf => Context::Leaf,
        }
    }
}

struct Open {
    frame: Frame,
    name: String,
    position: Position,
}

struct Compiler<'s> {
    source: &'s str,
    lines: LineIndex,
    stack: Vec<Open>,
    root: Option<(String, String, Position)>,
    sections: Vec<&'static str>,
    endianness: Option<Endianness>,
    colors: SymbolTable<Color>,
    fields: SymbolTable<FieldDef>,
    blocks: SymbolTable<Block>,
    vars: VarTable,
    signatures: Vec<Signature>,
    program: Vec<Step>,
}

impl<'s> Compiler<'s> {
    fn new(source: &'s str) -> Self {
        Self {
            source,
            lines: LineIndex::new(source),
            stack: vec![Open {
                frame: Frame::Document,
                name: String::new(),
                position: Position::default(),
            }],
            root: None,
            sections: Vec::new(),
            endianness: None,
            colors: SymbolTable::new(),
            fields: SymbolTable::new(),
            blocks: SymbolTable::new(),
            vars: VarTable::default(),
            signatures: Vec::new(),
            program: Vec::new(),
        }
    }

    fn compile(mut self) -> std::result::Result<Definition, CompileError> {
        let mut reader = Reader::from_str(self.source);
        reader.config_mut().trim_text(true);

        loop {
            let offset = reader.buffer_position() as usize;
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(e) => {
                    let at = self.locate(reader.buffer_position() as usize);
                    let element = self.stack.last().map(|o| o.name.clone()).unwrap_or_default();
                    return Err(CompileError::new(at, element, CompileErrorKind::Syntax(e.to_string())));
                }
            };
            let at = self.locate(offset);
            match event {
                Event::Start(start) => self.open(&start, at)?,
                Event::Empty(start) => {
                    self.open(&start, at)?;
                    self.close(at)?;
                }
                Event::End(_) => self.close(at)?,
                Event::Text(text) => {
                    let text = String::from_utf8_lossy(&text);
                    if !text.trim().is_empty() {
                        return Err(self.error_here(
                            at,
                            CompileErrorKind::UnexpectedText(text.trim().to_string()),
                        ));
                    }
                }
                Event::CData(_) => {
                    return Err(self.error_here(at, CompileErrorKind::UnexpectedText("CDATA".into())))
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if self.stack.len() > 1 {
            let open = &self.stack[self.stack.len() - 1];
            return Err(CompileError::new(
                open.position,
                open.name.clone(),
                CompileErrorKind::Syntax("element is never closed".into()),
            ));
        }
        self.finish()
    }

    /// Position of the first non-blank character at or after `offset`
    fn locate(&self, offset: usize) -> Position {
        let rest = self.source.get(offset..).unwrap_or("");
        let skipped = rest.len() - rest.trim_start().len();
        self.lines.position(self.source, offset + skipped)
    }

    fn error_here(&self, at: Position, kind: CompileErrorKind) -> CompileError {
        let element = self.stack.last().map(|o| o.name.clone()).unwrap_or_default();
        CompileError::new(at, element, kind)
    }

    fn open(&mut self, start: &BytesStart<'_>, at: Position) -> std::result::Result<(), CompileError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        if self.stack.len() > MAX_NESTING {
            return Err(CompileError::new(at, name, CompileErrorKind::TooDeep(MAX_NESTING)));
        }

        let mut attrs = Attrs::parse(start, &name, at)?;
        let parent = self
            .stack
            .last()
            .map_or(Context::Leaf, |open| open.frame.context());
        let frame = match (parent, name.as_str()) {
            (Context::Document, _) => self.open_root(&name, &mut attrs, at)?,
            (Context::Format, _) => self.open_section(&name, &mut attrs)?,
            (Context::Magic, "signature") => Frame::Signature(Vec::new()),
            (Context::Signature, _) => self.open_magic_step(&name, &mut attrs)?,
            (Context::Colors, "color") => self.open_color(&name, &mut attrs, at)?,
            (Context::FieldDefs, "field") => self.open_field(&name, &mut attrs, at)?,
            (Context::Field, _) => self.open_field_part(&name, &mut attrs)?,
            (Context::Options, "option") => self.open_option(&mut attrs)?,
            (Context::Flags, "flag") => self.open_flag(&mut attrs)?,
            (Context::BlockDefs, "block-def") => self.open_block_def(&name, &mut attrs, at)?,
            (Context::Program, _) => self.open_step(&name, &mut attrs, at)?,
            _ => return Err(attrs.error(CompileErrorKind::UnexpectedElement)),
        };
        attrs.finish()?;

        self.stack.push(Open {
            frame,
            name,
            position: at,
        });
        Ok(())
    }

    fn close(&mut self, at: Position) -> std::result::Result<(), CompileError> {
        if self.stack.len() <= 1 {
            return Err(self.error_here(at, CompileErrorKind::Syntax("unmatched end tag".into())));
        }
        let Some(open) = self.stack.pop() else {
            return Ok(());
        };
        let error = |kind| CompileError::new(open.position, open.name.clone(), kind);

        match open.frame {
            Frame::Magic if self.signatures.is_empty() => {
                return Err(error(CompileErrorKind::MissingElement("signature".into())));
            }
            Frame::Signature(steps) => {
                if steps.is_empty() {
                    return Err(error(CompileErrorKind::MissingElement("match".into())));
                }
                self.signatures.push(Signature { steps });
            }
            Frame::Field(builder) => {
                let slot = builder.slot;
                let field = builder.build(&open.name, open.position)?;
                self.fields.define(slot, field);
            }
            Frame::Options if self.field_builder().is_some_and(|b| b.options_empty()) => {
                return Err(error(CompileErrorKind::MissingElement("option".into())));
            }
            Frame::Flags if self.field_builder().is_some_and(|b| b.flags_empty()) => {
                return Err(error(CompileErrorKind::MissingElement("flag".into())));
            }
            Frame::BlockDef { slot, id, steps } => {
                self.blocks.define(slot, Block { id, steps });
            }
            Frame::Run(steps) => self.program = steps,
            Frame::Nested(kind) => {
                let end = match kind {
                    StepKind::Match => Step::MatchEnd,
                    StepKind::Loop => Step::LoopEnd,
                    StepKind::Selection => Step::SelectionEnd,
                };
                self.push_step(end);
            }
            _ => {}
        }
        Ok(())
    }

    fn open_root(
        &mut self,
        name: &str,
        attrs: &mut Attrs,
        at: Position,
    ) -> std::result::Result<Frame, CompileError> {
        if name != "format" {
            return Err(attrs.error(CompileErrorKind::UnexpectedElement));
        }
        if self.root.is_some() {
            return Err(attrs.error(CompileErrorKind::Duplicate("format".into())));
        }
        let display = attrs.required("name")?;
        let short = attrs.required("short")?;
        self.root = Some((display, short, at));
        Ok(Frame::Format)
    }

    fn open_section(&mut self, name: &str, attrs: &mut Attrs) -> std::result::Result<Frame, CompileError> {
        let section = match name {
            "endianness" => "endianness",
            "magic" => "magic",
            "colors" => "colors",
            "field-defs" => "field-defs",
            "block-defs" => "block-defs",
            "run" => "run",
            _ => return Err(attrs.error(CompileErrorKind::UnexpectedElement)),
        };
        if self.sections.contains(&section) {
            return Err(attrs.error(CompileErrorKind::Duplicate(section.into())));
        }
        self.sections.push(section);

        Ok(match section {
            "endianness" => {
                self.endianness = Some(self.parse_endianness(attrs)?);
                Frame::Leaf
            }
            "magic" => Frame::Magic,
            "colors" => Frame::Colors,
            "field-defs" => Frame::FieldDefs,
            "block-defs" => Frame::BlockDefs,
            _ => Frame::Run(Vec::new()),
        })
    }

    fn parse_endianness(&mut self, attrs: &mut Attrs) -> std::result::Result<Endianness, CompileError> {
        let order = attrs.required("order")?;
        match order.as_str() {
            "big" => Ok(Endianness::Big),
            "little" => Ok(Endianness::Little),
            "variable" => {
                let var = self.required_var(attrs, "var")?;
                let big = attrs.required_hex("big")?;
                let little = attrs.required_hex("little")?;
                if big == little {
                    return Err(attrs.invalid("little", &hex_string(&little), "must differ from 'big'"));
                }
                Ok(Endianness::Variable { var, big, little })
            }
            _ => Err(attrs.invalid("order", &order, "expected 'big', 'little' or 'variable'")),
        }
    }

    fn open_magic_step(&mut self, name: &str, attrs: &mut Attrs) -> std::result::Result<Frame, CompileError> {
        let step = match name {
            "match" => MagicStep::Match {
                pattern: attrs.required_hex("value")?,
                offset: self.operand(attrs, "offset")?,
            },
            "read" => {
                let var = self.required_var(attrs, "var")?;
                let width = attrs
                    .width("size")?
                    .ok_or_else(|| attrs.error(CompileErrorKind::MissingAttribute("size".into())))?;
                MagicStep::Read {
                    var,
                    width,
                    offset: self.operand(attrs, "offset")?,
                }
            }
            _ => return Err(attrs.error(CompileErrorKind::UnexpectedElement)),
        };
        if let Some(Open {
            frame: Frame::Signature(steps),
            ..
        }) = self.stack.last_mut()
        {
            steps.push(step);
        }
        Ok(Frame::Leaf)
    }

    fn open_color(
        &mut self,
        name: &str,
        attrs: &mut Attrs,
        at: Position,
    ) -> std::result::Result<Frame, CompileError> {
        let id = attrs.required("id")?;
        if self.colors.is_defined(&id) {
            return Err(attrs.error(CompileErrorKind::Duplicate(format!("color id '{}'", id))));
        }
        let index = attrs
            .number::<u32>("index")?
            .ok_or_else(|| attrs.error(CompileErrorKind::MissingAttribute("index".into())))?;
        let color = Color {
            name: attrs.take("name").unwrap_or_else(|| id.clone()),
            background: attrs.flag("background")?,
            index,
            id: id.clone(),
        };
        let slot = self.colors.slot(&id, name, at);
        self.colors.define(slot, color);
        Ok(Frame::Leaf)
    }

    fn open_field(
        &mut self,
        name: &str,
        attrs: &mut Attrs,
        at: Position,
    ) -> std::result::Result<Frame, CompileError> {
        let id = attrs.required("id")?;
        if self.fields.is_defined(&id) {
            return Err(attrs.error(CompileErrorKind::Duplicate(format!("field id '{}'", id))));
        }
        let slot = self.fields.slot(&id, name, at);
        let color = self.color_ref_at(attrs, "color", at);
        let accent = self.color_ref_at(attrs, "accent", at);
        Ok(Frame::Field(Box::new(FieldBuilder {
            slot,
            name: attrs.take("name").unwrap_or_else(|| id.clone()),
            tag: attrs.take("tag"),
            tooltip: attrs.take("tooltip"),
            id,
            color,
            accent,
            size: None,
            mask: None,
            shift: None,
            encoding: None,
            print: None,
            options: None,
            flags: None,
        })))
    }

    /// Color references are reported against the field that makes them
    fn color_ref_at(&mut self, attrs: &mut Attrs, key: &str, at: Position) -> Option<ColorId> {
        let id = attrs.take(key)?;
        Some(ColorId(self.colors.slot(&id, "field", at)))
    }

    fn field_builder(&mut self) -> Option<&mut FieldBuilder> {
        self.stack.iter_mut().rev().find_map(|open| match &mut open.frame {
            Frame::Field(builder) => Some(builder.as_mut()),
            _ => None,
        })
    }

    fn open_field_part(&mut self, name: &str, attrs: &mut Attrs) -> std::result::Result<Frame, CompileError> {
        let duplicate = |attrs: &Attrs| attrs.error(CompileErrorKind::Duplicate(name.to_string()));

        match name {
            "size" => {
                let size = parse_size(attrs)?;
                let builder = self.field_builder_or(attrs)?;
                if builder.size.is_some() {
                    return Err(duplicate(attrs));
                }
                builder.size = Some(size);
            }
            "mask" => {
                let mask = attrs.required_hex("value")?;
                if mask.len() > 8 {
                    return Err(attrs.invalid("value", &hex_string(&mask), "at most 8 bytes"));
                }
                let builder = self.field_builder_or(attrs)?;
                if builder.mask.is_some() {
                    return Err(duplicate(attrs));
                }
                builder.mask = Some(mask);
            }
            "shift" => {
                let bits = attrs
                    .number::<u32>("bits")?
                    .ok_or_else(|| attrs.error(CompileErrorKind::MissingAttribute("bits".into())))?;
                if bits >= 64 {
                    return Err(attrs.invalid("bits", &bits.to_string(), "must be below 64"));
                }
                let builder = self.field_builder_or(attrs)?;
                if builder.shift.is_some() {
                    return Err(duplicate(attrs));
                }
                builder.shift = Some(bits);
            }
            "encoding" => {
                let value = attrs.required("value")?;
                let encoding = Encoding::from_name(&value).ok_or_else(|| {
                    attrs.invalid("value", &value, "expected ascii, utf8, latin1, utf16le or utf16be")
                })?;
                let builder = self.field_builder_or(attrs)?;
                if builder.encoding.is_some() {
                    return Err(duplicate(attrs));
                }
                builder.encoding = Some(encoding);
            }
            "print" => {
                let mode = attrs.required("mode")?;
                let print = PrintMode::from_name(&mode).ok_or_else(|| {
                    attrs.invalid("mode", &mode, "expected raw, hex, int, uint, text, options or flags")
                })?;
                let builder = self.field_builder_or(attrs)?;
                if builder.print.is_some() {
                    return Err(duplicate(attrs));
                }
                builder.print = Some(print);
            }
            "options" => {
                let builder = self.field_builder_or(attrs)?;
                if builder.options.is_some() {
                    return Err(duplicate(attrs));
                }
                builder.options = Some(Vec::new());
                return Ok(Frame::Options);
            }
            "flags" => {
                let builder = self.field_builder_or(attrs)?;
                if builder.flags.is_some() {
                    return Err(duplicate(attrs));
                }
                builder.flags = Some(Vec::new());
                return Ok(Frame::Flags);
            }
            _ => return Err(attrs.error(CompileErrorKind::UnexpectedElement)),
        }
        Ok(Frame::Leaf)
    }

    fn field_builder_or(&mut self, attrs: &Attrs) -> std::result::Result<&mut FieldBuilder, CompileError> {
        self.field_builder()
            .ok_or_else(|| attrs.error(CompileErrorKind::UnexpectedElement))
    }

    fn open_option(&mut self, attrs: &mut Attrs) -> std::result::Result<Frame, CompileError> {
        let entry = OptionEntry {
            name: attrs.required("name")?,
            pattern: attrs.required_hex("value")?,
        };
        self.field_builder_or(attrs)?
            .options
            .get_or_insert_with(Vec::new)
            .push(entry);
        Ok(Frame::Leaf)
    }

    fn open_flag(&mut self, attrs: &mut Attrs) -> std::result::Result<Frame, CompileError> {
        let name = attrs.required("name")?;
        let bytes = attrs.required_hex("mask")?;
        let mask = hex_value(&bytes)
            .ok_or_else(|| attrs.invalid("mask", &hex_string(&bytes), "at most 8 bytes"))?;
        if mask == 0 {
            return Err(attrs.invalid("mask", &hex_string(&bytes), "must have at least one bit set"));
        }
        let entry = FlagEntry {
            name,
            mask,
            meaning: attrs.take("meaning").unwrap_or_default(),
        };
        self.field_builder_or(attrs)?
            .flags
            .get_or_insert_with(Vec::new)
            .push(entry);
        Ok(Frame::Leaf)
    }

    fn open_block_def(
        &mut self,
        name: &str,
        attrs: &mut Attrs,
        at: Position,
    ) -> std::result::Result<Frame, CompileError> {
        let id = attrs.required("id")?;
        if self.blocks.is_defined(&id) {
            return Err(attrs.error(CompileErrorKind::Duplicate(format!("block id '{}'", id))));
        }
        let slot = self.blocks.slot(&id, name, at);
        Ok(Frame::BlockDef {
            slot,
            id,
            steps: Vec::new(),
        })
    }

    fn open_step(
        &mut self,
        name: &str,
        attrs: &mut Attrs,
        at: Position,
    ) -> std::result::Result<Frame, CompileError> {
        let (step, frame) = match name {
            "field" => {
                let id = attrs.required("ref")?;
                let field = FieldId(self.fields.slot(&id, name, at));
                let step = FieldStep {
                    field,
                    var: self.var(attrs, "var")?,
                    offset: self.operand(attrs, "offset")?,
                    limit: self.operand(attrs, "limit")?,
                    tab: attrs.take("tab"),
                };
                (Step::Field(step), Frame::Leaf)
            }
            "match" => (
                Step::MatchStart(self.parse_guard(attrs)?),
                Frame::Nested(StepKind::Match),
            ),
            "loop" => (
                Step::LoopStart(self.parse_loop(attrs)?),
                Frame::Nested(StepKind::Loop),
            ),
            "selection" => (Step::SelectionStart, Frame::Nested(StepKind::Selection)),
            "block" => {
                let id = attrs.required("ref")?;
                (Step::Block(BlockId(self.blocks.slot(&id, name, at))), Frame::Leaf)
            }
            "print" => {
                let step = PrintStep {
                    label: attrs.required("label")?,
                    var: self.required_var(attrs, "var")?,
                    tab: attrs.take("tab"),
                    suppress_undefined: attrs.flag("suppress")?,
                    hex: attrs.flag("hex")?,
                };
                (Step::Print(step), Frame::Leaf)
            }
            "exec" => {
                let var = self.required_var(attrs, "var")?;
                let op_name = attrs.required("op")?;
                let op = ArithOp::from_name(&op_name).ok_or_else(|| {
                    attrs.invalid("op", &op_name, "expected set, mod, add, sub, mul or div")
                })?;
                let operand = self
                    .operand(attrs, "value")?
                    .ok_or_else(|| attrs.error(CompileErrorKind::MissingAttribute("value".into())))?;
                let step = ExecStep {
                    var,
                    op,
                    signed: attrs.flag("signed")?,
                    operand,
                    width: attrs.width("size")?,
                };
                (Step::Exec(step), Frame::Leaf)
            }
            "section" => (Step::Section(attrs.required("title")?), Frame::Leaf),
            "insert" => (Step::Insert(attrs.required("tab")?), Frame::Leaf),
            _ => return Err(attrs.error(CompileErrorKind::UnexpectedElement)),
        };
        self.push_step(step);
        Ok(frame)
    }

    fn parse_guard(&mut self, attrs: &mut Attrs) -> std::result::Result<Guard, CompileError> {
        if let Some(pattern) = attrs.hex("bytes")? {
            if attrs.has("var") {
                return Err(attrs.error(CompileErrorKind::Invalid(
                    "a match tests either 'bytes' or 'var', not both".into(),
                )));
            }
            return Ok(Guard::Bytes {
                pattern,
                convert: attrs.flag("convert")?,
            });
        }

        let var = self.required_var(attrs, "var")?;
        let mut tests = Vec::new();
        if let Some(op) = self.operand(attrs, "eq")? {
            tests.push(VarTest::Equals(op));
        }
        if let Some(op) = self.operand(attrs, "gt")? {
            tests.push(VarTest::Greater(op));
        }
        if let Some(op) = self.operand(attrs, "bit")? {
            tests.push(VarTest::BitSet(op));
        }
        if attrs.has("defined") {
            if !attrs.flag("defined")? {
                return Err(attrs.invalid("defined", "false", "only 'true' is meaningful"));
            }
            tests.push(VarTest::Defined);
        }
        match tests.as_slice() {
            [test] => Ok(Guard::Var { var, test: *test }),
            [] => Err(attrs.error(CompileErrorKind::Invalid(
                "a variable match needs one of 'eq', 'gt', 'bit' or 'defined'".into(),
            ))),
            _ => Err(attrs.error(CompileErrorKind::Invalid(
                "a variable match takes only one of 'eq', 'gt', 'bit' or 'defined'".into(),
            ))),
        }
    }

    fn parse_loop(&mut self, attrs: &mut Attrs) -> std::result::Result<LoopGuard, CompileError> {
        let remaining = attrs.flag("remaining")?;
        let var = self.var(attrs, "var")?;
        let until = self.operand(attrs, "until")?;
        let max_iterations = attrs.number::<u64>("count")?;

        let condition = match (remaining, var, until) {
            (true, None, None) => LoopCondition::Remaining,
            (false, Some(var), Some(target)) => LoopCondition::Until { var, target },
            (false, None, None) if max_iterations.is_some() => LoopCondition::Always,
            (false, None, None) => {
                return Err(attrs.error(CompileErrorKind::Invalid(
                    "a loop needs 'remaining', 'var' with 'until', or 'count'".into(),
                )))
            }
            (true, _, _) => {
                return Err(attrs.error(CompileErrorKind::Invalid(
                    "'remaining' and 'var'/'until' are mutually exclusive".into(),
                )))
            }
            (false, Some(_), None) => {
                return Err(attrs.error(CompileErrorKind::MissingAttribute("until".into())))
            }
            (false, None, Some(_)) => {
                return Err(attrs.error(CompileErrorKind::MissingAttribute("var".into())))
            }
        };
        Ok(LoopGuard {
            condition,
            max_iterations,
        })
    }

    fn var(&mut self, attrs: &mut Attrs, key: &str) -> std::result::Result<Option<VarId>, CompileError> {
        match attrs.take(key) {
            None => Ok(None),
            Some(name) if is_identifier(&name) => Ok(Some(self.vars.intern(&name))),
            Some(name) => Err(attrs.invalid(key, &name, "not a variable name")),
        }
    }

    fn required_var(&mut self, attrs: &mut Attrs, key: &str) -> std::result::Result<VarId, CompileError> {
        self.var(attrs, key)?
            .ok_or_else(|| attrs.error(CompileErrorKind::MissingAttribute(key.to_string())))
    }

    fn operand(&mut self, attrs: &mut Attrs, key: &str) -> std::result::Result<Option<Operand>, CompileError> {
        let Some(text) = attrs.take(key) else {
            return Ok(None);
        };
        if let Some(value) = parse_literal(&text) {
            return Ok(Some(Operand::Literal(value)));
        }
        if is_identifier(text.trim()) {
            return Ok(Some(Operand::Var(self.vars.intern(text.trim()))));
        }
        Err(attrs.invalid(key, &text, "expected an integer or a variable name"))
    }

    /// Appends to the innermost run or block program
    fn push_step(&mut self, step: Step) {
        let program = self.stack.iter_mut().rev().find_map(|open| match &mut open.frame {
            Frame::Run(steps) | Frame::BlockDef { steps, .. } => Some(steps),
            _ => None,
        });
        if let Some(steps) = program {
            steps.push(step);
        }
    }

    fn finish(mut self) -> std::result::Result<Definition, CompileError> {
        let Some((name, short_name, root_at)) = self.root.take() else {
            return Err(CompileError::new(
                self.lines.position(self.source, 0),
                "format",
                CompileErrorKind::MissingElement("format".into()),
            ));
        };
        if let Some(missing) = REQUIRED_SECTIONS.iter().find(|s| !self.sections.contains(*s)) {
            return Err(CompileError::new(
                root_at,
                "format",
                CompileErrorKind::MissingElement(missing.to_string()),
            ));
        }

        if !self.fields.is_defined(UNUSED_FIELD_ID) {
            let slot = self.fields.slot(UNUSED_FIELD_ID, "field-defs", root_at);
            self.fields.define(slot, FieldDef::unused());
        }

        let colors = self.colors.resolve("color")?;
        let fields = self.fields.resolve("field")?;
        let blocks = self.blocks.resolve("block")?;
        let unused = fields
            .iter()
            .position(|f| f.id == UNUSED_FIELD_ID)
            .map(FieldId)
            .unwrap_or(FieldId(0));

        let definition = Definition {
            name,
            short_name,
            endianness: self.endianness.unwrap_or(Endianness::Big),
            colors,
            fields,
            signatures: self.signatures,
            blocks,
            program: self.program,
            variables: self.vars.names,
            unused,
        };
        debug!(
            "Compiled '{}': {} fields, {} blocks, {} signatures, {} steps",
            definition.name,
            definition.fields.len(),
            definition.blocks.len(),
            definition.signatures.len(),
            definition.program.len()
        );
        Ok(definition)
    }
}

impl FieldBuilder {
    fn options_empty(&self) -> bool {
        self.options.as_ref().map_or(true, Vec::is_empty)
    }

    fn flags_empty(&self) -> bool {
        self.flags.as_ref().map_or(true, Vec::is_empty)
    }
}

fn parse_size(attrs: &mut Attrs) -> std::result::Result<SizeMode, CompileError> {
    let fixed = attrs.number::<usize>("fixed")?;
    let remaining = attrs.flag("remaining")?;
    let terminator = attrs.hex("terminator")?;

    match (fixed, remaining, terminator) {
        (Some(0), false, None) => Err(attrs.invalid("fixed", "0", "must be at least 1")),
        (Some(n), false, None) => Ok(SizeMode::Fixed(n)),
        (None, true, None) => Ok(SizeMode::Remaining),
        (None, false, Some(bytes)) => match bytes.as_slice() {
            [byte] => Ok(SizeMode::Terminated(*byte)),
            _ => Err(attrs.invalid("terminator", &hex_string(&bytes), "must be a single byte")),
        },
        (None, false, None) => Err(attrs.error(CompileErrorKind::Invalid(
            "size needs one of 'fixed', 'remaining' or 'terminator'".into(),
        ))),
        _ => Err(attrs.error(CompileErrorKind::Invalid(
            "size takes only one of 'fixed', 'remaining' or 'terminator'".into(),
        ))),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests;
