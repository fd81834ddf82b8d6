//! The Processor: executes a definition's run program against a byte buffer.
//!
//! Execution is a single loop over a flat step list with an explicit step
//! pointer. Guarded bodies that are not entered are skipped as opaque spans with
//! [`skip_span`]; loops, selection scopes and block calls each keep their own
//! stack inside a per-run context, so nothing survives from one run to the next
//! and a [`Definition`] can be shared by any number of concurrent runs.
//!
//! Problems with the data never produce an `Err`. The run stops, keeps everything
//! emitted so far and reports why through its [`Outcome`].

pub(crate) mod decode;

use crate::definition::{
    skip_span, BlockId, ByteOrder, Definition, ExecStep, FieldDef, FieldStep, Guard,
    LoopCondition, LoopGuard, Operand, PrintStep, SizeMode, Step, StepKind, VarTest,
};
use crate::magic;
use crate::output::{fill_gaps, Collector, Description, Line, OutputSink, Tab, TaggedRange};
use crate::store::{Value, VariableStore};
use std::fmt;
use tracing::{debug, trace};

/// Default ceiling on executed steps per run
pub const DEFAULT_STEP_LIMIT: u64 = 1_000_000;

/// Default limit on nested block calls
pub const DEFAULT_MAX_BLOCK_DEPTH: usize = 64;

/// Configuration for interpretation runs
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum number of executed steps before the run halts
    pub step_limit: u64,
    /// Maximum depth of nested block calls
    pub max_block_depth: usize,
    /// Partition the buffer with "unused data" ranges after the run
    pub fill_gaps: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            step_limit: DEFAULT_STEP_LIMIT,
            max_block_depth: DEFAULT_MAX_BLOCK_DEPTH,
            fill_gaps: true,
        }
    }
}

impl RunConfig {
    /// Creates a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the step ceiling
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Sets the block nesting limit
    pub fn with_max_block_depth(mut self, depth: usize) -> Self {
        self.max_block_depth = depth;
        self
    }

    /// Enables or disables the gap-filling pass
    pub fn with_fill_gaps(mut self, fill: bool) -> Self {
        self.fill_gaps = fill;
        self
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Outcome {
    /// The whole program ran
    Completed,
    /// A field needed more bytes than the buffer has
    Exhausted {
        /// Where the field started
        offset: usize,
        /// Field name
        field: String,
    },
    /// A value matched no option, or set bits no flag
    UnknownValue {
        /// Where the field started
        offset: usize,
        /// Field name
        field: String,
    },
    /// The step ceiling was reached
    StepLimit {
        /// Steps executed
        steps: u64,
    },
    /// Block calls nested too deeply
    BlockDepth {
        /// Block whose call was refused
        block: String,
    },
}

impl Outcome {
    /// Returns true if the program ran to its end
    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Exhausted { offset, field } => {
                write!(f, "out of data reading '{}' at offset {:#x}", field, offset)
            }
            Outcome::UnknownValue { offset, field } => {
                write!(f, "unknown value for '{}' at offset {:#x}", field, offset)
            }
            Outcome::StepLimit { steps } => write!(f, "stopped after {} steps", steps),
            Outcome::BlockDepth { block } => {
                write!(f, "block calls nested too deeply entering '{}'", block)
            }
        }
    }
}

/// Outcome and step count of a streamed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// How the run ended
    pub outcome: Outcome,
    /// Steps executed
    pub steps: u64,
}

/// Everything a run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    /// Tagged ranges; a partition of the buffer when gap filling is on
    pub ranges: Vec<TaggedRange>,
    /// Description tree
    pub description: Description,
    /// How the run ended
    pub outcome: Outcome,
    /// Steps executed
    pub steps: u64,
}

/// Runs definitions against buffers.
///
/// # Example
///
/// ```
/// use hexform_core::{compile, Processor};
///
/// let definition = compile(r#"
///     <format name="Example" short="EX">
///       <endianness order="little"/>
///       <magic><signature><match value="01"/></signature></magic>
///       <colors/>
///       <field-defs>
///         <field id="magic"><size fixed="4"/><print mode="hex"/></field>
///       </field-defs>
///       <run><field ref="magic"/></run>
///     </format>
/// "#)?;
///
/// let processor = Processor::new(&definition);
/// let data = [0x01, 0x00, 0x00, 0x00, 0xFF];
/// assert!(processor.detect(&data));
///
/// let analysis = processor.run(&data);
/// assert_eq!(analysis.description.value_of("magic"), Some("1"));
/// assert_eq!(analysis.ranges.len(), 2);
/// # Ok::<(), hexform_core::CompileError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Processor<'d> {
    definition: &'d Definition,
    config: RunConfig,
}

impl<'d> Processor<'d> {
    /// Creates a processor with the default configuration
    pub fn new(definition: &'d Definition) -> Self {
        Self::with_config(definition, RunConfig::default())
    }

    /// Creates a processor with a custom configuration
    pub fn with_config(definition: &'d Definition, config: RunConfig) -> Self {
        Self { definition, config }
    }

    /// The definition this processor runs
    pub fn definition(&self) -> &'d Definition {
        self.definition
    }

    /// Active configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Returns true if any magic candidate accepts `data`
    pub fn detect(&self, data: &[u8]) -> bool {
        magic::detect(self.definition, data)
    }

    /// Runs the main program and collects its output
    pub fn run(&self, data: &[u8]) -> Analysis {
        let mut collector = Collector::new();
        let summary = self.run_with_sink(data, &mut collector);

        let mut ranges = collector.ranges;
        if self.config.fill_gaps {
            fill_gaps(&mut ranges, data.len(), |start, length| {
                tagged_range(self.definition, self.definition.unused_field(), start, length)
            });
        }

        Analysis {
            ranges,
            description: collector.description,
            outcome: summary.outcome,
            steps: summary.steps,
        }
    }

    /// Runs the main program, streaming events to `sink`.
    ///
    /// Ranges arrive in emission order; no gap filling is applied.
    pub fn run_with_sink<S: OutputSink + ?Sized>(&self, data: &[u8], sink: &mut S) -> Summary {
        debug!(
            "Running '{}' over {} bytes",
            self.definition.name(),
            data.len()
        );
        let mut context = RunContext::new(self.definition, &self.config, data, sink);
        let outcome = context.execute();
        context.flush_tabs();

        match &outcome {
            Outcome::Completed => debug!("Run completed after {} steps", context.steps),
            other => debug!("Run halted: {}", other),
        }
        Summary {
            outcome,
            steps: context.steps,
        }
    }
}

/// Runs `definition` over `data` with the default configuration
pub fn run(definition: &Definition, data: &[u8]) -> Analysis {
    Processor::new(definition).run(data)
}

/// Builds the range for `field` over `[start, start + length)`
fn tagged_range(definition: &Definition, field: &FieldDef, start: usize, length: usize) -> TaggedRange {
    let (color, background) = definition.color_style(field.color);
    TaggedRange {
        start,
        length,
        color,
        background,
        label: field.name.clone(),
        nav_label: field.tag.clone(),
        accent: field.accent.map(|id| definition.color(id).index),
    }
}

/// Step list being executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Program {
    Main,
    Block(BlockId),
}

/// Where to resume after a block returns
#[derive(Debug, Clone, Copy)]
struct Return {
    program: Program,
    pc: usize,
}

/// Resume point of an active loop
#[derive(Debug, Clone, Copy)]
struct LoopFrame {
    program: Program,
    start: usize,
    call_depth: usize,
    iterations: u64,
}

/// An open selection scope
#[derive(Debug, Clone, Copy)]
struct SelectionFrame {
    match_depth: usize,
    loop_depth: usize,
    call_depth: usize,
    satisfied: bool,
}

/// What to do after a step
enum Flow {
    Next,
    Jump(usize),
    Call(BlockId),
}

/// Mutable state of one run
struct RunContext<'r, S: ?Sized> {
    definition: &'r Definition,
    config: &'r RunConfig,
    data: &'r [u8],
    sink: &'r mut S,
    cursor: usize,
    vars: VariableStore,
    tabs: Vec<Tab>,
    loops: Vec<LoopFrame>,
    selections: Vec<SelectionFrame>,
    returns: Vec<Return>,
    match_depth: usize,
    steps: u64,
}

impl<'r, S: OutputSink + ?Sized> RunContext<'r, S> {
    fn new(definition: &'r Definition, config: &'r RunConfig, data: &'r [u8], sink: &'r mut S) -> Self {
        Self {
            definition,
            config,
            data,
            sink,
            cursor: 0,
            vars: VariableStore::new(definition.variables().len()),
            tabs: Vec::new(),
            loops: Vec::new(),
            selections: Vec::new(),
            returns: Vec::new(),
            match_depth: 0,
            steps: 0,
        }
    }

    fn program(&self, program: Program) -> &'r [Step] {
        match program {
            Program::Main => self.definition.program(),
            Program::Block(id) => &self.definition.block(id).steps,
        }
    }

    fn execute(&mut self) -> Outcome {
        self.sink.section(self.definition.name());

        let mut program = Program::Main;
        let mut pc = 0;
        loop {
            let steps = self.program(program);
            let Some(step) = steps.get(pc) else {
                match self.returns.pop() {
                    Some(ret) => {
                        trace!("Returning from block at step {}", ret.pc);
                        program = ret.program;
                        pc = ret.pc;
                        continue;
                    }
                    None => return Outcome::Completed,
                }
            };

            if self.steps >= self.config.step_limit {
                return Outcome::StepLimit { steps: self.steps };
            }
            self.steps += 1;

            match self.step(program, steps, pc, step) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Call(block)) => {
                    let name = &self.definition.block(block).id;
                    if self.returns.len() >= self.config.max_block_depth {
                        return Outcome::BlockDepth {
                            block: name.clone(),
                        };
                    }
                    trace!("Entering block '{}'", name);
                    self.returns.push(Return {
                        program,
                        pc: pc + 1,
                    });
                    program = Program::Block(block);
                    pc = 0;
                }
                Err(outcome) => return outcome,
            }
        }
    }

    fn step(&mut self, program: Program, steps: &[Step], pc: usize, step: &Step) -> Result<Flow, Outcome> {
        match step {
            Step::Field(field) => self.field(field).map(|()| Flow::Next),
            Step::MatchStart(guard) => Ok(self.match_start(guard, steps, pc)),
            Step::MatchEnd => Ok(self.match_end(steps, pc)),
            Step::LoopStart(guard) => Ok(self.loop_start(program, guard, steps, pc)),
            Step::LoopEnd => Ok(self.loop_end(program)),
            Step::SelectionStart => {
                self.selections.push(SelectionFrame {
                    match_depth: self.match_depth,
                    loop_depth: self.loops.len(),
                    call_depth: self.returns.len(),
                    satisfied: false,
                });
                Ok(Flow::Next)
            }
            Step::SelectionEnd => {
                self.selections.pop();
                Ok(Flow::Next)
            }
            Step::Block(block) => Ok(Flow::Call(*block)),
            Step::Print(print) => {
                self.print(print);
                Ok(Flow::Next)
            }
            Step::Exec(exec) => {
                self.exec(exec);
                Ok(Flow::Next)
            }
            Step::Section(title) => {
                self.sink.section(title);
                Ok(Flow::Next)
            }
            Step::Insert(name) => {
                self.insert(name);
                Ok(Flow::Next)
            }
        }
    }

    /// Selection whose direct children include the current match, if any
    fn enclosing_selection(&mut self, match_depth: usize) -> Option<&mut SelectionFrame> {
        let loop_depth = self.loops.len();
        let call_depth = self.returns.len();
        self.selections.last_mut().filter(|sel| {
            sel.match_depth == match_depth && sel.loop_depth == loop_depth && sel.call_depth == call_depth
        })
    }

    fn match_start(&mut self, guard: &Guard, steps: &[Step], pc: usize) -> Flow {
        if !self.guard_holds(guard) {
            let target = skip_span(steps, pc + 1, StepKind::Match);
            trace!("Match at step {} failed, skipping to {}", pc, target);
            return Flow::Jump(target);
        }
        if let Some(selection) = self.enclosing_selection(self.match_depth) {
            selection.satisfied = true;
        }
        self.match_depth += 1;
        Flow::Next
    }

    fn match_end(&mut self, steps: &[Step], pc: usize) -> Flow {
        self.match_depth = self.match_depth.saturating_sub(1);
        let satisfied = self
            .enclosing_selection(self.match_depth)
            .is_some_and(|selection| selection.satisfied);
        if satisfied {
            self.selections.pop();
            let target = skip_span(steps, pc + 1, StepKind::Selection);
            trace!("Selection satisfied, skipping to {}", target);
            return Flow::Jump(target);
        }
        Flow::Next
    }

    fn loop_start(&mut self, program: Program, guard: &LoopGuard, steps: &[Step], pc: usize) -> Flow {
        let call_depth = self.returns.len();
        let resumed = self
            .loops
            .last()
            .is_some_and(|l| l.program == program && l.start == pc && l.call_depth == call_depth);
        let iterations = if resumed {
            self.loops.last().map_or(0, |l| l.iterations)
        } else {
            0
        };

        let below_cap = guard.max_iterations.map_or(true, |max| iterations < max);
        if below_cap && self.loop_condition(guard.condition) {
            if resumed {
                if let Some(frame) = self.loops.last_mut() {
                    frame.iterations += 1;
                }
            } else {
                self.loops.push(LoopFrame {
                    program,
                    start: pc,
                    call_depth,
                    iterations: 1,
                });
            }
            return Flow::Next;
        }

        if resumed {
            self.loops.pop();
        }
        let target = skip_span(steps, pc + 1, StepKind::Loop);
        trace!("Loop at step {} done after {} iterations", pc, iterations);
        Flow::Jump(target)
    }

    fn loop_end(&mut self, program: Program) -> Flow {
        match self.loops.last() {
            Some(frame) if frame.program == program => Flow::Jump(frame.start),
            _ => Flow::Next,
        }
    }

    fn loop_condition(&self, condition: LoopCondition) -> bool {
        match condition {
            LoopCondition::Remaining => self.cursor < self.data.len(),
            LoopCondition::Until { var, target } => match self.vars.integer(var) {
                None => true,
                Some(value) => value < self.operand(target),
            },
            LoopCondition::Always => true,
        }
    }

    fn guard_holds(&self, guard: &Guard) -> bool {
        match guard {
            Guard::Var { var, test } => {
                let Some(value) = self.vars.integer(*var) else {
                    return false;
                };
                match *test {
                    VarTest::Equals(op) => value == self.operand(op),
                    VarTest::Greater(op) => value > self.operand(op),
                    VarTest::BitSet(op) => (value as u64) & (self.operand(op) as u64) != 0,
                    VarTest::Defined => true,
                }
            }
            Guard::Bytes { pattern, convert } => {
                let expected: Vec<u8> = if *convert && self.byte_order() == ByteOrder::Little {
                    pattern.iter().rev().copied().collect()
                } else {
                    pattern.clone()
                };
                self.cursor
                    .checked_add(expected.len())
                    .and_then(|end| self.data.get(self.cursor..end))
                    .is_some_and(|bytes| bytes == expected.as_slice())
            }
        }
    }

    fn byte_order(&self) -> ByteOrder {
        self.definition.endianness().resolve(&self.vars)
    }

    /// Integer value of an operand; undefined variables read as zero
    fn operand(&self, operand: Operand) -> i128 {
        match operand {
            Operand::Literal(value) => value as i128,
            Operand::Var(var) => self.vars.integer(var).unwrap_or(0),
        }
    }

    fn operand_value(&self, operand: Operand) -> Value {
        match operand {
            Operand::Literal(value) if value < 0 => Value::Signed(value),
            Operand::Literal(value) => Value::Unsigned(value as u64),
            Operand::Var(var) => self
                .vars
                .get(var)
                .map_or(Value::Unsigned(0), |variable| variable.value),
        }
    }

    fn field(&mut self, step: &FieldStep) -> Result<(), Outcome> {
        let field = self.definition.field(step.field);
        let saved = self.cursor;

        if let Some(offset) = step.offset {
            let target = self.operand(offset);
            match usize::try_from(target).ok().filter(|&at| at <= self.data.len()) {
                Some(at) => self.cursor = at,
                None => {
                    return Err(Outcome::Exhausted {
                        offset: self.cursor,
                        field: field.name.clone(),
                    })
                }
            }
        }

        let result = self.decode_field(field, step);
        if step.offset.is_some() {
            self.cursor = saved;
        }
        result
    }

    fn decode_field(&mut self, field: &'r FieldDef, step: &FieldStep) -> Result<(), Outcome> {
        let start = self.cursor;
        let limit = step.limit.map(|op| self.operand(op));
        let Some(size) = self.resolve_size(field, limit) else {
            return Err(Outcome::Exhausted {
                offset: start,
                field: field.name.clone(),
            });
        };

        if size == 0 {
            self.write_line(step.tab.as_deref(), Line::new(field.name.clone(), ""));
            return Ok(());
        }

        let bytes = &self.data[start..start + size];
        let order = self.byte_order();
        let rendered = decode::render(field, bytes, order);

        if field.bits.is_none() {
            self.sink
                .range(tagged_range(self.definition, field, start, size));
        }
        let line = Line::new(field.name.clone(), rendered.value).with_tooltip(field.tooltip.clone());
        self.write_line(step.tab.as_deref(), line);
        for extra in rendered.extra {
            self.write_line(step.tab.as_deref(), extra);
        }
        if let Some(var) = step.var {
            self.vars.set(var, decode::capture(field, bytes, order));
        }
        if field.bits.is_none() {
            self.cursor = start + size;
        }

        if rendered.known {
            Ok(())
        } else {
            Err(Outcome::UnknownValue {
                offset: start,
                field: field.name.clone(),
            })
        }
    }

    /// Concrete byte count of a field at the cursor, or `None` if the buffer is too short.
    ///
    /// Negative limits count as zero.
    fn resolve_size(&self, field: &FieldDef, limit: Option<i128>) -> Option<usize> {
        let remaining = self.data.len().saturating_sub(self.cursor);
        let limit = limit.map(|l| usize::try_from(l.max(0)).unwrap_or(usize::MAX));

        match field.size {
            SizeMode::Fixed(n) => (n <= remaining).then_some(n),
            SizeMode::Remaining => match limit {
                None => Some(remaining),
                Some(l) => (l <= remaining).then_some(l),
            },
            SizeMode::Terminated(terminator) => {
                let window = limit.map_or(remaining, |l| l.min(remaining));
                let scanned = &self.data[self.cursor..self.cursor + window];
                match scanned.iter().position(|&b| b == terminator) {
                    Some(i) => Some(i + 1),
                    None => limit.filter(|&l| l <= remaining),
                }
            }
        }
    }

    fn print(&mut self, step: &PrintStep) {
        let value = match self.vars.get(step.var) {
            None if step.suppress_undefined => return,
            None => String::new(),
            Some(variable) if step.hex => format!("{:X}", variable.as_u64()),
            Some(variable) => match variable.value {
                Value::Rational(ratio) => ratio.to_string(),
                _ => variable.integer().to_string(),
            },
        };
        self.write_line(step.tab.as_deref(), Line::new(step.label.clone(), value));
    }

    fn exec(&mut self, step: &ExecStep) {
        let operand = self.operand_value(step.operand);
        self.vars
            .apply(step.var, step.op, step.signed, Some(operand), step.width);
        trace!(
            "exec {:?} on '{}' -> {:?}",
            step.op,
            self.definition.variable_name(step.var),
            self.vars.get(step.var).map(|v| v.value)
        );
    }

    /// Writes a line directly, or into an open tab created on first use
    fn write_line(&mut self, tab: Option<&str>, line: Line) {
        let Some(name) = tab else {
            self.sink.line(line);
            return;
        };
        match self.tabs.iter_mut().find(|t| t.name == name) {
            Some(open) => open.lines.push(line),
            None => self.tabs.push(Tab {
                name: name.to_string(),
                lines: vec![line],
            }),
        }
    }

    fn insert(&mut self, name: &str) {
        if let Some(index) = self.tabs.iter().position(|t| t.name == name) {
            let tab = self.tabs.remove(index);
            if !tab.lines.is_empty() {
                self.sink.tab(tab);
            }
        }
    }

    /// Materializes tabs still open, in the order they were opened
    fn flush_tabs(&mut self) {
        for tab in std::mem::take(&mut self.tabs) {
            if !tab.lines.is_empty() {
                self.sink.tab(tab);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::output::{Entry, StatsSink};

    fn definition(endianness: &str, fields: &str, blocks: &str, run: &str) -> Definition {
        let source = format!(
            r#"<format name="Test" short="TST">
  <endianness order="{endianness}"/>
  <magic><signature><match value="00"/></signature></magic>
  <colors><color id="c" index="3"/></colors>
  <field-defs>{fields}</field-defs>
  <block-defs>{blocks}</block-defs>
  <run>{run}</run>
</format>"#
        );
        compile(&source).unwrap()
    }

    const BYTE: &str = r#"<field id="b" name="byte" color="c"><size fixed="1"/><print mode="uint"/></field>"#;

    #[test]
    fn test_description_starts_with_name() {
        let def = definition("big", BYTE, "", "");
        let analysis = run(&def, &[]);
        assert_eq!(analysis.outcome, Outcome::Completed);
        assert_eq!(analysis.description.sections[0].title, "Test");
        assert!(analysis.ranges.is_empty());
    }

    #[test]
    fn test_field_advances_and_captures() {
        let def = definition("big", BYTE, "", r#"<field ref="b" var="x"/><field ref="b"/><print label="x" var="x"/>"#);
        let analysis = run(&def, &[7, 9]);
        assert_eq!(analysis.outcome, Outcome::Completed);
        let values: Vec<_> = analysis
            .description
            .all_lines()
            .map(|l| l.value.as_str())
            .collect();
        assert_eq!(values, ["7", "9", "7"]);
        assert_eq!(analysis.ranges[1].start, 1);
        assert_eq!(analysis.ranges[0].color, 3);
    }

    #[test]
    fn test_exhausted_keeps_partial_output() {
        let def = definition("big", BYTE, "", r#"<field ref="b"/><field ref="b"/><field ref="b"/>"#);
        let analysis = run(&def, &[1, 2]);
        assert_eq!(
            analysis.outcome,
            Outcome::Exhausted {
                offset: 2,
                field: "byte".into()
            }
        );
        assert_eq!(analysis.description.all_lines().count(), 2);
        assert_eq!(analysis.ranges.len(), 2);
    }

    #[test]
    fn test_offset_restores_cursor() {
        let def = definition("big", BYTE, "", r#"<field ref="b" offset="2"/><field ref="b"/>"#);
        let analysis = run(&def, &[10, 20, 30]);
        let values: Vec<_> = analysis
            .description
            .all_lines()
            .map(|l| l.value.as_str())
            .collect();
        assert_eq!(values, ["30", "10"]);
    }

    #[test]
    fn test_offset_past_end_halts() {
        let def = definition("big", BYTE, "", r#"<field ref="b" offset="9"/>"#);
        let analysis = run(&def, &[1]);
        assert!(matches!(analysis.outcome, Outcome::Exhausted { .. }));
    }

    #[test]
    fn test_remaining_with_limit() {
        let fields = r#"<field id="rest"><size remaining="true"/></field>"#;
        let def = definition("big", fields, "", r#"<field ref="rest" limit="2"/><field ref="rest"/>"#);
        let analysis = run(&def, &[1, 2, 3, 4, 5]);
        assert_eq!(analysis.outcome, Outcome::Completed);
        assert_eq!(analysis.ranges[0].length, 2);
        assert_eq!(analysis.ranges[1].length, 3);

        let def = definition("big", fields, "", r#"<field ref="rest" limit="9"/>"#);
        assert!(matches!(run(&def, &[1]).outcome, Outcome::Exhausted { .. }));
    }

    #[test]
    fn test_terminator_field() {
        let fields = r#"<field id="s" name="name"><size terminator="00"/><encoding value="ascii"/></field>"#;
        let def = definition("big", fields, "", r#"<field ref="s"/><field ref="s" limit="2"/>"#);
        let analysis = run(&def, b"hi\0abc");
        assert_eq!(analysis.outcome, Outcome::Completed);
        assert_eq!((analysis.ranges[0].start, analysis.ranges[0].length), (0, 3));
        assert_eq!((analysis.ranges[1].start, analysis.ranges[1].length), (3, 2));
        let values: Vec<_> = analysis
            .description
            .all_lines()
            .map(|l| l.value.as_str())
            .collect();
        assert_eq!(values, ["hi", "ab"]);

        let def = definition("big", fields, "", r#"<field ref="s"/>"#);
        assert!(matches!(run(&def, b"abc").outcome, Outcome::Exhausted { .. }));
    }

    #[test]
    fn test_zero_limit_writes_blank_line() {
        let fields = r#"<field id="rest"><size remaining="true"/></field>"#;
        let def = definition("big", fields, "", r#"<field ref="rest" limit="0"/>"#);
        let analysis = Processor::with_config(&def, RunConfig::new().with_fill_gaps(false)).run(&[1]);
        assert_eq!(analysis.outcome, Outcome::Completed);
        assert!(analysis.ranges.is_empty());
        assert_eq!(analysis.description.value_of("rest"), Some(""));
    }

    #[test]
    fn test_bit_fields_do_not_advance() {
        let fields = r#"
<field id="hi"><size fixed="1"/><mask value="F0"/><shift bits="4"/><print mode="uint"/></field>
<field id="lo"><size fixed="1"/><mask value="0F"/><print mode="uint"/></field>
<field id="all"><size fixed="1"/><print mode="hex"/></field>"#;
        let def = definition("big", fields, "", r#"<field ref="hi"/><field ref="lo"/><field ref="all"/>"#);
        let analysis = Processor::with_config(&def, RunConfig::new().with_fill_gaps(false)).run(&[0xA5]);
        assert_eq!(analysis.description.value_of("hi"), Some("10"));
        assert_eq!(analysis.description.value_of("lo"), Some("5"));
        assert_eq!(analysis.description.value_of("all"), Some("A5"));
        assert_eq!(analysis.ranges.len(), 1);
        assert_eq!(analysis.ranges[0].label, "all");
    }

    #[test]
    fn test_unknown_option_halts() {
        let fields = r#"<field id="k" name="kind"><size fixed="1"/><print mode="options"/>
<options><option name="A" value="01"/></options></field>"#;
        let def = definition("big", fields, "", r#"<field ref="k"/><field ref="k"/>"#);
        let analysis = run(&def, &[1, 2, 1]);
        assert_eq!(
            analysis.outcome,
            Outcome::UnknownValue {
                offset: 1,
                field: "kind".into()
            }
        );
        let values: Vec<_> = analysis
            .description
            .all_lines()
            .map(|l| l.value.as_str())
            .collect();
        assert_eq!(values, ["A", ""]);
    }

    #[test]
    fn test_match_on_variable() {
        let run_steps = r#"
<field ref="b" var="t"/>
<match var="t" eq="2"><section title="two"/></match>
<match var="t" gt="1"><section title="big"/></match>
<match var="t" bit="4"><section title="bit"/></match>
<match var="u" defined="true"><section title="never"/></match>"#;
        let def = definition("big", BYTE, "", run_steps);
        let analysis = run(&def, &[2]);
        let titles: Vec<_> = analysis
            .description
            .sections
            .iter()
            .map(|s| s.title.as_str())
            .collect();
        assert_eq!(titles, ["Test", "two", "big"]);
    }

    #[test]
    fn test_match_bytes_with_conversion() {
        let run_steps = r#"
<match bytes="0102" convert="true"><section title="converted"/></match>
<match bytes="0102"><section title="literal"/></match>
<match bytes="0201"><section title="buffer order"/></match>"#;
        let def = definition("little", BYTE, "", run_steps);
        let analysis = run(&def, &[0x02, 0x01]);
        let titles: Vec<_> = analysis
            .description
            .sections
            .iter()
            .map(|s| s.title.as_str())
            .collect();
        assert_eq!(titles, ["Test", "converted", "buffer order"]);
    }

    #[test]
    fn test_selection_first_match_wins() {
        let run_steps = r#"
<exec var="t" op="set" value="5"/>
<selection>
  <match var="t" eq="1"><section title="one"/></match>
  <match var="t" gt="2"><section title="first"/></match>
  <match var="t" eq="5"><section title="second"/></match>
</selection>
<section title="after"/>"#;
        let def = definition("big", BYTE, "", run_steps);
        let analysis = run(&def, &[]);
        let titles: Vec<_> = analysis
            .description
            .sections
            .iter()
            .map(|s| s.title.as_str())
            .collect();
        assert_eq!(titles, ["Test", "first", "after"]);
    }

    #[test]
    fn test_nested_match_inside_selection() {
        let run_steps = r#"
<exec var="t" op="set" value="1"/>
<selection>
  <match var="t" eq="1">
    <match var="t" eq="1"><section title="inner"/></match>
    <section title="outer"/>
  </match>
  <match var="t" eq="1"><section title="skipped"/></match>
</selection>"#;
        let def = definition("big", BYTE, "", run_steps);
        let analysis = run(&def, &[]);
        let titles: Vec<_> = analysis
            .description
            .sections
            .iter()
            .map(|s| s.title.as_str())
            .collect();
        assert_eq!(titles, ["Test", "inner", "outer"]);
    }

    #[test]
    fn test_loop_remaining() {
        let def = definition("big", BYTE, "", r#"<loop remaining="true"><field ref="b"/></loop>"#);
        let analysis = run(&def, &[1, 2, 3]);
        assert_eq!(analysis.outcome, Outcome::Completed);
        assert_eq!(analysis.ranges.len(), 3);
    }

    #[test]
    fn test_loop_count_cap() {
        let def = definition("big", BYTE, "", r#"<loop remaining="true" count="2"><field ref="b"/></loop>"#);
        let analysis = Processor::with_config(&def, RunConfig::new().with_fill_gaps(false)).run(&[1, 2, 3]);
        assert_eq!(analysis.ranges.len(), 2);
    }

    #[test]
    fn test_loop_until() {
        let run_steps = r#"
<exec var="i" op="set" value="0"/>
<loop var="i" until="3">
  <field ref="b"/>
  <exec var="i" op="add" value="1"/>
</loop>
<print label="i" var="i"/>"#;
        let def = definition("big", BYTE, "", run_steps);
        let analysis = run(&def, &[1, 2, 3, 4]);
        assert_eq!(analysis.description.value_of("i"), Some("3"));
        assert_eq!(analysis.ranges.iter().filter(|r| r.label == "byte").count(), 3);
    }

    #[test]
    fn test_nested_loops() {
        let run_steps = r#"
<loop count="2">
  <loop count="3"><exec var="n" op="add" value="1"/></loop>
</loop>
<print label="n" var="n"/>"#;
        let def = definition("big", BYTE, "", run_steps);
        let analysis = run(&def, &[]);
        assert_eq!(analysis.description.value_of("n"), Some("6"));
    }

    #[test]
    fn test_unbounded_loop_hits_step_limit() {
        let def = definition("big", BYTE, "", r#"<loop var="never" until="1"><section title="spin"/></loop>"#);
        let config = RunConfig::new().with_step_limit(100);
        let analysis = Processor::with_config(&def, config).run(&[0; 4]);
        assert_eq!(analysis.outcome, Outcome::StepLimit { steps: 100 });
        assert_eq!(analysis.steps, 100);
    }

    #[test]
    fn test_block_call_and_return() {
        let blocks = r#"<block-def id="pair"><field ref="b"/><field ref="b"/></block-def>"#;
        let def = definition("big", BYTE, blocks, r#"<block ref="pair"/><section title="back"/><block ref="pair"/>"#);
        let analysis = run(&def, &[1, 2, 3, 4]);
        assert_eq!(analysis.outcome, Outcome::Completed);
        assert_eq!(analysis.ranges.len(), 4);
        assert_eq!(analysis.description.sections[1].title, "back");
    }

    #[test]
    fn test_recursive_block_depth() {
        let blocks = r#"<block-def id="again"><block ref="again"/></block-def>"#;
        let def = definition("big", BYTE, blocks, r#"<block ref="again"/>"#);
        let config = RunConfig::new().with_max_block_depth(8);
        let analysis = Processor::with_config(&def, config).run(&[]);
        assert_eq!(
            analysis.outcome,
            Outcome::BlockDepth {
                block: "again".into()
            }
        );
    }

    #[test]
    fn test_loop_inside_block() {
        let blocks = r#"<block-def id="bytes"><loop count="2"><field ref="b"/></loop></block-def>"#;
        let def = definition("big", BYTE, blocks, r#"<block ref="bytes"/><block ref="bytes"/>"#);
        let analysis = run(&def, &[1, 2, 3, 4]);
        assert_eq!(analysis.outcome, Outcome::Completed);
        assert_eq!(analysis.ranges.len(), 4);
    }

    #[test]
    fn test_print_modes() {
        let run_steps = r#"
<exec var="x" op="set" value="255"/>
<print label="dec" var="x"/>
<print label="hex" var="x" hex="true"/>
<exec var="x" op="div" value="2"/>
<print label="ratio" var="x"/>
<print label="missing" var="y"/>
<print label="hidden" var="y" suppress="true"/>"#;
        let def = definition("big", BYTE, "", run_steps);
        let d = run(&def, &[]).description;
        assert_eq!(d.value_of("dec"), Some("255"));
        assert_eq!(d.value_of("hex"), Some("FF"));
        assert_eq!(d.value_of("ratio"), Some("255/2"));
        assert_eq!(d.value_of("missing"), Some(""));
        assert_eq!(d.value_of("hidden"), None);
    }

    #[test]
    fn test_tabs_materialize_lazily() {
        let run_steps = r#"
<field ref="b" tab="Details"/>
<section title="Body"/>
<insert tab="Empty"/>
<insert tab="Details"/>
<field ref="b" tab="Later"/>"#;
        let def = definition("big", BYTE, "", run_steps);
        let analysis = run(&def, &[1, 2]);
        let sections = &analysis.description.sections;
        assert_eq!(sections.len(), 2);
        assert!(sections[0].entries.is_empty());
        assert!(matches!(&sections[1].entries[0], Entry::Tab(tab) if tab.name == "Details"));
        assert!(sections[1].tab("Later").is_some());
        assert!(sections[1].tab("Empty").is_none());
    }

    #[test]
    fn test_tabs_flushed_after_halt() {
        let def = definition("big", BYTE, "", r#"<field ref="b" tab="T"/><field ref="b"/>"#);
        let analysis = run(&def, &[1]);
        assert!(matches!(analysis.outcome, Outcome::Exhausted { .. }));
        assert_eq!(analysis.description.sections[0].tab("T").map(|t| t.lines.len()), Some(1));
    }

    #[test]
    fn test_variable_endianness() {
        let source = r#"<format name="Order" short="ORD">
  <endianness order="variable" var="bom" big="4D4D" little="4949"/>
  <magic><signature><read var="bom" size="2"/></signature></magic>
  <colors/>
  <field-defs>
    <field id="bom"><size fixed="2"/></field>
    <field id="value"><size fixed="2"/><print mode="uint"/></field>
  </field-defs>
  <run><field ref="bom" var="bom"/><field ref="value"/></run>
</format>"#;
        let def = compile(source).unwrap();
        let little = run(&def, &[0x49, 0x49, 0x01, 0x00]);
        assert_eq!(little.description.value_of("value"), Some("1"));
        let big = run(&def, &[0x4D, 0x4D, 0x01, 0x00]);
        assert_eq!(big.description.value_of("value"), Some("256"));
    }

    #[test]
    fn test_run_with_sink() {
        let def = definition("big", BYTE, "", r#"<field ref="b"/><field ref="b"/>"#);
        let mut sink = StatsSink::default();
        let summary = Processor::new(&def).run_with_sink(&[1, 2, 3], &mut sink);
        assert!(summary.outcome.is_complete());
        assert_eq!(summary.steps, 2);
        assert_eq!(sink.range_count, 2);
        assert_eq!(sink.section_count, 1);
    }

    #[test]
    fn test_outcome_display() {
        let outcome = Outcome::Exhausted {
            offset: 16,
            field: "size".into(),
        };
        assert_eq!(outcome.to_string(), "out of data reading 'size' at offset 0x10");
        assert!(!outcome.is_complete());
    }
}
