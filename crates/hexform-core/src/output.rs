//! Output sink contract.
//!
//! The interpreter never renders anything itself. It reports tagged byte ranges
//! and description lines to an [`OutputSink`], which belongs to the presentation
//! layer. [`Collector`] is the sink behind [`Processor::run`](crate::Processor::run):
//! it keeps the ranges in a vector and assembles the [`Description`] tree.
//!
//! After a run, [`fill_gaps`] turns the collected ranges into a total,
//! non-overlapping partition of the buffer.

/// A labelled span of the analyzed buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRange {
    /// First byte
    pub start: usize,
    /// Number of bytes
    pub length: usize,
    /// Palette index
    pub color: u32,
    /// Background (true) or foreground (false) coloring
    pub background: bool,
    /// Primary label
    pub label: String,
    /// Short navigation label
    pub nav_label: Option<String>,
    /// Secondary palette index
    pub accent: Option<u32>,
}

impl TaggedRange {
    /// One past the last byte
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

/// One `label = value` line of the description tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Left-hand side
    pub label: String,
    /// Right-hand side
    pub value: String,
    /// Hover text
    pub tooltip: Option<String>,
}

impl Line {
    /// Creates a line without tooltip
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            tooltip: None,
        }
    }

    /// Attaches a tooltip
    pub fn with_tooltip(mut self, tooltip: Option<String>) -> Self {
        self.tooltip = tooltip;
        self
    }
}

/// A named group of lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    /// Tab caption
    pub name: String,
    /// Lines in write order
    pub lines: Vec<Line>,
}

/// Member of a [`Section`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Plain line
    Line(Line),
    /// Materialized tab
    Tab(Tab),
}

/// Titled group of entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section heading
    pub title: String,
    /// Entries in emission order
    pub entries: Vec<Entry>,
}

impl Section {
    /// Creates an empty section
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            entries: Vec::new(),
        }
    }

    /// Iterates over the plain lines of this section, skipping tabs
    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Line(line) => Some(line),
            Entry::Tab(_) => None,
        })
    }

    /// Finds a materialized tab by name
    pub fn tab(&self, name: &str) -> Option<&Tab> {
        self.entries.iter().find_map(|e| match e {
            Entry::Tab(tab) if tab.name == name => Some(tab),
            _ => None,
        })
    }
}

/// Hierarchical field description produced by a run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Description {
    /// Sections in emission order
    pub sections: Vec<Section>,
}

impl Description {
    /// Finds the value of the first line with `label`, searching tabs too
    pub fn value_of(&self, label: &str) -> Option<&str> {
        self.all_lines()
            .find(|line| line.label == label)
            .map(|line| line.value.as_str())
    }

    /// Every line in document order, tabs included
    pub fn all_lines(&self) -> impl Iterator<Item = &Line> {
        self.sections
            .iter()
            .flat_map(|s| s.entries.iter())
            .flat_map(|e| match e {
                Entry::Line(line) => std::slice::from_ref(line).iter(),
                Entry::Tab(tab) => tab.lines.iter(),
            })
    }
}

/// Receiver of interpreter output events.
///
/// Every method has a no-op default so sinks only implement what they need.
pub trait OutputSink {
    /// A field covered a span of the buffer
    fn range(&mut self, range: TaggedRange) {
        let _ = range;
    }

    /// A new top-level section begins
    fn section(&mut self, title: &str) {
        let _ = title;
    }

    /// A line for the current section
    fn line(&mut self, line: Line) {
        let _ = line;
    }

    /// A tab with at least one line was materialized in the current section
    fn tab(&mut self, tab: Tab) {
        let _ = tab;
    }
}

/// A no-op sink that discards all output
pub struct NullSink;

impl OutputSink for NullSink {}

/// A sink that only counts events
#[derive(Debug, Default)]
pub struct StatsSink {
    /// Number of ranges
    pub range_count: usize,
    /// Bytes covered by ranges, overlaps counted twice
    pub covered_bytes: usize,
    /// Number of sections
    pub section_count: usize,
    /// Number of lines, tab lines included
    pub line_count: usize,
    /// Number of tabs
    pub tab_count: usize,
}

impl OutputSink for StatsSink {
    fn range(&mut self, range: TaggedRange) {
        self.range_count += 1;
        self.covered_bytes += range.length;
    }

    fn section(&mut self, _title: &str) {
        self.section_count += 1;
    }

    fn line(&mut self, _line: Line) {
        self.line_count += 1;
    }

    fn tab(&mut self, tab: Tab) {
        self.tab_count += 1;
        self.line_count += tab.lines.len();
    }
}

/// Sink that keeps everything: ranges in emission order plus the description tree
#[derive(Debug, Default)]
pub struct Collector {
    /// Ranges in emission order
    pub ranges: Vec<TaggedRange>,
    /// Assembled description
    pub description: Description,
}

impl Collector {
    /// Creates an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&mut self) -> &mut Section {
        if self.description.sections.is_empty() {
            self.description.sections.push(Section::new(""));
        }
        let last = self.description.sections.len() - 1;
        &mut self.description.sections[last]
    }
}

impl OutputSink for Collector {
    fn range(&mut self, range: TaggedRange) {
        self.ranges.push(range);
    }

    fn section(&mut self, title: &str) {
        self.description.sections.push(Section::new(title));
    }

    fn line(&mut self, line: Line) {
        self.current().entries.push(Entry::Line(line));
    }

    fn tab(&mut self, tab: Tab) {
        self.current().entries.push(Entry::Tab(tab));
    }
}

/// Makes `ranges` a partition of `[0, len)`.
///
/// Ranges are stably sorted by start offset. A range beginning inside bytes
/// already covered is clipped to its uncovered remainder, or dropped when nothing
/// remains; ranges reaching past `len` are clipped too. Every uncovered span gets
/// one range produced by `filler(start, length)`.
pub fn fill_gaps<F>(ranges: &mut Vec<TaggedRange>, len: usize, mut filler: F)
where
    F: FnMut(usize, usize) -> TaggedRange,
{
    ranges.sort_by_key(|r| r.start);

    let mut out = Vec::with_capacity(ranges.len() * 2 + 1);
    let mut covered = 0usize;
    for mut range in ranges.drain(..) {
        let end = range.end().min(len);
        if range.length == 0 || range.start >= len || end <= covered {
            continue;
        }
        if range.start > covered {
            out.push(filler(covered, range.start - covered));
        } else {
            range.start = covered;
        }
        range.length = end - range.start;
        covered = end;
        out.push(range);
    }
    if covered < len {
        out.push(filler(covered, len - covered));
    }
    *ranges = out;
}
