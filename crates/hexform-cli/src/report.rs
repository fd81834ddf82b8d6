//! Plain-text rendering of analyses.

use hexform_core::{Analysis, Definition, Entry, Line, TaggedRange};
use std::fmt::Write;
use std::path::Path;

/// Full report: header, outcome, ranges and the description tree
pub(crate) fn render_text(source: &Path, definition: &Definition, analysis: &Analysis) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# {}: {} ({})",
        source.display(),
        definition.name(),
        definition.short_name()
    );
    let _ = writeln!(out, "outcome: {} ({} steps)", analysis.outcome, analysis.steps);

    out.push_str("\n## Ranges\n");
    for range in &analysis.ranges {
        out.push_str(&range_line(range));
    }

    out.push_str("\n## Description\n");
    for section in &analysis.description.sections {
        let _ = writeln!(out, "[{}]", section.title);
        for entry in &section.entries {
            match entry {
                Entry::Line(line) => push_line(&mut out, "  ", line),
                Entry::Tab(tab) => {
                    let _ = writeln!(out, "  <{}>", tab.name);
                    for line in &tab.lines {
                        push_line(&mut out, "    ", line);
                    }
                }
            }
        }
    }
    out
}

/// One line per tagged range
pub(crate) fn render_ranges(analysis: &Analysis) -> String {
    analysis.ranges.iter().map(range_line).collect()
}

fn range_line(range: &TaggedRange) -> String {
    let style = if range.background { "bg" } else { "fg" };
    let mut line = format!(
        "{:#010x} {:>8} {}{:<3} {}",
        range.start, range.length, style, range.color, range.label
    );
    if let Some(nav) = &range.nav_label {
        let _ = write!(line, " [{}]", nav);
    }
    line.push('\n');
    line
}

fn push_line(out: &mut String, indent: &str, line: &Line) {
    let _ = write!(out, "{}{} = {}", indent, line.label, line.value);
    if let Some(tooltip) = &line.tooltip {
        let _ = write!(out, "  ; {}", tooltip);
    }
    out.push('\n');
}
