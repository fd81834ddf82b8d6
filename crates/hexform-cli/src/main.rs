//! hexform - Inspect binary files against declarative format definitions
//!
//! This tool compiles one or more XML format definitions, picks the first one
//! whose magic signature accepts each input file, and reports the labelled byte
//! ranges and field description the definition produces.

mod report;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, ValueEnum};
use hexform_core::{compile_file, Definition, Processor, RunConfig};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Inspect binary files against declarative format definitions
#[derive(Parser, Debug)]
#[command(name = "hexform")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Format definition document (may be given several times; tried in order)
    #[arg(short = 'D', long = "definition", required = true)]
    definitions: Vec<PathBuf>,

    #[command(flatten)]
    input: InputMode,

    /// Output directory for reports (default: print to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Report format
    #[arg(long, value_enum, default_value = "text")]
    format: ReportFormat,

    /// Maximum number of executed steps per file
    #[arg(long, default_value_t = hexform_core::interpreter::DEFAULT_STEP_LIMIT)]
    step_limit: u64,

    /// Do not label uncovered bytes as unused data
    #[arg(long)]
    no_gaps: bool,

    /// Overwrite existing reports
    #[arg(long)]
    force: bool,

    /// Only report which format each file was detected as
    #[arg(long)]
    detect_only: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single file to analyze
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of files to analyze
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

/// Report layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    /// Outcome, ranges and the description tree
    Text,
    /// One line per tagged range (for scripting)
    Ranges,
}

/// Tracks analyzed content for deduplication
#[derive(Default)]
struct AnalysisRegistry {
    /// Maps content hash -> first file with that content
    seen: HashMap<String, PathBuf>,
    /// Statistics
    stats: RegistryStats,
}

#[derive(Default)]
struct RegistryStats {
    files_seen: usize,
    duplicates_skipped: usize,
    unrecognized: usize,
    complete: usize,
    partial: usize,
    written: usize,
}

impl AnalysisRegistry {
    fn new() -> Self {
        Self::default()
    }

    /// Compute a short hash of the content (first 8 chars of blake3)
    fn content_hash(data: &[u8]) -> String {
        let hash = blake3::hash(data);
        hash.to_hex()[..8].to_string()
    }

    /// Registers a file; returns the earlier file if the content was already seen
    fn register(&mut self, content_hash: &str, path: &Path) -> Option<PathBuf> {
        self.stats.files_seen += 1;

        if let Some(original) = self.seen.get(content_hash) {
            debug!(
                "Skipping duplicate: {} (same content as {}, hash: {})",
                path.display(),
                original.display(),
                content_hash
            );
            self.stats.duplicates_skipped += 1;
            return Some(original.clone());
        }

        self.seen
            .insert(content_hash.to_string(), path.to_path_buf());
        None
    }

    fn print_summary(&self) {
        info!(
            "Summary: {} files, {} duplicates skipped, {} unrecognized, {} complete, {} partial, {} written",
            self.stats.files_seen,
            self.stats.duplicates_skipped,
            self.stats.unrecognized,
            self.stats.complete,
            self.stats.partial,
            self.stats.written
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    let definitions = load_definitions(&cli.definitions)?;

    // Dispatch based on input mode
    if let Some(ref file) = cli.input.file {
        process_single_file(&cli, &definitions, file)
    } else if let Some(ref directory) = cli.input.directory {
        process_directory(&cli, &definitions, directory)
    } else {
        bail!("Either --file or --directory must be specified")
    }
}

/// Compile every definition document; the first failure aborts
fn load_definitions(paths: &[PathBuf]) -> Result<Vec<Definition>> {
    paths
        .iter()
        .map(|path| {
            let definition = compile_file(path)
                .with_context(|| format!("Failed to load definition: {}", path.display()))?;
            info!(
                "Loaded definition '{}' ({}) from {}",
                definition.name(),
                definition.short_name(),
                path.display()
            );
            Ok(definition)
        })
        .collect()
}

/// Process a single input file
fn process_single_file(cli: &Cli, definitions: &[Definition], file: &Path) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    let mut registry = AnalysisRegistry::new();
    process_input(cli, definitions, file, &mut registry)?;

    if !cli.detect_only {
        registry.print_summary();
    }

    Ok(())
}

/// Process a directory of files recursively
fn process_directory(cli: &Cli, definitions: &[Definition], directory: &Path) -> Result<()> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());

    let mut registry = AnalysisRegistry::new();
    let mut files_processed = 0;

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        // Skip directories
        if !path.is_file() {
            continue;
        }

        // Skip hidden files
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
        {
            continue;
        }

        debug!("Processing file: {}", path.display());
        if let Err(e) = process_input(cli, definitions, path, &mut registry) {
            // Log error but continue with other files
            warn!("Error processing {}: {}", path.display(), e);
        }
        files_processed += 1;
    }

    info!("Processed {} files", files_processed);

    if !cli.detect_only {
        registry.print_summary();
    }

    Ok(())
}

/// First definition whose signature accepts `data`
fn detect_format<'d>(definitions: &'d [Definition], data: &[u8]) -> Option<&'d Definition> {
    definitions
        .iter()
        .find(|definition| hexform_core::detect(definition, data))
}

/// Analyze one file and report the result
fn process_input(
    cli: &Cli,
    definitions: &[Definition],
    path: &Path,
    registry: &mut AnalysisRegistry,
) -> Result<()> {
    trace!("Reading {}", path.display());
    let data =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;
    trace!("Read {} bytes from {}", data.len(), path.display());

    let content_hash = AnalysisRegistry::content_hash(&data);
    if let Some(original) = registry.register(&content_hash, path) {
        if cli.detect_only {
            println!("{}: duplicate of {}", path.display(), original.display());
        }
        return Ok(());
    }

    let Some(definition) = detect_format(definitions, &data) else {
        debug!("No definition recognizes {}", path.display());
        registry.stats.unrecognized += 1;
        if cli.detect_only {
            println!("{}: unknown", path.display());
        }
        return Ok(());
    };

    if cli.detect_only {
        println!("{}: {}", path.display(), definition.name());
        return Ok(());
    }

    let config = RunConfig::new()
        .with_step_limit(cli.step_limit)
        .with_fill_gaps(!cli.no_gaps);
    let analysis = Processor::with_config(definition, config).run(&data);
    if analysis.outcome.is_complete() {
        registry.stats.complete += 1;
    } else {
        registry.stats.partial += 1;
        debug!("{}: {}", path.display(), analysis.outcome);
    }

    let content = match cli.format {
        ReportFormat::Text => report::render_text(path, definition, &analysis),
        ReportFormat::Ranges => report::render_ranges(&analysis),
    };

    match &cli.output {
        None => print!("{}", content),
        Some(dir) => {
            let output_path = report_path(dir, path, definition);
            match write_report(&output_path, &content, cli.force) {
                Ok(()) => {
                    println!("Wrote {}", output_path.display());
                    registry.stats.written += 1;
                }
                Err(e) => {
                    error!("Failed to write {}: {}", output_path.display(), e);
                }
            }
        }
    }

    Ok(())
}

/// `<dir>/<file-stem>.<short-name>.txt`
fn report_path(dir: &Path, input: &Path, definition: &Definition) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("input");
    dir.join(format!(
        "{}.{}.txt",
        stem,
        definition.short_name().to_lowercase()
    ))
}

/// Write a report to disk
fn write_report(output_path: &Path, content: &str, force: bool) -> Result<()> {
    // Create parent directories
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    // Check if file exists
    if output_path.exists() && !force {
        bail!(
            "File already exists: {} (use --force to overwrite)",
            output_path.display()
        );
    }

    fs::File::create(output_path)
        .and_then(|mut file| file.write_all(content.as_bytes()))
        .map_err(|e| hexform_core::Error::file_write(output_path, e))?;

    Ok(())
}
