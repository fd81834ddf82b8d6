//! # hexform-core
//!
//! A declarative engine for describing and dissecting binary file formats.
//!
//! This crate provides the core functionality for:
//! - Compiling XML format definitions (fields, conditionals, loops, subroutines,
//!   arithmetic and magic signatures) into an executable step program
//! - Detecting whether a buffer belongs to a format
//! - Interpreting the program against a buffer to produce labelled byte ranges
//!   and a hierarchical field description
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`compiler`]: Definition document parsing and validation
//! - [`definition`]: The compiled, immutable format model
//! - [`interpreter`]: The Processor executing run programs
//! - [`magic`]: Signature matching
//! - [`store`]: Run-local typed variables
//! - [`output`]: Output sink contract and gap filling
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use hexform_core::{compile_file, Processor};
//! use std::fs;
//!
//! // Compile a format definition once
//! let definition = compile_file("formats/bmp.xml")?;
//!
//! // Analyze any number of buffers with it
//! let data = fs::read("./image.bmp")?;
//! let processor = Processor::new(&definition);
//! if processor.detect(&data) {
//!     let analysis = processor.run(&data);
//!     for range in &analysis.ranges {
//!         println!("{:#010x} +{:<6} {}", range.start, range.length, range.label);
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! Run output can be streamed to any [`OutputSink`] through
//! [`Processor::run_with_sink`] instead of being collected.
//!

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod compiler;
pub mod definition;
pub mod error;
pub mod interpreter;
pub mod magic;
pub mod output;
pub mod store;

// Re-export primary types for convenience
pub use compiler::{compile, compile_file};
pub use definition::Definition;
pub use error::{CompileError, CompileErrorKind, Error, Position, Result};
pub use interpreter::{run, Analysis, Outcome, Processor, RunConfig, Summary};
pub use magic::{detect, SignatureMatcher};
pub use output::{
    fill_gaps, Collector, Description, Entry, Line, NullSink, OutputSink, Section, StatsSink, Tab,
    TaggedRange,
};
pub use store::{Value, Variable, VariableStore, Width};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
