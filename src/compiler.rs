//! Compiler collaborator and the adapter that times it.
//!
//! The real markup compiler lives outside this crate; anything that turns
//! raw bytes into canonical XML can implement [`Compiler`]. The shipped
//! [`PassthroughCompiler`] only checks well-formedness, which is enough
//! when the raw build is already canonical.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::FileDescriptor;

/// Output of a successful compile.
#[derive(Debug, Clone)]
pub struct CompiledDocument {
    pub xml: Vec<u8>,
    /// Build tag the compiled form should be saved under.
    pub build_tag: String,
}

pub trait Compiler: Send + Sync {
    fn compile(&self, raw: &[u8], file: &FileDescriptor) -> Result<CompiledDocument>;
}

impl<T: Compiler + ?Sized> Compiler for Box<T> {
    fn compile(&self, raw: &[u8], file: &FileDescriptor) -> Result<CompiledDocument> {
        (**self).compile(raw, file)
    }
}

pub struct PassthroughCompiler {
    output_build: String,
}

impl PassthroughCompiler {
    pub fn new(output_build: impl Into<String>) -> Self {
        Self {
            output_build: output_build.into(),
        }
    }
}

impl Compiler for PassthroughCompiler {
    fn compile(&self, raw: &[u8], file: &FileDescriptor) -> Result<CompiledDocument> {
        check_well_formed(raw).map_err(|reason| Error::content(&file.logical_id, reason))?;
        Ok(CompiledDocument {
            xml: raw.to_vec(),
            build_tag: self.output_build.clone(),
        })
    }
}

fn check_well_formed(raw: &[u8]) -> std::result::Result<(), String> {
    let mut reader = Reader::from_reader(raw);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut roots = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(_)) => {
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Ok(Event::Empty(_)) if depth == 0 => roots += 1,
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
        buf.clear();
    }
    match (roots, depth) {
        (0, _) => Err("document has no root element".into()),
        (_, d) if d > 0 => Err("document ends with unclosed elements".into()),
        (1, 0) => Ok(()),
        _ => Err("document has more than one root element".into()),
    }
}

/// Wraps a [`Compiler`] and keeps pass/fail counts and cumulative time.
pub struct CompilerAdapter<C: Compiler> {
    compiler: C,
    passed: u64,
    failed: u64,
    total: Duration,
}

impl<C: Compiler> CompilerAdapter<C> {
    pub fn new(compiler: C) -> Self {
        Self {
            compiler,
            passed: 0,
            failed: 0,
            total: Duration::ZERO,
        }
    }

    /// Run the compiler once. Per-document time goes to the log; the
    /// counters and cumulative time feed the run summary.
    pub fn compile(&mut self, raw: &[u8], file: &FileDescriptor) -> Result<CompiledDocument> {
        let started = Instant::now();
        let result = self.compiler.compile(raw, file);
        let elapsed = started.elapsed();
        self.total += elapsed;

        match &result {
            Ok(_) => {
                self.passed += 1;
                debug!(id = %file.logical_id, ?elapsed, "compiled");
            }
            Err(e) => {
                self.failed += 1;
                warn!(id = %file.logical_id, ?elapsed, error = %e, "compile failed");
            }
        }
        result
    }

    pub fn passed(&self) -> u64 {
        self.passed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn total_time(&self) -> Duration {
        self.total
    }
}
