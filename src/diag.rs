//! Diagnostic accumulation. Passes report errors into a [`Report`] sink
//! and keep going, so one invocation surfaces many problems; a `Fatal`
//! diagnostic stops the pipeline at the next pass boundary.

use std::io::{self, Write};

use crate::symbol::Interner;
use crate::types::SourceLoc;

/// How bad a diagnostic is.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
  /// Informational follow-up to another diagnostic.
  Note,
  /// A recoverable error; the current pass continues, but compilation fails.
  Error,
  /// An unrecoverable error; the pipeline stops after the current pass.
  Fatal,
}

/// A single diagnostic message.
#[derive(Clone, Debug)]
pub struct Diagnostic {
  /// The severity of the message.
  pub severity: Severity,
  /// The rendered message text.
  pub message: String,
  /// Where the problem is, if it has a location.
  pub loc: Option<SourceLoc>,
  /// Whether this diagnostic continues the immediately preceding one.
  pub continued: bool,
}

/// The accumulating diagnostic sink.
#[derive(Default, Debug)]
pub struct Report {
  diags: Vec<Diagnostic>,
  errors: usize,
  fatal: bool,
}

impl Report {
  /// Construct an empty report.
  #[must_use] pub fn new() -> Self { Self::default() }

  /// Record a recoverable error.
  pub fn error(&mut self, message: impl Into<String>, loc: SourceLoc) {
    self.push(Severity::Error, message.into(), Some(loc), false);
  }

  /// Record a recoverable error that continues the previous diagnostic.
  pub fn error_continued(&mut self, message: impl Into<String>, loc: SourceLoc) {
    self.push(Severity::Error, message.into(), Some(loc), true);
  }

  /// Record a fatal error. The pipeline stops at the next pass boundary.
  pub fn fatal(&mut self, message: impl Into<String>, loc: Option<SourceLoc>) {
    self.push(Severity::Fatal, message.into(), loc, false);
  }

  /// Record an informational note.
  pub fn note(&mut self, message: impl Into<String>, loc: SourceLoc) {
    self.push(Severity::Note, message.into(), Some(loc), true);
  }

  fn push(&mut self, severity: Severity, message: String, loc: Option<SourceLoc>, continued: bool) {
    log::debug!("{severity:?}: {message}");
    if severity >= Severity::Error { self.errors += 1 }
    if severity == Severity::Fatal { self.fatal = true }
    self.diags.push(Diagnostic { severity, message, loc, continued });
  }

  /// A checkpoint for [`Report::failed_since`], taken at the start of a pass.
  #[must_use] pub fn checkpoint(&self) -> usize { self.errors }

  /// Whether any error was raised since the given checkpoint.
  #[must_use] pub fn failed_since(&self, checkpoint: usize) -> bool {
    self.fatal || self.errors > checkpoint
  }

  /// The total number of errors raised so far.
  #[must_use] pub fn error_count(&self) -> usize { self.errors }

  /// Whether a fatal error was raised.
  #[must_use] pub fn is_fatal(&self) -> bool { self.fatal }

  /// The accumulated diagnostics, in order of arrival.
  #[must_use] pub fn diagnostics(&self) -> &[Diagnostic] { &self.diags }

  /// Render the diagnostics, one line each, as
  /// `severity: path:line: message`.
  pub fn render(&self, interner: &Interner, w: &mut impl Write) -> io::Result<()> {
    for d in &self.diags {
      let severity = match d.severity {
        Severity::Note => "note",
        Severity::Error => "error",
        Severity::Fatal => "fatal",
      };
      match d.loc {
        Some(loc) =>
          writeln!(w, "{severity}: {}:{}: {}", interner.get(loc.path), loc.line, d.message)?,
        None => writeln!(w, "{severity}: {}", d.message)?,
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::symbol::Interner;
  use crate::types::SourceLoc;

  #[test]
  fn checkpoints_track_pass_failure() {
    let mut i = Interner::new();
    let loc = SourceLoc::new(i.intern("main.wz"), 3);
    let mut r = Report::new();
    let cp = r.checkpoint();
    assert!(!r.failed_since(cp));
    r.error("undefined identifier `foo`", loc);
    assert!(r.failed_since(cp));
    let cp2 = r.checkpoint();
    assert!(!r.failed_since(cp2));
    r.fatal("cannot open file", None);
    assert!(r.failed_since(cp2));
    assert_eq!(r.error_count(), 2);
  }

  #[test]
  fn renders_one_line_per_diagnostic() {
    let mut i = Interner::new();
    let loc = SourceLoc::new(i.intern("a.wz"), 7);
    let mut r = Report::new();
    r.error("bank overflow", loc);
    r.note("bank `prg` declared here", loc);
    let mut out = vec![];
    r.render(&i, &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "error: a.wz:7: bank overflow\nnote: a.wz:7: bank `prg` declared here\n");
  }
}
