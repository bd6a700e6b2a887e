//! A compiler for a retro systems programming language targeting 8-bit
//! CPUs (the MOS 6502 family and the GameBoy's LR35902), emitting complete
//! ROM images with no linker stage.
//!
//! The pipeline is single-threaded and cooperative: import flattening, a
//! declaration pass building scopes and definitions, a reduction pass that
//! resolves, folds and annotates, bank address assignment iterated to a
//! fixed point, and finally bank-by-bank byte emission. Instruction
//! selection goes through a generic pattern engine ([`inst`]): each backend
//! registers abstract instruction shapes keyed by semantic operation, and
//! the most specific registered shape matching the concrete operands wins.

#![warn(missing_docs)]

pub mod arch;
pub mod bank;
mod build_code;
mod build_expr;
mod build_scope;
pub mod builtins;
pub mod diag;
pub mod eval;
mod debuginfo;
pub mod inst;
mod layout;
pub mod output;
pub mod symbol;
pub mod types;

use std::io;

use bit_set::BitSet;
use hashbrown::HashMap;

use crate::arch::Platform;
use crate::bank::{Bank, BankId};
use crate::builtins::{Builtins, SeedCtx};
use crate::diag::Report;
use crate::symbol::{Interner, Symbol};
use crate::types::ast::{Expr, Stmt};
use crate::types::entity::{DefId, Definition, Scope, ScopeId};
use crate::types::{IdxVec, NodeId};

pub use crate::output::OutputFormat;

/// Supplies parsed files for `import` statements. Parsing itself is an
/// external collaborator; the compiler only consumes statement trees.
pub trait ImportResolver {
  /// Resolve an import path to a parsed `File` statement, or `None` if the
  /// file cannot be found.
  fn resolve(&mut self, path: Symbol, interner: &mut Interner) -> Option<Stmt>;
}

/// An [`ImportResolver`] for programs without imports.
#[derive(Default, Debug)]
pub struct NoImports;

impl ImportResolver for NoImports {
  fn resolve(&mut self, _: Symbol, _: &mut Interner) -> Option<Stmt> { None }
}

/// Supplies raw file contents for `embed` expressions.
pub trait BinaryReader {
  /// Read the bytes of a binary file.
  fn read_binary(&mut self, path: &str) -> io::Result<Vec<u8>>;
}

/// A [`BinaryReader`] for programs without `embed` expressions.
#[derive(Default, Debug)]
pub struct NoBinaryFiles;

impl BinaryReader for NoBinaryFiles {
  fn read_binary(&mut self, path: &str) -> io::Result<Vec<u8>> {
    Err(io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}")))
  }
}

/// The compiler: owns the interner, the definition and scope arenas, the
/// banks, the builtins registry and the diagnostic sink for one run. All
/// state is per-run and threaded explicitly; there are no globals.
pub struct Compiler {
  /// The string interner.
  pub interner: Interner,
  /// The diagnostic sink.
  pub report: Report,
  /// The definition arena.
  pub defs: IdxVec<DefId, Definition>,
  /// The scope arena.
  pub scopes: IdxVec<ScopeId, Scope>,
  /// The bank arena, in declaration order.
  pub banks: IdxVec<BankId, Bank>,
  /// The builtins registry.
  pub builtins: Builtins,
  /// The active platform backend.
  pub platform: Box<dyn Platform>,
  /// `config { .. }` directives accumulated across the program.
  pub config: HashMap<Symbol, Expr>,
  /// The currently active CPU mode flags.
  pub mode_flags: u32,
  /// The scope introduced by each scope-bearing statement.
  pub(crate) scope_of: HashMap<NodeId, ScopeId>,
  /// The definition created by each declaring statement, per name.
  pub(crate) def_of: HashMap<(NodeId, Symbol), DefId>,
  /// The root file scope.
  pub(crate) root_scope: Option<ScopeId>,
  /// Branch sites that layout widened to their long form; monotone.
  pub(crate) widened: BitSet,
  /// Dense indices for branch sites, allocated on first use.
  pub(crate) widen_index: HashMap<(NodeId, u32), usize>,
  /// Internal labels synthesised during lowering, stable across layout
  /// rounds.
  pub(crate) internal_labels: HashMap<(NodeId, u32), DefId>,
}

impl Compiler {
  /// Construct a compiler for the given platform backend. The backend
  /// seeds its registers, intrinsics and instruction tables immediately.
  #[must_use] pub fn new(mut platform: Box<dyn Platform>) -> Self {
    let mut interner = Interner::new();
    let mut defs = IdxVec::new();
    let mut scopes = IdxVec::new();
    let mut builtins = Builtins::new(&mut interner, &mut defs, &mut scopes, HashMap::new());
    platform.reserve_definitions(&mut SeedCtx {
      interner: &mut interner,
      defs: &mut defs,
      scopes: &mut scopes,
      builtins: &mut builtins,
    });
    log::debug!("seeded platform `{}`", platform.name());
    Compiler {
      interner,
      report: Report::new(),
      defs,
      scopes,
      banks: IdxVec::new(),
      builtins,
      platform,
      config: HashMap::new(),
      mode_flags: 0,
      scope_of: HashMap::new(),
      def_of: HashMap::new(),
      root_scope: None,
      widened: BitSet::new(),
      widen_index: HashMap::new(),
      internal_labels: HashMap::new(),
    }
  }

  /// Bind an integer define, visible to `__has`/`__get`.
  pub fn add_define_integer(&mut self, key: &str, value: i128) {
    let key = self.interner.intern(key);
    self.builtins.add_define_integer(key, value);
  }

  /// Bind a boolean define.
  pub fn add_define_boolean(&mut self, key: &str, value: bool) {
    let key = self.interner.intern(key);
    self.builtins.add_define_boolean(key, value);
  }

  /// Compile a program. Returns `true` on success; diagnostics accumulate
  /// in [`Compiler::report`] either way. Each pass runs to completion so
  /// one invocation reports many problems, but later passes are skipped
  /// once an earlier one has failed.
  pub fn compile(
    &mut self, mut program: Stmt,
    imports: &mut dyn ImportResolver,
    files: &mut dyn BinaryReader,
  ) -> bool {
    macro_rules! pass {
      ($name:literal, $body:expr) => {{
        let checkpoint = self.report.checkpoint();
        log::debug!(concat!("pass: ", $name));
        $body;
        if self.report.failed_since(checkpoint) {
          log::debug!(concat!("pass failed: ", $name));
          return false
        }
      }}
    }

    pass!("import resolution", build_scope::flatten_imports(self, &mut program, imports));
    pass!("declarations", build_scope::run(self, &program));
    pass!("reduction", build_expr::run(self, &program, files));
    pass!("layout", layout::run(self));
    pass!("emission", build_code::emit_banks(self));
    true
  }

  /// Write the output image in the chosen container format.
  pub fn write_output(&self, format: OutputFormat, w: &mut impl io::Write) -> io::Result<()> {
    output::write_image(self, format, w)
  }

  /// Write a symbol map for the compiled program.
  pub fn write_symbols(&self, w: &mut impl io::Write) -> io::Result<()> {
    debuginfo::write_symbols(self, w)
  }

  /// Render accumulated diagnostics, one line each.
  pub fn render_diagnostics(&self, w: &mut impl io::Write) -> io::Result<()> {
    self.report.render(&self.interner, w)
  }
}
