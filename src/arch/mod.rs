//! The platform backend interface. A backend seeds its registers,
//! intrinsics, operand patterns, encodings and instruction tables into the
//! builtins registry, and supplies the test-and-branch oracle the compiler
//! core uses to lower relational branch conditions.

pub(crate) mod encode;
pub mod gb;
pub mod mos6502;

use smallvec::SmallVec;

use crate::build_code::create_operand;
use crate::builtins::{Builtins, SeedCtx};
use crate::inst::InstType;
use crate::types::IdxVec;
use crate::types::ast::{BinaryOp, Expr};
use crate::types::entity::{DefId, Definition};

/// One conditional branch step produced by the oracle: branch when `flag`
/// equals `value`; `success` tells whether taking that branch means the
/// overall condition holds (branch to the destination) or fails (branch to
/// the internal fall-through label).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlagBranch {
  /// The flag register tested.
  pub flag: DefId,
  /// The flag value that takes the branch.
  pub value: bool,
  /// Whether taking the branch satisfies the condition.
  pub success: bool,
}

impl FlagBranch {
  /// Construct a branch step.
  #[must_use] pub fn new(flag: DefId, value: bool, success: bool) -> Self {
    Self { flag, value, success }
  }
}

/// The oracle's answer for one relational branch condition: instructions
/// to issue before branching, then flag branches to combine. Returned by
/// value; the operand expressions are borrowed from the condition (or from
/// the backend's own cached expressions).
#[derive(Debug)]
pub struct TestAndBranch<'e> {
  /// The test instruction to select and emit, e.g. `cmp` or `bit`.
  pub test: InstType,
  /// The operands of the test instruction.
  pub operands: SmallVec<[&'e Expr; 2]>,
  /// The flag branches, combined as a short-circuit OR.
  pub branches: SmallVec<[FlagBranch; 2]>,
}

impl<'e> TestAndBranch<'e> {
  /// Construct an oracle answer.
  #[must_use] pub fn new(
    test: InstType,
    operands: impl IntoIterator<Item = &'e Expr>,
    branches: impl IntoIterator<Item = FlagBranch>,
  ) -> Self {
    Self {
      test,
      operands: operands.into_iter().collect(),
      branches: branches.into_iter().collect(),
    }
  }
}

/// The read-only compiler services an oracle may consult.
pub struct TestCtx<'a> {
  /// The definition arena.
  pub defs: &'a IdxVec<DefId, Definition>,
  /// The builtins registry.
  pub builtins: &'a Builtins,
  /// The currently active CPU mode flags.
  pub mode_flags: u32,
  /// The placeholder value standing in for unknown addresses, already
  /// truncated to the pointer width.
  pub placeholder: i128,
}

impl TestCtx<'_> {
  /// Whether an instruction of the given verb exists for these operands.
  #[must_use] pub fn can_select(&self, ty: InstType, exprs: &[&Expr]) -> bool {
    let mut roots = Vec::with_capacity(exprs.len());
    for e in exprs {
      match create_operand(self.defs, e, self.placeholder) {
        Some(op) => roots.push(op),
        None => return false,
      }
    }
    self.builtins.registry.select(ty, self.mode_flags, &roots).is_some()
  }
}

/// A compiled-in CPU backend.
pub trait Platform {
  /// The platform selector name, e.g. `"6502"`.
  fn name(&self) -> &'static str;

  /// Seed registers, flags, intrinsics, patterns, encodings and
  /// instructions into the builtins registry.
  fn reserve_definitions(&mut self, ctx: &mut SeedCtx<'_>);

  /// The integer type the size of a near pointer.
  fn pointer_sized_type(&self) -> DefId;

  /// The integer type the size of a far pointer.
  fn far_pointer_sized_type(&self) -> DefId;

  /// The zero flag register.
  fn zero_flag(&self) -> DefId;

  /// The stand-in value for integers not yet known during size-only
  /// passes. Must encode the same way the final value will wherever short
  /// and long forms differ.
  fn placeholder_value(&self) -> i128;

  /// Lower `left op right` (appearing as a branch condition over operands
  /// of type `ty`) into test instructions plus flag branches, or refuse.
  fn test_and_branch<'e>(
    &'e self, ctx: &TestCtx<'_>, ty: &Definition, op: BinaryOp,
    left: &'e Expr, right: &'e Expr, distance: u32,
  ) -> Option<TestAndBranch<'e>>;
}
