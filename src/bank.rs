//! The bank and address model. A bank is a named memory region with a
//! kind, an optional fixed origin, a capacity and (for ROM kinds) a byte
//! buffer; it is the unit of layout and emission.

use crate::types::entity::{BankKind, DefId};
use crate::types::mk_id;

mk_id! {
  /// An index into the compiler's bank arena.
  BankId,
}

/// A resolved or partially-resolved address. Unresolved addresses are
/// allowed mid-pass and filled in by layout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
  /// The bank the item was placed into, if any.
  pub bank: Option<BankId>,
  /// The relative position within the bank.
  pub offset: Option<u32>,
  /// The absolute address, once known.
  pub absolute: Option<u32>,
}

impl Address {
  /// An address pinned to an absolute location without bank placement,
  /// for `var x @ 0x2002` style declarations.
  #[must_use] pub fn fixed(absolute: u32) -> Self {
    Self { bank: None, offset: None, absolute: Some(absolute) }
  }
}

/// A memory bank.
#[derive(Clone, Debug)]
pub struct Bank {
  /// The declared name.
  pub name: crate::symbol::Symbol,
  /// What the bank stores.
  pub kind: BankKind,
  /// The base address, if fixed by the declaration or an `in` destination.
  pub origin: Option<u32>,
  /// The capacity in bytes.
  pub capacity: u32,
  /// The emitted bytes; empty for RAM kinds.
  pub data: Vec<u8>,
  /// The current relative position. Monotone within a compilation.
  pub position: u32,
  /// Definitions placed into this bank, in declaration order.
  pub placed: Vec<DefId>,
  /// The declaration order of the bank itself, for container output.
  pub decl_order: u32,
}

impl Bank {
  /// Construct an empty bank.
  #[must_use] pub fn new(
    name: crate::symbol::Symbol, kind: BankKind,
    origin: Option<u32>, capacity: u32, decl_order: u32,
  ) -> Self {
    Self { name, kind, origin, capacity, data: vec![], position: 0, placed: vec![], decl_order }
  }

}
