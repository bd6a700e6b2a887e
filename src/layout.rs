//! Address assignment. Walks each bank's placed definitions in declaration
//! order, sizing function bodies with the code generator in size-only
//! mode, and iterates until no address moves and no branch site widens.
//! Widening is monotone (a site never narrows once widened), which bounds
//! the iteration by the number of conditional-branch sites.

use crate::bank::BankId;
use crate::build_code::{GenMode, generate_function};
use crate::types::entity::{DefKind, DefId};
use crate::Compiler;

/// Run address assignment to a fixed point.
pub(crate) fn run(c: &mut Compiler) {
  let mut previous: Vec<(DefId, Option<u32>)> = vec![];
  // Each round either stabilises, moves an address, or widens a branch
  // site; widening happens at most once per site, so a generous cap over
  // the site count catches only genuine non-convergence.
  for round in 0.. {
    assign_addresses(c);
    let widened_any = check_branches(c);
    let current = snapshot(c);
    let stable = !widened_any && current == previous;
    log::debug!("layout round {round}: stable={stable} widened={widened_any}");
    if stable { break }
    previous = current;
    if round > c.widen_index.len() + 8 {
      c.report.fatal("address assignment did not converge", None);
      return
    }
  }
  check_banks(c);
}

fn snapshot(c: &Compiler) -> Vec<(DefId, Option<u32>)> {
  c.defs.enum_iter()
    .filter_map(|(id, def)| def.address().map(|a| (id, a.absolute)))
    .collect()
}

fn assign_addresses(c: &mut Compiler) {
  for bank_index in 0..c.banks.len() {
    let bank_id = BankId(bank_index as u32);
    c.banks[bank_id].position = 0;
    let origin = c.banks[bank_id].origin.unwrap_or(0);
    let placed = c.banks[bank_id].placed.clone();
    for def in placed {
      let position = c.banks[bank_id].position;
      match &mut c.defs[def].kind {
        DefKind::Var { address, size, align, .. } => {
          let mut offset = position;
          if let Some(align) = *align {
            if align > 1 { offset = offset.div_ceil(align) * align }
          }
          address.offset = Some(offset);
          address.absolute = Some(origin + offset);
          let size = size.unwrap_or(0);
          c.banks[bank_id].position = offset + size;
        }
        DefKind::Label { address } => {
          address.offset = Some(position);
          address.absolute = Some(origin + position);
        }
        DefKind::Func { address, .. } => {
          address.offset = Some(position);
          address.absolute = Some(origin + position);
        }
        _ => {}
      }
      if matches!(c.defs[def].kind, DefKind::Func { .. }) {
        let size = generate_function(c, def, GenMode::Size).size;
        if let DefKind::Func { size: slot, .. } = &mut c.defs[def].kind {
          *slot = Some(size);
        }
        c.banks[bank_id].position = position + size;
      }
    }
  }
}

/// Run the generator in check mode over every placed function so that
/// PC-relative encode failures can widen their branch sites.
fn check_branches(c: &mut Compiler) -> bool {
  let mut widened_any = false;
  for bank_index in 0..c.banks.len() {
    let bank_id = BankId(bank_index as u32);
    let placed = c.banks[bank_id].placed.clone();
    for def in placed {
      if matches!(c.defs[def].kind, DefKind::Func { .. }) {
        widened_any |= generate_function(c, def, GenMode::Check).widened_any;
      }
    }
  }
  widened_any
}

fn check_banks(c: &mut Compiler) {
  // Capacity.
  for bank_index in 0..c.banks.len() {
    let bank = &c.banks[BankId(bank_index as u32)];
    if bank.position > bank.capacity {
      let name = c.interner.get(bank.name).to_owned();
      c.report.fatal(format!(
        "bank `{name}` overflows its capacity: {:#x} > {:#x}",
        bank.position, bank.capacity), None);
    }
  }
  // Overlapping fixed address ranges.
  let mut ranges: Vec<(u32, u32, crate::symbol::Symbol)> = c.banks.enum_iter()
    .filter_map(|(_, bank)| {
      let origin = bank.origin?;
      (bank.position > 0).then_some((origin, origin + bank.position, bank.name))
    })
    .collect();
  ranges.sort_unstable();
  for pair in ranges.windows(2) {
    let (a, b) = (pair[0], pair[1]);
    if b.0 < a.1 {
      let (first, second) = (c.interner.get(a.2).to_owned(), c.interner.get(b.2).to_owned());
      c.report.fatal(format!(
        "banks `{first}` and `{second}` overlap at address {:#x}", b.0), None);
    }
  }
}
