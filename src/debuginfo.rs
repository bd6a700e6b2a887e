//! Symbol-map export: one line per addressed definition, in a plain
//! `bank:address name` form emulator debuggers accept.

use std::io::{self, Write};

use crate::Compiler;

/// Write the symbol map for every function, label and variable that
/// received an address.
pub fn write_symbols(c: &Compiler, w: &mut impl Write) -> io::Result<()> {
  let mut lines: Vec<(u32, u32, String)> = vec![];
  for (_, def) in c.defs.enum_iter() {
    let Some(address) = def.address() else { continue };
    let Some(absolute) = address.absolute else { continue };
    let name = c.interner.get(def.name);
    if name.starts_with('$') { continue } // internal labels
    let bank = address.bank.map_or(0, |b| c.banks[b].decl_order);
    lines.push((bank, absolute, name.to_owned()));
  }
  lines.sort();
  for (bank, absolute, name) in lines {
    writeln!(w, "{bank:02X}:{absolute:04X} {name}")?;
  }
  Ok(())
}
