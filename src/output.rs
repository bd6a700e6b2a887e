//! Output container formats. Given the registered banks, write a complete
//! image: a bare concatenation, an iNES cartridge, or a GameBoy cartridge
//! with its header checksums patched in.

use std::io::{self, Write};

use byteorder::{BigEndian, ByteOrder};

use crate::types::entity::BankKind;
use crate::Compiler;

/// The supported container formats.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
  /// All stored banks in declaration order, each padded to capacity.
  Raw,
  /// An iNES image: 16-byte header, PRG banks, then CHR banks.
  Ines,
  /// A GameBoy cartridge image with header fields and checksums.
  Gb,
}

impl OutputFormat {
  /// Look up a format by selector name.
  #[must_use] pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "bin" | "raw" => Some(OutputFormat::Raw),
      "nes" | "ines" => Some(OutputFormat::Ines),
      "gb" | "gbc" => Some(OutputFormat::Gb),
      _ => None,
    }
  }

  /// Infer a format from an output file extension.
  #[must_use] pub fn from_extension(path: &str) -> Option<Self> {
    let (_, ext) = path.rsplit_once('.')?;
    Self::from_name(ext)
  }
}

fn config_int(c: &Compiler, key: &str) -> Option<i128> {
  let key = c.interner.lookup(key)?;
  c.config.get(&key)?.as_int()
}

fn config_bytes(c: &Compiler, key: &str) -> Option<Vec<u8>> {
  let key = c.interner.lookup(key)?;
  match &c.config.get(&key)?.kind {
    crate::types::ast::ExprKind::String(bytes) => Some(bytes.clone()),
    _ => None,
  }
}

/// A bank's bytes padded with `0xFF` to its declared capacity.
fn padded(bank: &crate::bank::Bank) -> Vec<u8> {
  let mut data = bank.data.clone();
  data.resize(bank.capacity as usize, 0xFF);
  data
}

/// Write the image for the chosen container.
pub fn write_image(c: &Compiler, format: OutputFormat, w: &mut impl Write) -> io::Result<()> {
  match format {
    OutputFormat::Raw => write_raw(c, w),
    OutputFormat::Ines => write_ines(c, w),
    OutputFormat::Gb => write_gb(c, w),
  }
}

fn write_raw(c: &Compiler, w: &mut impl Write) -> io::Result<()> {
  for (_, bank) in c.banks.enum_iter() {
    if bank.kind.stored() {
      w.write_all(&padded(bank))?;
    }
  }
  Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn write_ines(c: &Compiler, w: &mut impl Write) -> io::Result<()> {
  let mut prg = vec![];
  let mut chr = vec![];
  for (_, bank) in c.banks.enum_iter() {
    match bank.kind {
      BankKind::ProgramRom | BankKind::DataRom | BankKind::InitializedRam =>
        prg.extend_from_slice(&padded(bank)),
      BankKind::CharacterRom => chr.extend_from_slice(&padded(bank)),
      BankKind::UninitializedRam => {}
    }
  }

  let mapper = config_int(c, "mapper").unwrap_or(0) as u8;
  let mirror = config_int(c, "mirror").unwrap_or(0) as u8 & 1;
  let battery = u8::from(config_int(c, "battery").unwrap_or(0) != 0);
  let header: [u8; 16] = [
    b'N', b'E', b'S', 0x1A, // iNES magic
    prg.len().div_ceil(0x4000) as u8, // PRG ROM size in 16 KiB units
    chr.len().div_ceil(0x2000) as u8, // CHR ROM size in 8 KiB units
    (mapper & 0xF) << 4 | battery << 1 | mirror, // flags 6
    mapper & 0xF0, // flags 7: mapper high nibble
    0, // PRG RAM size
    0, // TV system
    0, 0, 0, 0, 0, 0, // unused padding
  ];
  w.write_all(&header)?;
  w.write_all(&prg)?;
  w.write_all(&chr)
}

/// The compressed Nintendo logo the boot ROM verifies at `0x104`.
const GB_LOGO: [u8; 48] = [
  0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83,
  0x00, 0x0C, 0x00, 0x0D, 0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E,
  0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD, 0xD9, 0x99, 0xBB, 0xBB, 0x67, 0x63,
  0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB, 0xB9, 0x33, 0x3E,
];

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn write_gb(c: &Compiler, w: &mut impl Write) -> io::Result<()> {
  // Banks land at their origin so code addresses match file offsets;
  // unaddressed banks follow the previous one.
  let mut image = vec![];
  let mut cursor = 0_usize;
  for (_, bank) in c.banks.enum_iter() {
    if !bank.kind.stored() { continue }
    let offset = bank.origin.map_or(cursor, |o| o as usize);
    let end = offset + bank.capacity as usize;
    if image.len() < end { image.resize(end, 0xFF) }
    image[offset..offset + bank.data.len()].copy_from_slice(&bank.data);
    cursor = end;
  }
  // The smallest valid cartridge is 32 KiB; larger images round up to the
  // next power of two.
  let size = image.len().max(0x8000).next_power_of_two();
  image.resize(size, 0xFF);

  image[0x104..0x134].copy_from_slice(&GB_LOGO);
  let mut title = config_bytes(c, "title").unwrap_or_default();
  title.resize(15, 0);
  image[0x134..0x143].copy_from_slice(&title);
  image[0x143] = config_int(c, "cgb_compatible").unwrap_or(0) as u8;
  image[0x146] = config_int(c, "sgb_compatible").unwrap_or(0) as u8;
  image[0x147] = config_int(c, "cart_type").unwrap_or(0) as u8;
  // ROM size code: 32 KiB << n.
  image[0x148] = (size / 0x8000).trailing_zeros() as u8;
  image[0x149] = config_int(c, "ram_size").unwrap_or(0) as u8;
  image[0x14A] = config_int(c, "international").unwrap_or(1) as u8;
  image[0x14B] = 0x33; // new-licensee escape
  image[0x14C] = config_int(c, "version").unwrap_or(0) as u8;

  // Header checksum over 0x134..=0x14C.
  let mut check: u8 = 0;
  for &b in &image[0x134..=0x14C] {
    check = check.wrapping_sub(b).wrapping_sub(1);
  }
  image[0x14D] = check;

  // Global checksum over everything except its own two bytes.
  image[0x14E] = 0;
  image[0x14F] = 0;
  let sum: u16 = image.iter().fold(0_u16, |acc, &b| acc.wrapping_add(b.into()));
  BigEndian::write_u16(&mut image[0x14E..0x150], sum);

  w.write_all(&image)
}

#[cfg(test)]
mod tests {
  use super::OutputFormat;

  #[test]
  fn format_selection() {
    assert_eq!(OutputFormat::from_name("nes"), Some(OutputFormat::Ines));
    assert_eq!(OutputFormat::from_name("gb"), Some(OutputFormat::Gb));
    assert_eq!(OutputFormat::from_name("raw"), Some(OutputFormat::Raw));
    assert_eq!(OutputFormat::from_name("elf"), None);
    assert_eq!(OutputFormat::from_extension("game.nes"), Some(OutputFormat::Ines));
    assert_eq!(OutputFormat::from_extension("game.gbc"), Some(OutputFormat::Gb));
    assert_eq!(OutputFormat::from_extension("game"), None);
  }
}
