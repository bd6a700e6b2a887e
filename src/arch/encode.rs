//! Encodings shared by the CPU backends. Each is a `(size, write)` pair of
//! plain functions; `size` is consulted during address assignment and
//! `write` at emission, and `write` always leaves exactly `size` bytes in
//! the buffer even when it reports a range error, so bank positions stay
//! consistent.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::inst::{CaptureLists, EncodeError, Emitter, Encoding, InstOptions};

fn capture(lists: &CaptureLists<'_>, root: usize) -> i128 {
  lists[root][0].integer()
}

/// Opcode bytes only.
#[must_use] pub fn implicit() -> Encoding {
  Encoding {
    size: |options, _| options.opcode.len(),
    write: |em, options, _| { em.extend(&options.opcode); Ok(()) },
  }
}

/// Opcode bytes followed by an unsigned 8-bit operand.
#[must_use] pub fn u8_operand() -> Encoding {
  Encoding {
    size: |options, _| options.opcode.len() + 1,
    write: |em, options, lists| {
      em.extend(&options.opcode);
      em.push_u8(capture(lists, options.parameter[0]) as u8);
      Ok(())
    },
  }
}

/// Opcode bytes followed by a little-endian 16-bit operand.
#[must_use] pub fn u16_operand() -> Encoding {
  Encoding {
    size: |options, _| options.opcode.len() + 2,
    write: |em, options, lists| {
      em.extend(&options.opcode);
      em.push_u16_le(capture(lists, options.parameter[0]) as u16);
      Ok(())
    },
  }
}

/// Opcode bytes followed by a PC-relative signed 8-bit displacement,
/// measured from the end of a two-byte instruction.
#[must_use] pub fn pc_relative_i8_operand() -> Encoding {
  Encoding {
    size: |options, _| options.opcode.len() + 1,
    write: |em, options, lists| {
      em.extend(&options.opcode);
      let base = i64::from(em.address & 0xFFFF);
      let dest = capture(lists, options.parameter[0]) as i64;
      let offset = dest - base - 2;
      if (-128..=127).contains(&offset) {
        em.push_u8(offset as u8);
        Ok(())
      } else {
        em.push_u8(0);
        Err(EncodeError::RelativeOutOfRange { offset })
      }
    },
  }
}

/// Opcode bytes followed by a signed 8-bit operand.
#[must_use] pub fn i8_operand() -> Encoding {
  Encoding {
    size: |options, _| options.opcode.len() + 1,
    write: |em, options, lists| {
      em.extend(&options.opcode);
      let value = capture(lists, options.parameter[0]) as i64;
      if (-128..=127).contains(&value) {
        em.push_u8(value as u8);
        Ok(())
      } else {
        em.push_u8(0);
        Err(EncodeError::SignedOutOfRange { value })
      }
    },
  }
}

/// The opcode bytes repeated by an integer capture; lowers a multi-bit
/// shift into a run of single shifts.
#[must_use] pub fn repeated_implicit() -> Encoding {
  Encoding {
    size: |options, lists| capture(lists, options.parameter[0]) as usize * options.opcode.len(),
    write: |em, options, lists| {
      let count = capture(lists, options.parameter[0]) as u8;
      for _ in 0..count { em.extend(&options.opcode) }
      Ok(())
    },
  }
}

/// Opcode plus 8-bit operand, repeated by an integer capture.
#[must_use] pub fn repeated_u8_operand() -> Encoding {
  Encoding {
    size: |options, lists|
      capture(lists, options.parameter[1]) as usize * (options.opcode.len() + 1),
    write: |em, options, lists| {
      let value = capture(lists, options.parameter[0]) as u8;
      let count = capture(lists, options.parameter[1]) as u8;
      for _ in 0..count {
        em.extend(&options.opcode);
        em.push_u8(value);
      }
      Ok(())
    },
  }
}

/// Opcode plus little-endian 16-bit operand, repeated by an integer capture.
#[must_use] pub fn repeated_u16_operand() -> Encoding {
  Encoding {
    size: |options, lists|
      capture(lists, options.parameter[1]) as usize * (options.opcode.len() + 2),
    write: |em, options, lists| {
      let value = capture(lists, options.parameter[0]) as u16;
      let count = capture(lists, options.parameter[1]) as u8;
      for _ in 0..count {
        em.extend(&options.opcode);
        em.push_u16_le(value);
      }
      Ok(())
    },
  }
}

/// Opcode bytes with a bit number ORed into the last byte as `n << 3`
/// (the Z80/GameBoy CB-prefix convention).
/// `parameter[0]` is the operand root holding the bit number and
/// `parameter[1]` the capture slot within it.
#[must_use] pub fn bit_index_shl3() -> Encoding {
  Encoding {
    size: |options, _| options.opcode.len(),
    write: |em, options, lists| {
      em.extend(&options.opcode);
      let n = lists[options.parameter[0]][options.parameter[1]].integer() as u8;
      let last = em.buf.len() - 1;
      em.buf[last] |= n << 3;
      Ok(())
    },
  }
}
