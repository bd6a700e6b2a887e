//! The MOS 6502 family backend: the base 6502 plus the 65C02 extension
//! revisions. Registers the accumulator/index register file, the
//! documented addressing-mode patterns, and the instruction tables as
//! cross-products of operator rows and operand columns.
//!
//! Opcode reference: <http://www.obelisk.me.uk/6502/index.html> and
//! <http://6502.org/tutorials/65c02opcodes.html>.

use std::rc::Rc;

use if_chain::if_chain;
use arrayvec::ArrayVec;

use crate::arch::encode;
use crate::arch::{FlagBranch, Platform, TestAndBranch, TestCtx};
use crate::builtins::SeedCtx;
use crate::inst::{
  CaptureLists, EncodeError, Emitter, Encoding, InstOptions, InstType, OperandPattern, Signature,
};
use crate::types::ast::{BinaryOp, BranchKind, Expr, ExprKind, UnaryOp};
use crate::types::entity::{DefId, DefKind, Definition};

/// Which 6502 family member to target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Revision {
  /// The original NMOS 6502.
  Base6502,
  /// The baseline CMOS 65C02.
  Base65C02,
  /// The Rockwell 65C02, with bit manipulation instructions.
  Rockwell65C02,
  /// The WDC 65C02, with bit manipulation and power-saving instructions.
  Wdc65C02,
}

impl Revision {
  fn has_65c02_extensions(self) -> bool { self != Revision::Base6502 }

  fn has_bit_instructions(self) -> bool {
    matches!(self, Revision::Rockwell65C02 | Revision::Wdc65C02)
  }
}

/// The 6502 backend state: the definitions the oracle needs to recognise.
#[derive(Debug)]
pub struct Mos6502Platform {
  revision: Revision,
  pointer_sized: Option<DefId>,
  far_pointer_sized: Option<DefId>,
  a: Option<DefId>,
  x: Option<DefId>,
  y: Option<DefId>,
  carry: Option<DefId>,
  zero: Option<DefId>,
  overflow: Option<DefId>,
  negative: Option<DefId>,
  cmp: Option<DefId>,
  bit: Option<DefId>,
}

impl Mos6502Platform {
  /// Construct a backend for the chosen revision.
  #[must_use] pub fn new(revision: Revision) -> Self {
    Mos6502Platform {
      revision,
      pointer_sized: None, far_pointer_sized: None,
      a: None, x: None, y: None,
      carry: None, zero: None, overflow: None, negative: None,
      cmp: None, bit: None,
    }
  }

  fn a(&self) -> DefId { self.a.expect("platform not seeded") }
  fn x(&self) -> DefId { self.x.expect("platform not seeded") }
  fn y(&self) -> DefId { self.y.expect("platform not seeded") }

  fn is_accumulator_like(&self, def: DefId) -> bool {
    def == self.a() || def == self.x() || def == self.y()
  }
}

/// `*(zp) $ n` access: opcode with `n << 4` folded into its last byte,
/// followed by the zero page address.
fn bit_index_u8_operand() -> Encoding {
  #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
  fn write(em: &mut Emitter<'_>, options: &InstOptions, lists: &CaptureLists<'_>)
    -> Result<(), EncodeError>
  {
    // zp = 0th capture of root parameter[0], n = parameter[2]th capture of
    // root parameter[1].
    let zp = lists[options.parameter[0]][0].integer() as u8;
    let n = lists[options.parameter[1]][options.parameter[2]].integer() as u8;
    em.extend(&options.opcode);
    let last = em.buf.len() - 1;
    em.buf[last] |= n << 4;
    em.push_u8(zp);
    Ok(())
  }
  Encoding { size: |options, _| options.opcode.len() + 1, write }
}

/// `goto dest if *(zp) $ n`: opcode with `n << 4` folded in, the zero page
/// address, then a PC-relative displacement from the end of the three-byte
/// instruction.
fn bit_index_branch() -> Encoding {
  #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
  fn write(em: &mut Emitter<'_>, options: &InstOptions, lists: &CaptureLists<'_>)
    -> Result<(), EncodeError>
  {
    // zp = 0th capture of root parameter[0], n = parameter[2]th capture of
    // root parameter[1], dest = 0th capture of root parameter[3].
    let zp = lists[options.parameter[0]][0].integer() as u8;
    let n = lists[options.parameter[1]][options.parameter[2]].integer() as u8;
    em.extend(&options.opcode);
    let last = em.buf.len() - 1;
    em.buf[last] |= n << 4;
    em.push_u8(zp);
    let base = i64::from(em.address & 0xFFFF);
    let dest = lists[options.parameter[3]][0].integer() as i64;
    let offset = dest - base - 3;
    if (-128..=127).contains(&offset) {
      em.push_u8(offset as u8);
      Ok(())
    } else {
      em.push_u8(0);
      Err(EncodeError::RelativeOutOfRange { offset })
    }
  }
  Encoding { size: |options, _| options.opcode.len() + 2, write }
}

impl Platform for Mos6502Platform {
  fn name(&self) -> &'static str {
    match self.revision {
      Revision::Base6502 => "6502",
      Revision::Base65C02 => "65c02",
      Revision::Rockwell65C02 => "rockwell65c02",
      Revision::Wdc65C02 => "wdc65c02",
    }
  }

  #[allow(clippy::too_many_lines)]
  fn reserve_definitions(&mut self, ctx: &mut SeedCtx<'_>) {
    ctx.add_define_boolean("__family_6502", true);
    match self.revision {
      Revision::Base6502 => ctx.add_define_boolean("__cpu_6502", true),
      Revision::Base65C02 => {
        ctx.add_define_boolean("__family_65c02", true);
        ctx.add_define_boolean("__cpu_65c02", true);
      }
      Revision::Rockwell65C02 => {
        ctx.add_define_boolean("__family_65c02", true);
        ctx.add_define_boolean("__cpu_rockwell65c02", true);
      }
      Revision::Wdc65C02 => {
        ctx.add_define_boolean("__family_65c02", true);
        ctx.add_define_boolean("__cpu_wdc65c02", true);
      }
    }

    let u8_type = ctx.builtins.u8_type;
    self.pointer_sized = Some(ctx.builtins.u16_type);
    self.far_pointer_sized = Some(ctx.builtins.u24_type);

    // Registers.
    let a = ctx.register("a", u8_type);
    let x = ctx.register("x", u8_type);
    let y = ctx.register("y", u8_type);
    let s = ctx.register("s", u8_type);
    let p = ctx.register("p", u8_type);
    let carry = ctx.flag("carry");
    let zero = ctx.flag("zero");
    let nointerrupt = ctx.flag("nointerrupt");
    let decimal = ctx.flag("decimal");
    let overflow = ctx.flag("overflow");
    let negative = ctx.flag("negative");
    self.a = Some(a);
    self.x = Some(x);
    self.y = Some(y);
    self.carry = Some(carry);
    self.zero = Some(zero);
    self.overflow = Some(overflow);
    self.negative = Some(negative);

    // Intrinsics.
    let cmp = ctx.void_intrinsic("cmp");
    let bit = ctx.void_intrinsic("bit");
    let push = ctx.void_intrinsic("push");
    let pop = ctx.load_intrinsic("pop", u8_type);
    let irqcall = ctx.void_intrinsic("irqcall");
    let nop = ctx.void_intrinsic("nop");
    self.cmp = Some(cmp);
    self.bit = Some(bit);

    // Operand patterns.
    let pattern_a = Rc::new(OperandPattern::Register(a));
    let pattern_x = Rc::new(OperandPattern::Register(x));
    let pattern_y = Rc::new(OperandPattern::Register(y));
    let pattern_s = Rc::new(OperandPattern::Register(s));
    let pattern_p = Rc::new(OperandPattern::Register(p));
    let pattern_carry = Rc::new(OperandPattern::Register(carry));
    let pattern_zero = Rc::new(OperandPattern::Register(zero));
    let pattern_nointerrupt = Rc::new(OperandPattern::Register(nointerrupt));
    let pattern_decimal = Rc::new(OperandPattern::Register(decimal));
    let pattern_overflow = Rc::new(OperandPattern::Register(overflow));
    let pattern_negative = Rc::new(OperandPattern::Register(negative));
    let pattern_false = Rc::new(OperandPattern::Boolean(false));
    let pattern_true = Rc::new(OperandPattern::Boolean(true));
    let at_least_0 = Rc::new(OperandPattern::IntegerAtLeast(0));
    let at_least_1 = Rc::new(OperandPattern::IntegerAtLeast(1));
    let pattern_0 = OperandPattern::exactly(0);
    let imm_u8 = Rc::new(OperandPattern::IntegerRange(0, 0xFF));
    let imm_u16 = Rc::new(OperandPattern::IntegerRange(0, 0xFFFF));
    let zero_page = Rc::new(OperandPattern::Dereference {
      far: false, size: 1, operand: OperandPattern::capture(imm_u8.clone()),
    });
    let zero_page_x = Rc::new(OperandPattern::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: OperandPattern::capture(imm_u8.clone()), subscript: pattern_x.clone(),
    });
    let zero_page_y = Rc::new(OperandPattern::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: OperandPattern::capture(imm_u8.clone()), subscript: pattern_y.clone(),
    });
    let zero_page_x_indirect = Rc::new(OperandPattern::Dereference {
      far: false, size: 1,
      operand: Rc::new(OperandPattern::Index {
        far: false, size: 2, subscript_scale: 1,
        operand: OperandPattern::capture(imm_u8.clone()), subscript: pattern_x.clone(),
      }),
    });
    let zero_page_indirect_y = Rc::new(OperandPattern::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: Rc::new(OperandPattern::Dereference {
        far: false, size: 2, operand: OperandPattern::capture(imm_u8.clone()),
      }),
      subscript: pattern_y.clone(),
    });
    let zero_page_indirect = Rc::new(OperandPattern::Dereference {
      far: false, size: 1,
      operand: Rc::new(OperandPattern::Dereference {
        far: false, size: 2, operand: OperandPattern::capture(imm_u8.clone()),
      }),
    });
    let absolute = Rc::new(OperandPattern::Dereference {
      far: false, size: 1, operand: OperandPattern::capture(imm_u16.clone()),
    });
    let absolute_x = Rc::new(OperandPattern::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: OperandPattern::capture(imm_u16.clone()), subscript: pattern_x.clone(),
    });
    let absolute_y = Rc::new(OperandPattern::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: OperandPattern::capture(imm_u16.clone()), subscript: pattern_y.clone(),
    });
    let indirect_jump = Rc::new(OperandPattern::Dereference {
      far: false, size: 2, operand: OperandPattern::capture(imm_u16.clone()),
    });

    // Encodings.
    let enc_implicit = ctx.encoding(encode::implicit());
    let enc_u8 = ctx.encoding(encode::u8_operand());
    let enc_u16 = ctx.encoding(encode::u16_operand());
    let enc_pcrel = ctx.encoding(encode::pc_relative_i8_operand());
    let enc_rep_implicit = ctx.encoding(encode::repeated_implicit());
    let enc_rep_u8 = ctx.encoding(encode::repeated_u8_operand());
    let enc_rep_u16 = ctx.encoding(encode::repeated_u16_operand());
    let enc_bit_u8 = ctx.encoding(bit_index_u8_operand());

    // Accumulator arithmetic: operator rows crossed with addressing
    // columns; the column opcode bits OR into the row's final byte.
    let arithmetic_ops: &[(InstType, &[u8])] = &[
      (InstType::Binary(BinaryOp::BitwiseOr), &[0x00]),
      (InstType::Binary(BinaryOp::BitwiseAnd), &[0x20]),
      (InstType::Binary(BinaryOp::BitwiseXor), &[0x40]),
      (InstType::Binary(BinaryOp::AdditionWithCarry), &[0x60]),
      (InstType::Binary(BinaryOp::Addition), &[0x18, 0x60]),
      (InstType::Binary(BinaryOp::Assignment), &[0xA0]),
      (InstType::VoidIntrinsic(cmp), &[0xC0]),
      (InstType::Binary(BinaryOp::SubtractionWithCarry), &[0xE0]),
      (InstType::Binary(BinaryOp::Subtraction), &[0x38, 0xE0]),
    ];
    let arithmetic_columns = [
      (imm_u8.clone(), enc_u8, 0x09_u8),
      (zero_page.clone(), enc_u8, 0x05),
      (zero_page_x.clone(), enc_u8, 0x15),
      (zero_page_x_indirect.clone(), enc_u8, 0x01),
      (zero_page_indirect_y.clone(), enc_u8, 0x11),
      (absolute.clone(), enc_u16, 0x0D),
      (absolute_x.clone(), enc_u16, 0x1D),
      (absolute_y.clone(), enc_u16, 0x19),
    ];
    for &(ty, opcode) in arithmetic_ops {
      for (pattern, enc, low) in &arithmetic_columns {
        let mut opcode: ArrayVec<u8, 8> = opcode.iter().copied().collect();
        *opcode.last_mut().expect("opcode is nonempty") |= low;
        ctx.instruction(
          Signature::new(ty, 0, [pattern_a.clone(), pattern.clone()]),
          *enc, InstOptions { opcode, parameter: [1].into_iter().collect() }, &[]);
      }
    }
    // sta
    for (pattern, enc, low) in &arithmetic_columns {
      if Rc::ptr_eq(pattern, &imm_u8) { continue }
      ctx.instruction(
        Signature::new(InstType::Binary(BinaryOp::Assignment), 0,
          [pattern.clone(), pattern_a.clone()]),
        *enc, InstOptions::new([0x80 | low], [0]), &[]);
    }
    // bit: overflow = mem $ 6, negative = mem $ 7, zero = a & mem
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(bit), 0, [zero_page.clone()]),
      enc_u8, InstOptions::new([0x24], [0]), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(bit), 0, [absolute.clone()]),
      enc_u16, InstOptions::new([0x2C], [0]), &[]);
    // ldx
    let assign = InstType::Binary(BinaryOp::Assignment);
    ctx.instruction(Signature::new(assign, 0, [pattern_x.clone(), imm_u8.clone()]),
      enc_u8, InstOptions::new([0xA2], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_x.clone(), zero_page.clone()]),
      enc_u8, InstOptions::new([0xA6], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_x.clone(), zero_page_y.clone()]),
      enc_u8, InstOptions::new([0xB6], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_x.clone(), absolute.clone()]),
      enc_u16, InstOptions::new([0xAE], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_x.clone(), absolute_y.clone()]),
      enc_u16, InstOptions::new([0xBE], [1]), &[]);
    // ldy
    ctx.instruction(Signature::new(assign, 0, [pattern_y.clone(), imm_u8.clone()]),
      enc_u8, InstOptions::new([0xA0], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_y.clone(), zero_page.clone()]),
      enc_u8, InstOptions::new([0xA4], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_y.clone(), zero_page_x.clone()]),
      enc_u8, InstOptions::new([0xB4], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_y.clone(), absolute.clone()]),
      enc_u16, InstOptions::new([0xAC], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_y.clone(), absolute_x.clone()]),
      enc_u16, InstOptions::new([0xBC], [1]), &[]);
    // stx
    ctx.instruction(Signature::new(assign, 0, [zero_page.clone(), pattern_x.clone()]),
      enc_u8, InstOptions::new([0x86], [0]), &[]);
    ctx.instruction(Signature::new(assign, 0, [zero_page_y.clone(), pattern_x.clone()]),
      enc_u8, InstOptions::new([0x96], [0]), &[]);
    ctx.instruction(Signature::new(assign, 0, [absolute.clone(), pattern_x.clone()]),
      enc_u16, InstOptions::new([0x8E], [0]), &[]);
    // sty
    ctx.instruction(Signature::new(assign, 0, [zero_page.clone(), pattern_y.clone()]),
      enc_u8, InstOptions::new([0x84], [0]), &[]);
    ctx.instruction(Signature::new(assign, 0, [zero_page_x.clone(), pattern_y.clone()]),
      enc_u8, InstOptions::new([0x94], [0]), &[]);
    ctx.instruction(Signature::new(assign, 0, [absolute.clone(), pattern_y.clone()]),
      enc_u16, InstOptions::new([0x8C], [0]), &[]);
    // cpx
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(cmp), 0,
      [pattern_x.clone(), imm_u8.clone()]), enc_u8, InstOptions::new([0xE0], [1]), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(cmp), 0,
      [pattern_x.clone(), zero_page.clone()]), enc_u8, InstOptions::new([0xE4], [1]), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(cmp), 0,
      [pattern_x.clone(), absolute.clone()]), enc_u16, InstOptions::new([0xEC], [1]), &[]);
    // cpy
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(cmp), 0,
      [pattern_y.clone(), imm_u8.clone()]), enc_u8, InstOptions::new([0xC0], [1]), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(cmp), 0,
      [pattern_y.clone(), zero_page.clone()]), enc_u8, InstOptions::new([0xC4], [1]), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(cmp), 0,
      [pattern_y.clone(), absolute.clone()]), enc_u16, InstOptions::new([0xCC], [1]), &[]);
    // transfers
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), pattern_x.clone()]),
      enc_implicit, InstOptions::new([0x8A], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), pattern_y.clone()]),
      enc_implicit, InstOptions::new([0x98], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_x.clone(), pattern_a.clone()]),
      enc_implicit, InstOptions::new([0xAA], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_y.clone(), pattern_a.clone()]),
      enc_implicit, InstOptions::new([0xA8], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_x.clone(), pattern_s.clone()]),
      enc_implicit, InstOptions::new([0xBA], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_s.clone(), pattern_x.clone()]),
      enc_implicit, InstOptions::new([0x9A], []), &[]);
    // push/pop
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(push), 0, [pattern_a.clone()]),
      enc_implicit, InstOptions::new([0x48], []), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(push), 0, [pattern_p.clone()]),
      enc_implicit, InstOptions::new([0x08], []), &[]);
    ctx.instruction(Signature::new(InstType::LoadIntrinsic(pop), 0, [pattern_a.clone()]),
      enc_implicit, InstOptions::new([0x68], []), &[]);
    ctx.instruction(Signature::new(InstType::LoadIntrinsic(pop), 0, [pattern_p.clone()]),
      enc_implicit, InstOptions::new([0x28], []), &[]);
    // increment / decrement
    let inc = InstType::Unary(UnaryOp::PreIncrement);
    let dec = InstType::Unary(UnaryOp::PreDecrement);
    ctx.instruction(Signature::new(inc, 0, [zero_page.clone()]),
      enc_u8, InstOptions::new([0xE6], [0]), &[zero]);
    ctx.instruction(Signature::new(inc, 0, [zero_page_x.clone()]),
      enc_u8, InstOptions::new([0xF6], [0]), &[zero]);
    ctx.instruction(Signature::new(inc, 0, [absolute.clone()]),
      enc_u16, InstOptions::new([0xEE], [0]), &[zero]);
    ctx.instruction(Signature::new(inc, 0, [absolute_x.clone()]),
      enc_u16, InstOptions::new([0xFE], [0]), &[zero]);
    ctx.instruction(Signature::new(inc, 0, [pattern_x.clone()]),
      enc_implicit, InstOptions::new([0xE8], []), &[zero]);
    ctx.instruction(Signature::new(inc, 0, [pattern_y.clone()]),
      enc_implicit, InstOptions::new([0xC8], []), &[zero]);
    ctx.instruction(Signature::new(dec, 0, [zero_page.clone()]),
      enc_u8, InstOptions::new([0xC6], [0]), &[zero]);
    ctx.instruction(Signature::new(dec, 0, [zero_page_x.clone()]),
      enc_u8, InstOptions::new([0xD6], [0]), &[zero]);
    ctx.instruction(Signature::new(dec, 0, [absolute.clone()]),
      enc_u16, InstOptions::new([0xCE], [0]), &[zero]);
    ctx.instruction(Signature::new(dec, 0, [absolute_x.clone()]),
      enc_u16, InstOptions::new([0xDE], [0]), &[zero]);
    ctx.instruction(Signature::new(dec, 0, [pattern_x.clone()]),
      enc_implicit, InstOptions::new([0xCA], []), &[zero]);
    ctx.instruction(Signature::new(dec, 0, [pattern_y.clone()]),
      enc_implicit, InstOptions::new([0x88], []), &[zero]);
    // negation: eor #$FF, and eor #$FF; clc; adc #1
    ctx.instruction(Signature::new(InstType::Unary(UnaryOp::BitwiseNegation), 0,
      [pattern_a.clone()]), enc_implicit, InstOptions::new([0x49, 0xFF], []), &[]);
    ctx.instruction(Signature::new(InstType::Unary(UnaryOp::SignedNegation), 0,
      [pattern_a.clone()]), enc_implicit,
      InstOptions::new([0x49, 0xFF, 0x18, 0x69, 0x01], []), &[]);
    // shifts and rotates, lowered as repeated single-bit forms
    let shift_ops: &[(InstType, u8)] = &[
      (InstType::Binary(BinaryOp::LeftShift), 0x00),
      (InstType::Binary(BinaryOp::LogicalLeftShift), 0x00),
      (InstType::Binary(BinaryOp::LeftRotateWithCarry), 0x20),
      (InstType::Binary(BinaryOp::LogicalRightShift), 0x40),
      (InstType::Binary(BinaryOp::RightRotateWithCarry), 0x60),
    ];
    for &(ty, high) in shift_ops {
      ctx.instruction(Signature::new(ty, 0, [pattern_a.clone(), imm_u8.clone()]),
        enc_rep_implicit, InstOptions::new([high | 0x0A], [1]), &[]);
      ctx.instruction(Signature::new(ty, 0, [zero_page.clone(), imm_u8.clone()]),
        enc_rep_u8, InstOptions::new([high | 0x06], [0, 1]), &[]);
      ctx.instruction(Signature::new(ty, 0, [zero_page_x.clone(), imm_u8.clone()]),
        enc_rep_u8, InstOptions::new([high | 0x16], [0, 1]), &[]);
      ctx.instruction(Signature::new(ty, 0, [absolute.clone(), imm_u8.clone()]),
        enc_rep_u16, InstOptions::new([high | 0x0E], [0, 1]), &[]);
      ctx.instruction(Signature::new(ty, 0, [absolute_x.clone(), imm_u8.clone()]),
        enc_rep_u16, InstOptions::new([high | 0x1E], [0, 1]), &[]);
    }
    // jumps and conditional branches
    let goto = InstType::Branch(BranchKind::Goto);
    let jmp_distance =
      if self.revision == Revision::Base6502 { at_least_0.clone() } else { at_least_1.clone() };
    ctx.instruction(Signature::new(goto, 0, [jmp_distance, imm_u16.clone()]),
      enc_u16, InstOptions::new([0x4C], [1]), &[]);
    ctx.instruction(Signature::new(goto, 0, [at_least_0.clone(), indirect_jump.clone()]),
      enc_u16, InstOptions::new([0x6C], [1]), &[]);
    let flag_branches: &[(&Rc<OperandPattern>, u8)] = &[
      (&pattern_carry, 0x90), (&pattern_zero, 0xD0),
      (&pattern_negative, 0x10), (&pattern_overflow, 0x50),
    ];
    for &(flag, clear_opcode) in flag_branches {
      ctx.instruction(Signature::new(goto, 0,
        [at_least_0.clone(), imm_u16.clone(), (*flag).clone(), pattern_false.clone()]),
        enc_pcrel, InstOptions::new([clear_opcode], [1]), &[]);
      ctx.instruction(Signature::new(goto, 0,
        [at_least_0.clone(), imm_u16.clone(), (*flag).clone(), pattern_true.clone()]),
        enc_pcrel, InstOptions::new([clear_opcode | 0x20], [1]), &[]);
      // Long forms: the inverted short branch skips a jmp.
      ctx.instruction(Signature::new(goto, 0,
        [at_least_1.clone(), imm_u16.clone(), (*flag).clone(), pattern_false.clone()]),
        enc_u16, InstOptions::new([clear_opcode | 0x20, 3, 0x4C], [1]), &[]);
      ctx.instruction(Signature::new(goto, 0,
        [at_least_1.clone(), imm_u16.clone(), (*flag).clone(), pattern_true.clone()]),
        enc_u16, InstOptions::new([clear_opcode, 3, 0x4C], [1]), &[]);
    }
    // jsr / rts / rti
    ctx.instruction(Signature::new(InstType::Branch(BranchKind::Call), 0,
      [at_least_0.clone(), imm_u16.clone()]), enc_u16, InstOptions::new([0x20], [1]), &[]);
    ctx.instruction(Signature::new(InstType::Branch(BranchKind::Return), 0,
      [at_least_0.clone()]), enc_implicit, InstOptions::new([0x60], []), &[]);
    ctx.instruction(Signature::new(InstType::Branch(BranchKind::IrqReturn), 0,
      [at_least_0.clone()]), enc_implicit, InstOptions::new([0x40], []), &[]);
    ctx.instruction(Signature::new(InstType::Branch(BranchKind::NmiReturn), 0,
      [at_least_0.clone()]), enc_implicit, InstOptions::new([0x40], []), &[]);
    // brk
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(irqcall), 0, []),
      enc_implicit, InstOptions::new([0x00], []), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(irqcall), 0, [imm_u8.clone()]),
      enc_u8, InstOptions::new([0x00], [0]), &[]);
    // nop
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(nop), 0, []),
      enc_implicit, InstOptions::new([0xEA], []), &[]);
    // flag stores: clc/sec, cld/sed, cli/sei, clv
    ctx.instruction(Signature::new(assign, 0, [pattern_carry.clone(), pattern_false.clone()]),
      enc_implicit, InstOptions::new([0x18], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_carry.clone(), pattern_true.clone()]),
      enc_implicit, InstOptions::new([0x38], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_decimal.clone(), pattern_false.clone()]),
      enc_implicit, InstOptions::new([0xD8], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_decimal.clone(), pattern_true.clone()]),
      enc_implicit, InstOptions::new([0xF8], []), &[]);
    ctx.instruction(Signature::new(assign, 0,
      [pattern_nointerrupt.clone(), pattern_false.clone()]),
      enc_implicit, InstOptions::new([0x58], []), &[]);
    ctx.instruction(Signature::new(assign, 0,
      [pattern_nointerrupt.clone(), pattern_true.clone()]),
      enc_implicit, InstOptions::new([0x78], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_overflow.clone(), pattern_false.clone()]),
      enc_implicit, InstOptions::new([0xB8], []), &[]);

    if self.revision.has_65c02_extensions() {
      let test_and_reset = ctx.void_intrinsic("test_and_reset");
      let test_and_set = ctx.void_intrinsic("test_and_set");
      let indirect_jump_x = Rc::new(OperandPattern::Index {
        far: false, size: 2, subscript_scale: 1,
        operand: OperandPattern::capture(imm_u16.clone()), subscript: pattern_x.clone(),
      });

      // (zp) addressing for the whole arithmetic block.
      for &(ty, opcode) in arithmetic_ops {
        let mut opcode: ArrayVec<u8, 8> = opcode.iter().copied().collect();
        *opcode.last_mut().expect("opcode is nonempty") |= 0x12;
        ctx.instruction(
          Signature::new(ty, 0, [pattern_a.clone(), zero_page_indirect.clone()]),
          enc_u8, InstOptions { opcode, parameter: [1].into_iter().collect() }, &[]);
      }
      ctx.instruction(Signature::new(assign, 0,
        [zero_page_indirect.clone(), pattern_a.clone()]),
        enc_u8, InstOptions::new([0x92], [0]), &[]);
      // bit extensions
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(bit), 0, [imm_u8.clone()]),
        enc_u8, InstOptions::new([0x89], [0]), &[]);
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(bit), 0, [zero_page_x.clone()]),
        enc_u8, InstOptions::new([0x34], [0]), &[]);
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(bit), 0, [absolute_x.clone()]),
        enc_u16, InstOptions::new([0x3C], [0]), &[]);
      // inc a / dec a
      ctx.instruction(Signature::new(inc, 0, [pattern_a.clone()]),
        enc_implicit, InstOptions::new([0x1A], []), &[zero]);
      ctx.instruction(Signature::new(dec, 0, [pattern_a.clone()]),
        enc_implicit, InstOptions::new([0x3A], []), &[zero]);
      // bra
      ctx.instruction(Signature::new(goto, 0, [at_least_0.clone(), imm_u16.clone()]),
        enc_pcrel, InstOptions::new([0x80], [1]), &[]);
      // jmp (abs,x)
      ctx.instruction(Signature::new(goto, 0, [at_least_0.clone(), indirect_jump_x]),
        enc_u16, InstOptions::new([0x6C], [1]), &[]);
      // phx/phy/plx/ply
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(push), 0, [pattern_x.clone()]),
        enc_implicit, InstOptions::new([0xDA], []), &[]);
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(push), 0, [pattern_y.clone()]),
        enc_implicit, InstOptions::new([0x5A], []), &[]);
      ctx.instruction(Signature::new(InstType::LoadIntrinsic(pop), 0, [pattern_x.clone()]),
        enc_implicit, InstOptions::new([0xFA], []), &[]);
      ctx.instruction(Signature::new(InstType::LoadIntrinsic(pop), 0, [pattern_y.clone()]),
        enc_implicit, InstOptions::new([0x7A], []), &[]);
      // stz
      ctx.instruction(Signature::new(assign, 0, [zero_page.clone(), pattern_0.clone()]),
        enc_u8, InstOptions::new([0x64], [0]), &[]);
      ctx.instruction(Signature::new(assign, 0, [zero_page_x.clone(), pattern_0.clone()]),
        enc_u8, InstOptions::new([0x74], [0]), &[]);
      ctx.instruction(Signature::new(assign, 0, [absolute.clone(), pattern_0.clone()]),
        enc_u16, InstOptions::new([0x9C], [0]), &[]);
      ctx.instruction(Signature::new(assign, 0, [absolute_x.clone(), pattern_0.clone()]),
        enc_u16, InstOptions::new([0x9E], [0]), &[]);
      // trb / tsb
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(test_and_reset), 0,
        [zero_page.clone(), pattern_a.clone()]), enc_u8, InstOptions::new([0x14], [0]), &[]);
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(test_and_reset), 0,
        [absolute.clone(), pattern_a.clone()]), enc_u16, InstOptions::new([0x1C], [0]), &[]);
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(test_and_set), 0,
        [zero_page.clone(), pattern_a.clone()]), enc_u8, InstOptions::new([0x04], [0]), &[]);
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(test_and_set), 0,
        [absolute.clone(), pattern_a.clone()]), enc_u16, InstOptions::new([0x0C], [0]), &[]);
    }

    if self.revision.has_bit_instructions() {
      let bit_subscript = Rc::new(OperandPattern::IntegerRange(0, 7));
      let zero_page_bit = Rc::new(OperandPattern::BitIndex {
        operand: Rc::new(OperandPattern::Dereference {
          far: false, size: 1, operand: OperandPattern::capture(imm_u8.clone()),
        }),
        subscript: OperandPattern::capture(bit_subscript),
      });
      let enc_bit_branch = ctx.encoding(bit_index_branch());

      // bbr / bbs: goto dest if *(zp) $ n
      ctx.instruction(Signature::new(goto, 0,
        [at_least_0.clone(), imm_u16.clone(), zero_page_bit.clone(), pattern_false.clone()]),
        enc_bit_branch, InstOptions::new([0x0F], [2, 2, 1, 1]), &[]);
      ctx.instruction(Signature::new(goto, 0,
        [at_least_0.clone(), imm_u16.clone(), zero_page_bit.clone(), pattern_true.clone()]),
        enc_bit_branch, InstOptions::new([0x8F], [2, 2, 1, 1]), &[]);
      // rmb / smb: *(zp) $ n = false / true
      ctx.instruction(Signature::new(assign, 0, [zero_page_bit.clone(), pattern_false.clone()]),
        enc_bit_u8, InstOptions::new([0x07], [0, 0, 1]), &[]);
      ctx.instruction(Signature::new(assign, 0, [zero_page_bit, pattern_true.clone()]),
        enc_bit_u8, InstOptions::new([0x87], [0, 0, 1]), &[]);
    }

    if self.revision == Revision::Wdc65C02 {
      let stop_until_reset = ctx.void_intrinsic("stop_until_reset");
      let wait_until_interrupt = ctx.void_intrinsic("wait_until_interrupt");
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(stop_until_reset), 0, []),
        enc_implicit, InstOptions::new([0xDB], []), &[]);
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(wait_until_interrupt), 0, []),
        enc_implicit, InstOptions::new([0xCB], []), &[]);
    }
  }

  fn pointer_sized_type(&self) -> DefId { self.pointer_sized.expect("platform not seeded") }

  fn far_pointer_sized_type(&self) -> DefId {
    self.far_pointer_sized.expect("platform not seeded")
  }

  fn zero_flag(&self) -> DefId { self.zero.expect("platform not seeded") }

  fn placeholder_value(&self) -> i128 { 0xCCCC_CCCC_CCCC_CCCC_u64.into() }

  fn test_and_branch<'e>(
    &'e self, ctx: &TestCtx<'_>, ty: &Definition, op: BinaryOp,
    left: &'e Expr, right: &'e Expr, _distance: u32,
  ) -> Option<TestAndBranch<'e>> {
    let cmp = InstType::VoidIntrinsic(self.cmp.expect("platform not seeded"));
    let bit = InstType::VoidIntrinsic(self.bit.expect("platform not seeded"));
    let zero = self.zero.expect("platform not seeded");
    let carry = self.carry.expect("platform not seeded");
    let overflow = self.overflow.expect("platform not seeded");
    let negative = self.negative.expect("platform not seeded");
    let signed = matches!(ty.kind, DefKind::BuiltinIntegerType { min, .. } if min < 0);

    match op {
      BinaryOp::Equal | BinaryOp::NotEqual => {
        // a & mem == 0 / mem & a == 0 -> { bit(mem); } && zero
        if_chain! {
          if let ExprKind::Binary(BinaryOp::BitwiseAnd, inner_left, inner_right) = &left.kind;
          if right.as_int() == Some(0);
          then {
            let a = self.a();
            if inner_left.as_resolved() == Some(a) {
              return Some(TestAndBranch::new(bit, [&**inner_right],
                [FlagBranch::new(zero, op == BinaryOp::Equal, true)]))
            }
            if inner_right.as_resolved() == Some(a) {
              return Some(TestAndBranch::new(bit, [&**inner_left],
                [FlagBranch::new(zero, op == BinaryOp::Equal, true)]))
            }
          }
        }
        // left == right -> { cmp(left, right); } && zero
        if left.as_resolved().is_some_and(|d| self.is_accumulator_like(d)) {
          return Some(TestAndBranch::new(cmp, [left, right],
            [FlagBranch::new(zero, op == BinaryOp::Equal, true)]))
        }
        None
      }
      BinaryOp::LessThan | BinaryOp::GreaterThanOrEqual => {
        if signed {
          if right.as_int() == Some(0) {
            // left < 0 -> sign bit set; left >= 0 -> sign bit clear.
            if left.as_resolved().is_some_and(|d| self.is_accumulator_like(d)) {
              return Some(TestAndBranch::new(cmp, [left, right],
                [FlagBranch::new(negative, op == BinaryOp::LessThan, true)]))
            }
            if ctx.can_select(bit, &[left]) {
              return Some(TestAndBranch::new(bit, [left],
                [FlagBranch::new(negative, op == BinaryOp::LessThan, true)]))
            }
          }
          None
        } else if left.as_resolved().is_some_and(|d| self.is_accumulator_like(d)) {
          // left < right -> !carry; left >= right -> carry.
          Some(TestAndBranch::new(cmp, [left, right],
            [FlagBranch::new(carry, op == BinaryOp::GreaterThanOrEqual, true)]))
        } else {
          None
        }
      }
      BinaryOp::LessThanOrEqual => {
        if !left.as_resolved().is_some_and(|d| self.is_accumulator_like(d)) { return None }
        if signed {
          // left <= 0 -> zero || negative
          if right.as_int() == Some(0) {
            return Some(TestAndBranch::new(cmp, [left, right], [
              FlagBranch::new(zero, true, true),
              FlagBranch::new(negative, true, true),
            ]))
          }
          None
        } else {
          // left <= right -> zero || !carry
          Some(TestAndBranch::new(cmp, [left, right], [
            FlagBranch::new(zero, true, true),
            FlagBranch::new(carry, false, true),
          ]))
        }
      }
      BinaryOp::GreaterThan => {
        if !left.as_resolved().is_some_and(|d| self.is_accumulator_like(d)) { return None }
        if signed {
          // left > 0 -> !zero && !negative
          if right.as_int() == Some(0) {
            return Some(TestAndBranch::new(cmp, [left, right], [
              FlagBranch::new(zero, true, false),
              FlagBranch::new(negative, false, true),
            ]))
          }
          None
        } else {
          // left > right -> !zero && carry
          Some(TestAndBranch::new(cmp, [left, right], [
            FlagBranch::new(zero, true, false),
            FlagBranch::new(carry, true, true),
          ]))
        }
      }
      BinaryOp::BitIndexing => {
        // left $ 6 -> { bit(left); } && overflow
        // left $ 7 -> { bit(left); } && negative
        match right.as_int() {
          Some(6) => Some(TestAndBranch::new(bit, [left],
            [FlagBranch::new(overflow, true, true)])),
          Some(7) => Some(TestAndBranch::new(bit, [left],
            [FlagBranch::new(negative, true, true)])),
          _ => None,
        }
      }
      _ => None,
    }
  }
}
