//! The GameBoy (LR35902) backend. The register file is the Z80-style
//! a/b/c/d/e/h/l set with the bc/de/hl/sp pairs; most of the instruction
//! table is generated from the 8-entry register column grid, with the
//! CB-prefixed shift/rotate/bit families on top.
//!
//! Opcode reference: <http://problemkaputt.de/pandocs.htm#cpuinstructionset>.

use std::rc::Rc;

use arrayvec::ArrayVec;

use crate::arch::encode;
use crate::arch::{FlagBranch, Platform, TestAndBranch, TestCtx};
use crate::builtins::SeedCtx;
use crate::inst::{InstOptions, InstType, OperandPattern, Signature};
use crate::types::ast::{
  BinaryOp, BranchKind, EvalCtx, Expr, ExprInfo, ExprKind, Qualifiers, TypeExpr, TypeExprKind,
  UnaryOp,
};
use crate::types::entity::{DefId, DefKind, Definition};

/// The GameBoy backend state.
#[derive(Debug)]
pub struct GbPlatform {
  pointer_sized: Option<DefId>,
  far_pointer_sized: Option<DefId>,
  a: Option<DefId>,
  carry: Option<DefId>,
  zero: Option<DefId>,
  cmp: Option<DefId>,
  bit: Option<DefId>,
  /// The literal `7` used when lowering sign tests to `bit(x, 7)`.
  bit_index_7: Option<Expr>,
}

impl GbPlatform {
  /// Construct the backend.
  #[must_use] pub fn new() -> Self {
    GbPlatform {
      pointer_sized: None, far_pointer_sized: None,
      a: None, carry: None, zero: None, cmp: None, bit: None,
      bit_index_7: None,
    }
  }
}

impl Default for GbPlatform {
  fn default() -> Self { Self::new() }
}

impl Platform for GbPlatform {
  fn name(&self) -> &'static str { "gb" }

  #[allow(clippy::too_many_lines)]
  fn reserve_definitions(&mut self, ctx: &mut SeedCtx<'_>) {
    ctx.add_define_boolean("__cpu_gb", true);

    let u8_type = ctx.builtins.u8_type;
    let u16_type = ctx.builtins.u16_type;
    self.pointer_sized = Some(u16_type);
    self.far_pointer_sized = Some(ctx.builtins.u24_type);

    let internal_loc = ctx.builtins.internal_loc;
    self.bit_index_7 = Some(Expr::analyzed(ExprKind::Int(7), internal_loc, ExprInfo {
      ctx: EvalCtx::CompileTime,
      ty: TypeExpr::new(TypeExprKind::Resolved(u8_type), internal_loc),
      quals: Qualifiers::empty(),
    }));

    // Registers.
    let a = ctx.register("a", u8_type);
    let b = ctx.register("b", u8_type);
    let c = ctx.register("c", u8_type);
    let d = ctx.register("d", u8_type);
    let e = ctx.register("e", u8_type);
    let h = ctx.register("h", u8_type);
    let l = ctx.register("l", u8_type);
    let af = ctx.register("af", u16_type);
    let bc = ctx.register("bc", u16_type);
    let de = ctx.register("de", u16_type);
    let hl = ctx.register("hl", u16_type);
    let sp = ctx.register("sp", u16_type);
    let carry = ctx.flag("carry");
    let zero = ctx.flag("zero");
    let interrupt = ctx.flag("interrupt");
    self.a = Some(a);
    self.carry = Some(carry);
    self.zero = Some(zero);

    ctx.builtins.add_register_decomposition(bc, vec![c, b]);
    ctx.builtins.add_register_decomposition(de, vec![e, d]);
    ctx.builtins.add_register_decomposition(hl, vec![l, h]);

    // Intrinsics.
    let push = ctx.void_intrinsic("push");
    let pop = ctx.load_intrinsic("pop", u16_type);
    let nop = ctx.void_intrinsic("nop");
    let halt = ctx.void_intrinsic("halt");
    let stop = ctx.void_intrinsic("stop");
    let decimal_adjust = ctx.void_intrinsic("decimal_adjust");
    let exchange_16_bit_registers = ctx.void_intrinsic("exchange_16_bit_registers");
    let swap_digits = ctx.void_intrinsic("swap_digits");
    let debug_break = ctx.void_intrinsic("debug_break");
    let bit = ctx.void_intrinsic("bit");
    let cmp = ctx.void_intrinsic("cmp");
    self.bit = Some(bit);
    self.cmp = Some(cmp);

    // Operand patterns.
    let pattern_a = Rc::new(OperandPattern::Register(a));
    let pattern_c = Rc::new(OperandPattern::Register(c));
    let pattern_af = Rc::new(OperandPattern::Register(af));
    let pattern_bc = Rc::new(OperandPattern::Register(bc));
    let pattern_de = Rc::new(OperandPattern::Register(de));
    let pattern_hl = Rc::new(OperandPattern::Register(hl));
    let pattern_sp = Rc::new(OperandPattern::Register(sp));
    let pattern_zero = Rc::new(OperandPattern::Register(zero));
    let pattern_carry = Rc::new(OperandPattern::Register(carry));
    let pattern_interrupt = Rc::new(OperandPattern::Register(interrupt));
    let pattern_false = Rc::new(OperandPattern::Boolean(false));
    let pattern_true = Rc::new(OperandPattern::Boolean(true));
    let at_least_0 = Rc::new(OperandPattern::IntegerAtLeast(0));
    let at_least_1 = Rc::new(OperandPattern::IntegerAtLeast(1));
    let indirect_bc = Rc::new(OperandPattern::Dereference {
      far: false, size: 1, operand: pattern_bc.clone(),
    });
    let indirect_de = Rc::new(OperandPattern::Dereference {
      far: false, size: 1, operand: pattern_de.clone(),
    });
    let indirect_hl = Rc::new(OperandPattern::Dereference {
      far: false, size: 1, operand: pattern_hl.clone(),
    });
    let imm_bit_subscript = Rc::new(OperandPattern::IntegerRange(0, 7));
    let imm_u8 = Rc::new(OperandPattern::IntegerRange(0, 0xFF));
    let imm_u16 = Rc::new(OperandPattern::IntegerRange(0, 0xFFFF));
    let imm_i8 = Rc::new(OperandPattern::IntegerRange(-0x80, 0x7F));
    let high_page = Rc::new(OperandPattern::Dereference {
      far: false, size: 1,
      operand: OperandPattern::capture(Rc::new(OperandPattern::IntegerRange(0xFF00, 0xFFFF))),
    });
    let high_page_c = Rc::new(OperandPattern::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: OperandPattern::exactly(0xFF00), subscript: pattern_c.clone(),
    });
    let abs_u8 = Rc::new(OperandPattern::Dereference {
      far: false, size: 1, operand: OperandPattern::capture(imm_u16.clone()),
    });
    let abs_u16 = Rc::new(OperandPattern::Dereference {
      far: false, size: 2, operand: OperandPattern::capture(imm_u16.clone()),
    });
    let hl_post_inc = Rc::new(OperandPattern::Dereference {
      far: false, size: 1,
      operand: Rc::new(OperandPattern::Unary(UnaryOp::PostIncrement, pattern_hl.clone())),
    });
    let hl_post_dec = Rc::new(OperandPattern::Dereference {
      far: false, size: 1,
      operand: Rc::new(OperandPattern::Unary(UnaryOp::PostDecrement, pattern_hl.clone())),
    });

    // Encodings.
    let enc_implicit = ctx.encoding(encode::implicit());
    let enc_u8 = ctx.encoding(encode::u8_operand());
    let enc_u16 = ctx.encoding(encode::u16_operand());
    let enc_pcrel = ctx.encoding(encode::pc_relative_i8_operand());
    let enc_i8 = ctx.encoding(encode::i8_operand());
    let enc_rep_implicit = ctx.encoding(encode::repeated_implicit());
    let enc_bit = ctx.encoding(encode::bit_index_shl3());

    const PREFIX_BIT: u8 = 0xCB;

    // The 8-entry register column grid shared by most one-byte forms.
    let general_registers: [(Rc<OperandPattern>, u8); 8] = [
      (Rc::new(OperandPattern::Register(b)), 0),
      (Rc::new(OperandPattern::Register(c)), 1),
      (Rc::new(OperandPattern::Register(d)), 2),
      (Rc::new(OperandPattern::Register(e)), 3),
      (Rc::new(OperandPattern::Register(h)), 4),
      (Rc::new(OperandPattern::Register(l)), 5),
      (indirect_hl.clone(), 6),
      (pattern_a.clone(), 7),
    ];
    let register_pairs: [(Rc<OperandPattern>, u8); 4] = [
      (pattern_bc.clone(), 0),
      (pattern_de.clone(), 1),
      (pattern_hl.clone(), 2),
      (pattern_sp.clone(), 3),
    ];

    let assign = InstType::Binary(BinaryOp::Assignment);
    // ld r, r2
    for (dest, dest_bits) in &general_registers {
      for (source, source_bits) in &general_registers {
        if Rc::ptr_eq(dest, source) { continue }
        ctx.instruction(Signature::new(assign, 0, [dest.clone(), source.clone()]),
          enc_implicit, InstOptions::new([0x40 | (dest_bits << 3) | source_bits], []), &[]);
      }
    }
    // ld r, n
    for (dest, dest_bits) in &general_registers {
      ctx.instruction(Signature::new(assign, 0, [dest.clone(), imm_u8.clone()]),
        enc_u8, InstOptions::new([0x06 | (dest_bits << 3)], [1]), &[]);
    }
    // ld a, (bc) / ld (bc), a
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), indirect_bc.clone()]),
      enc_implicit, InstOptions::new([0x0A], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [indirect_bc, pattern_a.clone()]),
      enc_implicit, InstOptions::new([0x02], []), &[]);
    // ld a, (de) / ld (de), a
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), indirect_de.clone()]),
      enc_implicit, InstOptions::new([0x1A], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [indirect_de, pattern_a.clone()]),
      enc_implicit, InstOptions::new([0x12], []), &[]);
    // ld a, (nn) / ld (nn), a
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), abs_u8.clone()]),
      enc_u16, InstOptions::new([0xFA], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [abs_u8.clone(), pattern_a.clone()]),
      enc_u16, InstOptions::new([0xEA], [0]), &[]);
    // ldh a, (n) / ldh (n), a
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), high_page.clone()]),
      enc_u8, InstOptions::new([0xF0], [1]), &[]);
    ctx.instruction(Signature::new(assign, 0, [high_page.clone(), pattern_a.clone()]),
      enc_u8, InstOptions::new([0xE0], [0]), &[]);
    // ld a, (0xFF00+c) / ld (0xFF00+c), a
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), high_page_c.clone()]),
      enc_implicit, InstOptions::new([0xF2], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [high_page_c, pattern_a.clone()]),
      enc_implicit, InstOptions::new([0xE2], []), &[]);
    // ld a, (hl++) / ld (hl++), a
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), hl_post_inc.clone()]),
      enc_implicit, InstOptions::new([0x2A], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [hl_post_inc, pattern_a.clone()]),
      enc_implicit, InstOptions::new([0x22], []), &[]);
    // ld a, (hl--) / ld (hl--), a
    ctx.instruction(Signature::new(assign, 0, [pattern_a.clone(), hl_post_dec.clone()]),
      enc_implicit, InstOptions::new([0x3A], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [hl_post_dec, pattern_a.clone()]),
      enc_implicit, InstOptions::new([0x32], []), &[]);
    // ld rr, nn
    for (pair, bits) in &register_pairs {
      ctx.instruction(Signature::new(assign, 0, [pair.clone(), imm_u16.clone()]),
        enc_u16, InstOptions::new([0x01 | (bits << 4)], [1]), &[]);
    }
    // ld (nn), sp
    ctx.instruction(Signature::new(assign, 0, [abs_u16, pattern_sp.clone()]),
      enc_u16, InstOptions::new([0x08], [0]), &[]);
    // ld sp, hl
    ctx.instruction(Signature::new(assign, 0, [pattern_sp.clone(), pattern_hl.clone()]),
      enc_implicit, InstOptions::new([0xF9], []), &[]);
    // push rr / pop rr
    for (pattern, opcode) in [
      (&pattern_bc, 0xC5_u8), (&pattern_de, 0xD5), (&pattern_hl, 0xE5), (&pattern_af, 0xF5),
    ] {
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(push), 0, [(*pattern).clone()]),
        enc_implicit, InstOptions::new([opcode], []), &[]);
      ctx.instruction(Signature::new(InstType::LoadIntrinsic(pop), 0, [(*pattern).clone()]),
        enc_implicit, InstOptions::new([opcode & !0x04], []), &[]);
    }
    // 8-bit arithmetic rows against the register grid, plus the immediate
    // column.
    let arithmetic_ops: &[(InstType, u8)] = &[
      (InstType::Binary(BinaryOp::Addition), 0x00),
      (InstType::Binary(BinaryOp::AdditionWithCarry), 0x08),
      (InstType::Binary(BinaryOp::Subtraction), 0x10),
      (InstType::Binary(BinaryOp::SubtractionWithCarry), 0x18),
      (InstType::Binary(BinaryOp::BitwiseAnd), 0x20),
      (InstType::Binary(BinaryOp::BitwiseXor), 0x28),
      (InstType::Binary(BinaryOp::BitwiseOr), 0x30),
      (InstType::VoidIntrinsic(cmp), 0x38),
    ];
    for &(ty, row) in arithmetic_ops {
      ctx.instruction(Signature::new(ty, 0, [pattern_a.clone(), imm_u8.clone()]),
        enc_u8, InstOptions::new([0xC6 | row], [1]), &[]);
      for (source, source_bits) in &general_registers {
        ctx.instruction(Signature::new(ty, 0, [pattern_a.clone(), source.clone()]),
          enc_implicit, InstOptions::new([0x80 | row | source_bits], []), &[]);
      }
    }
    // inc r / dec r
    let inc = InstType::Unary(UnaryOp::PreIncrement);
    let dec = InstType::Unary(UnaryOp::PreDecrement);
    for (source, source_bits) in &general_registers {
      ctx.instruction(Signature::new(inc, 0, [source.clone()]),
        enc_implicit, InstOptions::new([0x04 | (source_bits << 3)], []), &[zero]);
      ctx.instruction(Signature::new(dec, 0, [source.clone()]),
        enc_implicit, InstOptions::new([0x05 | (source_bits << 3)], []), &[zero]);
    }
    // daa / exx
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(decimal_adjust), 0, []),
      enc_implicit, InstOptions::new([0x27], []), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(exchange_16_bit_registers), 0, []),
      enc_implicit, InstOptions::new([0xD9], []), &[]);
    // cpl, and cpl; inc a
    ctx.instruction(Signature::new(InstType::Unary(UnaryOp::BitwiseNegation), 0,
      [pattern_a.clone()]), enc_implicit, InstOptions::new([0x2F], []), &[]);
    ctx.instruction(Signature::new(InstType::Unary(UnaryOp::SignedNegation), 0,
      [pattern_a.clone()]), enc_implicit, InstOptions::new([0x2F, 0x3C], []), &[]);
    // carry = false / true / !carry
    ctx.instruction(Signature::new(assign, 0, [pattern_carry.clone(), pattern_false.clone()]),
      enc_implicit, InstOptions::new([0x37, 0x3F], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_carry.clone(), pattern_true.clone()]),
      enc_implicit, InstOptions::new([0x37], []), &[]);
    ctx.instruction(Signature::new(InstType::Unary(UnaryOp::LogicalNegation), 0,
      [pattern_carry.clone()]), enc_implicit, InstOptions::new([0x3F], []), &[]);
    // nop / halt / stop / debug_break
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(nop), 0, []),
      enc_implicit, InstOptions::new([0x00], []), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(halt), 0, []),
      enc_implicit, InstOptions::new([0x76, 0x00], []), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(stop), 0, []),
      enc_implicit, InstOptions::new([0x10, 0x00], []), &[]);
    ctx.instruction(Signature::new(InstType::VoidIntrinsic(debug_break), 0, []),
      enc_implicit, InstOptions::new([0x40], []), &[]);
    // di / ei
    ctx.instruction(Signature::new(assign, 0, [pattern_interrupt.clone(), pattern_false.clone()]),
      enc_implicit, InstOptions::new([0xF3], []), &[]);
    ctx.instruction(Signature::new(assign, 0, [pattern_interrupt, pattern_true.clone()]),
      enc_implicit, InstOptions::new([0xFB], []), &[]);
    // add hl, rr
    for (pair, bits) in &register_pairs {
      ctx.instruction(Signature::new(InstType::Binary(BinaryOp::Addition), 0,
        [pattern_hl.clone(), pair.clone()]),
        enc_implicit, InstOptions::new([(bits << 4) | 0x09], []), &[]);
    }
    // add sp, dd
    ctx.instruction(Signature::new(InstType::Binary(BinaryOp::Addition), 0,
      [pattern_sp.clone(), imm_i8.clone()]), enc_i8, InstOptions::new([0xE8], [1]), &[]);
    // inc rr / dec rr
    for (pair, bits) in &register_pairs {
      ctx.instruction(Signature::new(inc, 0, [pair.clone()]),
        enc_implicit, InstOptions::new([0x03 | (bits << 4)], []), &[]);
      ctx.instruction(Signature::new(dec, 0, [pair.clone()]),
        enc_implicit, InstOptions::new([0x0B | (bits << 4)], []), &[]);
    }
    // CB-prefixed shifts and rotates, repeated per shift count. `a << n`
    // prefers the unprefixed add-a form.
    let shift_ops: &[(InstType, u8)] = &[
      (InstType::Binary(BinaryOp::LeftShift), 0x20),         // sla
      (InstType::Binary(BinaryOp::LogicalLeftShift), 0x20),  // sla
      (InstType::Binary(BinaryOp::RightShift), 0x28),        // sra
      (InstType::Binary(BinaryOp::LogicalRightShift), 0x38), // srl
      (InstType::Binary(BinaryOp::LeftRotate), 0x00),        // rlc
      (InstType::Binary(BinaryOp::RightRotate), 0x08),       // rrc
      (InstType::Binary(BinaryOp::LeftRotateWithCarry), 0x10),  // rl
      (InstType::Binary(BinaryOp::RightRotateWithCarry), 0x18), // rr
    ];
    for &(ty, row) in shift_ops {
      for (source, source_bits) in &general_registers {
        let accumulator_shift = Rc::ptr_eq(source, &pattern_a)
          && matches!(ty, InstType::Binary(BinaryOp::LeftShift | BinaryOp::LogicalLeftShift));
        let opcode: ArrayVec<u8, 8> = if accumulator_shift {
          [0x87].into_iter().collect() // add a, a
        } else {
          [PREFIX_BIT, row | source_bits].into_iter().collect()
        };
        ctx.instruction(Signature::new(ty, 0, [source.clone(), imm_u8.clone()]),
          enc_rep_implicit, InstOptions { opcode, parameter: [1].into_iter().collect() }, &[]);
      }
    }
    // hl <<= n lowers to repeated add hl, hl.
    ctx.instruction(Signature::new(InstType::Binary(BinaryOp::LeftShift), 0,
      [pattern_hl.clone(), imm_u8.clone()]),
      enc_rep_implicit, InstOptions::new([0x29], [1]), &[]);
    ctx.instruction(Signature::new(InstType::Binary(BinaryOp::LogicalLeftShift), 0,
      [pattern_hl.clone(), imm_u8.clone()]),
      enc_rep_implicit, InstOptions::new([0x29], [1]), &[]);
    // bit / res / set / swap per register column
    for (source, source_bits) in &general_registers {
      let register_bit = Rc::new(OperandPattern::BitIndex {
        operand: source.clone(),
        subscript: OperandPattern::capture(imm_bit_subscript.clone()),
      });
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(bit), 0,
        [source.clone(), imm_bit_subscript.clone()]),
        enc_bit, InstOptions::new([PREFIX_BIT, 0x40 | source_bits], [1, 0]), &[]);
      ctx.instruction(Signature::new(assign, 0, [register_bit.clone(), pattern_false.clone()]),
        enc_bit, InstOptions::new([PREFIX_BIT, 0x80 | source_bits], [0, 0]), &[]);
      ctx.instruction(Signature::new(assign, 0, [register_bit, pattern_true.clone()]),
        enc_bit, InstOptions::new([PREFIX_BIT, 0xC0 | source_bits], [0, 0]), &[]);
      ctx.instruction(Signature::new(InstType::VoidIntrinsic(swap_digits), 0, [source.clone()]),
        enc_implicit, InstOptions::new([PREFIX_BIT, 0x30 | source_bits], []), &[]);
    }

    // jr / jp families. The near forms take distance hint 0; jp takes
    // hint 1, so an auto-widened branch re-selects the absolute form.
    let goto = InstType::Branch(BranchKind::Goto);
    ctx.instruction(Signature::new(goto, 0, [at_least_0.clone(), imm_u16.clone()]),
      enc_pcrel, InstOptions::new([0x18], [1]), &[]);
    for (flag, row) in [(&pattern_zero, 0_u8), (&pattern_carry, 1)] {
      ctx.instruction(Signature::new(goto, 0,
        [at_least_0.clone(), imm_u16.clone(), (*flag).clone(), pattern_false.clone()]),
        enc_pcrel, InstOptions::new([0x20 | (row << 4)], [1]), &[]);
      ctx.instruction(Signature::new(goto, 0,
        [at_least_0.clone(), imm_u16.clone(), (*flag).clone(), pattern_true.clone()]),
        enc_pcrel, InstOptions::new([0x28 | (row << 4)], [1]), &[]);
      ctx.instruction(Signature::new(goto, 0,
        [at_least_1.clone(), imm_u16.clone(), (*flag).clone(), pattern_false.clone()]),
        enc_u16, InstOptions::new([0xC2 | (row << 4)], [1]), &[]);
      ctx.instruction(Signature::new(goto, 0,
        [at_least_1.clone(), imm_u16.clone(), (*flag).clone(), pattern_true.clone()]),
        enc_u16, InstOptions::new([0xCA | (row << 4)], [1]), &[]);
    }
    ctx.instruction(Signature::new(goto, 0, [at_least_1.clone(), imm_u16.clone()]),
      enc_u16, InstOptions::new([0xC3], [1]), &[]);
    // jp hl
    ctx.instruction(Signature::new(goto, 0, [at_least_0.clone(), pattern_hl.clone()]),
      enc_implicit, InstOptions::new([0xE9], []), &[]);
    // call / conditional call
    let call = InstType::Branch(BranchKind::Call);
    ctx.instruction(Signature::new(call, 0, [at_least_0.clone(), imm_u16.clone()]),
      enc_u16, InstOptions::new([0xCD], [1]), &[]);
    for (flag, row) in [(&pattern_zero, 0_u8), (&pattern_carry, 1)] {
      ctx.instruction(Signature::new(call, 0,
        [at_least_0.clone(), imm_u16.clone(), (*flag).clone(), pattern_false.clone()]),
        enc_u16, InstOptions::new([0xC4 | (row << 4)], [1]), &[]);
      ctx.instruction(Signature::new(call, 0,
        [at_least_0.clone(), imm_u16.clone(), (*flag).clone(), pattern_true.clone()]),
        enc_u16, InstOptions::new([0xCC | (row << 4)], [1]), &[]);
    }
    // ret / conditional ret / reti
    let ret = InstType::Branch(BranchKind::Return);
    ctx.instruction(Signature::new(ret, 0, [at_least_0.clone()]),
      enc_implicit, InstOptions::new([0xC9], []), &[]);
    for (flag, row) in [(&pattern_zero, 0_u8), (&pattern_carry, 1)] {
      ctx.instruction(Signature::new(ret, 0,
        [at_least_0.clone(), (*flag).clone(), pattern_false.clone()]),
        enc_implicit, InstOptions::new([0xC0 | (row << 4)], []), &[]);
      ctx.instruction(Signature::new(ret, 0,
        [at_least_0.clone(), (*flag).clone(), pattern_true.clone()]),
        enc_implicit, InstOptions::new([0xC8 | (row << 4)], []), &[]);
    }
    ctx.instruction(Signature::new(InstType::Branch(BranchKind::IrqReturn), 0,
      [at_least_0.clone()]), enc_implicit, InstOptions::new([0xD9], []), &[]);
    // rst vectors as call specialisations
    for vector in [0_u8, 8, 16, 24, 32, 40, 48, 56] {
      ctx.instruction(Signature::new(call, 0,
        [at_least_0.clone(), OperandPattern::exactly(vector.into())]),
        enc_implicit, InstOptions::new([0xC7 | vector], []), &[]);
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
    let a = self.a.expect("platform not seeded");
    let signed = matches!(ty.kind, DefKind::BuiltinIntegerType { min, .. } if min < 0);

    match op {
      BinaryOp::Equal | BinaryOp::NotEqual => {
        if left.as_resolved() != Some(a) { return None }
        // a == 0 -> { a |= a; } && zero
        if right.as_int() == Some(0) {
          return Some(TestAndBranch::new(InstType::Binary(BinaryOp::BitwiseOr), [left, left],
            [FlagBranch::new(zero, op == BinaryOp::Equal, true)]))
        }
        // a == right -> { cmp(a, right); } && zero
        Some(TestAndBranch::new(cmp, [left, right],
          [FlagBranch::new(zero, op == BinaryOp::Equal, true)]))
      }
      BinaryOp::LessThan | BinaryOp::GreaterThanOrEqual => {
        if signed {
          // left < 0 -> { bit(left, 7); } && !zero
          // left >= 0 -> { bit(left, 7); } && zero
          if right.as_int() == Some(0) {
            let seven = self.bit_index_7.as_ref().expect("platform not seeded");
            if ctx.can_select(bit, &[left, seven]) {
              return Some(TestAndBranch::new(bit, [left, seven],
                [FlagBranch::new(zero, op != BinaryOp::LessThan, true)]))
            }
          }
          None
        } else if left.as_resolved() == Some(a) {
          // a < right -> carry; a >= right -> !carry.
          Some(TestAndBranch::new(cmp, [left, right],
            [FlagBranch::new(carry, op == BinaryOp::LessThan, true)]))
        } else {
          None
        }
      }
      BinaryOp::LessThanOrEqual => {
        // a <= right -> { cmp(a, right); } && (zero || carry)
        if !signed && left.as_resolved() == Some(a) {
          return Some(TestAndBranch::new(cmp, [left, right], [
            FlagBranch::new(zero, true, true),
            FlagBranch::new(carry, true, true),
          ]))
        }
        None
      }
      BinaryOp::GreaterThan => {
        // a > right -> { cmp(a, right); } && !zero && !carry
        if !signed && left.as_resolved() == Some(a) {
          return Some(TestAndBranch::new(cmp, [left, right], [
            FlagBranch::new(zero, true, false),
            FlagBranch::new(carry, false, true),
          ]))
        }
        None
      }
      BinaryOp::BitIndexing => {
        // left $ n -> { bit(left, n); } && !zero
        let is_register = left.as_resolved()
          .is_some_and(|d| matches!(ctx.defs[d].kind, DefKind::BuiltinRegister { .. }));
        if is_register && matches!(right.as_int(), Some(0..=7)) {
          return Some(TestAndBranch::new(bit, [left, right],
            [FlagBranch::new(zero, false, true)]))
        }
        None
      }
      _ => None,
    }
  }
}
