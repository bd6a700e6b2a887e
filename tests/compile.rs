//! End-to-end compilation scenarios: programs are built as statement trees
//! (the parser is an external collaborator), compiled against a real
//! backend, and the emitted bank bytes compared against hand-assembled
//! images.

use std::io::Read;

use cartcc::arch::gb::GbPlatform;
use cartcc::arch::mos6502::{Mos6502Platform, Revision};
use cartcc::types::ast::{
  Attribute, BinaryOp, BranchKind, Expr, ExprKind, Qualifiers, Stmt, StmtKind, TypeExpr,
  TypeExprKind, UnaryOp,
};
use cartcc::types::{NodeCounter, SourceLoc};
use cartcc::{Compiler, NoBinaryFiles, NoImports, OutputFormat};

/// A little statement-tree builder so the scenarios stay readable.
struct Ast {
  ids: NodeCounter,
  loc: SourceLoc,
}

impl Ast {
  fn new(c: &mut Compiler) -> Self {
    let path = c.interner.intern("test.wz");
    Ast { ids: NodeCounter::new(), loc: SourceLoc::new(path, 1) }
  }

  fn stmt(&mut self, kind: StmtKind) -> Stmt {
    Stmt::new(self.ids.fresh(), kind, self.loc)
  }

  fn file(&mut self, c: &mut Compiler, items: Vec<Stmt>) -> Stmt {
    let path = c.interner.intern("test.wz");
    self.stmt(StmtKind::File { items, path, expanded: path })
  }

  fn expr(&self, kind: ExprKind) -> Expr {
    Expr::new(kind, self.loc)
  }

  fn int(&self, v: i128) -> Expr { self.expr(ExprKind::Int(v)) }

  fn ident(&self, c: &mut Compiler, name: &str) -> Expr {
    let sym = c.interner.intern(name);
    self.expr(ExprKind::Ident(std::iter::once(sym).collect()))
  }

  fn ty_ident(&self, c: &mut Compiler, name: &str) -> TypeExpr {
    let sym = c.interner.intern(name);
    TypeExpr::new(TypeExprKind::Ident(std::iter::once(sym).collect()), self.loc)
  }

  fn assign(&self, lhs: Expr, rhs: Expr) -> Stmt {
    Stmt::internal(StmtKind::ExprStmt(Box::new(self.expr(
      ExprKind::Binary(BinaryOp::Assignment, Box::new(lhs), Box::new(rhs))))), self.loc)
  }

  fn bank(&mut self, c: &mut Compiler, name: &str, origin: u32, kind: &str, cap: i128) -> Stmt {
    let bank_name = c.interner.intern(name);
    let ty = TypeExpr::new(TypeExprKind::Array {
      elem: Box::new(self.ty_ident(c, kind)),
      count: Some(Box::new(self.int(cap))),
    }, self.loc);
    self.stmt(StmtKind::Bank {
      names: vec![bank_name],
      addresses: vec![Some(self.int(origin.into()))],
      ty,
    })
  }

  fn in_bank(&mut self, c: &mut Compiler, name: &str, items: Vec<Stmt>) -> Stmt {
    let sym = c.interner.intern(name);
    let body = self.stmt(StmtKind::Block(items));
    self.stmt(StmtKind::In {
      pieces: std::iter::once(sym).collect(),
      dest: None,
      body: Box::new(body),
    })
  }

  fn func(&mut self, c: &mut Compiler, name: &str, body: Vec<Stmt>) -> Stmt {
    let sym = c.interner.intern(name);
    let body = self.stmt(StmtKind::Block(body));
    self.stmt(StmtKind::Func {
      inline: false, far: false, name: sym,
      params: vec![], ret: None,
      body: Box::new(body),
    })
  }

  /// A function whose end falls through (no implicit return), so the test
  /// bytes are exactly the body.
  fn fallthrough_func(&mut self, c: &mut Compiler, name: &str, body: Vec<Stmt>) -> Stmt {
    let func = self.func(c, name, body);
    let attr_name = c.interner.intern("fallthrough");
    self.stmt(StmtKind::Attribution {
      attrs: vec![Attribute { name: attr_name, args: vec![], loc: self.loc }],
      body: Box::new(func),
    })
  }

  fn label(&mut self, c: &mut Compiler, name: &str) -> Stmt {
    let sym = c.interner.intern(name);
    self.stmt(StmtKind::Label { far: false, name: sym })
  }

  fn goto(&mut self, c: &mut Compiler, target: &str, distance: Option<u32>) -> Stmt {
    let dest = self.ident(c, target);
    self.stmt(StmtKind::Branch {
      kind: BranchKind::Goto, distance,
      condition: None,
      destination: Some(Box::new(dest)),
      return_value: None,
    })
  }

  fn call_stmt(&mut self, c: &mut Compiler, name: &str) -> Stmt {
    let callee = self.ident(c, name);
    self.stmt(StmtKind::ExprStmt(Box::new(self.expr(ExprKind::Call {
      inline: false, callee: Box::new(callee), args: vec![],
    }))))
  }
}

fn bank_data(c: &Compiler, name: &str) -> Vec<u8> {
  let sym = c.interner.lookup(name).expect("bank name");
  c.banks.enum_iter()
    .find(|(_, b)| b.name == sym)
    .map(|(_, b)| b.data.clone())
    .expect("bank exists")
}

fn diagnostics(c: &Compiler) -> String {
  let mut out = vec![];
  c.render_diagnostics(&mut out).unwrap();
  String::from_utf8(out).unwrap()
}

#[test]
fn immediate_load_6502() {
  let _ = env_logger::builder().is_test(true).try_init();
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  let mut ast = Ast::new(&mut c);

  let body = vec![ast.assign(ast.ident(&mut c, "a"), ast.int(5))];
  let func = ast.fallthrough_func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  assert_eq!(bank_data(&c, "prg"), hex::decode("a905").unwrap());
  assert_eq!(c.report.error_count(), 0);
}

#[test]
fn near_branch_backward_gb() {
  let mut c = Compiler::new(Box::new(GbPlatform::new()));
  let mut ast = Ast::new(&mut c);

  let a = ast.ident(&mut c, "a");
  let inc = ast.assign(ast.ident(&mut c, "a"),
    ast.expr(ExprKind::Binary(BinaryOp::Addition, Box::new(a), Box::new(ast.int(1)))));
  let body = vec![
    ast.label(&mut c, "top"),
    inc,
    ast.goto(&mut c, "top", None),
  ];
  let func = ast.func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  // inc a; jr -3
  assert_eq!(bank_data(&c, "prg"), hex::decode("3c18fd").unwrap());
}

#[test]
fn pc_relative_out_of_range() {
  let mut c = Compiler::new(Box::new(GbPlatform::new()));
  let mut ast = Ast::new(&mut c);

  // 200 bytes of nops between the label and a branch forced to stay near.
  let nop = ast.call_stmt(&mut c, "nop");
  let padding = ast.stmt(StmtKind::InlineFor {
    name: c.interner.intern("i"),
    seq: Box::new(ast.expr(ExprKind::Range {
      start: Some(Box::new(ast.int(0))),
      end: Some(Box::new(ast.int(200))),
      step: None,
    })),
    body: Box::new(nop),
  });
  let body = vec![
    ast.label(&mut c, "top"),
    padding,
    ast.goto(&mut c, "top", Some(0)),
  ];
  let func = ast.fallthrough_func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(!c.compile(program, &mut NoImports, &mut NoBinaryFiles));
  assert_eq!(c.report.error_count(), 1, "{}", diagnostics(&c));
  assert!(diagnostics(&c).contains("-128..127"), "{}", diagnostics(&c));
}

#[test]
fn branch_auto_widens_to_absolute_jump() {
  // The same backward distance without a hint re-selects the absolute jump.
  let mut c = Compiler::new(Box::new(GbPlatform::new()));
  let mut ast = Ast::new(&mut c);

  let nop = ast.call_stmt(&mut c, "nop");
  let padding = ast.stmt(StmtKind::InlineFor {
    name: c.interner.intern("i"),
    seq: Box::new(ast.expr(ExprKind::Range {
      start: Some(Box::new(ast.int(0))),
      end: Some(Box::new(ast.int(200))),
      step: None,
    })),
    body: Box::new(nop),
  });
  let body = vec![
    ast.label(&mut c, "top"),
    padding,
    ast.goto(&mut c, "top", None),
  ];
  let func = ast.fallthrough_func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  let data = bank_data(&c, "prg");
  assert_eq!(data.len(), 203);
  // jp 0x0150
  assert_eq!(&data[200..], hex::decode("c35001").unwrap().as_slice());
}

#[test]
fn store_zero_specialization_65c02() {
  // `*(0x10) = 0` hits the dedicated store-zero instruction.
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base65C02)));
  let mut ast = Ast::new(&mut c);

  let pointer_ty = TypeExpr::new(TypeExprKind::Pointer {
    elem: Box::new(ast.ty_ident(&mut c, "u8")),
    quals: Qualifiers::empty(),
  }, ast.loc);
  let deref = ast.expr(ExprKind::Unary(UnaryOp::Indirection,
    Box::new(ast.expr(ExprKind::Cast { value: Box::new(ast.int(0x10)), ty: pointer_ty }))));
  let body = vec![ast.assign(deref, ast.int(0))];
  let func = ast.fallthrough_func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  // stz $10
  assert_eq!(bank_data(&c, "prg"), hex::decode("6410").unwrap());
}

#[test]
fn indexed_load_6502() {
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  let mut ast = Ast::new(&mut c);

  let arr_ty = TypeExpr::new(TypeExprKind::Array {
    elem: Box::new(ast.ty_ident(&mut c, "u8")),
    count: Some(Box::new(ast.int(16))),
  }, ast.loc);
  let arr = ast.stmt(StmtKind::Var {
    quals: Qualifiers::empty(),
    names: vec![c.interner.intern("arr")],
    addresses: vec![None],
    ty: Some(arr_ty),
    value: None,
  });
  let ram = ast.bank(&mut c, "ram", 0x0200, "vardata", 0x100);
  let in_ram = ast.in_bank(&mut c, "ram", vec![arr]);

  let index = ast.expr(ExprKind::Binary(BinaryOp::Indexing,
    Box::new(ast.ident(&mut c, "arr")), Box::new(ast.ident(&mut c, "x"))));
  let body = vec![ast.assign(ast.ident(&mut c, "a"), index)];
  let func = ast.fallthrough_func(&mut c, "main", body);
  let prg = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x1000);
  let in_prg = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![ram, in_ram, prg, in_prg]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  // lda $0200,x
  assert_eq!(bank_data(&c, "prg"), hex::decode("bd0002").unwrap());
  // RAM banks contribute addresses but no bytes.
  assert_eq!(bank_data(&c, "ram"), Vec::<u8>::new());
}

#[test]
fn if_else_short_circuit_gb() {
  let mut c = Compiler::new(Box::new(GbPlatform::new()));
  let mut ast = Ast::new(&mut c);

  let cond = ast.expr(ExprKind::Binary(BinaryOp::Equal,
    Box::new(ast.ident(&mut c, "a")), Box::new(ast.int(0))));
  let then = ast.assign(ast.ident(&mut c, "a"), ast.int(1));
  let els = ast.assign(ast.ident(&mut c, "a"), ast.int(2));
  let then_block = ast.stmt(StmtKind::Block(vec![then]));
  let els_block = ast.stmt(StmtKind::Block(vec![els]));
  let if_stmt = ast.stmt(StmtKind::If {
    distance: None,
    condition: Box::new(cond),
    then: Box::new(then_block),
    els: Some(Box::new(els_block)),
  });
  let func = ast.fallthrough_func(&mut c, "main", vec![if_stmt]);
  let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  // or a, a; jr nz, +4; ld a, 1; jr +2; ld a, 2
  assert_eq!(bank_data(&c, "prg"), hex::decode("b720043e0118023e02").unwrap());
}

#[test]
fn while_loop_gb() {
  let mut c = Compiler::new(Box::new(GbPlatform::new()));
  let mut ast = Ast::new(&mut c);

  let cond = ast.expr(ExprKind::Binary(BinaryOp::LessThan,
    Box::new(ast.ident(&mut c, "a")), Box::new(ast.int(10))));
  let a = ast.ident(&mut c, "a");
  let inc = ast.assign(ast.ident(&mut c, "a"),
    ast.expr(ExprKind::Binary(BinaryOp::Addition, Box::new(a), Box::new(ast.int(1)))));
  let body = ast.stmt(StmtKind::Block(vec![inc]));
  let while_stmt = ast.stmt(StmtKind::While {
    distance: None, condition: Box::new(cond), body: Box::new(body),
  });
  let func = ast.fallthrough_func(&mut c, "main", vec![while_stmt]);
  let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  // top: cp 10; jr nc, exit; inc a; jr top
  assert_eq!(bank_data(&c, "prg"), hex::decode("fe0a30033c18f9").unwrap());
}

#[test]
fn call_and_return_gb() {
  let mut c = Compiler::new(Box::new(GbPlatform::new()));
  let mut ast = Ast::new(&mut c);

  let call = ast.call_stmt(&mut c, "sub");
  let main = ast.func(&mut c, "main", vec![call]);
  let store = ast.assign(ast.ident(&mut c, "a"), ast.int(1));
  let sub = ast.func(&mut c, "sub", vec![store]);
  let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![main, sub]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  // main: call sub; ret -- sub at 0x154: ld a, 1; ret
  assert_eq!(bank_data(&c, "prg"), hex::decode("cd5401c93e01c9").unwrap());
}

#[test]
fn inline_for_unrolls_stores() {
  // A synthetic backend with a memory-from-immediate store, so the
  // unrolled destinations and values are directly visible in the image.
  use cartcc::arch::{Platform, TestAndBranch, TestCtx};
  use cartcc::builtins::SeedCtx;
  use cartcc::inst::{
    Encoding, InstOptions, InstType, OperandPattern, Signature,
  };
  use cartcc::types::entity::{DefId, Definition};

  #[derive(Debug, Default)]
  struct StoreImmPlatform {
    u16_type: Option<DefId>,
    u24_type: Option<DefId>,
    zero: Option<DefId>,
  }

  impl Platform for StoreImmPlatform {
    fn name(&self) -> &'static str { "storeimm" }

    fn reserve_definitions(&mut self, ctx: &mut SeedCtx<'_>) {
      self.u16_type = Some(ctx.builtins.u16_type);
      self.u24_type = Some(ctx.builtins.u24_type);
      self.zero = Some(ctx.flag("zero"));

      let imm_u8 = std::rc::Rc::new(OperandPattern::IntegerRange(0, 0xFF));
      let imm_u16 = std::rc::Rc::new(OperandPattern::IntegerRange(0, 0xFFFF));
      let absolute = std::rc::Rc::new(OperandPattern::Dereference {
        far: false, size: 1, operand: OperandPattern::capture(imm_u16),
      });
      let enc = ctx.encoding(Encoding {
        size: |options, _| options.opcode.len() + 3,
        write: |em, options, lists| {
          em.extend(&options.opcode);
          #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
          em.push_u16_le(lists[options.parameter[0]][0].integer() as u16);
          #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
          em.push_u8(lists[options.parameter[1]][0].integer() as u8);
          Ok(())
        },
      });
      ctx.instruction(
        Signature::new(InstType::Binary(BinaryOp::Assignment), 0,
          [absolute, OperandPattern::capture(imm_u8)]),
        enc, InstOptions::new([0x42], [0, 1]), &[]);
    }

    fn pointer_sized_type(&self) -> DefId { self.u16_type.unwrap() }
    fn far_pointer_sized_type(&self) -> DefId { self.u24_type.unwrap() }
    fn zero_flag(&self) -> DefId { self.zero.unwrap() }
    fn placeholder_value(&self) -> i128 { 0xCCCC_CCCC_CCCC_CCCC_u64.into() }
    fn test_and_branch<'e>(
      &'e self, _: &TestCtx<'_>, _: &Definition, _: BinaryOp,
      _: &'e Expr, _: &'e Expr, _: u32,
    ) -> Option<TestAndBranch<'e>> { None }
  }

  let mut c = Compiler::new(Box::new(StoreImmPlatform::default()));
  let mut ast = Ast::new(&mut c);

  let i = c.interner.intern("i");
  let pointer_ty = TypeExpr::new(TypeExprKind::Pointer {
    elem: Box::new(ast.ty_ident(&mut c, "u8")),
    quals: Qualifiers::empty(),
  }, ast.loc);
  let address = ast.expr(ExprKind::Binary(BinaryOp::Addition,
    Box::new(ast.int(0x2000)), Box::new(ast.ident(&mut c, "i"))));
  let deref = ast.expr(ExprKind::Unary(UnaryOp::Indirection,
    Box::new(ast.expr(ExprKind::Cast { value: Box::new(address), ty: pointer_ty }))));
  let value = ast.expr(ExprKind::Cast {
    value: Box::new(ast.ident(&mut c, "i")),
    ty: ast.ty_ident(&mut c, "u8"),
  });
  let store = ast.assign(deref, value);
  let unrolled = ast.stmt(StmtKind::InlineFor {
    name: i,
    seq: Box::new(ast.expr(ExprKind::Range {
      start: Some(Box::new(ast.int(0))),
      end: Some(Box::new(ast.int(3))),
      step: None,
    })),
    body: Box::new(store),
  });
  let func = ast.fallthrough_func(&mut c, "main", vec![unrolled]);
  let bank = ast.bank(&mut c, "prg", 0x4000, "prgdata", 0x100);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  assert_eq!(bank_data(&c, "prg"),
    hex::decode("420020004201200142022002").unwrap());
}

#[test]
fn define_queries() {
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  c.add_define_integer("speed", 7);
  let mut ast = Ast::new(&mut c);

  let get_hit = ast.expr(ExprKind::Call {
    inline: false,
    callee: Box::new(ast.ident(&mut c, "__get")),
    args: vec![ast.ident(&mut c, "speed"), ast.int(1)],
  });
  let get_miss = ast.expr(ExprKind::Call {
    inline: false,
    callee: Box::new(ast.ident(&mut c, "__get")),
    args: vec![ast.ident(&mut c, "missing"), ast.int(3)],
  });
  let body = vec![
    ast.assign(ast.ident(&mut c, "a"), get_hit),
    ast.assign(ast.ident(&mut c, "x"), get_miss),
  ];
  let func = ast.fallthrough_func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  // lda #7; ldx #3
  assert_eq!(bank_data(&c, "prg"), hex::decode("a907a203").unwrap());
}

#[test]
fn let_macro_expansion() {
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  let mut ast = Ast::new(&mut c);

  // let double(n) = n * 2;
  let n = c.interner.intern("n");
  let body_expr = ast.expr(ExprKind::Binary(BinaryOp::Multiplication,
    Box::new(ast.ident(&mut c, "n")), Box::new(ast.int(2))));
  let let_stmt = ast.stmt(StmtKind::Let {
    name: c.interner.intern("double"),
    params: Some(vec![n]),
    value: Box::new(body_expr),
  });
  let use_expr = ast.expr(ExprKind::Call {
    inline: false,
    callee: Box::new(ast.ident(&mut c, "double")),
    args: vec![ast.int(21)],
  });
  let body = vec![ast.assign(ast.ident(&mut c, "a"), use_expr)];
  let func = ast.fallthrough_func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![let_stmt, bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  // lda #42
  assert_eq!(bank_data(&c, "prg"), hex::decode("a92a").unwrap());
}

#[test]
fn const_data_emission() {
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  let mut ast = Ast::new(&mut c);

  let value = ast.expr(ExprKind::Array(vec![
    ast.int(1), ast.int(2), ast.int(3),
  ]));
  let table_ty = TypeExpr::new(TypeExprKind::Array {
    elem: Box::new(ast.ty_ident(&mut c, "u8")),
    count: Some(Box::new(ast.int(3))),
  }, ast.loc);
  let table = ast.stmt(StmtKind::Var {
    quals: Qualifiers::CONST,
    names: vec![c.interner.intern("table")],
    addresses: vec![None],
    ty: Some(table_ty),
    value: Some(Box::new(value)),
  });
  let word = ast.stmt(StmtKind::Var {
    quals: Qualifiers::CONST,
    names: vec![c.interner.intern("word")],
    addresses: vec![None],
    ty: Some(ast.ty_ident(&mut c, "u16")),
    value: Some(Box::new(ast.int(0x1234))),
  });
  let bank = ast.bank(&mut c, "data", 0xC000, "constdata", 0x100);
  let in_bank = ast.in_bank(&mut c, "data", vec![table, word]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
  assert_eq!(bank_data(&c, "data"), hex::decode("0102033412").unwrap());
}

#[test]
fn determinism() {
  // Compiling the same source twice yields byte-identical output.
  let build = || {
    let mut c = Compiler::new(Box::new(GbPlatform::new()));
    let mut ast = Ast::new(&mut c);
    let cond = ast.expr(ExprKind::Binary(BinaryOp::LessThan,
      Box::new(ast.ident(&mut c, "a")), Box::new(ast.int(10))));
    let a = ast.ident(&mut c, "a");
    let inc = ast.assign(ast.ident(&mut c, "a"),
      ast.expr(ExprKind::Binary(BinaryOp::Addition, Box::new(a), Box::new(ast.int(1)))));
    let body = ast.stmt(StmtKind::Block(vec![inc]));
    let while_stmt = ast.stmt(StmtKind::While {
      distance: None, condition: Box::new(cond), body: Box::new(body),
    });
    let func = ast.func(&mut c, "main", vec![while_stmt]);
    let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
    let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
    let program = ast.file(&mut c, vec![bank, in_bank]);
    assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));
    bank_data(&c, "prg")
  };
  assert_eq!(build(), build());
}

#[test]
fn ines_container() {
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  let mut ast = Ast::new(&mut c);

  let config = ast.stmt(StmtKind::Config(vec![
    (c.interner.intern("mapper"), ast.int(1)),
    (c.interner.intern("mirror"), ast.int(1)),
  ]));
  let body = vec![ast.assign(ast.ident(&mut c, "a"), ast.int(5))];
  let func = ast.func(&mut c, "main", body);
  let prg = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x4000);
  let chr = ast.bank(&mut c, "chr", 0x0000, "chrdata", 0x2000);
  let in_prg = ast.in_bank(&mut c, "prg", vec![config, func]);
  let program = ast.file(&mut c, vec![prg, chr, in_prg]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));

  let mut file = tempfile::tempfile().unwrap();
  c.write_output(OutputFormat::Ines, &mut file).unwrap();
  use std::io::Seek;
  file.rewind().unwrap();
  let mut image = vec![];
  file.read_to_end(&mut image).unwrap();

  assert_eq!(image.len(), 16 + 0x4000 + 0x2000);
  assert_eq!(&image[..4], b"NES\x1a");
  assert_eq!(image[4], 1); // one 16 KiB PRG bank
  assert_eq!(image[5], 1); // one 8 KiB CHR bank
  assert_eq!(image[6], 0x10 | 0x01); // mapper 1 low nibble, vertical mirroring
  assert_eq!(&image[16..19], hex::decode("a90560").unwrap().as_slice());
  assert_eq!(image[19], 0xFF); // pad fill
}

#[test]
fn gb_container_checksums() {
  let mut c = Compiler::new(Box::new(GbPlatform::new()));
  let mut ast = Ast::new(&mut c);

  let config = ast.stmt(StmtKind::Config(vec![
    (c.interner.intern("title"), ast.expr(ExprKind::String(b"TEST".to_vec()))),
  ]));
  let body = vec![ast.assign(ast.ident(&mut c, "a"), ast.int(5))];
  let func = ast.func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![config, func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));

  let mut image = vec![];
  c.write_output(OutputFormat::Gb, &mut image).unwrap();
  assert_eq!(image.len(), 0x8000);
  assert_eq!(image[0x104], 0xCE); // logo start
  assert_eq!(&image[0x134..0x138], b"TEST");
  // Recompute the header checksum.
  let mut check: u8 = 0;
  for &b in &image[0x134..=0x14C] {
    check = check.wrapping_sub(b).wrapping_sub(1);
  }
  assert_eq!(image[0x14D], check);
}

#[test]
fn symbol_map_lists_functions() {
  let mut c = Compiler::new(Box::new(GbPlatform::new()));
  let mut ast = Ast::new(&mut c);

  let body = vec![ast.assign(ast.ident(&mut c, "a"), ast.int(5))];
  let func = ast.func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x0150, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(c.compile(program, &mut NoImports, &mut NoBinaryFiles), "{}", diagnostics(&c));

  let mut out = vec![];
  c.write_symbols(&mut out).unwrap();
  let map = String::from_utf8(out).unwrap();
  assert!(map.contains("0150 main"), "{map}");
}

#[test]
fn undefined_identifier_reports_and_continues() {
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  let mut ast = Ast::new(&mut c);

  let body = vec![
    ast.assign(ast.ident(&mut c, "a"), ast.ident(&mut c, "nonsense")),
    ast.assign(ast.ident(&mut c, "x"), ast.ident(&mut c, "also_nonsense")),
  ];
  let func = ast.func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![bank, in_bank]);

  assert!(!c.compile(program, &mut NoImports, &mut NoBinaryFiles));
  // Both problems surface in one invocation.
  assert!(c.report.error_count() >= 2, "{}", diagnostics(&c));
  assert!(diagnostics(&c).contains("undefined identifier `nonsense`"));
  assert!(diagnostics(&c).contains("undefined identifier `also_nonsense`"));
}

#[test]
fn imports_flatten_once() {
  use cartcc::ImportResolver;
  use cartcc::symbol::Symbol as Sym;

  struct OneImport {
    served: usize,
  }
  impl ImportResolver for OneImport {
    fn resolve(&mut self, path: Sym, interner: &mut cartcc::symbol::Interner)
      -> Option<Stmt>
    {
      self.served += 1;
      let loc = SourceLoc::new(path, 1);
      // The imported file itself imports the main file, forming a cycle
      // broken by duplicate suppression.
      let back = interner.intern("test.wz");
      Some(Stmt::internal(StmtKind::File {
        items: vec![Stmt::internal(StmtKind::ImportReference { path: back }, loc)],
        path, expanded: path,
      }, loc))
    }
  }

  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  let mut ast = Ast::new(&mut c);
  let lib = c.interner.intern("lib.wz");
  let import = ast.stmt(StmtKind::ImportReference { path: lib });
  let body = vec![ast.assign(ast.ident(&mut c, "a"), ast.int(5))];
  let func = ast.func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![import, bank, in_bank]);

  let mut resolver = OneImport { served: 0 };
  assert!(c.compile(program, &mut resolver, &mut NoBinaryFiles), "{}", diagnostics(&c));
  assert_eq!(resolver.served, 1);
}

#[test]
fn write_only_location_cannot_be_read() {
  let mut c = Compiler::new(Box::new(Mos6502Platform::new(Revision::Base6502)));
  let mut ast = Ast::new(&mut c);

  let port = ast.stmt(StmtKind::Var {
    quals: Qualifiers::WRITEONLY,
    names: vec![c.interner.intern("port")],
    addresses: vec![Some(ast.int(0x2005))],
    ty: Some(ast.ty_ident(&mut c, "u8")),
    value: None,
  });
  let body = vec![ast.assign(ast.ident(&mut c, "a"), ast.ident(&mut c, "port"))];
  let func = ast.func(&mut c, "main", body);
  let bank = ast.bank(&mut c, "prg", 0x8000, "prgdata", 0x1000);
  let in_bank = ast.in_bank(&mut c, "prg", vec![func]);
  let program = ast.file(&mut c, vec![port, bank, in_bank]);

  assert!(!c.compile(program, &mut NoImports, &mut NoBinaryFiles));
  assert!(diagnostics(&c).contains("write-only"), "{}", diagnostics(&c));
}
