//! Code generation: lowers reduced statements to instruction selections
//! and bytes. The same generator runs in three modes: `Size` during
//! address assignment, `Check` to probe PC-relative encodings once
//! addresses are known (feeding the branch-widening set), and `Emit` for
//! the final bytes.

use hashbrown::HashMap;

use crate::arch::TestCtx;
use crate::bank::BankId;
use crate::inst::{CaptureLists, EncodeError, Emitter, InstType, Operand};
use crate::types::ast::{
  BinaryOp, BranchKind, Expr, ExprKind, Qualifiers, Stmt, StmtKind, TypeExpr, TypeExprKind,
  UnaryOp,
};
use crate::types::entity::{DefId, DefKind, Definition, InterruptKind};
use crate::types::{IdxVec, NodeId, SourceLoc};
use crate::Compiler;

/// Which artifact a generation run produces.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum GenMode {
  /// Accumulate sizes only.
  Size,
  /// Produce bytes into a scratch buffer to exercise encode checks;
  /// PC-relative failures widen auto branch sites instead of diagnosing.
  Check,
  /// Produce the final bytes; encode failures are diagnosed.
  Emit,
}

/// The result of generating one function.
#[derive(Default)]
pub(crate) struct GenOutput {
  /// The body size in bytes.
  pub size: u32,
  /// Whether any auto branch site was widened this run.
  pub widened_any: bool,
  /// The produced bytes (empty in `Size` mode).
  pub bytes: Vec<u8>,
}

/// A branch destination: either a definition whose address is read at
/// emission time (so it tracks the current layout round), or a fixed
/// operand.
#[derive(Clone, Debug)]
enum Dest {
  Def(DefId),
  Fixed(Operand),
}

struct LoopFrame {
  break_label: DefId,
  continue_label: DefId,
}

/// The address operand for a definition, or the placeholder while the
/// address is still unknown.
fn addr_operand(defs: &IdxVec<DefId, Definition>, def: DefId, placeholder: i128) -> Operand {
  match defs[def].address().and_then(|a| a.absolute) {
    Some(abs) => Operand::int(abs.into()),
    None => Operand::Integer { value: placeholder, placeholder: true },
  }
}

/// The storage size of a reduced type, without diagnostics; `None` for
/// types whose size needs platform context.
fn type_size(defs: &IdxVec<DefId, Definition>, ty: &TypeExpr) -> Option<u32> {
  match &ty.kind {
    TypeExprKind::Resolved(def) => match &defs[*def].kind {
      DefKind::BuiltinIntegerType { size, .. } => Some((*size).into()),
      DefKind::BuiltinBoolType => Some(1),
      DefKind::Enum { underlying, .. } => type_size(defs, underlying),
      DefKind::Struct { members, .. } => {
        let mut total = 0_u32;
        for &member in members {
          if let DefKind::StructMember { ty, .. } = &defs[member].kind {
            total = total.checked_add(type_size(defs, ty)?)?;
          }
        }
        Some(total)
      }
      _ => None,
    },
    TypeExprKind::Array { elem, count } => {
      let count = count.as_ref().and_then(|e| e.as_int())?;
      type_size(defs, elem)?.checked_mul(u32::try_from(count).ok()?)
    }
    TypeExprKind::Tuple(items) => {
      let mut total = 0_u32;
      for item in items { total = total.checked_add(type_size(defs, item)?)? }
      Some(total)
    }
    _ => None,
  }
}

fn normalize_deref(far: bool, size: u8, addr: Operand) -> Operand {
  // *(a + b) and *(a + b * k) are indexed accesses.
  if let Operand::Binary(BinaryOp::Addition, a, b) = addr {
    if let Operand::Binary(BinaryOp::Multiplication, s, k) = *b {
      if let Operand::Integer { value, .. } = *k {
        if let Ok(scale) = u32::try_from(value) {
          return Operand::Index {
            far, size, subscript_scale: scale, operand: a, subscript: s,
          }
        }
        return Operand::Index {
          far, size, subscript_scale: 1, operand: a,
          subscript: Box::new(Operand::Binary(BinaryOp::Multiplication, s, k)),
        }
      }
      return Operand::Index {
        far, size, subscript_scale: 1, operand: a,
        subscript: Box::new(Operand::Binary(BinaryOp::Multiplication, s, k)),
      }
    }
    return Operand::Index { far, size, subscript_scale: 1, operand: a, subscript: b }
  }
  Operand::Dereference { far, size, operand: Box::new(addr) }
}

/// An address-valued operand: the base of a dereference or index.
fn create_address(
  defs: &IdxVec<DefId, Definition>, e: &Expr, placeholder: i128,
) -> Option<Operand> {
  match &e.kind {
    ExprKind::Int(v) => Some(Operand::int(*v)),
    ExprKind::Resolved { def, .. } => match &defs[*def].kind {
      DefKind::BuiltinRegister { .. } => Some(Operand::Register(*def)),
      DefKind::Var { .. } | DefKind::Func { .. } | DefKind::Label { .. } =>
        Some(addr_operand(defs, *def, placeholder)),
      _ => None,
    },
    ExprKind::Cast { value, .. } => create_address(defs, value, placeholder),
    ExprKind::Unary(UnaryOp::Grouping, inner) => create_address(defs, inner, placeholder),
    ExprKind::Unary(UnaryOp::AddressOf | UnaryOp::FarAddressOf, inner) =>
      create_address(defs, inner, placeholder),
    ExprKind::Unary(op @ (UnaryOp::PostIncrement | UnaryOp::PostDecrement), inner) =>
      Some(Operand::Unary(*op, Box::new(create_address(defs, inner, placeholder)?))),
    ExprKind::Binary(op @ (BinaryOp::Addition | BinaryOp::Subtraction
      | BinaryOp::Multiplication), l, r) =>
    {
      let l = create_address(defs, l, placeholder)?;
      let r = create_address(defs, r, placeholder)?;
      if let (Operand::Integer { value: a, placeholder: pa },
        Operand::Integer { value: b, placeholder: pb }) = (&l, &r)
      {
        let value = match op {
          BinaryOp::Addition => a.checked_add(*b)?,
          BinaryOp::Subtraction => a.checked_sub(*b)?,
          _ => a.checked_mul(*b)?,
        };
        return Some(Operand::Integer { value, placeholder: *pa || *pb })
      }
      Some(Operand::Binary(*op, Box::new(l), Box::new(r)))
    }
    _ => create_operand(defs, e, placeholder),
  }
}

/// Produce an [`Operand`] tree from an analysed expression, or `None` when
/// the expression has no operand form.
pub(crate) fn create_operand(
  defs: &IdxVec<DefId, Definition>, e: &Expr, placeholder: i128,
) -> Option<Operand> {
  match &e.kind {
    ExprKind::Int(v) => Some(Operand::int(*v)),
    ExprKind::Bool(b) => Some(Operand::Boolean { value: *b }),
    ExprKind::Resolved { def, .. } => match &defs[*def].kind {
      DefKind::BuiltinRegister { .. } => Some(Operand::Register(*def)),
      DefKind::Func { .. } | DefKind::Label { .. } =>
        Some(addr_operand(defs, *def, placeholder)),
      DefKind::Var { quals, ty, size, .. } => {
        // A variable reference reads its storage.
        let size = match ty {
          Some(TypeExpr { kind: TypeExprKind::Array { elem, .. }, .. }) =>
            type_size(defs, elem)?,
          Some(ty) => type_size(defs, ty).or(*size)?,
          None => (*size)?,
        };
        Some(Operand::Dereference {
          far: quals.contains(Qualifiers::FAR),
          size: u8::try_from(size).ok()?,
          operand: Box::new(addr_operand(defs, *def, placeholder)),
        })
      }
      _ => None,
    },
    ExprKind::Cast { value, .. } => create_operand(defs, value, placeholder),
    ExprKind::Unary(UnaryOp::Grouping, inner) => create_operand(defs, inner, placeholder),
    ExprKind::Unary(UnaryOp::Indirection, inner) => {
      let size = u8::try_from(type_size(defs, &e.info().ty)?).ok()?;
      let far = matches!(&inner.info().ty.kind,
        TypeExprKind::Pointer { quals, .. } if quals.contains(Qualifiers::FAR));
      let addr = create_address(defs, inner, placeholder)?;
      Some(normalize_deref(far, size, addr))
    }
    ExprKind::Binary(BinaryOp::Indexing, base, subscript) => {
      let elem_size = type_size(defs, &e.info().ty)?;
      let far = base.info().quals.contains(Qualifiers::FAR);
      let base = create_address(defs, base, placeholder)?;
      let subscript = create_operand(defs, subscript, placeholder)?;
      Some(Operand::Index {
        far,
        size: u8::try_from(elem_size).ok()?,
        subscript_scale: elem_size,
        operand: Box::new(base),
        subscript: Box::new(subscript),
      })
    }
    ExprKind::Binary(BinaryOp::BitIndexing, value, subscript) => Some(Operand::BitIndex {
      operand: Box::new(create_operand(defs, value, placeholder)?),
      subscript: Box::new(create_operand(defs, subscript, placeholder)?),
    }),
    ExprKind::Unary(op @ (UnaryOp::PostIncrement | UnaryOp::PostDecrement), inner) =>
      Some(Operand::Unary(*op, Box::new(create_operand(defs, inner, placeholder)?))),
    ExprKind::Unary(UnaryOp::AddressOf | UnaryOp::FarAddressOf, inner) =>
      create_address(defs, inner, placeholder),
    ExprKind::Unary(op @ (UnaryOp::LowByte | UnaryOp::HighByte | UnaryOp::BankByte), inner) => {
      match create_operand(defs, inner, placeholder)? {
        Operand::Integer { value, placeholder: ph } => {
          let shifted = match op {
            UnaryOp::LowByte => value & 0xFF,
            UnaryOp::HighByte => (value >> 8) & 0xFF,
            _ => (value >> 16) & 0xFF,
          };
          Some(Operand::Integer { value: shifted, placeholder: ph })
        }
        _ => None,
      }
    }
    ExprKind::Binary(op @ (BinaryOp::Addition | BinaryOp::Subtraction), l, r) => {
      // Link-time address arithmetic folds once both sides are addresses.
      let l = create_operand(defs, l, placeholder)?;
      let r = create_operand(defs, r, placeholder)?;
      if let (Operand::Integer { value: a, placeholder: pa },
        Operand::Integer { value: b, placeholder: pb }) = (&l, &r)
      {
        let value = if *op == BinaryOp::Addition {
          a.checked_add(*b)?
        } else {
          a.checked_sub(*b)?
        };
        return Some(Operand::Integer { value, placeholder: *pa || *pb })
      }
      Some(Operand::Binary(*op, Box::new(l), Box::new(r)))
    }
    _ => None,
  }
}

/// Generate one function in the given mode. In `Size` mode only the byte
/// count is computed; `Check` and `Emit` also produce bytes.
pub(crate) fn generate_function(c: &mut Compiler, func: DefId, mode: GenMode) -> GenOutput {
  let (body, interrupt, fallthrough, start) = match &mut c.defs[func].kind {
    DefKind::Func { body, interrupt, fallthrough, address, .. } =>
      (body.take(), *interrupt, *fallthrough, address.absolute.unwrap_or(0)),
    _ => return GenOutput::default(),
  };
  let Some(body) = body else { return GenOutput::default() };

  let placeholder = placeholder_for(c);
  let mut cg = CodeGen {
    c, mode, placeholder,
    pc: start, start,
    buf: vec![],
    widened_any: false,
    seq: HashMap::new(),
    loops: vec![],
    interrupt,
  };
  cg.gen_stmt(&body);
  if !fallthrough && !stmt_returns(&body) {
    cg.emit_plain_return(body.loc);
  }
  let out = GenOutput { size: cg.pc - cg.start, widened_any: cg.widened_any, bytes: cg.buf };
  if let DefKind::Func { body: slot, .. } = &mut c.defs[func].kind { *slot = Some(body) }
  out
}

/// The platform placeholder, truncated to the pointer width so it matches
/// the same address patterns a resolved value would.
pub(crate) fn placeholder_for(c: &Compiler) -> i128 {
  let ptr = c.platform.pointer_sized_type();
  let bits = match c.defs[ptr].kind {
    DefKind::BuiltinIntegerType { size, .. } => u32::from(size) * 8,
    _ => 16,
  };
  c.platform.placeholder_value() & ((1_i128 << bits) - 1)
}

/// Whether control cannot fall off the end of this statement.
fn stmt_returns(stmt: &Stmt) -> bool {
  match &stmt.kind {
    StmtKind::Block(items) => items.last().is_some_and(stmt_returns),
    StmtKind::Branch { kind, condition, .. } => condition.is_none()
      && matches!(kind, BranchKind::Return | BranchKind::IrqReturn | BranchKind::NmiReturn
        | BranchKind::Goto | BranchKind::FarGoto | BranchKind::FarReturn),
    _ => false,
  }
}

/// Emit every placed definition of every stored bank into its byte buffer.
pub(crate) fn emit_banks(c: &mut Compiler) {
  for bank_index in 0..c.banks.len() {
    let bank_id = BankId(bank_index as u32);
    if !c.banks[bank_id].kind.stored() { continue }
    let placed = c.banks[bank_id].placed.clone();
    for def in placed {
      match &c.defs[def].kind {
        DefKind::Func { .. } => {
          let out = generate_function(c, def, GenMode::Emit);
          c.banks[bank_id].data.extend_from_slice(&out.bytes);
        }
        DefKind::Var { .. } => {
          let bytes = serialize_variable(c, def);
          c.banks[bank_id].data.extend_from_slice(&bytes);
        }
        _ => {}
      }
    }
  }
}

/// Serialise a variable's initialiser into bytes, little-endian by type
/// size; an absent initialiser zero-fills.
fn serialize_variable(c: &mut Compiler, def: DefId) -> Vec<u8> {
  let (value, ty, size) = match &c.defs[def].kind {
    DefKind::Var { value, ty, size, .. } => (value.clone(), ty.clone(), size.unwrap_or(0)),
    _ => return vec![],
  };
  let Some(value) = value else { return vec![0; size as usize] };
  let Some(ty) = ty else { return vec![0; size as usize] };
  let mut out = Vec::with_capacity(size as usize);
  serialize_expr(c, &value, &ty, &mut out);
  // The declared type's storage bounds the image.
  out.resize(size as usize, 0);
  out
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn serialize_expr(c: &mut Compiler, e: &Expr, ty: &TypeExpr, out: &mut Vec<u8>) {
  let placeholder = placeholder_for(c);
  match (&e.kind, &ty.kind) {
    (ExprKind::Int(v), _) => {
      let size = type_size(&c.defs, ty).unwrap_or(1);
      let raw = *v as u128;
      for i in 0..size { out.push((raw >> (8 * i)) as u8) }
    }
    (ExprKind::Bool(b), _) => out.push((*b).into()),
    (ExprKind::String(bytes), _) => out.extend_from_slice(bytes),
    (ExprKind::Array(items), TypeExprKind::Array { elem, .. }) => {
      for item in items { serialize_expr(c, item, elem, out) }
    }
    (ExprKind::Tuple(items), TypeExprKind::Tuple(tys)) => {
      for (item, item_ty) in items.iter().zip(tys) { serialize_expr(c, item, item_ty, out) }
    }
    (ExprKind::Resolved { .. } | ExprKind::Unary(UnaryOp::AddressOf, _), _) => {
      // An address-valued constant, e.g. a jump table entry.
      match create_operand(&c.defs, e, placeholder) {
        Some(Operand::Integer { value, placeholder: false }) => {
          let size = type_size(&c.defs, ty)
            .or_else(|| match c.defs[c.platform.pointer_sized_type()].kind {
              DefKind::BuiltinIntegerType { size, .. } => Some(size.into()),
              _ => None,
            }).unwrap_or(2);
          for i in 0..size { out.push((value as u128 >> (8 * i)) as u8) }
        }
        _ => c.report.error("constant data could not be resolved to an address", e.loc),
      }
    }
    _ => c.report.error("expression cannot be stored as constant data", e.loc),
  }
}

struct CodeGen<'a> {
  c: &'a mut Compiler,
  mode: GenMode,
  placeholder: i128,
  pc: u32,
  start: u32,
  buf: Vec<u8>,
  widened_any: bool,
  /// Per-statement counters giving internal labels and branch sites a
  /// deterministic identity across layout rounds.
  seq: HashMap<NodeId, u32>,
  loops: Vec<LoopFrame>,
  interrupt: InterruptKind,
}

impl CodeGen<'_> {
  /// Report a lowering diagnostic. Generation runs once per layout round,
  /// so user-facing errors are raised only in the final emit run; the
  /// size and check runs stay silent and just keep sizes consistent.
  fn error(&mut self, message: impl Into<String>, loc: SourceLoc) {
    if self.mode == GenMode::Emit {
      self.c.report.error(message, loc);
    }
  }

  fn fresh_key(&mut self, id: NodeId) -> (NodeId, u32) {
    let seq = self.seq.entry(id).or_insert(0);
    let key = (id, *seq);
    *seq += 1;
    key
  }

  /// The definition standing for an internal label, created on first use
  /// and reused by identity across layout rounds.
  fn internal_label(&mut self, key: (NodeId, u32)) -> DefId {
    if let Some(&def) = self.c.internal_labels.get(&key) { return def }
    let name = self.c.interner.intern("$label");
    let def = self.c.defs.push(Definition {
      name,
      decl: key.0,
      loc: self.c.builtins.internal_loc,
      parent_scope: None,
      kind: DefKind::Label { address: crate::bank::Address::default() },
    });
    self.c.internal_labels.insert(key, def);
    def
  }

  fn bind_label(&mut self, def: DefId) {
    let pc = self.pc;
    if let DefKind::Label { address } | DefKind::Func { address, .. } =
      &mut self.c.defs[def].kind
    {
      address.absolute = Some(pc);
    }
  }

  fn operand(&self, e: &Expr) -> Option<Operand> {
    create_operand(&self.c.defs, e, self.placeholder)
  }

  fn dest_operand(&self, dest: &Dest) -> Operand {
    match dest {
      Dest::Def(def) => addr_operand(&self.c.defs, *def, self.placeholder),
      Dest::Fixed(op) => op.clone(),
    }
  }

  fn describe(&self, roots: &[Operand]) -> Vec<String> {
    roots.iter()
      .map(|op| op.display(&self.c.defs, &self.c.interner).to_string())
      .collect()
  }

  fn no_instruction(&mut self, ty: InstType, roots: &[Operand], loc: SourceLoc) {
    let parts = self.describe(roots);
    let message = match ty {
      InstType::Binary(BinaryOp::Assignment) if parts.len() >= 2 =>
        format!("no instruction matches `{} = {}`", parts[0], parts[1]),
      InstType::Binary(op) if parts.len() >= 2 =>
        format!("no instruction matches `{} {} {}`", parts[0], op.symbol(), parts[1]),
      InstType::Unary(op) if !parts.is_empty() =>
        format!("no instruction matches `{}{}`", op.symbol(), parts[0]),
      InstType::Branch(kind) => format!("no instruction matches `{}`", match kind {
        BranchKind::Goto => "goto",
        BranchKind::Call => "call",
        BranchKind::Return => "return",
        BranchKind::IrqReturn => "irqreturn",
        BranchKind::NmiReturn => "nmireturn",
        _ => "branch",
      }),
      InstType::VoidIntrinsic(def) | InstType::LoadIntrinsic(def) =>
        format!("no instruction matches `{}({})`",
          self.c.interner.get(self.c.defs[def].name), parts.join(", ")),
      _ => "no instruction matches the operands".to_owned(),
    };
    self.error(message, loc);
  }

  /// The index of a branch site in the widening set, allocated on first
  /// use.
  fn widen_index(&mut self, site: (NodeId, u32)) -> usize {
    let next = self.c.widen_index.len();
    *self.c.widen_index.entry(site).or_insert(next)
  }

  /// The distance operand for a branch: an explicit user hint wins;
  /// otherwise an auto site starts near and stays widened once widened.
  fn effective_distance(&mut self, explicit: Option<u32>, site: (NodeId, u32)) -> i128 {
    if let Some(d) = explicit { return d.into() }
    let index = self.widen_index(site);
    i128::from(self.c.widened.contains(index))
  }

  fn select(&self, ty: InstType, roots: &[Operand]) -> Option<crate::inst::InstId> {
    self.c.builtins.registry.select(ty, self.c.mode_flags, roots)
  }

  /// Select and emit one instruction. `widen_site` is present for branch
  /// instructions whose distance may be auto-widened.
  fn emit_selected(
    &mut self, ty: InstType, roots: &[Operand], loc: SourceLoc,
    widen_site: Option<((NodeId, u32), Option<u32>)>,
  ) -> bool {
    let Some(inst_id) = self.select(ty, roots) else {
      self.no_instruction(ty, roots, loc);
      return false
    };
    let (options, encoding) = {
      let inst = &self.c.builtins.registry.instructions[inst_id];
      (inst.options.clone(), self.c.builtins.registry.encodings[inst.encoding])
    };
    let mut lists = CaptureLists::new();
    let extracted =
      self.c.builtins.registry.instructions[inst_id].signature.extract(roots, &mut lists);
    debug_assert!(extracted, "matched signature must extract");
    let size = (encoding.size)(&options, &lists) as u32;

    if self.mode != GenMode::Size {
      let mut em = Emitter { buf: &mut self.buf, address: self.pc };
      if let Err(err) = (encoding.write)(&mut em, &options, &lists) {
        match (self.mode, err) {
          (GenMode::Check, EncodeError::RelativeOutOfRange { .. }) => {
            // Widen the site if layout is still allowed to choose.
            if let Some((site, None)) = widen_site {
              let index = self.widen_index(site);
              if self.c.widened.insert(index) {
                log::debug!("widening branch site {site:?}");
                self.widened_any = true;
              }
            }
          }
          (GenMode::Check, _) => {}
          (GenMode::Emit, err) => self.error(err.to_string(), loc),
          (GenMode::Size, _) => unreachable!("size mode does not encode"),
        }
      }
    }
    self.pc += size;
    true
  }

  fn try_emit(&mut self, ty: InstType, roots: &[Operand], loc: SourceLoc) -> bool {
    if self.select(ty, roots).is_some() {
      self.emit_selected(ty, roots, loc, None)
    } else {
      false
    }
  }

  fn emit_goto(
    &mut self, dest: &Dest, distance: Option<u32>, site: (NodeId, u32), loc: SourceLoc,
  ) {
    let d = self.effective_distance(distance, site);
    let roots = [Operand::int(d), self.dest_operand(dest)];
    self.emit_selected(InstType::Branch(BranchKind::Goto), &roots, loc,
      Some((site, distance)));
  }

  fn emit_flag_branch(
    &mut self, dest: &Dest, flag: DefId, value: bool,
    distance: Option<u32>, site: (NodeId, u32), loc: SourceLoc,
  ) {
    let d = self.effective_distance(distance, site);
    let roots = [
      Operand::int(d),
      self.dest_operand(dest),
      Operand::Register(flag),
      Operand::Boolean { value },
    ];
    self.emit_selected(InstType::Branch(BranchKind::Goto), &roots, loc,
      Some((site, distance)));
  }

  fn emit_plain_return(&mut self, loc: SourceLoc) {
    let kind = match self.interrupt {
      InterruptKind::None => BranchKind::Return,
      InterruptKind::Irq => BranchKind::IrqReturn,
      InterruptKind::Nmi => BranchKind::NmiReturn,
    };
    let roots = [Operand::int(0)];
    self.emit_selected(InstType::Branch(kind), &roots, loc, None);
  }

  // Statements.

  fn gen_stmt(&mut self, stmt: &Stmt) {
    match &stmt.kind {
      StmtKind::Block(items) => for item in items { self.gen_stmt(item) },
      StmtKind::InternalDeclaration => {}
      StmtKind::Label { name, .. } => {
        if let Some(&def) = self.c.def_of.get(&(stmt.id, *name)) {
          self.bind_label(def);
        }
      }
      StmtKind::ExprStmt(e) => self.gen_expr_stmt(e),
      StmtKind::If { distance, condition, then, els } =>
        self.gen_if(stmt.id, *distance, condition, then, els.as_deref()),
      StmtKind::While { distance, condition, body } =>
        self.gen_while(stmt.id, *distance, condition, body),
      StmtKind::DoWhile { distance, body, condition } =>
        self.gen_do_while(stmt.id, *distance, body, condition),
      StmtKind::For { distance, counter, seq, body } =>
        self.gen_for(stmt.id, *distance, counter, seq, body),
      StmtKind::Branch { kind, distance, condition, destination, return_value } =>
        self.gen_branch(stmt.id, *kind, *distance, condition.as_deref(),
          destination.as_deref(), return_value.as_deref(), stmt.loc),
      _ => self.error("statement cannot be lowered", stmt.loc),
    }
  }

  fn gen_if(
    &mut self, id: NodeId, distance: Option<u32>,
    condition: &Expr, then: &Stmt, els: Option<&Stmt>,
  ) {
    match condition.as_bool() {
      Some(true) => return self.gen_stmt(then),
      Some(false) => return if let Some(els) = els { self.gen_stmt(els) },
      None => {}
    }
    let else_label = { let key = self.fresh_key(id); self.internal_label(key) };
    self.gen_condition(condition, true, &Dest::Def(else_label), distance, id, condition.loc);
    self.gen_stmt(then);
    match els {
      Some(els) => {
        let end_label = { let key = self.fresh_key(id); self.internal_label(key) };
        let site = self.fresh_key(id);
        self.emit_goto(&Dest::Def(end_label), distance, site, els.loc);
        self.bind_label(else_label);
        self.gen_stmt(els);
        self.bind_label(end_label);
      }
      None => self.bind_label(else_label),
    }
  }

  fn gen_while(
    &mut self, id: NodeId, distance: Option<u32>, condition: &Expr, body: &Stmt,
  ) {
    if condition.as_bool() == Some(false) { return }
    let top = { let key = self.fresh_key(id); self.internal_label(key) };
    let exit = { let key = self.fresh_key(id); self.internal_label(key) };
    self.bind_label(top);
    if condition.as_bool() != Some(true) {
      self.gen_condition(condition, true, &Dest::Def(exit), distance, id, condition.loc);
    }
    self.loops.push(LoopFrame { break_label: exit, continue_label: top });
    self.gen_stmt(body);
    self.loops.pop();
    let site = self.fresh_key(id);
    self.emit_goto(&Dest::Def(top), distance, site, body.loc);
    self.bind_label(exit);
  }

  fn gen_do_while(
    &mut self, id: NodeId, distance: Option<u32>, body: &Stmt, condition: &Expr,
  ) {
    let top = { let key = self.fresh_key(id); self.internal_label(key) };
    let test = { let key = self.fresh_key(id); self.internal_label(key) };
    let exit = { let key = self.fresh_key(id); self.internal_label(key) };
    self.bind_label(top);
    self.loops.push(LoopFrame { break_label: exit, continue_label: test });
    self.gen_stmt(body);
    self.loops.pop();
    self.bind_label(test);
    if condition.as_bool() == Some(true) {
      let site = self.fresh_key(id);
      self.emit_goto(&Dest::Def(top), distance, site, condition.loc);
    } else if condition.as_bool() != Some(false) {
      self.gen_condition(condition, false, &Dest::Def(top), distance, id, condition.loc);
    }
    self.bind_label(exit);
  }

  fn gen_for(
    &mut self, id: NodeId, distance: Option<u32>, counter: &Expr, seq: &Expr, body: &Stmt,
  ) {
    let ExprKind::Range { start, end, step } = &seq.kind else {
      self.error("`for` requires a range or compile-time sequence", seq.loc);
      return
    };
    let Some(end) = end else {
      self.error("`for` range needs an end", seq.loc);
      return
    };
    let step_value = step.as_ref().map_or(Some(1), |s| s.as_int());
    let loc = seq.loc;

    // counter = start
    if let Some(start) = start {
      self.gen_assignment(counter, start, loc);
    }
    let top = { let key = self.fresh_key(id); self.internal_label(key) };
    let step_label = { let key = self.fresh_key(id); self.internal_label(key) };
    let exit = { let key = self.fresh_key(id); self.internal_label(key) };
    self.bind_label(top);
    // Ranges are half-open: exit when the counter reaches the end.
    let test = Expr::analyzed(
      ExprKind::Binary(BinaryOp::Equal, Box::new(counter.clone()), end.clone()),
      loc, crate::types::ast::ExprInfo {
        ctx: crate::types::ast::EvalCtx::RunTime,
        ty: TypeExpr::new(TypeExprKind::Resolved(self.c.builtins.bool_type), loc),
        quals: Qualifiers::empty(),
      });
    self.gen_condition(&test, false, &Dest::Def(exit), distance, id, loc);
    self.loops.push(LoopFrame { break_label: exit, continue_label: step_label });
    self.gen_stmt(body);
    self.loops.pop();
    self.bind_label(step_label);
    let counter_op = self.operand(counter);
    let mut stepped = false;
    if let Some(op) = &counter_op {
      if step_value == Some(1) {
        stepped = self.try_emit(InstType::Unary(UnaryOp::PreIncrement),
          std::slice::from_ref(op), loc);
      } else if step_value == Some(-1) {
        stepped = self.try_emit(InstType::Unary(UnaryOp::PreDecrement),
          std::slice::from_ref(op), loc);
      }
    }
    if !stepped {
      let step_expr = step.as_deref().cloned()
        .unwrap_or_else(|| Expr::analyzed(ExprKind::Int(1), loc,
          crate::types::ast::ExprInfo {
            ctx: crate::types::ast::EvalCtx::CompileTime,
            ty: TypeExpr::new(
              TypeExprKind::Resolved(self.c.builtins.iexpr_type), loc),
            quals: Qualifiers::empty(),
          }));
      let bump = Expr::analyzed(
        ExprKind::Binary(BinaryOp::Addition, Box::new(counter.clone()),
          Box::new(step_expr)),
        loc, counter.info().clone());
      self.gen_assignment(counter, &bump, loc);
    }
    let site = self.fresh_key(id);
    self.emit_goto(&Dest::Def(top), distance, site, loc);
    self.bind_label(exit);
  }

  #[allow(clippy::too_many_arguments)]
  fn gen_branch(
    &mut self, id: NodeId, kind: BranchKind, distance: Option<u32>,
    condition: Option<&Expr>, destination: Option<&Expr>, return_value: Option<&Expr>,
    loc: SourceLoc,
  ) {
    // break/continue retarget to the innermost loop's labels.
    let dest = match kind {
      BranchKind::Break | BranchKind::Continue => {
        let Some(frame) = self.loops.last() else {
          self.error(
            if kind == BranchKind::Break { "`break` outside of a loop" }
            else { "`continue` outside of a loop" }, loc);
          return
        };
        Some(Dest::Def(if kind == BranchKind::Break { frame.break_label }
          else { frame.continue_label }))
      }
      _ => match destination {
        Some(e) => match e.as_resolved() {
          Some(def) => Some(Dest::Def(def)),
          None => match self.operand(e) {
            Some(op) => Some(Dest::Fixed(op)),
            None => {
              self.error("branch destination cannot be computed", e.loc);
              return
            }
          }
        },
        None => None,
      }
    };

    // `return f();` is a tail call.
    if let Some(value) = return_value {
      if let ExprKind::Call { callee, .. } = &value.kind {
        if let Some(def) = callee.as_resolved() {
          let tail = Dest::Def(def);
          match condition {
            Some(cond) =>
              self.gen_condition(cond, false, &tail, distance, id, loc),
            None => {
              let site = self.fresh_key(id);
              self.emit_goto(&tail, distance, site, loc);
            }
          }
          return
        }
      }
      self.error(
        "return value must already be in a register; use a tail call or assign it first",
        value.loc);
      return
    }

    let goto_like = matches!(kind,
      BranchKind::Goto | BranchKind::Break | BranchKind::Continue);
    match condition {
      Some(cond) if goto_like => {
        let dest = dest.expect("goto has a destination");
        self.gen_condition(cond, false, &dest, distance, id, loc);
      }
      Some(cond) => {
        // Conditional call/return: branch over the unconditional form.
        let skip = { let key = self.fresh_key(id); self.internal_label(key) };
        self.gen_condition(cond, true, &Dest::Def(skip), distance, id, loc);
        self.gen_unconditional(kind, dest.as_ref(), distance, id, loc);
        self.bind_label(skip);
      }
      None => self.gen_unconditional(kind, dest.as_ref(), distance, id, loc),
    }
  }

  fn gen_unconditional(
    &mut self, kind: BranchKind, dest: Option<&Dest>, distance: Option<u32>,
    id: NodeId, loc: SourceLoc,
  ) {
    let kind = match (kind, self.interrupt) {
      (BranchKind::Return, InterruptKind::Irq) => BranchKind::IrqReturn,
      (BranchKind::Return, InterruptKind::Nmi) => BranchKind::NmiReturn,
      (kind, _) => kind,
    };
    let site = self.fresh_key(id);
    match dest {
      Some(dest) => {
        let d = self.effective_distance(distance, site);
        let roots = [Operand::int(d), self.dest_operand(dest)];
        self.emit_selected(InstType::Branch(kind), &roots, loc, Some((site, distance)));
      }
      None => {
        let d = self.effective_distance(distance, site);
        let roots = [Operand::int(d)];
        self.emit_selected(InstType::Branch(kind), &roots, loc, Some((site, distance)));
      }
    }
  }

  // Conditions.

  /// Emit a branch to `dest` taken when the condition (negated if
  /// `negate`) holds, short-circuiting `&&`/`||` with internal labels and
  /// lowering relational tests through the platform oracle.
  #[allow(clippy::too_many_lines)]
  fn gen_condition(
    &mut self, cond: &Expr, negate: bool, dest: &Dest, distance: Option<u32>,
    id: NodeId, loc: SourceLoc,
  ) {
    match &cond.kind {
      ExprKind::Bool(b) => {
        if *b != negate {
          let site = self.fresh_key(id);
          self.emit_goto(dest, distance, site, loc);
        }
      }
      ExprKind::Unary(UnaryOp::LogicalNegation, inner) => {
        // `!flag` has a direct branch form; other negations flip polarity.
        if let Some(flag) = inner.as_resolved() {
          if matches!(self.c.defs[flag].kind, DefKind::BuiltinRegister { .. }) {
            let site = self.fresh_key(id);
            return self.emit_flag_branch(dest, flag, negate, distance, site, loc)
          }
        }
        self.gen_condition(inner, !negate, dest, distance, id, loc);
      }
      ExprKind::Unary(UnaryOp::Grouping, inner) =>
        self.gen_condition(inner, negate, dest, distance, id, loc),
      ExprKind::Binary(BinaryOp::LogicalAnd, a, b) if !negate => {
        let skip = { let key = self.fresh_key(id); self.internal_label(key) };
        self.gen_condition(a, true, &Dest::Def(skip), distance, id, loc);
        self.gen_condition(b, false, dest, distance, id, loc);
        self.bind_label(skip);
      }
      ExprKind::Binary(BinaryOp::LogicalAnd, a, b) => {
        // !(a && b) == !a || !b
        self.gen_condition(a, true, dest, distance, id, loc);
        self.gen_condition(b, true, dest, distance, id, loc);
      }
      ExprKind::Binary(BinaryOp::LogicalOr, a, b) if !negate => {
        self.gen_condition(a, false, dest, distance, id, loc);
        self.gen_condition(b, false, dest, distance, id, loc);
      }
      ExprKind::Binary(BinaryOp::LogicalOr, a, b) => {
        // !(a || b) == !a && !b
        let skip = { let key = self.fresh_key(id); self.internal_label(key) };
        self.gen_condition(a, false, &Dest::Def(skip), distance, id, loc);
        self.gen_condition(b, true, dest, distance, id, loc);
        self.bind_label(skip);
      }
      ExprKind::Resolved { def, .. }
        if matches!(self.c.defs[*def].kind, DefKind::BuiltinRegister { .. }) =>
      {
        let site = self.fresh_key(id);
        self.emit_flag_branch(dest, *def, !negate, distance, site, loc);
      }
      ExprKind::Binary(op, l, r)
        if op.is_comparison() || *op == BinaryOp::BitIndexing =>
        self.gen_comparison(*op, l, r, negate, dest, distance, id, loc),
      _ => self.error(
        "branch condition must be a comparison, a flag, or a boolean", loc),
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn gen_comparison(
    &mut self, op: BinaryOp, l: &Expr, r: &Expr, negate: bool, dest: &Dest,
    distance: Option<u32>, id: NodeId, loc: SourceLoc,
  ) {
    let (op, flip) = if negate {
      match op.logical_negation() {
        Some(negated) => (negated, false),
        // Bit tests have no negated operator; flip the flag value instead.
        None => (op, true),
      }
    } else {
      (op, false)
    };

    let ty_def = l.info().ty.as_resolved().unwrap_or(self.c.builtins.bool_type);
    let dist = distance.unwrap_or(0);

    enum Lowered {
      Tab(InstType, Vec<Operand>, smallvec::SmallVec<[crate::arch::FlagBranch; 2]>),
      MissingOperand,
      Refused,
    }
    let lowered = {
      let ctx = TestCtx {
        defs: &self.c.defs,
        builtins: &self.c.builtins,
        mode_flags: self.c.mode_flags,
        placeholder: self.placeholder,
      };
      match self.c.platform.test_and_branch(&ctx, &self.c.defs[ty_def], op, l, r, dist) {
        Some(tab) => {
          let mut roots = Vec::with_capacity(tab.operands.len());
          let mut missing = false;
          for e in &tab.operands {
            match create_operand(&self.c.defs, e, self.placeholder) {
              Some(operand) => roots.push(operand),
              None => { missing = true; break }
            }
          }
          if missing {
            Lowered::MissingOperand
          } else {
            Lowered::Tab(tab.test, roots, tab.branches.clone())
          }
        }
        None => Lowered::Refused,
      }
    };

    match lowered {
      Lowered::Tab(test, roots, branches) => {
        self.emit_selected(test, &roots, loc, None);
        let fall = { let key = self.fresh_key(id); self.internal_label(key) };
        for fb in &branches {
          let value = fb.value ^ flip;
          let site = self.fresh_key(id);
          if fb.success {
            self.emit_flag_branch(dest, fb.flag, value, distance, site, loc);
          } else {
            self.emit_flag_branch(&Dest::Def(fall), fb.flag, value, None, site, loc);
          }
        }
        self.bind_label(fall);
      }
      Lowered::MissingOperand => self.error(
        "comparison operand cannot be lowered to an instruction operand", loc),
      Lowered::Refused => self.error(
        format!("`{}` comparison cannot be lowered on this target", op.symbol()), loc),
    }
  }

  // Expression statements.

  fn gen_expr_stmt(&mut self, e: &Expr) {
    match &e.kind {
      ExprKind::Binary(BinaryOp::Assignment, lhs, rhs) =>
        self.gen_assignment(lhs, rhs, e.loc),
      ExprKind::Unary(op @ (UnaryOp::PreIncrement | UnaryOp::PreDecrement
        | UnaryOp::PostIncrement | UnaryOp::PostDecrement), x) =>
      {
        // Statement-level post-ops are the same operation as pre-ops.
        let op = match op {
          UnaryOp::PostIncrement => UnaryOp::PreIncrement,
          UnaryOp::PostDecrement => UnaryOp::PreDecrement,
          op => *op,
        };
        let Some(root) = self.operand(x) else {
          self.error("operand cannot be lowered", x.loc);
          return
        };
        self.emit_selected(InstType::Unary(op), &[root], e.loc, None);
      }
      ExprKind::Call { callee, args, inline } => self.gen_call(callee, args, *inline, e.loc),
      ExprKind::SideEffect { stmt, .. } => self.gen_stmt(stmt),
      _ => self.error("expression statement has no effect", e.loc),
    }
  }

  fn gen_call(&mut self, callee: &Expr, args: &[Expr], inline: bool, loc: SourceLoc) {
    let Some(def) = callee.as_resolved() else {
      self.error("expression is not callable", loc);
      return
    };
    match &self.c.defs[def].kind {
      DefKind::BuiltinVoidIntrinsic => {
        let mut roots = Vec::with_capacity(args.len());
        for arg in args {
          match self.operand(arg) {
            Some(op) => roots.push(op),
            None => {
              self.error("intrinsic operand cannot be lowered", arg.loc);
              return
            }
          }
        }
        self.emit_selected(InstType::VoidIntrinsic(def), &roots, loc, None);
      }
      DefKind::BuiltinLoadIntrinsic { .. } => {
        let name = self.c.interner.get(self.c.defs[def].name).to_owned();
        self.error(
          format!("the result of `{name}()` must be assigned"), loc);
      }
      DefKind::Func { inline: def_inline, body, .. } => {
        if inline || *def_inline {
          // Inline calls expand the callee body in place.
          let body = body.clone();
          match body {
            Some(body) => self.gen_stmt(&body),
            None => self.error("inline function has no body", loc),
          }
          return
        }
        let site = self.fresh_key(NodeId::INTERNAL);
        let d = self.effective_distance(None, site);
        let roots = [Operand::int(d), addr_operand(&self.c.defs, def, self.placeholder)];
        self.emit_selected(InstType::Branch(BranchKind::Call), &roots, loc,
          Some((site, None)));
      }
      _ => self.error("expression is not callable", loc),
    }
  }

  fn gen_assignment(&mut self, lhs: &Expr, rhs: &Expr, loc: SourceLoc) {
    if lhs.info().quals.contains(Qualifiers::CONST) {
      self.error("cannot assign to a constant", loc);
      return
    }
    if let Some(def) = rhs.as_resolved() {
      if rhs.info().quals.contains(Qualifiers::WRITEONLY)
        && matches!(self.c.defs[def].kind, DefKind::Var { .. })
      {
        self.error("cannot read a write-only location", rhs.loc);
        return
      }
    }
    let Some(lhs_op) = self.operand(lhs) else {
      self.error("assignment destination cannot be lowered", lhs.loc);
      return
    };

    // rhs = pop() and friends.
    if let ExprKind::Call { callee, args, .. } = &rhs.kind {
      if let Some(def) = callee.as_resolved() {
        if matches!(self.c.defs[def].kind, DefKind::BuiltinLoadIntrinsic { .. }) {
          let mut roots = vec![lhs_op];
          for arg in args {
            match self.operand(arg) {
              Some(op) => roots.push(op),
              None => {
                self.error("intrinsic operand cannot be lowered", arg.loc);
                return
              }
            }
          }
          self.emit_selected(InstType::LoadIntrinsic(def), &roots, loc, None);
          return
        }
      }
    }

    // Compound forms: `x = x op y` selects the operator instruction, and
    // `x = x ± 1` prefers increment/decrement.
    if let ExprKind::Binary(op, inner_l, inner_r) = &rhs.kind {
      if !op.is_comparison() && *op != BinaryOp::Assignment {
        if let Some(inner_l_op) = self.operand(inner_l) {
          if inner_l_op == lhs_op {
            if *op == BinaryOp::Addition && inner_r.as_int() == Some(1)
              && self.try_emit(InstType::Unary(UnaryOp::PreIncrement),
                std::slice::from_ref(&lhs_op), loc)
            { return }
            if *op == BinaryOp::Subtraction && inner_r.as_int() == Some(1)
              && self.try_emit(InstType::Unary(UnaryOp::PreDecrement),
                std::slice::from_ref(&lhs_op), loc)
            { return }
            if let Some(inner_r_op) = self.operand(inner_r) {
              let roots = [lhs_op.clone(), inner_r_op];
              if self.try_emit(InstType::Binary(*op), &roots, loc) { return }
            }
          }
          // Three-operand forms such as `hl = sp + dd`.
          if let Some(inner_r_op) = self.operand(inner_r) {
            let roots = [lhs_op.clone(), inner_l_op, inner_r_op];
            if self.try_emit(InstType::Binary(*op), &roots, loc) { return }
          }
        }
      }
    }

    let Some(rhs_op) = self.operand(rhs) else {
      let lhs_s = lhs_op.display(&self.c.defs, &self.c.interner).to_string();
      self.error(
        format!("no instruction matches `{lhs_s} = <expression>`"), loc);
      return
    };
    let roots = [lhs_op, rhs_op];
    if self.select(InstType::Binary(BinaryOp::Assignment), &roots).is_none()
      && self.decomposed_assignment(&roots[0], &roots[1], loc)
    { return }
    self.emit_selected(InstType::Binary(BinaryOp::Assignment), &roots, loc, None);
  }

  /// Split a wide-register move through the register's decomposition,
  /// lowest byte first, when no single instruction covers it.
  fn decomposed_assignment(&mut self, lhs: &Operand, rhs: &Operand, loc: SourceLoc) -> bool {
    fn parts_of(builtins: &crate::builtins::Builtins, op: &Operand) -> Option<Vec<DefId>> {
      if let Operand::Register(r) = op {
        builtins.find_register_decomposition(*r).map(<[DefId]>::to_vec)
      } else {
        None
      }
    }
    fn byte_of(op: &Operand, i: u8, count: usize) -> Option<Operand> {
      match op {
        Operand::Dereference { far, size, operand } if *size as usize == count => {
          if let Operand::Integer { value, placeholder } = **operand {
            Some(Operand::Dereference {
              far: *far, size: 1,
              operand: Box::new(Operand::Integer {
                value: value + i128::from(i), placeholder,
              }),
            })
          } else { None }
        }
        Operand::Integer { value, placeholder } => Some(Operand::Integer {
          value: (value >> (8 * i)) & 0xFF, placeholder: *placeholder,
        }),
        _ => None,
      }
    }

    if let Some(parts) = parts_of(&self.c.builtins, lhs) {
      let count = parts.len();
      let mut pieces = Vec::with_capacity(count);
      for (i, &part) in parts.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let Some(byte) = byte_of(rhs, i as u8, count) else { return false };
        pieces.push([Operand::Register(part), byte]);
      }
      if !pieces.iter().all(|roots|
        self.select(InstType::Binary(BinaryOp::Assignment), roots).is_some())
      { return false }
      for roots in &pieces {
        self.emit_selected(InstType::Binary(BinaryOp::Assignment), roots, loc, None);
      }
      return true
    }
    if let Some(parts) = parts_of(&self.c.builtins, rhs) {
      let count = parts.len();
      let mut pieces = Vec::with_capacity(count);
      for (i, &part) in parts.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let Some(byte) = byte_of(lhs, i as u8, count) else { return false };
        pieces.push([byte, Operand::Register(part)]);
      }
      if !pieces.iter().all(|roots|
        self.select(InstType::Binary(BinaryOp::Assignment), roots).is_some())
      { return false }
      for roots in &pieces {
        self.emit_selected(InstType::Binary(BinaryOp::Assignment), roots, loc, None);
      }
      return true
    }
    false
  }
}
