//! The reduction pass: resolves identifiers, folds constants with checked
//! 128-bit arithmetic, expands `let` macros and `inline for` loops, and
//! annotates every expression with its evaluation class and type.
//!
//! Reduction rebuilds trees instead of mutating them, so an expression's
//! annotation is written exactly once. Declarations are reduced in a first
//! sweep (banks, placement, data); function bodies in a second, so code can
//! refer to any top-level declaration regardless of file order.

use hashbrown::HashMap;

use crate::bank::{Address, Bank, BankId};
use crate::eval;
use crate::symbol::Symbol;
use crate::types::ast::{
  BinaryOp, EvalCtx, Expr, ExprInfo, ExprKind, Qualifiers, Stmt, StmtKind, StructKind, TypeExpr,
  TypeExprKind, TypeQueryKind, UnaryOp,
};
use crate::types::entity::{DefId, DefKind, Property, ScopeId};
use crate::types::SourceLoc;
use crate::Compiler;

/// Run the reduction pass.
pub(crate) fn run(c: &mut Compiler, program: &Stmt, files: &mut dyn crate::BinaryReader) {
  let root = c.root_scope.expect("declaration pass did not run");
  let mut r = Reducer { c, files, subst: vec![], pending_funcs: vec![] };
  r.reduce_declarations(root, program, None);
  let pending = std::mem::take(&mut r.pending_funcs);
  for (def, body, scope, bank) in pending {
    log::debug!("reducing function body of def {def:?}");
    let reduced = r.reduce_stmt(scope, body, bank);
    if let DefKind::Func { body, .. } = &mut r.c.defs[def].kind { *body = Some(reduced) }
  }
}

struct Reducer<'a, 'p> {
  c: &'a mut Compiler,
  files: &'a mut dyn crate::BinaryReader,
  /// Active substitutions from `let` macro expansion and `inline for`
  /// unrolling; innermost last.
  subst: Vec<HashMap<Symbol, Expr>>,
  pending_funcs: Vec<(DefId, &'p Stmt, ScopeId, Option<BankId>)>,
}

impl<'p> Reducer<'_, 'p> {
  fn name(&self, sym: Symbol) -> &str { self.c.interner.get(sym) }

  fn resolved_ty(&self, def: DefId, loc: SourceLoc) -> TypeExpr {
    TypeExpr::new(TypeExprKind::Resolved(def), loc)
  }

  fn int_expr(&self, value: i128, loc: SourceLoc) -> Expr {
    Expr::analyzed(ExprKind::Int(value), loc, ExprInfo {
      ctx: EvalCtx::CompileTime,
      ty: self.resolved_ty(self.c.builtins.iexpr_type, loc),
      quals: Qualifiers::empty(),
    })
  }

  fn bool_expr(&self, value: bool, loc: SourceLoc) -> Expr {
    Expr::analyzed(ExprKind::Bool(value), loc, ExprInfo {
      ctx: EvalCtx::CompileTime,
      ty: self.resolved_ty(self.c.builtins.bool_type, loc),
      quals: Qualifiers::empty(),
    })
  }

  /// A stand-in for expressions that failed to reduce; the error has
  /// already been reported.
  fn error_expr(&self, loc: SourceLoc) -> Expr { self.int_expr(0, loc) }

  fn describe_ty(&self, ty: &TypeExpr) -> String {
    match &ty.kind {
      TypeExprKind::Resolved(def) => self.name(self.c.defs[*def].name).to_owned(),
      TypeExprKind::Ident(pieces) =>
        itertools::Itertools::join(&mut pieces.iter().map(|&p| self.name(p)), "."),
      TypeExprKind::Array { elem, count } => match count {
        Some(count) if count.as_int().is_some() =>
          format!("[{}; {}]", self.describe_ty(elem), count.as_int().expect("checked")),
        _ => format!("[{}]", self.describe_ty(elem)),
      },
      TypeExprKind::Pointer { elem, quals } => {
        let mut s = String::from("*");
        if quals.contains(Qualifiers::FAR) { s.push_str("far ") }
        if quals.contains(Qualifiers::CONST) { s.push_str("const ") }
        if quals.contains(Qualifiers::WRITEONLY) { s.push_str("writeonly ") }
        s + &self.describe_ty(elem)
      }
      TypeExprKind::Tuple(items) => {
        let inner: Vec<String> = items.iter().map(|t| self.describe_ty(t)).collect();
        format!("({})", inner.join(", "))
      }
      TypeExprKind::Function { .. } => "func".to_owned(),
      TypeExprKind::TypeOf(..) => "typeof(..)".to_owned(),
    }
  }

  /// Walk up the scope chain for the first piece, then descend through
  /// member scopes for the rest.
  fn resolve(&mut self, scope: ScopeId, pieces: &[Symbol], loc: SourceLoc) -> Option<DefId> {
    let first = *pieces.first()?;
    let mut search = Some(scope);
    let mut def = None;
    while let Some(s) = search {
      if let Some(&d) = self.c.scopes[s].names.get(&first) { def = Some(d); break }
      search = self.c.scopes[s].parent;
    }
    let Some(mut def) = def else {
      let message = format!("undefined identifier `{}`", self.name(first));
      self.c.report.error(message, loc);
      return None
    };
    for &piece in &pieces[1..] {
      let Some(member_scope) = self.c.defs[def].member_scope() else {
        let message = format!("`{}` has no member `{}`",
          self.name(self.c.defs[def].name), self.name(piece));
        self.c.report.error(message, loc);
        return None
      };
      match self.c.scopes[member_scope].names.get(&piece) {
        Some(&d) => def = d,
        None => {
          let message = format!("`{}` has no member `{}`",
            self.name(self.c.defs[def].name), self.name(piece));
          self.c.report.error(message, loc);
          return None
        }
      }
    }
    Some(def)
  }

  fn reduce_ty(&mut self, scope: ScopeId, ty: &TypeExpr) -> TypeExpr {
    let loc = ty.loc;
    match &ty.kind {
      TypeExprKind::Resolved(..) => ty.clone(),
      TypeExprKind::Ident(pieces) => {
        let Some(def) = self.resolve(scope, pieces, loc) else { return ty.clone() };
        match &self.c.defs[def].kind {
          DefKind::TypeAlias { ty: target } => {
            let target = target.clone();
            let parent = self.c.defs[def].parent_scope.expect("alias has a scope");
            self.reduce_ty(parent, &target)
          }
          _ if self.c.defs[def].is_type() || matches!(self.c.defs[def].kind,
            DefKind::BuiltinBankType(..)) => self.resolved_ty(def, loc),
          _ => {
            let message = format!("`{}` is not a type", self.name(self.c.defs[def].name));
            self.c.report.error(message, loc);
            ty.clone()
          }
        }
      }
      TypeExprKind::Array { elem, count } => {
        let elem = Box::new(self.reduce_ty(scope, elem));
        let count = count.as_ref().map(|e| Box::new(self.reduce_expr(scope, e)));
        TypeExpr::new(TypeExprKind::Array { elem, count }, loc)
      }
      TypeExprKind::Pointer { elem, quals } => TypeExpr::new(TypeExprKind::Pointer {
        elem: Box::new(self.reduce_ty(scope, elem)), quals: *quals,
      }, loc),
      TypeExprKind::Tuple(items) => TypeExpr::new(TypeExprKind::Tuple(
        items.iter().map(|t| self.reduce_ty(scope, t)).collect()), loc),
      TypeExprKind::Function { params, ret } => TypeExpr::new(TypeExprKind::Function {
        params: params.iter().map(|t| self.reduce_ty(scope, t)).collect(),
        ret: Box::new(self.reduce_ty(scope, ret)),
      }, loc),
      TypeExprKind::TypeOf(e) => {
        let e = self.reduce_expr(scope, e);
        e.info().ty.clone()
      }
    }
  }

  /// The storage size of a type in bytes, or `None` (with a diagnostic)
  /// when the type has no storage representation.
  fn size_of(&mut self, ty: &TypeExpr, loc: SourceLoc) -> Option<u32> {
    match &ty.kind {
      TypeExprKind::Resolved(def) => match &self.c.defs[*def].kind {
        DefKind::BuiltinIntegerType { size, .. } => Some((*size).into()),
        DefKind::BuiltinBoolType => Some(1),
        DefKind::Enum { underlying, .. } => {
          let underlying = underlying.clone();
          self.size_of(&underlying, loc)
        }
        DefKind::Struct { kind, members, .. } => {
          let (kind, members) = (*kind, members.clone());
          let mut total = 0_u32;
          for member in members {
            let DefKind::StructMember { ty, .. } = &self.c.defs[member].kind
              else { unreachable!("struct member") };
            let member_ty = ty.clone();
            let size = self.size_of(&member_ty, loc)?;
            total = match kind {
              StructKind::Struct => total.checked_add(size)?,
              StructKind::Union => total.max(size),
            };
          }
          Some(total)
        }
        _ => {
          let message = format!("type `{}` has no size", self.describe_ty(ty));
          self.c.report.error(message, loc);
          None
        }
      },
      TypeExprKind::Array { elem, count } => {
        let elem = self.size_of(&elem.clone(), loc)?;
        let count = count.as_ref().and_then(|e| e.as_int());
        let Some(count) = count else {
          self.c.report.error("array type requires a compile-time length", loc);
          return None
        };
        u32::try_from(count).ok()?.checked_mul(elem)
      }
      TypeExprKind::Pointer { quals, .. } => {
        let ptr = if quals.contains(Qualifiers::FAR) {
          self.c.platform.far_pointer_sized_type()
        } else {
          self.c.platform.pointer_sized_type()
        };
        match self.c.defs[ptr].kind {
          DefKind::BuiltinIntegerType { size, .. } => Some(size.into()),
          _ => None,
        }
      }
      TypeExprKind::Tuple(items) => {
        let items = items.clone();
        let mut total = 0_u32;
        for item in items { total = total.checked_add(self.size_of(&item, loc)?)? }
        Some(total)
      }
      _ => {
        let message = format!("type `{}` has no size", self.describe_ty(ty));
        self.c.report.error(message, loc);
        None
      }
    }
  }

  /// The range and byte size of an integer type definition.
  fn int_type_info(&self, def: DefId) -> Option<(i128, i128, u8)> {
    match self.c.defs[def].kind {
      DefKind::BuiltinIntegerType { min, max, size } => Some((min, max, size)),
      _ => None,
    }
  }

  fn is_iexpr(&self, ty: &TypeExpr) -> bool {
    ty.as_resolved() == Some(self.c.builtins.iexpr_type)
  }

  /// Join the operand types of a binary operator. Compile-time integers
  /// adopt the sized type of the other side, with a range check when the
  /// value is known.
  fn unify(&mut self, l: &Expr, r: &Expr, loc: SourceLoc) -> TypeExpr {
    let lty = &l.info().ty;
    let rty = &r.info().ty;
    if lty.equivalent(rty) { return lty.clone() }
    if self.is_iexpr(lty) {
      let rty = rty.clone();
      self.check_fits(l, &rty);
      return rty
    }
    if self.is_iexpr(rty) {
      let lty = lty.clone();
      self.check_fits(r, &lty);
      return lty
    }
    let message = format!("mismatched types `{}` and `{}`",
      self.describe_ty(lty), self.describe_ty(rty));
    self.c.report.error(message, loc);
    lty.clone()
  }

  fn check_fits(&mut self, e: &Expr, ty: &TypeExpr) {
    if_chain::if_chain! {
      if let Some(value) = e.as_int();
      if let Some(def) = ty.as_resolved();
      if let Some((min, max, _)) = self.int_type_info(def);
      if value < min || value > max;
      then {
        let message = format!(
          "value `{value}` is out of range for type `{}` ({min}..{max})",
          self.name(self.c.defs[def].name));
        self.c.report.error(message, e.loc);
      }
    }
  }

  fn compute_enum_values(&mut self, members: &[DefId], scope: ScopeId) {
    let mut next = 0_i128;
    for &member in members {
      let init = match &self.c.defs[member].kind {
        DefKind::EnumMember { init, .. } => init.clone(),
        _ => unreachable!("enum member"),
      };
      let value = match init {
        Some(e) => {
          let reduced = self.reduce_expr(scope, &e);
          match reduced.as_int() {
            Some(v) => v,
            None => {
              self.c.report.error("enum member value must be a compile-time integer", e.loc);
              next
            }
          }
        }
        None => next,
      };
      next = value + 1;
      if let DefKind::EnumMember { value: slot, .. } = &mut self.c.defs[member].kind {
        *slot = Some(value);
      }
    }
  }

  fn enum_member_value(&mut self, def: DefId) -> i128 {
    if let DefKind::EnumMember { value: Some(v), .. } = self.c.defs[def].kind { return v }
    let owner = match self.c.defs[def].kind {
      DefKind::EnumMember { owner, .. } => owner,
      _ => unreachable!("enum member"),
    };
    let (members, scope) = match &self.c.defs[owner].kind {
      DefKind::Enum { member_scope, .. } => {
        let scope = *member_scope;
        let mut members: Vec<DefId> = self.c.scopes[scope].names.values().copied().collect();
        members.sort_unstable();
        (members, scope)
      }
      _ => unreachable!("enum owner"),
    };
    self.compute_enum_values(&members, scope);
    match self.c.defs[def].kind {
      DefKind::EnumMember { value: Some(v), .. } => v,
      _ => 0,
    }
  }

  #[allow(clippy::too_many_lines)]
  fn reduce_expr(&mut self, scope: ScopeId, e: &Expr) -> Expr {
    let loc = e.loc;
    match &e.kind {
      ExprKind::Int(value) => self.int_expr(*value, loc),
      ExprKind::Bool(value) => self.bool_expr(*value, loc),
      ExprKind::String(bytes) => {
        let count = Box::new(self.int_expr(bytes.len() as i128, loc));
        Expr::analyzed(ExprKind::String(bytes.clone()), loc, ExprInfo {
          ctx: EvalCtx::CompileTime,
          ty: TypeExpr::new(TypeExprKind::Array {
            elem: Box::new(self.resolved_ty(self.c.builtins.u8_type, loc)),
            count: Some(count),
          }, loc),
          quals: Qualifiers::CONST,
        })
      }
      ExprKind::Ident(pieces) => {
        if let &[name] = &pieces[..] {
          for map in self.subst.iter().rev() {
            if let Some(sub) = map.get(&name) {
              let mut sub = sub.clone();
              sub.loc = loc;
              return sub
            }
          }
        }
        let Some(def) = self.resolve(scope, pieces, loc) else { return self.error_expr(loc) };
        self.reduce_resolved(def, pieces.clone(), loc)
      }
      ExprKind::Resolved { def, pieces } => self.reduce_resolved(*def, pieces.clone(), loc),
      ExprKind::Binary(op, l, r) => self.reduce_binary(scope, *op, l, r, loc),
      ExprKind::Unary(op, x) => self.reduce_unary(scope, *op, x, loc),
      ExprKind::Call { inline, callee, args } => self.reduce_call(scope, *inline, callee, args, loc),
      ExprKind::Cast { value, ty } => {
        let value = self.reduce_expr(scope, value);
        let ty = self.reduce_ty(scope, ty);
        if_chain::if_chain! {
          if let Some(v) = value.as_int();
          if value.ctx() == EvalCtx::CompileTime;
          if let Some(def) = ty.as_resolved();
          if let Some((min, _, size)) = self.int_type_info(def);
          then {
            // Casts truncate rather than preserve value.
            let bits = u32::from(size) * 8;
            let truncated = if bits >= 128 { v } else {
              let mask = (1_i128 << bits) - 1;
              let raw = v & mask;
              if min < 0 && raw >= 1_i128 << (bits - 1) { raw - (1_i128 << bits) } else { raw }
            };
            return Expr::analyzed(ExprKind::Int(truncated), loc,
              ExprInfo { ctx: EvalCtx::CompileTime, ty, quals: Qualifiers::empty() })
          }
        }
        let info = ExprInfo { ctx: value.ctx(), ty: ty.clone(), quals: value.info().quals };
        Expr::analyzed(ExprKind::Cast { value: Box::new(value), ty }, loc, info)
      }
      ExprKind::TypeQuery { kind, ty } => {
        let ty = self.reduce_ty(scope, ty);
        match kind {
          TypeQueryKind::SizeOf => match self.size_of(&ty, loc) {
            Some(size) => self.int_expr(size.into(), loc),
            None => self.error_expr(loc),
          },
          // Storage on these targets is byte-granular.
          TypeQueryKind::AlignOf => self.int_expr(1, loc),
        }
      }
      ExprKind::OffsetOf { ty, field } => {
        let ty = self.reduce_ty(scope, ty);
        let Some((_, offset)) = self.member_of(&ty, *field, loc) else {
          return self.error_expr(loc)
        };
        self.int_expr(offset.into(), loc)
      }
      ExprKind::TypeOf(inner) => {
        let inner = self.reduce_expr(scope, inner);
        let ty = self.resolved_ty(self.c.builtins.typeof_type, loc);
        Expr::analyzed(ExprKind::TypeOf(Box::new(inner)), loc,
          ExprInfo { ctx: EvalCtx::CompileTime, ty, quals: Qualifiers::empty() })
      }
      ExprKind::Range { start, end, step } => {
        let start = start.as_ref().map(|x| Box::new(self.reduce_expr(scope, x)));
        let end = end.as_ref().map(|x| Box::new(self.reduce_expr(scope, x)));
        let step = step.as_ref().map(|x| Box::new(self.reduce_expr(scope, x)));
        let ctx = start.iter().chain(&end).chain(&step)
          .map(|x| x.ctx()).max().unwrap_or(EvalCtx::CompileTime);
        let ty = self.resolved_ty(self.c.builtins.range_type, loc);
        Expr::analyzed(ExprKind::Range { start, end, step }, loc,
          ExprInfo { ctx, ty, quals: Qualifiers::empty() })
      }
      ExprKind::Array(items) => {
        let items: Vec<Expr> = items.iter().map(|x| self.reduce_expr(scope, x)).collect();
        let ctx = items.iter().map(Expr::ctx).max().unwrap_or(EvalCtx::CompileTime);
        let elem = items.first().map_or_else(
          || self.resolved_ty(self.c.builtins.u8_type, loc),
          |x| x.info().ty.clone());
        let count = Box::new(self.int_expr(items.len() as i128, loc));
        let ty = TypeExpr::new(TypeExprKind::Array {
          elem: Box::new(elem), count: Some(count),
        }, loc);
        Expr::analyzed(ExprKind::Array(items), loc,
          ExprInfo { ctx, ty, quals: Qualifiers::empty() })
      }
      ExprKind::ArrayPad { value, count } => {
        let value = self.reduce_expr(scope, value);
        let count = self.reduce_expr(scope, count);
        let Some(n) = count.as_int().and_then(|n| usize::try_from(n).ok()) else {
          self.c.report.error("array pad count must be a compile-time integer", loc);
          return self.error_expr(loc)
        };
        let items = vec![value; n];
        self.reduce_expr(scope, &Expr::new(ExprKind::Array(items), loc))
      }
      ExprKind::ArrayComprehension { body, name, seq } => {
        let seq = self.reduce_expr(scope, seq);
        let Some(elements) = self.const_sequence(&seq) else {
          self.c.report.error("array comprehension requires a compile-time sequence", loc);
          return self.error_expr(loc)
        };
        let mut items = vec![];
        for element in elements {
          self.subst.push(HashMap::from_iter([(*name, element)]));
          items.push(self.reduce_expr(scope, body));
          self.subst.pop();
        }
        self.reduce_expr(scope, &Expr::new(ExprKind::Array(items), loc))
      }
      ExprKind::Tuple(items) => {
        let items: Vec<Expr> = items.iter().map(|x| self.reduce_expr(scope, x)).collect();
        let ctx = items.iter().map(Expr::ctx).max().unwrap_or(EvalCtx::CompileTime);
        let ty = TypeExpr::new(TypeExprKind::Tuple(
          items.iter().map(|x| x.info().ty.clone()).collect()), loc);
        Expr::analyzed(ExprKind::Tuple(items), loc,
          ExprInfo { ctx, ty, quals: Qualifiers::empty() })
      }
      ExprKind::StructLit { ty, items } => {
        let ty = self.reduce_ty(scope, ty);
        let items: Vec<(Symbol, Expr)> =
          items.iter().map(|(n, x)| (*n, self.reduce_expr(scope, x))).collect();
        let ctx = items.iter().map(|(_, x)| x.ctx()).max().unwrap_or(EvalCtx::CompileTime);
        Expr::analyzed(ExprKind::StructLit { ty: ty.clone(), items }, loc,
          ExprInfo { ctx, ty, quals: Qualifiers::empty() })
      }
      ExprKind::SideEffect { stmt, result } => {
        let stmt = Box::new(self.reduce_stmt(scope, stmt, None));
        let result = Box::new(self.reduce_expr(scope, result));
        let info = result.info().clone();
        Expr::analyzed(ExprKind::SideEffect { stmt, result }, loc,
          ExprInfo { ctx: EvalCtx::RunTime, ..info })
      }
      ExprKind::Embed(path) => {
        let path_str = self.name(*path).to_owned();
        match self.files.read_binary(&path_str) {
          Ok(bytes) => self.reduce_expr(scope, &Expr::new(ExprKind::String(bytes), loc)),
          Err(err) => {
            self.c.report.error(format!("could not embed `{path_str}`: {err}"), loc);
            self.error_expr(loc)
          }
        }
      }
      ExprKind::FieldAccess { value, field } => self.reduce_field(scope, value, *field, loc),
    }
  }

  fn reduce_resolved(
    &mut self, def: DefId, pieces: crate::types::ast::NamePieces, loc: SourceLoc,
  ) -> Expr {
    match &self.c.defs[def].kind {
      DefKind::Let { params, body } => {
        if !params.is_empty() {
          let message = format!("`{}` expects {} argument(s)",
            self.name(self.c.defs[def].name), params.len());
          self.c.report.error(message, loc);
          return self.error_expr(loc)
        }
        let Some(body) = body.clone() else {
          self.c.report.error("constant has no value", loc);
          return self.error_expr(loc)
        };
        let parent = self.c.defs[def].parent_scope.expect("let has a scope");
        let mut reduced = self.reduce_expr(parent, &body);
        reduced.loc = loc;
        reduced
      }
      DefKind::EnumMember { owner, .. } => {
        let owner = *owner;
        let value = self.enum_member_value(def);
        Expr::analyzed(ExprKind::Int(value), loc, ExprInfo {
          ctx: EvalCtx::CompileTime,
          ty: self.resolved_ty(owner, loc),
          quals: Qualifiers::empty(),
        })
      }
      DefKind::Var { quals, ty, .. } => {
        let quals = *quals;
        let ty = ty.clone().unwrap_or_else(||
          self.resolved_ty(self.c.builtins.iexpr_type, loc));
        Expr::analyzed(ExprKind::Resolved { def, pieces }, loc,
          ExprInfo { ctx: EvalCtx::RunTime, ty, quals })
      }
      DefKind::BuiltinRegister { ty } => {
        let ty = self.resolved_ty(*ty, loc);
        Expr::analyzed(ExprKind::Resolved { def, pieces }, loc,
          ExprInfo { ctx: EvalCtx::RunTime, ty, quals: Qualifiers::empty() })
      }
      DefKind::Func { .. } => {
        let ty = TypeExpr::new(TypeExprKind::Function {
          params: vec![],
          ret: Box::new(TypeExpr::new(TypeExprKind::Tuple(vec![]), loc)),
        }, loc);
        Expr::analyzed(ExprKind::Resolved { def, pieces }, loc,
          ExprInfo { ctx: EvalCtx::LinkTime, ty, quals: Qualifiers::empty() })
      }
      DefKind::Label { .. } => {
        let ty = self.resolved_ty(self.c.platform.pointer_sized_type(), loc);
        Expr::analyzed(ExprKind::Resolved { def, pieces }, loc,
          ExprInfo { ctx: EvalCtx::LinkTime, ty, quals: Qualifiers::empty() })
      }
      DefKind::BuiltinVoidIntrinsic | DefKind::BuiltinLoadIntrinsic { .. } => {
        let ty = self.resolved_ty(self.c.builtins.intrinsic_type, loc);
        Expr::analyzed(ExprKind::Resolved { def, pieces }, loc,
          ExprInfo { ctx: EvalCtx::RunTime, ty, quals: Qualifiers::empty() })
      }
      _ => {
        // Types, namespaces and banks reduce to a compile-time reference,
        // consumed by member access and type positions.
        let ty = self.resolved_ty(self.c.builtins.typeof_type, loc);
        Expr::analyzed(ExprKind::Resolved { def, pieces }, loc,
          ExprInfo { ctx: EvalCtx::CompileTime, ty, quals: Qualifiers::empty() })
      }
    }
  }

  #[allow(clippy::too_many_lines)]
  fn reduce_binary(
    &mut self, scope: ScopeId, op: BinaryOp, l: &Expr, r: &Expr, loc: SourceLoc,
  ) -> Expr {
    let l = self.reduce_expr(scope, l);
    let r = self.reduce_expr(scope, r);
    let ctx = l.ctx().max(r.ctx());
    let bool_ty = self.resolved_ty(self.c.builtins.bool_type, loc);
    match op {
      BinaryOp::Assignment => {
        let info = ExprInfo { ctx: EvalCtx::RunTime, ty: l.info().ty.clone(),
          quals: Qualifiers::empty() };
        Expr::analyzed(ExprKind::Binary(op, Box::new(l), Box::new(r)), loc, info)
      }
      BinaryOp::Indexing => {
        if_chain::if_chain! {
          if let Some(index) = r.as_int();
          if ctx == EvalCtx::CompileTime;
          then {
            return match &l.kind {
              ExprKind::Array(items) => match usize::try_from(index).ok()
                .and_then(|i| items.get(i))
              {
                Some(item) => { let mut item = item.clone(); item.loc = loc; item }
                None => {
                  self.c.report.error(format!("index `{index}` is out of bounds"), loc);
                  self.error_expr(loc)
                }
              },
              ExprKind::String(bytes) => match usize::try_from(index).ok()
                .and_then(|i| bytes.get(i))
              {
                Some(&b) => self.int_expr(b.into(), loc),
                None => {
                  self.c.report.error(format!("index `{index}` is out of bounds"), loc);
                  self.error_expr(loc)
                }
              },
              _ => {
                self.c.report.error("expression cannot be indexed at compile time", loc);
                self.error_expr(loc)
              }
            }
          }
        }
        let elem = match &l.info().ty.kind {
          TypeExprKind::Array { elem, .. } | TypeExprKind::Pointer { elem, .. } =>
            (**elem).clone(),
          _ => self.resolved_ty(self.c.builtins.u8_type, loc),
        };
        let quals = l.info().quals;
        Expr::analyzed(ExprKind::Binary(op, Box::new(l), Box::new(r)), loc,
          ExprInfo { ctx: EvalCtx::RunTime, ty: elem, quals })
      }
      BinaryOp::BitIndexing => Expr::analyzed(
        ExprKind::Binary(op, Box::new(l), Box::new(r)), loc,
        ExprInfo { ctx, ty: bool_ty, quals: Qualifiers::empty() }),
      BinaryOp::Concatenation => match (&l.kind, &r.kind) {
        (ExprKind::Array(a), ExprKind::Array(b)) => {
          let items: Vec<Expr> = a.iter().chain(b).cloned().collect();
          self.reduce_expr(scope, &Expr::new(ExprKind::Array(items), loc))
        }
        (ExprKind::String(a), ExprKind::String(b)) => {
          let bytes: Vec<u8> = a.iter().chain(b).copied().collect();
          self.reduce_expr(scope, &Expr::new(ExprKind::String(bytes), loc))
        }
        _ => {
          self.c.report.error("`~` requires two compile-time sequences", loc);
          self.error_expr(loc)
        }
      },
      BinaryOp::LogicalAnd | BinaryOp::LogicalOr => {
        if let (Some(a), Some(b)) = (l.as_bool(), r.as_bool()) {
          let folded = eval::bool_binary(op, a, b).expect("logical fold");
          return self.bool_expr(folded, loc)
        }
        Expr::analyzed(ExprKind::Binary(op, Box::new(l), Box::new(r)), loc,
          ExprInfo { ctx, ty: bool_ty, quals: Qualifiers::empty() })
      }
      _ if op.is_comparison() => {
        if_chain::if_chain! {
          if let (Some(a), Some(b)) = (l.as_int(), r.as_int());
          if ctx == EvalCtx::CompileTime;
          if let Some(folded) = eval::int_compare(op, a, b);
          then { return self.bool_expr(folded, loc) }
        }
        if_chain::if_chain! {
          if let (Some(a), Some(b)) = (l.as_bool(), r.as_bool());
          if let Some(folded) = eval::bool_binary(op, a, b);
          then { return self.bool_expr(folded, loc) }
        }
        self.unify(&l, &r, loc);
        Expr::analyzed(ExprKind::Binary(op, Box::new(l), Box::new(r)), loc,
          ExprInfo { ctx, ty: bool_ty, quals: Qualifiers::empty() })
      }
      _ => {
        let ty = self.unify(&l, &r, loc);
        if_chain::if_chain! {
          if let (Some(a), Some(b)) = (l.as_int(), r.as_int());
          if ctx == EvalCtx::CompileTime;
          then {
            return match eval::int_binary(op, a, b) {
              Ok(folded) => Expr::analyzed(ExprKind::Int(folded), loc,
                ExprInfo { ctx: EvalCtx::CompileTime, ty, quals: Qualifiers::empty() }),
              Err(err) => {
                self.c.report.error(err.message(), loc);
                self.error_expr(loc)
              }
            }
          }
        }
        Expr::analyzed(ExprKind::Binary(op, Box::new(l), Box::new(r)), loc,
          ExprInfo { ctx, ty, quals: Qualifiers::empty() })
      }
    }
  }

  fn reduce_unary(&mut self, scope: ScopeId, op: UnaryOp, x: &Expr, loc: SourceLoc) -> Expr {
    let x = self.reduce_expr(scope, x);
    let ctx = x.ctx();
    match op {
      UnaryOp::Grouping => { let mut x = x; x.loc = loc; x }
      UnaryOp::LogicalNegation => {
        if let Some(b) = x.as_bool() { return self.bool_expr(!b, loc) }
        let ty = self.resolved_ty(self.c.builtins.bool_type, loc);
        Expr::analyzed(ExprKind::Unary(op, Box::new(x)), loc,
          ExprInfo { ctx, ty, quals: Qualifiers::empty() })
      }
      UnaryOp::SignedNegation | UnaryOp::BitwiseNegation
      | UnaryOp::LowByte | UnaryOp::HighByte | UnaryOp::BankByte => {
        if_chain::if_chain! {
          if let Some(v) = x.as_int();
          if ctx == EvalCtx::CompileTime;
          then {
            return match eval::int_unary(op, v) {
              Ok(folded) => {
                let ty = x.info().ty.clone();
                Expr::analyzed(ExprKind::Int(folded), loc,
                  ExprInfo { ctx: EvalCtx::CompileTime, ty, quals: Qualifiers::empty() })
              }
              Err(err) => {
                self.c.report.error(err.message(), loc);
                self.error_expr(loc)
              }
            }
          }
        }
        let ty = match op {
          UnaryOp::LowByte | UnaryOp::HighByte | UnaryOp::BankByte =>
            self.resolved_ty(self.c.builtins.u8_type, loc),
          _ => x.info().ty.clone(),
        };
        Expr::analyzed(ExprKind::Unary(op, Box::new(x)), loc,
          ExprInfo { ctx, ty, quals: Qualifiers::empty() })
      }
      UnaryOp::AddressOf | UnaryOp::FarAddressOf => {
        let quals = if op == UnaryOp::FarAddressOf { Qualifiers::FAR } else {
          Qualifiers::empty()
        };
        let ty = TypeExpr::new(TypeExprKind::Pointer {
          elem: Box::new(x.info().ty.clone()), quals,
        }, loc);
        Expr::analyzed(ExprKind::Unary(op, Box::new(x)), loc,
          ExprInfo { ctx: EvalCtx::LinkTime, ty, quals: Qualifiers::empty() })
      }
      UnaryOp::Indirection => {
        let (ty, quals) = match &x.info().ty.kind {
          TypeExprKind::Pointer { elem, quals } => ((**elem).clone(), *quals),
          _ => {
            self.c.report.error("`*` requires a pointer operand", loc);
            (self.resolved_ty(self.c.builtins.u8_type, loc), Qualifiers::empty())
          }
        };
        Expr::analyzed(ExprKind::Unary(op, Box::new(x)), loc,
          ExprInfo { ctx: EvalCtx::RunTime, ty, quals })
      }
      UnaryOp::PreIncrement | UnaryOp::PreDecrement
      | UnaryOp::PostIncrement | UnaryOp::PostDecrement => {
        let ty = x.info().ty.clone();
        Expr::analyzed(ExprKind::Unary(op, Box::new(x)), loc,
          ExprInfo { ctx: EvalCtx::RunTime, ty, quals: Qualifiers::empty() })
      }
    }
  }

  fn reduce_call(
    &mut self, scope: ScopeId, inline: bool, callee: &Expr, args: &[Expr], loc: SourceLoc,
  ) -> Expr {
    let resolved = match &callee.kind {
      ExprKind::Ident(pieces) => self.resolve(scope, pieces, callee.loc),
      ExprKind::Resolved { def, .. } => Some(*def),
      _ => None,
    };
    let Some(def) = resolved else {
      self.c.report.error("expression is not callable", loc);
      return self.error_expr(loc)
    };

    // `__has`/`__get` consult the define map directly.
    if def == self.c.builtins.has_def || def == self.c.builtins.get_def {
      return self.reduce_define_query(scope, def, args, loc)
    }

    match &self.c.defs[def].kind {
      DefKind::Let { params, body } if !params.is_empty() => {
        if args.len() != params.len() {
          let message = format!("`{}` expects {} argument(s), found {}",
            self.name(self.c.defs[def].name), params.len(), args.len());
          self.c.report.error(message, loc);
          return self.error_expr(loc)
        }
        let params = params.clone();
        let Some(body) = body.clone() else {
          self.c.report.error("constant has no value", loc);
          return self.error_expr(loc)
        };
        let reduced_args: Vec<Expr> = args.iter().map(|a| self.reduce_expr(scope, a)).collect();
        let map: HashMap<Symbol, Expr> = params.into_iter().zip(reduced_args).collect();
        let parent = self.c.defs[def].parent_scope.expect("let has a scope");
        self.subst.push(map);
        let mut reduced = self.reduce_expr(parent, &body);
        self.subst.pop();
        reduced.loc = loc;
        reduced
      }
      DefKind::Let { .. } => {
        // A parameterless constant called with arguments.
        let message = format!("`{}` takes no arguments", self.name(self.c.defs[def].name));
        self.c.report.error(message, loc);
        self.error_expr(loc)
      }
      DefKind::Func { .. } => {
        if !args.is_empty() {
          self.c.report.error(
            "function arguments are passed through registers; call with no arguments", loc);
        }
        let callee = self.reduce_resolved(def, smallvec::SmallVec::new(), callee.loc);
        let ty = TypeExpr::new(TypeExprKind::Tuple(vec![]), loc);
        Expr::analyzed(ExprKind::Call {
          inline, callee: Box::new(callee),
          args: args.iter().map(|a| self.reduce_expr(scope, a)).collect(),
        }, loc, ExprInfo { ctx: EvalCtx::RunTime, ty, quals: Qualifiers::empty() })
      }
      DefKind::BuiltinVoidIntrinsic | DefKind::BuiltinLoadIntrinsic { .. } => {
        let load_ty = match self.c.defs[def].kind {
          DefKind::BuiltinLoadIntrinsic { ty } => Some(ty),
          _ => None,
        };
        let ty = match load_ty {
          Some(t) => self.resolved_ty(t, loc),
          None => TypeExpr::new(TypeExprKind::Tuple(vec![]), loc),
        };
        let callee = self.reduce_resolved(def, smallvec::SmallVec::new(), callee.loc);
        Expr::analyzed(ExprKind::Call {
          inline, callee: Box::new(callee),
          args: args.iter().map(|a| self.reduce_expr(scope, a)).collect(),
        }, loc, ExprInfo { ctx: EvalCtx::RunTime, ty, quals: Qualifiers::empty() })
      }
      _ => {
        let message = format!("`{}` is not callable", self.name(self.c.defs[def].name));
        self.c.report.error(message, loc);
        self.error_expr(loc)
      }
    }
  }

  fn reduce_define_query(
    &mut self, scope: ScopeId, def: DefId, args: &[Expr], loc: SourceLoc,
  ) -> Expr {
    let is_has = def == self.c.builtins.has_def;
    let expected = if is_has { 1 } else { 2 };
    if args.len() != expected {
      let name = if is_has { "__has" } else { "__get" };
      self.c.report.error(format!("`{name}` expects {expected} argument(s)"), loc);
      return self.error_expr(loc)
    }
    let key = match &args[0].kind {
      ExprKind::Ident(pieces) if pieces.len() == 1 => Some(pieces[0]),
      ExprKind::String(bytes) => std::str::from_utf8(bytes).ok()
        .map(|s| self.c.interner.intern(s)),
      _ => None,
    };
    let Some(key) = key else {
      self.c.report.error("define key must be an identifier or string", loc);
      return self.error_expr(loc)
    };
    if is_has {
      let found = self.c.builtins.get_define(key).is_some();
      self.bool_expr(found, loc)
    } else if let Some(found) = self.c.builtins.get_define(key) {
      let mut found = found.clone();
      found.loc = loc;
      found
    } else {
      self.reduce_expr(scope, &args[1])
    }
  }

  /// Resolve a struct member by name, returning its definition and offset.
  fn member_of(&mut self, ty: &TypeExpr, field: Symbol, loc: SourceLoc)
    -> Option<(DefId, u32)>
  {
    let def = ty.as_resolved()?;
    let DefKind::Struct { member_scope, members, .. } = &self.c.defs[def].kind else {
      let message = format!("type `{}` has no member `{}`",
        self.describe_ty(ty), self.name(field));
      self.c.report.error(message, loc);
      return None
    };
    let member_scope = *member_scope;
    let members = members.clone();
    self.layout_struct(def, &members);
    let Some(&member) = self.c.scopes[member_scope].names.get(&field) else {
      let message = format!("type `{}` has no member `{}`",
        self.describe_ty(ty), self.name(field));
      self.c.report.error(message, loc);
      return None
    };
    match self.c.defs[member].kind {
      DefKind::StructMember { offset: Some(offset), .. } => Some((member, offset)),
      _ => None,
    }
  }

  fn layout_struct(&mut self, def: DefId, members: &[DefId]) {
    let kind = match self.c.defs[def].kind {
      DefKind::Struct { kind, .. } => kind,
      _ => unreachable!("struct layout"),
    };
    let scope = self.c.defs[def].parent_scope.expect("struct has a scope");
    let mut offset = 0_u32;
    for &member in members {
      let ty = match &self.c.defs[member].kind {
        DefKind::StructMember { ty, .. } => ty.clone(),
        _ => unreachable!("struct member"),
      };
      let loc = self.c.defs[member].loc;
      let ty = self.reduce_ty(scope, &ty);
      let size = self.size_of(&ty, loc).unwrap_or(0);
      if let DefKind::StructMember { ty: slot_ty, offset: slot } =
        &mut self.c.defs[member].kind
      {
        *slot_ty = ty;
        *slot = Some(if kind == StructKind::Union { 0 } else { offset });
      }
      if kind == StructKind::Struct { offset = offset.saturating_add(size) }
    }
  }

  fn reduce_field(
    &mut self, scope: ScopeId, value: &Expr, field: Symbol, loc: SourceLoc,
  ) -> Expr {
    let value = self.reduce_expr(scope, value);
    let property = Property::from_str(self.name(field));

    match property {
      Some(Property::Len) => {
        match &value.kind {
          ExprKind::Array(items) => return self.int_expr(items.len() as i128, loc),
          ExprKind::String(bytes) => return self.int_expr(bytes.len() as i128, loc),
          _ => {}
        }
        if let TypeExprKind::Array { count: Some(count), .. } = &value.info().ty.kind {
          if let Some(n) = count.as_int() { return self.int_expr(n, loc) }
        }
      }
      Some(Property::MinValue | Property::MaxValue) => {
        if_chain::if_chain! {
          if let Some(def) = value.as_resolved();
          if let Some((min, max, _)) = self.int_type_info(def);
          then {
            let v = if property == Some(Property::MinValue) { min } else { max };
            let ty = self.resolved_ty(def, loc);
            return Expr::analyzed(ExprKind::Int(v), loc,
              ExprInfo { ctx: EvalCtx::CompileTime, ty, quals: Qualifiers::empty() })
          }
        }
      }
      None => {}
    }

    // Struct member access on a placed variable desugars to an indirection
    // through the member's address, which the operand builder understands.
    let value_ty = value.info().ty.clone();
    if let Some((member, offset)) = self.member_of(&value_ty, field, loc) {
      let member_ty = match &self.c.defs[member].kind {
        DefKind::StructMember { ty, .. } => ty.clone(),
        _ => unreachable!("struct member"),
      };
      let quals = value.info().quals;
      let pointer_ty = TypeExpr::new(TypeExprKind::Pointer {
        elem: Box::new(member_ty.clone()), quals,
      }, loc);
      let base = Expr::analyzed(
        ExprKind::Unary(UnaryOp::AddressOf, Box::new(value)), loc,
        ExprInfo { ctx: EvalCtx::LinkTime, ty: pointer_ty.clone(), quals: Qualifiers::empty() });
      let addr = Expr::analyzed(
        ExprKind::Binary(BinaryOp::Addition, Box::new(base),
          Box::new(self.int_expr(offset.into(), loc))),
        loc, ExprInfo { ctx: EvalCtx::LinkTime, ty: pointer_ty.clone(),
          quals: Qualifiers::empty() });
      return Expr::analyzed(ExprKind::Unary(UnaryOp::Indirection, Box::new(addr)), loc,
        ExprInfo { ctx: EvalCtx::RunTime, ty: member_ty, quals })
    }
    self.error_expr(loc)
  }

  /// The elements of a compile-time sequence: an array, string, tuple, or
  /// constant range (half-open, stepped).
  fn const_sequence(&mut self, seq: &Expr) -> Option<Vec<Expr>> {
    match &seq.kind {
      ExprKind::Array(items) | ExprKind::Tuple(items)
        if items.iter().all(|x| x.ctx() == EvalCtx::CompileTime) => Some(items.clone()),
      ExprKind::String(bytes) =>
        Some(bytes.iter().map(|&b| self.int_expr(b.into(), seq.loc)).collect()),
      ExprKind::Range { start, end, step } => {
        let start = start.as_ref().map_or(Some(0), |x| x.as_int())?;
        let end = end.as_ref().and_then(|x| x.as_int())?;
        let step = step.as_ref().map_or(Some(1), |x| x.as_int())?;
        if step == 0 {
          self.c.report.error("range step cannot be zero", seq.loc);
          return None
        }
        let mut items = vec![];
        let mut i = start;
        while (step > 0 && i < end) || (step < 0 && i > end) {
          if items.len() > 0x10000 {
            self.c.report.error("range is too long to unroll", seq.loc);
            return None
          }
          items.push(self.int_expr(i, seq.loc));
          i += step;
        }
        Some(items)
      }
      _ => None,
    }
  }

  // Declarations, first sweep.

  #[allow(clippy::too_many_lines)]
  fn reduce_declarations(&mut self, scope: ScopeId, stmt: &'p Stmt, bank: Option<BankId>) {
    let loc = stmt.loc;
    match &stmt.kind {
      StmtKind::File { items, .. } => {
        for item in items { self.reduce_declarations(scope, item, bank) }
      }
      StmtKind::Attribution { body, .. } => self.reduce_declarations(scope, body, bank),
      StmtKind::Block(items) => {
        let block = self.c.scope_of.get(&stmt.id).copied().unwrap_or(scope);
        for item in items { self.reduce_declarations(block, item, bank) }
      }
      StmtKind::Bank { names, addresses, ty } => {
        for (i, &name) in names.iter().enumerate() {
          let Some(&def) = self.c.def_of.get(&(stmt.id, name)) else { continue };
          let Some((kind, capacity)) = self.reduce_bank_type(scope, ty) else { continue };
          let origin = addresses.get(i).cloned().flatten()
            .map(|e| self.reduce_expr(scope, &e))
            .and_then(|e| e.as_int())
            .and_then(|n| u32::try_from(n).ok());
          let order = self.c.banks.len() as u32;
          let bank_id = self.c.banks.push(Bank::new(name, kind, origin, capacity, order));
          if let DefKind::Bank { bank: slot, .. } = &mut self.c.defs[def].kind {
            *slot = Some(bank_id);
          }
          log::debug!("bank `{}`: {kind:?}, capacity {capacity:#x}, origin {origin:?}",
            self.c.interner.get(name));
        }
      }
      StmtKind::In { pieces, dest, body } => {
        let Some(def) = self.resolve(scope, pieces, loc) else { return };
        let DefKind::Bank { bank: Some(bank_id), .. } = self.c.defs[def].kind else {
          let message = format!("`{}` is not a bank", self.name(self.c.defs[def].name));
          self.c.report.error(message, loc);
          return
        };
        if let Some(dest) = dest {
          let dest = self.reduce_expr(scope, dest);
          match dest.as_int().and_then(|n| u32::try_from(n).ok()) {
            Some(origin) => self.c.banks[bank_id].origin = Some(origin),
            None => self.c.report.error("bank destination must be a compile-time address", loc),
          }
        }
        self.reduce_declarations(scope, body, Some(bank_id));
      }
      StmtKind::Func { name, body, .. } => {
        let Some(&def) = self.c.def_of.get(&(stmt.id, *name)) else { return };
        let func_scope = self.c.scope_of.get(&stmt.id).copied().unwrap_or(scope);
        match bank {
          Some(bank_id) => {
            self.c.banks[bank_id].placed.push(def);
            if let DefKind::Func { address, .. } = &mut self.c.defs[def].kind {
              address.bank = Some(bank_id);
            }
          }
          None => {
            let message = format!(
              "function `{}` must be declared inside an `in` block", self.name(*name));
            self.c.report.error(message, loc);
          }
        }
        if let Some(bank_id) = bank {
          if !self.c.banks[bank_id].kind.holds_code() {
            let message = format!("bank `{}` cannot hold code",
              self.name(self.c.banks[bank_id].name));
            self.c.report.error(message, loc);
          }
        }
        self.pending_funcs.push((def, &**body, func_scope, bank));
      }
      StmtKind::Label { name, .. } => {
        if let (Some(&def), Some(bank_id)) = (self.c.def_of.get(&(stmt.id, *name)), bank) {
          self.c.banks[bank_id].placed.push(def);
          if let DefKind::Label { address } = &mut self.c.defs[def].kind {
            address.bank = Some(bank_id);
          }
        }
      }
      StmtKind::Var { names, addresses, ty, value, quals } => {
        for (i, &name) in names.iter().enumerate() {
          self.reduce_var(scope, stmt, name, addresses.get(i).cloned().flatten(),
            ty.as_ref(), value.as_deref(), *quals, bank);
        }
      }
      StmtKind::Enum { name, .. } => {
        if let Some(&def) = self.c.def_of.get(&(stmt.id, *name)) {
          let DefKind::Enum { member_scope, .. } = self.c.defs[def].kind else { return };
          let mut members: Vec<DefId> =
            self.c.scopes[member_scope].names.values().copied().collect();
          members.sort_unstable();
          self.compute_enum_values(&members, scope);
        }
      }
      StmtKind::Struct { name, .. } => {
        if let Some(&def) = self.c.def_of.get(&(stmt.id, *name)) {
          if let DefKind::Struct { members, .. } = &self.c.defs[def].kind {
            let members = members.clone();
            self.layout_struct(def, &members);
          }
        }
      }
      StmtKind::TypeAlias { name, ty } => {
        if let Some(&def) = self.c.def_of.get(&(stmt.id, *name)) {
          let reduced = self.reduce_ty(scope, ty);
          if let DefKind::TypeAlias { ty: slot } = &mut self.c.defs[def].kind {
            *slot = reduced;
          }
        }
      }
      StmtKind::Config(items) => {
        for (key, value) in items {
          let reduced = self.reduce_expr(scope, value);
          self.c.config.insert(*key, reduced);
        }
      }
      StmtKind::Namespace { body, .. } => {
        let member_scope = self.c.scope_of.get(&stmt.id).copied().unwrap_or(scope);
        self.reduce_declarations(member_scope, body, bank);
      }
      StmtKind::Let { .. } | StmtKind::ImportReference { .. }
      | StmtKind::InternalDeclaration => {}
      StmtKind::Branch { .. } | StmtKind::DoWhile { .. } | StmtKind::ExprStmt(..)
      | StmtKind::For { .. } | StmtKind::If { .. } | StmtKind::InlineFor { .. }
      | StmtKind::While { .. } =>
        self.c.report.error("statement is only allowed inside a function", loc),
    }
  }

  fn reduce_bank_type(&mut self, scope: ScopeId, ty: &TypeExpr)
    -> Option<(crate::types::entity::BankKind, u32)>
  {
    let reduced = self.reduce_ty(scope, ty);
    if_chain::if_chain! {
      if let TypeExprKind::Array { elem, count } = &reduced.kind;
      if let Some(def) = elem.as_resolved();
      if let DefKind::BuiltinBankType(kind) = self.c.defs[def].kind;
      if let Some(capacity) = count.as_ref().and_then(|e| e.as_int());
      if let Ok(capacity) = u32::try_from(capacity);
      then { return Some((kind, capacity)) }
    }
    self.c.report.error("bank type must be `[bankkind; capacity]`", ty.loc);
    None
  }

  #[allow(clippy::too_many_arguments)]
  fn reduce_var(
    &mut self, scope: ScopeId, stmt: &Stmt, name: Symbol, address: Option<Expr>,
    ty: Option<&TypeExpr>, value: Option<&Expr>, quals: Qualifiers, bank: Option<BankId>,
  ) {
    let Some(&def) = self.c.def_of.get(&(stmt.id, name)) else { return };
    let loc = stmt.loc;
    let value = value.map(|v| self.reduce_expr(scope, v));
    let mut ty = ty.map(|t| self.reduce_ty(scope, t));
    if ty.is_none() {
      ty = value.as_ref().map(|v| v.info().ty.clone());
    }
    let Some(ty) = ty else {
      self.c.report.error(
        format!("variable `{}` needs a type or an initialiser", self.name(name)), loc);
      return
    };
    if self.is_iexpr(&ty) {
      self.c.report.error(
        format!("variable `{}` needs an explicit integer type", self.name(name)), loc);
      return
    }
    if let Some(v) = &value {
      self.check_fits(v, &ty);
      if v.ctx() > EvalCtx::LinkTime {
        self.c.report.error("variable initialiser must be a constant", v.loc);
      }
    }
    if quals.contains(Qualifiers::CONST) && value.is_none() {
      self.c.report.error(
        format!("constant `{}` requires a value", self.name(name)), loc);
    }
    let size = self.size_of(&ty, loc);

    let mut resolved = Address::default();
    if let Some(addr) = address {
      let addr = self.reduce_expr(scope, &addr);
      match addr.as_int().and_then(|n| u32::try_from(n).ok()) {
        Some(abs) => resolved = Address::fixed(abs),
        None => self.c.report.error("variable address must be a compile-time value", addr.loc),
      }
    } else if let Some(bank_id) = bank {
      self.c.banks[bank_id].placed.push(def);
      resolved.bank = Some(bank_id);
    } else {
      let message = format!(
        "variable `{}` must be placed in a bank or given an address", self.name(name));
      self.c.report.error(message, loc);
    }

    if let DefKind::Var { ty: slot_ty, value: slot_value, address: slot_addr,
      size: slot_size, .. } = &mut self.c.defs[def].kind
    {
      *slot_ty = Some(ty);
      *slot_value = value;
      *slot_addr = resolved;
      *slot_size = size;
    }
  }

  // Function bodies, second sweep.

  #[allow(clippy::too_many_lines)]
  fn reduce_stmt(&mut self, scope: ScopeId, stmt: &Stmt, bank: Option<BankId>) -> Stmt {
    let loc = stmt.loc;
    let id = stmt.id;
    match &stmt.kind {
      StmtKind::Block(items) => {
        let block = self.c.scope_of.get(&id).copied().unwrap_or(scope);
        Stmt::new(id, StmtKind::Block(
          items.iter().map(|s| self.reduce_stmt(block, s, bank)).collect()), loc)
      }
      StmtKind::ExprStmt(e) =>
        Stmt::new(id, StmtKind::ExprStmt(Box::new(self.reduce_expr(scope, e))), loc),
      StmtKind::If { distance, condition, then, els } => Stmt::new(id, StmtKind::If {
        distance: *distance,
        condition: Box::new(self.reduce_expr(scope, condition)),
        then: Box::new(self.reduce_stmt(scope, then, bank)),
        els: els.as_ref().map(|s| Box::new(self.reduce_stmt(scope, s, bank))),
      }, loc),
      StmtKind::While { distance, condition, body } => Stmt::new(id, StmtKind::While {
        distance: *distance,
        condition: Box::new(self.reduce_expr(scope, condition)),
        body: Box::new(self.reduce_stmt(scope, body, bank)),
      }, loc),
      StmtKind::DoWhile { distance, body, condition } => Stmt::new(id, StmtKind::DoWhile {
        distance: *distance,
        body: Box::new(self.reduce_stmt(scope, body, bank)),
        condition: Box::new(self.reduce_expr(scope, condition)),
      }, loc),
      StmtKind::For { distance, counter, seq, body } => {
        let for_scope = self.c.scope_of.get(&id).copied().unwrap_or(scope);
        let counter = self.reduce_expr(for_scope, counter);
        let seq = self.reduce_expr(for_scope, seq);
        if seq.ctx() == EvalCtx::CompileTime && !matches!(seq.kind, ExprKind::Range { .. }) {
          // A compile-time sequence unrolls into assignments to the counter.
          let Some(elements) = self.const_sequence(&seq) else {
            self.c.report.error("`for` requires a range or compile-time sequence", seq.loc);
            return Stmt::new(id, StmtKind::InternalDeclaration, loc)
          };
          let body = self.reduce_stmt(for_scope, body, bank);
          let mut items = vec![];
          for element in elements {
            let assign = Expr::analyzed(
              ExprKind::Binary(BinaryOp::Assignment,
                Box::new(counter.clone()), Box::new(element)),
              loc, ExprInfo {
                ctx: EvalCtx::RunTime, ty: counter.info().ty.clone(),
                quals: Qualifiers::empty(),
              });
            items.push(Stmt::internal(StmtKind::ExprStmt(Box::new(assign)), loc));
            items.push(body.clone());
          }
          return Stmt::new(id, StmtKind::Block(items), loc)
        }
        Stmt::new(id, StmtKind::For {
          distance: *distance,
          counter: Box::new(counter),
          seq: Box::new(seq),
          body: Box::new(self.reduce_stmt(for_scope, body, bank)),
        }, loc)
      }
      StmtKind::InlineFor { name, seq, body } => {
        let for_scope = self.c.scope_of.get(&id).copied().unwrap_or(scope);
        let seq = self.reduce_expr(for_scope, seq);
        let Some(elements) = self.const_sequence(&seq) else {
          self.c.report.error("`inline for` requires a compile-time sequence", seq.loc);
          return Stmt::new(id, StmtKind::InternalDeclaration, loc)
        };
        let mut items = vec![];
        for element in elements {
          self.subst.push(HashMap::from_iter([(*name, element)]));
          items.push(self.reduce_stmt(for_scope, body, bank));
          self.subst.pop();
        }
        Stmt::new(id, StmtKind::Block(items), loc)
      }
      StmtKind::Branch { kind, distance, condition, destination, return_value } =>
        Stmt::new(id, StmtKind::Branch {
          kind: *kind,
          distance: *distance,
          condition: condition.as_ref().map(|e| Box::new(self.reduce_expr(scope, e))),
          destination: destination.as_ref().map(|e| Box::new(self.reduce_expr(scope, e))),
          return_value: return_value.as_ref().map(|e| Box::new(self.reduce_expr(scope, e))),
        }, loc),
      StmtKind::Label { .. } => stmt.clone(),
      StmtKind::Var { names, addresses, ty, value, quals } => {
        for (i, &name) in names.iter().enumerate() {
          self.reduce_var(scope, stmt, name, addresses.get(i).cloned().flatten(),
            ty.as_ref(), value.as_deref(), *quals, bank);
        }
        Stmt::new(id, StmtKind::InternalDeclaration, loc)
      }
      StmtKind::Let { .. } => Stmt::new(id, StmtKind::InternalDeclaration, loc),
      StmtKind::Config(items) => {
        for (key, value) in items {
          let reduced = self.reduce_expr(scope, value);
          self.c.config.insert(*key, reduced);
        }
        Stmt::new(id, StmtKind::InternalDeclaration, loc)
      }
      StmtKind::InternalDeclaration => stmt.clone(),
      _ => {
        self.c.report.error("declaration is not allowed inside a function", loc);
        Stmt::new(id, StmtKind::InternalDeclaration, loc)
      }
    }
  }
}
