//! The abstract syntax trees: expressions, type expressions and statements.
//!
//! Trees are immutable once built; the reduction pass produces new
//! annotated trees rather than mutating, so an expression's analysis
//! annotation is assigned exactly once by construction. Children are owned
//! by value; references into the definition arena are plain [`DefId`]s.

use smallvec::SmallVec;

use crate::symbol::Symbol;
use crate::types::entity::DefId;
use crate::types::{NodeId, SourceLoc};

/// The binary operator grid recognised by the instruction engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
  /// `a + b`
  Addition,
  /// `a +# b`, addition including the carry flag
  AdditionWithCarry,
  /// `a = b`
  Assignment,
  /// `a $ b`, selecting bit `b` of `a`
  BitIndexing,
  /// `a & b`
  BitwiseAnd,
  /// `a | b`
  BitwiseOr,
  /// `a ^ b`
  BitwiseXor,
  /// `a ~ b`, compile-time sequence concatenation
  Concatenation,
  /// `a / b`
  Division,
  /// `a == b`
  Equal,
  /// `a > b`
  GreaterThan,
  /// `a >= b`
  GreaterThanOrEqual,
  /// `a[b]`
  Indexing,
  /// `a <<<< b`
  LeftRotate,
  /// `a <<<<# b`
  LeftRotateWithCarry,
  /// `a << b`, arithmetic left shift
  LeftShift,
  /// `a < b`
  LessThan,
  /// `a <= b`
  LessThanOrEqual,
  /// `a && b`
  LogicalAnd,
  /// `a <<< b`
  LogicalLeftShift,
  /// `a || b`
  LogicalOr,
  /// `a >>> b`
  LogicalRightShift,
  /// `a % b`
  Modulo,
  /// `a * b`
  Multiplication,
  /// `a != b`
  NotEqual,
  /// `a >>>> b`
  RightRotate,
  /// `a >>>># b`
  RightRotateWithCarry,
  /// `a >> b`, arithmetic right shift
  RightShift,
  /// `a - b`
  Subtraction,
  /// `a -# b`, subtraction including the carry flag
  SubtractionWithCarry,
}

impl BinaryOp {
  /// The operator as written in source, for diagnostics.
  #[must_use] pub fn symbol(self) -> &'static str {
    match self {
      BinaryOp::Addition => "+",
      BinaryOp::AdditionWithCarry => "+#",
      BinaryOp::Assignment => "=",
      BinaryOp::BitIndexing => "$",
      BinaryOp::BitwiseAnd => "&",
      BinaryOp::BitwiseOr => "|",
      BinaryOp::BitwiseXor => "^",
      BinaryOp::Concatenation => "~",
      BinaryOp::Division => "/",
      BinaryOp::Equal => "==",
      BinaryOp::GreaterThan => ">",
      BinaryOp::GreaterThanOrEqual => ">=",
      BinaryOp::Indexing => "[]",
      BinaryOp::LeftRotate => "<<<<",
      BinaryOp::LeftRotateWithCarry => "<<<<#",
      BinaryOp::LeftShift => "<<",
      BinaryOp::LessThan => "<",
      BinaryOp::LessThanOrEqual => "<=",
      BinaryOp::LogicalAnd => "&&",
      BinaryOp::LogicalLeftShift => "<<<",
      BinaryOp::LogicalOr => "||",
      BinaryOp::LogicalRightShift => ">>>",
      BinaryOp::Modulo => "%",
      BinaryOp::Multiplication => "*",
      BinaryOp::NotEqual => "!=",
      BinaryOp::RightRotate => ">>>>",
      BinaryOp::RightRotateWithCarry => ">>>>#",
      BinaryOp::RightShift => ">>",
      BinaryOp::Subtraction => "-",
      BinaryOp::SubtractionWithCarry => "-#",
    }
  }

  /// The comparison with the opposite truth value, if this is a comparison.
  /// Used to lower `if` by branching over the body on the negated test.
  #[must_use] pub fn logical_negation(self) -> Option<BinaryOp> {
    match self {
      BinaryOp::Equal => Some(BinaryOp::NotEqual),
      BinaryOp::NotEqual => Some(BinaryOp::Equal),
      BinaryOp::LessThan => Some(BinaryOp::GreaterThanOrEqual),
      BinaryOp::GreaterThanOrEqual => Some(BinaryOp::LessThan),
      BinaryOp::GreaterThan => Some(BinaryOp::LessThanOrEqual),
      BinaryOp::LessThanOrEqual => Some(BinaryOp::GreaterThan),
      _ => None,
    }
  }

  /// Whether this operator compares its operands and yields a boolean.
  #[must_use] pub fn is_comparison(self) -> bool {
    matches!(self, BinaryOp::Equal | BinaryOp::NotEqual
      | BinaryOp::LessThan | BinaryOp::LessThanOrEqual
      | BinaryOp::GreaterThan | BinaryOp::GreaterThanOrEqual)
  }
}

/// The unary operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
  /// `&x`
  AddressOf,
  /// `far &x`
  FarAddressOf,
  /// `~x`
  BitwiseNegation,
  /// `(x)`
  Grouping,
  /// `*x`
  Indirection,
  /// `!x`
  LogicalNegation,
  /// `x--`
  PostDecrement,
  /// `x++`
  PostIncrement,
  /// `--x`
  PreDecrement,
  /// `++x`
  PreIncrement,
  /// `-x`
  SignedNegation,
  /// `<:x`, bits 0..8
  LowByte,
  /// `>:x`, bits 8..16
  HighByte,
  /// `#:x`, bits 16..24
  BankByte,
}

impl UnaryOp {
  /// The operator as written in source, for diagnostics.
  #[must_use] pub fn symbol(self) -> &'static str {
    match self {
      UnaryOp::AddressOf => "&",
      UnaryOp::FarAddressOf => "far &",
      UnaryOp::BitwiseNegation => "~",
      UnaryOp::Grouping => "()",
      UnaryOp::Indirection => "*",
      UnaryOp::LogicalNegation => "!",
      UnaryOp::PostDecrement => "--",
      UnaryOp::PostIncrement => "++",
      UnaryOp::PreDecrement => "--",
      UnaryOp::PreIncrement => "++",
      UnaryOp::SignedNegation => "-",
      UnaryOp::LowByte => "<:",
      UnaryOp::HighByte => ">:",
      UnaryOp::BankByte => "#:",
    }
  }
}

/// When an expression's value becomes available. The lattice is ordered
/// `Unknown < CompileTime < LinkTime < RunTime`; a parent's class is the
/// maximum of its children's.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvalCtx {
  /// Not yet determined.
  Unknown,
  /// Evaluable during compilation.
  CompileTime,
  /// Fixed once addresses are assigned.
  LinkTime,
  /// Only known when the emitted program runs.
  RunTime,
}

bitflags::bitflags! {
  /// Pointer and storage qualifiers.
  #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
  pub struct Qualifiers: u8 {
    /// Read-only data.
    const CONST = 1;
    /// Write-only data (hardware ports).
    const WRITEONLY = 1 << 1;
    /// Reached through a far pointer.
    const FAR = 1 << 2;
  }
}

/// Kinds of compile-time type queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeQueryKind {
  /// `sizeof(T)`
  SizeOf,
  /// `alignof(T)`
  AlignOf,
}

/// A list of `::`-separated name pieces.
pub type NamePieces = SmallVec<[Symbol; 2]>;

/// The post-analysis annotation of an expression.
#[derive(Clone, Debug)]
pub struct ExprInfo {
  /// The evaluation class.
  pub ctx: EvalCtx,
  /// The resolved type.
  pub ty: TypeExpr,
  /// Qualifiers carried by the value.
  pub quals: Qualifiers,
}

/// An expression node.
#[derive(Clone, Debug)]
pub struct Expr {
  /// The expression variant.
  pub kind: ExprKind,
  /// The source location.
  pub loc: SourceLoc,
  /// The analysis annotation, present after reduction.
  pub info: Option<ExprInfo>,
}

impl Expr {
  /// Build an unannotated expression.
  #[must_use] pub fn new(kind: ExprKind, loc: SourceLoc) -> Self {
    Self { kind, loc, info: None }
  }

  /// Build an annotated expression, for reduction output.
  #[must_use] pub fn analyzed(kind: ExprKind, loc: SourceLoc, info: ExprInfo) -> Self {
    Self { kind, loc, info: Some(info) }
  }

  /// The annotation, which must be present after reduction.
  #[must_use] pub fn info(&self) -> &ExprInfo {
    self.info.as_ref().expect("expression was not reduced")
  }

  /// The evaluation class, `Unknown` before reduction.
  #[must_use] pub fn ctx(&self) -> EvalCtx {
    self.info.as_ref().map_or(EvalCtx::Unknown, |i| i.ctx)
  }

  /// The constant integer value, if the expression reduced to one.
  #[must_use] pub fn as_int(&self) -> Option<i128> {
    if let ExprKind::Int(n) = self.kind { Some(n) } else { None }
  }

  /// The constant boolean value, if the expression reduced to one.
  #[must_use] pub fn as_bool(&self) -> Option<bool> {
    if let ExprKind::Bool(b) = self.kind { Some(b) } else { None }
  }

  /// The resolved definition, if this is a resolved identifier.
  #[must_use] pub fn as_resolved(&self) -> Option<DefId> {
    if let ExprKind::Resolved { def, .. } = self.kind { Some(def) } else { None }
  }
}

/// The expression variants.
#[derive(Clone, Debug)]
pub enum ExprKind {
  /// `[body for name in seq]`
  ArrayComprehension {
    /// The element expression.
    body: Box<Expr>,
    /// The loop variable.
    name: Symbol,
    /// The compile-time sequence.
    seq: Box<Expr>,
  },
  /// `[value; count]`
  ArrayPad {
    /// The repeated element.
    value: Box<Expr>,
    /// The repetition count.
    count: Box<Expr>,
  },
  /// `[a, b, c]`
  Array(Vec<Expr>),
  /// A binary operator. Indexing and bit-indexing are binary operators.
  Binary(BinaryOp, Box<Expr>, Box<Expr>),
  /// `true` / `false`
  Bool(bool),
  /// A call of a function, intrinsic, or `let` macro.
  Call {
    /// Whether the call site requested inline expansion.
    inline: bool,
    /// The callee.
    callee: Box<Expr>,
    /// The arguments.
    args: Vec<Expr>,
  },
  /// `e as T`
  Cast {
    /// The value being cast.
    value: Box<Expr>,
    /// The destination type.
    ty: TypeExpr,
  },
  /// `embed "path"`, the contents of a binary file.
  Embed(Symbol),
  /// `e.field`
  FieldAccess {
    /// The value whose member is accessed.
    value: Box<Expr>,
    /// The member name.
    field: Symbol,
  },
  /// An unresolved, possibly qualified identifier.
  Ident(NamePieces),
  /// An integer literal; 128-bit signed.
  Int(i128),
  /// `offsetof(T, field)`
  OffsetOf {
    /// The aggregate type.
    ty: TypeExpr,
    /// The member name.
    field: Symbol,
  },
  /// `start .. end by step`; any part may be absent.
  Range {
    /// The inclusive start.
    start: Option<Box<Expr>>,
    /// The inclusive end.
    end: Option<Box<Expr>>,
    /// The step, default 1.
    step: Option<Box<Expr>>,
  },
  /// An identifier resolved to a definition.
  Resolved {
    /// The definition.
    def: DefId,
    /// The original name pieces, for diagnostics.
    pieces: NamePieces,
  },
  /// `{ stmt; result }` — a statement evaluated for effect, then a result.
  SideEffect {
    /// The statement to run first.
    stmt: Box<Stmt>,
    /// The value of the whole expression.
    result: Box<Expr>,
  },
  /// A string literal, as raw bytes.
  String(Vec<u8>),
  /// `T { field = e, ... }`
  StructLit {
    /// The aggregate type.
    ty: TypeExpr,
    /// The named field initialisers.
    items: Vec<(Symbol, Expr)>,
  },
  /// `(a, b, c)`
  Tuple(Vec<Expr>),
  /// `typeof(e)` used as a value position marker.
  TypeOf(Box<Expr>),
  /// `sizeof(T)` / `alignof(T)`
  TypeQuery {
    /// Which query.
    kind: TypeQueryKind,
    /// The queried type.
    ty: TypeExpr,
  },
  /// A unary operator.
  Unary(UnaryOp, Box<Expr>),
}

/// A type expression.
#[derive(Clone, Debug)]
pub struct TypeExpr {
  /// The variant.
  pub kind: TypeExprKind,
  /// The source location.
  pub loc: SourceLoc,
}

impl TypeExpr {
  /// Build a type expression.
  #[must_use] pub fn new(kind: TypeExprKind, loc: SourceLoc) -> Self { Self { kind, loc } }

  /// The definition this names, if it is a resolved identifier.
  #[must_use] pub fn as_resolved(&self) -> Option<DefId> {
    if let TypeExprKind::Resolved(d) = self.kind { Some(d) } else { None }
  }

  /// Structural equality; named types compare by definition.
  #[must_use] pub fn equivalent(&self, other: &TypeExpr) -> bool {
    match (&self.kind, &other.kind) {
      (TypeExprKind::Resolved(a), TypeExprKind::Resolved(b)) => a == b,
      (TypeExprKind::Array { elem: a, count: ca }, TypeExprKind::Array { elem: b, count: cb }) =>
        a.equivalent(b) && match (ca, cb) {
          (None, None) => true,
          (Some(x), Some(y)) => x.as_int().is_some() && x.as_int() == y.as_int(),
          _ => false,
        },
      (TypeExprKind::Pointer { elem: a, quals: qa }, TypeExprKind::Pointer { elem: b, quals: qb }) =>
        qa == qb && a.equivalent(b),
      (TypeExprKind::Tuple(xs), TypeExprKind::Tuple(ys)) =>
        xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| x.equivalent(y)),
      (TypeExprKind::Function { params: pa, ret: ra },
       TypeExprKind::Function { params: pb, ret: rb }) =>
        pa.len() == pb.len() && pa.iter().zip(pb).all(|(x, y)| x.equivalent(y))
        && ra.equivalent(rb),
      _ => false,
    }
  }
}

/// The type expression variants.
#[derive(Clone, Debug)]
pub enum TypeExprKind {
  /// A resolved reference to a type definition.
  Resolved(DefId),
  /// An unresolved, possibly qualified name.
  Ident(NamePieces),
  /// `[T; n]` or `[T]`
  Array {
    /// The element type.
    elem: Box<TypeExpr>,
    /// The element count; absent for unsized arrays.
    count: Option<Box<Expr>>,
  },
  /// `*T`, with pointer qualifiers.
  Pointer {
    /// The pointee.
    elem: Box<TypeExpr>,
    /// const/writeonly/far.
    quals: Qualifiers,
  },
  /// `(A, B, C)`
  Tuple(Vec<TypeExpr>),
  /// `func(A, B) : R`
  Function {
    /// The parameter types.
    params: Vec<TypeExpr>,
    /// The return type.
    ret: Box<TypeExpr>,
  },
  /// `typeof(e)`
  TypeOf(Box<Expr>),
}

/// The control-transfer statement kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BranchKind {
  /// Leave the innermost loop.
  Break,
  /// Restart the innermost loop.
  Continue,
  /// Unconditional or conditional jump.
  Goto,
  /// Return from an interrupt handler.
  IrqReturn,
  /// Return from a non-maskable interrupt handler.
  NmiReturn,
  /// Return from a subroutine.
  Return,
  /// Subroutine call.
  Call,
  /// Jump through a far pointer.
  FarGoto,
  /// Far return.
  FarReturn,
  /// Far call.
  FarCall,
}

/// Whether a `struct` declaration lays members out sequentially or overlapped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StructKind {
  /// Members at increasing offsets.
  Struct,
  /// Members all at offset 0.
  Union,
}

/// A declaration attribute, e.g. `#[irq]`.
#[derive(Clone, Debug)]
pub struct Attribute {
  /// The attribute name.
  pub name: Symbol,
  /// The attribute arguments.
  pub args: Vec<Expr>,
  /// The source location.
  pub loc: SourceLoc,
}

/// One member of an `enum` declaration.
#[derive(Clone, Debug)]
pub struct EnumItem {
  /// The member name.
  pub name: Symbol,
  /// The explicit value, if any.
  pub value: Option<Expr>,
  /// The source location.
  pub loc: SourceLoc,
}

/// One member of a `struct`/`union` declaration.
#[derive(Clone, Debug)]
pub struct StructItem {
  /// The member name.
  pub name: Symbol,
  /// The member type.
  pub ty: TypeExpr,
  /// The source location.
  pub loc: SourceLoc,
}

/// One parameter of a `func` declaration.
#[derive(Clone, Debug)]
pub struct FuncParam {
  /// The parameter name.
  pub name: Symbol,
  /// The parameter type.
  pub ty: TypeExpr,
  /// The source location.
  pub loc: SourceLoc,
}

/// A statement node. Every statement has a [`NodeId`], assigned by the
/// producer, which side tables key on.
#[derive(Clone, Debug)]
pub struct Stmt {
  /// The node identity.
  pub id: NodeId,
  /// The statement variant.
  pub kind: StmtKind,
  /// The source location.
  pub loc: SourceLoc,
}

impl Stmt {
  /// Build a statement.
  #[must_use] pub fn new(id: NodeId, kind: StmtKind, loc: SourceLoc) -> Self {
    Self { id, kind, loc }
  }

  /// Build an internal statement that has no user-visible identity.
  #[must_use] pub fn internal(kind: StmtKind, loc: SourceLoc) -> Self {
    Self { id: NodeId::INTERNAL, kind, loc }
  }
}

/// The statement variants.
#[derive(Clone, Debug)]
pub enum StmtKind {
  /// `#[attr] stmt`
  Attribution {
    /// The attributes.
    attrs: Vec<Attribute>,
    /// The attributed declaration.
    body: Box<Stmt>,
  },
  /// `bank name @ addr, ... : [kind; capacity];`
  Bank {
    /// The declared bank names.
    names: Vec<Symbol>,
    /// Per-name fixed origin addresses.
    addresses: Vec<Option<Expr>>,
    /// The bank type, `[bankkind; capacity]`.
    ty: TypeExpr,
  },
  /// `{ ... }`
  Block(Vec<Stmt>),
  /// A control transfer, possibly conditional.
  Branch {
    /// Which transfer.
    kind: BranchKind,
    /// The near/far distance hint; `None` lets layout choose.
    distance: Option<u32>,
    /// The branch condition, if conditional.
    condition: Option<Box<Expr>>,
    /// The destination, for goto/call.
    destination: Option<Box<Expr>>,
    /// The returned value, for `return e`.
    return_value: Option<Box<Expr>>,
  },
  /// `config { key = value, ... }`
  Config(Vec<(Symbol, Expr)>),
  /// `do { body } while cond;`
  DoWhile {
    /// The distance hint for the backward branch.
    distance: Option<u32>,
    /// The loop body.
    body: Box<Stmt>,
    /// The condition tested after the body.
    condition: Box<Expr>,
  },
  /// `enum name : T { ... }`
  Enum {
    /// The enum name.
    name: Symbol,
    /// The underlying integer type.
    underlying: TypeExpr,
    /// The members.
    items: Vec<EnumItem>,
  },
  /// An expression evaluated for its effect.
  ExprStmt(Box<Expr>),
  /// A parsed translation unit.
  File {
    /// The top-level items.
    items: Vec<Stmt>,
    /// The path as written.
    path: Symbol,
    /// The path after import expansion.
    expanded: Symbol,
  },
  /// `for counter in seq { body }`
  For {
    /// The distance hint for the loop branches.
    distance: Option<u32>,
    /// The counter expression (a register or variable).
    counter: Box<Expr>,
    /// The iterated sequence (range, or compile-time array).
    seq: Box<Expr>,
    /// The loop body.
    body: Box<Stmt>,
  },
  /// `func name(params) : ret { body }`
  Func {
    /// Whether calls should inline the body.
    inline: bool,
    /// Whether the function lives in far memory.
    far: bool,
    /// The function name.
    name: Symbol,
    /// The parameters.
    params: Vec<FuncParam>,
    /// The return type.
    ret: Option<TypeExpr>,
    /// The body.
    body: Box<Stmt>,
  },
  /// `if cond { then } else { els }`
  If {
    /// The distance hint for the branches over the arms.
    distance: Option<u32>,
    /// The condition.
    condition: Box<Expr>,
    /// The then-arm.
    then: Box<Stmt>,
    /// The else-arm.
    els: Option<Box<Stmt>>,
  },
  /// `in bank @ dest { ... }` — place contained items into a bank.
  In {
    /// The bank name pieces.
    pieces: NamePieces,
    /// The optional placement origin within the bank.
    dest: Option<Box<Expr>>,
    /// The placed declarations.
    body: Box<Stmt>,
  },
  /// `inline for name in seq { body }` — always unrolled at compile time.
  InlineFor {
    /// The loop variable.
    name: Symbol,
    /// The compile-time sequence.
    seq: Box<Expr>,
    /// The body.
    body: Box<Stmt>,
  },
  /// `import "path";` before import resolution.
  ImportReference {
    /// The imported path.
    path: Symbol,
  },
  /// A synthetic declaration with no source form.
  InternalDeclaration,
  /// `label:`
  Label {
    /// Whether the label is visible to far branches.
    far: bool,
    /// The label name.
    name: Symbol,
  },
  /// `let name = e;` or `let name(params) = e;`
  Let {
    /// The constant name.
    name: Symbol,
    /// Formal parameters; present makes this a compile-time macro.
    params: Option<Vec<Symbol>>,
    /// The unreduced value.
    value: Box<Expr>,
  },
  /// `namespace name { ... }`
  Namespace {
    /// The namespace name.
    name: Symbol,
    /// The contained declarations.
    body: Box<Stmt>,
  },
  /// `struct name { ... }` / `union name { ... }`
  Struct {
    /// struct or union layout.
    kind: StructKind,
    /// The type name.
    name: Symbol,
    /// The members.
    items: Vec<StructItem>,
  },
  /// `typealias name = T;`
  TypeAlias {
    /// The alias name.
    name: Symbol,
    /// The aliased type.
    ty: TypeExpr,
  },
  /// `var`/`const`/`writeonly` declaration of one or more names.
  Var {
    /// const/writeonly/far qualifiers.
    quals: Qualifiers,
    /// The declared names.
    names: Vec<Symbol>,
    /// Per-name fixed addresses (`@ 0x2002`).
    addresses: Vec<Option<Expr>>,
    /// The declared type, if given.
    ty: Option<TypeExpr>,
    /// The initialiser, if given.
    value: Option<Box<Expr>>,
  },
  /// `while cond { body }`
  While {
    /// The distance hint for the loop branches.
    distance: Option<u32>,
    /// The condition.
    condition: Box<Expr>,
    /// The body.
    body: Box<Stmt>,
  },
}
