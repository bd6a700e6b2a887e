//! The builtins registry: primitive types, the compile-time define map,
//! and the pattern/encoding/instruction catalogues seeded by the active
//! platform backend.

use hashbrown::HashMap;

use crate::inst::{Encoding, EncodingId, InstOptions, Instruction, Registry, Signature};
use crate::symbol::{Interner, Symbol};
use crate::types::ast::{EvalCtx, Expr, ExprInfo, ExprKind, Qualifiers, TypeExpr, TypeExprKind};
use crate::types::entity::{BankKind, DefId, DefKind, Definition, Scope, ScopeId};
use crate::types::{IdxVec, NodeId, SourceLoc};

/// A CPU mode attribute, e.g. an accumulator-width mode on 65816-class
/// targets. Attributes in the same group are mutually exclusive.
#[derive(Clone, Debug)]
pub struct ModeAttribute {
  /// The attribute name.
  pub name: Symbol,
  /// The exclusivity group.
  pub group: usize,
  /// The bit this attribute contributes to the compiler's mode flags.
  pub flag: u32,
}

/// Create a definition and bind its name in a scope.
pub fn create_definition(
  defs: &mut IdxVec<DefId, Definition>, scopes: &mut IdxVec<ScopeId, Scope>,
  scope: ScopeId, name: Symbol, kind: DefKind, decl: NodeId, loc: SourceLoc,
) -> DefId {
  let def = defs.push(Definition { name, decl, loc, parent_scope: Some(scope), kind });
  scopes[scope].names.insert(name, def);
  def
}

/// The registry of everything the platform and the language itself bring
/// into scope before user code is seen.
#[derive(Debug)]
pub struct Builtins {
  /// The built-in scope; the outermost parent of the root file's scope.
  pub scope: ScopeId,
  /// The location used for definitions with no source form.
  pub internal_loc: SourceLoc,
  /// `bool`
  pub bool_type: DefId,
  /// `u8`
  pub u8_type: DefId,
  /// `u16`
  pub u16_type: DefId,
  /// `u24`
  pub u24_type: DefId,
  /// `u32`
  pub u32_type: DefId,
  /// `u64`
  pub u64_type: DefId,
  /// `i8`
  pub i8_type: DefId,
  /// `i16`
  pub i16_type: DefId,
  /// `i24`
  pub i24_type: DefId,
  /// `i32`
  pub i32_type: DefId,
  /// `i64`
  pub i64_type: DefId,
  /// `iexpr`, the type of compile-time integers.
  pub iexpr_type: DefId,
  /// The `let` marker type.
  pub let_type: DefId,
  /// The `range` marker type.
  pub range_type: DefId,
  /// The `intrinsic` marker type.
  pub intrinsic_type: DefId,
  /// The `typeof` marker type.
  pub typeof_type: DefId,
  /// `__has(key)`
  pub has_def: DefId,
  /// `__get(key, fallback)`
  pub get_def: DefId,
  /// The compile-time define map consulted by `__has`/`__get`.
  pub defines: HashMap<Symbol, Expr>,
  /// The instruction and encoding catalogues.
  pub registry: Registry,
  /// Wide registers decomposable into narrower ones, low byte first.
  pub register_decompositions: HashMap<DefId, Vec<DefId>>,
  /// Registered CPU mode attributes.
  pub mode_attributes: Vec<ModeAttribute>,
  mode_attributes_by_name: HashMap<Symbol, usize>,
}

/// The language version define, `__version`.
pub const VERSION: i128 = 100;

impl Builtins {
  /// Create the built-in scope and seed the platform-independent
  /// definitions: primitive types, bank kinds, and the define accessors.
  pub fn new(
    interner: &mut Interner,
    defs: &mut IdxVec<DefId, Definition>,
    scopes: &mut IdxVec<ScopeId, Scope>,
    defines: HashMap<Symbol, Expr>,
  ) -> Self {
    let scope = scopes.push(Scope::default());
    let internal_loc = SourceLoc::new(interner.intern("<internal>"), 0);
    let decl = NodeId::INTERNAL;

    macro_rules! define {
      ($name:expr, $kind:expr) => {{
        let name = interner.intern($name);
        create_definition(defs, scopes, scope, name, $kind, decl, internal_loc)
      }}
    }
    macro_rules! int_type {
      ($name:expr, $min:expr, $max:expr, $size:expr) => {
        define!($name, DefKind::BuiltinIntegerType { min: $min, max: $max, size: $size })
      }
    }

    let bool_type = define!("bool", DefKind::BuiltinBoolType);
    let u8_type = int_type!("u8", 0, 0xFF, 1);
    let u16_type = int_type!("u16", 0, 0xFFFF, 2);
    let u24_type = int_type!("u24", 0, 0xFF_FFFF, 3);
    let u32_type = int_type!("u32", 0, 0xFFFF_FFFF, 4);
    let u64_type = int_type!("u64", 0, 0xFFFF_FFFF_FFFF_FFFF, 8);
    let i8_type = int_type!("i8", -0x80, 0x7F, 1);
    let i16_type = int_type!("i16", -0x8000, 0x7FFF, 2);
    let i24_type = int_type!("i24", -0x80_0000, 0x7F_FFFF, 3);
    let i32_type = int_type!("i32", -0x8000_0000, 0x7FFF_FFFF, 4);
    let i64_type = int_type!("i64", -0x8000_0000_0000_0000, 0x7FFF_FFFF_FFFF_FFFF, 8);
    let iexpr_type = define!("iexpr", DefKind::BuiltinIntegerExprType);
    let let_type = define!("let", DefKind::BuiltinLetType);
    let range_type = define!("range", DefKind::BuiltinRangeType);
    let intrinsic_type = define!("intrinsic", DefKind::BuiltinIntrinsicType);
    let typeof_type = define!("typeof", DefKind::BuiltinTypeOfType);

    define!("vardata", DefKind::BuiltinBankType(BankKind::UninitializedRam));
    define!("varinitdata", DefKind::BuiltinBankType(BankKind::InitializedRam));
    define!("constdata", DefKind::BuiltinBankType(BankKind::DataRom));
    define!("prgdata", DefKind::BuiltinBankType(BankKind::ProgramRom));
    define!("chrdata", DefKind::BuiltinBankType(BankKind::CharacterRom));

    let key = interner.intern("key");
    let fallback = interner.intern("fallback");
    let has_def = define!("__has", DefKind::Let { params: vec![key], body: None });
    let get_def = define!("__get", DefKind::Let { params: vec![key, fallback], body: None });

    let mut this = Builtins {
      scope, internal_loc,
      bool_type, u8_type, u16_type, u24_type, u32_type, u64_type,
      i8_type, i16_type, i24_type, i32_type, i64_type,
      iexpr_type, let_type, range_type, intrinsic_type, typeof_type,
      has_def, get_def,
      defines,
      registry: Registry::default(),
      register_decompositions: HashMap::new(),
      mode_attributes: vec![],
      mode_attributes_by_name: HashMap::new(),
    };
    this.add_define_integer(interner.intern("__version"), VERSION);
    this
  }

  /// The define bound to `key`, if one exists.
  #[must_use] pub fn get_define(&self, key: Symbol) -> Option<&Expr> {
    self.defines.get(&key)
  }

  /// Bind an integer define, typed `iexpr` and evaluable at compile time.
  pub fn add_define_integer(&mut self, key: Symbol, value: i128) {
    let loc = self.internal_loc;
    let ty = TypeExpr::new(TypeExprKind::Resolved(self.iexpr_type), loc);
    self.defines.insert(key, Expr::analyzed(ExprKind::Int(value), loc,
      ExprInfo { ctx: EvalCtx::CompileTime, ty, quals: Qualifiers::empty() }));
  }

  /// Bind a boolean define.
  pub fn add_define_boolean(&mut self, key: Symbol, value: bool) {
    let loc = self.internal_loc;
    let ty = TypeExpr::new(TypeExprKind::Resolved(self.bool_type), loc);
    self.defines.insert(key, Expr::analyzed(ExprKind::Bool(value), loc,
      ExprInfo { ctx: EvalCtx::CompileTime, ty, quals: Qualifiers::empty() }));
  }

  /// Register a CPU mode attribute, returning its index.
  pub fn add_mode_attribute(&mut self, name: Symbol, group: usize) -> usize {
    let index = self.mode_attributes.len();
    let flag = 1_u32 << index;
    self.mode_attributes.push(ModeAttribute { name, group, flag });
    self.mode_attributes_by_name.insert(name, index);
    index
  }

  /// Look up a mode attribute by name.
  #[must_use] pub fn find_mode_attribute(&self, name: Symbol) -> Option<usize> {
    self.mode_attributes_by_name.get(&name).copied()
  }

  /// Record that a wide register decomposes into narrower parts.
  pub fn add_register_decomposition(&mut self, reg: DefId, parts: Vec<DefId>) {
    self.register_decompositions.insert(reg, parts);
  }

  /// The decomposition of a register, if one was registered.
  #[must_use] pub fn find_register_decomposition(&self, reg: DefId) -> Option<&[DefId]> {
    self.register_decompositions.get(&reg).map(Vec::as_slice)
  }
}

/// The mutable view a platform backend gets while seeding its registers,
/// intrinsics, encodings and instruction tables.
pub struct SeedCtx<'a> {
  /// The interner.
  pub interner: &'a mut Interner,
  /// The definition arena.
  pub defs: &'a mut IdxVec<DefId, Definition>,
  /// The scope arena.
  pub scopes: &'a mut IdxVec<ScopeId, Scope>,
  /// The builtins registry being filled.
  pub builtins: &'a mut Builtins,
}

impl SeedCtx<'_> {
  /// Create a definition in the built-in scope.
  pub fn define(&mut self, name: &str, kind: DefKind) -> DefId {
    let name = self.interner.intern(name);
    let loc = self.builtins.internal_loc;
    create_definition(self.defs, self.scopes, self.builtins.scope, name, kind,
      NodeId::INTERNAL, loc)
  }

  /// Register a CPU register of the given value type.
  pub fn register(&mut self, name: &str, ty: DefId) -> DefId {
    self.define(name, DefKind::BuiltinRegister { ty })
  }

  /// Register a boolean flag register.
  pub fn flag(&mut self, name: &str) -> DefId {
    let bool_type = self.builtins.bool_type;
    self.define(name, DefKind::BuiltinRegister { ty: bool_type })
  }

  /// Register an intrinsic that produces no value.
  pub fn void_intrinsic(&mut self, name: &str) -> DefId {
    self.define(name, DefKind::BuiltinVoidIntrinsic)
  }

  /// Register an intrinsic that loads into its destination operand.
  pub fn load_intrinsic(&mut self, name: &str, ty: DefId) -> DefId {
    self.define(name, DefKind::BuiltinLoadIntrinsic { ty })
  }

  /// Bind a boolean define such as `__cpu_gb`.
  pub fn add_define_boolean(&mut self, key: &str, value: bool) {
    let key = self.interner.intern(key);
    self.builtins.add_define_boolean(key, value);
  }

  /// Bind an integer define.
  pub fn add_define_integer(&mut self, key: &str, value: i128) {
    let key = self.interner.intern(key);
    self.builtins.add_define_integer(key, value);
  }

  /// Register an encoding.
  pub fn encoding(&mut self, encoding: Encoding) -> EncodingId {
    self.builtins.registry.add_encoding(encoding)
  }

  /// Register an instruction.
  pub fn instruction(
    &mut self, signature: Signature, encoding: EncodingId, options: InstOptions,
    clobbers: &[DefId],
  ) {
    self.builtins.registry.add_instruction(Instruction {
      signature, encoding, options, clobbers: clobbers.iter().copied().collect(),
    });
  }
}
