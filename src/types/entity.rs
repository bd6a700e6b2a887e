//! Definitions and scopes: the result of the declaration pass, stored in
//! two arenas with stable indices so the scope↔definition back-edges are
//! plain ids rather than owning pointers.

use hashbrown::HashMap;

use crate::bank::{Address, BankId};
use crate::symbol::Symbol;
use crate::types::ast::{Expr, Qualifiers, Stmt, StructKind, TypeExpr};
use crate::types::{NodeId, SourceLoc, mk_id};

mk_id! {
  /// An index into the definition arena.
  DefId,
  /// An index into the scope arena.
  ScopeId,
}

macro_rules! make_names {
  {$($(#[$attr0:meta])* enum $name:ident {
    $($(#[$attr:meta])* $x:ident: $e:expr,)*
  })*} => {$(
    $(#[$attr0])*
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub enum $name { $($(#[$attr])* $x),* }

    impl $name {
      /// Evaluate a function on all elements of the type, with their names.
      pub fn scan(#[allow(unused)] mut f: impl FnMut(Self, &'static str)) {
        $(f($name::$x, $e);)*
      }

      /// Convert a string into this type.
      #[allow(clippy::should_implement_trait)]
      #[must_use] pub fn from_str(s: &str) -> Option<Self> {
        match s {
          $($e => Some(Self::$x),)*
          _ => None
        }
      }

      /// The name of this element.
      #[must_use] pub fn as_str(self) -> &'static str {
        match self { $($name::$x => $e),* }
      }
    }
  )*}
}

make_names! {
  /// Built-in value properties reachable through member access.
  enum Property {
    /// `seq.len`, the element count of a compile-time sequence.
    Len: "len",
    /// `T.min_value`, the smallest value of an integer type.
    MinValue: "min_value",
    /// `T.max_value`, the largest value of an integer type.
    MaxValue: "max_value",
  }

  /// Attributes that may decorate declarations.
  enum DeclAttr {
    /// Marks a function as an IRQ handler; `return` becomes `irqreturn`.
    Irq: "irq",
    /// Marks a function as an NMI handler; `return` becomes `nmireturn`.
    Nmi: "nmi",
    /// Suppresses the implicit trailing return of a function.
    Fallthrough: "fallthrough",
    /// `#[align(n)]`: aligns a variable's placement.
    Align: "align",
  }
}

impl DeclAttr {
  /// How many arguments the attribute takes.
  #[must_use] pub fn argument_count(self) -> usize {
    match self {
      DeclAttr::Irq | DeclAttr::Nmi | DeclAttr::Fallthrough => 0,
      DeclAttr::Align => 1,
    }
  }
}

/// What a bank stores, and therefore whether it contributes bytes to the
/// output image.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BankKind {
  /// Zero-fill RAM; addresses only.
  UninitializedRam,
  /// RAM with a ROM-resident initialisation image.
  InitializedRam,
  /// Read-only data in ROM.
  DataRom,
  /// Executable code in ROM.
  ProgramRom,
  /// Character/tile data in ROM.
  CharacterRom,
}

impl BankKind {
  /// Whether the bank contributes bytes to the output container.
  #[must_use] pub fn stored(self) -> bool {
    !matches!(self, BankKind::UninitializedRam)
  }

  /// Whether code and constant data may be placed here.
  #[must_use] pub fn holds_code(self) -> bool {
    matches!(self, BankKind::DataRom | BankKind::ProgramRom | BankKind::CharacterRom)
  }
}

/// Which interrupt discipline a function follows.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum InterruptKind {
  /// An ordinary subroutine.
  #[default]
  None,
  /// An IRQ handler.
  Irq,
  /// An NMI handler.
  Nmi,
}

/// A lexical scope: a name table plus a parent link. Member scopes of
/// namespaces, structs and enums hang off their definitions.
#[derive(Debug, Default)]
pub struct Scope {
  /// The enclosing scope.
  pub parent: Option<ScopeId>,
  /// The names bound in this scope.
  pub names: HashMap<Symbol, DefId>,
}

impl Scope {
  /// A child scope of `parent`.
  #[must_use] pub fn child(parent: ScopeId) -> Self {
    Self { parent: Some(parent), names: HashMap::new() }
  }
}

/// A named definition. Every definition knows its declaration site and,
/// once the declaration pass has run, its parent scope; the parent scope
/// never changes afterwards.
#[derive(Debug)]
pub struct Definition {
  /// The interned name.
  pub name: Symbol,
  /// The declaring statement.
  pub decl: NodeId,
  /// The declaration location.
  pub loc: SourceLoc,
  /// The scope the definition lives in.
  pub parent_scope: Option<ScopeId>,
  /// The definition payload.
  pub kind: DefKind,
}

/// The definition payloads.
#[derive(Debug)]
pub enum DefKind {
  /// A builtin bank kind name such as `prgdata`.
  BuiltinBankType(BankKind),
  /// The builtin `bool` type.
  BuiltinBoolType,
  /// A builtin sized integer type.
  BuiltinIntegerType {
    /// The smallest representable value.
    min: i128,
    /// The largest representable value.
    max: i128,
    /// The size in bytes.
    size: u8,
  },
  /// The builtin `iexpr` type of compile-time integers.
  BuiltinIntegerExprType,
  /// The builtin `intrinsic` marker type.
  BuiltinIntrinsicType,
  /// The builtin `let` marker type.
  BuiltinLetType,
  /// The builtin `range` marker type.
  BuiltinRangeType,
  /// The builtin `typeof` marker type.
  BuiltinTypeOfType,
  /// A CPU register (or a flag, typed `bool`).
  BuiltinRegister {
    /// The value type of the register.
    ty: DefId,
  },
  /// An intrinsic that produces no value, e.g. `push`, `cmp`, `nop`.
  BuiltinVoidIntrinsic,
  /// An intrinsic that loads into its first operand, e.g. `pop`.
  BuiltinLoadIntrinsic {
    /// The type of the loaded value.
    ty: DefId,
  },
  /// A user bank declaration.
  Bank {
    /// The declared bank type expression, `[kind; capacity]`.
    ty: TypeExpr,
    /// The declared fixed origin, unreduced until the reduction pass.
    origin: Option<Expr>,
    /// The bank instance, created during reduction.
    bank: Option<BankId>,
  },
  /// An `enum` type.
  Enum {
    /// The underlying integer type.
    underlying: TypeExpr,
    /// The member scope.
    member_scope: ScopeId,
  },
  /// One member of an enum.
  EnumMember {
    /// The owning enum.
    owner: DefId,
    /// The declared value expression, if any.
    init: Option<Expr>,
    /// The member value, filled by reduction.
    value: Option<i128>,
  },
  /// A function.
  Func {
    /// Whether calls inline the body.
    inline: bool,
    /// Whether the function lives in far memory.
    far: bool,
    /// Suppress the implicit trailing return.
    fallthrough: bool,
    /// IRQ/NMI discipline from attributes.
    interrupt: InterruptKind,
    /// The body scope.
    scope: ScopeId,
    /// The reduced body, filled by reduction.
    body: Option<Stmt>,
    /// The assigned address.
    address: Address,
    /// The body size in bytes, filled by layout.
    size: Option<u32>,
  },
  /// A local code label.
  Label {
    /// The assigned address.
    address: Address,
  },
  /// A compile-time constant, or a macro when it has parameters.
  Let {
    /// The formal parameter names.
    params: Vec<Symbol>,
    /// The unreduced body; `None` for the registry-backed builtins
    /// `__has` and `__get`.
    body: Option<Expr>,
  },
  /// A namespace.
  Namespace {
    /// The member scope.
    scope: ScopeId,
  },
  /// A `struct` or `union` type.
  Struct {
    /// Sequential or overlapped layout.
    kind: StructKind,
    /// The member scope.
    member_scope: ScopeId,
    /// The members in declaration order.
    members: Vec<DefId>,
  },
  /// One member of a struct or union.
  StructMember {
    /// The member type.
    ty: TypeExpr,
    /// The byte offset within the aggregate, filled by reduction.
    offset: Option<u32>,
  },
  /// A type alias.
  TypeAlias {
    /// The aliased type.
    ty: TypeExpr,
  },
  /// A variable or constant.
  Var {
    /// const/writeonly/far qualifiers.
    quals: Qualifiers,
    /// The declared type; may be inferred from the initialiser.
    ty: Option<TypeExpr>,
    /// The reduced initialiser.
    value: Option<Expr>,
    /// The assigned address.
    address: Address,
    /// The storage size in bytes, filled by reduction.
    size: Option<u32>,
    /// Placement alignment from `#[align(n)]`.
    align: Option<u32>,
  },
}

impl Definition {
  /// Whether the definition names a type.
  #[must_use] pub fn is_type(&self) -> bool {
    matches!(self.kind,
      DefKind::BuiltinBoolType | DefKind::BuiltinIntegerType { .. }
      | DefKind::BuiltinIntegerExprType | DefKind::BuiltinIntrinsicType
      | DefKind::BuiltinLetType | DefKind::BuiltinRangeType
      | DefKind::BuiltinTypeOfType | DefKind::Enum { .. }
      | DefKind::Struct { .. } | DefKind::TypeAlias { .. })
  }

  /// The assigned address, if this kind of definition carries one.
  #[must_use] pub fn address(&self) -> Option<&Address> {
    match &self.kind {
      DefKind::Func { address, .. } | DefKind::Label { address }
      | DefKind::Var { address, .. } => Some(address),
      _ => None,
    }
  }

  /// The member scope, for definitions that own one.
  #[must_use] pub fn member_scope(&self) -> Option<ScopeId> {
    match self.kind {
      DefKind::Enum { member_scope, .. } | DefKind::Struct { member_scope, .. } =>
        Some(member_scope),
      DefKind::Namespace { scope } => Some(scope),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn name_tables_round_trip() {
    Property::scan(|p, s| assert_eq!(Property::from_str(s), Some(p)));
    DeclAttr::scan(|a, s| assert_eq!(DeclAttr::from_str(s), Some(a)));
    assert_eq!(Property::from_str("len"), Some(Property::Len));
    assert_eq!(DeclAttr::from_str("align"), Some(DeclAttr::Align));
    assert_eq!(DeclAttr::from_str("banana"), None);
    assert_eq!(DeclAttr::Align.argument_count(), 1);
  }
}
