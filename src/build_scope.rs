//! The declaration pass: walks the flattened statement tree, creating
//! scopes and definitions. Reduction and code generation later find their
//! context through the `scope_of` and `def_of` side tables keyed by
//! statement [`NodeId`]s.

use crate::builtins::create_definition;
use crate::types::ast::{Attribute, Expr, Stmt, StmtKind};
use crate::types::entity::{DeclAttr, DefId, DefKind, InterruptKind, Scope, ScopeId};
use crate::types::NodeId;
use crate::Compiler;

/// Attributes gathered from enclosing `Attribution` statements, applied to
/// the next declaration.
#[derive(Default)]
struct PendingAttrs {
  interrupt: InterruptKind,
  fallthrough: bool,
  align: Option<Expr>,
}

/// Flatten imports: replace every `ImportReference` with the parsed file
/// from the resolver, suppressing duplicates by expanded path and breaking
/// cycles with an internal no-op declaration.
pub(crate) fn flatten_imports(
  c: &mut Compiler, program: &mut Stmt, resolver: &mut dyn crate::ImportResolver,
) {
  let mut imported = hashbrown::HashSet::new();
  if let StmtKind::File { expanded, .. } = &program.kind {
    imported.insert(*expanded);
  }
  flatten_into(c, program, resolver, &mut imported);
}

fn flatten_into(
  c: &mut Compiler, stmt: &mut Stmt, resolver: &mut dyn crate::ImportResolver,
  imported: &mut hashbrown::HashSet<crate::symbol::Symbol>,
) {
  let StmtKind::File { items, .. } = &mut stmt.kind else { return };
  for item in items {
    let path = match &item.kind {
      StmtKind::ImportReference { path } => Some(*path),
      _ => None,
    };
    if let Some(path) = path {
      let loc = item.loc;
      match resolver.resolve(path, &mut c.interner) {
        Some(mut file) => {
          let expanded = match &file.kind {
            StmtKind::File { expanded, .. } => *expanded,
            _ => {
              c.report.error("import resolver did not produce a file", loc);
              continue
            }
          };
          if imported.insert(expanded) {
            log::debug!("imported {}", c.interner.get(expanded));
            flatten_into(c, &mut file, resolver, imported);
            *item = file;
          } else {
            // Already imported (or an import cycle): keep a placeholder.
            *item = Stmt::internal(StmtKind::InternalDeclaration, loc);
          }
        }
        None => c.report.fatal(
          format!("could not import `{}`", c.interner.get(path)), Some(loc)),
      }
    }
  }
}

/// Run the declaration pass over the flattened program.
pub(crate) fn run(c: &mut Compiler, program: &Stmt) {
  let root = c.scopes.push(Scope::child(c.builtins.scope));
  c.scope_of.insert(program.id, root);
  c.root_scope = Some(root);
  declare(c, root, program, &mut PendingAttrs::default());
}

fn child_scope(c: &mut Compiler, parent: ScopeId, id: NodeId) -> ScopeId {
  let scope = c.scopes.push(Scope::child(parent));
  c.scope_of.insert(id, scope);
  scope
}

fn bind(
  c: &mut Compiler, scope: ScopeId, stmt: &Stmt, name: crate::symbol::Symbol, kind: DefKind,
) -> DefId {
  if let Some(&previous) = c.scopes[scope].names.get(&name) {
    let message = format!("redefinition of `{}`", c.interner.get(name));
    c.report.error(message, stmt.loc);
    let previous_loc = c.defs[previous].loc;
    c.report.note(format!("`{}` was first declared here", c.interner.get(name)), previous_loc);
    return previous
  }
  let def = create_definition(&mut c.defs, &mut c.scopes, scope, name, kind, stmt.id, stmt.loc);
  c.def_of.insert((stmt.id, name), def);
  def
}

fn take_attrs(c: &mut Compiler, attrs: &[Attribute], pending: &mut PendingAttrs) {
  for attr in attrs {
    match DeclAttr::from_str(c.interner.get(attr.name)) {
      Some(kind) => {
        if attr.args.len() != kind.argument_count() {
          c.report.error(format!("attribute `{}` takes {} argument(s)",
            kind.as_str(), kind.argument_count()), attr.loc);
          continue
        }
        match kind {
          DeclAttr::Irq => pending.interrupt = InterruptKind::Irq,
          DeclAttr::Nmi => pending.interrupt = InterruptKind::Nmi,
          DeclAttr::Fallthrough => pending.fallthrough = true,
          DeclAttr::Align => pending.align = Some(attr.args[0].clone()),
        }
      }
      None => {
        let message = format!("unknown attribute `{}`", c.interner.get(attr.name));
        c.report.error(message, attr.loc);
      }
    }
  }
}

#[allow(clippy::too_many_lines)]
fn declare(c: &mut Compiler, scope: ScopeId, stmt: &Stmt, pending: &mut PendingAttrs) {
  match &stmt.kind {
    StmtKind::Attribution { attrs, body } => {
      let mut inner = PendingAttrs::default();
      take_attrs(c, attrs, &mut inner);
      declare(c, scope, body, &mut inner);
    }
    StmtKind::File { items, .. } => {
      for item in items { declare(c, scope, item, &mut PendingAttrs::default()) }
    }
    StmtKind::Block(items) => {
      let block = child_scope(c, scope, stmt.id);
      for item in items { declare(c, block, item, &mut PendingAttrs::default()) }
    }
    StmtKind::Bank { names, addresses, ty } => {
      for (i, &name) in names.iter().enumerate() {
        bind(c, scope, stmt, name, DefKind::Bank {
          ty: ty.clone(),
          origin: addresses.get(i).cloned().flatten(),
          bank: None,
        });
      }
    }
    StmtKind::Namespace { name, body } => {
      // Namespaces may be reopened; later declarations join the first one.
      let member_scope = match c.scopes[scope].names.get(name) {
        Some(&existing) => match c.defs[existing].kind {
          DefKind::Namespace { scope: member_scope } => member_scope,
          _ => {
            let message = format!("redefinition of `{}`", c.interner.get(*name));
            c.report.error(message, stmt.loc);
            return
          }
        },
        None => {
          let member_scope = c.scopes.push(Scope::child(scope));
          bind(c, scope, stmt, *name, DefKind::Namespace { scope: member_scope });
          member_scope
        }
      };
      c.scope_of.insert(stmt.id, member_scope);
      declare(c, member_scope, body, &mut PendingAttrs::default());
    }
    StmtKind::Func { inline, far, name, body, .. } => {
      let func_scope = child_scope(c, scope, stmt.id);
      bind(c, scope, stmt, *name, DefKind::Func {
        inline: *inline,
        far: *far,
        fallthrough: pending.fallthrough,
        interrupt: pending.interrupt,
        scope: func_scope,
        body: None,
        address: crate::bank::Address::default(),
        size: None,
      });
      declare(c, func_scope, body, &mut PendingAttrs::default());
    }
    StmtKind::Label { name, .. } => {
      bind(c, scope, stmt, *name, DefKind::Label { address: crate::bank::Address::default() });
    }
    StmtKind::Let { name, params, value } => {
      bind(c, scope, stmt, *name, DefKind::Let {
        params: params.clone().unwrap_or_default(),
        body: Some((**value).clone()),
      });
    }
    StmtKind::Enum { name, underlying, items } => {
      let member_scope = c.scopes.push(Scope::child(scope));
      let owner = bind(c, scope, stmt, *name, DefKind::Enum {
        underlying: underlying.clone(), member_scope,
      });
      for item in items {
        let def = create_definition(&mut c.defs, &mut c.scopes, member_scope, item.name,
          DefKind::EnumMember { owner, init: item.value.clone(), value: None },
          stmt.id, item.loc);
        c.def_of.insert((stmt.id, item.name), def);
      }
    }
    StmtKind::Struct { kind, name, items } => {
      let member_scope = c.scopes.push(Scope::child(scope));
      let mut members = vec![];
      for item in items {
        members.push(create_definition(&mut c.defs, &mut c.scopes, member_scope, item.name,
          DefKind::StructMember { ty: item.ty.clone(), offset: None }, stmt.id, item.loc));
      }
      bind(c, scope, stmt, *name, DefKind::Struct { kind: *kind, member_scope, members });
    }
    StmtKind::TypeAlias { name, ty } => {
      bind(c, scope, stmt, *name, DefKind::TypeAlias { ty: ty.clone() });
    }
    StmtKind::Var { quals, names, ty, .. } => {
      let align = pending.align.take();
      for &name in names {
        bind(c, scope, stmt, name, DefKind::Var {
          quals: *quals,
          ty: ty.clone(),
          value: None,
          address: crate::bank::Address::default(),
          size: None,
          align: align.as_ref().and_then(Expr::as_int)
            .and_then(|n| u32::try_from(n).ok()),
        });
      }
    }
    StmtKind::In { body, .. } => {
      // `in` places its contents but introduces no scope of its own.
      match &body.kind {
        StmtKind::Block(items) => {
          c.scope_of.insert(body.id, scope);
          for item in items { declare(c, scope, item, &mut PendingAttrs::default()) }
        }
        _ => declare(c, scope, body, &mut PendingAttrs::default()),
      }
    }
    StmtKind::If { then, els, .. } => {
      declare(c, scope, then, &mut PendingAttrs::default());
      if let Some(els) = els { declare(c, scope, els, &mut PendingAttrs::default()) }
    }
    StmtKind::While { body, .. } | StmtKind::DoWhile { body, .. } =>
      declare(c, scope, body, &mut PendingAttrs::default()),
    StmtKind::For { body, .. } => {
      let for_scope = child_scope(c, scope, stmt.id);
      declare(c, for_scope, body, &mut PendingAttrs::default());
    }
    StmtKind::InlineFor { body, .. } => {
      let for_scope = child_scope(c, scope, stmt.id);
      declare(c, for_scope, body, &mut PendingAttrs::default());
    }
    StmtKind::Branch { .. } | StmtKind::Config(..) | StmtKind::ExprStmt(..)
    | StmtKind::ImportReference { .. } | StmtKind::InternalDeclaration => {}
  }
}
