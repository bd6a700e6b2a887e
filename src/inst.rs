//! The instruction-pattern engine.
//!
//! Each CPU backend registers a catalogue of abstract instruction shapes:
//! a [`Signature`] pairs a semantic operation ([`InstType`]) with a list of
//! operand patterns, and an [`Encoding`] turns a matched instruction into
//! bytes. Signatures narrower than others (in the [`Signature::is_subset_of`]
//! partial order) are kept as specialisations in a DAG, so lookup can walk
//! greedily from a primary signature to the most specific match.

use std::fmt;
use std::rc::Rc;

use arrayvec::ArrayVec;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::symbol::Interner;
use crate::types::ast::{BinaryOp, BranchKind, UnaryOp};
use crate::types::entity::{DefId, Definition};
use crate::types::{IdxVec, mk_id};

mk_id! {
  /// An index into the instruction catalogue.
  InstId,
  /// An index into the encoding catalogue.
  EncodingId,
}

/// A concrete operand tree, produced from an analysed expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
  /// A CPU register or flag.
  Register(DefId),
  /// An integer value. `placeholder` marks a stand-in used while the real
  /// value (an address) is still unknown during size calculation.
  Integer {
    /// The value.
    value: i128,
    /// Whether this is a size-pass stand-in.
    placeholder: bool,
  },
  /// A boolean value.
  Boolean {
    /// The value.
    value: bool,
  },
  /// `*(inner as *uN)`
  Dereference {
    /// Whether the access goes through far memory.
    far: bool,
    /// The access size in bytes.
    size: u8,
    /// The address operand.
    operand: Box<Operand>,
  },
  /// `*((base + subscript * scale) as *uN)`
  Index {
    /// Whether the access goes through far memory.
    far: bool,
    /// The access size in bytes.
    size: u8,
    /// The subscript multiplier.
    subscript_scale: u32,
    /// The base operand.
    operand: Box<Operand>,
    /// The subscript operand.
    subscript: Box<Operand>,
  },
  /// `value $ subscript`
  BitIndex {
    /// The indexed value.
    operand: Box<Operand>,
    /// The bit number.
    subscript: Box<Operand>,
  },
  /// A unary-operator operand, e.g. a post-increment register.
  Unary(UnaryOp, Box<Operand>),
  /// A binary-operator operand.
  Binary(BinaryOp, Box<Operand>, Box<Operand>),
}

impl Operand {
  /// An integer operand with a known value.
  #[must_use] pub fn int(value: i128) -> Self {
    Operand::Integer { value, placeholder: false }
  }

  /// The integer value of this operand; panics on non-integers, which can
  /// only happen if a backend's capture indices are wrong.
  #[must_use] pub fn integer(&self) -> i128 {
    match *self {
      Operand::Integer { value, .. } => value,
      _ => panic!("capture is not an integer"),
    }
  }

  /// A value that renders the operand in source-like syntax.
  #[must_use] pub fn display<'a>(
    &'a self, defs: &'a IdxVec<DefId, Definition>, interner: &'a Interner,
  ) -> OperandDisplay<'a> {
    OperandDisplay { op: self, defs, interner }
  }
}

/// Display adapter for [`Operand`]; register names come from the
/// definition arena.
pub struct OperandDisplay<'a> {
  op: &'a Operand,
  defs: &'a IdxVec<DefId, Definition>,
  interner: &'a Interner,
}

impl OperandDisplay<'_> {
  fn child<'b>(&'b self, op: &'b Operand) -> OperandDisplay<'b> {
    OperandDisplay { op, defs: self.defs, interner: self.interner }
  }
}

impl fmt::Display for OperandDisplay<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.op {
      Operand::Register(def) => write!(f, "{}", self.interner.get(self.defs[*def].name)),
      Operand::Integer { value, placeholder } =>
        if *placeholder { write!(f, "{{integer}}") } else { write!(f, "{value}") },
      Operand::Boolean { value } => write!(f, "{value}"),
      Operand::Dereference { far, size, operand } =>
        write!(f, "*({} as {}*u{})", self.child(operand), if *far { "far " } else { "" },
          u32::from(*size) * 8),
      Operand::Index { far, size, subscript_scale, operand, subscript } => {
        write!(f, "*(({} + {}", self.child(operand), self.child(subscript))?;
        if *subscript_scale > 1 { write!(f, " * {subscript_scale}")? }
        write!(f, ") as {}*u{})", if *far { "far " } else { "" }, u32::from(*size) * 8)
      }
      Operand::BitIndex { operand, subscript } =>
        write!(f, "{} $ {}", self.child(operand), self.child(subscript)),
      Operand::Unary(op, operand) => match op {
        UnaryOp::PostIncrement | UnaryOp::PostDecrement =>
          write!(f, "{}{}", self.child(operand), op.symbol()),
        _ => write!(f, "{}{}", op.symbol(), self.child(operand)),
      },
      Operand::Binary(op, l, r) =>
        write!(f, "({} {} {})", self.child(l), op.symbol(), self.child(r)),
    }
  }
}

/// A pattern over [`Operand`] trees. Shared subpatterns are reference
/// counted so backends can reuse register and immediate shapes freely.
#[derive(Clone, Debug)]
pub enum OperandPattern {
  /// Matches `value $ subscript` structurally.
  BitIndex {
    /// The pattern for the indexed value.
    operand: Rc<OperandPattern>,
    /// The pattern for the bit number.
    subscript: Rc<OperandPattern>,
  },
  /// Matches a boolean of exactly this value.
  Boolean(bool),
  /// Matches whatever the inner pattern matches, and records the matched
  /// operand in the capture list.
  Capture(Rc<OperandPattern>),
  /// Matches a dereference with identical far/size flags.
  Dereference {
    /// Far flag to match exactly.
    far: bool,
    /// Access size to match exactly.
    size: u8,
    /// The pattern for the address.
    operand: Rc<OperandPattern>,
  },
  /// Matches an indexed access with identical far/size/scale. When the
  /// scale is 1, `a[i]` and `i[a]` denote the same address, so the base
  /// and subscript patterns also match against the swapped operands.
  Index {
    /// Far flag to match exactly.
    far: bool,
    /// Access size to match exactly.
    size: u8,
    /// Subscript multiplier to match exactly.
    subscript_scale: u32,
    /// The pattern for the base.
    operand: Rc<OperandPattern>,
    /// The pattern for the subscript.
    subscript: Rc<OperandPattern>,
  },
  /// Matches any integer `>= min`.
  IntegerAtLeast(i128),
  /// Matches any integer in `min ..= max`.
  IntegerRange(i128, i128),
  /// Matches exactly this register.
  Register(DefId),
  /// Matches a unary operand of the same kind.
  Unary(UnaryOp, Rc<OperandPattern>),
}

impl OperandPattern {
  /// A capture of the given pattern.
  #[must_use] pub fn capture(inner: Rc<OperandPattern>) -> Rc<OperandPattern> {
    Rc::new(OperandPattern::Capture(inner))
  }

  /// A pattern matching exactly one integer value.
  #[must_use] pub fn exactly(value: i128) -> Rc<OperandPattern> {
    Rc::new(OperandPattern::IntegerRange(value, value))
  }

  /// Whether this pattern accepts the operand.
  #[must_use] pub fn matches(&self, operand: &Operand) -> bool {
    match self {
      OperandPattern::BitIndex { operand: op, subscript: sp } => {
        if let Operand::BitIndex { operand: o, subscript: s } = operand {
          op.matches(o) && sp.matches(s)
        } else { false }
      }
      OperandPattern::Boolean(value) =>
        matches!(operand, Operand::Boolean { value: v } if v == value),
      OperandPattern::Capture(inner) => inner.matches(operand),
      OperandPattern::Dereference { far, size, operand: op } => {
        if let Operand::Dereference { far: f, size: sz, operand: o } = operand {
          far == f && size == sz && op.matches(o)
        } else { false }
      }
      OperandPattern::Index { far, size, subscript_scale, operand: op, subscript: sp } => {
        if let Operand::Index { far: f, size: sz, subscript_scale: scale, operand: o, subscript: s }
          = operand
        {
          far == f && size == sz && subscript_scale == scale
          && (op.matches(o) && sp.matches(s)
            || *scale == 1 && sp.matches(o) && op.matches(s))
        } else { false }
      }
      OperandPattern::IntegerAtLeast(min) =>
        matches!(operand, Operand::Integer { value, .. } if min <= value),
      OperandPattern::IntegerRange(min, max) =>
        matches!(operand, Operand::Integer { value, .. } if min <= value && value <= max),
      OperandPattern::Register(def) =>
        matches!(operand, Operand::Register(d) if d == def),
      OperandPattern::Unary(kind, op) => {
        if let Operand::Unary(k, o) = operand { kind == k && op.matches(o) } else { false }
      }
    }
  }

  /// Whether every operand accepted by `self` is also accepted by `other`.
  /// Captures are transparent on both sides.
  #[must_use] pub fn is_subset_of(&self, other: &OperandPattern) -> bool {
    if let OperandPattern::Capture(inner) = other {
      return self.is_subset_of(inner)
    }
    match self {
      OperandPattern::BitIndex { operand: op, subscript: sp } => {
        if let OperandPattern::BitIndex { operand: o, subscript: s } = other {
          op.is_subset_of(o) && sp.is_subset_of(s)
        } else { false }
      }
      OperandPattern::Boolean(value) =>
        matches!(other, OperandPattern::Boolean(v) if v == value),
      OperandPattern::Capture(inner) => inner.is_subset_of(other),
      OperandPattern::Dereference { far, size, operand: op } => {
        if let OperandPattern::Dereference { far: f, size: sz, operand: o } = other {
          far == f && size == sz && op.is_subset_of(o)
        } else { false }
      }
      OperandPattern::Index { far, size, subscript_scale, operand: op, subscript: sp } => {
        if let OperandPattern::Index {
          far: f, size: sz, subscript_scale: scale, operand: o, subscript: s,
        } = other {
          far == f && size == sz && subscript_scale == scale
          && op.is_subset_of(o) && sp.is_subset_of(s)
        } else { false }
      }
      OperandPattern::IntegerAtLeast(min) =>
        matches!(other, OperandPattern::IntegerAtLeast(m) if min >= m),
      OperandPattern::IntegerRange(min, max) =>
        matches!(other, OperandPattern::IntegerRange(m, x) if m <= min && max <= x),
      OperandPattern::Register(def) =>
        matches!(other, OperandPattern::Register(d) if d == def),
      OperandPattern::Unary(kind, op) => {
        if let OperandPattern::Unary(k, o) = other {
          kind == k && op.is_subset_of(o)
        } else { false }
      }
    }
  }

  /// Match the operand, appending a reference to the concrete sub-operand
  /// matched by each `Capture`, in left-to-right pattern order. For a
  /// commuted scale-1 index match, captures are appended in the order
  /// corresponding to the commuted positions.
  pub fn extract<'a>(&self, operand: &'a Operand, captures: &mut CaptureList<'a>) -> bool {
    match self {
      OperandPattern::BitIndex { operand: op, subscript: sp } => {
        if let Operand::BitIndex { operand: o, subscript: s } = operand {
          op.extract(o, captures) && sp.extract(s, captures)
        } else { false }
      }
      OperandPattern::Capture(inner) => {
        if inner.matches(operand) {
          captures.push(operand);
          true
        } else { false }
      }
      OperandPattern::Dereference { far, size, operand: op } => {
        if let Operand::Dereference { far: f, size: sz, operand: o } = operand {
          far == f && size == sz && op.extract(o, captures)
        } else { false }
      }
      OperandPattern::Index { far, size, subscript_scale, operand: op, subscript: sp } => {
        if let Operand::Index { far: f, size: sz, subscript_scale: scale, operand: o, subscript: s }
          = operand
        {
          if far != f || size != sz || subscript_scale != scale { return false }
          if op.matches(o) && sp.matches(s) {
            op.extract(o, captures) && sp.extract(s, captures)
          } else if *scale == 1 && sp.matches(o) && op.matches(s) {
            // base[subscript] is *(base + scale * subscript), so the two
            // positions commute at scale 1; extract in swapped order so the
            // captures line up with the pattern.
            sp.extract(o, captures) && op.extract(s, captures)
          } else { false }
        } else { false }
      }
      OperandPattern::Unary(kind, op) => {
        if let Operand::Unary(k, o) = operand {
          kind == k && op.extract(o, captures)
        } else { false }
      }
      OperandPattern::Boolean(..) | OperandPattern::IntegerAtLeast(..)
      | OperandPattern::IntegerRange(..) | OperandPattern::Register(..) => self.matches(operand),
    }
  }
}

/// The captures extracted from one operand root.
pub type CaptureList<'a> = SmallVec<[&'a Operand; 2]>;
/// One capture list per operand root.
pub type CaptureLists<'a> = SmallVec<[CaptureList<'a>; 4]>;

/// The semantic verb of an instruction, the primary key of the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InstType {
  /// A control transfer.
  Branch(BranchKind),
  /// A unary operator.
  Unary(UnaryOp),
  /// A binary operator.
  Binary(BinaryOp),
  /// A platform intrinsic with no result, identified by its definition.
  VoidIntrinsic(DefId),
  /// A platform intrinsic that loads into its first operand.
  LoadIntrinsic(DefId),
}

/// An instruction shape: the verb, the CPU mode flags that must be active,
/// and one pattern per operand.
#[derive(Clone, Debug)]
pub struct Signature {
  /// The semantic operation.
  pub ty: InstType,
  /// Mode flag bits that must all be set for this signature to apply.
  pub required_mode_flags: u32,
  /// The operand patterns, in operand order.
  pub operands: SmallVec<[Rc<OperandPattern>; 4]>,
}

impl Signature {
  /// Construct a signature.
  #[must_use] pub fn new(
    ty: InstType, required_mode_flags: u32,
    operands: impl IntoIterator<Item = Rc<OperandPattern>>,
  ) -> Self {
    Self { ty, required_mode_flags, operands: operands.into_iter().collect() }
  }

  /// Pattern-wise subset: same verb, same mode flags, same arity, and each
  /// operand pattern a subset of the corresponding one.
  #[must_use] pub fn is_subset_of(&self, other: &Signature) -> bool {
    self.ty == other.ty
    && self.required_mode_flags == other.required_mode_flags
    && self.operands.len() == other.operands.len()
    && self.operands.iter().zip(&other.operands).all(|(a, b)| a.is_subset_of(b))
  }

  /// Whether the signature accepts the given mode flags and operand roots.
  #[must_use] pub fn matches(&self, mode_flags: u32, roots: &[Operand]) -> bool {
    if self.required_mode_flags != 0
    && self.required_mode_flags & mode_flags != self.required_mode_flags {
      return false
    }
    self.operands.len() == roots.len()
    && self.operands.iter().zip(roots).all(|(p, o)| p.matches(o))
  }

  /// Fill one capture list per operand root. A root whose pattern contains
  /// no captures contributes the whole root operand as its only capture.
  pub fn extract<'a>(&self, roots: &'a [Operand], lists: &mut CaptureLists<'a>) -> bool {
    lists.clear();
    for (pattern, root) in self.operands.iter().zip(roots) {
      let mut list = CaptureList::new();
      if !pattern.extract(root, &mut list) { return false }
      if list.is_empty() { list.push(root) }
      lists.push(list);
    }
    true
  }
}

/// Per-instruction encoding inputs: the raw opcode bytes and the capture
/// indices the encoder consults.
#[derive(Clone, Debug)]
pub struct InstOptions {
  /// The opcode prefix bytes. The longest registered sequence is the
  /// composite negation form, well under the capacity.
  pub opcode: ArrayVec<u8, 8>,
  /// Indices selecting which capture slot of which operand root each
  /// encoder parameter reads; meaning is per-encoding.
  pub parameter: SmallVec<[usize; 4]>,
}

impl InstOptions {
  /// Construct encoding options.
  #[must_use] pub fn new(
    opcode: impl IntoIterator<Item = u8>, parameter: impl IntoIterator<Item = usize>,
  ) -> Self {
    Self { opcode: opcode.into_iter().collect(), parameter: parameter.into_iter().collect() }
  }
}

/// Why an encoding could not produce bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncodeError {
  /// A PC-relative destination does not fit in a signed byte.
  RelativeOutOfRange {
    /// The offset that was requested.
    offset: i64,
  },
  /// A signed 8-bit operand does not fit.
  SignedOutOfRange {
    /// The value that was requested.
    value: i64,
  },
}

impl fmt::Display for EncodeError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EncodeError::RelativeOutOfRange { .. } =>
        write!(f, "pc-relative offset is outside of representable signed 8-bit range -128..127"),
      EncodeError::SignedOutOfRange { .. } =>
        write!(f, "signed value is outside of representable signed 8-bit range -128..127"),
    }
  }
}

/// The byte sink an encoding writes through. Tracks the absolute address
/// of the instruction being written so PC-relative encodings can compute
/// their offsets.
pub struct Emitter<'a> {
  /// The output buffer.
  pub buf: &'a mut Vec<u8>,
  /// The absolute address of the first byte of this instruction.
  pub address: u32,
}

impl Emitter<'_> {
  /// Append one byte.
  pub fn push_u8(&mut self, b: u8) { self.buf.push(b) }

  /// Append a 16-bit value little-endian.
  pub fn push_u16_le(&mut self, v: u16) {
    self.buf.extend_from_slice(&v.to_le_bytes());
  }

  /// Append a byte slice.
  pub fn extend(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes) }
}

/// A pair of pure functions converting a matched instruction into bytes.
/// `size` is referentially transparent and drives address assignment;
/// `write` produces the final bytes at a known address.
#[derive(Clone, Copy)]
pub struct Encoding {
  /// Compute the emitted byte count.
  pub size: fn(&InstOptions, &CaptureLists<'_>) -> usize,
  /// Write the bytes.
  pub write: fn(&mut Emitter<'_>, &InstOptions, &CaptureLists<'_>) -> Result<(), EncodeError>,
}

impl fmt::Debug for Encoding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Encoding") }
}

/// A registered instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
  /// The shape.
  pub signature: Signature,
  /// How to emit it.
  pub encoding: EncodingId,
  /// Opcode bytes and capture indices for the encoding.
  pub options: InstOptions,
  /// Flag registers whose value the instruction destroys.
  pub clobbers: SmallVec<[DefId; 2]>,
}

/// The instruction catalogue: encodings, instructions, and per-verb
/// primary lists with specialisation DAGs.
#[derive(Default, Debug)]
pub struct Registry {
  /// All registered instructions.
  pub instructions: IdxVec<InstId, Instruction>,
  /// All registered encodings.
  pub encodings: IdxVec<EncodingId, Encoding>,
  primaries: HashMap<InstType, Vec<InstId>>,
  specializations: HashMap<InstId, Vec<InstId>>,
}

impl Registry {
  /// Register an encoding.
  pub fn add_encoding(&mut self, encoding: Encoding) -> EncodingId {
    self.encodings.push(encoding)
  }

  fn subset(&self, a: InstId, b: InstId) -> bool {
    self.instructions[a].signature.is_subset_of(&self.instructions[b].signature)
  }

  /// Register an instruction, inserting it into the specialisation DAG of
  /// its verb: it becomes a child of the narrowest registered signature it
  /// is a subset of, adopting any existing children that are subsets of
  /// it; otherwise it becomes primary.
  pub fn add_instruction(&mut self, instruction: Instruction) -> InstId {
    let ty = instruction.signature.ty;
    let id = self.instructions.push(instruction);

    let mut specialized = false;
    let primaries = self.primaries.entry(ty).or_default().clone();
    for primary in primaries {
      if !self.subset(id, primary) { continue }
      specialized = true;
      debug_assert!(
        !self.subset(primary, id),
        "equivalent instruction signatures registered; insertion would be order-dependent"
      );

      let mut parent = primary;
      'descend: loop {
        if let Some(children) = self.specializations.get(&parent) {
          for &child in children {
            if self.subset(id, child) {
              if self.subset(child, id) {
                debug_assert!(false,
                  "equivalent instruction signatures registered; \
                   insertion would be order-dependent");
                log::warn!("skipping equivalent instruction signature for {ty:?}");
                return id
              }
              parent = child;
              continue 'descend
            }
          }
        }
        break
      }

      let mut children = self.specializations.remove(&parent).unwrap_or_default();
      let mut adopted = vec![];
      children.retain(|&child| {
        if self.subset(child, id) { adopted.push(child); false } else { true }
      });
      children.push(id);
      self.specializations.insert(parent, children);
      if !adopted.is_empty() {
        self.specializations.entry(id).or_default().extend(adopted);
      }
    }

    if !specialized {
      let mut primaries = self.primaries.remove(&ty).unwrap_or_default();
      let mut adopted = vec![];
      primaries.retain(|&primary| {
        if self.subset(primary, id) { adopted.push(primary); false } else { true }
      });
      primaries.push(id);
      self.primaries.insert(ty, primaries);
      if !adopted.is_empty() {
        self.specializations.entry(id).or_default().extend(adopted);
      }
    }
    id
  }

  /// Select the best-matching instruction for a verb and concrete operand
  /// roots: the first matching primary, narrowed greedily to its most
  /// specific matching descendant.
  #[must_use] pub fn select(&self, ty: InstType, mode_flags: u32, roots: &[Operand])
    -> Option<InstId>
  {
    for &primary in self.primaries.get(&ty)? {
      if !self.instructions[primary].signature.matches(mode_flags, roots) { continue }
      let mut best = primary;
      'descend: loop {
        if let Some(children) = self.specializations.get(&best) {
          for &child in children {
            if self.instructions[child].signature.matches(mode_flags, roots) {
              best = child;
              continue 'descend
            }
          }
        }
        return Some(best)
      }
    }
    None
  }

  /// The primary instructions for a verb, for registry introspection.
  #[must_use] pub fn primaries(&self, ty: InstType) -> &[InstId] {
    self.primaries.get(&ty).map_or(&[], Vec::as_slice)
  }

  /// The direct specialisations of an instruction.
  #[must_use] pub fn specializations(&self, id: InstId) -> &[InstId] {
    self.specializations.get(&id).map_or(&[], Vec::as_slice)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn imm(min: i128, max: i128) -> Rc<OperandPattern> {
    Rc::new(OperandPattern::IntegerRange(min, max))
  }

  fn reg(n: u32) -> Rc<OperandPattern> {
    Rc::new(OperandPattern::Register(DefId(n)))
  }

  fn implicit_encoding() -> Encoding {
    Encoding {
      size: |options, _| options.opcode.len(),
      write: |em, options, _| { em.extend(&options.opcode); Ok(()) },
    }
  }

  fn make(registry: &mut Registry, enc: EncodingId, ty: InstType,
    operands: Vec<Rc<OperandPattern>>, opcode: u8) -> InstId
  {
    registry.add_instruction(Instruction {
      signature: Signature::new(ty, 0, operands),
      encoding: enc,
      options: InstOptions::new([opcode], []),
      clobbers: SmallVec::new(),
    })
  }

  #[test]
  fn integer_range_boundaries() {
    let p = imm(0, 0xFF);
    assert!(p.matches(&Operand::int(0)));
    assert!(p.matches(&Operand::int(255)));
    assert!(!p.matches(&Operand::int(-1)));
    assert!(!p.matches(&Operand::int(256)));
  }

  #[test]
  fn range_subset_order() {
    assert!(imm(0, 0).is_subset_of(&imm(0, 255)));
    assert!(!imm(0, 255).is_subset_of(&imm(0, 0)));
    assert!(imm(3, 5).is_subset_of(&imm(3, 5)));
    assert!(OperandPattern::IntegerAtLeast(1).is_subset_of(&OperandPattern::IntegerAtLeast(0)));
    assert!(!OperandPattern::IntegerAtLeast(0).is_subset_of(&OperandPattern::IntegerAtLeast(1)));
    // The subset order relates patterns of the same kind only.
    assert!(!imm(2, 9).is_subset_of(&OperandPattern::IntegerAtLeast(1)));
    assert!(!OperandPattern::IntegerAtLeast(1).is_subset_of(&imm(0, 255)));
    // Captures are transparent on both sides.
    assert!(OperandPattern::capture(imm(0, 7)).is_subset_of(&imm(0, 255)));
    assert!(imm(0, 7).is_subset_of(&OperandPattern::capture(imm(0, 255))));
  }

  #[test]
  fn index_commutes_at_scale_one() {
    let pattern = OperandPattern::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: OperandPattern::capture(imm(0, 0xFFFF)),
      subscript: reg(7),
    };
    let direct = Operand::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: Box::new(Operand::int(0x1234)),
      subscript: Box::new(Operand::Register(DefId(7))),
    };
    let commuted = Operand::Index {
      far: false, size: 1, subscript_scale: 1,
      operand: Box::new(Operand::Register(DefId(7))),
      subscript: Box::new(Operand::int(0x1234)),
    };
    assert!(pattern.matches(&direct));
    assert!(pattern.matches(&commuted));

    let mut captures = CaptureList::new();
    assert!(pattern.extract(&direct, &mut captures));
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].integer(), 0x1234);

    captures.clear();
    assert!(pattern.extract(&commuted, &mut captures));
    assert_eq!(captures.len(), 1, "commuted captures bind the immediate");
    assert_eq!(captures[0].integer(), 0x1234);

    let scaled = OperandPattern::Index {
      far: false, size: 1, subscript_scale: 2,
      operand: OperandPattern::capture(imm(0, 0xFFFF)),
      subscript: reg(7),
    };
    assert!(!scaled.matches(&Operand::Index {
      far: false, size: 1, subscript_scale: 2,
      operand: Box::new(Operand::Register(DefId(7))),
      subscript: Box::new(Operand::int(0x1234)),
    }), "commutativity only applies at scale 1");
  }

  #[test]
  fn extract_fills_empty_lists_with_roots() {
    let sig = Signature::new(InstType::Binary(BinaryOp::Assignment), 0,
      [reg(1), OperandPattern::capture(imm(0, 255))]);
    let roots = [Operand::Register(DefId(1)), Operand::int(5)];
    let mut lists = CaptureLists::new();
    assert!(sig.extract(&roots, &mut lists));
    assert_eq!(lists.len(), 2);
    // The register pattern has no captures, so the whole root stands in.
    assert_eq!(lists[0].len(), 1);
    assert!(matches!(lists[0][0], Operand::Register(DefId(1))));
    assert_eq!(lists[1][0].integer(), 5);
  }

  #[test]
  fn specialization_wins_selection() {
    let mut registry = Registry::default();
    let enc = registry.add_encoding(implicit_encoding());
    let ty = InstType::Binary(BinaryOp::Assignment);
    let wide = make(&mut registry, enc, ty, vec![reg(1), imm(0, 255)], 0xA9);
    let narrow = make(&mut registry, enc, ty, vec![reg(1), imm(0, 0)], 0x64);

    assert_eq!(registry.primaries(ty), &[wide]);
    assert_eq!(registry.specializations(wide), &[narrow]);

    let zero = [Operand::Register(DefId(1)), Operand::int(0)];
    let five = [Operand::Register(DefId(1)), Operand::int(5)];
    assert_eq!(registry.select(ty, 0, &zero), Some(narrow));
    assert_eq!(registry.select(ty, 0, &five), Some(wide));
    assert_eq!(registry.select(ty, 0, &[Operand::int(5)]), None);
  }

  #[test]
  fn insertion_order_does_not_matter() {
    // Insert the specialisation first; the later, wider instruction must
    // become primary and adopt it.
    let mut registry = Registry::default();
    let enc = registry.add_encoding(implicit_encoding());
    let ty = InstType::Binary(BinaryOp::Assignment);
    let narrow = make(&mut registry, enc, ty, vec![reg(1), imm(0, 0)], 0x64);
    let mid = make(&mut registry, enc, ty, vec![reg(1), imm(0, 0xFF)], 0xA9);
    let wide = make(&mut registry, enc, ty, vec![reg(1), imm(0, 0xFFFF)], 0xAD);

    assert_eq!(registry.primaries(ty), &[wide]);
    assert_eq!(registry.specializations(wide), &[mid]);
    assert_eq!(registry.specializations(mid), &[narrow]);
    let zero = [Operand::Register(DefId(1)), Operand::int(0)];
    assert_eq!(registry.select(ty, 0, &zero), Some(narrow));
  }

  #[test]
  fn primaries_form_an_antichain() {
    let mut registry = Registry::default();
    let enc = registry.add_encoding(implicit_encoding());
    let ty = InstType::Binary(BinaryOp::Addition);
    make(&mut registry, enc, ty, vec![reg(1), imm(0, 255)], 0x69);
    make(&mut registry, enc, ty, vec![reg(1), reg(2)], 0x65);
    make(&mut registry, enc, ty, vec![reg(1), imm(0, 0)], 0x0A);

    let primaries = registry.primaries(ty).to_vec();
    for &a in &primaries {
      for &b in &primaries {
        if a != b {
          assert!(!registry.instructions[a].signature
            .is_subset_of(&registry.instructions[b].signature));
        }
      }
      // Every child is a strict subset of its parent.
      for &c in registry.specializations(a) {
        assert!(registry.instructions[c].signature
          .is_subset_of(&registry.instructions[a].signature));
        assert_ne!(a, c);
      }
    }
  }

  #[test]
  fn mode_flags_gate_matching() {
    let sig = Signature::new(InstType::Unary(UnaryOp::PreIncrement), 0b10, [reg(1)]);
    let roots = [Operand::Register(DefId(1))];
    assert!(sig.matches(0b11, &roots));
    assert!(sig.matches(0b10, &roots));
    assert!(!sig.matches(0b01, &roots));
    assert!(!sig.matches(0, &roots));
  }
}
