//! Expression tree nodes.

use cranelift_entity::packed_option::PackedOption;

use super::{Local, Node, SsaDef, Ty};
use crate::valnum::VnPair;

/// Operator of a tree node. At most two children.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Integer constant; the value is in the node's `imm` field.
    IntConst,
    /// Read of a local variable.
    LocalRead,
    /// Store of `arg0` into a local variable. No value.
    StoreLocal,
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Mod,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Left shift.
    Shl,
    /// Right shift.
    Shr,
    /// Arithmetic negation.
    Neg,
    /// Bitwise not.
    Not,
    /// Numeric conversion of `arg0` to the node's type.
    Cast,
    /// Equality compare.
    Eq,
    /// Inequality compare.
    Ne,
    /// Less-than compare.
    Lt,
    /// Less-or-equal compare.
    Le,
    /// Greater-than compare.
    Gt,
    /// Greater-or-equal compare.
    Ge,
    /// Memory load through the address in `arg0`.
    Load,
    /// Array length of the array reference in `arg0`.
    ArrLen,
    /// Address of an array element; loads of these are CSE'd one level
    /// up, at the element address itself.
    ArrElemAddr,
    /// Bounds check of index `arg0` against length `arg1`; throws on
    /// failure, produces no value.
    BoundsCheck,
    /// Evaluate `arg0` for effect, yield `arg1`.
    Comma,
    /// Call. Effect information is carried in the node flags.
    Call,
    /// No operation.
    Nop,
    /// Return `arg0` (or nothing).
    Return,
    /// Ternary selector root.
    Qmark,
    /// Ternary arm pair under a `Qmark`.
    Colon,
}

impl Opcode {
    /// True for the relational operators.
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge
        )
    }

    /// True for childless nodes.
    pub fn is_leaf(self) -> bool {
        matches!(self, Opcode::IntConst | Opcode::LocalRead)
    }

    /// True for constant nodes.
    pub fn is_const(self) -> bool {
        matches!(self, Opcode::IntConst)
    }

    /// Default (execution, size) cost estimates per operator; callers can
    /// override per node. Constants are cheapest, simple ALU ops cheap,
    /// memory and division highest.
    pub fn default_costs(self) -> (u16, u16) {
        match self {
            Opcode::IntConst => (1, 2),
            Opcode::LocalRead | Opcode::Nop => (1, 1),
            Opcode::Add
            | Opcode::Sub
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Not
            | Opcode::Neg
            | Opcode::Shl
            | Opcode::Shr => (2, 2),
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => (2, 2),
            Opcode::Mul | Opcode::Cast => (3, 2),
            Opcode::ArrLen => (4, 3),
            Opcode::Load | Opcode::ArrElemAddr => (4, 3),
            Opcode::Div | Opcode::Mod => (10, 3),
            Opcode::Call => (20, 5),
            Opcode::BoundsCheck => (4, 3),
            Opcode::StoreLocal => (2, 2),
            Opcode::Comma | Opcode::Return | Opcode::Qmark | Opcode::Colon => (0, 0),
        }
    }
}

/// Per-node flag bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeFlags {
    bits: u16,
}

const F_SIDE_EFFECT: u16 = 1 << 0;
const F_HAS_CALL: u16 = 1 << 1;
const F_DONT_CSE: u16 = 1 << 2;
const F_ADDR_MODE_NO_CSE: u16 = 1 << 3;
const F_VOLATILE: u16 = 1 << 4;
const F_MAKE_CSE: u16 = 1 << 5;
const F_NEEDS_RELOC: u16 = 1 << 6;
const F_ALLOC_HELPER: u16 = 1 << 7;

/// Flag bits that propagate from children to parents.
const F_PROPAGATED: u16 = F_SIDE_EFFECT | F_HAS_CALL;

impl NodeFlags {
    /// No flags set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The subtree has a persistent side effect (store, throwing check,
    /// effectful call, volatile access).
    pub fn has_side_effect(self) -> bool {
        self.bits & F_SIDE_EFFECT != 0
    }

    /// Mark a persistent side effect.
    pub fn set_side_effect(&mut self) {
        self.bits |= F_SIDE_EFFECT;
    }

    /// The subtree contains a call.
    pub fn has_call(self) -> bool {
        self.bits & F_HAS_CALL != 0
    }

    /// Mark that the subtree contains a call.
    pub fn set_has_call(&mut self) {
        self.bits |= F_HAS_CALL;
    }

    /// The node was explicitly excluded from CSE.
    pub fn dont_cse(self) -> bool {
        self.bits & F_DONT_CSE != 0
    }

    /// Exclude the node from CSE.
    pub fn set_dont_cse(&mut self) {
        self.bits |= F_DONT_CSE;
    }

    /// The node is part of an addressing mode and must not be split off.
    pub fn addr_mode_no_cse(self) -> bool {
        self.bits & F_ADDR_MODE_NO_CSE != 0
    }

    /// Mark the node as an addressing-mode component.
    pub fn set_addr_mode_no_cse(&mut self) {
        self.bits |= F_ADDR_MODE_NO_CSE;
    }

    /// The node is a volatile access.
    pub fn is_volatile(self) -> bool {
        self.bits & F_VOLATILE != 0
    }

    /// Mark the node volatile.
    pub fn set_volatile(&mut self) {
        self.bits |= F_VOLATILE;
        self.bits |= F_SIDE_EFFECT;
    }

    /// An earlier phase (hoisting) asked for this node to be CSE'd.
    pub fn make_cse(self) -> bool {
        self.bits & F_MAKE_CSE != 0
    }

    /// Request CSE of this node.
    pub fn set_make_cse(&mut self) {
        self.bits |= F_MAKE_CSE;
    }

    /// The constant requires a relocation and cannot share an anchor.
    pub fn needs_reloc(self) -> bool {
        self.bits & F_NEEDS_RELOC != 0
    }

    /// Mark the constant as relocatable.
    pub fn set_needs_reloc(&mut self) {
        self.bits |= F_NEEDS_RELOC;
    }

    /// The call is an allocation helper.
    pub fn is_alloc_helper(self) -> bool {
        self.bits & F_ALLOC_HELPER != 0
    }

    /// Mark the call as an allocation helper.
    pub fn set_alloc_helper(&mut self) {
        self.bits |= F_ALLOC_HELPER;
    }

    pub(crate) fn inherit_from(&mut self, child: NodeFlags) {
        self.bits |= child.bits & F_PROPAGATED;
    }
}

/// CSE candidate annotation on a node.
///
/// Zero means the node does not participate in any candidate; a positive
/// value `+k` marks a (tentative) use of candidate `k`; a negative value
/// `-k` marks a def. The magnitude is a 1-based candidate index and must
/// fit in an `i8`, which bounds the candidate count.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CseTag(i8);

impl CseTag {
    /// The unmarked tag.
    pub const NONE: CseTag = CseTag(0);

    /// Build a use tag for candidate `index` (1-based).
    pub fn mark_use(index: u32) -> CseTag {
        debug_assert!(index >= 1 && index <= i8::MAX as u32);
        CseTag(index as i8)
    }

    /// True if the node participates in some candidate.
    pub fn is_marked(self) -> bool {
        self.0 != 0
    }

    /// True for use tags.
    pub fn is_use(self) -> bool {
        self.0 > 0
    }

    /// True for def tags.
    pub fn is_def(self) -> bool {
        self.0 < 0
    }

    /// The candidate index, or 0 when unmarked.
    pub fn index(self) -> u32 {
        u32::from(self.0.unsigned_abs())
    }

    /// The same candidate, flipped to a def tag.
    pub fn as_def(self) -> CseTag {
        CseTag(-self.0.abs())
    }

    /// Drop the annotation.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// The data stored for every tree node.
#[derive(Clone, Debug)]
pub struct NodeData {
    /// Operator.
    pub op: Opcode,
    /// Result type.
    pub ty: Ty,
    /// Children; unary operators use `args[0]` only.
    pub args: [PackedOption<Node>; 2],
    /// Immediate payload for `IntConst`.
    pub imm: i64,
    /// Byte size for `Struct`-typed nodes.
    pub struct_size: u32,
    /// Local payload for `LocalRead` / `StoreLocal`.
    pub local: PackedOption<Local>,
    /// SSA record for reads/stores of single-def locals.
    pub ssa: PackedOption<SsaDef>,
    /// Execution cost estimate.
    pub cost_ex: u16,
    /// Code size estimate.
    pub cost_sz: u16,
    /// Flag bits.
    pub flags: NodeFlags,
    /// Liberal/conservative value number pair.
    pub vnp: VnPair,
    /// CSE candidate annotation.
    pub cse_tag: CseTag,
}

impl NodeData {
    /// Child `i` if present.
    pub fn arg(&self, i: usize) -> Option<Node> {
        self.args[i].expand()
    }
}
