//! The value-number store.
//!
//! Value numbers are opaque identifiers such that two expressions with the
//! same *normal* number provably compute the same value. A number may also
//! carry an exception set: the set of exceptions the computation is known
//! to possibly raise. The store interns every number so equality is id
//! equality; all of it is dropped with the compilation.
//!
//! The optimizer does not compute value numbers; it only consumes the
//! small algebra below (normal/exception split, exception set lattice
//! operations, constants, and function application for re-deriving
//! compare numbers when a checked bound is rewritten).

use cranelift_entity::entity_impl;
use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{Opcode, Ty};

/// An opaque reference to an interned value number.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueNum(u32);
entity_impl!(ValueNum, "vn");

/// The liberal/conservative value number pair carried by every node.
/// Liberal numbering may assume conditional facts; conservative may not.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VnPair {
    /// The liberal value number.
    pub liberal: ValueNum,
    /// The conservative value number.
    pub conservative: ValueNum,
}

impl VnPair {
    /// A pair with both sides equal.
    pub fn both(vn: ValueNum) -> Self {
        Self {
            liberal: vn,
            conservative: vn,
        }
    }

    /// A pair from distinct sides.
    pub fn new(liberal: ValueNum, conservative: ValueNum) -> Self {
        Self {
            liberal,
            conservative,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum VnData {
    /// A fresh unknown value; `id` keeps each one distinct.
    Opaque { ty: Ty, id: u32 },
    /// A typed integer constant.
    ConstInt { ty: Ty, value: i64 },
    /// An exception item (kind plus the value it depends on).
    ExcItem { kind: u32, operand: ValueNum },
    /// A sorted set of exception items. The empty set is interned once.
    ExcSet(Vec<ValueNum>),
    /// A normal value together with a non-empty exception set.
    WithExc { normal: ValueNum, exc: ValueNum },
    /// A binary operator applied to two numbers.
    Func2 { op: Opcode, args: [ValueNum; 2] },
    /// The number given to value-less trees.
    Void,
}

/// The interning store for value numbers.
pub struct ValueStore {
    data: PrimaryMap<ValueNum, VnData>,
    intern: FxHashMap<VnData, ValueNum>,
    opaque_counter: u32,
    checked_bounds: FxHashSet<ValueNum>,
    void: ValueNum,
    empty_exc: ValueNum,
}

impl ValueStore {
    /// Create a store with the distinguished void and empty-set numbers
    /// pre-interned.
    pub fn new() -> Self {
        let mut store = Self {
            data: PrimaryMap::new(),
            intern: FxHashMap::default(),
            opaque_counter: 0,
            checked_bounds: FxHashSet::default(),
            void: ValueNum(0),
            empty_exc: ValueNum(0),
        };
        store.void = store.intern(VnData::Void);
        store.empty_exc = store.intern(VnData::ExcSet(Vec::new()));
        store
    }

    fn intern(&mut self, data: VnData) -> ValueNum {
        if let Some(&vn) = self.intern.get(&data) {
            return vn;
        }
        let vn = self.data.push(data.clone());
        self.intern.insert(data, vn);
        vn
    }

    /// The number for value-less trees.
    pub fn vn_void(&self) -> ValueNum {
        self.void
    }

    /// The interned empty exception set.
    pub fn empty_exc_set(&self) -> ValueNum {
        self.empty_exc
    }

    /// A brand new unknown value of type `ty`.
    pub fn fresh(&mut self, ty: Ty) -> ValueNum {
        let id = self.opaque_counter;
        self.opaque_counter += 1;
        self.intern(VnData::Opaque { ty, id })
    }

    /// The number of the integer constant `value` at type `ty`.
    pub fn const_int(&mut self, ty: Ty, value: i64) -> ValueNum {
        self.intern(VnData::ConstInt { ty, value })
    }

    /// True if the (normal) number is a known integer constant.
    pub fn is_constant(&self, vn: ValueNum) -> bool {
        matches!(self.data[vn], VnData::ConstInt { .. })
    }

    /// The constant behind `vn`, which must satisfy `is_constant` on its
    /// normal number.
    pub fn coerced_const_value(&self, vn: ValueNum) -> i64 {
        match self.data[self.normal_value(vn)] {
            VnData::ConstInt { value, .. } => value,
            _ => panic!("coerced_const_value on a non-constant number"),
        }
    }

    /// An exception item of the given kind depending on `operand` (e.g. a
    /// null-dereference exception keyed by the address number).
    pub fn exc_item(&mut self, kind: u32, operand: ValueNum) -> ValueNum {
        self.intern(VnData::ExcItem { kind, operand })
    }

    /// The interned set of the given exception items.
    pub fn exc_set(&mut self, items: &[ValueNum]) -> ValueNum {
        let mut sorted: Vec<ValueNum> = items.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        self.intern(VnData::ExcSet(sorted))
    }

    fn exc_items(&self, set: ValueNum) -> &[ValueNum] {
        match &self.data[set] {
            VnData::ExcSet(items) => items,
            _ => panic!("not an exception set number"),
        }
    }

    /// Union of two exception sets.
    pub fn exc_union(&mut self, a: ValueNum, b: ValueNum) -> ValueNum {
        if a == b {
            return a;
        }
        let mut items: SmallVec<[ValueNum; 4]> = SmallVec::new();
        items.extend_from_slice(self.exc_items(a));
        items.extend_from_slice(self.exc_items(b));
        self.exc_set(&items)
    }

    /// Intersection of two exception sets.
    pub fn exc_intersection(&mut self, a: ValueNum, b: ValueNum) -> ValueNum {
        if a == b {
            return a;
        }
        let bs = self.exc_items(b);
        let items: SmallVec<[ValueNum; 4]> = self
            .exc_items(a)
            .iter()
            .copied()
            .filter(|item| bs.contains(item))
            .collect();
        self.exc_set(&items)
    }

    /// True iff exception set `sub` is a subset of `sup`.
    pub fn exc_is_subset(&self, sub: ValueNum, sup: ValueNum) -> bool {
        if sub == sup || sub == self.empty_exc {
            return true;
        }
        let sups = self.exc_items(sup);
        self.exc_items(sub).iter().all(|item| sups.contains(item))
    }

    /// Attach an exception set to a normal number. An empty set yields
    /// the normal number itself.
    pub fn with_exc(&mut self, normal: ValueNum, exc: ValueNum) -> ValueNum {
        let normal = self.normal_value(normal);
        if exc == self.empty_exc {
            return normal;
        }
        self.intern(VnData::WithExc { normal, exc })
    }

    /// Strip the exception set off a number.
    pub fn normal_value(&self, vn: ValueNum) -> ValueNum {
        match self.data[vn] {
            VnData::WithExc { normal, .. } => normal,
            _ => vn,
        }
    }

    /// The exception set of a number; empty if it carries none.
    pub fn exception_set(&self, vn: ValueNum) -> ValueNum {
        match self.data[vn] {
            VnData::WithExc { exc, .. } => exc,
            _ => self.empty_exc,
        }
    }

    /// Both sides of a pair with their exception sets stripped.
    pub fn normal_pair(&self, vnp: VnPair) -> VnPair {
        VnPair::new(
            self.normal_value(vnp.liberal),
            self.normal_value(vnp.conservative),
        )
    }

    /// The exception sets of both sides of a pair.
    pub fn exception_pair(&self, vnp: VnPair) -> VnPair {
        VnPair::new(
            self.exception_set(vnp.liberal),
            self.exception_set(vnp.conservative),
        )
    }

    /// Re-attach per-side exception sets to a pair.
    pub fn pair_with_exc(&mut self, vnp: VnPair, exc: VnPair) -> VnPair {
        VnPair::new(
            self.with_exc(vnp.liberal, exc.liberal),
            self.with_exc(vnp.conservative, exc.conservative),
        )
    }

    /// The number for `op` applied to two numbers.
    pub fn func2(&mut self, op: Opcode, a: ValueNum, b: ValueNum) -> ValueNum {
        self.intern(VnData::Func2 { op, args: [a, b] })
    }

    /// Mark a number as a checked array bound so later range-check
    /// elimination keeps tracking it.
    pub fn set_checked_bound(&mut self, vn: ValueNum) {
        self.checked_bounds.insert(vn);
    }

    /// Was `vn` marked as a checked array bound?
    pub fn is_checked_bound(&self, vn: ValueNum) -> bool {
        self.checked_bounds.contains(&vn)
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}
