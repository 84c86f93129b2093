//! Swap legality over CSE annotations.
//!
//! Once defs and uses are labelled (and while the performer is rewriting
//! them), tree reordering must not move a use of a candidate ahead of the
//! def feeding it. `can_swap_trees` answers whether two sibling subtrees,
//! with `a` currently evaluated first, may legally exchange places: the
//! defs inside either side must not intersect the uses inside the other.

use crate::bitvec::{BitVec, BitVecTraits};
use crate::ir::{Function, Node};

/// Accumulate the def and use masks of the subtree at `root`.
fn mask_data(func: &Function, traits: &BitVecTraits, root: Node) -> (BitVec, BitVec) {
    let mut defs = BitVec::empty(traits);
    let mut uses = BitVec::empty(traits);
    for node in func.tree_postorder(root) {
        let tag = func.nodes[node].cse_tag;
        if tag.is_marked() {
            let bit = (tag.index() - 1) as usize;
            if tag.is_def() {
                defs.add(bit);
            } else {
                uses.add(bit);
            }
        }
    }
    (defs, uses)
}

fn can_swap_with_traits(func: &Function, traits: &BitVecTraits, a: Node, b: Node) -> bool {
    let (a_defs, a_uses) = mask_data(func, traits, a);
    let (b_defs, b_uses) = mask_data(func, traits, b);

    // A def on one side ordered against a use of the same candidate on
    // the other pins the current order.
    if a_defs.intersects(&b_uses) {
        return false;
    }
    if b_defs.intersects(&a_uses) {
        return false;
    }
    true
}

/// Whether the execution order of `a` and `b` (with `a` currently first)
/// may be swapped, considering only the CSE defs and uses they contain.
/// `num_candidates` is the method's candidate count.
pub fn can_swap_trees(func: &Function, num_candidates: u32, a: Node, b: Node) -> bool {
    let traits = BitVecTraits::new(num_candidates as usize);
    can_swap_with_traits(func, &traits, a, b)
}
