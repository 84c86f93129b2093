//! Availability dataflow.
//!
//! Forward analysis over per-block bit vectors with two bits per
//! candidate: `avail` (the value is available) and `avail_cross_call` (it
//! is also preserved across every intervening call). A call transfers
//! `avail` through but clears `avail_cross_call`, which is how labelling
//! later discovers which candidates are live across calls.
//!
//! One extra *sentinel* bit is allocated past the candidate bits. Every
//! out-set starts as all-ones including the sentinel, while no computed
//! out-set can ever contain it; the first visit of a block therefore
//! always registers as a change and pushes its successors onto the
//! worklist, even when the computed out-set is legitimately all-ones over
//! the real bits.

use std::collections::VecDeque;

use cranelift_entity::SecondaryMap;

use super::{avail_bit, avail_cross_call_bit, CsePass};
use crate::bitvec::{BitVec, BitVecTraits};
use crate::fx::FxHashSet;
use crate::ir::{Block, Opcode};

impl<'a> CsePass<'a> {
    /// Size the bit vectors, seed the gen sets from the located
    /// occurrences, and set up the initial in/out estimates.
    pub(crate) fn init_dataflow(&mut self) {
        let bit_count = (self.candidate_count as usize) * 2 + 1;
        self.traits = BitVecTraits::new(bit_count);

        self.call_kills = BitVec::empty(&self.traits);
        for index in 1..=self.candidate_count {
            self.call_kills.add(avail_bit(index));
        }

        let entry = self.func.entry_block();
        self.cse_in = SecondaryMap::new();
        self.cse_out = SecondaryMap::new();
        self.cse_gen = SecondaryMap::new();
        for &block in &self.func.layout {
            let starts_empty =
                Some(block) == entry || self.func.blocks[block].is_handler_entry;
            self.cse_in[block] = if starts_empty {
                BitVec::empty(&self.traits)
            } else {
                BitVec::full(&self.traits)
            };
            self.cse_out[block] = BitVec::full(&self.traits);
            self.cse_gen[block] = BitVec::empty(&self.traits);
        }

        // Every occurrence gens its avail bit. The cross-call bit is only
        // gen'd when the block has no call at all; occurrences after the
        // last call are patched in below.
        for slot in 0..self.candidate_count {
            let id = self.dense_table()[slot as usize];
            let dsc = &self.candidates[id];
            let index = dsc.index;
            debug_assert!(!dsc.occurrences.is_empty());
            for occ in &dsc.occurrences {
                self.cse_gen[occ.block].add(avail_bit(index));
                if !self.func.blocks[occ.block].has_call {
                    self.cse_gen[occ.block].add(avail_cross_call_bit(index));
                }
            }
        }

        // For blocks with calls, candidates generated after the last call
        // are still available across it: walk backwards until the first
        // call shows up.
        for &block in &self.func.layout {
            if !self.func.blocks[block].has_call {
                continue;
            }
            if self.cse_gen[block].is_empty() {
                continue;
            }
            let stmts = self.func.blocks[block].stmts.clone();
            let mut found_call = false;
            for &stmt in stmts.iter().rev() {
                let order = self.func.stmt_postorder(stmt);
                for &node in order.iter().rev() {
                    let data = &self.func.nodes[node];
                    if data.cse_tag.is_marked() {
                        self.cse_gen[block].add(avail_cross_call_bit(data.cse_tag.index()));
                    }
                    if data.op == Opcode::Call {
                        found_call = true;
                        break;
                    }
                }
                if found_call {
                    break;
                }
            }
        }

        if log::log_enabled!(log::Level::Trace) {
            for &block in &self.func.layout {
                if !self.cse_gen[block].is_empty() {
                    log::trace!("{:?} gen = {}", block, self.format_set(&self.cse_gen[block]));
                }
            }
        }
    }

    /// Run the worklist to a fixed point.
    pub(crate) fn dataflow(&mut self) {
        let entry = self.func.entry_block();
        let mut queue: VecDeque<Block> = self.func.layout.iter().copied().collect();
        let mut queued: FxHashSet<Block> = queue.iter().copied().collect();

        while let Some(block) = queue.pop_front() {
            queued.remove(&block);
            let pre_merge_out = self.cse_out[block].clone();

            // Merge. The entry keeps its empty in-set; so do handler
            // entries, which are only reachable through edges the
            // dataflow deliberately ignores.
            let data = &self.func.blocks[block];
            if Some(block) != entry && !data.is_handler_entry {
                let mut merged = BitVec::full(&self.traits);
                for &pred in &data.preds {
                    merged.intersect_with(&self.cse_out[pred]);
                }
                self.cse_in[block] = merged;
            }
            if self.func.blocks[block].suppress_cse_in {
                self.cse_in[block].clear();
            }

            // Transfer: out = gen ∪ (in ∩ call-kill mask when a call is
            // present).
            let mut through = self.cse_in[block].clone();
            if self.func.blocks[block].has_call && !through.is_empty() {
                through.intersect_with(&self.call_kills);
            }
            let mut out = self.cse_gen[block].clone();
            out.union_with(&through);

            let changed = out != pre_merge_out;
            self.cse_out[block] = out;
            if changed {
                for i in 0..self.func.blocks[block].succs.len() {
                    let succ = self.func.blocks[block].succs[i];
                    if queued.insert(succ) {
                        queue.push_back(succ);
                    }
                }
            }
        }

        if log::log_enabled!(log::Level::Trace) {
            for &block in &self.func.layout {
                log::trace!(
                    "{:?} in = {} out = {}",
                    block,
                    self.format_set(&self.cse_in[block]),
                    self.format_set(&self.cse_out[block]),
                );
            }
        }
    }

    /// Render an availability set as candidate indices, ".c" marking the
    /// cross-call bit.
    pub(crate) fn format_set(&self, set: &BitVec) -> String {
        let mut out = String::new();
        let mut first = true;
        for index in 1..=self.candidate_count {
            if set.contains(avail_bit(index)) {
                if !first {
                    out.push_str(", ");
                }
                out.push_str(&format!(
                    "{:02}{}",
                    index,
                    if set.contains(avail_cross_call_bit(index)) {
                        ".c"
                    } else {
                        ""
                    }
                ));
                first = false;
            }
        }
        if first {
            out.push_str("none");
        }
        out
    }
}
