//! Use/def labelling.
//!
//! With the dataflow solved, walk every block with a running set of
//! available candidates (seeded from the block's in-set). An occurrence
//! that is already available is a *use*; otherwise it is a *def* and makes
//! the candidate available. Defs flip the sign of the node tag.
//!
//! Labelling also reconciles exception sets. Expressions with one normal
//! number usually produce one exception set, but arithmetic identities
//! ((p.a - p.a) has the value 0 yet still null-checks p) and load
//! forwarding can produce the same value with fewer exceptions. Each
//! candidate tracks the intersection of the exception sets its defs
//! produce (`exc_current`) and the union its uses rely on
//! (`exc_promise`); a def that cannot honor the promise abandons the
//! candidate, and a use that needs more than the defs provide is dropped
//! on its own.

use super::{avail_bit, avail_cross_call_bit, ConservVn, CsePass};
use crate::bitvec::BitVec;
use crate::ir::Opcode;

impl<'a> CsePass<'a> {
    /// Classify every occurrence as a def or use and accumulate the
    /// per-candidate counts.
    pub(crate) fn availability(&mut self) {
        log::trace!("labeling CSEs with use/def information");
        let mut available = BitVec::empty(&self.traits);

        let blocks = self.func.layout.clone();
        for block in blocks {
            available.clone_from(&self.cse_in[block]);
            let weight = self.func.blocks[block].weight;

            let stmts = self.func.blocks[block].stmts.clone();
            for stmt in stmts {
                for node in self.func.stmt_postorder(stmt) {
                    let tag = self.func.nodes[node].cse_tag;
                    let mut is_use = false;
                    let mut is_def = false;

                    if tag.is_marked() {
                        let index = tag.index();
                        let id = self.find_dsc(index);

                        is_use = available.contains(avail_bit(index));
                        is_def = !is_use;

                        // A use that is not preserved across the calls
                        // between its def and here makes the candidate
                        // live across a call.
                        if is_use
                            && !self.candidates[id].live_across_call
                            && !available.contains(avail_cross_call_bit(index))
                        {
                            self.candidates[id].live_across_call = true;
                            log::trace!("candidate {:02} is now live across a call", index);
                        }
                        if is_def {
                            debug_assert!(!available.contains(avail_cross_call_bit(index)));
                        }
                        log::trace!(
                            "{:?} {:?} {} of candidate {:02} [weight={}]",
                            block,
                            node,
                            if is_use { "use" } else { "def" },
                            index,
                            weight,
                        );

                        if self.candidates[id].exc_promise.is_none() {
                            // Earlier defs disagreed on exceptions; the
                            // candidate is abandoned and its remaining
                            // occurrences just drop their tags.
                            self.func.nodes[node].cse_tag.clear();
                            log::trace!("candidate {:02} was abandoned, clearing tag", index);
                            continue;
                        }

                        let exc = self
                            .vn
                            .exception_set(self.func.nodes[node].vnp.liberal);

                        if is_def {
                            if self.candidates[id].exc_current.is_none() {
                                self.candidates[id].exc_current = Some(exc).into();
                            }

                            let promise = self.candidates[id]
                                .exc_promise
                                .expand()
                                .expect("candidate is not abandoned");
                            if promise != self.vn.empty_exc_set() {
                                // A use already relies on `promise`; this
                                // def must be able to produce it.
                                if self.vn.exc_is_subset(promise, exc) {
                                    let current = self.candidates[id]
                                        .exc_current
                                        .expand()
                                        .expect("first def recorded the set");
                                    if current != exc {
                                        let inter = self.vn.exc_intersection(current, exc);
                                        debug_assert!(self.vn.exc_is_subset(inter, current));
                                        self.candidates[id].exc_current = Some(inter).into();
                                    }
                                } else {
                                    // This def cannot produce what the
                                    // uses were promised: abandon the
                                    // candidate for good.
                                    self.candidates[id].exc_promise = Default::default();
                                    self.func.nodes[node].cse_tag.clear();
                                    log::trace!(
                                        "candidate {:02} abandoned: def breaks the exception promise",
                                        index,
                                    );
                                    continue;
                                }
                            }

                            if !super::table::is_shared_const_key(self.candidates[id].key) {
                                let conserv = self
                                    .vn
                                    .normal_value(self.func.nodes[node].vnp.conservative);
                                self.candidates[id].conserv_vn =
                                    match self.candidates[id].conserv_vn {
                                        ConservVn::Unset => ConservVn::Same(conserv),
                                        ConservVn::Same(prev) if prev != conserv => {
                                            ConservVn::Divergent
                                        }
                                        other => other,
                                    };
                            }

                            self.candidates[id].def_count += 1;
                            self.candidates[id].def_weight += weight;
                            self.func.nodes[node].cse_tag = tag.as_def();

                            available.add(avail_bit(index));
                            available.add(avail_cross_call_bit(index));
                        } else {
                            if exc != self.vn.empty_exc_set() {
                                match self.candidates[id].exc_current.expand() {
                                    None => {
                                        // A use before any def: possible in
                                        // a bottom-tested loop. Extend the
                                        // promise for the defs to come.
                                        let promise = self.candidates[id]
                                            .exc_promise
                                            .expand()
                                            .expect("candidate is not abandoned");
                                        let union = self.vn.exc_union(promise, exc);
                                        self.candidates[id].exc_promise = Some(union).into();
                                    }
                                    Some(current) => {
                                        if self.vn.exc_is_subset(exc, current) {
                                            let promise = self.candidates[id]
                                                .exc_promise
                                                .expand()
                                                .expect("candidate is not abandoned");
                                            let union = self.vn.exc_union(promise, exc);
                                            self.candidates[id].exc_promise =
                                                Some(union).into();
                                        }
                                    }
                                }

                                let promise = self.candidates[id]
                                    .exc_promise
                                    .expand()
                                    .expect("candidate is not abandoned");
                                if !self.vn.exc_is_subset(exc, promise) {
                                    // This one use needs an exception no
                                    // def promises; skip the use, keep the
                                    // candidate.
                                    self.func.nodes[node].cse_tag.clear();
                                    log::trace!(
                                        "use of candidate {:02} needs unpromised exceptions, skipping it",
                                        index,
                                    );
                                    continue;
                                }
                            }

                            self.candidates[id].use_count += 1;
                            self.candidates[id].use_weight += weight;
                        }
                    }

                    // Calls kill the cross-call bits of everything alive,
                    // unless the call itself was just classified: a use
                    // will be replaced by a local read (nothing to kill),
                    // and a def (a helper call that materializes the
                    // value) re-establishes its own bit after the kill.
                    if self.func.nodes[node].op == Opcode::Call && !available.is_empty() {
                        if !is_use {
                            available.intersect_with(&self.call_kills);
                            if is_def {
                                let index = self.func.nodes[node].cse_tag.index();
                                available.add(avail_cross_call_bit(index));
                            }
                        }
                    }
                }
            }
        }
    }
}
