//! Candidate location: fingerprinting, the candidate hash, and index
//! assignment.
//!
//! Every expression the heuristic will consider is mapped to a 64-bit
//! fingerprint key. Two expressions with equal keys are known to produce
//! equal values, so the second sighting of a key turns its descriptor into
//! a real candidate with a 1-based index, recorded in the node tags.

use cranelift_entity::packed_option::PackedOption;
use smallvec::SmallVec;

use super::{CseData, CseHeuristic, CseId, CsePass, Occurrence, ConservVn, MAX_CSE};
use crate::config::ConstCse;
use crate::ir::{Block, CseTag, Local, Node, Opcode, Stmt};

/// Shared-constant keys set the top bit; value numbers are 32-bit ids, so
/// the key spaces can never collide.
const SHARED_CONST_KEY_BIT: u64 = 1 << 63;

/// Fold the low bits out of a constant and move the rest into the
/// shared-constant key space.
pub(crate) fn encode_shared_const(value: i64, low_bits: u32) -> u64 {
    ((value as u64) >> low_bits) | SHARED_CONST_KEY_BIT
}

/// Is this key a shared-constant key?
pub(crate) fn is_shared_const_key(key: u64) -> bool {
    key & SHARED_CONST_KEY_BIT != 0
}

/// Recover the (upper bits of the) constant group from a key.
pub(crate) fn decode_shared_const(key: u64, low_bits: u32) -> i64 {
    ((key & !SHARED_CONST_KEY_BIT) << low_bits) as i64
}

/// The bucket for `key` in a table of `size` buckets.
fn key_to_bucket(key: u64, size: usize) -> usize {
    let mut hash = key as u32 ^ (key >> 32) as u32;
    hash = hash.wrapping_mul(size as u32 + 1);
    hash >>= 7;
    (hash as usize) % size
}

impl<'a> CsePass<'a> {
    /// Walk the method and assign candidate indices. Returns false when no
    /// fingerprint was seen twice, in which case the whole pass is a no-op.
    pub(crate) fn locate(&mut self, heuristic: &CseHeuristic) -> bool {
        let blocks = self.func.layout.clone();
        for block in blocks {
            let stmts = self.func.blocks[block].stmts.clone();
            for stmt in stmts {
                let root = self.func.stmts[stmt].root;
                let is_return = self.func.nodes[root].op == Opcode::Return;
                let mut has_bound_candidate = false;
                for node in self.func.tree_postorder(root) {
                    if self.func.nodes[node].op.is_compare() && has_bound_candidate {
                        // The compare may be a function of the checked
                        // bound we just saw; remember it so its value
                        // number can follow the bound if the bound is
                        // CSE'd.
                        self.update_checked_bound_map(node);
                    }

                    if !heuristic.consider_tree(self, node, is_return) {
                        continue;
                    }

                    let index = self.index_tree(node, stmt, block);
                    if index != 0 {
                        debug_assert_eq!(self.func.nodes[node].cse_tag.index(), index);
                        if self.func.nodes[node].op == Opcode::ArrLen {
                            has_bound_candidate = true;
                        }
                    }
                }
            }
        }

        if !self.found_duplicate {
            return false;
        }
        self.stop();
        true
    }

    /// Fingerprint `node` and record the occurrence. Returns the candidate
    /// index, or 0 while the expression has no duplicate yet (or the
    /// candidate cap is hit).
    pub(crate) fn index_tree(&mut self, node: Node, stmt: Stmt, block: Block) -> u32 {
        let enable_shared = self.config.const_cse == ConstCse::EnabledShared;
        let (op, ty, imm, flags, vnp) = {
            let d = &self.func.nodes[node];
            (d.op, d.ty, d.imm, d.flags, d.vnp)
        };

        // Candidates group by the *normal* liberal number: expressions
        // whose exception sets differ may still share one computation, and
        // labelling reconciles the sets later. The exceptions to this rule
        // are commas that add exceptions over their value (keyed on the
        // full number so they form their own group) and shared constants
        // (keyed on their upper bits).
        let vn_lib = vnp.liberal;
        let vn_lib_norm = self.vn.normal_value(vn_lib);
        let mut is_shared_const = false;
        let key: u64;
        if op == Opcode::Comma {
            let op2 = self.func.nodes[node].arg(1).expect("comma has a value operand");
            let vn_op2 = self.func.nodes[op2].vnp.liberal;
            if vn_op2 != vn_lib {
                key = u64::from(vn_lib.as_u32());
            } else {
                key = u64::from(vn_lib_norm.as_u32());
            }
            debug_assert_eq!(self.vn.normal_value(vn_op2), vn_lib_norm);
        } else if enable_shared
            && op == Opcode::IntConst
            && !flags.needs_reloc()
            && (imm == 0 || !ty.is_gc())
        {
            debug_assert!(self.vn.is_constant(vn_lib_norm));
            let value = self.vn.coerced_const_value(vn_lib_norm);
            key = encode_shared_const(value, self.isa.shared_const_low_bits);
            is_shared_const = true;
        } else {
            key = u64::from(vn_lib_norm.as_u32());
        }
        debug_assert_eq!(is_shared_const, is_shared_const_key(key));

        let mut hval = key_to_bucket(key, self.bucket_count());

        // Walk the bucket chain for a matching descriptor. Integer
        // constants additionally split by type so a temp of the wrong
        // width is never substituted.
        let mut matched: Option<CseId> = None;
        let mut cur = self.bucket_head(hval);
        while let Some(id) = cur.expand() {
            let dsc = &self.candidates[id];
            cur = dsc.next_in_bucket;
            if dsc.key != key {
                continue;
            }
            if op == Opcode::IntConst && ty != self.func.nodes[dsc.first.node].ty {
                continue;
            }
            matched = Some(id);
            break;
        }

        let Some(id) = matched else {
            // First sighting of this key: new descriptor, unless the
            // candidate cap means it could never become a candidate.
            if self.candidate_count < MAX_CSE {
                if self.note_new_descriptor() {
                    hval = self.grow_hash(key);
                }
                let empty = self.vn.empty_exc_set();
                let dsc = CseData {
                    key,
                    next_in_bucket: self.bucket_head(hval),
                    index: 0,
                    is_shared_const: false,
                    live_across_call: false,
                    first: Occurrence { node, stmt, block },
                    occurrences: Vec::new(),
                    def_count: 0,
                    use_count: 0,
                    def_weight: 0.0,
                    use_weight: 0.0,
                    exc_promise: Some(empty).into(),
                    exc_current: PackedOption::default(),
                    conserv_vn: ConservVn::Unset,
                    num_distinct_locals: 0,
                    num_local_occurrences: 0,
                    const_def_value: 0,
                    const_def_vn: PackedOption::default(),
                };
                let id = self.candidates.push(dsc);
                self.set_bucket_head(hval, id.into());
            }
            return 0;
        };

        if self.candidates[id].occurrences.is_empty() {
            // Second sighting. When the first occurrence dominates this
            // one but this one carries more exceptions, the first could
            // never be a valid def for it (a type check on a value
            // already proven to be of that type raises nothing, while a
            // later unproven check still throws): let the later node be
            // the canonical first occurrence, and so the def, instead.
            // Same-block is the dominance proxy.
            let first = self.candidates[id].first;
            if block == first.block {
                let prev_vn_lib = self.func.nodes[first.node].vnp.liberal;
                debug_assert_eq!(self.vn.normal_value(prev_vn_lib), vn_lib_norm);
                if prev_vn_lib != vn_lib {
                    let prev_exc = self.vn.exception_set(prev_vn_lib);
                    let cur_exc = self.vn.exception_set(vn_lib);
                    if self.vn.exc_is_subset(prev_exc, cur_exc) {
                        self.func.nodes[first.node].cse_tag.clear();
                        let index = self.candidates[id].index;
                        self.candidates[id].first = Occurrence { node, stmt, block };
                        if index != 0 {
                            self.func.nodes[node].cse_tag = CseTag::mark_use(index);
                        }
                        return index;
                    }
                }
            }

            self.candidates[id].occurrences.push(first);
            self.candidates[id].is_shared_const = is_shared_const;
        }

        self.candidates[id].occurrences.push(Occurrence { node, stmt, block });
        self.found_duplicate = true;

        let index = self.candidates[id].index;
        if index != 0 {
            self.func.nodes[node].cse_tag = CseTag::mark_use(index);
            return index;
        }

        // First duplicate for the key: allocate an index.
        if self.candidate_count == MAX_CSE {
            log::debug!("candidate cap reached, not using {:?}", node);
            return 0;
        }
        self.candidate_count += 1;
        let index = self.candidate_count;
        self.candidates[id].index = index;

        let first_node = self.candidates[id].occurrences[0].node;
        debug_assert!(!self.func.nodes[first_node].cse_tag.is_marked());
        self.func.nodes[first_node].cse_tag = CseTag::mark_use(index);
        self.func.nodes[node].cse_tag = CseTag::mark_use(index);

        self.compute_num_locals(id);

        if is_shared_const_key(key) {
            log::trace!(
                "candidate {:02} shared-const group {:#x} in {:?} [cost={}, size={}]",
                index,
                decode_shared_const(key, self.isa.shared_const_low_bits),
                block,
                self.func.nodes[node].cost_ex,
                self.func.nodes[node].cost_sz,
            );
        } else {
            log::trace!(
                "candidate {:02} key={:#x} in {:?} [cost={}, size={}]",
                index,
                key,
                block,
                self.func.nodes[node].cost_ex,
                self.func.nodes[node].cost_sz,
            );
        }
        index
    }

    fn grow_hash(&mut self, key: u64) -> usize {
        let new_size = self.bucket_count() * super::HASH_GROWTH_FACTOR;
        let mut new_buckets = vec![PackedOption::<CseId>::default(); new_size];
        for h in 0..self.bucket_count() {
            let mut cur = self.bucket_head(h);
            while let Some(id) = cur.expand() {
                let next = self.candidates[id].next_in_bucket;
                let nh = key_to_bucket(self.candidates[id].key, new_size);
                self.candidates[id].next_in_bucket = new_buckets[nh];
                new_buckets[nh] = id.into();
                cur = next;
            }
        }
        self.replace_buckets(new_buckets);
        key_to_bucket(key, new_size)
    }

    /// Count the locals referenced by the candidate's first tree. Feature
    /// input for the parameterized heuristic; an 8-entry scratch table is
    /// plenty for candidate-sized trees, and the walk just stops if it
    /// overflows.
    fn compute_num_locals(&mut self, id: CseId) {
        let root = self.candidates[id].first.node;
        let mut locals: SmallVec<[(Local, u16); 8]> = SmallVec::new();
        let mut occurrences: u16 = 0;
        'walk: for n in self.func.tree_postorder(root) {
            if let Some(local) = self.func.nodes[n].local.expand() {
                occurrences += 1;
                for entry in &mut locals {
                    if entry.0 == local {
                        entry.1 += 1;
                        continue 'walk;
                    }
                }
                if locals.len() >= 8 {
                    break;
                }
                locals.push((local, 1));
            }
        }
        let dsc = &mut self.candidates[id];
        dsc.num_distinct_locals = locals.len() as u16;
        dsc.num_local_occurrences = occurrences;
    }

    /// If `cmp` computes a relation over a candidate checked bound (or a
    /// bound plus/minus an offset), remember it so the performer can keep
    /// its conservative number aligned when the bound is rewritten.
    fn update_checked_bound_map(&mut self, cmp: Node) {
        debug_assert!(self.func.nodes[cmp].op.is_compare());
        let mut bound = None;
        'outer: for i in 0..2 {
            let Some(child) = self.func.nodes[cmp].arg(i) else {
                continue;
            };
            if self.is_checked_bound_candidate(child) {
                bound = Some(child);
                break;
            }
            if matches!(self.func.nodes[child].op, Opcode::Add | Opcode::Sub) {
                for j in 0..2 {
                    let Some(grandchild) = self.func.nodes[child].arg(j) else {
                        continue;
                    };
                    if self.is_checked_bound_candidate(grandchild) {
                        bound = Some(grandchild);
                        break 'outer;
                    }
                }
            }
        }
        if let Some(bound) = bound {
            self.checked_bound_map.insert(bound, cmp);
        }
    }

    fn is_checked_bound_candidate(&self, node: Node) -> bool {
        let d = &self.func.nodes[node];
        d.cse_tag.is_marked()
            && self
                .vn
                .is_checked_bound(self.vn.normal_value(d.vnp.conservative))
    }
}
