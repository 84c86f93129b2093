//! Value-number based common subexpression elimination.
//!
//! The pass runs in phases over a method whose value numbers are already
//! in place:
//!
//! 1. *Locate* walks every statement tree and fingerprints the expressions
//!    a heuristic is willing to consider. Expressions seen more than once
//!    with the same fingerprint become candidates with a 1-based index,
//!    recorded on the node in its `CseTag`.
//! 2. *Dataflow* computes guaranteed availability of each candidate at
//!    block boundaries, with two bits per candidate so that availability
//!    across calls is tracked separately.
//! 3. *Availability labelling* classifies every occurrence as a def (the
//!    value must be computed and saved here) or a use (it can be reloaded),
//!    while reconciling the exception sets promised by defs to uses.
//! 4. A *heuristic* ranks the viable candidates and decides which to
//!    promote; the *performer* rewrites defs into stores to a fresh temp
//!    and uses into reads of it.
//!
//! The pass cannot fail: all error conditions demote candidates or drop
//! individual occurrences, and the phase result only reports whether the
//! IR was changed.

use cranelift_entity::entity_impl;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{PrimaryMap, SecondaryMap};

use crate::bitvec::{BitVec, BitVecTraits};
use crate::config::{OptConfig, TargetInfo};
use crate::fx::FxHashMap;
use crate::ir::{Block, Function, Node, Stmt};
use crate::valnum::{ValueNum, ValueStore};

mod availability;
mod dataflow;
mod heuristic;
mod mask;
mod perform;
mod table;

pub use heuristic::PromotionClass;
pub use mask::can_swap_trees;

pub(crate) use heuristic::CseHeuristic;

/// Hard cap on candidates: the tag index must fit in a signed byte, and
/// the availability bit vectors get two bits per candidate.
pub const MAX_CSE: u32 = 64;

/// Trees cheaper than this are never worth a temp.
pub const MIN_CSE_COST: u16 = 2;

/// Initial bucket count of the candidate hash.
const HASH_SIZE_INITIAL: usize = (MAX_CSE as usize) * 2;
/// The hash grows by this factor...
const HASH_GROWTH_FACTOR: usize = 2;
/// ...whenever the descriptor count reaches this many per bucket.
const HASH_BUCKET_SIZE: usize = 4;

/// What the pass did to the method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PassStatus {
    /// The IR is untouched; dependent analyses stay valid.
    ModifiedNothing,
    /// Expressions were rewritten; dependent analyses must re-run.
    ModifiedEverything,
}

/// Per-promotion telemetry record.
#[derive(Clone, Debug)]
pub struct CseMetric {
    /// 1-based candidate index.
    pub index: u32,
    /// The promotion class the heuristic chose.
    pub class: PromotionClass,
    /// Number of defs rewritten.
    pub def_count: u32,
    /// Number of uses rewritten.
    pub use_count: u32,
    /// The candidate was live across a call.
    pub live_across_call: bool,
}

/// Result of a CSE run.
#[derive(Clone, Debug)]
pub struct CseReport {
    /// Whether the IR changed.
    pub status: PassStatus,
    /// One record per promoted candidate.
    pub metrics: Vec<CseMetric>,
    /// Candidate indices in promotion order, 0-terminated.
    pub sequence: Vec<u32>,
    /// New policy parameters when the RL heuristic ran an update step.
    pub rl_updated_params: Option<Vec<f64>>,
}

/// An opaque reference to a candidate descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CseId(u32);
entity_impl!(CseId, "cse");

/// One sighting of a candidate expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Occurrence {
    /// The expression node.
    pub node: Node,
    /// The statement containing it.
    pub stmt: Stmt,
    /// The block containing the statement.
    pub block: Block,
}

/// Common conservative normal value number across a candidate's defs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConservVn {
    /// No def visited yet.
    Unset,
    /// Every def so far agreed on this number.
    Same(ValueNum),
    /// Defs disagreed; reads of the temp won't carry a conservative
    /// number, which switches off downstream range-check propagation.
    Divergent,
}

/// Descriptor of one CSE candidate (one distinct fingerprint seen at
/// least twice).
pub(crate) struct CseData {
    /// The fingerprint.
    pub key: u64,
    /// Hash chain link.
    pub next_in_bucket: PackedOption<CseId>,
    /// 1-based candidate index; 0 until a duplicate promoted this
    /// descriptor to a real candidate.
    pub index: u32,
    /// The candidate groups nearby integer constants on a shared anchor.
    pub is_shared_const: bool,
    /// Some use sees the value only across a call site.
    pub live_across_call: bool,
    /// The canonical first occurrence.
    pub first: Occurrence,
    /// All occurrences in discovery order; empty until the second
    /// sighting, after which it includes the first.
    pub occurrences: Vec<Occurrence>,
    /// Defs accepted by labelling.
    pub def_count: u32,
    /// Uses accepted by labelling (excluding the implicit use at defs).
    pub use_count: u32,
    /// Profile-weighted def count.
    pub def_weight: f64,
    /// Profile-weighted use count.
    pub use_weight: f64,
    /// Exception set promised to the uses seen so far; `None` once the
    /// candidate is abandoned.
    pub exc_promise: PackedOption<ValueNum>,
    /// Intersection of exception sets of the defs seen so far; `None`
    /// until the first def.
    pub exc_current: PackedOption<ValueNum>,
    /// Conservative normal number common to the defs.
    pub conserv_vn: ConservVn,
    /// Distinct locals in the first occurrence tree.
    pub num_distinct_locals: u16,
    /// Total local references in the first occurrence tree.
    pub num_local_occurrences: u16,
    /// Shared-constant anchor value, chosen by the performer.
    pub const_def_value: i64,
    /// Value number of the anchor.
    pub const_def_vn: PackedOption<ValueNum>,
}

impl CseData {
    /// Candidates we formed but cannot use: abandoned by exception-set
    /// reconciliation, without both defs and uses, or with a dead
    /// profile.
    pub fn is_viable(&self) -> bool {
        if self.exc_promise.is_none() {
            return false;
        }
        if self.def_count == 0 || self.use_count == 0 {
            return false;
        }
        if self.def_weight <= 0.0 || self.use_weight <= 0.0 {
            return false;
        }
        true
    }
}

/// Bit position of "candidate `index` is available".
pub(crate) fn avail_bit(index: u32) -> usize {
    ((index - 1) * 2) as usize
}

/// Bit position of "candidate `index` is available across calls".
pub(crate) fn avail_cross_call_bit(index: u32) -> usize {
    avail_bit(index) + 1
}

/// The CSE engine: per-method state shared by the phases.
pub(crate) struct CsePass<'a> {
    pub func: &'a mut Function,
    pub vn: &'a mut ValueStore,
    pub config: &'a OptConfig,
    pub isa: &'a TargetInfo,

    /// Candidate descriptors.
    pub candidates: PrimaryMap<CseId, CseData>,
    /// Bucket heads of the candidate hash.
    buckets: Vec<PackedOption<CseId>>,
    /// Descriptor count, for growth.
    hash_count: usize,
    /// Grow when `hash_count` reaches this.
    resize_at: usize,
    /// Number of assigned candidate indices.
    pub candidate_count: u32,
    /// Dense table, position `index - 1` holds the descriptor.
    index: Vec<CseId>,
    /// Some fingerprint was seen twice.
    pub found_duplicate: bool,

    /// Width descriptor of the availability sets.
    pub traits: BitVecTraits,
    /// Mask that clears every cross-call bit.
    pub call_kills: BitVec,
    /// Availability on block entry.
    pub cse_in: SecondaryMap<Block, BitVec>,
    /// Availability on block exit.
    pub cse_out: SecondaryMap<Block, BitVec>,
    /// Candidates generated inside the block.
    pub cse_gen: SecondaryMap<Block, BitVec>,

    /// Compares whose conservative number should follow a CSE'd bound.
    pub checked_bound_map: FxHashMap<Node, Node>,

    /// Weight of the block being rewritten, used when unmarking.
    pub cur_weight: f64,
    /// Promotion attempts so far, for the per-attempt config mask.
    pub attempt: u32,
    /// Promotions considered so far, for the `no_cse2` knob.
    promotion_seq: u32,
    /// Telemetry accumulated by the performer.
    pub metrics: Vec<CseMetric>,
}

impl<'a> CsePass<'a> {
    pub fn new(
        func: &'a mut Function,
        vn: &'a mut ValueStore,
        config: &'a OptConfig,
        isa: &'a TargetInfo,
    ) -> Self {
        Self {
            func,
            vn,
            config,
            isa,
            candidates: PrimaryMap::new(),
            buckets: vec![PackedOption::default(); HASH_SIZE_INITIAL],
            hash_count: 0,
            resize_at: HASH_SIZE_INITIAL * HASH_BUCKET_SIZE,
            candidate_count: 0,
            index: Vec::new(),
            found_duplicate: false,
            traits: BitVecTraits::new(0),
            call_kills: BitVec::default(),
            cse_in: SecondaryMap::new(),
            cse_out: SecondaryMap::new(),
            cse_gen: SecondaryMap::new(),
            checked_bound_map: FxHashMap::default(),
            cur_weight: 0.0,
            attempt: 0,
            promotion_seq: 0,
            metrics: Vec::new(),
        }
    }

    /// The descriptor for 1-based candidate `index`.
    pub fn find_dsc(&self, index: u32) -> CseId {
        debug_assert!(index >= 1 && index <= self.candidate_count);
        self.index[(index - 1) as usize]
    }

    /// The dense candidate table in index order.
    pub fn dense_table(&self) -> &[CseId] {
        &self.index
    }

    /// Build the dense index once all candidates are located.
    pub(crate) fn stop(&mut self) {
        if self.candidate_count == 0 {
            return;
        }
        let mut table: Vec<Option<CseId>> = vec![None; self.candidate_count as usize];
        for (id, dsc) in self.candidates.iter() {
            if dsc.index != 0 {
                debug_assert!(dsc.index <= self.candidate_count);
                let slot = &mut table[(dsc.index - 1) as usize];
                if slot.is_none() {
                    *slot = Some(id);
                }
            }
        }
        self.index = table
            .into_iter()
            .map(|slot| slot.expect("candidate index table has a hole"))
            .collect();
    }

    /// Called while removing a tree that still carries CSE annotations.
    /// Uses are unmarked (their counts rolled back at the weight of the
    /// block being rewritten) and may be removed; returns `false` for a
    /// def, which the caller must extract and preserve because removing
    /// it would leave the remaining uses dangling.
    pub fn unmark_use(&mut self, node: Node) -> bool {
        let tag = self.func.nodes[node].cse_tag;
        if !tag.is_marked() {
            return true;
        }
        debug_assert!(self.cur_weight >= 0.0);
        if tag.is_use() {
            let id = self.find_dsc(tag.index());
            let dsc = &mut self.candidates[id];
            log::trace!(
                "unmark CSE use of candidate {} at {:?}: {} -> {}",
                tag.index(),
                node,
                dsc.use_count,
                dsc.use_count.saturating_sub(1)
            );
            debug_assert!(dsc.use_count > 0);
            if dsc.use_count > 0 {
                dsc.use_count -= 1;
                if dsc.use_weight < self.cur_weight {
                    dsc.use_weight = 0.0;
                } else {
                    dsc.use_weight -= self.cur_weight;
                }
            }
            self.func.nodes[node].cse_tag.clear();
            true
        } else {
            false
        }
    }

    /// Per-promotion disable knob; counts every promotion considered.
    pub(crate) fn config_disable_cse2(&mut self) -> bool {
        self.promotion_seq += 1;
        let v = self.config.no_cse2;
        if v == 0 {
            return false;
        }
        let seq = self.promotion_seq;
        if v & 0xF00_0000 == 0xF00_0000 {
            let mask = seq & 0xFFF;
            let zeros = (v >> 12) & 0xFFF;
            let ones = v & 0xFFF;
            if (mask & ones) == ones && (!mask & zeros) == zeros {
                log::debug!("CSE promotion {} disabled by ones/zeros mask", seq);
                return true;
            }
        } else if v & 0xF00_0000 == 0xE00_0000 {
            let mask = seq & 0xFFF;
            let disable = (v & 0xFFF) >> (mask % 12);
            if disable & 1 != 0 {
                log::debug!("CSE promotion {} disabled by rotating mask", seq);
                return true;
            }
        } else if v <= seq {
            log::debug!("CSE promotion {} disabled by threshold", seq);
            return true;
        }
        false
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn bucket_head(&self, h: usize) -> PackedOption<CseId> {
        self.buckets[h]
    }

    pub(crate) fn set_bucket_head(&mut self, h: usize, id: PackedOption<CseId>) {
        self.buckets[h] = id;
    }

    pub(crate) fn note_new_descriptor(&mut self) -> bool {
        let grow = self.hash_count == self.resize_at;
        if grow {
            self.resize_at *= HASH_GROWTH_FACTOR;
        }
        self.hash_count += 1;
        grow
    }

    pub(crate) fn replace_buckets(&mut self, buckets: Vec<PackedOption<CseId>>) {
        self.buckets = buckets;
    }
}

/// Whole-method disable knob, keyed on the method hash.
fn config_disable_cse(config: &OptConfig, method_hash: u32) -> bool {
    let v = config.no_cse;
    if v == 0 {
        return false;
    }
    if v & 0xF00_0000 == 0xF00_0000 {
        let mask = method_hash & 0xFFF;
        let zeros = (v >> 12) & 0xFFF;
        let ones = v & 0xFFF;
        (mask & ones) == ones && (!mask & zeros) == zeros
    } else {
        v <= method_hash.wrapping_add(1)
    }
}

/// Run value-number CSE over `func`.
///
/// The heuristic is chosen from `config`; the default is the standard
/// cost-model heuristic. Returns what changed plus the promotion
/// telemetry.
pub fn do_cse(
    func: &mut Function,
    vn: &mut ValueStore,
    config: &OptConfig,
    isa: &TargetInfo,
) -> CseReport {
    if config_disable_cse(config, func.method_hash) {
        log::debug!("CSE disabled for {} by config", func.name);
        return CseReport {
            status: PassStatus::ModifiedNothing,
            metrics: Vec::new(),
            sequence: Vec::new(),
            rl_updated_params: None,
        };
    }

    let mut heuristic = CseHeuristic::from_config(config, func.method_hash);
    log::trace!("CSE: {} with {} heuristic", func.name, heuristic.name());

    let mut pass = CsePass::new(func, vn, config, isa);
    if pass.locate(&heuristic) {
        pass.init_dataflow();
        pass.dataflow();
        pass.availability();
        heuristic.initialize(&pass);
        heuristic.sort_candidates(&pass);
        heuristic.consider_candidates(&mut pass);
    }
    heuristic.cleanup();

    let status = if heuristic.made_changes() {
        PassStatus::ModifiedEverything
    } else {
        PassStatus::ModifiedNothing
    };
    let metrics = core::mem::take(&mut pass.metrics);
    drop(pass);
    CseReport {
        status,
        metrics,
        sequence: heuristic.take_sequence(),
        rl_updated_params: heuristic.rl_updated_params(),
    }
}

/// Strip every CSE annotation from the method so the pass can run again.
pub fn clear_cse_tags(func: &mut Function) {
    for data in func.nodes.values_mut() {
        data.cse_tag.clear();
    }
}
