//! Promotion heuristics.
//!
//! Four policies decide which viable candidates become temps: the
//! deterministic cost-model heuristic used in production, a random
//! heuristic for stress, a replay heuristic that follows a scripted
//! candidate order, and a parameterized linear-model heuristic with
//! greedy, softmax-sampled and policy-gradient-update modes used for
//! policy research. They form a closed set, dispatched as an enum; the
//! state they share lives in `HeuristicBase`.

use cranelift_entity::packed_option::PackedOption;

use super::{CseId, CsePass, MIN_CSE_COST};
use crate::config::{CodeOptKind, ConstCse, OptConfig};
use crate::ir::{Node, Opcode, Ty};

mod random;
mod replay;
mod rl;
mod standard;

pub(crate) use self::random::Random;
pub(crate) use self::replay::Replay;
pub(crate) use self::rl::Rl;
pub(crate) use self::standard::Standard;

/// Weight of a block executed once per invocation; the unit of all the
/// weighted counts the heuristics reason over.
pub(crate) const UNITY_WEIGHT: f64 = 1.0;

/// How a promotion was justified; recorded in the telemetry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PromotionClass {
    /// Valuable enough that the temp will surely be enregistered.
    Aggressive,
    /// More likely than not to be enregistered.
    Moderate,
    /// Expensive enough to pay off even from a stack home.
    Conservative,
    /// Promoted by the random stress heuristic.
    Random,
    /// Promoted because a script (replay or RL policy) said so.
    Scripted,
}

/// State shared by every heuristic.
pub(crate) struct HeuristicBase {
    /// Working order of candidates; entries are cleared by policies that
    /// must not revisit a candidate.
    pub sort_tab: Vec<PackedOption<CseId>>,
    /// Whether any promotion was performed.
    pub made_changes: bool,
    /// Optimization goal, fixed per compilation.
    pub code_opt: CodeOptKind,
    /// Whether constants may be candidates at all.
    pub enable_const_cse: bool,
    /// Temps created so far.
    pub add_cse_count: u32,
    /// Candidate indices in promotion order; 0-terminated on cleanup.
    pub sequence: Vec<u32>,
}

impl HeuristicBase {
    fn new(config: &OptConfig) -> Self {
        let enable_const_cse = config.const_cse != ConstCse::Disabled;
        log::trace!(
            "constant CSE is {}",
            if enable_const_cse { "enabled" } else { "disabled" }
        );
        Self {
            sort_tab: Vec::new(),
            made_changes: false,
            code_opt: config.code_opt,
            enable_const_cse,
            add_cse_count: 0,
            sequence: Vec::new(),
        }
    }

    /// The legality filter every policy runs during candidate location.
    /// Rejects trees that cannot or should not be split into a temp.
    pub fn can_consider_tree(&self, cse: &CsePass, node: Node, is_return: bool) -> bool {
        let data = &cse.func.nodes[node];

        if data.op == Opcode::IntConst && !self.enable_const_cse {
            return false;
        }

        // Struct values under a return aren't re-shaped safely unless
        // they're vectors.
        if is_return && data.ty == Ty::Struct {
            return false;
        }

        if data.flags.has_side_effect() || data.flags.dont_cse() || data.flags.is_volatile() {
            return false;
        }

        if data.ty == Ty::Void {
            return false;
        }

        let cost = match self.code_opt {
            CodeOptKind::SmallCode => data.cost_sz,
            CodeOptKind::BlendedCode => data.cost_ex,
        };
        if cost < MIN_CSE_COST {
            return false;
        }

        match data.op {
            Opcode::Call => {
                // Allocation helpers make poor candidates: the loads of
                // the allocated object CSE better than the helper itself,
                // and marking the helper only gets the group abandoned on
                // exception-set grounds.
                if data.flags.is_alloc_helper() {
                    return false;
                }
            }
            Opcode::Load => {
                // Element addresses are CSE'd one level up so stores
                // through them can share the address computation too.
                if let Some(addr) = data.arg(0) {
                    if cse.func.nodes[addr].op == Opcode::ArrElemAddr {
                        return false;
                    }
                }
            }
            Opcode::IntConst
            | Opcode::ArrLen
            | Opcode::ArrElemAddr
            | Opcode::Neg
            | Opcode::Not
            | Opcode::Cast
            | Opcode::Sub
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Or
            | Opcode::And
            | Opcode::Xor
            | Opcode::Shr
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Comma => {}
            Opcode::Add | Opcode::Mul | Opcode::Shl => {
                if data.flags.addr_mode_no_cse() {
                    return false;
                }
            }
            Opcode::LocalRead
            | Opcode::StoreLocal
            | Opcode::BoundsCheck
            | Opcode::Nop
            | Opcode::Return
            | Opcode::Qmark
            | Opcode::Colon => return false,
        }

        // Non-leaf trees that compute constants are left for assertion
        // propagation, which keys off the conservative number.
        let conserv_norm = cse.vn.normal_value(data.vnp.conservative);
        if !data.op.is_leaf() && cse.vn.is_constant(conserv_norm) {
            return false;
        }

        true
    }
}

/// The candidate under consideration, with counts picked per the
/// optimization goal.
pub(crate) struct Candidate {
    pub id: CseId,
    pub index: u32,
    pub expr: Node,
    pub def_count: f64,
    pub use_count: f64,
    pub cost: u32,
    pub size: u32,
    pub live_across_call: bool,
    pub is_shared_const: bool,
    pub class: PromotionClass,
}

impl Candidate {
    pub fn new(cse: &CsePass, id: CseId) -> Self {
        let dsc = &cse.candidates[id];
        Self {
            id,
            index: dsc.index,
            expr: dsc.first.node,
            def_count: 0.0,
            use_count: 0.0,
            cost: 0,
            size: 0,
            live_across_call: dsc.live_across_call,
            is_shared_const: dsc.is_shared_const,
            class: PromotionClass::Scripted,
        }
    }

    /// Size-optimized compilations cost by code size with raw counts;
    /// otherwise by execution cost with weighted counts.
    pub fn initialize_counts(&mut self, cse: &CsePass, code_opt: CodeOptKind) {
        let dsc = &cse.candidates[self.id];
        let expr = &cse.func.nodes[self.expr];
        self.size = u32::from(expr.cost_sz);
        match code_opt {
            CodeOptKind::SmallCode => {
                self.cost = self.size;
                self.def_count = f64::from(dsc.def_count);
                self.use_count = f64::from(dsc.use_count);
            }
            CodeOptKind::BlendedCode => {
                self.cost = u32::from(expr.cost_ex);
                self.def_count = dsc.def_weight;
                self.use_count = dsc.use_weight;
            }
        }
    }
}

/// Per-attempt enable mask, a knob for bisecting CSE decisions. Returns
/// `None` when the knob doesn't apply to this method.
pub(crate) fn mask_allows(cse: &mut CsePass, attempt: u32) -> Option<bool> {
    let mask = cse.config.cse_mask?;
    if cse.config.cse_hash != 0 && cse.func.method_hash != cse.config.cse_hash {
        return None;
    }
    // Only the first 32 attempts can be masked; refuse the rest so a
    // bisection stays meaningful.
    if attempt >= 32 {
        log::debug!("attempt {} out of mask range, disabled", attempt);
        return Some(false);
    }
    let allowed = mask & (1u32 << attempt) != 0;
    log::debug!(
        "attempt {} mask {:#010x}: {}",
        attempt,
        mask,
        if allowed { "allowed" } else { "disabled" }
    );
    Some(allowed)
}

/// The promotion policy for one compilation.
pub(crate) enum CseHeuristic {
    /// Deterministic cost-model policy.
    Standard(Standard),
    /// Random stress policy.
    Random(Random),
    /// Scripted replay policy.
    Replay(Replay),
    /// Parameterized linear-model policy.
    Rl(Rl),
}

impl CseHeuristic {
    /// Pick the policy the configuration asks for. The parameterized
    /// policy wins when initial parameters are present (a replay sequence
    /// then selects its update mode rather than plain replay), then
    /// random, then replay, then the standard policy.
    pub fn from_config(config: &OptConfig, method_hash: u32) -> Self {
        let base = HeuristicBase::new(config);
        if !config.rl_params.is_empty() {
            return CseHeuristic::Rl(Rl::new(base, config, method_hash));
        }
        if config.random_salt.is_some() {
            return CseHeuristic::Random(Random::new(base, config, method_hash));
        }
        if !config.replay.is_empty() {
            return CseHeuristic::Replay(Replay::new(base, config));
        }
        CseHeuristic::Standard(Standard::new(base))
    }

    /// Descriptive policy name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            CseHeuristic::Standard(_) => "standard",
            CseHeuristic::Random(_) => "random",
            CseHeuristic::Replay(_) => "replay",
            CseHeuristic::Rl(h) => h.name(),
        }
    }

    pub(crate) fn base(&self) -> &HeuristicBase {
        match self {
            CseHeuristic::Standard(h) => &h.base,
            CseHeuristic::Random(h) => &h.base,
            CseHeuristic::Replay(h) => &h.base,
            CseHeuristic::Rl(h) => &h.base,
        }
    }

    fn base_mut(&mut self) -> &mut HeuristicBase {
        match self {
            CseHeuristic::Standard(h) => &mut h.base,
            CseHeuristic::Random(h) => &mut h.base,
            CseHeuristic::Replay(h) => &mut h.base,
            CseHeuristic::Rl(h) => &mut h.base,
        }
    }

    /// Legality filter used while locating candidates.
    pub(crate) fn consider_tree(&self, cse: &CsePass, node: Node, is_return: bool) -> bool {
        self.base().can_consider_tree(cse, node, is_return)
    }

    /// One-time precomputation once labelling is done.
    pub(crate) fn initialize(&mut self, cse: &CsePass) {
        if let CseHeuristic::Standard(h) = self {
            h.initialize(cse);
        }
    }

    /// Produce the working order of candidates.
    pub(crate) fn sort_candidates(&mut self, cse: &CsePass) {
        if let CseHeuristic::Standard(h) = self {
            h.sort_candidates(cse);
        }
    }

    /// Decide and perform promotions.
    pub(crate) fn consider_candidates(&mut self, cse: &mut CsePass) {
        match self {
            CseHeuristic::Standard(h) => h.consider_candidates(cse),
            CseHeuristic::Random(h) => h.consider_candidates(cse),
            CseHeuristic::Replay(h) => h.consider_candidates(cse),
            CseHeuristic::Rl(h) => h.consider_candidates(cse),
        }
    }

    /// Whether anything was rewritten.
    pub fn made_changes(&self) -> bool {
        self.base().made_changes
    }

    /// Terminate the recorded promotion sequence.
    pub(crate) fn cleanup(&mut self) {
        self.base_mut().sequence.push(0);
    }

    /// Take the recorded promotion sequence.
    pub(crate) fn take_sequence(&mut self) -> Vec<u32> {
        core::mem::take(&mut self.base_mut().sequence)
    }

    /// The updated policy parameters, when an RL update step ran.
    pub(crate) fn rl_updated_params(&self) -> Option<Vec<f64>> {
        match self {
            CseHeuristic::Rl(h) => h.updated_params(),
            _ => None,
        }
    }
}
