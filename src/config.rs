//! Optimizer configuration.
//!
//! The pass never reads process-global state; everything it can be steered
//! by is collected in `OptConfig` (behavioral knobs, mostly for testing and
//! heuristic research) and `TargetInfo` (the numeric facts about the
//! target the cost model consults). Both are plain structs injected at
//! pass-entry.

/// Controls CSE of integer constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstCse {
    /// Constants are never CSE candidates.
    Disabled,
    /// Constants are candidates, each distinct value on its own.
    Enabled,
    /// Constants are candidates, and nearby values are folded onto a
    /// shared anchor (load once, adjust with an add).
    EnabledShared,
}

/// What the surrounding compilation is being optimized for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeOptKind {
    /// Optimize for execution time using weighted ref counts.
    BlendedCode,
    /// Optimize for code size using unweighted ref counts.
    SmallCode,
}

/// Behavioral configuration for the CSE pass.
#[derive(Clone, Debug)]
pub struct OptConfig {
    /// Code optimization goal.
    pub code_opt: CodeOptKind,
    /// Constant CSE mode.
    pub const_cse: ConstCse,
    /// Disable the whole pass for matching methods (0 = never). Either a
    /// plain method-count threshold or, with the high nibble set to 0xF, a
    /// ones/zeros mask over the low method-hash bits.
    pub no_cse: u32,
    /// Disable individual promotions by sequence number (0 = never); same
    /// encoding scheme as `no_cse` plus a 0xE rotating variant.
    pub no_cse2: u32,
    /// Restrict `cse_mask` to the method with this hash (0 = all methods).
    pub cse_hash: u32,
    /// Per-attempt promotion enable bitmask. Attempt `i` (0-based) is
    /// allowed iff bit `i` is set; attempts at 32 and beyond are refused.
    pub cse_mask: Option<u32>,
    /// Salt for the random heuristic; also seeds the RL policy sampling.
    /// Setting this selects the random heuristic (unless RL is active).
    pub random_salt: Option<u64>,
    /// Scripted promotion order, 1-based candidate indices. Setting this
    /// selects the replay heuristic (unless RL is active).
    pub replay: Vec<u32>,
    /// Per-step rewards matching `replay`; together with `replay` this
    /// switches the RL heuristic into policy-gradient update mode.
    pub replay_rewards: Vec<f64>,
    /// Initial RL policy parameters. Non-empty selects the RL heuristic.
    pub rl_params: Vec<f64>,
    /// RL learning rate (update mode). Defaults to 0.001.
    pub rl_alpha: Option<f64>,
    /// Use the greedy RL policy instead of softmax sampling.
    pub rl_greedy: bool,
    /// Emit per-decision RL dumps at debug level.
    pub rl_verbose: bool,
    /// Emit per-candidate RL feature rows at debug level.
    pub rl_dump_features: bool,
    /// Cap on the number of locals the register allocator will track;
    /// promotions past it are costed as likely stack-homed.
    pub max_tracked_locals: u32,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            code_opt: CodeOptKind::BlendedCode,
            const_cse: ConstCse::Enabled,
            no_cse: 0,
            no_cse2: 0,
            cse_hash: 0,
            cse_mask: None,
            random_salt: None,
            replay: Vec::new(),
            replay_rewards: Vec::new(),
            rl_params: Vec::new(),
            rl_alpha: None,
            rl_greedy: false,
            rl_verbose: false,
            rl_dump_features: false,
            max_tracked_locals: 512,
        }
    }
}

impl OptConfig {
    /// Parse a comma-separated candidate index list ("3,1,2"). Entries
    /// that don't parse are skipped.
    pub fn parse_replay(s: &str) -> Vec<u32> {
        s.split(',')
            .filter_map(|t| t.trim().parse::<u32>().ok())
            .collect()
    }

    /// Parse a comma-separated list of doubles; non-numbers are skipped.
    pub fn parse_doubles(s: &str) -> Vec<f64> {
        s.split(',')
            .filter_map(|t| t.trim().parse::<f64>().ok())
            .collect()
    }
}

/// Target facts consumed by the promotion cost model.
#[derive(Clone, Debug)]
pub struct TargetInfo {
    /// Callee-saved integer registers usable for enregistration.
    pub callee_saved_regs: u32,
    /// Caller-saved (trashed at calls) integer registers.
    pub callee_trash_regs: u32,
    /// Callee-saved floating point registers. Zero means every float CSE
    /// live across a call pays a spill/reload.
    pub callee_saved_float_regs: u32,
    /// Frame size beyond which local slot displacements need wide
    /// encodings.
    pub large_frame_size: u32,
    /// Frame size beyond which even the reserved-register trick needs the
    /// long form.
    pub huge_frame_size: u32,
    /// How many low bits of an integer constant are folded away when
    /// forming a shared-constant key (12 or 16 depending on the
    /// addressing forms of the target).
    pub shared_const_low_bits: u32,
    /// Largest negative displacement the addressing modes can absorb when
    /// re-anchoring a shared-constant def.
    pub shared_const_slack: i64,
    /// Pointer size in bytes, used to estimate struct copy cost in slots.
    pub ptr_size: u32,
}

impl Default for TargetInfo {
    fn default() -> Self {
        Self {
            callee_saved_regs: 8,
            callee_trash_regs: 7,
            callee_saved_float_regs: 0,
            large_frame_size: 0x1000,
            huge_frame_size: 0x10000,
            shared_const_low_bits: 16,
            shared_const_slack: 255,
            ptr_size: 8,
        }
    }
}
