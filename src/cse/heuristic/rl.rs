//! The parameterized (reinforcement-learning) heuristic.
//!
//! Candidates are scored by a linear model over a small feature vector;
//! stopping is always one of the scored actions. Three modes share the
//! model:
//!
//! * *greedy* — always take the most-preferred action;
//! * *softmax* — sample actions with probability proportional to
//!   `exp(preference)`;
//! * *update* — replay a previously recorded sequence whose per-step
//!   rewards are known, and move the parameters along the policy
//!   gradient: likely choices with good rewards are strongly encouraged,
//!   unlikely ones mildly, and bad rewards push the other way.
//!
//! Keeping both the preference computation and its gradient in the
//! compiler keeps the two in sync; the training driver only shuttles
//! sequences and rewards.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{Candidate, HeuristicBase, UNITY_WEIGHT};
use crate::config::OptConfig;
use crate::cse::{perform, CseId, CsePass, MIN_CSE_COST};
use crate::ir::Opcode;

const NUM_PARAMS: usize = 25;
/// Boolean features are scaled so their dynamic range matches the
/// numeric features, roughly [0..5].
const BOOLEAN_SCALE: f64 = 5.0;
/// Longest sequence an update can span: the candidate cap plus the
/// stopping step.
const MAX_STEPS: usize = 65;

const DE_MINIMIS: f64 = 1e-3;

struct Choice {
    dsc: Option<CseId>,
    /// Candidate index, 0 for the stopping action; greedy tie-break.
    index: u32,
    preference: f64,
    softmax: f64,
}

pub(crate) struct Rl {
    pub base: HeuristicBase,
    params: [f64; NUM_PARAMS],
    rng: SmallRng,
    alpha: f64,
    update_mode: bool,
    greedy: bool,
    script: Vec<u32>,
    rewards: [f64; MAX_STEPS],
    register_pressure: u32,
    local_weights: Vec<f64>,
    likelihoods: Vec<f64>,
    base_likelihoods: Vec<f64>,
    verbose: bool,
    dump_features: bool,
    did_update: bool,
}

impl Rl {
    pub fn new(base: HeuristicBase, config: &OptConfig, method_hash: u32) -> Self {
        let mut params = [0.0; NUM_PARAMS];
        for (slot, &p) in params.iter_mut().zip(config.rl_params.iter()) {
            *slot = p;
        }
        if config.rl_params.len() < NUM_PARAMS {
            log::debug!(
                "too few policy parameters (expected {}), trailing are zero",
                NUM_PARAMS
            );
        } else if config.rl_params.len() > NUM_PARAMS {
            log::debug!(
                "too many policy parameters (expected {}), trailing ignored",
                NUM_PARAMS
            );
        }

        let update_mode = !config.replay.is_empty() && !config.replay_rewards.is_empty();
        let mut rewards = [0.0; MAX_STEPS];
        if update_mode {
            for (slot, &r) in rewards.iter_mut().zip(config.replay_rewards.iter()) {
                *slot = r;
            }
        }

        let salt = config.random_salt.unwrap_or(0);
        Self {
            base,
            params,
            rng: SmallRng::seed_from_u64(salt ^ u64::from(method_hash)),
            alpha: config.rl_alpha.unwrap_or(0.001),
            update_mode,
            greedy: config.rl_greedy,
            script: config.replay.clone(),
            rewards,
            register_pressure: 0,
            local_weights: Vec::new(),
            likelihoods: Vec::new(),
            base_likelihoods: Vec::new(),
            verbose: config.rl_verbose,
            dump_features: config.rl_dump_features,
            did_update: false,
        }
    }

    pub fn name(&self) -> &'static str {
        if self.update_mode {
            "rl policy gradient update"
        } else if self.greedy {
            "rl policy gradient greedy"
        } else {
            "rl policy gradient stochastic"
        }
    }

    /// The new parameters after an update run.
    pub fn updated_params(&self) -> Option<Vec<f64>> {
        if self.did_update {
            Some(self.params.to_vec())
        } else {
            None
        }
    }

    pub fn consider_candidates(&mut self, cse: &mut CsePass) {
        self.base.sort_tab = cse.dense_table().iter().map(|&id| id.into()).collect();
        self.register_pressure = cse.isa.callee_trash_regs + cse.isa.callee_saved_regs;
        self.capture_local_weights(cse);

        if self.update_mode {
            self.update_parameters(cse);
        } else if self.greedy {
            self.greedy_policy(cse);
        } else {
            self.softmax_policy(cse);
        }

        if !self.likelihoods.is_empty() {
            log::debug!("likelihoods {:?}", self.likelihoods);
        }
        if !self.base_likelihoods.is_empty() {
            log::debug!("base likelihoods {:?}", self.base_likelihoods);
        }
    }

    /// Normalized weights of the enregisterable integer locals, highest
    /// first: where the temp of the next CSE would rank as the locals
    /// compete for registers.
    fn capture_local_weights(&mut self, cse: &CsePass) {
        for local in cse.func.locals.tracked_by_weight() {
            let data = cse.func.locals.get(local);
            if data.ty.is_floating() {
                continue;
            }
            self.local_weights.push(data.ref_wtd / UNITY_WEIGHT);
        }
    }

    fn dump_choices(&self, choices: &[Choice], pick: usize) {
        if !self.verbose {
            return;
        }
        for (i, choice) in choices.iter().enumerate() {
            let marker = if i == pick { "=>" } else { "  " };
            if choice.index != 0 {
                log::debug!(
                    "{}{:2}: candidate {:02} preference {:.7} likelihood {:.7}",
                    marker,
                    i,
                    choice.index,
                    choice.preference,
                    choice.softmax
                );
            } else {
                log::debug!(
                    "{}{:2}: QUIT    preference {:.7} likelihood {:.7}",
                    marker,
                    i,
                    choice.preference,
                    choice.softmax
                );
            }
        }
    }

    fn greedy_policy(&mut self, cse: &mut CsePass) {
        loop {
            let choices = self.build_choices(cse);
            let pick = choose_greedy(&choices);
            self.dump_choices(&choices, pick);
            let choice = &choices[pick];
            let softmax = choice.softmax;
            let Some(id) = choice.dsc else {
                self.likelihoods.push(softmax);
                break;
            };
            self.promote(cse, id);
            self.likelihoods.push(softmax);
        }
    }

    fn softmax_policy(&mut self, cse: &mut CsePass) {
        let mut first = true;
        loop {
            let mut choices = self.build_choices(cse);
            softmax(&mut choices);
            let pick = self.sample(&choices);
            self.dump_choices(&choices, pick);

            if first {
                for option in &choices {
                    self.base_likelihoods
                        .push(option.dsc.map_or(0.0, |id| f64::from(cse.candidates[id].index)));
                    self.base_likelihoods.push(option.softmax);
                }
                first = false;
            }

            let choice = &choices[pick];
            let softmax_val = choice.softmax;
            let Some(id) = choice.dsc else {
                self.likelihoods.push(softmax_val);
                break;
            };
            self.promote(cse, id);
            self.likelihoods.push(softmax_val);
        }
    }

    /// Replay the recorded sequence, accumulating the policy-gradient
    /// delta per step, then fold the delta into the parameters.
    fn update_parameters(&mut self, cse: &mut CsePass) {
        if cse.candidate_count == 0 {
            return;
        }
        let mut delta = [0.0; NUM_PARAMS];
        let script = self.script.clone();
        let n = cse.candidate_count;
        let mut step = 0;

        while step < script.len().min(MAX_STEPS) {
            let number = script[step];
            // A zero entry terminates the recorded sequence.
            if number == 0 {
                break;
            }
            if number > n {
                log::debug!("invalid candidate number {}", number);
                step += 1;
                continue;
            }

            let mut choices = self.build_choices(cse);
            softmax(&mut choices);

            cse.attempt += 1;
            let slot = (number - 1) as usize;
            let Some(id) = self.base.sort_tab[slot].expand() else {
                step += 1;
                continue;
            };
            self.base.sort_tab[slot] = Default::default();
            if !cse.candidates[id].is_viable() {
                // Off-policy sequences may name non-viable candidates;
                // ignore them.
                step += 1;
                continue;
            }

            let reward = self.rewards[step];
            self.update_parameters_step(cse, Some(id), &choices, reward, &mut delta);

            // Actually do the CSE so the state evolves as it did when the
            // sequence was recorded.
            let mut cand = Candidate::new(cse, id);
            cand.initialize_counts(cse, self.base.code_opt);
            perform::perform_cse(cse, &mut self.base, &mut cand);
            self.base.made_changes = true;
            step += 1;
        }

        // If the sequence stopped early, the stopping action gets the
        // final update.
        let mut choices = self.build_choices(cse);
        if choices.len() > 1 {
            softmax(&mut choices);
            let reward = self.rewards[step.min(MAX_STEPS - 1)];
            self.update_parameters_step(cse, None, &choices, reward, &mut delta);
        }

        for (p, d) in self.params.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        self.did_update = true;
        log::debug!("updated policy parameters {:?}", self.params);
    }

    fn update_parameters_step(
        &mut self,
        cse: &CsePass,
        dsc: Option<CseId>,
        choices: &[Choice],
        reward: f64,
        delta: &mut [f64; NUM_PARAMS],
    ) {
        let current = self.features(cse, dsc);

        // The gradient of log softmax: this step's features minus the
        // softmax-weighted mean over all available actions.
        let mut adjustment = [0.0; NUM_PARAMS];
        for choice in choices {
            let cf = self.features(cse, choice.dsc);
            for (a, f) in adjustment.iter_mut().zip(cf.iter()) {
                *a += choice.softmax * f;
            }
        }

        for i in 0..NUM_PARAMS {
            delta[i] += self.alpha * reward * (current[i] - adjustment[i]);
        }
    }

    fn promote(&mut self, cse: &mut CsePass, id: CseId) {
        let index = cse.candidates[id].index;
        debug_assert!(cse.candidates[id].is_viable());
        self.base.sort_tab[(index - 1) as usize] = Default::default();
        cse.attempt += 1;

        let mut cand = Candidate::new(cse, id);
        cand.initialize_counts(cse, self.base.code_opt);
        log::trace!("policy promoting candidate {:02}", index);
        perform::perform_cse(cse, &mut self.base, &mut cand);
        self.base.made_changes = true;
    }

    fn build_choices(&self, cse: &CsePass) -> Vec<Choice> {
        let mut choices = Vec::with_capacity(self.base.sort_tab.len() + 1);
        for slot in &self.base.sort_tab {
            let Some(id) = slot.expand() else {
                continue;
            };
            if !cse.candidates[id].is_viable() {
                continue;
            }
            choices.push(Choice {
                dsc: Some(id),
                index: cse.candidates[id].index,
                preference: self.preference(cse, Some(id)),
                softmax: 0.0,
            });
        }
        // Doing nothing is always an option.
        choices.push(Choice {
            dsc: None,
            index: 0,
            preference: self.preference(cse, None),
            softmax: 0.0,
        });
        choices
    }

    fn preference(&self, cse: &CsePass, dsc: Option<CseId>) -> f64 {
        let features = self.features(cse, dsc);
        if self.dump_features {
            log::debug!(
                "features,{:02},{:?}",
                dsc.map_or(0, |id| cse.candidates[id].index),
                features
            );
        }
        features
            .iter()
            .zip(self.params.iter())
            .map(|(f, p)| f * p)
            .sum()
    }

    /// The feature vector of a candidate, or of the stopping action when
    /// `dsc` is `None`.
    fn features(&self, cse: &CsePass, dsc: Option<CseId>) -> [f64; NUM_PARAMS] {
        let mut features = [0.0; NUM_PARAMS];
        let Some(id) = dsc else {
            self.stopping_features(&mut features);
            return features;
        };

        let dsc = &cse.candidates[id];
        let expr = &cse.func.nodes[dsc.first.node];
        let cost_ex = f64::from(expr.cost_ex);
        let adj = -DE_MINIMIS.ln();

        features[0] = cost_ex;
        features[1] = adj + dsc.use_weight.max(DE_MINIMIS).ln();
        features[2] = adj + dsc.def_weight.max(DE_MINIMIS).ln();
        features[3] = f64::from(expr.cost_sz);
        features[4] = f64::from(dsc.use_count);
        features[5] = f64::from(dsc.def_count);

        let live_across_call = dsc.live_across_call;
        features[6] = BOOLEAN_SCALE * f64::from(live_across_call as u8);
        features[7] = BOOLEAN_SCALE * f64::from(expr.ty.uses_int_reg() as u8);

        let is_constant = expr.op.is_const();
        let is_shared = dsc.is_shared_const;
        features[8] = BOOLEAN_SCALE * f64::from((is_constant && !is_shared) as u8);
        features[9] = BOOLEAN_SCALE * f64::from(is_shared as u8);

        let is_min_cost = expr.cost_ex == MIN_CSE_COST;
        let is_low_cost = expr.cost_ex <= MIN_CSE_COST + 1;
        features[10] = BOOLEAN_SCALE * f64::from(is_min_cost as u8);

        // Constant and low-cost candidates historically need extra
        // scrutiny, so they get joint features.
        features[11] = BOOLEAN_SCALE * f64::from((is_constant && live_across_call) as u8);
        features[12] = BOOLEAN_SCALE * f64::from((is_constant && is_min_cost) as u8);
        features[13] = BOOLEAN_SCALE * f64::from((is_min_cost && live_across_call) as u8);

        let num_blocks = cse.func.layout.len().max(1);
        let mut is_make_cse = false;
        let mut min_pos = usize::MAX;
        let mut max_pos = 0;
        for occ in &dsc.occurrences {
            let pos = cse.func.layout_index(occ.block);
            min_pos = min_pos.min(pos);
            max_pos = max_pos.max(pos);
            is_make_cse |= cse.func.nodes[occ.node].flags.make_cse();
        }
        let block_spread = max_pos.saturating_sub(min_pos);

        features[14] = BOOLEAN_SCALE * f64::from(is_make_cse as u8);
        features[15] = f64::from(dsc.num_distinct_locals);
        features[16] = f64::from(dsc.num_local_occurrences);
        features[17] = BOOLEAN_SCALE * f64::from(expr.flags.has_call() as u8);
        features[18] = adj + (f64::from(dsc.use_count) * dsc.use_weight).max(DE_MINIMIS).ln();
        features[19] = adj
            + (f64::from(dsc.num_local_occurrences) * dsc.use_weight)
                .max(DE_MINIMIS)
                .ln();
        features[20] = BOOLEAN_SCALE * (block_spread as f64 / num_blocks as f64);

        let is_containable = matches!(
            expr.op,
            Opcode::Add | Opcode::Not | Opcode::Mul | Opcode::Shl
        );
        features[21] = BOOLEAN_SCALE * f64::from(is_containable as u8);
        features[22] = BOOLEAN_SCALE * f64::from((is_containable && is_low_cost) as u8);

        // Allocation order may stretch the live range over call sites the
        // dataflow never saw between def and use.
        let mut live_across_call_lsra = live_across_call;
        if !live_across_call_lsra {
            for pos in min_pos..max_pos {
                if cse.func.blocks[cse.func.layout[pos]].has_call {
                    live_across_call_lsra = true;
                    break;
                }
            }
        }
        features[23] = BOOLEAN_SCALE * f64::from(live_across_call_lsra as u8);

        features
    }

    /// Stopping scores one feature: (the log of) the local weight at
    /// which one more temp would start causing spills, assuming the
    /// already-promoted temps each occupy a register.
    fn stopping_features(&self, features: &mut [f64; NUM_PARAMS]) {
        let adj = -DE_MINIMIS.ln();
        let pressure = self
            .register_pressure
            .saturating_sub(self.base.add_cse_count) as usize;
        let spill_at_weight = self
            .local_weights
            .get(pressure)
            .copied()
            .unwrap_or(DE_MINIMIS);
        features[24] = adj + spill_at_weight.max(DE_MINIMIS).ln();
    }

    fn sample(&mut self, choices: &[Choice]) -> usize {
        let r: f64 = self.rng.gen();
        let mut sum = 0.0;
        for (i, choice) in choices.iter().enumerate() {
            sum += choice.softmax;
            if r < sum {
                return i;
            }
        }
        0
    }
}

/// Convert preferences into likelihoods summing to 1.
fn softmax(choices: &mut [Choice]) {
    let mut total = 0.0;
    for choice in choices.iter_mut() {
        choice.softmax = choice.preference.exp();
        total += choice.softmax;
    }
    for choice in choices.iter_mut() {
        choice.softmax /= total;
    }
}

/// The most-preferred choice; ties break toward stopping, then the
/// lowest candidate index.
fn choose_greedy(choices: &[Choice]) -> usize {
    let mut best = 0;
    for i in 1..choices.len() {
        let delta = choices[i].preference - choices[best].preference;
        let update = if delta > 0.0 {
            true
        } else if delta == 0.0 {
            match (choices[i].dsc, choices[best].dsc) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(_), Some(_)) => choices[i].index < choices[best].index,
            }
        } else {
            false
        };
        if update {
            best = i;
        }
    }
    best
}
