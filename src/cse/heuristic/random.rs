//! The random stress heuristic.
//!
//! Promotes a uniformly chosen prefix of a uniformly shuffled candidate
//! order. Everything is driven by a seeded generator so a failure found
//! under stress replays from its salt.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{Candidate, HeuristicBase, PromotionClass};
use crate::config::OptConfig;
use crate::cse::{perform, CseId, CsePass};

pub(crate) struct Random {
    pub base: HeuristicBase,
    rng: SmallRng,
}

impl Random {
    pub fn new(base: HeuristicBase, config: &OptConfig, method_hash: u32) -> Self {
        let salt = config.random_salt.unwrap_or(0);
        log::trace!("random CSE heuristic with salt {}", salt);
        Self {
            base,
            rng: SmallRng::seed_from_u64(salt ^ u64::from(method_hash)),
        }
    }

    pub fn consider_candidates(&mut self, cse: &mut CsePass) {
        let n = cse.candidate_count as usize;
        if n == 0 {
            return;
        }

        // Inside-out Fisher-Yates over the dense table.
        let mut tab: Vec<CseId> = Vec::with_capacity(n);
        for i in 0..n {
            let j = self.rng.gen_range(0..=i);
            let id = cse.dense_table()[i];
            if i == j {
                tab.push(id);
            } else {
                let moved = tab[j];
                tab.push(moved);
                tab[j] = id;
            }
        }

        // Promote the first k, k uniform in [1..=n].
        let k = self.rng.gen_range(0..n) + 1;
        for &id in tab.iter().take(k) {
            cse.attempt += 1;
            if !cse.candidates[id].is_viable() {
                log::trace!(
                    "skipping candidate {:02}: not viable",
                    cse.candidates[id].index
                );
                continue;
            }

            let mut cand = Candidate::new(cse, id);
            cand.initialize_counts(cse, self.base.code_opt);
            cand.class = PromotionClass::Random;
            log::trace!("randomly promoting candidate {:02}", cand.index);
            perform::perform_cse(cse, &mut self.base, &mut cand);
            self.base.made_changes = true;
        }
    }
}
