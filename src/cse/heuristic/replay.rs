//! The replay heuristic.
//!
//! Follows a scripted sequence of 1-based candidate indices exactly,
//! skipping entries that are out of range or not viable. Reproducing a
//! recorded sequence reproduces the rewritten IR bit for bit.

use super::{Candidate, HeuristicBase};
use crate::config::OptConfig;
use crate::cse::{perform, CsePass};

pub(crate) struct Replay {
    pub base: HeuristicBase,
    script: Vec<u32>,
}

impl Replay {
    pub fn new(base: HeuristicBase, config: &OptConfig) -> Self {
        log::trace!("replay CSE heuristic with script {:?}", config.replay);
        Self {
            base,
            script: config.replay.clone(),
        }
    }

    pub fn consider_candidates(&mut self, cse: &mut CsePass) {
        let n = cse.candidate_count;
        if n == 0 {
            return;
        }

        for &number in &self.script {
            if number == 0 || number > n {
                log::debug!("invalid candidate number {}", number);
                continue;
            }
            cse.attempt += 1;
            let id = cse.find_dsc(number);
            if !cse.candidates[id].is_viable() {
                log::debug!("candidate {:02} not viable, skipping", number);
                continue;
            }

            let mut cand = Candidate::new(cse, id);
            cand.initialize_counts(cse, self.base.code_opt);
            log::trace!("replay promoting candidate {:02}", cand.index);
            perform::perform_cse(cse, &mut self.base, &mut cand);
            self.base.made_changes = true;
        }
    }
}
