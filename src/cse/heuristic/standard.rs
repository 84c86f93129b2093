//! The standard (cost model) heuristic.
//!
//! Promotion is an estimate race between the method as-is and the method
//! with a temp introduced:
//!
//! ```text
//! no_cse  = use_count * cost(expr)            (+ lost size reduction)
//! yes_cse = def_count * def_cost + use_count * use_cost   (+ call extras)
//! ```
//!
//! The def/use costs depend on how confident we are that the temp will be
//! enregistered, which is judged from where its combined ref count would
//! rank among the method's register candidates: temps ranking inside the
//! callee-saved budget are costed aggressively (both 1), temps inside the
//! total register budget moderately, everything else conservatively (a
//! stack home both ways). Each promotion of a call-crossing candidate
//! raises the cutoffs, damping further promotions as register pressure
//! builds.

use core::cmp::Ordering;

use super::{mask_allows, Candidate, HeuristicBase, PromotionClass, UNITY_WEIGHT};
use crate::config::CodeOptKind;
use crate::cse::{perform, CseId, CsePass};
use crate::ir::Ty;

pub(crate) struct Standard {
    pub base: HeuristicBase,
    aggressive_ref_cnt: f64,
    moderate_ref_cnt: f64,
    enreg_count: u32,
    large_frame: bool,
    huge_frame: bool,
}

impl Standard {
    pub fn new(base: HeuristicBase) -> Self {
        Self {
            base,
            aggressive_ref_cnt: 0.0,
            moderate_ref_cnt: 0.0,
            enreg_count: 0,
            large_frame: false,
            huge_frame: false,
        }
    }

    /// Estimate the frame size and pick the aggressive/moderate cutoffs
    /// from the weighted ref counts of the locals sitting at the
    /// enregistration boundaries.
    pub fn initialize(&mut self, cse: &CsePass) {
        let isa = cse.isa;

        let mut frame_size: u64 = 0;
        let mut reg_avail_estimate = isa.callee_saved_regs * 3 + isa.callee_trash_regs * 2 + 1;
        for (_, data) in cse.func.locals.iter() {
            // Unreferenced locals get no frame slot; stack parameters
            // live in the caller's frame.
            if data.ref_cnt == 0 {
                continue;
            }
            if data.is_param && !data.is_reg_param {
                continue;
            }

            let on_stack = reg_avail_estimate == 0 || data.do_not_enregister;
            if on_stack {
                frame_size += u64::from(data.size);
            } else if data.ref_cnt <= 2 {
                // A single-use single-def local occupies one register.
                reg_avail_estimate = reg_avail_estimate.saturating_sub(1);
            } else {
                reg_avail_estimate = reg_avail_estimate.saturating_sub(2);
            }

            if frame_size > u64::from(isa.huge_frame_size) {
                self.large_frame = true;
                self.huge_frame = true;
                break;
            }
            if frame_size > u64::from(isa.large_frame_size) {
                self.large_frame = true;
            }
        }

        // Register candidates arrive in descending weighted ref count
        // order; the locals just past the callee-saved and the total
        // register budgets set the promotion cutoffs.
        let aggressive_enreg_num = isa.callee_saved_regs * 3 / 2;
        let moderate_enreg_num = isa.callee_saved_regs * 3 + isa.callee_trash_regs * 2;
        for local in cse.func.locals.tracked_by_weight() {
            let data = cse.func.locals.get(local);

            // Only integer registers are tracked; float CSEs are rare and
            // float registers plentiful.
            if !data.ty.is_floating() {
                self.enreg_count += 1;
            }

            if self.aggressive_ref_cnt == 0.0 && self.enreg_count > aggressive_enreg_num {
                let w = match self.base.code_opt {
                    CodeOptKind::SmallCode => f64::from(data.ref_cnt),
                    CodeOptKind::BlendedCode => data.ref_wtd,
                };
                self.aggressive_ref_cnt = w + UNITY_WEIGHT;
            }
            if self.moderate_ref_cnt == 0.0 && self.enreg_count > moderate_enreg_num {
                let w = match self.base.code_opt {
                    CodeOptKind::SmallCode => f64::from(data.ref_cnt),
                    CodeOptKind::BlendedCode => data.ref_wtd,
                };
                self.moderate_ref_cnt = w + UNITY_WEIGHT / 2.0;
            }
        }

        self.aggressive_ref_cnt = self.aggressive_ref_cnt.max(2.0 * UNITY_WEIGHT);
        self.moderate_ref_cnt = self.moderate_ref_cnt.max(UNITY_WEIGHT);

        log::debug!(
            "aggressive cutoff {}, moderate cutoff {}, enreg count {}, {} frame",
            self.aggressive_ref_cnt,
            self.moderate_ref_cnt,
            self.enreg_count,
            if self.huge_frame {
                "huge"
            } else if self.large_frame {
                "large"
            } else {
                "small"
            },
        );
    }

    /// Rank candidates most-appealing first: higher cost, then higher use
    /// count, then lower def count, index as the stable tiebreak.
    pub fn sort_candidates(&mut self, cse: &CsePass) {
        let mut ids: Vec<CseId> = cse.dense_table().to_vec();
        match self.base.code_opt {
            CodeOptKind::SmallCode => ids.sort_by(|&a, &b| cmp_size(cse, a, b)),
            CodeOptKind::BlendedCode => ids.sort_by(|&a, &b| cmp_exec(cse, a, b)),
        }
        self.base.sort_tab = ids.into_iter().map(Into::into).collect();
    }

    /// The cost model proper.
    pub fn promotion_check(&mut self, cse: &mut CsePass, cand: &mut Candidate) -> bool {
        if cse.config_disable_cse2() {
            return false;
        }

        // The temp would be referenced twice per def (write plus
        // read-back) and once per use.
        let cse_ref_cnt = cand.def_count * 2.0 + cand.use_count;

        let expr = &cse.func.nodes[cand.expr];
        let expr_ty = expr.ty;
        let mut can_enregister = true;
        let mut slot_count: u32 = 1;
        if expr_ty == Ty::Struct {
            can_enregister = false;
            // Reference cost scales with the number of pointer-sized
            // slots a copy moves, which can overestimate when vector
            // moves apply.
            slot_count =
                ((expr.struct_size + cse.isa.ptr_size - 1) / cse.isa.ptr_size).max(1);
        }

        let aggressive_enreg_num = cse.isa.callee_saved_regs * 3 / 2;
        let mut def_cost: u32;
        let mut use_cost: u32;

        match self.base.code_opt {
            CodeOptKind::SmallCode => {
                // Size mode is rare (class constructors and the like), so
                // the tables are byte counts of the store/load encodings.
                if cse_ref_cnt >= self.aggressive_ref_cnt {
                    cand.class = PromotionClass::Aggressive;
                    def_cost = 1;
                    use_cost = 1;
                    if cand.live_across_call || !can_enregister {
                        if self.large_frame {
                            def_cost += 1;
                            use_cost += 1;
                        }
                        if self.huge_frame {
                            def_cost += 1;
                            use_cost += 1;
                        }
                    }
                } else {
                    cand.class = PromotionClass::Conservative;
                    if self.large_frame {
                        // Wide displacement forms.
                        def_cost = 6;
                        use_cost = 5;
                    } else {
                        def_cost = 3;
                        use_cost = 2;
                    }
                }
                if expr_ty.is_floating() {
                    // Float loads/stores encode larger.
                    def_cost += 2;
                    use_cost += 1;
                }
            }
            CodeOptKind::BlendedCode => {
                if cse_ref_cnt >= self.aggressive_ref_cnt && can_enregister {
                    cand.class = PromotionClass::Aggressive;
                    def_cost = 1;
                    use_cost = 1;
                } else if cse_ref_cnt >= self.moderate_ref_cnt {
                    cand.class = PromotionClass::Moderate;
                    if !cand.live_across_call && can_enregister {
                        def_cost = 2;
                        use_cost = 1;
                    } else {
                        def_cost = 2;
                        use_cost = if can_enregister {
                            if self.enreg_count < aggressive_enreg_num {
                                1
                            } else {
                                2
                            }
                        } else {
                            3
                        };
                    }
                } else {
                    cand.class = PromotionClass::Conservative;
                    if !cand.live_across_call && can_enregister {
                        def_cost = 2;
                        use_cost = 2;
                    } else {
                        def_cost = 2;
                        use_cost = 3;
                    }
                    // Past the tracking limit the temp may end up
                    // untracked entirely.
                    if cse.func.locals.len() as u32 >= cse.config.max_tracked_locals {
                        def_cost += 1;
                        use_cost += 1;
                    }
                }
            }
        }

        if slot_count > 1 {
            def_cost *= slot_count;
            use_cost *= slot_count;
        }

        let mut extra_yes_cost: f64 = 0.0;
        if cand.live_across_call {
            // No callee-saved float registers means a spill at the def
            // and a reload at the first use.
            if expr_ty.is_floating()
                && cse.isa.callee_saved_float_regs == 0
                && cand.class != PromotionClass::Conservative
            {
                def_cost += 1;
                use_cost += 1;
            }

            if self.enreg_count < aggressive_enreg_num || expr_ty.is_floating() {
                // A caller-saved register may need a spill/restore pair.
                extra_yes_cost = UNITY_WEIGHT;
                if cse_ref_cnt < self.moderate_ref_cnt {
                    extra_yes_cost *= 2.0;
                }
            }

            if expr_ty.is_simd() {
                // Assume each call-crossing vector temp costs one
                // prolog/epilog spill/restore pair.
                extra_yes_cost = UNITY_WEIGHT * 3.0;
            }
        }

        // Credit the code size that not promoting would leave on the
        // table.
        let mut extra_no_cost: f64 = 0.0;
        if cand.size > use_cost {
            let raw_uses = cse.candidates[cand.id].use_count;
            extra_no_cost = f64::from((cand.size - use_cost) * raw_uses * 2);
        }

        let no_cse_cost = cand.use_count * f64::from(cand.cost) + extra_no_cost;
        let yes_cse_cost = cand.def_count * f64::from(def_cost)
            + cand.use_count * f64::from(use_cost)
            + extra_yes_cost;

        log::debug!(
            "candidate {:02}: ref={} def_cost={} use_cost={} no={} yes={} -> {}",
            cand.index,
            cse_ref_cnt,
            def_cost,
            use_cost,
            no_cse_cost,
            yes_cse_cost,
            if yes_cse_cost <= no_cse_cost {
                "promote"
            } else {
                "skip"
            },
        );

        yes_cse_cost <= no_cse_cost
    }

    /// Feedback after a promotion: each call-crossing temp bumps the
    /// cutoffs so later promotions need to look better.
    pub fn adjust(&mut self, cand: &Candidate) {
        let cse_ref_cnt = cand.def_count * 2.0 + cand.use_count;
        if cand.live_across_call {
            if cse_ref_cnt > self.aggressive_ref_cnt {
                self.aggressive_ref_cnt += UNITY_WEIGHT;
            }
            if cse_ref_cnt > self.moderate_ref_cnt {
                self.moderate_ref_cnt += UNITY_WEIGHT / 2.0;
            }
        }
    }

    pub fn consider_candidates(&mut self, cse: &mut CsePass) {
        let tab = self.base.sort_tab.clone();
        for slot in tab {
            let Some(id) = slot.expand() else {
                continue;
            };
            let attempt = cse.attempt;
            cse.attempt += 1;

            if !cse.candidates[id].is_viable() {
                continue;
            }

            let mut cand = Candidate::new(cse, id);
            cand.initialize_counts(cse, self.base.code_opt);
            log::trace!(
                "considering candidate {:02} [def={}, use={}, cost={}{}]",
                cand.index,
                cand.def_count,
                cand.use_count,
                cand.cost,
                if cand.live_across_call { ", call" } else { "" },
            );

            let mut do_cse = self.promotion_check(cse, &mut cand);
            if let Some(allowed) = mask_allows(cse, attempt) {
                do_cse = allowed;
            }

            if do_cse {
                self.adjust(&cand);
                perform::perform_cse(cse, &mut self.base, &mut cand);
                self.base.made_changes = true;
            }
        }
    }
}

fn cmp_exec(cse: &CsePass, a: CseId, b: CseId) -> Ordering {
    let da = &cse.candidates[a];
    let db = &cse.candidates[b];
    let cost_a = cse.func.nodes[da.first.node].cost_ex;
    let cost_b = cse.func.nodes[db.first.node].cost_ex;
    cost_b
        .cmp(&cost_a)
        .then(
            db.use_weight
                .partial_cmp(&da.use_weight)
                .unwrap_or(Ordering::Equal),
        )
        .then(
            da.def_weight
                .partial_cmp(&db.def_weight)
                .unwrap_or(Ordering::Equal),
        )
        .then(da.index.cmp(&db.index))
}

fn cmp_size(cse: &CsePass, a: CseId, b: CseId) -> Ordering {
    let da = &cse.candidates[a];
    let db = &cse.candidates[b];
    let cost_a = cse.func.nodes[da.first.node].cost_sz;
    let cost_b = cse.func.nodes[db.first.node].cost_sz;
    cost_b
        .cmp(&cost_a)
        .then(db.use_count.cmp(&da.use_count))
        .then(da.def_count.cmp(&db.def_count))
        .then(da.index.cmp(&db.index))
}
