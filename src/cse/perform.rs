//! The performer: rewriting a promoted candidate.
//!
//! Each def site turns into `comma(store temp = value, read temp)` so the
//! value keeps flowing to the def's parent, and each use site becomes a
//! read of the temp (plus the constant delta for shared-constant
//! candidates, plus a comma preserving any nested side effects the
//! replaced tree contained). The def annotation moves onto the new store
//! node so swap-legality keeps seeing completed defs; use annotations are
//! consumed.

use smallvec::SmallVec;

use super::heuristic::{Candidate, HeuristicBase};
use super::{ConservVn, CseMetric, CsePass};
use crate::ir::{Node, Opcode, SsaDef, Ty};
use crate::valnum::{ValueNum, VnPair};

pub(crate) fn perform_cse(cse: &mut CsePass, base: &mut HeuristicBase, cand: &mut Candidate) {
    let id = cand.id;
    let is_shared_const = cand.is_shared_const;

    // A long-lifetime temp typed at the widened type of the expression.
    let temp_ty = cse.func.nodes[cand.expr].ty.actual();
    let temp = cse.func.locals.grab_temp(temp_ty);
    if temp_ty == Ty::Struct {
        let size = cse.func.nodes[cand.expr].struct_size;
        cse.func.locals.set_struct(temp, size);
    }
    cse.func.locals.set_is_cse(temp);
    base.add_cse_count += 1;
    base.sequence.push(cand.index);
    log::trace!(
        "candidate {:02}: introducing {:?} as the CSE temp",
        cand.index,
        temp
    );

    // With a single def the temp goes straight into SSA, no phis needed.
    let ssa: Option<SsaDef> = if cse.candidates[id].def_count == 1 {
        log::trace!(
            "candidate {:02} is single-def, temp {:?} will be in SSA",
            cand.index,
            temp
        );
        Some(cse.func.locals.alloc_ssa_def(temp))
    } else {
        cse.func.locals.get_mut(temp).is_multi_def_cse = true;
        None
    };

    // Scan the surviving occurrences: seed the temp's ref counts (a def
    // writes and reads it back, a use reads it once) and settle the value
    // number the reads will carry. Shared-constant candidates have
    // differing numbers per site, so pick the anchor that minimizes the
    // adjustment code: prefer lower constants, but only re-anchor away
    // from a def when the difference exceeds what the addressing modes
    // absorb for free.
    let occs = cse.candidates[id].occurrences.clone();
    let mut set_ref_cnt = true;
    let mut best_vn: Option<ValueNum> = None;
    let mut best_value: i64 = 0;
    let mut best_is_def = false;
    for occ in &occs {
        let tag = cse.func.nodes[occ.node].cse_tag;
        if !tag.is_marked() {
            continue;
        }
        let curr_vn = cse.vn.normal_value(cse.func.nodes[occ.node].vnp.liberal);
        let curr_value = if is_shared_const {
            cse.vn.coerced_const_value(curr_vn)
        } else {
            0
        };
        let is_def = tag.is_def();

        match best_vn {
            None => {
                best_vn = Some(curr_vn);
                if is_shared_const {
                    best_value = curr_value;
                    best_is_def = is_def;
                }
            }
            Some(prev) if curr_vn != prev => {
                debug_assert!(is_shared_const);
                let diff = curr_value - best_value;
                if (best_is_def && diff < -cse.isa.shared_const_slack)
                    || (!best_is_def && diff < 0)
                {
                    best_vn = Some(curr_vn);
                    best_value = curr_value;
                    best_is_def = is_def;
                }
            }
            Some(_) => {}
        }

        let weight = cse.func.blocks[occ.block].weight;
        if set_ref_cnt {
            cse.func.locals.set_ref_counts(temp, 1, weight);
            set_ref_cnt = false;
        } else {
            cse.func.locals.inc_ref_counts(temp, weight);
        }
        if is_def {
            cse.func.locals.inc_ref_counts(temp, weight);
        }
    }
    cse.candidates[id].const_def_value = best_value;
    cse.candidates[id].const_def_vn = best_vn.into();
    let best_value = cse.candidates[id].const_def_value;
    let anchor_vn = cse.candidates[id]
        .const_def_vn
        .expand()
        .expect("some occurrence survived labelling");

    // Now rewrite every surviving occurrence in discovery order.
    for occ in occs {
        let exp = occ.node;
        let tag = cse.func.nodes[exp].cse_tag;
        if !tag.is_marked() {
            // Cleared by exception-set reconciliation.
            continue;
        }

        cse.cur_weight = cse.func.blocks[occ.block].weight;
        let exp_vnp = cse.func.nodes[exp].vnp;
        let exp_ty = cse.func.nodes[exp].ty.actual();
        debug_assert!(temp_ty.is_compatible_substitution(exp_ty) || is_shared_const);

        let replacement = if tag.is_use() {
            log::trace!(
                "candidate {:02}: replacing use at {:?} in {:?}",
                cand.index,
                exp,
                occ.block
            );

            let read = cse.func.local_read(temp, temp_ty, VnPair::both(anchor_vn));
            cse.func.nodes[read].ssa = ssa.into();
            if let Some(ssa) = ssa {
                cse.func.locals.add_ssa_use(ssa);
            }

            let mut value = read;
            if is_shared_const {
                let curr_vn = cse.vn.normal_value(exp_vnp.liberal);
                let delta = cse.vn.coerced_const_value(curr_vn) - best_value;
                if delta != 0 {
                    let delta_vn = cse.vn.const_int(temp_ty, delta);
                    let delta_node =
                        cse.func.iconst(temp_ty, delta, VnPair::both(delta_vn));
                    value =
                        cse.func
                            .binop(Opcode::Add, temp_ty, read, delta_node, exp_vnp);
                    cse.func.nodes[value].flags.set_dont_cse();
                }
            }

            // A read of the temp computes the same value but raises none
            // of the original exceptions.
            cse.func.nodes[value].vnp = cse.vn.normal_pair(exp_vnp);

            if !is_shared_const {
                if let ConservVn::Same(conserv) = cse.candidates[id].conserv_vn {
                    // Every def stores the same conservative value, so the
                    // reload may carry it; range check elimination keys
                    // off these numbers later.
                    cse.func.nodes[value].vnp.conservative = conserv;
                    if !cse.vn.is_constant(conserv)
                        && cse.vn.is_checked_bound(exp_vnp.conservative)
                    {
                        cse.vn.set_checked_bound(conserv);
                    }
                }
            }

            // The replaced tree may contain nested side effects or nested
            // CSE defs; those must keep executing, in order, ahead of the
            // read. Nested uses that vanish with the tree roll their
            // counts back.
            cse.func.nodes[exp].cse_tag.clear();
            if let Some(effects) = extract_side_effects(cse, exp) {
                let exc = cse.vn.exception_pair(cse.func.nodes[effects].vnp);
                let value_vnp = cse.func.nodes[value].vnp;
                let vnp = cse.vn.pair_with_exc(value_vnp, exc);
                cse.func.comma(exp_ty, effects, value, vnp)
            } else {
                value
            }
        } else {
            log::trace!(
                "candidate {:02}: replacing def at {:?} in {:?} with store to {:?}",
                cand.index,
                exp,
                occ.block,
                temp
            );

            let mut val = exp;
            if is_shared_const {
                let curr_vn = cse.vn.normal_value(exp_vnp.liberal);
                let delta = cse.vn.coerced_const_value(curr_vn) - best_value;
                if delta != 0 {
                    // Store the anchor constant instead; this site's value
                    // is re-derived at the read below.
                    val = cse
                        .func
                        .iconst(temp_ty, best_value, VnPair::both(anchor_vn));
                }
            }

            let void = VnPair::both(cse.vn.vn_void());
            let store = cse.func.store_local(temp, val, void);
            cse.func.nodes[store].ssa = ssa.into();

            // The def annotation moves to the store: it now marks a
            // completed def, which swap legality still must see.
            cse.func.nodes[store].cse_tag = tag;
            cse.func.nodes[exp].cse_tag.clear();

            if let Some(ssa) = ssa {
                let val_vnp = cse.func.nodes[val].vnp;
                let data = cse.func.locals.ssa_def_mut(ssa);
                debug_assert!(data.block.is_none() && data.def_node.is_none());
                data.block = occ.block.into();
                data.def_node = store.into();
                data.vnp = Some(val_vnp);
            }

            let read = cse.func.local_read(temp, temp_ty, VnPair::both(anchor_vn));
            cse.func.nodes[read].ssa = ssa.into();
            if let Some(ssa) = ssa {
                cse.func.locals.add_ssa_use(ssa);
            }

            let mut value = read;
            if is_shared_const {
                let curr_vn = cse.vn.normal_value(exp_vnp.liberal);
                let delta = cse.vn.coerced_const_value(curr_vn) - best_value;
                if delta != 0 {
                    let delta_vn = cse.vn.const_int(temp_ty, delta);
                    let delta_node =
                        cse.func.iconst(temp_ty, delta, VnPair::both(delta_vn));
                    value =
                        cse.func
                            .binop(Opcode::Add, temp_ty, read, delta_node, exp_vnp);
                    cse.func.nodes[value].flags.set_dont_cse();
                }
            }
            // The value side is equal to the original expression; the
            // store itself cannot add exceptions.
            cse.func.nodes[value].vnp = exp_vnp;

            cse.func.comma(exp_ty, store, value, exp_vnp)
        };

        let link = cse
            .func
            .find_link(occ.stmt, exp)
            .expect("occurrence is linked in its statement");
        cse.func.replace_link(link, replacement);

        // If a compare was tracking this node as its checked bound,
        // re-derive its conservative number over the rewritten operands.
        if tag.is_use() {
            if let Some(&cmp) = cse.checked_bound_map.get(&exp) {
                if let ConservVn::Same(_) = cse.candidates[id].conserv_vn {
                    let op = cse.func.nodes[cmp].op;
                    if let (Some(a), Some(b)) =
                        (cse.func.nodes[cmp].arg(0), cse.func.nodes[cmp].arg(1))
                    {
                        let va = cse.vn.normal_value(cse.func.nodes[a].vnp.conservative);
                        let vb = cse.vn.normal_value(cse.func.nodes[b].vnp.conservative);
                        let new_vn = cse.vn.func2(op, va, vb);
                        cse.func.nodes[cmp].vnp.conservative = new_vn;
                    }
                }
            }
        }
    }

    let dsc = &cse.candidates[id];
    cse.metrics.push(CseMetric {
        index: cand.index,
        class: cand.class,
        def_count: dsc.def_count,
        use_count: dsc.use_count,
        live_across_call: dsc.live_across_call,
    });
}

/// Collect, in evaluation order, the subtrees of `root` that must keep
/// executing when the rest of the tree is discarded: nodes with their own
/// persistent side effect and completed or pending CSE defs. Nested CSE
/// uses in the discarded parts are unmarked as they go. Returns the
/// effects joined into a right-nested comma list.
fn extract_side_effects(cse: &mut CsePass, root: Node) -> Option<Node> {
    let mut effects: SmallVec<[Node; 4]> = SmallVec::new();
    collect_side_effects(cse, root, &mut effects);
    if effects.is_empty() {
        return None;
    }

    let mut acc = *effects.last().expect("effects is non-empty");
    for &effect in effects.iter().rev().skip(1) {
        let e_exc = cse.vn.exception_pair(cse.func.nodes[effect].vnp);
        let a_exc = cse.vn.exception_pair(cse.func.nodes[acc].vnp);
        let lib = cse.vn.exc_union(e_exc.liberal, a_exc.liberal);
        let con = cse.vn.exc_union(e_exc.conservative, a_exc.conservative);
        let void = cse.vn.vn_void();
        let vnp = VnPair::new(cse.vn.with_exc(void, lib), cse.vn.with_exc(void, con));
        acc = cse.func.comma(Ty::Void, effect, acc, vnp);
    }
    Some(acc)
}

fn collect_side_effects(cse: &mut CsePass, node: Node, out: &mut SmallVec<[Node; 4]>) {
    let (tag, op, flags, args) = {
        let d = &cse.func.nodes[node];
        (d.cse_tag, d.op, d.flags, d.args)
    };

    if tag.is_def() {
        // A def of another candidate feeds uses elsewhere; keep the whole
        // subtree, it gets rewritten from its own occurrence list.
        out.push(node);
        return;
    }

    let own_effect = match op {
        Opcode::StoreLocal | Opcode::BoundsCheck => true,
        Opcode::Call => flags.has_side_effect(),
        _ => flags.is_volatile(),
    };
    if own_effect {
        out.push(node);
        return;
    }

    if tag.is_use() {
        let removable = cse.unmark_use(node);
        debug_assert!(removable);
    }

    for arg in args.iter() {
        if let Some(child) = arg.expand() {
            collect_side_effects(cse, child, out);
        }
    }
}
