//! End-to-end tests of the CSE pass over programmatically built methods.

use mjit_codegen::config::{CodeOptKind, ConstCse, OptConfig, TargetInfo};
use mjit_codegen::cse::{can_swap_trees, clear_cse_tags, do_cse, PassStatus, PromotionClass};
use mjit_codegen::ir::{Block, Function, Local, Node, Opcode, Ty};
use mjit_codegen::valnum::{ValueNum, ValueStore, VnPair};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build `local_a + local_b` with the given value number on the sum.
fn sum_expr(
    f: &mut Function,
    a: Local,
    b: Local,
    va: ValueNum,
    vb: ValueNum,
    vsum: ValueNum,
) -> Node {
    let ra = f.local_read(a, Ty::I64, VnPair::both(va));
    let rb = f.local_read(b, Ty::I64, VnPair::both(vb));
    f.binop(Opcode::Add, Ty::I64, ra, rb, VnPair::both(vsum))
}

/// Append `dst = expr` to `block` and return the statement's expression
/// slot holder (the store root).
fn store_stmt(f: &mut Function, vs: &mut ValueStore, block: Block, expr: Node) -> Node {
    let ty = f.nodes[expr].ty.actual();
    let dst = f.locals.grab_temp(ty);
    let void = VnPair::both(vs.vn_void());
    let root = f.store_local(dst, expr, void);
    f.append_stmt(block, root);
    root
}

fn expr_of(f: &Function, root: Node) -> Node {
    f.nodes[root].arg(0).expect("store has a value operand")
}

#[test]
fn straight_line_redundancy_promotes_aggressively() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vsum = vs.fresh(Ty::I64);

    let b1 = f.create_block();
    let b2 = f.create_block();
    f.add_edge(b1, b2);

    let e1 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root1 = store_stmt(&mut f, &mut vs, b1, e1);
    let e2 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root2 = store_stmt(&mut f, &mut vs, b2, e2);

    let locals_before = f.locals.len();
    let config = OptConfig::default();
    let isa = TargetInfo::default();
    let report = do_cse(&mut f, &mut vs, &config, &isa);

    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert_eq!(report.metrics.len(), 1);
    let metric = &report.metrics[0];
    assert_eq!(metric.class, PromotionClass::Aggressive);
    assert_eq!(metric.def_count, 1);
    assert_eq!(metric.use_count, 1);
    assert!(!metric.live_across_call);
    assert_eq!(report.sequence, vec![1, 0]);

    // One new temp, referenced twice by the def and once by the use.
    assert_eq!(f.locals.len(), locals_before + 1);

    // Def site: dst = comma(store temp = a+b, read temp).
    let def_tree = expr_of(&f, root1);
    assert_eq!(f.nodes[def_tree].op, Opcode::Comma);
    let store = f.nodes[def_tree].arg(0).unwrap();
    assert_eq!(f.nodes[store].op, Opcode::StoreLocal);
    assert!(f.nodes[store].cse_tag.is_def());
    assert_eq!(f.nodes[store].arg(0), Some(e1));
    let readback = f.nodes[def_tree].arg(1).unwrap();
    assert_eq!(f.nodes[readback].op, Opcode::LocalRead);

    // Use site: dst2 = read temp, annotation consumed.
    let use_tree = expr_of(&f, root2);
    assert_eq!(f.nodes[use_tree].op, Opcode::LocalRead);
    assert!(!f.nodes[use_tree].cse_tag.is_marked());

    let temp = f.nodes[use_tree].local.expand().unwrap();
    let temp_data = f.locals.get(temp);
    assert!(temp_data.is_cse);
    assert_eq!(temp_data.ref_cnt, 2 * metric.def_count + metric.use_count);
}

#[test]
fn single_def_temp_goes_into_ssa() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vsum = vs.fresh(Ty::I64);

    let b1 = f.create_block();
    let e1 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root1 = store_stmt(&mut f, &mut vs, b1, e1);
    let e2 = sum_expr(&mut f, a, b, va, vb, vsum);
    store_stmt(&mut f, &mut vs, b1, e2);

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );
    assert_eq!(report.status, PassStatus::ModifiedEverything);

    let def_tree = expr_of(&f, root1);
    let store = f.nodes[def_tree].arg(0).unwrap();
    let temp = f.nodes[store].local.expand().unwrap();

    let temp_data = f.locals.get(temp);
    assert!(temp_data.in_ssa);
    assert!(!temp_data.is_multi_def_cse);
    let ssa = temp_data.ssa_def.expand().expect("single-def temp has an SSA record");
    let ssa_data = f.locals.ssa_def(ssa);
    assert_eq!(ssa_data.def_node.expand(), Some(store));
    assert_eq!(ssa_data.block.expand(), Some(b1));
    assert!(ssa_data.vnp.is_some());
    // The def's read-back plus the one use.
    assert_eq!(ssa_data.num_uses, 2);
}

#[test]
fn call_between_sites_marks_live_across_call() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let x = f.locals.grab_temp(Ty::I64);
    let y = f.locals.grab_temp(Ty::I64);
    let vx = vs.fresh(Ty::I64);
    let vy = vs.fresh(Ty::I64);
    let vmul = vs.fresh(Ty::I64);

    let b1 = f.create_block();
    let b2 = f.create_block();
    let b3 = f.create_block();
    f.add_edge(b1, b2);
    f.add_edge(b2, b3);

    let rx = f.local_read(x, Ty::I64, VnPair::both(vx));
    let ry = f.local_read(y, Ty::I64, VnPair::both(vy));
    let e1 = f.binop(Opcode::Mul, Ty::I64, rx, ry, VnPair::both(vmul));
    store_stmt(&mut f, &mut vs, b1, e1);

    let call = f.call(Ty::Void, true, VnPair::both(vs.vn_void()));
    f.append_stmt(b2, call);

    let rx2 = f.local_read(x, Ty::I64, VnPair::both(vx));
    let ry2 = f.local_read(y, Ty::I64, VnPair::both(vy));
    let e2 = f.binop(Opcode::Mul, Ty::I64, rx2, ry2, VnPair::both(vmul));
    let root2 = store_stmt(&mut f, &mut vs, b3, e2);

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );

    // Availability survives the call (only the cross-call bit dies), so
    // the second sighting is a use and the candidate is live across the
    // call.
    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert_eq!(report.metrics.len(), 1);
    assert!(report.metrics[0].live_across_call);
    assert_eq!(report.metrics[0].def_count, 1);
    assert_eq!(report.metrics[0].use_count, 1);
    assert_eq!(f.nodes[expr_of(&f, root2)].op, Opcode::LocalRead);
}

#[test]
fn parallel_defs_with_no_use_are_not_viable() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let x = f.locals.grab_temp(Ty::I64);
    let y = f.locals.grab_temp(Ty::I64);
    let vx = vs.fresh(Ty::I64);
    let vy = vs.fresh(Ty::I64);
    let vmul = vs.fresh(Ty::I64);

    // A diamond: the two sightings sit in the disjoint arms, so neither
    // is available at the other and both label as defs.
    let b0 = f.create_block();
    let b1 = f.create_block();
    let b2 = f.create_block();
    let b3 = f.create_block();
    f.add_edge(b0, b1);
    f.add_edge(b0, b2);
    f.add_edge(b1, b3);
    f.add_edge(b2, b3);

    for arm in [b1, b2] {
        let rx = f.local_read(x, Ty::I64, VnPair::both(vx));
        let ry = f.local_read(y, Ty::I64, VnPair::both(vy));
        let e = f.binop(Opcode::Mul, Ty::I64, rx, ry, VnPair::both(vmul));
        store_stmt(&mut f, &mut vs, arm, e);
    }

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );
    assert_eq!(report.status, PassStatus::ModifiedNothing);
    assert!(report.metrics.is_empty());
}

#[test]
fn loop_invariant_def_feeds_back_edge_use() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vsum = vs.fresh(Ty::I64);

    // Preheader defines, the self-looping body uses on every iteration.
    let pre = f.create_block();
    let body = f.create_block();
    f.add_edge(pre, body);
    f.add_edge(body, body);
    f.blocks[body].weight = 4.0;

    let e1 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root1 = store_stmt(&mut f, &mut vs, pre, e1);
    let e2 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root2 = store_stmt(&mut f, &mut vs, body, e2);

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );

    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert_eq!(report.metrics.len(), 1);
    assert_eq!(report.metrics[0].def_count, 1);
    assert_eq!(report.metrics[0].use_count, 1);
    assert_eq!(f.nodes[expr_of(&f, root1)].op, Opcode::Comma);
    assert_eq!(f.nodes[expr_of(&f, root2)].op, Opcode::LocalRead);
}

#[test]
fn handler_entry_gets_nothing_on_entry() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vsum = vs.fresh(Ty::I64);

    let b0 = f.create_block();
    let handler = f.create_block();
    f.add_edge(b0, handler);
    f.blocks[handler].is_handler_entry = true;

    let e1 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root1 = store_stmt(&mut f, &mut vs, b0, e1);
    let e2 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root2 = store_stmt(&mut f, &mut vs, handler, e2);

    // Disable all promotions so the labelling is left in place to
    // inspect: the handler sighting must be a def, not a use.
    let config = OptConfig {
        cse_mask: Some(0),
        ..OptConfig::default()
    };
    let report = do_cse(&mut f, &mut vs, &config, &TargetInfo::default());
    assert_eq!(report.status, PassStatus::ModifiedNothing);

    assert!(f.nodes[expr_of(&f, root1)].cse_tag.is_def());
    assert!(f.nodes[expr_of(&f, root2)].cse_tag.is_def());
}

#[test]
fn shared_constants_anchor_and_adjust() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let b1 = f.create_block();

    let v1 = vs.const_int(Ty::I64, 0x1234_0000);
    let c1 = f.iconst(Ty::I64, 0x1234_0000, VnPair::both(v1));
    f.set_costs(c1, 3, 4);
    let root1 = store_stmt(&mut f, &mut vs, b1, c1);

    let v2 = vs.const_int(Ty::I64, 0x1234_0010);
    let c2 = f.iconst(Ty::I64, 0x1234_0010, VnPair::both(v2));
    f.set_costs(c2, 3, 4);
    let root2 = store_stmt(&mut f, &mut vs, b1, c2);

    let config = OptConfig {
        const_cse: ConstCse::EnabledShared,
        ..OptConfig::default()
    };
    let report = do_cse(&mut f, &mut vs, &config, &TargetInfo::default());

    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert_eq!(report.metrics.len(), 1);

    // The anchor is the lower constant; its site keeps the plain value.
    let def_tree = expr_of(&f, root1);
    assert_eq!(f.nodes[def_tree].op, Opcode::Comma);
    let store = f.nodes[def_tree].arg(0).unwrap();
    let stored = f.nodes[store].arg(0).unwrap();
    assert_eq!(f.nodes[stored].imm, 0x1234_0000);

    // The second site reloads the anchor and adds the distance.
    let use_tree = expr_of(&f, root2);
    assert_eq!(f.nodes[use_tree].op, Opcode::Add);
    assert!(f.nodes[use_tree].flags.dont_cse());
    let read = f.nodes[use_tree].arg(0).unwrap();
    assert_eq!(f.nodes[read].op, Opcode::LocalRead);
    let delta = f.nodes[use_tree].arg(1).unwrap();
    assert_eq!(f.nodes[delta].op, Opcode::IntConst);
    assert_eq!(f.nodes[delta].imm, 0x10);
}

#[test]
fn distinct_constants_are_separate_without_sharing() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let b1 = f.create_block();
    for value in [0x1234_0000i64, 0x1234_0010] {
        let vn = vs.const_int(Ty::I64, value);
        let c = f.iconst(Ty::I64, value, VnPair::both(vn));
        f.set_costs(c, 3, 4);
        store_stmt(&mut f, &mut vs, b1, c);
    }

    // Plain constant CSE: the two values have different numbers, so there
    // is no duplicate fingerprint at all.
    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );
    assert_eq!(report.status, PassStatus::ModifiedNothing);
}

#[test]
fn def_breaking_the_exception_promise_abandons_the_candidate() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let arr = f.locals.grab_temp(Ty::Ref);
    let varr = vs.fresh(Ty::Ref);
    let vval = vs.fresh(Ty::I64);
    let bounds = vs.exc_item(2, varr);
    let exc = vs.exc_set(&[bounds]);
    let vval_exc = vs.with_exc(vval, exc);

    let b1 = f.create_block();

    // Two checked loads, then one whose check was elided: the elided def
    // cannot produce the exceptions the middle use was promised.
    for vn in [vval_exc, vval_exc, vval] {
        let ra = f.local_read(arr, Ty::Ref, VnPair::both(varr));
        let load = f.load(Ty::I64, ra, VnPair::both(vn));
        store_stmt(&mut f, &mut vs, b1, load);
    }

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );
    assert_eq!(report.status, PassStatus::ModifiedNothing);
    assert!(report.metrics.is_empty());
}

#[test]
fn uncovered_use_is_dropped_but_candidate_survives() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let arr = f.locals.grab_temp(Ty::Ref);
    let varr = vs.fresh(Ty::Ref);
    let vval = vs.fresh(Ty::I64);
    let null = vs.exc_item(1, varr);
    let exc = vs.exc_set(&[null]);
    let vval_exc = vs.with_exc(vval, exc);

    // One sighting per block (so no sighting can displace another as the
    // canonical first occurrence): an exception-free def, then a sighting
    // that still carries the exception set and cannot be a use of it,
    // then another exception-free sighting that can.
    let b1 = f.create_block();
    let b2 = f.create_block();
    let b3 = f.create_block();
    f.add_edge(b1, b2);
    f.add_edge(b2, b3);

    let mut roots = Vec::new();
    for (block, vn) in [(b1, vval), (b2, vval_exc), (b3, vval)] {
        let ra = f.local_read(arr, Ty::Ref, VnPair::both(varr));
        let load = f.load(Ty::I64, ra, VnPair::both(vn));
        roots.push(store_stmt(&mut f, &mut vs, block, load));
    }

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );
    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert_eq!(report.metrics.len(), 1);
    assert_eq!(report.metrics[0].def_count, 1);
    assert_eq!(report.metrics[0].use_count, 1);

    // The middle sighting was skipped and keeps its own computation.
    assert_eq!(f.nodes[expr_of(&f, roots[0])].op, Opcode::Comma);
    assert_eq!(f.nodes[expr_of(&f, roots[1])].op, Opcode::Load);
    assert_eq!(f.nodes[expr_of(&f, roots[2])].op, Opcode::LocalRead);
}

#[test]
fn later_copy_with_more_exceptions_becomes_the_canonical_def() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let arr = f.locals.grab_temp(Ty::Ref);
    let varr = vs.fresh(Ty::Ref);
    let vval = vs.fresh(Ty::I64);
    let null = vs.exc_item(1, varr);
    let exc = vs.exc_set(&[null]);
    let vval_exc = vs.with_exc(vval, exc);

    let b1 = f.create_block();

    // The first sighting was proven not to throw, the second (same
    // block) still raises: the first could never be a def for the
    // second, so the throwing copy takes over as the canonical first
    // occurrence and becomes the def; the checked third sighting matches
    // it and is covered.
    let mut roots = Vec::new();
    for vn in [vval, vval_exc, vval_exc] {
        let ra = f.local_read(arr, Ty::Ref, VnPair::both(varr));
        let load = f.load(Ty::I64, ra, VnPair::both(vn));
        roots.push(store_stmt(&mut f, &mut vs, b1, load));
    }

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );
    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert_eq!(report.metrics.len(), 1);
    assert_eq!(report.metrics[0].def_count, 1);
    assert_eq!(report.metrics[0].use_count, 1);

    // The exception-free copy is left alone; the throwing copy is the
    // def and covers the last sighting's exceptions.
    assert_eq!(f.nodes[expr_of(&f, roots[0])].op, Opcode::Load);
    assert_eq!(f.nodes[expr_of(&f, roots[1])].op, Opcode::Comma);
    assert_eq!(f.nodes[expr_of(&f, roots[2])].op, Opcode::LocalRead);
}

#[test]
fn nested_uses_roll_back_when_the_outer_candidate_wins() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let c = f.locals.grab_temp(Ty::I64);
    let d = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vc = vs.fresh(Ty::I64);
    let vd = vs.fresh(Ty::I64);
    let vsum1 = vs.fresh(Ty::I64);
    let vsum2 = vs.fresh(Ty::I64);
    let vbig = vs.fresh(Ty::I64);

    // (a+b)*(c+d) twice: the product, both sums, all form candidates.
    // The product sorts first (highest cost); once its use site becomes a
    // plain reload, the sums' uses inside it vanish and their counts roll
    // back, so they are no longer viable.
    let b1 = f.create_block();
    let mut roots = Vec::new();
    for _ in 0..2 {
        let s1 = sum_expr(&mut f, a, b, va, vb, vsum1);
        let s2 = sum_expr(&mut f, c, d, vc, vd, vsum2);
        let big = f.binop(Opcode::Mul, Ty::I64, s1, s2, VnPair::both(vbig));
        roots.push(store_stmt(&mut f, &mut vs, b1, big));
    }

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );

    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert_eq!(report.metrics.len(), 1);
    // The product is candidate 3 (the sums were discovered first) and is
    // the only promotion: its use site is a bare reload, and with the
    // nested uses rolled back the sums are no longer viable.
    assert_eq!(report.sequence, vec![3, 0]);
    assert_eq!(report.metrics[0].index, 3);
    let use_tree = expr_of(&f, roots[1]);
    assert_eq!(f.nodes[use_tree].op, Opcode::LocalRead);
}

#[test]
fn no_duplicates_means_no_candidates() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let v1 = vs.fresh(Ty::I64);
    let v2 = vs.fresh(Ty::I64);

    let b1 = f.create_block();
    let e1 = sum_expr(&mut f, a, b, va, vb, v1);
    store_stmt(&mut f, &mut vs, b1, e1);
    // A different value: no fingerprint repeats.
    let ra = f.local_read(a, Ty::I64, VnPair::both(va));
    let rb = f.local_read(b, Ty::I64, VnPair::both(vb));
    let e2 = f.binop(Opcode::Sub, Ty::I64, ra, rb, VnPair::both(v2));
    store_stmt(&mut f, &mut vs, b1, e2);

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );
    assert_eq!(report.status, PassStatus::ModifiedNothing);
    assert!(report.metrics.is_empty());
    assert_eq!(report.sequence, vec![0]);
}

#[test]
fn candidate_cap_overflow_is_ignored_not_fatal() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let b1 = f.create_block();
    let a = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);

    // 65 distinct duplicated fingerprints; only 64 can become
    // candidates, the surplus is silently ignored.
    for i in 0..65i64 {
        let vn = vs.fresh(Ty::I64);
        for _ in 0..2 {
            let ra = f.local_read(a, Ty::I64, VnPair::both(va));
            let c = {
                let cv = vs.const_int(Ty::I64, i);
                f.iconst(Ty::I64, i, VnPair::both(cv))
            };
            let e = f.binop(Opcode::Add, Ty::I64, ra, c, VnPair::both(vn));
            store_stmt(&mut f, &mut vs, b1, e);
        }
    }

    let report = do_cse(
        &mut f,
        &mut vs,
        &OptConfig::default(),
        &TargetInfo::default(),
    );
    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert!(report.metrics.len() <= 64);
}

#[test]
fn disabled_promotions_leave_labels_but_no_rewrites() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vsum = vs.fresh(Ty::I64);

    let b1 = f.create_block();
    let e1 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root1 = store_stmt(&mut f, &mut vs, b1, e1);
    let e2 = sum_expr(&mut f, a, b, va, vb, vsum);
    let root2 = store_stmt(&mut f, &mut vs, b1, e2);
    let locals_before = f.locals.len();

    let config = OptConfig {
        cse_mask: Some(0),
        ..OptConfig::default()
    };
    let report = do_cse(&mut f, &mut vs, &config, &TargetInfo::default());

    assert_eq!(report.status, PassStatus::ModifiedNothing);
    assert_eq!(f.locals.len(), locals_before);
    // The statements still hang the original expressions.
    assert_eq!(expr_of(&f, root1), e1);
    assert_eq!(expr_of(&f, root2), e2);
    // Labelling ran: def then use of the same candidate.
    assert!(f.nodes[e1].cse_tag.is_def());
    assert!(f.nodes[e2].cse_tag.is_use());
    assert_eq!(f.nodes[e1].cse_tag.index(), f.nodes[e2].cse_tag.index());
}

#[test]
fn second_run_after_rewrite_is_a_no_op() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vsum = vs.fresh(Ty::I64);

    let b1 = f.create_block();
    let e1 = sum_expr(&mut f, a, b, va, vb, vsum);
    store_stmt(&mut f, &mut vs, b1, e1);
    let e2 = sum_expr(&mut f, a, b, va, vb, vsum);
    store_stmt(&mut f, &mut vs, b1, e2);

    let config = OptConfig::default();
    let isa = TargetInfo::default();
    let first = do_cse(&mut f, &mut vs, &config, &isa);
    assert_eq!(first.status, PassStatus::ModifiedEverything);

    // The temp reads that replaced the redundancy are not candidates, so
    // a second run finds nothing.
    clear_cse_tags(&mut f);
    let nodes_before = f.nodes.len();
    let second = do_cse(&mut f, &mut vs, &config, &isa);
    assert_eq!(second.status, PassStatus::ModifiedNothing);
    assert_eq!(f.nodes.len(), nodes_before);
}

fn replay_fixture() -> (Function, ValueStore) {
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vsum = vs.fresh(Ty::I64);
    let vmul = vs.fresh(Ty::I64);

    let b1 = f.create_block();
    for vn in [vsum, vmul, vsum, vmul] {
        let ra = f.local_read(a, Ty::I64, VnPair::both(va));
        let rb = f.local_read(b, Ty::I64, VnPair::both(vb));
        let op = if vn == vsum { Opcode::Add } else { Opcode::Mul };
        let e = f.binop(op, Ty::I64, ra, rb, VnPair::both(vn));
        store_stmt(&mut f, &mut vs, b1, e);
    }
    (f, vs)
}

#[test]
fn replay_follows_the_script_and_is_deterministic() {
    init_logging();
    let config = OptConfig {
        replay: vec![2, 7, 1],
        ..OptConfig::default()
    };
    let isa = TargetInfo::default();

    let (mut f1, mut vs1) = replay_fixture();
    let r1 = do_cse(&mut f1, &mut vs1, &config, &isa);
    let (mut f2, mut vs2) = replay_fixture();
    let r2 = do_cse(&mut f2, &mut vs2, &config, &isa);

    // Candidate 7 does not exist and is skipped; 2 then 1 are promoted in
    // script order, identically on both runs.
    assert_eq!(r1.sequence, vec![2, 1, 0]);
    assert_eq!(r1.sequence, r2.sequence);
    assert_eq!(r1.metrics.len(), 2);
    assert_eq!(f1.nodes.len(), f2.nodes.len());
    assert_eq!(f1.locals.len(), f2.locals.len());
}

#[test]
fn random_heuristic_is_deterministic_per_salt() {
    init_logging();
    let config = OptConfig {
        random_salt: Some(0xfeed),
        ..OptConfig::default()
    };
    let isa = TargetInfo::default();

    let (mut f1, mut vs1) = replay_fixture();
    let r1 = do_cse(&mut f1, &mut vs1, &config, &isa);
    let (mut f2, mut vs2) = replay_fixture();
    let r2 = do_cse(&mut f2, &mut vs2, &config, &isa);

    assert_eq!(r1.sequence, r2.sequence);
    assert_eq!(r1.metrics.len(), r2.metrics.len());
    assert!(r1.metrics.iter().all(|m| m.class == PromotionClass::Random));
    // At least one promotion always happens (k is drawn from [1..=n]).
    assert!(!r1.metrics.is_empty());
}

#[test]
fn rl_greedy_with_zero_parameters_stops_immediately() {
    init_logging();
    let config = OptConfig {
        rl_params: vec![0.0; 25],
        rl_greedy: true,
        ..OptConfig::default()
    };
    let (mut f, mut vs) = replay_fixture();
    let report = do_cse(&mut f, &mut vs, &config, &TargetInfo::default());

    // Every preference ties at zero and ties prefer stopping.
    assert_eq!(report.status, PassStatus::ModifiedNothing);
    assert_eq!(report.sequence, vec![0]);
}

#[test]
fn rl_greedy_with_use_preference_promotes() {
    init_logging();
    let mut params = vec![0.0; 25];
    params[4] = 1.0; // reward use count
    let config = OptConfig {
        rl_params: params,
        rl_greedy: true,
        ..OptConfig::default()
    };
    let (mut f, mut vs) = replay_fixture();
    let report = do_cse(&mut f, &mut vs, &config, &TargetInfo::default());

    assert_eq!(report.status, PassStatus::ModifiedEverything);
    // Both candidates score above stopping and are promoted.
    assert_eq!(report.metrics.len(), 2);
    assert!(report.rl_updated_params.is_none());
}

#[test]
fn rl_softmax_sampling_is_deterministic_per_salt() {
    init_logging();
    let mut params = vec![0.0; 25];
    params[0] = 0.5; // lean toward expensive candidates
    let config = OptConfig {
        rl_params: params,
        random_salt: Some(7),
        ..OptConfig::default()
    };
    let isa = TargetInfo::default();

    let (mut f1, mut vs1) = replay_fixture();
    let r1 = do_cse(&mut f1, &mut vs1, &config, &isa);
    let (mut f2, mut vs2) = replay_fixture();
    let r2 = do_cse(&mut f2, &mut vs2, &config, &isa);

    // Sampling is seeded, so the whole run replays identically.
    assert_eq!(r1.sequence, r2.sequence);
    assert_eq!(r1.metrics.len(), r2.metrics.len());
    assert_eq!(f1.nodes.len(), f2.nodes.len());
}

#[test]
fn rl_update_mode_moves_the_parameters() {
    init_logging();
    let config = OptConfig {
        rl_params: vec![0.01; 25],
        replay: vec![1, 0],
        replay_rewards: vec![0.5, 0.5],
        rl_alpha: Some(0.1),
        ..OptConfig::default()
    };
    let (mut f, mut vs) = replay_fixture();
    let report = do_cse(&mut f, &mut vs, &config, &TargetInfo::default());

    assert_eq!(report.status, PassStatus::ModifiedEverything);
    let updated = report.rl_updated_params.expect("update mode reports parameters");
    assert_eq!(updated.len(), 25);
    assert_ne!(updated, vec![0.01; 25]);
}

#[test]
fn swap_legality_is_symmetric_over_def_use_pairs() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();
    let v = VnPair::both(vs.fresh(Ty::I64));

    // a = (def C1) + (use C2); b = (use C1) + (def C2): pinned both ways.
    let d1 = f.iconst(Ty::I64, 1, v);
    let u2 = f.iconst(Ty::I64, 2, v);
    let a = f.binop(Opcode::Add, Ty::I64, d1, u2, v);
    let u1 = f.iconst(Ty::I64, 3, v);
    let d2 = f.iconst(Ty::I64, 4, v);
    let b = f.binop(Opcode::Add, Ty::I64, u1, d2, v);

    f.nodes[d1].cse_tag = mjit_codegen::ir::CseTag::mark_use(1).as_def();
    f.nodes[u2].cse_tag = mjit_codegen::ir::CseTag::mark_use(2);
    f.nodes[u1].cse_tag = mjit_codegen::ir::CseTag::mark_use(1);
    f.nodes[d2].cse_tag = mjit_codegen::ir::CseTag::mark_use(2).as_def();

    assert!(!can_swap_trees(&f, 2, a, b));
    assert!(!can_swap_trees(&f, 2, b, a));

    // Clearing one side's def releases the pin in both directions.
    f.nodes[d1].cse_tag.clear();
    f.nodes[u1].cse_tag.clear();
    assert!(!can_swap_trees(&f, 2, a, b)); // still pinned by C2
    f.nodes[d2].cse_tag.clear();
    f.nodes[u2].cse_tag.clear();
    assert!(can_swap_trees(&f, 2, a, b));
    assert!(can_swap_trees(&f, 2, b, a));
}

#[test]
fn size_optimized_compilations_use_unweighted_counts() {
    init_logging();
    let mut f = Function::new();
    let mut vs = ValueStore::new();

    let a = f.locals.grab_temp(Ty::I64);
    let b = f.locals.grab_temp(Ty::I64);
    let va = vs.fresh(Ty::I64);
    let vb = vs.fresh(Ty::I64);
    let vsum = vs.fresh(Ty::I64);

    let b1 = f.create_block();
    // Weighting would normally inflate the counts; size mode must ignore
    // it and still promote on the raw counts.
    f.blocks[b1].weight = 100.0;
    let e1 = sum_expr(&mut f, a, b, va, vb, vsum);
    store_stmt(&mut f, &mut vs, b1, e1);
    let e2 = sum_expr(&mut f, a, b, va, vb, vsum);
    store_stmt(&mut f, &mut vs, b1, e2);

    let config = OptConfig {
        code_opt: CodeOptKind::SmallCode,
        ..OptConfig::default()
    };
    let report = do_cse(&mut f, &mut vs, &config, &TargetInfo::default());
    assert_eq!(report.status, PassStatus::ModifiedEverything);
    assert_eq!(report.metrics.len(), 1);
}

#[test]
fn method_level_disable_knob_skips_the_pass() {
    init_logging();
    let (mut f, mut vs) = replay_fixture();
    f.method_hash = 200;
    let config = OptConfig {
        no_cse: 100, // threshold form: catches this method's hash
        ..OptConfig::default()
    };
    let report = do_cse(&mut f, &mut vs, &config, &TargetInfo::default());
    assert_eq!(report.status, PassStatus::ModifiedNothing);
    assert!(report.sequence.is_empty());
}
