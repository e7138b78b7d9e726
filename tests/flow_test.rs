use bpmnflow::compiler::core::Compiler;
use bpmnflow::dsl::builder::ProcessBuilder;
use bpmnflow::nodes::flow::{FlowError, JoinArrival, JoinTable, select_exclusive};
use bpmnflow::runtime::context::Context;
use bpmnflow::runtime::token::{SplitFrame, Token};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn branch_token(node: usize, split_token: Uuid, branch: usize, of: usize) -> Token {
    Token::new(node, vec![SplitFrame { split_token, gateway: 0, branch, of }])
}

#[test]
fn test_join_waits_for_every_branch() {
    let mut joins = JoinTable::new();
    let split = Uuid::new_v4();
    let a = branch_token(5, split, 0, 3);
    let b = branch_token(5, split, 1, 3);
    let c = branch_token(5, split, 2, 3);

    assert_eq!(joins.arrive(5, 3, &c), JoinArrival::Waiting);
    assert_eq!(joins.arrive(5, 3, &a), JoinArrival::Waiting);
    assert_eq!(joins.arrive(5, 3, &a), JoinArrival::Duplicate);

    match joins.arrive(5, 3, &b) {
        JoinArrival::Resolved { absorbed, lineage } => {
            // absorbed in branch order, whatever the arrival order
            assert_eq!(absorbed, vec![a.id, b.id, c.id]);
            assert!(lineage.is_empty());
        }
        other => panic!("Join should resolve, got {:?}", other),
    }
    assert!(joins.is_empty());
}

#[test]
fn test_join_expects_only_its_incoming_branches() {
    let mut joins = JoinTable::new();
    let split = Uuid::new_v4();
    // three-way split, only two branches lead into this join
    let a = branch_token(5, split, 0, 3);
    let b = branch_token(5, split, 1, 3);

    assert_eq!(joins.arrive(5, 2, &b), JoinArrival::Waiting);
    match joins.arrive(5, 2, &a) {
        JoinArrival::Resolved { absorbed, .. } => assert_eq!(absorbed, vec![a.id, b.id]),
        other => panic!("Join should resolve, got {:?}", other),
    }
    assert!(joins.is_empty());
}

#[test]
fn test_join_keeps_separate_splits_apart() {
    let mut joins = JoinTable::new();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    assert_eq!(joins.arrive(7, 2, &branch_token(7, first, 0, 2)), JoinArrival::Waiting);
    assert_eq!(joins.arrive(7, 2, &branch_token(7, second, 1, 2)), JoinArrival::Waiting);

    let waiting = joins.drain_waiting();
    assert_eq!(waiting.len(), 2);
    assert!(waiting.iter().all(|(join, _)| *join == 7));
    assert!(joins.is_empty());
}

#[test]
fn test_join_pops_only_innermost_frame() {
    let mut joins = JoinTable::new();
    let outer = SplitFrame { split_token: Uuid::new_v4(), gateway: 1, branch: 0, of: 2 };
    let inner = Uuid::new_v4();
    let make = |branch| {
        let mut lineage = vec![outer.clone()];
        lineage.push(SplitFrame { split_token: inner, gateway: 2, branch, of: 2 });
        Token::new(4, lineage)
    };

    assert_eq!(joins.arrive(4, 2, &make(1)), JoinArrival::Waiting);
    match joins.arrive(4, 2, &make(0)) {
        JoinArrival::Resolved { lineage, .. } => assert_eq!(lineage, vec![outer.clone()]),
        other => panic!("Join should resolve, got {:?}", other),
    }
}

#[test]
fn test_exclusive_selection_order() {
    let process = ProcessBuilder::new("xor")
        .start("start")
        .exclusive("gw")
        .end("a")
        .end("b")
        .end("c")
        .connect("start", "gw")
        .connect("gw", "c")
        .connect_if("gw", "a", "${n} > 1")
        .connect_if("gw", "b", "${n} > 0")
        .build();
    let graph = Compiler::new().compile(process).expect("Compilation failed");
    let gw = graph.resolve("gw").expect("gw indexed");
    let ctx = |n: i64| Context::new(Uuid::new_v4(), "xor".into(), HashMap::from([("n".to_string(), json!(n))]));

    // first true condition in declared order wins; the default only as a last resort
    assert_eq!(graph.node(select_exclusive(&graph, gw, &ctx(5)).expect("path")).id, "a");
    assert_eq!(graph.node(select_exclusive(&graph, gw, &ctx(1)).expect("path")).id, "b");
    assert_eq!(graph.node(select_exclusive(&graph, gw, &ctx(0)).expect("path")).id, "c");
}

#[test]
fn test_exclusive_without_default_has_no_path() {
    let process = ProcessBuilder::new("xor-strict")
        .start("start")
        .exclusive("gw")
        .end("a")
        .connect("start", "gw")
        .connect_if("gw", "a", "${ready} == true")
        .build();
    let graph = Compiler::new().compile(process).expect("Compilation failed");
    let gw = graph.resolve("gw").expect("gw indexed");
    let ctx = Context::new(Uuid::new_v4(), "xor-strict".into(), HashMap::from([("ready".to_string(), json!(false))]));

    assert_eq!(select_exclusive(&graph, gw, &ctx), Err(FlowError::NoMatchingPath { gateway: "gw".into() }));
}
