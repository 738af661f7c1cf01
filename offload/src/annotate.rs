//! Region boundary annotation.
//!
//! [`annotate`] rewrites a function body so that every node the partitioner
//! claimed for the accelerator is fenced with region markers: a
//! [`RegionBegin`](Expr::RegionBegin) on each value flowing into the node and
//! a [`RegionEnd`](Expr::RegionEnd) on the value it produces. Later passes
//! merge adjacent fences into maximal regions; this pass only draws the
//! per-node boundaries the way the partitioner dictated.
//!
//! The rewrite is bottom-up and memoized on node identity. A subexpression
//! shared between several users is rewritten once, and a node whose operands
//! come back unchanged is reused as-is instead of being reallocated.

use std::collections::HashMap;

use anyhow::{bail, ensure, Context};
use itertools::Itertools;
use nnir::{
    expr::{Expr, ExprArena, ExprId},
    function::{Function, Module, MAIN},
    visit::{children, marker_counts, postorder},
};
use tracing::debug;

use crate::{
    error::OffloadError,
    partition::{EligibleSet, ParamMap, Partitioner, SubgraphReport},
};

/// Rewrites `function` with region markers for `target`, returning a new
/// function with the same name and parameters.
///
/// The rewrite is all-or-nothing: on error the arena may hold orphaned
/// nodes but no function is produced.
pub fn annotate(
    arena: &mut ExprArena,
    function: &Function,
    eligible: &EligibleSet,
    target: &str,
) -> Result<Function, OffloadError> {
    let body = annotate_body(arena, function.body, eligible, target)?;
    Ok(Function {
        name: function.name.clone(),
        params: function.params.clone(),
        body,
    })
}

/// Fences every eligible node under `root` with region markers for `target`.
///
/// Rules, per node kind:
/// - an eligible call is rebuilt with each argument wrapped in a begin, and
///   the call itself wrapped in an end;
/// - an eligible tuple is fenced the same way, each field behind a begin and
///   the assembled tuple behind one end: the construction point gathers
///   several offloaded values and crosses the boundary as one unit;
/// - a projection is keyed on the identity of the tuple expression it
///   indexes, not on itself: if that tuple was claimed, the projection wraps
///   it in a begin and itself in an end;
/// - vars, constants and conditionals never carry markers, though
///   conditionals are still rewritten through.
///
/// The input must be marker-free; feeding an already annotated body back in
/// fails with [`OffloadError::UnsupportedNodeKind`].
pub fn annotate_body(
    arena: &mut ExprArena,
    root: ExprId,
    eligible: &EligibleSet,
    target: &str,
) -> Result<ExprId, OffloadError> {
    let order = postorder(arena, root).collect_vec();
    let mut memo: HashMap<ExprId, ExprId> = HashMap::with_capacity(order.len());
    for id in order {
        let rewritten = match arena.get(id).clone() {
            Expr::Var { .. } | Expr::Constant { .. } => id,
            Expr::Call { op, args, attrs } => {
                let new_args: Vec<ExprId> = args.iter().map(|arg| memo[arg]).collect();
                if eligible.contains(id) {
                    let fenced = new_args
                        .into_iter()
                        .map(|arg| arena.region_begin(arg, target))
                        .collect_vec();
                    let call = arena.call(op, fenced, attrs);
                    arena.region_end(call, target)
                } else if new_args == args {
                    id
                } else {
                    arena.call(op, new_args, attrs)
                }
            }
            Expr::Tuple { fields } => {
                let new_fields: Vec<ExprId> = fields.iter().map(|field| memo[field]).collect();
                if eligible.contains(id) {
                    let fenced = new_fields
                        .into_iter()
                        .map(|field| arena.region_begin(field, target))
                        .collect_vec();
                    let tuple = arena.tuple(fenced);
                    arena.region_end(tuple, target)
                } else if new_fields == fields {
                    id
                } else {
                    arena.tuple(new_fields)
                }
            }
            Expr::TupleGetItem { tuple, index } => {
                // Keyed on the identity of the tuple being indexed, not on
                // the projection itself.
                let new_tuple = memo[&tuple];
                if eligible.contains(tuple) {
                    let fenced = arena.region_begin(new_tuple, target);
                    let item = arena.tuple_get_item(fenced, index);
                    arena.region_end(item, target)
                } else if new_tuple == tuple {
                    id
                } else {
                    arena.tuple_get_item(new_tuple, index)
                }
            }
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let rebuilt = (memo[&cond], memo[&then_branch], memo[&else_branch]);
                if rebuilt == (cond, then_branch, else_branch) {
                    id
                } else {
                    arena.if_node(rebuilt.0, rebuilt.1, rebuilt.2)
                }
            }
            marker @ (Expr::RegionBegin { .. } | Expr::RegionEnd { .. }) => {
                return Err(OffloadError::unsupported_node(marker.kind_name(), target));
            }
        };
        memo.insert(id, rewritten);
    }
    Ok(memo[&root])
}

/// Runs the partitioner over every function of the module and fences each
/// body with its own eligibility.
///
/// Functions are partitioned independently, so a helper that shares no
/// nodes with the entry body is still fenced when the partitioner claims
/// its ops. Returns the merged layer list so callers can reuse it.
pub fn annotate_module<P: Partitioner>(
    module: &mut Module,
    params: &ParamMap,
    partitioner: &P,
    target: &str,
) -> Result<SubgraphReport, OffloadError> {
    module
        .function(MAIN)
        .with_context(|| format!("module has no {MAIN} function to annotate"))?;
    let worklist = module.functions().cloned().collect_vec();
    let mut layers = Vec::new();
    for function in worklist {
        let graph = partitioner
            .to_graph(&module.arena, &function, params)
            .map_err(OffloadError::Partitioner)?;
        let report = partitioner
            .partition(graph, target)
            .map_err(OffloadError::Partitioner)?;
        let eligible = EligibleSet::for_target(&report, target);
        debug!(
            "annotating {} for {}: {} nodes eligible across {} layers",
            function.name,
            target,
            eligible.len(),
            report.layers.len()
        );
        let new_body = annotate_body(&mut module.arena, function.body, &eligible, target)?;
        module.set_function_body(&function.name, new_body)?;
        layers.extend(report.layers);
    }
    Ok(SubgraphReport::new(layers))
}

/// Marker tallies of a validated annotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionStats {
    pub begins: usize,
    pub ends: usize,
}

/// Checks that the markers under `root` are structurally sound.
///
/// Every end must fence a call, tuple or projection whose direct operands
/// are all begins of the same target. Mixed-target fences are rejected.
pub fn verify_regions(arena: &ExprArena, root: ExprId) -> Result<RegionStats, OffloadError> {
    Ok(verify_inner(arena, root)?)
}

fn verify_inner(arena: &ExprArena, root: ExprId) -> anyhow::Result<RegionStats> {
    for id in postorder(arena, root) {
        match arena.get(id) {
            Expr::RegionEnd { body, target } => {
                let fenced = arena.get(*body);
                ensure!(
                    matches!(
                        fenced,
                        Expr::Call { .. } | Expr::Tuple { .. } | Expr::TupleGetItem { .. }
                    ),
                    "region end {} fences a {} node",
                    id,
                    fenced.kind_name()
                );
                for operand in children(fenced) {
                    match arena.get(operand) {
                        Expr::RegionBegin { target: t, .. } if t == target => {}
                        Expr::RegionBegin { target: t, .. } => bail!(
                            "region end {} for {} fed by a begin for {}",
                            id,
                            target,
                            t
                        ),
                        other => bail!(
                            "operand {} of fenced node {} is a bare {}",
                            operand,
                            body,
                            other.kind_name()
                        ),
                    }
                }
            }
            Expr::RegionBegin { body, target } => {
                if let Expr::RegionEnd { target: t, .. } = arena.get(*body) {
                    ensure!(
                        t == target,
                        "begin {} for {} directly fences an end for {}",
                        id,
                        target,
                        t
                    );
                }
            }
            _ => {}
        }
    }
    let mut stats = RegionStats::default();
    for counts in marker_counts(arena, root).values() {
        stats.begins += counts.begins;
        stats.ends += counts.ends;
    }
    Ok(stats)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{conv_bias_relu, init_test_logger, OpSetPartitioner};
    use nnir::{expr::ExprArena, function::Function};
    use rstest::rstest;

    fn eligible(ids: impl IntoIterator<Item = ExprId>) -> EligibleSet {
        ids.into_iter().collect()
    }

    fn call_chain(arena: &mut ExprArena) -> ExprId {
        let x = arena.var("x");
        let relu = arena.call_plain("relu", vec![x]);
        arena.call_plain("softmax", vec![relu])
    }

    fn tuple_of_calls(arena: &mut ExprArena) -> ExprId {
        let x = arena.var("x");
        let a = arena.call_plain("relu", vec![x]);
        let b = arena.call_plain("tanh", vec![x]);
        arena.tuple(vec![a, b])
    }

    fn projection(arena: &mut ExprArena) -> ExprId {
        let x = arena.var("x");
        let split = arena.call_plain("split", vec![x]);
        arena.tuple_get_item(split, 0)
    }

    fn conditional(arena: &mut ExprArena) -> ExprId {
        let c = arena.var("c");
        let x = arena.var("x");
        let yes = arena.call_plain("relu", vec![x]);
        arena.if_node(c, yes, x)
    }

    #[rstest]
    #[case::call_chain(call_chain)]
    #[case::tuple_of_calls(tuple_of_calls)]
    #[case::projection(projection)]
    #[case::conditional(conditional)]
    fn test_empty_set_is_identity(#[case] build: fn(&mut ExprArena) -> ExprId) {
        let mut arena = ExprArena::new();
        let root = build(&mut arena);
        let nodes_before = arena.len();
        let rewritten = annotate_body(&mut arena, root, &eligible([]), "dpu").unwrap();
        assert_eq!(rewritten, root);
        assert_eq!(arena.len(), nodes_before);
        assert!(arena.iter().all(|(_, node)| !node.is_marker()));
    }

    #[test]
    fn test_eligible_call_is_fenced() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let w = arena.var("w");
        let conv = arena.call_plain("conv2d", vec![x, w]);
        let new_root = annotate_body(&mut arena, conv, &eligible([conv]), "dpu").unwrap();
        let Expr::RegionEnd { body, target } = arena.get(new_root) else {
            panic!("root must be a region end");
        };
        assert_eq!(target, "dpu");
        let Expr::Call { op, args, .. } = arena.get(*body) else {
            panic!("end must fence the call");
        };
        assert_eq!(op, "conv2d");
        assert_eq!(args.len(), 2);
        for (&arg, original) in args.iter().zip([x, w]) {
            let Expr::RegionBegin { body, target } = arena.get(arg) else {
                panic!("argument must be fenced by a begin");
            };
            assert_eq!(target, "dpu");
            assert_eq!(*body, original);
        }
        verify_regions(&arena, new_root).unwrap();
    }

    #[test]
    fn test_annotate_keeps_name_and_params() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let relu = arena.call_plain("relu", vec![x]);
        let function = Function::new(&arena, "main", vec![x], relu).unwrap();
        let rewritten = annotate(&mut arena, &function, &eligible([relu]), "dpu").unwrap();
        assert_eq!(rewritten.name, function.name);
        assert_eq!(rewritten.params, function.params);
        assert!(matches!(arena.get(rewritten.body), Expr::RegionEnd { .. }));
    }

    #[test]
    fn test_ineligible_parent_of_eligible_child_is_rebuilt() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let conv = arena.call_plain("conv2d", vec![x]);
        let root = arena.call_plain("softmax", vec![conv]);
        let new_root = annotate_body(&mut arena, root, &eligible([conv]), "dpu").unwrap();
        assert_ne!(new_root, root);
        let Expr::Call { op, args, .. } = arena.get(new_root) else {
            panic!("root must stay a call");
        };
        assert_eq!(op, "softmax");
        assert!(matches!(arena.get(args[0]), Expr::RegionEnd { .. }));
        let stats = verify_regions(&arena, new_root).unwrap();
        assert_eq!(stats, RegionStats { begins: 1, ends: 1 });
    }

    #[test]
    fn test_shared_subexpression_rewritten_once() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let shared = arena.call_plain("relu", vec![x]);
        let root = arena.call_plain("add", vec![shared, shared]);
        let new_root = annotate_body(&mut arena, root, &eligible([shared]), "dpu").unwrap();
        let Expr::Call { args, .. } = arena.get(new_root) else {
            panic!("root must stay a call");
        };
        // Both operand slots point at the SAME rewritten node.
        assert_eq!(args[0], args[1]);
        let stats = verify_regions(&arena, new_root).unwrap();
        assert_eq!(stats, RegionStats { begins: 1, ends: 1 });
    }

    #[test]
    fn test_eligible_tuple_fenced_like_a_call() {
        let mut arena = ExprArena::new();
        let a = arena.var("a");
        let b = arena.var("b");
        let tup = arena.tuple(vec![a, b]);
        let new_root = annotate_body(&mut arena, tup, &eligible([tup]), "dpu").unwrap();
        let Expr::RegionEnd { body, .. } = arena.get(new_root) else {
            panic!("eligible tuple must be fenced by an end");
        };
        let Expr::Tuple { fields } = arena.get(*body) else {
            panic!("end must fence the rebuilt tuple");
        };
        for (&field, original) in fields.iter().zip([a, b]) {
            let Expr::RegionBegin { body, .. } = arena.get(field) else {
                panic!("each field must be fenced by a begin");
            };
            assert_eq!(*body, original);
        }
        let stats = verify_regions(&arena, new_root).unwrap();
        assert_eq!(stats, RegionStats { begins: 2, ends: 1 });
    }

    #[test]
    fn test_projection_keyed_on_tuple_identity() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let split = arena.call_plain("split", vec![x]);
        let item = arena.tuple_get_item(split, 1);
        // The projection itself is NOT in the set; only the tuple value is.
        let new_root = annotate_body(&mut arena, item, &eligible([split]), "dpu").unwrap();
        let Expr::RegionEnd { body, .. } = arena.get(new_root) else {
            panic!("projection over a claimed tuple must be fenced by an end");
        };
        let Expr::TupleGetItem { tuple, index } = arena.get(*body) else {
            panic!("end must fence the projection");
        };
        assert_eq!(*index, 1);
        assert!(matches!(arena.get(*tuple), Expr::RegionBegin { .. }));
        verify_regions(&arena, new_root).unwrap();
    }

    #[test]
    fn test_projection_not_keyed_on_own_identity() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let split = arena.call_plain("split", vec![x]);
        let item = arena.tuple_get_item(split, 0);
        let new_root = annotate_body(&mut arena, item, &eligible([item]), "dpu").unwrap();
        assert_eq!(new_root, item);
    }

    #[test]
    fn test_conditional_is_rewritten_through_but_never_fenced() {
        let mut arena = ExprArena::new();
        let c = arena.var("c");
        let x = arena.var("x");
        let yes = arena.call_plain("relu", vec![x]);
        let no = arena.call_plain("tanh", vec![x]);
        let cond = arena.if_node(c, yes, no);
        let new_root = annotate_body(&mut arena, cond, &eligible([yes, cond]), "dpu").unwrap();
        let Expr::If {
            cond: _,
            then_branch,
            else_branch,
        } = arena.get(new_root)
        else {
            panic!("conditional must stay a conditional");
        };
        assert!(matches!(arena.get(*then_branch), Expr::RegionEnd { .. }));
        assert_eq!(*else_branch, no);
    }

    #[test]
    fn test_already_annotated_input_is_rejected() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let conv = arena.call_plain("conv2d", vec![x]);
        let fenced = annotate_body(&mut arena, conv, &eligible([conv]), "dpu").unwrap();
        let err = annotate_body(&mut arena, fenced, &eligible([]), "dpu").unwrap_err();
        assert!(matches!(
            err,
            OffloadError::UnsupportedNodeKind { ref kind, .. } if kind == "region_begin"
        ));
    }

    #[test]
    fn test_begin_count_matches_arity_sum() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let w = arena.var("w");
        let b = arena.var("b");
        let conv = arena.call_plain("conv2d", vec![x, w]);
        let bias = arena.call_plain("bias_add", vec![conv, b]);
        let root = arena.call_plain("relu", vec![bias]);
        let new_root =
            annotate_body(&mut arena, root, &eligible([conv, bias, root]), "dpu").unwrap();
        // One end per eligible node, one begin per operand slot: 2 + 2 + 1.
        let stats = verify_regions(&arena, new_root).unwrap();
        assert_eq!(stats, RegionStats { begins: 5, ends: 3 });
        assert!(matches!(arena.get(new_root), Expr::RegionEnd { .. }));
    }

    #[test]
    fn test_verify_rejects_bare_operand() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let call = arena.call_plain("relu", vec![x]);
        let root = arena.region_end(call, "dpu");
        let err = verify_regions(&arena, root).unwrap_err();
        assert!(err.to_string().contains("bare var"), "{err}");
    }

    #[test]
    fn test_verify_rejects_mixed_targets() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let begin = arena.region_begin(x, "npu");
        let call = arena.call_plain("relu", vec![begin]);
        let root = arena.region_end(call, "dpu");
        let err = verify_regions(&arena, root).unwrap_err();
        assert!(err.to_string().contains("begin for npu"), "{err}");
    }

    #[test]
    fn test_annotate_module_fences_claimed_chain() {
        init_test_logger();
        let mut arena = ExprArena::new();
        let function = conv_bias_relu(&mut arena);
        let mut module = Module::with_function(arena, function);
        let partitioner = OpSetPartitioner::new(["conv2d", "bias_add"]);
        let report = annotate_module(&mut module, &ParamMap::new(), &partitioner, "dpu").unwrap();
        assert_eq!(report.layers_for_target("dpu").count(), 2);
        let body = module.function(MAIN).unwrap().body;
        // relu stays on the host, so the root is its bare call.
        let Expr::Call { op, args, .. } = module.arena.get(body) else {
            panic!("root must stay a call");
        };
        assert_eq!(op, "relu");
        assert!(matches!(module.arena.get(args[0]), Expr::RegionEnd { .. }));
        let stats = verify_regions(&module.arena, body).unwrap();
        assert_eq!(stats, RegionStats { begins: 4, ends: 2 });
    }

    #[test]
    fn test_annotate_module_fences_disjoint_helper_function() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let main_body = arena.call_plain("conv2d", vec![x]);
        let main = Function::new(&arena, MAIN, vec![x], main_body).unwrap();
        let y = arena.var("y");
        let helper_body = arena.call_plain("conv2d", vec![y]);
        let helper = Function::new(&arena, "helper", vec![y], helper_body).unwrap();
        let mut module = Module::with_function(arena, main);
        module.add_function(helper).unwrap();
        assert_eq!(
            module.function_names().collect::<Vec<_>>(),
            vec!["helper", MAIN]
        );
        let partitioner = OpSetPartitioner::new(["conv2d"]);
        let report = annotate_module(&mut module, &ParamMap::new(), &partitioner, "dpu").unwrap();
        // Each function is partitioned on its own, so the helper's claimed
        // call is fenced even though it shares no nodes with the entry body.
        assert_eq!(partitioner.partition_count(), 2);
        assert_eq!(report.layers_for_target("dpu").count(), 2);
        for name in ["helper", MAIN] {
            let body = module.function(name).unwrap().body;
            assert!(
                matches!(module.arena.get(body), Expr::RegionEnd { .. }),
                "function {name} should be fenced"
            );
            verify_regions(&module.arena, body).unwrap();
        }
    }

    #[test]
    fn test_fused_layer_makes_every_member_eligible() {
        let mut arena = ExprArena::new();
        let function = conv_bias_relu(&mut arena);
        let mut module = Module::with_function(arena, function);
        let partitioner = OpSetPartitioner::new(["conv2d", "bias_add", "relu"]).fused();
        let report = annotate_module(&mut module, &ParamMap::new(), &partitioner, "dpu").unwrap();
        // One fused layer carrying all three call ids.
        let fused: Vec<_> = report.layers_for_target("dpu").collect();
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].source_ids.len(), 3);
        let body = module.function(MAIN).unwrap().body;
        assert!(matches!(module.arena.get(body), Expr::RegionEnd { .. }));
        let stats = verify_regions(&module.arena, body).unwrap();
        assert_eq!(stats, RegionStats { begins: 5, ends: 3 });
    }

    #[test]
    fn test_annotate_module_requires_main() {
        let mut arena = ExprArena::new();
        let x = arena.var("x");
        let body = arena.call_plain("relu", vec![x]);
        let helper = Function::new(&arena, "helper", vec![x], body).unwrap();
        let mut module = Module::with_function(arena, helper);
        let partitioner = OpSetPartitioner::new(["relu"]);
        let err =
            annotate_module(&mut module, &ParamMap::new(), &partitioner, "dpu").unwrap_err();
        assert!(err.to_string().contains("no main function"), "{err}");
    }
}
