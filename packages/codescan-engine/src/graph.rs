//! Dependency Graph Builder - from rule metadata to a staged execution plan
//!
//! Converts registered rule descriptors into a petgraph DiGraph, adds
//! explicit (`need`) and implicit (`requires` -> `produces`) ordering edges,
//! rejects cycles with the full cycle path, and partitions the rules into
//! sequential stages via layered topological sort. Rules inside one stage
//! have no ordering constraint between them and may run in parallel.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::rule::RuleSet;

/// Why an ordering edge exists, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeReason {
    /// Consumer listed the producer in its `need` set.
    Need,
    /// Consumer `requires` a tag the producer `produces`.
    Tag(String),
}

/// Non-fatal build-time diagnostic: a `requires` tag with no registered
/// producer. The tag may come from corpus pre-loading or may never be set;
/// the rule must handle its absence defensively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanWarning {
    pub rule: String,
    pub tag: String,
}

impl std::fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rule '{}' requires tag '{}' which no registered rule produces",
            self.rule, self.tag
        )
    }
}

/// Ordered partition of rules into stages. Stage `k` contains only rules all
/// of whose graph predecessors lie in stages `< k`; members of one stage are
/// mutually independent by construction and sorted by
/// (priority descending, name ascending) for reproducible diagnostics.
#[derive(Debug)]
pub struct ExecutionPlan {
    /// Stage partition; entries are indices into the originating [`RuleSet`].
    stages: Vec<Vec<usize>>,
    warnings: Vec<PlanWarning>,
    graph: DiGraph<usize, EdgeReason>,
    node_of: Vec<NodeIndex>,
    names: Vec<String>,
}

impl ExecutionPlan {
    /// Build and validate the plan. Fails with a configuration error on an
    /// unknown `need` target or on any direct or indirect cycle; no partial
    /// schedule is ever produced.
    pub fn build(rules: &RuleSet) -> Result<Self> {
        let descriptors = rules.descriptors();

        let mut graph: DiGraph<usize, EdgeReason> = DiGraph::new();
        let mut node_of = Vec::with_capacity(descriptors.len());
        let mut index_by_name: HashMap<&str, usize> = HashMap::new();

        for (idx, descriptor) in descriptors.iter().enumerate() {
            node_of.push(graph.add_node(idx));
            index_by_name.insert(descriptor.name.as_str(), idx);
        }

        // Tag -> producers, for implicit data-dependency edges
        let mut producers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, descriptor) in descriptors.iter().enumerate() {
            for tag in &descriptor.produces {
                producers.entry(tag.as_str()).or_default().push(idx);
            }
        }

        // One edge per (producer, consumer) pair is enough for ordering
        let add_edge = |graph: &mut DiGraph<usize, EdgeReason>,
                        from: usize,
                        to: usize,
                        reason: EdgeReason| {
            if graph.find_edge(node_of[from], node_of[to]).is_none() {
                graph.add_edge(node_of[from], node_of[to], reason);
            }
        };

        let mut warnings = Vec::new();

        for (idx, descriptor) in descriptors.iter().enumerate() {
            // Explicit ordering: B in A.need => edge B -> A
            for needed in &descriptor.need {
                match index_by_name.get(needed.as_str()) {
                    Some(&producer) => add_edge(&mut graph, producer, idx, EdgeReason::Need),
                    None => {
                        return Err(EngineError::UnknownNeed {
                            rule: descriptor.name.clone(),
                            missing: needed.clone(),
                        })
                    }
                }
            }

            // Implicit data dependency: every producer of a required tag
            // runs in an earlier stage. Self-production does not order a
            // rule against itself.
            for tag in &descriptor.requires {
                match producers.get(tag.as_str()) {
                    Some(tag_producers) => {
                        for &producer in tag_producers {
                            if producer != idx {
                                add_edge(&mut graph, producer, idx, EdgeReason::Tag(tag.clone()));
                            }
                        }
                    }
                    None => {
                        let warning = PlanWarning {
                            rule: descriptor.name.clone(),
                            tag: tag.clone(),
                        };
                        warn!("unsatisfied precondition: {}", warning);
                        warnings.push(warning);
                    }
                }
            }
        }

        // Cycle check is mandatory before any schedule exists
        if let Some(cycle) = find_cycle(&graph) {
            let cycle = cycle
                .into_iter()
                .map(|node| descriptors[graph[node]].name.clone())
                .collect();
            return Err(EngineError::CycleDetected { cycle });
        }

        let names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        let stages = layered_sort(&graph, &node_of, |idx| {
            (
                std::cmp::Reverse(descriptors[idx].priority),
                names[idx].as_str(),
            )
        })?;

        Ok(Self {
            stages,
            warnings,
            graph,
            node_of,
            names,
        })
    }

    pub fn stages(&self) -> &[Vec<usize>] {
        &self.stages
    }

    pub fn warnings(&self) -> &[PlanWarning] {
        &self.warnings
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Stage number a rule was scheduled into.
    pub fn stage_of(&self, rule: &str) -> Option<usize> {
        self.stages.iter().position(|stage| {
            stage.iter().any(|&idx| self.names[idx] == rule)
        })
    }

    /// Direct predecessors of a rule (rules that must complete first).
    pub fn dependencies_of(&self, rule: &str) -> Vec<String> {
        self.neighbors_of(rule, Direction::Incoming)
    }

    /// Direct dependents of a rule (rules ordered after it).
    pub fn dependents_of(&self, rule: &str) -> Vec<String> {
        self.neighbors_of(rule, Direction::Outgoing)
    }

    fn neighbors_of(&self, rule: &str, direction: Direction) -> Vec<String> {
        let Some(idx) = self.names.iter().position(|n| n == rule) else {
            return Vec::new();
        };
        let mut neighbors: Vec<String> = self
            .graph
            .neighbors_directed(self.node_of[idx], direction)
            .map(|node| self.names[self.graph[node]].clone())
            .collect();
        neighbors.sort();
        neighbors
    }

    /// All ordering edges as (producer, consumer, reason), sorted for
    /// deterministic diagnostics.
    pub fn edges(&self) -> Vec<(String, String, EdgeReason)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|edge| {
                let (from, to) = self.graph.edge_endpoints(edge)?;
                Some((
                    self.names[self.graph[from]].clone(),
                    self.names[self.graph[to]].clone(),
                    self.graph[edge].clone(),
                ))
            })
            .collect();
        edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        edges
    }

    /// Human-readable plan, one phase per line (for logging).
    pub fn render(&self) -> String {
        self.stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let members: Vec<&str> =
                    stage.iter().map(|&idx| self.names[idx].as_str()).collect();
                if members.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, members.join(" | "))
                } else {
                    format!("Phase {}: {}", i + 1, members[0])
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// DFS cycle extraction. Returns the full ordered cycle (first node repeated
/// at the end) so configuration errors can name the exact membership.
fn find_cycle(graph: &DiGraph<usize, EdgeReason>) -> Option<Vec<NodeIndex>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        graph: &DiGraph<usize, EdgeReason>,
        node: NodeIndex,
        colors: &mut Vec<Color>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        colors[node.index()] = Color::Gray;
        stack.push(node);

        for succ in graph.neighbors(node) {
            match colors[succ.index()] {
                Color::Gray => {
                    let start = stack.iter().position(|&n| n == succ).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(succ);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(graph, succ, colors, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        colors[node.index()] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; graph.node_count()];
    for node in graph.node_indices() {
        if colors[node.index()] == Color::White {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(graph, node, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Layered (Kahn) topological sort: each round collects every node whose
/// in-degree reached zero, forming one stage. `sort_key` fixes the
/// stage-internal order.
fn layered_sort<K, F>(
    graph: &DiGraph<usize, EdgeReason>,
    node_of: &[NodeIndex],
    sort_key: F,
) -> Result<Vec<Vec<usize>>>
where
    K: Ord,
    F: Fn(usize) -> K,
{
    let mut in_degree: HashMap<usize, usize> = node_of
        .iter()
        .enumerate()
        .map(|(idx, &node)| {
            (
                idx,
                graph.neighbors_directed(node, Direction::Incoming).count(),
            )
        })
        .collect();

    let mut stages = Vec::new();
    let mut remaining = node_of.len();

    while remaining > 0 {
        let mut ready: Vec<usize> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&idx, _)| idx)
            .collect();

        if ready.is_empty() {
            // Unreachable after the cycle check; guard anyway
            return Err(EngineError::Internal(
                "layered sort stalled on a validated acyclic graph".to_string(),
            ));
        }

        ready.sort_by_key(|&idx| sort_key(idx));

        for &idx in &ready {
            in_degree.remove(&idx);
            for succ in graph.neighbors(node_of[idx]) {
                if let Some(degree) = in_degree.get_mut(&graph[succ]) {
                    *degree -= 1;
                }
            }
        }

        remaining -= ready.len();
        stages.push(ready);
    }

    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::rule::{Rule, RuleDescriptor, RuleError, StoreView};
    use proptest::prelude::*;
    use std::sync::Arc;

    struct NoopRule {
        descriptor: RuleDescriptor,
    }

    impl Rule for NoopRule {
        fn descriptor(&self) -> RuleDescriptor {
            self.descriptor.clone()
        }

        fn applies(&self, _artifact: &Artifact, _view: &StoreView<'_>) -> bool {
            true
        }

        fn decorate(
            &self,
            _artifact: &Artifact,
            _view: &StoreView<'_>,
        ) -> std::result::Result<(), RuleError> {
            Ok(())
        }
    }

    fn rule_set(descriptors: Vec<RuleDescriptor>) -> RuleSet {
        let mut rules = RuleSet::new();
        for descriptor in descriptors {
            rules
                .register(Arc::new(NoopRule { descriptor }))
                .expect("registration");
        }
        rules
    }

    fn stage_names(plan: &ExecutionPlan, rules: &RuleSet) -> Vec<Vec<String>> {
        plan.stages()
            .iter()
            .map(|stage| {
                stage
                    .iter()
                    .map(|&idx| rules.descriptors()[idx].name.clone())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_need_and_requires_edges_stage_ordering() {
        let rules = rule_set(vec![
            RuleDescriptor::builder("Parse").produces("is_source").build(),
            RuleDescriptor::builder("TagA")
                .need("Parse")
                .requires("is_source")
                .produces("flag_a")
                .build(),
            RuleDescriptor::builder("TagB").requires("flag_a").produces("flag_b").build(),
        ]);

        let plan = ExecutionPlan::build(&rules).unwrap();
        assert_eq!(
            stage_names(&plan, &rules),
            vec![vec!["Parse"], vec!["TagA"], vec!["TagB"]]
        );
        assert!(plan.warnings().is_empty());
    }

    #[test]
    fn test_independent_rules_share_a_stage() {
        let rules = rule_set(vec![
            RuleDescriptor::builder("A").build(),
            RuleDescriptor::builder("B").build(),
            RuleDescriptor::builder("C").build(),
        ]);

        let plan = ExecutionPlan::build(&rules).unwrap();
        assert_eq!(plan.stage_count(), 1);
        assert_eq!(stage_names(&plan, &rules), vec![vec!["A", "B", "C"]]);
    }

    #[test]
    fn test_stage_internal_order_priority_then_name() {
        let rules = rule_set(vec![
            RuleDescriptor::builder("zeta").priority(5).build(),
            RuleDescriptor::builder("alpha").priority(0).build(),
            RuleDescriptor::builder("beta").priority(5).build(),
        ]);

        let plan = ExecutionPlan::build(&rules).unwrap();
        // priority descending, then name ascending
        assert_eq!(
            stage_names(&plan, &rules),
            vec![vec!["beta", "zeta", "alpha"]]
        );
    }

    #[test]
    fn test_multiple_producers_all_precede_consumer() {
        let rules = rule_set(vec![
            RuleDescriptor::builder("P1").produces("t").build(),
            RuleDescriptor::builder("Consumer").requires("t").build(),
            RuleDescriptor::builder("P2").produces("t").build(),
        ]);

        let plan = ExecutionPlan::build(&rules).unwrap();
        assert_eq!(
            stage_names(&plan, &rules),
            vec![vec!["P1", "P2"], vec!["Consumer"]]
        );
        assert_eq!(
            plan.dependencies_of("Consumer"),
            vec!["P1".to_string(), "P2".to_string()]
        );
    }

    #[test]
    fn test_unsatisfied_requires_is_a_warning() {
        let rules = rule_set(vec![RuleDescriptor::builder("Orphan")
            .requires("never_produced")
            .build()]);

        let plan = ExecutionPlan::build(&rules).unwrap();
        assert_eq!(plan.stage_count(), 1);
        assert_eq!(
            plan.warnings(),
            &[PlanWarning {
                rule: "Orphan".to_string(),
                tag: "never_produced".to_string(),
            }]
        );
    }

    #[test]
    fn test_direct_cycle_reported_with_membership() {
        let rules = rule_set(vec![
            RuleDescriptor::builder("A").need("B").build(),
            RuleDescriptor::builder("B").need("A").build(),
        ]);

        let err = ExecutionPlan::build(&rules).unwrap_err();
        match err {
            EngineError::CycleDetected { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"A".to_string()));
                assert!(cycle.contains(&"B".to_string()));
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_indirect_cycle_through_tag_production() {
        // A requires a tag only C produces, and C needs A
        let rules = rule_set(vec![
            RuleDescriptor::builder("A").requires("t").build(),
            RuleDescriptor::builder("C").produces("t").need("A").build(),
        ]);

        let err = ExecutionPlan::build(&rules).unwrap_err();
        match err {
            EngineError::CycleDetected { cycle } => {
                assert!(cycle.contains(&"A".to_string()));
                assert!(cycle.contains(&"C".to_string()));
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_need_is_configuration_error() {
        let rules = rule_set(vec![RuleDescriptor::builder("A").need("Ghost").build()]);

        let err = ExecutionPlan::build(&rules).unwrap_err();
        assert!(
            matches!(err, EngineError::UnknownNeed { ref rule, ref missing } if rule == "A" && missing == "Ghost")
        );
    }

    #[test]
    fn test_self_produced_requirement_does_not_self_order() {
        // A rule may refresh a tag it also consumes; that is not a cycle
        let rules = rule_set(vec![RuleDescriptor::builder("A")
            .requires("t")
            .produces("t")
            .build()]);

        let plan = ExecutionPlan::build(&rules).unwrap();
        assert_eq!(plan.stage_count(), 1);
    }

    #[test]
    fn test_edges_expose_reason() {
        let rules = rule_set(vec![
            RuleDescriptor::builder("P").produces("t").build(),
            RuleDescriptor::builder("C").requires("t").need("P").build(),
        ]);

        let plan = ExecutionPlan::build(&rules).unwrap();
        let edges = plan.edges();
        // Deduplicated: one ordering edge per (producer, consumer) pair,
        // the first reason encountered wins
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].0, "P");
        assert_eq!(edges[0].1, "C");
        assert_eq!(edges[0].2, EdgeReason::Need);
    }

    #[test]
    fn test_render_marks_parallel_phases() {
        let rules = rule_set(vec![
            RuleDescriptor::builder("A").build(),
            RuleDescriptor::builder("B").build(),
            RuleDescriptor::builder("C").need("A").build(),
        ]);

        let plan = ExecutionPlan::build(&rules).unwrap();
        let rendered = plan.render();
        assert!(rendered.contains("Phase 1: A | B (parallel)"));
        assert!(rendered.contains("Phase 2: C"));
    }

    proptest! {
        /// Every `need` edge points from a lower-numbered stage to a
        /// higher-numbered one, for arbitrary acyclic rule sets.
        #[test]
        fn prop_need_edges_cross_stages_upward(
            edges in prop::collection::vec((0usize..12, 0usize..12), 0..40)
        ) {
            let mut descriptors: Vec<RuleDescriptor> = (0..12)
                .map(|i| RuleDescriptor::builder(format!("r{i:02}")).build())
                .collect();

            // Direct every edge low -> high so the set stays acyclic
            let mut needs: Vec<(usize, usize)> = Vec::new();
            for (a, b) in edges {
                if a != b {
                    let (lo, hi) = (a.min(b), a.max(b));
                    descriptors[hi].need.insert(format!("r{lo:02}"));
                    needs.push((lo, hi));
                }
            }

            let rules = rule_set(descriptors);
            let plan = ExecutionPlan::build(&rules).unwrap();

            for (lo, hi) in needs {
                let producer_stage = plan.stage_of(&format!("r{lo:02}")).unwrap();
                let consumer_stage = plan.stage_of(&format!("r{hi:02}")).unwrap();
                prop_assert!(producer_stage < consumer_stage);
            }
        }
    }
}
