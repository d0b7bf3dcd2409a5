//! Language-model composition: rescore a derivation forest into a new
//! forest whose edges carry LM feature contributions.
//!
//! Two interchangeable strategies implement [`Composer`]. Both consume the
//! matcher's forest (root at node 0, edge scores already set from the rule
//! features) and produce a new graph where each node is one surviving
//! hypothesis of an input node, recombined on boundary state. The output
//! root, again node 0, closes every surviving full-span hypothesis against
//! the sentence boundary tokens, so n-best extraction on the output graph
//! yields exact sentence-level LM scores.

mod cube;
mod incremental;

pub use cube::CubePruningComposer;
pub use incremental::IncrementalComposer;

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::features::FeatureVec;
use crate::forest::{EdgeId, ForestError, HyperGraph, NodeId};
use crate::lm::{BoundaryState, LmData};
use crate::rule::CfgData;
use crate::symbol::tail_symbol;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("incremental composition requires exactly one language model, got {0}")]
    SingleLmRequired(usize),

    #[error("language model reads factor {factor} but edges carry only {available}")]
    MissingFactor { factor: usize, available: usize },

    #[error(transparent)]
    Forest(#[from] ForestError),
}

/// How multiple language models combine during search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LmCombination {
    /// All models score every candidate in one pass; recombination keys on
    /// the tuple of all boundary states.
    #[default]
    Joint,
    /// Models apply as strictly sequential rescoring passes.
    Consec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    #[default]
    Cube,
    Incremental,
}

/// Search-effort bounds. Zero means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchLimits {
    /// Max distinct survivors per node (cube pruning).
    pub chart_limit: usize,
    /// Max queue pops per node (cube pruning).
    pub pop_limit: usize,
    /// Max queue pops per node (incremental search).
    pub stack_pop_limit: usize,
    /// Max edges materialized per input edge (incremental search).
    pub edge_limit: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            chart_limit: 0,
            pop_limit: 2000,
            stack_pop_limit: 2000,
            edge_limit: 1000,
        }
    }
}

pub trait Composer: Send + Sync {
    fn compose(&self, graph: &HyperGraph) -> Result<HyperGraph, ComposeError>;
}

/// Select and construct a composer for the configured strategy.
pub fn build_composer(
    strategy: SearchStrategy,
    combination: LmCombination,
    lms: Vec<Arc<LmData>>,
    weights: FeatureVec,
    limits: SearchLimits,
) -> Result<Box<dyn Composer>, ComposeError> {
    Ok(match strategy {
        SearchStrategy::Cube => Box::new(CubePruningComposer::new(
            lms,
            weights,
            limits,
            combination,
        )),
        SearchStrategy::Incremental => {
            Box::new(IncrementalComposer::new(lms, weights, limits)?)
        }
    })
}

/// Nodes in bottom-up topological order, tails before heads.
pub(crate) fn topo_order(graph: &HyperGraph) -> Vec<NodeId> {
    fn visit(graph: &HyperGraph, v: NodeId, seen: &mut [bool], out: &mut Vec<NodeId>) {
        if seen[v] {
            return;
        }
        seen[v] = true;
        for &eid in &graph.node(v).edges {
            for &tail in &graph.edge(eid).tails {
                visit(graph, tail, seen, out);
            }
        }
        out.push(v);
    }
    let mut seen = vec![false; graph.num_nodes()];
    let mut out = Vec::with_capacity(graph.num_nodes());
    for v in 0..graph.num_nodes() {
        visit(graph, v, &mut seen, &mut out);
    }
    out
}

/// One surviving hypothesis of an input node.
pub(crate) struct Hyp {
    pub states: Vec<BoundaryState>,
    /// Best inside score including weighted LM contributions.
    pub score: f64,
    /// The node representing this hypothesis in the output graph.
    pub out_node: NodeId,
}

/// One frontier item of the per-node search queue.
pub(crate) struct CubeItem {
    /// Total hypothesis score: edge + chosen children + weighted LM.
    pub score: f64,
    pub edge: EdgeId,
    /// Per-tail index into that tail's rank-ordered hypothesis list.
    pub axis: Vec<usize>,
    pub states: Vec<BoundaryState>,
    /// LM feature contributions of this edge alone.
    pub features: FeatureVec,
    /// Edge-local score: rule score plus weighted LM, without children.
    pub local: f64,
}

impl PartialEq for CubeItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for CubeItem {}

impl Ord for CubeItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Best score first; ties go to the lowest edge id, then the
        // lexicographically smallest axis, so pop order is deterministic.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.edge.cmp(&self.edge))
            .then_with(|| other.axis.cmp(&self.axis))
    }
}
impl PartialOrd for CubeItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Build the frontier item for `edge` at `axis`, or `None` when some tail
/// has no hypothesis at the requested rank.
pub(crate) fn make_item(
    graph: &HyperGraph,
    lms: &[Arc<LmData>],
    weights: &FeatureVec,
    eid: EdgeId,
    axis: Vec<usize>,
    chart: &[Vec<Hyp>],
) -> Result<Option<CubeItem>, ComposeError> {
    let edge = graph.edge(eid);
    let mut child_score = 0.0;
    let mut children: Vec<&Hyp> = Vec::with_capacity(edge.tails.len());
    for (t, &tail) in edge.tails.iter().enumerate() {
        match chart[tail].get(axis[t]) {
            Some(hyp) => {
                child_score += hyp.score;
                children.push(hyp);
            }
            None => return Ok(None),
        }
    }

    let mut states = Vec::with_capacity(lms.len());
    let mut features = FeatureVec::new();
    let mut weighted = 0.0;
    for (l, lm) in lms.iter().enumerate() {
        let template = edge.trg.get(lm.factor()).ok_or(ComposeError::MissingFactor {
            factor: lm.factor(),
            available: edge.trg.len(),
        })?;
        let child_states: Vec<&BoundaryState> =
            children.iter().map(|c| &c.states[l]).collect();
        let (delta, oovs, state) = lm.score_template(&template.words, &child_states);
        features.add(lm.lm_feat(), delta);
        features.add(lm.lm_unk_feat(), oovs as f64);
        weighted += weights.get(lm.lm_feat()) * delta
            + weights.get(lm.lm_unk_feat()) * oovs as f64;
        states.push(state);
    }

    let local = edge.score + weighted;
    Ok(Some(CubeItem {
        score: local + child_score,
        edge: eid,
        axis,
        states,
        features,
        local,
    }))
}

/// Number of target factors carried by the graph's edges.
pub(crate) fn factor_count(graph: &HyperGraph) -> usize {
    graph.edges().first().map(|e| e.trg.len()).unwrap_or(1)
}

/// Attach the root-closing edges: one per surviving full-span hypothesis,
/// scoring its boundary state against `<s>` and `</s>`.
pub(crate) fn close_root(
    out: &mut HyperGraph,
    lms: &[Arc<LmData>],
    weights: &FeatureVec,
    root_label: crate::symbol::WordId,
    factors: usize,
    root_hyps: &[Hyp],
) -> Result<(), ForestError> {
    for hyp in root_hyps {
        let mut features = FeatureVec::new();
        let mut weighted = 0.0;
        for (l, lm) in lms.iter().enumerate() {
            let delta = lm.score_root(&hyp.states[l]);
            features.add(lm.lm_feat(), delta);
            weighted += weights.get(lm.lm_feat()) * delta;
        }
        let trg: Vec<CfgData> = (0..factors)
            .map(|_| CfgData::new(vec![tail_symbol(0)], root_label, vec![root_label]))
            .collect();
        out.add_edge(0, vec![hyp.out_node], trg, features, weighted)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    #[test]
    fn topo_order_puts_tails_first() {
        let mut hg = HyperGraph::new(vec![1, 2]);
        let root = hg.add_node(0, (0, 2), false);
        let a = hg.add_node(0, (0, 1), true);
        let b = hg.add_node(0, (1, 2), true);
        let trg = vec![CfgData::new(vec![tail_symbol(0), tail_symbol(1)], 0, vec![0, 0])];
        hg.add_edge(root, vec![a, b], trg, FeatureVec::new(), 0.0)
            .unwrap();
        let order = topo_order(&hg);
        let pos = |v: NodeId| order.iter().position(|&x| x == v).unwrap();
        assert!(pos(a) < pos(root));
        assert!(pos(b) < pos(root));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn incremental_rejects_multiple_lms() {
        let syms = SymbolTable::new();
        let lms = vec![testutil::test_lm(&syms), testutil::test_lm(&syms)];
        let err = build_composer(
            SearchStrategy::Incremental,
            LmCombination::Joint,
            lms,
            FeatureVec::new(),
            SearchLimits::default(),
        );
        assert!(matches!(err, Err(ComposeError::SingleLmRequired(2))));
    }
}
