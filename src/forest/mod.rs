//! The shared derivation forest: a hypergraph of nodes and edges addressed
//! by integer id.
//!
//! Nodes cover half-open spans of the input sentence and carry a label;
//! edges connect a head node to ordered tail nodes and carry the target
//! templates, features, and score of the rule application that produced
//! them. Transforms never mutate a graph they receive; they build a new one.

mod nbest;

pub use nbest::NbestPath;

use std::sync::OnceLock;

use tracing::debug;

use crate::features::FeatureVec;
use crate::rule::CfgData;
use crate::symbol::{Sentence, WordId};

pub type NodeId = usize;
pub type EdgeId = usize;

/// Score of a node with no derivation.
pub const UNREACHABLE: f64 = f64::NEG_INFINITY;

#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    #[error("node {0} has no derivation")]
    EmptyDerivation(NodeId),

    #[error("node id {id} out of range (graph has {len} nodes)")]
    NodeOutOfRange { id: NodeId, len: usize },

    #[error("edge with {tails} tails does not match template with {placeholders} placeholders")]
    TailCountMismatch { tails: usize, placeholders: usize },

    #[error("derivation refers to edge {edge} which is not headed at the expected node")]
    BrokenDerivation { edge: EdgeId },
}

#[derive(Debug, Clone)]
pub struct HyperNode {
    pub id: NodeId,
    pub label: WordId,
    pub span: (usize, usize),
    pub terminal: bool,
    /// Incoming edges: alternative ways to derive this node.
    pub edges: Vec<EdgeId>,
}

#[derive(Debug, Clone)]
pub struct HyperEdge {
    pub id: EdgeId,
    pub head: NodeId,
    /// Source-order nonterminal children.
    pub tails: Vec<NodeId>,
    /// Target template per output factor, copied from the producing rule.
    pub trg: Vec<CfgData>,
    pub features: FeatureVec,
    pub score: f64,
}

#[derive(Default)]
pub struct HyperGraph {
    nodes: Vec<HyperNode>,
    edges: Vec<HyperEdge>,
    words: Sentence,
    viterbi: OnceLock<Vec<f64>>,
}

impl HyperGraph {
    pub fn new(words: Sentence) -> Self {
        Self {
            words,
            ..Self::default()
        }
    }

    pub fn words(&self) -> &Sentence {
        &self.words
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &HyperNode {
        &self.nodes[id]
    }

    pub fn edge(&self, id: EdgeId) -> &HyperEdge {
        &self.edges[id]
    }

    pub fn nodes(&self) -> &[HyperNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[HyperEdge] {
        &self.edges
    }

    pub fn add_node(&mut self, label: WordId, span: (usize, usize), terminal: bool) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(HyperNode {
            id,
            label,
            span,
            terminal,
            edges: Vec::new(),
        });
        id
    }

    /// Widen or correct a node's span. Used by builders that learn the
    /// extent of a node only after visiting its children.
    pub fn set_span(&mut self, id: NodeId, span: (usize, usize)) {
        self.nodes[id].span = span;
    }

    /// Add an edge and register it with its head node.
    ///
    /// Validates the structural invariants: head and tails must name nodes
    /// of this graph, and the tail count must equal the number of
    /// placeholders in every target factor.
    pub fn add_edge(
        &mut self,
        head: NodeId,
        tails: Vec<NodeId>,
        trg: Vec<CfgData>,
        features: FeatureVec,
        score: f64,
    ) -> Result<EdgeId, ForestError> {
        let len = self.nodes.len();
        if head >= len {
            return Err(ForestError::NodeOutOfRange { id: head, len });
        }
        for &t in &tails {
            if t >= len {
                return Err(ForestError::NodeOutOfRange { id: t, len });
            }
        }
        for factor in &trg {
            let placeholders = factor.nonterm_positions().len();
            if placeholders != tails.len() {
                return Err(ForestError::TailCountMismatch {
                    tails: tails.len(),
                    placeholders,
                });
            }
        }
        let id = self.edges.len();
        self.edges.push(HyperEdge {
            id,
            head,
            tails,
            trg,
            features,
            score,
        });
        self.nodes[head].edges.push(id);
        self.viterbi = OnceLock::new();
        Ok(id)
    }

    /// Set every edge score to the dot product of its features and `weights`.
    pub fn score_edges(&mut self, weights: &FeatureVec) {
        for edge in &mut self.edges {
            edge.score = edge.features.dot(weights);
        }
        self.viterbi = OnceLock::new();
    }

    /// Best-derivation score per node: max over incoming edges of the edge
    /// score plus the tails' best scores. Terminal nodes score zero;
    /// underivable nodes get `UNREACHABLE`.
    pub fn viterbi_scores(&self) -> &[f64] {
        self.viterbi.get_or_init(|| {
            let mut memo = vec![f64::NAN; self.nodes.len()];
            for id in 0..self.nodes.len() {
                self.calc_viterbi(id, &mut memo);
            }
            memo
        })
    }

    fn calc_viterbi(&self, id: NodeId, memo: &mut [f64]) -> f64 {
        if !memo[id].is_nan() {
            return memo[id];
        }
        // Mark in-progress so a malformed cyclic graph cannot hang us.
        memo[id] = UNREACHABLE;
        let node = &self.nodes[id];
        let mut best = if node.terminal && node.edges.is_empty() {
            0.0
        } else {
            UNREACHABLE
        };
        for &eid in &node.edges {
            let edge = &self.edges[eid];
            let mut score = edge.score;
            for &tail in &edge.tails {
                score += self.calc_viterbi(tail, memo);
            }
            if score > best {
                best = score;
            }
        }
        if best == UNREACHABLE && !node.edges.is_empty() {
            debug!(node = id, "all derivations of node are unreachable");
        }
        memo[id] = best;
        best
    }

    /// Best-derivation score of one node, or an error if it has no
    /// derivation at all (a logic error in the producing transform).
    pub fn viterbi_score(&self, id: NodeId) -> Result<f64, ForestError> {
        if id >= self.nodes.len() {
            return Err(ForestError::NodeOutOfRange {
                id,
                len: self.nodes.len(),
            });
        }
        let score = self.viterbi_scores()[id];
        if score == UNREACHABLE {
            Err(ForestError::EmptyDerivation(id))
        } else {
            Ok(score)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::tail_symbol;

    fn template(words: Sentence) -> Vec<CfgData> {
        vec![CfgData::new(words, 0, vec![0; 0])]
    }

    fn binary_template() -> Vec<CfgData> {
        vec![CfgData::new(vec![tail_symbol(0), tail_symbol(1)], 0, vec![0, 0])]
    }

    #[test]
    fn viterbi_takes_max_over_edges() {
        let mut hg = HyperGraph::new(vec![1, 2]);
        let root = hg.add_node(0, (0, 2), false);
        let a = hg.add_node(0, (0, 1), true);
        let b = hg.add_node(0, (1, 2), true);
        hg.add_edge(root, vec![a, b], binary_template(), FeatureVec::new(), -2.0)
            .unwrap();
        hg.add_edge(root, vec![a, b], binary_template(), FeatureVec::new(), -1.0)
            .unwrap();
        assert_eq!(hg.viterbi_score(root).unwrap(), -1.0);
    }

    #[test]
    fn viterbi_sums_tail_scores() {
        let mut hg = HyperGraph::new(vec![1, 2]);
        let root = hg.add_node(0, (0, 2), false);
        let a = hg.add_node(0, (0, 1), false);
        let b = hg.add_node(0, (1, 2), false);
        let ta = hg.add_node(0, (0, 1), true);
        let tb = hg.add_node(0, (1, 2), true);
        hg.add_edge(a, vec![ta], template(vec![tail_symbol(0)]), FeatureVec::new(), -0.5)
            .unwrap();
        hg.add_edge(b, vec![tb], template(vec![tail_symbol(0)]), FeatureVec::new(), -0.25)
            .unwrap();
        hg.add_edge(root, vec![a, b], binary_template(), FeatureVec::new(), -1.0)
            .unwrap();
        assert!((hg.viterbi_score(root).unwrap() - (-1.75)).abs() < 1e-10);
    }

    #[test]
    fn empty_derivation_is_an_error() {
        let mut hg = HyperGraph::new(vec![1]);
        let lonely = hg.add_node(0, (0, 1), false);
        assert!(matches!(
            hg.viterbi_score(lonely),
            Err(ForestError::EmptyDerivation(_))
        ));
    }

    #[test]
    fn tail_count_must_match_template() {
        let mut hg = HyperGraph::new(vec![1, 2]);
        let root = hg.add_node(0, (0, 2), false);
        let a = hg.add_node(0, (0, 1), true);
        let err = hg.add_edge(root, vec![a], binary_template(), FeatureVec::new(), 0.0);
        assert!(matches!(err, Err(ForestError::TailCountMismatch { .. })));
    }

    #[test]
    fn foreign_node_id_rejected() {
        let mut hg = HyperGraph::new(vec![1]);
        let root = hg.add_node(0, (0, 1), false);
        let err = hg.add_edge(root, vec![17], binary_template(), FeatureVec::new(), 0.0);
        assert!(matches!(err, Err(ForestError::NodeOutOfRange { .. })));
    }

    #[test]
    fn score_edges_uses_weight_dot_product() {
        let mut hg = HyperGraph::new(vec![1]);
        let root = hg.add_node(0, (0, 1), false);
        let t = hg.add_node(0, (0, 1), true);
        let feats: FeatureVec = [(7, 2.0)].into_iter().collect();
        hg.add_edge(root, vec![t], template(vec![tail_symbol(0)]), feats, 0.0)
            .unwrap();
        let weights: FeatureVec = [(7, -0.5)].into_iter().collect();
        hg.score_edges(&weights);
        assert_eq!(hg.edge(0).score, -1.0);
        assert_eq!(hg.viterbi_score(root).unwrap(), -1.0);
    }
}
