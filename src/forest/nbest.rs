//! Lazy n-best derivation extraction.
//!
//! A partial path holds the edges chosen so far plus a stack of nodes still
//! to be expanded; its score is the sum of chosen edge scores and the
//! Viterbi bounds of the remaining nodes, so the queue always pops the best
//! completable path first. The sequence is finite and bounded by the
//! requested count, and is not restartable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::{debug, debug_span};

use crate::features::FeatureVec;
use crate::symbol::{tail_index, Sentence, WordId};

use super::{EdgeId, ForestError, HyperGraph, NodeId, UNREACHABLE};

/// One ranked derivation: edges in depth-first left-to-right order.
#[derive(Debug, Clone)]
pub struct NbestPath {
    pub edges: Vec<EdgeId>,
    pub score: f64,
}

struct PartialPath {
    edges: Vec<EdgeId>,
    remaining: Vec<NodeId>,
    score: f64,
}

impl PartialEq for PartialPath {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for PartialPath {}

impl Ord for PartialPath {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on score; ties break toward shorter, then
        // lexicographically smaller edge lists so extraction order never
        // depends on heap internals.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.edges.len().cmp(&self.edges.len()))
            .then_with(|| other.edges.cmp(&self.edges))
    }
}
impl PartialOrd for PartialPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl HyperGraph {
    /// Up to `n` best derivations rooted at `root`, best first.
    pub fn nbest(&self, root: NodeId, n: usize) -> Vec<NbestPath> {
        let _span = debug_span!("nbest", root, n).entered();
        if n == 0 || root >= self.num_nodes() {
            return Vec::new();
        }
        let viterbi = self.viterbi_scores();
        if viterbi[root] == UNREACHABLE {
            return Vec::new();
        }
        let mut queue: BinaryHeap<PartialPath> = BinaryHeap::new();
        queue.push(PartialPath {
            edges: Vec::new(),
            remaining: vec![root],
            score: viterbi[root],
        });
        let mut ret = Vec::new();
        while let Some(mut path) = queue.pop() {
            if ret.len() >= n {
                break;
            }
            match path.remaining.pop() {
                None => ret.push(NbestPath {
                    edges: path.edges,
                    score: path.score,
                }),
                Some(node_id) => {
                    let base = path.score - viterbi[node_id];
                    let node = self.node(node_id);
                    if node.edges.is_empty() {
                        // Terminal leaf: nothing to choose, keep going.
                        queue.push(path);
                        continue;
                    }
                    for &eid in &node.edges {
                        let edge = self.edge(eid);
                        let mut score = base + edge.score;
                        for &tail in &edge.tails {
                            score += viterbi[tail];
                        }
                        if score == UNREACHABLE {
                            continue;
                        }
                        let mut edges = path.edges.clone();
                        edges.push(eid);
                        let mut remaining = path.remaining.clone();
                        // Reverse push for depth-first left-to-right order.
                        remaining.extend(edge.tails.iter().rev());
                        queue.push(PartialPath {
                            edges,
                            remaining,
                            score,
                        });
                    }
                }
            }
        }
        debug!(result_count = ret.len(), best = ret.first().map(|p| p.score));
        ret
    }

    /// Sum of the features of every edge on the path.
    pub fn path_features(&self, path: &NbestPath) -> FeatureVec {
        let mut ret = FeatureVec::new();
        for &eid in &path.edges {
            ret.add_all(&self.edge(eid).features);
        }
        ret
    }

    /// Realize the output string of one factor of a derivation.
    ///
    /// Placeholders substitute the child translations in template order. A
    /// target terminal equal to `unk` maps back to the source words covered
    /// by the edge's head span (terminal edges) or to the children in order.
    pub fn path_translation(
        &self,
        path: &NbestPath,
        factor: usize,
        unk: Option<WordId>,
    ) -> Result<Sentence, ForestError> {
        let mut cursor = 0usize;
        self.realize(path, &mut cursor, factor, unk)
    }

    fn realize(
        &self,
        path: &NbestPath,
        cursor: &mut usize,
        factor: usize,
        unk: Option<WordId>,
    ) -> Result<Sentence, ForestError> {
        let eid = *path.edges.get(*cursor).ok_or(ForestError::BrokenDerivation {
            edge: path.edges.last().copied().unwrap_or(0),
        })?;
        *cursor += 1;
        let edge = self.edge(eid);
        let mut child_trans = Vec::with_capacity(edge.tails.len());
        for &tail in &edge.tails {
            let next = *path.edges.get(*cursor).ok_or(ForestError::BrokenDerivation { edge: eid })?;
            if self.edge(next).head != tail {
                return Err(ForestError::BrokenDerivation { edge: next });
            }
            child_trans.push(self.realize(path, cursor, factor, unk)?);
        }
        let template = edge
            .trg
            .get(factor)
            .ok_or(ForestError::BrokenDerivation { edge: eid })?;
        let mut ret = Vec::new();
        for &w in &template.words {
            if unk == Some(w) {
                if edge.tails.is_empty() {
                    let (start, end) = self.node(edge.head).span;
                    ret.extend_from_slice(&self.words()[start..end]);
                } else {
                    for child in &child_trans {
                        ret.extend_from_slice(child);
                    }
                }
            } else if w >= 0 {
                ret.push(w);
            } else {
                ret.extend_from_slice(&child_trans[tail_index(w)]);
            }
        }
        Ok(ret)
    }
}
