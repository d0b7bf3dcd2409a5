//! State-grouping incremental composition.
//!
//! Single-model alternative to cube pruning: per node, candidate edges are
//! expanded best-first and hypotheses sharing a boundary state are grouped,
//! keeping only the best representative instead of recombining every
//! alternative. This keeps the output graph lean at the cost of the n-best
//! list's diversity, and only works with exactly one language model.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, debug_span};

use crate::features::FeatureVec;
use crate::forest::{HyperGraph, NodeId};
use crate::lm::{BoundaryState, LmData};

use super::{
    close_root, factor_count, make_item, topo_order, ComposeError, Composer, Hyp, SearchLimits,
};

pub struct IncrementalComposer {
    lm: Arc<LmData>,
    weights: FeatureVec,
    limits: SearchLimits,
}

impl IncrementalComposer {
    /// Fails fast unless exactly one model is configured.
    pub fn new(
        lms: Vec<Arc<LmData>>,
        weights: FeatureVec,
        limits: SearchLimits,
    ) -> Result<Self, ComposeError> {
        if lms.len() != 1 {
            return Err(ComposeError::SingleLmRequired(lms.len()));
        }
        let lm = lms.into_iter().next().unwrap();
        Ok(Self {
            lm,
            weights,
            limits,
        })
    }

    fn compose_node(
        &self,
        graph: &HyperGraph,
        v: NodeId,
        chart: &mut Vec<Vec<Hyp>>,
        out: &mut HyperGraph,
    ) -> Result<(), ComposeError> {
        let lms = std::slice::from_ref(&self.lm);
        let node = graph.node(v);
        let mut heap = BinaryHeap::new();
        let mut visited: HashSet<(usize, Vec<usize>)> = HashSet::new();
        for &eid in &node.edges {
            let axis = vec![0; graph.edge(eid).tails.len()];
            if visited.insert((eid, axis.clone())) {
                if let Some(item) = make_item(graph, lms, &self.weights, eid, axis, chart)? {
                    heap.push(item);
                }
            }
        }

        let mut seen_states: HashSet<Vec<BoundaryState>> = HashSet::new();
        let mut per_edge: HashMap<usize, usize> = HashMap::new();
        let mut pops = 0usize;
        while let Some(item) = heap.pop() {
            if self.limits.stack_pop_limit != 0 && pops >= self.limits.stack_pop_limit {
                break;
            }
            pops += 1;

            let spent = per_edge.entry(item.edge).or_insert(0);
            if self.limits.edge_limit != 0 && *spent >= self.limits.edge_limit {
                // This edge used up its budget; drop the item and do not
                // expand its frontier further.
                continue;
            }
            *spent += 1;

            for t in 0..item.axis.len() {
                let mut axis = item.axis.clone();
                axis[t] += 1;
                if visited.insert((item.edge, axis.clone())) {
                    if let Some(next) =
                        make_item(graph, lms, &self.weights, item.edge, axis, chart)?
                    {
                        heap.push(next);
                    }
                }
            }

            // Group by state: later (worse) hypotheses with a known state
            // are subsumed by their representative.
            if !seen_states.insert(item.states.clone()) {
                continue;
            }
            let edge = graph.edge(item.edge);
            let out_node = out.add_node(node.label, node.span, node.terminal);
            let tails: Vec<NodeId> = edge
                .tails
                .iter()
                .enumerate()
                .map(|(t, &tail)| chart[tail][item.axis[t]].out_node)
                .collect();
            let mut features = edge.features.clone();
            features.add_all(&item.features);
            out.add_edge(out_node, tails, edge.trg.clone(), features, item.local)?;
            chart[v].push(Hyp {
                states: item.states.clone(),
                score: item.score,
                out_node,
            });
        }
        Ok(())
    }
}

impl Composer for IncrementalComposer {
    fn compose(&self, graph: &HyperGraph) -> Result<HyperGraph, ComposeError> {
        if graph.is_empty() {
            return Ok(HyperGraph::new(graph.words().clone()));
        }
        let _span = debug_span!("incremental_compose", nodes = graph.num_nodes()).entered();
        let mut out = HyperGraph::new(graph.words().clone());
        let root = graph.node(0);
        out.add_node(root.label, root.span, false);
        let mut chart: Vec<Vec<Hyp>> = (0..graph.num_nodes()).map(|_| Vec::new()).collect();
        for &v in &topo_order(graph) {
            self.compose_node(graph, v, &mut chart, &mut out)?;
        }
        close_root(
            &mut out,
            std::slice::from_ref(&self.lm),
            &self.weights,
            root.label,
            factor_count(graph),
            &chart[0],
        )?;
        debug!(out_nodes = out.num_nodes(), out_edges = out.num_edges());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::testutil::{test_lm, unit_weights};
    use crate::compose::{CubePruningComposer, LmCombination};
    use crate::matcher::{Matcher, RuleTrie};
    use crate::symbol::SymbolTable;
    use std::io::Cursor;

    fn forest(syms: &SymbolTable, rules: &str, input: &str, weights: &FeatureVec) -> HyperGraph {
        let trie = RuleTrie::read_rule_table(syms, Cursor::new(rules)).unwrap();
        let mut m = Matcher::new(syms, "X", Some("X"), false, 1).unwrap();
        m.add_trie(trie);
        let words = syms.parse_words(input).unwrap();
        let mut hg = m.build_forest(&words).unwrap();
        hg.score_edges(weights);
        hg
    }

    #[test]
    fn rejects_zero_or_many_lms() {
        let syms = SymbolTable::new();
        assert!(matches!(
            IncrementalComposer::new(vec![], FeatureVec::new(), SearchLimits::default()),
            Err(ComposeError::SingleLmRequired(0))
        ));
        let lms = vec![test_lm(&syms), test_lm(&syms)];
        assert!(matches!(
            IncrementalComposer::new(lms, FeatureVec::new(), SearchLimits::default()),
            Err(ComposeError::SingleLmRequired(2))
        ));
    }

    #[test]
    fn empty_graph_composes_to_empty() {
        let syms = SymbolTable::new();
        let composer = IncrementalComposer::new(
            vec![test_lm(&syms)],
            FeatureVec::new(),
            SearchLimits::default(),
        )
        .unwrap();
        let out = composer.compose(&HyperGraph::new(Vec::new())).unwrap();
        assert!(out.is_empty());
        assert_eq!(out.nbest(0, 5).len(), 0);
    }

    #[test]
    fn agrees_with_cube_pruning_on_the_best_derivation() {
        let syms = SymbolTable::new();
        let lm = test_lm(&syms);
        let weights = unit_weights(&syms, &["r"]);
        let hg = forest(
            &syms,
            "\"x\" @ X ||| \"a\" \"b\" @ X ||| r=1\n\
             \"x\" @ X ||| \"b\" \"a\" @ X ||| r=1.2\n",
            "x",
            &weights,
        );
        let inc = IncrementalComposer::new(vec![lm.clone()], weights.clone(), SearchLimits::default())
            .unwrap()
            .compose(&hg)
            .unwrap();
        let cube = CubePruningComposer::new(
            vec![lm],
            weights,
            SearchLimits::default(),
            LmCombination::Joint,
        )
        .compose(&hg)
        .unwrap();
        let bi = &inc.nbest(0, 1)[0];
        let bc = &cube.nbest(0, 1)[0];
        assert!((bi.score - bc.score).abs() < 1e-6);
        assert_eq!(
            inc.path_translation(bi, 0, None).unwrap(),
            cube.path_translation(bc, 0, None).unwrap()
        );
    }

    #[test]
    fn equal_states_keep_only_the_best_representative() {
        let syms = SymbolTable::new();
        let lm = test_lm(&syms);
        let weights = unit_weights(&syms, &["r"]);
        let hg = forest(
            &syms,
            "\"x\" @ X ||| \"a\" @ X ||| r=1\n\
             \"x\" @ X ||| \"a\" @ X ||| r=0.5 q=1\n",
            "x",
            &weights,
        );
        let composer = IncrementalComposer::new(vec![lm], weights, SearchLimits::default()).unwrap();
        let out = composer.compose(&hg).unwrap();
        // Unlike cube pruning, the weaker duplicate is dropped entirely.
        assert!(out.nodes().iter().all(|n| n.edges.len() <= 1));
        let paths = out.nbest(0, 10);
        assert_eq!(paths.len(), 1);
        let q = syms.get("q").unwrap();
        assert_eq!(out.path_features(&paths[0]).get(q), 0.0);
    }

    #[test]
    fn stack_pop_limit_bounds_survivors() {
        let syms = SymbolTable::new();
        let lm = test_lm(&syms);
        let weights = unit_weights(&syms, &["r"]);
        let hg = forest(
            &syms,
            "\"x\" @ X ||| \"a\" @ X ||| r=1\n\
             \"x\" @ X ||| \"b\" @ X ||| r=0.9\n\
             \"x\" @ X ||| \"a\" \"a\" @ X ||| r=0.8\n",
            "x",
            &weights,
        );
        let limits = SearchLimits {
            stack_pop_limit: 1,
            ..SearchLimits::default()
        };
        let composer = IncrementalComposer::new(vec![lm], weights, limits).unwrap();
        let out = composer.compose(&hg).unwrap();
        // One pop per node: a single hypothesis survives anywhere.
        assert_eq!(out.nbest(0, 10).len(), 1);
    }
}
