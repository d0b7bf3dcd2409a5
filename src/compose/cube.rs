//! Cube-pruning composition.
//!
//! Per node, the rank-ordered hypothesis lists of an edge's tails form the
//! axes of a cube; the frontier starts at the best corner of every edge and
//! a single priority queue across all edges of the node pops candidates
//! best-first. Because item scores are computed exactly at push time, pops
//! arrive in non-increasing score order, so the first `chart_limit` distinct
//! boundary states are the true survivors under the current limits.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, debug_span};

use crate::features::FeatureVec;
use crate::forest::{HyperGraph, NodeId};
use crate::lm::{BoundaryState, LmData};

use super::{
    close_root, factor_count, make_item, topo_order, ComposeError, Composer, Hyp, LmCombination,
    SearchLimits,
};

pub struct CubePruningComposer {
    lms: Vec<Arc<LmData>>,
    weights: FeatureVec,
    limits: SearchLimits,
    combination: LmCombination,
}

impl CubePruningComposer {
    pub fn new(
        lms: Vec<Arc<LmData>>,
        weights: FeatureVec,
        limits: SearchLimits,
        combination: LmCombination,
    ) -> Self {
        Self {
            lms,
            weights,
            limits,
            combination,
        }
    }

    fn pass(&self, graph: &HyperGraph, lms: &[Arc<LmData>]) -> Result<HyperGraph, ComposeError> {
        let _span = debug_span!("cube_compose", nodes = graph.num_nodes()).entered();
        let mut out = HyperGraph::new(graph.words().clone());
        let root = graph.node(0);
        out.add_node(root.label, root.span, false);
        let mut chart: Vec<Vec<Hyp>> = (0..graph.num_nodes()).map(|_| Vec::new()).collect();
        for &v in &topo_order(graph) {
            self.compose_node(graph, lms, v, &mut chart, &mut out)?;
        }
        close_root(
            &mut out,
            lms,
            &self.weights,
            root.label,
            factor_count(graph),
            &chart[0],
        )?;
        debug!(out_nodes = out.num_nodes(), out_edges = out.num_edges());
        Ok(out)
    }

    fn compose_node(
        &self,
        graph: &HyperGraph,
        lms: &[Arc<LmData>],
        v: NodeId,
        chart: &mut Vec<Vec<Hyp>>,
        out: &mut HyperGraph,
    ) -> Result<(), ComposeError> {
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

        let mut keys: HashMap<Vec<BoundaryState>, NodeId> = HashMap::new();
        let mut pops = 0usize;
        while let Some(item) = heap.pop() {
            if self.limits.pop_limit != 0 && pops >= self.limits.pop_limit {
                break;
            }
            pops += 1;

            // Frontier neighbors: bump one axis at a time.
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

            let edge = graph.edge(item.edge);
            let out_node = match keys.get(&item.states) {
                // Same boundary state: merge as an extra incoming edge.
                Some(&existing) => existing,
                None => {
                    let id = out.add_node(node.label, node.span, node.terminal);
                    keys.insert(item.states.clone(), id);
                    chart[v].push(Hyp {
                        states: item.states.clone(),
                        score: item.score,
                        out_node: id,
                    });
                    id
                }
            };
            let tails: Vec<NodeId> = edge
                .tails
                .iter()
                .enumerate()
                .map(|(t, &tail)| chart[tail][item.axis[t]].out_node)
                .collect();
            let mut features = edge.features.clone();
            features.add_all(&item.features);
            out.add_edge(out_node, tails, edge.trg.clone(), features, item.local)?;

            if self.limits.chart_limit != 0 && keys.len() >= self.limits.chart_limit {
                break;
            }
        }
        Ok(())
    }
}

impl Composer for CubePruningComposer {
    fn compose(&self, graph: &HyperGraph) -> Result<HyperGraph, ComposeError> {
        if graph.is_empty() {
            return Ok(HyperGraph::new(graph.words().clone()));
        }
        if self.combination == LmCombination::Consec && self.lms.len() > 1 {
            let mut current = self.pass(graph, &self.lms[..1])?;
            for l in 1..self.lms.len() {
                current = self.pass(&current, &self.lms[l..=l])?;
            }
            return Ok(current);
        }
        self.pass(graph, &self.lms)
    }
}
