//! Forest construction: enumerate every `(span, rule)` match and assemble
//! the results into a shared hypergraph.
//!
//! Nodes are reused for identical `(span, head-labels)` pairs, which bounds
//! the forest to roughly O(n² · labels). Coverage is guaranteed: every
//! single-token span gets an unknown-word node, and a left-branching glue
//! chain over the root label always yields a full-span derivation.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, debug_span};

use crate::features::FeatureVec;
use crate::forest::{ForestError, HyperGraph};
use crate::rule::{CfgData, HeadLabels, TranslationRule};
use crate::symbol::{tail_index, tail_symbol, Sentence, SymbolError, SymbolTable, WordId};

use super::RuleTrie;

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error(transparent)]
    Forest(#[from] ForestError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),
}

/// Scratch node index during matching, before final graph ids are assigned.
type Scratch = usize;

type SpanMap = BTreeMap<(usize, usize), BTreeMap<HeadLabels, Scratch>>;

struct ScratchEdge {
    head: Scratch,
    tails: Vec<Scratch>,
    trg: Vec<CfgData>,
    features: FeatureVec,
}

struct ScratchNode {
    span: (usize, usize),
    labels: HeadLabels,
}

/// The matcher: one or more rule tries plus the reserved symbols used for
/// glue and unknown-word fallback.
pub struct Matcher {
    tries: Vec<RuleTrie>,
    root_labels: HeadLabels,
    /// `None` means unknown rules attach to every single-token label.
    unk_labels: Option<HeadLabels>,
    delete_unknown: bool,
    factors: usize,
    unk_feat: WordId,
    glue_feat: WordId,
}

impl Matcher {
    /// `factors` is the number of output factors; the root and unknown
    /// labels are replicated across the source and every factor.
    pub fn new(
        syms: &SymbolTable,
        root_symbol: &str,
        unk_symbol: Option<&str>,
        delete_unknown: bool,
        factors: usize,
    ) -> Result<Self, SymbolError> {
        let root = syms.intern(root_symbol)?;
        let unk_labels = match unk_symbol {
            Some(s) => Some(vec![syms.intern(s)?; factors + 1]),
            None => None,
        };
        Ok(Self {
            tries: Vec::new(),
            root_labels: vec![root; factors + 1],
            unk_labels,
            delete_unknown,
            factors,
            unk_feat: syms.intern("unk")?,
            glue_feat: syms.intern("glue")?,
        })
    }

    pub fn add_trie(&mut self, trie: RuleTrie) {
        self.tries.push(trie);
    }

    pub fn root_labels(&self) -> &HeadLabels {
        &self.root_labels
    }

    /// Match every rule against `words` and build the derivation forest.
    ///
    /// The returned graph's node 0 is the full-span root. An empty input
    /// yields an empty graph.
    pub fn build_forest(&self, words: &Sentence) -> Result<HyperGraph, MatchError> {
        let n = words.len();
        let _span = debug_span!("build_forest", len = n).entered();
        if n == 0 {
            return Ok(HyperGraph::new(Vec::new()));
        }

        let mut ctx = BuildContext {
            nodes: Vec::new(),
            edges: Vec::new(),
            span_map: SpanMap::new(),
        };

        for start in (0..n).rev() {
            // Every position gets a fallback node so coverage never breaks.
            let fallback = self.unk_labels.as_ref().unwrap_or(&self.root_labels);
            ctx.find_node((start, start + 1), fallback);
            for trie in &self.tries {
                self.walk(trie, &mut ctx, words, 0, start, start, &Vec::new());
            }
        }

        self.add_unknown_rules(&mut ctx, words);
        self.add_glue_chain(&mut ctx, n);

        let root = ctx.find_node((0, n), &self.root_labels);
        let graph = ctx.into_graph(words.clone(), root)?;
        debug!(nodes = graph.num_nodes(), edges = graph.num_edges());
        Ok(graph)
    }

    /// Advance one match path: try a terminal step at `position`, then a
    /// nonterminal step over every known node starting at `position`. The
    /// whole match may not span more than `span_limit` tokens from
    /// `rule_start`.
    fn walk(
        &self,
        trie: &RuleTrie,
        ctx: &mut BuildContext,
        words: &Sentence,
        state: usize,
        rule_start: usize,
        position: usize,
        spans: &Vec<(usize, usize)>,
    ) {
        let horizon = words.len().min(rule_start + trie.span_limit());
        if position >= horizon {
            return;
        }

        if let Some(next) = trie.find_term(state, words[position]) {
            let mut next_spans = spans.clone();
            next_spans.push((position, position + 1));
            for &rid in trie.rules_at(next) {
                ctx.add_rule_edge(trie.rule(rid), &next_spans);
            }
            self.walk(trie, ctx, words, next, rule_start, position + 1, &next_spans);
        }

        for next_pos in position + 1..=horizon {
            let span = (position, next_pos);
            // From the root state, expand unary productions over this span
            // so chains of unary rules can seed nonterminal steps.
            if spans.is_empty() {
                self.expand_unaries(trie, ctx, span);
            }
            let labeled: Vec<HeadLabels> = match ctx.span_map.get(&span) {
                Some(heads) => heads.keys().cloned().collect(),
                None => continue,
            };
            for labels in labeled {
                if let Some(next) = trie.find_nonterm(state, &labels) {
                    let mut next_spans = spans.clone();
                    next_spans.push(span);
                    for &rid in trie.rules_at(next) {
                        ctx.add_rule_edge(trie.rule(rid), &next_spans);
                    }
                    self.walk(trie, ctx, words, next, rule_start, next_pos, &next_spans);
                }
            }
        }
    }

    fn expand_unaries(&self, trie: &RuleTrie, ctx: &mut BuildContext, span: (usize, usize)) {
        loop {
            let mut fresh: Vec<HeadLabels> = Vec::new();
            if let Some(heads) = ctx.span_map.get(&span) {
                for (child, parents) in trie.unaries() {
                    if heads.contains_key(child) {
                        for parent in parents {
                            if !heads.contains_key(parent) {
                                fresh.push(parent.clone());
                            }
                        }
                    }
                }
            }
            if fresh.is_empty() {
                break;
            }
            for labels in fresh {
                ctx.find_node(span, &labels);
            }
        }
    }

    /// Synthesize pass-through rules for single-token nodes left underived.
    fn add_unknown_rules(&self, ctx: &mut BuildContext, words: &Sentence) {
        let mut derived: HashSet<Scratch> = HashSet::new();
        for edge in &ctx.edges {
            derived.insert(edge.head);
        }
        let spans: Vec<((usize, usize), Vec<(HeadLabels, Scratch)>)> = ctx
            .span_map
            .iter()
            .filter(|((s, e), _)| e - s == 1)
            .map(|(span, heads)| {
                (
                    *span,
                    heads.iter().map(|(l, &i)| (l.clone(), i)).collect(),
                )
            })
            .collect();
        for ((start, _end), heads) in spans {
            for (labels, node) in heads {
                let matches_unk = match &self.unk_labels {
                    Some(unk) => *unk == labels,
                    None => true,
                };
                if !matches_unk || derived.contains(&node) {
                    continue;
                }
                let word = words[start];
                let trg_words: Sentence = if self.delete_unknown {
                    Vec::new()
                } else {
                    vec![word]
                };
                let trg: Vec<CfgData> = labels[1..]
                    .iter()
                    .map(|&l| CfgData::new(trg_words.clone(), l, Vec::new()))
                    .collect();
                let features: FeatureVec = [(self.unk_feat, 1.0)].into_iter().collect();
                ctx.edges.push(ScratchEdge {
                    head: node,
                    tails: Vec::new(),
                    trg,
                    features,
                });
            }
        }
    }

    /// Left-branching glue over the root label: `G(0,e)` derives directly
    /// from any non-root node covering `(0,e)`, or by concatenating
    /// `G(0,m)` with any node covering `(m,e)`. Every position holds a
    /// fallback node, so a full-span derivation always exists.
    fn add_glue_chain(&self, ctx: &mut BuildContext, n: usize) {
        let glue_features: FeatureVec = [(self.glue_feat, 1.0)].into_iter().collect();
        for end in 1..=n {
            let head = ctx.find_node((0, end), &self.root_labels);
            let singles: Vec<Scratch> = ctx
                .span_map
                .get(&(0, end))
                .map(|heads| {
                    heads
                        .iter()
                        .filter(|(labels, _)| **labels != self.root_labels)
                        .map(|(_, &i)| i)
                        .collect()
                })
                .unwrap_or_default();
            for tail in singles {
                let trg = self.glue_template(1, &ctx.nodes[tail].labels.clone(), None);
                ctx.edges.push(ScratchEdge {
                    head,
                    tails: vec![tail],
                    trg,
                    features: glue_features.clone(),
                });
            }
            for mid in 1..end {
                let left = ctx.find_node((0, mid), &self.root_labels);
                let rights: Vec<Scratch> = ctx
                    .span_map
                    .get(&(mid, end))
                    .map(|heads| heads.values().copied().collect())
                    .unwrap_or_default();
                for right in rights {
                    let trg = self.glue_template(
                        2,
                        &self.root_labels.clone(),
                        Some(&ctx.nodes[right].labels.clone()),
                    );
                    ctx.edges.push(ScratchEdge {
                        head,
                        tails: vec![left, right],
                        trg,
                        features: glue_features.clone(),
                    });
                }
            }
        }
    }

    fn glue_template(
        &self,
        arity: usize,
        first: &HeadLabels,
        second: Option<&HeadLabels>,
    ) -> Vec<CfgData> {
        (0..self.factors)
            .map(|f| {
                let words: Sentence = (0..arity).map(tail_symbol).collect();
                let mut syms = vec![first[f + 1]];
                if let Some(second) = second {
                    syms.push(second[f + 1]);
                }
                syms.truncate(arity);
                CfgData::new(words, self.root_labels[f + 1], syms)
            })
            .collect()
    }
}

struct BuildContext {
    nodes: Vec<ScratchNode>,
    edges: Vec<ScratchEdge>,
    span_map: SpanMap,
}

impl BuildContext {
    /// Node for `(span, labels)`, reusing an existing one if present.
    fn find_node(&mut self, span: (usize, usize), labels: &HeadLabels) -> Scratch {
        if let Some(&id) = self.span_map.get(&span).and_then(|h| h.get(labels)) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(ScratchNode {
            span,
            labels: labels.clone(),
        });
        self.span_map
            .entry(span)
            .or_default()
            .insert(labels.clone(), id);
        id
    }

    /// Turn a matched rule plus its per-token spans into a scratch edge.
    fn add_rule_edge(&mut self, rule: &TranslationRule, rule_spans: &[(usize, usize)]) {
        debug_assert_eq!(rule.src.words.len(), rule_spans.len());
        let head_span = (rule_spans[0].0, rule_spans[rule_spans.len() - 1].1);
        let head = self.find_node(head_span, &rule.head_labels());
        let mut tails = Vec::with_capacity(rule.num_tails());
        for (pos, &w) in rule.src.words.iter().enumerate() {
            if w < 0 {
                let i = tail_index(w);
                tails.push(self.find_node(rule_spans[pos], &rule.child_head_labels(i)));
            }
        }
        self.edges.push(ScratchEdge {
            head,
            tails,
            trg: rule.trg.clone(),
            features: rule.features.clone(),
        });
    }

    /// Keep only what is reachable from the root and emit the final graph,
    /// with the root as node 0.
    fn into_graph(self, words: Sentence, root: Scratch) -> Result<HyperGraph, ForestError> {
        let mut node_edges: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, edge) in self.edges.iter().enumerate() {
            node_edges[edge.head].push(i);
        }

        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if reachable[id] {
                continue;
            }
            reachable[id] = true;
            for &eid in &node_edges[id] {
                for &tail in &self.edges[eid].tails {
                    stack.push(tail);
                }
            }
        }

        let mut graph = HyperGraph::new(words);
        let mut final_id = vec![usize::MAX; self.nodes.len()];
        // Root first so callers can rely on node 0.
        let order = std::iter::once(root)
            .chain((0..self.nodes.len()).filter(|&i| i != root && reachable[i]));
        for scratch in order {
            let node = &self.nodes[scratch];
            final_id[scratch] = graph.add_node(node.labels[0], node.span, false);
        }
        for edge in &self.edges {
            if !reachable[edge.head] {
                continue;
            }
            let tails: Vec<usize> = edge.tails.iter().map(|&t| final_id[t]).collect();
            graph.add_edge(
                final_id[edge.head],
                tails,
                edge.trg.clone(),
                edge.features.clone(),
                0.0,
            )?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::RuleTrie;
    use std::io::Cursor;

    fn matcher_with(syms: &SymbolTable, rules: &str) -> Matcher {
        let trie = RuleTrie::read_rule_table(syms, Cursor::new(rules)).unwrap();
        let mut m = Matcher::new(syms, "X", Some("X"), false, 1).unwrap();
        m.add_trie(trie);
        m
    }

    #[test]
    fn matches_simple_rule() {
        let syms = SymbolTable::new();
        let m = matcher_with(
            &syms,
            "\"the\" \"cat\" @ X ||| \"le\" \"chat\" @ X ||| w=1\n",
        );
        let words = syms.parse_words("the cat").unwrap();
        let hg = m.build_forest(&words).unwrap();
        // Root spans the whole input and has at least the rule edge.
        assert_eq!(hg.node(0).span, (0, 2));
        assert!(!hg.node(0).edges.is_empty());
        let le = syms.get("le").unwrap();
        let has_rule = hg
            .edges()
            .iter()
            .any(|e| e.trg[0].words.first() == Some(&le));
        assert!(has_rule);
    }

    #[test]
    fn nonterminal_gap_rule_matches() {
        let syms = SymbolTable::new();
        let m = matcher_with(
            &syms,
            "\"a\" @ X ||| \"A\" @ X ||| w=1\n\
             \"b\" @ X ||| \"B\" @ X ||| w=1\n\
             \"a\" x0:X \"c\" @ X ||| \"A\" x0:X \"C\" @ X ||| w=1\n\
             \"c\" @ X ||| \"C\" @ X ||| w=1\n",
        );
        let words = syms.parse_words("a b c").unwrap();
        let hg = m.build_forest(&words).unwrap();
        // The gap rule produces an edge with one tail spanning (1,2).
        let gap_edges: Vec<_> = hg
            .edges()
            .iter()
            .filter(|e| e.tails.len() == 1 && hg.node(e.head).span == (0, 3))
            .collect();
        assert!(!gap_edges.is_empty());
        assert_eq!(hg.node(gap_edges[0].tails[0]).span, (1, 2));
    }

    #[test]
    fn coverage_without_any_matching_rule() {
        let syms = SymbolTable::new();
        let m = matcher_with(&syms, "\"x\" @ X ||| \"y\" @ X ||| w=1\n");
        let words = syms.parse_words("p q r").unwrap();
        let hg = m.build_forest(&words).unwrap();
        assert!(hg.viterbi_score(0).is_ok(), "glue must bridge the input");
        let paths = hg.nbest(0, 1);
        assert_eq!(paths.len(), 1);
        // Unknown rules pass the source words through.
        let out = hg.path_translation(&paths[0], 0, None).unwrap();
        assert_eq!(out, words);
    }

    #[test]
    fn empty_input_yields_empty_graph() {
        let syms = SymbolTable::new();
        let m = matcher_with(&syms, "\"x\" @ X ||| \"y\" @ X ||| w=1\n");
        let hg = m.build_forest(&Vec::new()).unwrap();
        assert!(hg.is_empty());
    }

    #[test]
    fn ambiguous_rules_share_one_node() {
        let syms = SymbolTable::new();
        let m = matcher_with(
            &syms,
            "\"bank\" @ X ||| \"banque\" @ X ||| w=1\n\
             \"bank\" @ X ||| \"rive\" @ X ||| w=0.5\n",
        );
        let words = syms.parse_words("bank").unwrap();
        let hg = m.build_forest(&words).unwrap();
        // Both rules are alternative edges into the same (span, label) node.
        let x = syms.get("X").unwrap();
        let node = hg
            .nodes()
            .iter()
            .find(|n| n.span == (0, 1) && n.label == x && n.edges.len() >= 2);
        assert!(node.is_some());
    }

    #[test]
    fn unary_rule_connects_labels() {
        let syms = SymbolTable::new();
        let m = matcher_with(
            &syms,
            "\"cat\" @ N ||| \"chat\" @ N ||| w=1\n\
             x0:N @ X ||| x0:N @ X ||| w=0.1\n",
        );
        let words = syms.parse_words("cat").unwrap();
        let hg = m.build_forest(&words).unwrap();
        let n_label = syms.get("N").unwrap();
        // The root X(0,1) must be derivable through the unary from N(0,1).
        let unary_edge = hg.edges().iter().any(|e| {
            e.tails.len() == 1 && hg.node(e.tails[0]).label == n_label && e.head == 0
        });
        assert!(unary_edge);
    }

    #[test]
    fn span_limit_bounds_rule_matches() {
        let syms = SymbolTable::new();
        let mut trie = RuleTrie::read_rule_table(
            &syms,
            Cursor::new(
                "\"a\" @ X ||| \"A\" @ X ||| w=1\n\
                 \"b\" @ X ||| \"B\" @ X ||| w=1\n\
                 x0:X x1:X @ X ||| x0:X x1:X @ X ||| w=1\n",
            ),
        )
        .unwrap();
        trie.set_span_limit(1);
        let mut m = Matcher::new(&syms, "X", Some("X"), false, 1).unwrap();
        m.add_trie(trie);
        let words = syms.parse_words("a b").unwrap();
        let hg = m.build_forest(&words).unwrap();
        // The binary rule would span two tokens, which the span limit
        // forbids; only glue derives the root.
        let glue = syms.get("glue").unwrap();
        for &eid in &hg.node(0).edges {
            assert!(hg.edge(eid).features.get(glue) > 0.0);
        }
    }
}
