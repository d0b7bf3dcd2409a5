//! The rule-matching automaton: a trie over source-token sequences.
//!
//! Each trie node maps a single next token to a child: terminals key on the
//! word id, nonterminal-headed children key on the composite head-label
//! tuple. A node holds the rules whose source pattern ends exactly there, so
//! the path from the root to any node spells the shared source prefix of
//! every rule below it. Unary rules additionally register in a label → label
//! map that is transitively closed at load time.

mod build;

pub use build::{MatchError, Matcher};

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;

use tracing::debug;

use crate::rule::{parse_rule_line, HeadLabels, RuleTableError, TranslationRule};
use crate::symbol::{tail_index, SymbolTable, WordId};

pub const DEFAULT_SPAN_LIMIT: usize = 20;

struct TrieNode {
    term: BTreeMap<WordId, usize>,
    nonterm: BTreeMap<HeadLabels, usize>,
    /// Rule-arena indices of rules ending at this node.
    rules: Vec<usize>,
}

impl TrieNode {
    fn new() -> Self {
        Self {
            term: BTreeMap::new(),
            nonterm: BTreeMap::new(),
            rules: Vec::new(),
        }
    }
}

/// A trie-indexed rule table (one per grammar file).
pub struct RuleTrie {
    nodes: Vec<TrieNode>,
    rules: Vec<TranslationRule>,
    unaries: BTreeMap<HeadLabels, BTreeSet<HeadLabels>>,
    span_limit: usize,
}

impl Default for RuleTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTrie {
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new()],
            rules: Vec::new(),
            unaries: BTreeMap::new(),
            span_limit: DEFAULT_SPAN_LIMIT,
        }
    }

    pub fn span_limit(&self) -> usize {
        self.span_limit
    }

    pub fn set_span_limit(&mut self, limit: usize) {
        self.span_limit = limit;
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn rule(&self, id: usize) -> &TranslationRule {
        &self.rules[id]
    }

    /// Insert a rule, extending the trie path for its source token sequence.
    pub fn add_rule(&mut self, rule: TranslationRule) {
        let mut state = 0usize;
        for &w in &rule.src.words {
            state = if w >= 0 {
                self.step_term(state, w)
            } else {
                self.step_nonterm(state, rule.child_head_labels(tail_index(w)))
            };
        }
        if rule.src.words.len() == 1 && rule.num_tails() == 1 {
            self.unaries
                .entry(rule.child_head_labels(0))
                .or_default()
                .insert(rule.head_labels());
        }
        let id = self.rules.len();
        self.rules.push(rule);
        self.nodes[state].rules.push(id);
    }

    fn step_term(&mut self, state: usize, word: WordId) -> usize {
        if let Some(&next) = self.nodes[state].term.get(&word) {
            return next;
        }
        let next = self.nodes.len();
        self.nodes.push(TrieNode::new());
        self.nodes[state].term.insert(word, next);
        next
    }

    fn step_nonterm(&mut self, state: usize, labels: HeadLabels) -> usize {
        if let Some(&next) = self.nodes[state].nonterm.get(&labels) {
            return next;
        }
        let next = self.nodes.len();
        self.nodes.push(TrieNode::new());
        self.nodes[state].nonterm.insert(labels, next);
        next
    }

    fn find_term(&self, state: usize, word: WordId) -> Option<usize> {
        self.nodes[state].term.get(&word).copied()
    }

    fn find_nonterm(&self, state: usize, labels: &HeadLabels) -> Option<usize> {
        self.nodes[state].nonterm.get(labels).copied()
    }

    fn rules_at(&self, state: usize) -> &[usize] {
        &self.nodes[state].rules
    }

    pub fn unaries(&self) -> &BTreeMap<HeadLabels, BTreeSet<HeadLabels>> {
        &self.unaries
    }

    /// Close the unary map transitively. A label reaching itself is a cycle
    /// and a configuration error.
    pub fn close_unaries(&mut self, syms: &SymbolTable) -> Result<(), RuleTableError> {
        let mut added = true;
        while added {
            added = false;
            let snapshot = self.unaries.clone();
            for (child, heads) in snapshot {
                for head in &heads {
                    if *head == child {
                        let label = syms
                            .symbol(child[0])
                            .unwrap_or_else(|_| format!("{}", child[0]));
                        return Err(RuleTableError::UnaryCycle(label));
                    }
                    if let Some(next) = self.unaries.get(head).cloned() {
                        let entry = self.unaries.entry(child.clone()).or_default();
                        for h in next {
                            if entry.insert(h) {
                                added = true;
                            }
                        }
                    }
                }
            }
        }
        // A cycle may only become visible after closure.
        for (child, heads) in &self.unaries {
            if heads.contains(child) {
                let label = syms
                    .symbol(child[0])
                    .unwrap_or_else(|_| format!("{}", child[0]));
                return Err(RuleTableError::UnaryCycle(label));
            }
        }
        Ok(())
    }

    /// Parse a whole rule table from a text stream and index it.
    pub fn read_rule_table<R: BufRead>(
        syms: &SymbolTable,
        reader: R,
    ) -> Result<Self, RuleTableError> {
        let mut trie = RuleTrie::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            trie.add_rule(parse_rule_line(syms, &line)?);
        }
        trie.close_unaries(syms)?;
        debug!(rules = trie.rules.len(), trie_nodes = trie.nodes.len());
        Ok(trie)
    }
}
