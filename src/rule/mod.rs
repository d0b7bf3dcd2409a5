//! Translation rules: source patterns, per-factor target templates, and
//! sparse features.
//!
//! A rule's source and target sides are `CfgData` templates. Template words
//! are interned symbols, with negative ids marking nonterminal placeholders
//! (`-1-v` is the tail index). Target factors run in lock-step: every factor
//! has the same number of placeholders as the source.

mod parse;

pub use parse::{parse_annotated_words, parse_features, parse_rule_line, RuleTableError};

use crate::features::FeatureVec;
use crate::symbol::{tail_index, Sentence, WordId};

/// Composite head-label signature: the source head label followed by one
/// label per target factor. Matching and composition test compatibility on
/// the whole tuple, preserving ambiguity between factor labelings.
pub type HeadLabels = Vec<WordId>;

/// One side of a rule for one output factor: a template of terminals and
/// placeholders, a head label, and the labels of the nonterminal children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgData {
    pub words: Sentence,
    pub label: WordId,
    pub syms: Sentence,
}

impl CfgData {
    pub fn new(words: Sentence, label: WordId, syms: Sentence) -> Self {
        Self { words, label, syms }
    }

    /// Positions of nonterminal placeholders within the template.
    pub fn nonterm_positions(&self) -> Vec<usize> {
        self.words
            .iter()
            .enumerate()
            .filter(|&(_, &w)| w < 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// True when placeholders appear in ascending tail order (x0, x1, ...).
    pub fn nonterms_are_ordered(&self) -> bool {
        let mut expect = 0usize;
        for &w in &self.words {
            if w < 0 {
                if tail_index(w) != expect {
                    return false;
                }
                expect += 1;
            }
        }
        true
    }
}

/// A weighted transfer rule: one source pattern, one target template per
/// output factor, and a sparse feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationRule {
    pub src: CfgData,
    pub trg: Vec<CfgData>,
    pub features: FeatureVec,
}

impl TranslationRule {
    pub fn new(src: CfgData, trg: Vec<CfgData>, features: FeatureVec) -> Self {
        Self { src, trg, features }
    }

    /// Number of nonterminal tails this rule connects.
    pub fn num_tails(&self) -> usize {
        self.src.syms.len()
    }

    /// Head-label signature across all factors.
    pub fn head_labels(&self) -> HeadLabels {
        let mut labels = Vec::with_capacity(1 + self.trg.len());
        labels.push(self.src.label);
        labels.extend(self.trg.iter().map(|t| t.label));
        labels
    }

    /// Label signature required of tail number `i`.
    pub fn child_head_labels(&self, i: usize) -> HeadLabels {
        let mut labels = Vec::with_capacity(1 + self.trg.len());
        labels.push(self.src.syms[i]);
        labels.extend(self.trg.iter().map(|t| t.syms[i]));
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{tail_symbol, SymbolTable};

    #[test]
    fn head_label_signature() {
        let syms = SymbolTable::new();
        let x = syms.intern("X").unwrap();
        let np = syms.intern("NP").unwrap();
        let the = syms.intern("the").unwrap();
        let rule = TranslationRule::new(
            CfgData::new(vec![the, tail_symbol(0)], x, vec![np]),
            vec![CfgData::new(vec![tail_symbol(0)], x, vec![np])],
            FeatureVec::new(),
        );
        assert_eq!(rule.num_tails(), 1);
        assert_eq!(rule.head_labels(), vec![x, x]);
        assert_eq!(rule.child_head_labels(0), vec![np, np]);
    }

    #[test]
    fn nonterm_ordering() {
        let ordered = CfgData::new(vec![5, tail_symbol(0), tail_symbol(1)], 0, vec![0, 0]);
        assert!(ordered.nonterms_are_ordered());
        assert_eq!(ordered.nonterm_positions(), vec![1, 2]);
        let swapped = CfgData::new(vec![tail_symbol(1), tail_symbol(0)], 0, vec![0, 0]);
        assert!(!swapped.nonterms_are_ordered());
    }
}
