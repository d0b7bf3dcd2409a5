//! Boundary states and incremental rule scoring.
//!
//! A hypothesis exposes only its boundary to the outside: the first few
//! words, whose probabilities are not yet final because their left context
//! is unknown, and the last few words, which are the context for whatever
//! follows. Two hypotheses with equal boundary states score identically in
//! every future combination, so composers recombine on the state alone.
//!
//! Left-boundary words are charged an estimate with whatever context was
//! visible when they were scored. Each enclosing scope re-derives that
//! estimate from the state itself and replaces it with a better one, so the
//! charges telescope and the final sentence score is exact once the root is
//! closed against `<s>` and `</s>`.

use super::model::NgramModel;

/// Left and right n-gram boundary of a partial translation.
///
/// `left` holds the words still awaiting full context, oldest first, at most
/// `order - 1` of them. `right` holds the trailing context words. A state
/// covering fewer than `order - 1` words has `left == right`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoundaryState {
    pub left: Vec<u32>,
    pub right: Vec<u32>,
}

impl BoundaryState {
    /// True when the state covers enough words to fix the context for
    /// everything that follows it.
    pub fn full(&self, order: usize) -> bool {
        self.right.len() == order.saturating_sub(1)
    }
}

/// Scores one target-side sequence of terminals and child states.
///
/// Feed items left to right, then call [`finish`](Self::finish) for the
/// score delta (log10), the out-of-vocabulary count, and the resulting
/// boundary state. The delta covers only this sequence's own words and the
/// corrections to the children's left boundaries; the children's internal
/// scores are carried by their hypotheses, not here.
pub struct RuleScorer<'a> {
    model: &'a dyn NgramModel,
    left: Vec<u32>,
    context: Vec<u32>,
    /// Set for root closing: the context is anchored at `<s>`, so nothing
    /// is deferred and every charge is final.
    anchored: bool,
    score: f64,
    oovs: usize,
}

impl<'a> RuleScorer<'a> {
    pub fn new(model: &'a dyn NgramModel) -> Self {
        Self {
            model,
            left: Vec::new(),
            context: Vec::new(),
            anchored: false,
            score: 0.0,
            oovs: 0,
        }
    }

    /// Scorer for the root-closing pass, with `<s>` as initial context.
    pub fn sentence(model: &'a dyn NgramModel, bos: u32) -> Self {
        Self {
            model,
            left: Vec::new(),
            context: vec![bos],
            anchored: true,
            score: 0.0,
            oovs: 0,
        }
    }

    fn push_context(&mut self, word: u32) {
        let n1 = self.model.order().saturating_sub(1);
        self.context.push(word);
        if self.context.len() > n1 {
            self.context.remove(0);
        }
    }

    /// Score one target terminal, already mapped to the model vocabulary.
    pub fn terminal(&mut self, word: u32, oov: bool) {
        if oov {
            self.oovs += 1;
        }
        let n1 = self.model.order().saturating_sub(1);
        self.score += self.model.score(&self.context, word);
        if !self.anchored && self.context.len() < n1 {
            // Estimate only; the enclosing scope will re-derive and replace
            // it from our left state.
            self.left.push(word);
        }
        self.push_context(word);
    }

    /// Substitute a child hypothesis through its boundary state.
    pub fn nonterminal(&mut self, child: &BoundaryState) {
        let n1 = self.model.order().saturating_sub(1);
        for (i, &w) in child.left.iter().enumerate() {
            let charged = self.model.score(&child.left[..i], w);
            let better = self.model.score(&self.context, w);
            self.score += better - charged;
            if !self.anchored && self.context.len() < n1 {
                self.left.push(w);
            }
            self.push_context(w);
        }
        if child.full(self.model.order()) {
            self.context = child.right.clone();
        }
    }

    pub fn finish(self) -> (f64, usize, BoundaryState) {
        (
            self.score,
            self.oovs,
            BoundaryState {
                left: self.left,
                right: self.context,
            },
        )
    }
}
