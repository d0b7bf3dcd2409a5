//! Language-model loading and the bridge between decoder symbols and model
//! vocabulary.
//!
//! Models are configured by spec strings of the form
//!
//! ```text
//! path/to/model.arpa|factor=1,lm_feat=lm1,lm_unk_feat=lmunk1,backend=sorted
//! ```
//!
//! Everything after `|` is optional. `factor` selects which output factor
//! the model reads, `lm_feat` and `lm_unk_feat` name the score and
//! out-of-vocabulary count features, and `backend` picks the table layout
//! (`probing`, the default, or `sorted`). The file may be text ARPA or a
//! compiled binary image; the format is sniffed from the header.

pub mod model;
pub mod state;

pub use model::{
    compile_arpa, is_binary_model, LmError, NgramModel, ProbingModel, SortedModel, UNK_ID,
};
pub use state::{BoundaryState, RuleScorer};

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::symbol::{tail_index, SymbolTable, WordId};

use model::{BOS_WORD, EOS_WORD};

/// One loaded model plus its decoder-side bindings.
pub struct LmData {
    model: Box<dyn NgramModel>,
    /// Decoder symbol id to model vocabulary id, for every model word.
    vocab_map: HashMap<WordId, u32>,
    factor: usize,
    lm_feat: WordId,
    lm_unk_feat: WordId,
    bos: u32,
    eos: u32,
}

impl LmData {
    /// Wrap a loaded model with default bindings (`factor=0`, features
    /// `lm` and `lmunk`).
    pub fn new(syms: &SymbolTable, model: Box<dyn NgramModel>) -> Result<Self, LmError> {
        Self::with_bindings(syms, model, 0, "lm", "lmunk")
    }

    pub fn with_bindings(
        syms: &SymbolTable,
        model: Box<dyn NgramModel>,
        factor: usize,
        lm_feat: &str,
        lm_unk_feat: &str,
    ) -> Result<Self, LmError> {
        let mut vocab_map = HashMap::new();
        for (id, word) in model.vocab().iter().enumerate() {
            vocab_map.insert(syms.intern(word)?, id as u32);
        }
        let bos = model.word_id(BOS_WORD).unwrap_or(UNK_ID);
        let eos = model.word_id(EOS_WORD).unwrap_or(UNK_ID);
        debug!(
            order = model.order(),
            vocab = model.vocab().len(),
            factor,
            "language model ready"
        );
        Ok(Self {
            model,
            vocab_map,
            factor,
            lm_feat: syms.intern(lm_feat)?,
            lm_unk_feat: syms.intern(lm_unk_feat)?,
            bos,
            eos,
        })
    }

    /// Load a model from a spec string.
    pub fn from_spec(syms: &SymbolTable, spec: &str) -> Result<Self, LmError> {
        let (path, params) = match spec.split_once('|') {
            Some((p, rest)) => (p, rest),
            None => (spec, ""),
        };
        let mut factor = 0usize;
        let mut lm_feat = "lm".to_string();
        let mut lm_unk_feat = "lmunk".to_string();
        let mut backend = "probing".to_string();
        for param in params.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| LmError::BadSpec(spec.to_string()))?;
            match key {
                "factor" => {
                    factor = value
                        .parse()
                        .map_err(|_| LmError::BadSpec(spec.to_string()))?
                }
                "lm_feat" => lm_feat = value.to_string(),
                "lm_unk_feat" => lm_unk_feat = value.to_string(),
                "backend" => backend = value.to_string(),
                _ => return Err(LmError::BadSpec(spec.to_string())),
            }
        }
        let path = Path::new(path);
        let model: Box<dyn NgramModel> = match backend.as_str() {
            "probing" => Box::new(ProbingModel::load(path)?),
            "sorted" => Box::new(SortedModel::load(path)?),
            _ => return Err(LmError::BadSpec(spec.to_string())),
        };
        Self::with_bindings(syms, model, factor, &lm_feat, &lm_unk_feat)
    }

    pub fn model(&self) -> &dyn NgramModel {
        self.model.as_ref()
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn lm_feat(&self) -> WordId {
        self.lm_feat
    }

    pub fn lm_unk_feat(&self) -> WordId {
        self.lm_unk_feat
    }

    /// Model id for a decoder symbol, plus whether it was out of vocabulary.
    pub fn map_word(&self, word: WordId) -> (u32, bool) {
        match self.vocab_map.get(&word) {
            Some(&id) => (id, false),
            None => (UNK_ID, true),
        }
    }

    /// Score one target template against child boundary states.
    ///
    /// Returns the log10 score delta, the out-of-vocabulary count, and the
    /// boundary state of the combined sequence.
    pub fn score_template(
        &self,
        words: &[WordId],
        children: &[&BoundaryState],
    ) -> (f64, usize, BoundaryState) {
        let mut scorer = RuleScorer::new(self.model.as_ref());
        for &w in words {
            if w < 0 {
                scorer.nonterminal(children[tail_index(w)]);
            } else {
                let (id, oov) = self.map_word(w);
                scorer.terminal(id, oov);
            }
        }
        scorer.finish()
    }

    /// Close a full-sentence state against `<s>` and `</s>`.
    pub fn score_root(&self, state: &BoundaryState) -> f64 {
        let mut scorer = RuleScorer::sentence(self.model.as_ref(), self.bos);
        scorer.nonterminal(state);
        scorer.terminal(self.eos, false);
        let (score, _, _) = scorer.finish();
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::TEST_ARPA;
    use std::io::Cursor;

    fn lm(syms: &SymbolTable) -> LmData {
        let model = ProbingModel::from_arpa(Cursor::new(TEST_ARPA)).unwrap();
        LmData::new(syms, Box::new(model)).unwrap()
    }

    #[test]
    fn vocab_map_covers_model_words() {
        let syms = SymbolTable::new();
        let lm = lm(&syms);
        let a = syms.get("a").unwrap();
        let (id, oov) = lm.map_word(a);
        assert!(!oov);
        assert_eq!(lm.model().vocab()[id as usize], "a");
        let zebra = syms.intern("zebra").unwrap();
        assert_eq!(lm.map_word(zebra), (UNK_ID, true));
    }

    #[test]
    fn template_scoring_matches_sentence_probability() {
        let syms = SymbolTable::new();
        let lm = lm(&syms);
        let a = syms.get("a").unwrap();
        let b = syms.get("b").unwrap();
        let (delta, oovs, state) = lm.score_template(&[a, b], &[]);
        assert_eq!(oovs, 0);
        let total = delta + lm.score_root(&state);
        // p(a|<s>) + p(b|a) + p(</s>|b).
        assert!((total - (-0.9)).abs() < 1e-6);
    }

    #[test]
    fn spec_string_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.arpa");
        std::fs::write(&path, TEST_ARPA).unwrap();
        let syms = SymbolTable::new();
        let spec = format!(
            "{}|factor=1,lm_feat=lm1,lm_unk_feat=lmunk1,backend=sorted",
            path.display()
        );
        let lm = LmData::from_spec(&syms, &spec).unwrap();
        assert_eq!(lm.factor(), 1);
        assert_eq!(lm.lm_feat(), syms.get("lm1").unwrap());
        assert_eq!(lm.lm_unk_feat(), syms.get("lmunk1").unwrap());
    }

    #[test]
    fn bad_spec_is_rejected() {
        let syms = SymbolTable::new();
        assert!(matches!(
            LmData::from_spec(&syms, "m.arpa|bogus"),
            Err(LmError::BadSpec(_))
        ));
        assert!(matches!(
            LmData::from_spec(&syms, "m.arpa|backend=quantum"),
            Err(LmError::BadSpec(_))
        ));
    }
}
