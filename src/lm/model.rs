//! Back-off n-gram models.
//!
//! Two interchangeable backends implement [`NgramModel`]: a hashed table for
//! speed and a sorted table for compactness. Both are built from the same
//! intermediate representation, which loads from text ARPA files or from a
//! precompiled binary image.
//!
//! Probabilities are log base 10 throughout, as in the ARPA format itself.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const UNK_WORD: &str = "<unk>";
pub const BOS_WORD: &str = "<s>";
pub const EOS_WORD: &str = "</s>";

/// Model-internal id of the unknown word.
pub const UNK_ID: u32 = 0;

/// Unigram log10 probability used when the model lacks an `<unk>` entry.
const DEFAULT_UNK_LOG10: f32 = -100.0;

const MAGIC: &[u8; 4] = b"SYLM";
const VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum LmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ARPA parse error at line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("not a compiled model file (bad magic)")]
    BadMagic,

    #[error("unsupported compiled model version {0}")]
    BadVersion(u32),

    #[error("model encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("bad model spec {0:?}")]
    BadSpec(String),

    #[error(transparent)]
    Symbol(#[from] crate::symbol::SymbolError),
}

/// Conditional probability and back-off weight of one n-gram, log10.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProbBackoff {
    pub prob: f32,
    pub backoff: f32,
}

/// A back-off n-gram model over its own integer vocabulary.
///
/// `score` resolves the longest matching n-gram ending in `word` and adds
/// the back-off weights of the context grams it had to skip. Contexts run
/// oldest first and longer-than-needed contexts are truncated.
pub trait NgramModel: Send + Sync {
    fn order(&self) -> usize;

    fn vocab(&self) -> &[String];

    fn word_id(&self, word: &str) -> Option<u32>;

    fn lookup(&self, ngram: &[u32]) -> Option<ProbBackoff>;

    fn score(&self, context: &[u32], word: u32) -> f64 {
        let n1 = self.order().saturating_sub(1);
        let context = &context[context.len().saturating_sub(n1)..];
        let mut ngram = Vec::with_capacity(context.len() + 1);
        for i in 0..=context.len() {
            ngram.clear();
            ngram.extend_from_slice(&context[i..]);
            ngram.push(word);
            if let Some(pb) = self.lookup(&ngram) {
                let mut p = f64::from(pb.prob);
                for j in 0..i {
                    if let Some(cb) = self.lookup(&context[j..]) {
                        p += f64::from(cb.backoff);
                    }
                }
                return p;
            }
        }
        // No unigram either: the word is outside the model vocabulary.
        let mut p = self
            .lookup(&[UNK_ID])
            .map(|pb| f64::from(pb.prob))
            .unwrap_or(f64::from(DEFAULT_UNK_LOG10));
        for j in 0..context.len() {
            if let Some(cb) = self.lookup(&context[j..]) {
                p += f64::from(cb.backoff);
            }
        }
        p
    }
}

/// Backend-independent model image; also the on-disk binary layout.
#[derive(Serialize, Deserialize)]
pub(crate) struct RawModel {
    order: usize,
    vocab: Vec<String>,
    ngrams: Vec<(Vec<u32>, ProbBackoff)>,
}

impl RawModel {
    pub(crate) fn from_arpa<R: BufRead>(reader: R) -> Result<Self, LmError> {
        enum Section {
            Preamble,
            Counts,
            Grams(usize),
        }

        let mut vocab = vec![UNK_WORD.to_string()];
        let mut index: HashMap<String, u32> = HashMap::new();
        index.insert(UNK_WORD.to_string(), UNK_ID);
        let mut counts: Vec<usize> = Vec::new();
        let mut ngrams: Vec<(Vec<u32>, ProbBackoff)> = Vec::new();
        let mut have_unk_unigram = false;
        let mut section = Section::Preamble;

        for (no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "\\data\\" {
                section = Section::Counts;
                continue;
            }
            if line == "\\end\\" {
                break;
            }
            if let Some(n) = line
                .strip_prefix('\\')
                .and_then(|l| l.strip_suffix("-grams:"))
            {
                let n: usize = n.parse().map_err(|_| LmError::Parse {
                    line: no + 1,
                    msg: format!("bad section header {line:?}"),
                })?;
                section = Section::Grams(n);
                continue;
            }
            match section {
                Section::Preamble => continue,
                Section::Counts => {
                    let rest = line.strip_prefix("ngram ").ok_or_else(|| LmError::Parse {
                        line: no + 1,
                        msg: format!("expected ngram count, got {line:?}"),
                    })?;
                    let (_, count) = rest.split_once('=').ok_or_else(|| LmError::Parse {
                        line: no + 1,
                        msg: format!("expected N=count, got {line:?}"),
                    })?;
                    counts.push(count.parse().map_err(|_| LmError::Parse {
                        line: no + 1,
                        msg: format!("bad count in {line:?}"),
                    })?);
                }
                Section::Grams(n) => {
                    let tokens: Vec<&str> = line.split_whitespace().collect();
                    if tokens.len() < n + 1 || tokens.len() > n + 2 {
                        return Err(LmError::Parse {
                            line: no + 1,
                            msg: format!("expected {n}-gram entry, got {line:?}"),
                        });
                    }
                    let prob: f32 = tokens[0].parse().map_err(|_| LmError::Parse {
                        line: no + 1,
                        msg: format!("bad probability {:?}", tokens[0]),
                    })?;
                    let backoff: f32 = if tokens.len() == n + 2 {
                        tokens[n + 1].parse().map_err(|_| LmError::Parse {
                            line: no + 1,
                            msg: format!("bad backoff {:?}", tokens[n + 1]),
                        })?
                    } else {
                        0.0
                    };
                    let mut ids = Vec::with_capacity(n);
                    for &w in &tokens[1..=n] {
                        let id = *index.entry(w.to_string()).or_insert_with(|| {
                            vocab.push(w.to_string());
                            (vocab.len() - 1) as u32
                        });
                        ids.push(id);
                    }
                    if n == 1 && ids[0] == UNK_ID {
                        have_unk_unigram = true;
                    }
                    ngrams.push((ids, ProbBackoff { prob, backoff }));
                }
            }
        }

        if counts.is_empty() {
            return Err(LmError::Parse {
                line: 0,
                msg: "missing \\data\\ section".to_string(),
            });
        }
        if !have_unk_unigram {
            ngrams.push((
                vec![UNK_ID],
                ProbBackoff {
                    prob: DEFAULT_UNK_LOG10,
                    backoff: 0.0,
                },
            ));
        }
        debug!(order = counts.len(), ngrams = ngrams.len(), vocab = vocab.len());
        Ok(Self {
            order: counts.len(),
            vocab,
            ngrams,
        })
    }

    pub(crate) fn read_binary(path: &Path) -> Result<Self, LmError> {
        let file = File::open(path)?;
        // The image is loaded lazily by the OS page cache.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        if map.len() < 8 || &map[..4] != MAGIC {
            return Err(LmError::BadMagic);
        }
        let version = u32::from_le_bytes([map[4], map[5], map[6], map[7]]);
        if version != VERSION {
            return Err(LmError::BadVersion(version));
        }
        Ok(bincode::deserialize(&map[8..])?)
    }

    pub(crate) fn write_binary(&self, path: &Path) -> Result<(), LmError> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        bincode::serialize_into(&mut out, self)?;
        out.flush()?;
        Ok(())
    }
}

/// True when `path` holds a compiled binary image rather than text ARPA.
pub fn is_binary_model(path: &Path) -> Result<bool, LmError> {
    use std::io::Read;
    let mut head = [0u8; 4];
    let mut file = File::open(path)?;
    let n = file.read(&mut head)?;
    Ok(n == 4 && &head == MAGIC)
}

/// Compile a text ARPA file into the binary image format.
pub fn compile_arpa(input: &Path, output: &Path) -> Result<(), LmError> {
    let raw = RawModel::from_arpa(BufReader::new(File::open(input)?))?;
    raw.write_binary(output)
}

/// Hash-table backend: one probe per lookup.
pub struct ProbingModel {
    order: usize,
    vocab: Vec<String>,
    index: HashMap<String, u32>,
    table: HashMap<Box<[u32]>, ProbBackoff>,
}

impl ProbingModel {
    fn from_raw(raw: RawModel) -> Self {
        let index = raw
            .vocab
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
        let table = raw
            .ngrams
            .into_iter()
            .map(|(ids, pb)| (ids.into_boxed_slice(), pb))
            .collect();
        Self {
            order: raw.order,
            vocab: raw.vocab,
            index,
            table,
        }
    }

    pub fn from_arpa<R: BufRead>(reader: R) -> Result<Self, LmError> {
        Ok(Self::from_raw(RawModel::from_arpa(reader)?))
    }

    pub fn load(path: &Path) -> Result<Self, LmError> {
        Ok(Self::from_raw(load_raw(path)?))
    }
}

impl NgramModel for ProbingModel {
    fn order(&self) -> usize {
        self.order
    }

    fn vocab(&self) -> &[String] {
        &self.vocab
    }

    fn word_id(&self, word: &str) -> Option<u32> {
        self.index.get(word).copied()
    }

    fn lookup(&self, ngram: &[u32]) -> Option<ProbBackoff> {
        self.table.get(ngram).copied()
    }
}

/// Sorted-array backend: binary search per lookup, no hashing overhead in
/// memory.
pub struct SortedModel {
    order: usize,
    vocab: Vec<String>,
    index: HashMap<String, u32>,
    table: Vec<(Box<[u32]>, ProbBackoff)>,
}

impl SortedModel {
    fn from_raw(raw: RawModel) -> Self {
        let index = raw
            .vocab
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
        let mut table: Vec<(Box<[u32]>, ProbBackoff)> = raw
            .ngrams
            .into_iter()
            .map(|(ids, pb)| (ids.into_boxed_slice(), pb))
            .collect();
        table.sort_by(|a, b| a.0.cmp(&b.0));
        table.dedup_by(|a, b| a.0 == b.0);
        Self {
            order: raw.order,
            vocab: raw.vocab,
            index,
            table,
        }
    }

    pub fn from_arpa<R: BufRead>(reader: R) -> Result<Self, LmError> {
        Ok(Self::from_raw(RawModel::from_arpa(reader)?))
    }

    pub fn load(path: &Path) -> Result<Self, LmError> {
        Ok(Self::from_raw(load_raw(path)?))
    }
}

impl NgramModel for SortedModel {
    fn order(&self) -> usize {
        self.order
    }

    fn vocab(&self) -> &[String] {
        &self.vocab
    }

    fn word_id(&self, word: &str) -> Option<u32> {
        self.index.get(word).copied()
    }

    fn lookup(&self, ngram: &[u32]) -> Option<ProbBackoff> {
        self.table
            .binary_search_by(|(key, _)| key.as_ref().cmp(ngram))
            .ok()
            .map(|i| self.table[i].1)
    }
}

fn load_raw(path: &Path) -> Result<RawModel, LmError> {
    if is_binary_model(path)? {
        RawModel::read_binary(path)
    } else {
        RawModel::from_arpa(BufReader::new(File::open(path)?))
    }
}

#[cfg(test)]
pub(crate) const TEST_ARPA: &str = "\
\\data\\
ngram 1=5
ngram 2=4

\\1-grams:
-1.0\t<unk>
-0.8\t<s>\t-0.5
-1.0\t</s>
-0.5\ta\t-0.4
-0.7\tb\t-0.3

\\2-grams:
-0.2\t<s> a
-0.3\ta b
-0.4\tb </s>
-0.6\ta a

\\end\\
";

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn probing() -> ProbingModel {
        ProbingModel::from_arpa(Cursor::new(TEST_ARPA)).unwrap()
    }

    #[test]
    fn direct_ngram_hit() {
        let m = probing();
        let a = m.word_id("a").unwrap();
        let b = m.word_id("b").unwrap();
        assert!((m.score(&[a], b) - (-0.3)).abs() < 1e-6);
        assert!((m.score(&[], a) - (-0.5)).abs() < 1e-6);
    }

    #[test]
    fn backoff_adds_context_weight() {
        let m = probing();
        let a = m.word_id("a").unwrap();
        let b = m.word_id("b").unwrap();
        // "b a" is not in the model: b(b) + p(a) = -0.3 + -0.5.
        assert!((m.score(&[b], a) - (-0.8)).abs() < 1e-6);
    }

    #[test]
    fn unknown_word_scores_as_unk() {
        let m = probing();
        let a = m.word_id("a").unwrap();
        assert_eq!(m.word_id("zebra"), None);
        // b(a) + p(<unk>) = -0.4 + -1.0.
        assert!((m.score(&[a], UNK_ID) - (-1.4)).abs() < 1e-6);
    }

    #[test]
    fn long_context_is_truncated() {
        let m = probing();
        let a = m.word_id("a").unwrap();
        let b = m.word_id("b").unwrap();
        // Order 2 only ever looks at the last context word.
        assert_eq!(m.score(&[b, b, a], b), m.score(&[a], b));
    }

    #[test]
    fn sorted_backend_agrees_with_probing() {
        let p = probing();
        let s = SortedModel::from_arpa(Cursor::new(TEST_ARPA)).unwrap();
        assert_eq!(p.order(), s.order());
        for w in ["<s>", "</s>", "a", "b"] {
            let id = p.word_id(w).unwrap();
            assert_eq!(s.word_id(w), Some(id));
            for c in ["<s>", "a", "b"] {
                let cid = p.word_id(c).unwrap();
                assert!((p.score(&[cid], id) - s.score(&[cid], id)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn binary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let arpa = dir.path().join("m.arpa");
        let bin = dir.path().join("m.bin");
        std::fs::write(&arpa, TEST_ARPA).unwrap();
        compile_arpa(&arpa, &bin).unwrap();
        assert!(is_binary_model(&bin).unwrap());
        assert!(!is_binary_model(&arpa).unwrap());
        let m = ProbingModel::load(&bin).unwrap();
        let from_text = ProbingModel::load(&arpa).unwrap();
        let a = m.word_id("a").unwrap();
        let b = m.word_id("b").unwrap();
        assert_eq!(m.score(&[a], b), from_text.score(&[a], b));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"SYLMxxxx-not-bincode").unwrap();
        assert!(matches!(
            RawModel::read_binary(&path),
            Err(LmError::Encoding(_)) | Err(LmError::BadVersion(_))
        ));
    }
}
