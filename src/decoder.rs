//! The end-to-end decoding pipeline: match rules over the input, score the
//! forest with the configured weights, compose against the language models,
//! and extract ranked output strings.
//!
//! A [`Decoder`] is built once from a [`DecoderConfig`] and is then safe to
//! share across worker threads: everything it holds is read-only after
//! load except the symbol table, which only ever appends.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;

use tracing::{debug, debug_span, error};

use crate::compose::{build_composer, ComposeError, Composer, SearchLimits};
use crate::config::{ConfigError, DecoderConfig, InputMode};
use crate::features::FeatureVec;
use crate::forest::ForestError;
use crate::input::{parse_input, InputError};
use crate::lm::{LmData, LmError};
use crate::matcher::{MatchError, Matcher, RuleTrie};
use crate::pool::{OutputCollector, Shutdown, ThreadPool};
use crate::rule::RuleTableError;
use crate::symbol::{SymbolError, SymbolTable};

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("rule table {path}: {source}")]
    RuleTable {
        path: String,
        source: RuleTableError,
    },

    #[error(transparent)]
    Lm(#[from] LmError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error(transparent)]
    Forest(#[from] ForestError),

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One ranked output hypothesis.
#[derive(Debug, Clone)]
pub struct Translation {
    pub text: String,
    pub features: FeatureVec,
    pub score: f64,
}

pub struct Decoder {
    syms: Arc<SymbolTable>,
    matcher: Matcher,
    composer: Box<dyn Composer>,
    weights: FeatureVec,
    nbest: usize,
    input_mode: InputMode,
    threads: usize,
    queue_limit: usize,
}

impl Decoder {
    /// Load grammars and models and wire up the configured search strategy.
    pub fn from_config(config: &DecoderConfig) -> Result<Self, DecoderError> {
        let syms = Arc::new(SymbolTable::new());

        let mut weights = FeatureVec::new();
        for (name, value) in &config.weights {
            weights.insert(syms.intern(name)?, *value);
        }

        let mut matcher = Matcher::new(
            &syms,
            &config.grammar.root_symbol,
            config.grammar.unk_symbol.as_deref(),
            config.grammar.delete_unknown,
            config.grammar.factors,
        )?;
        for path in &config.grammar.rule_tables {
            let file = File::open(path)?;
            let mut trie = RuleTrie::read_rule_table(&syms, BufReader::new(file)).map_err(
                |source| DecoderError::RuleTable {
                    path: path.display().to_string(),
                    source,
                },
            )?;
            trie.set_span_limit(config.search.span_limit);
            matcher.add_trie(trie);
        }

        let mut lms = Vec::with_capacity(config.lm.models.len());
        for spec in &config.lm.models {
            lms.push(Arc::new(LmData::from_spec(&syms, spec)?));
        }

        let composer = build_composer(
            config.search.strategy,
            config.search.combination,
            lms,
            weights.clone(),
            SearchLimits {
                chart_limit: config.search.chart_limit,
                pop_limit: config.search.pop_limit,
                stack_pop_limit: config.search.stack_pop_limit,
                edge_limit: config.search.edge_limit,
            },
        )?;

        debug!(
            tables = config.grammar.rule_tables.len(),
            models = config.lm.models.len(),
            "decoder ready"
        );
        Ok(Self {
            syms,
            matcher,
            composer,
            weights,
            nbest: config.search.nbest,
            input_mode: config.grammar.input,
            threads: config.pool.threads,
            queue_limit: config.pool.queue_limit,
        })
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.syms
    }

    /// Decode one input line into up to `nbest` ranked hypotheses. Empty
    /// input yields an empty list.
    pub fn decode(&self, line: &str) -> Result<Vec<Translation>, DecoderError> {
        let _span = debug_span!("decode").entered();
        let words = parse_input(&self.syms, self.input_mode, line)?;
        let mut forest = self.matcher.build_forest(&words)?;
        forest.score_edges(&self.weights);
        let composed = self.composer.compose(&forest)?;
        if composed.is_empty() {
            return Ok(Vec::new());
        }
        let paths = composed.nbest(0, self.nbest);
        let mut results = Vec::with_capacity(paths.len());
        for path in &paths {
            let output = composed.path_translation(path, 0, None)?;
            results.push(Translation {
                text: self.syms.print_words(&output),
                features: composed.path_features(path),
                score: path.score,
            });
        }
        Ok(results)
    }

    /// Render sorted `name=value` pairs for a feature vector.
    pub fn format_features(&self, features: &FeatureVec) -> String {
        let mut named: Vec<(String, f64)> = features
            .sorted()
            .into_iter()
            .map(|(id, v)| {
                let name = self
                    .syms
                    .symbol(id)
                    .unwrap_or_else(|_| format!("<?{id}>"));
                (name, v)
            })
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
            .iter()
            .map(|(name, v)| format!("{name}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Output block for one sentence: the bare top hypothesis when
    /// `nbest = 1`, otherwise one ` ||| `-separated line per hypothesis.
    pub fn format_nbest(&self, id: usize, results: &[Translation]) -> String {
        if self.nbest == 1 {
            let text = results.first().map(|r| r.text.as_str()).unwrap_or("");
            return format!("{text}\n");
        }
        if results.is_empty() {
            return "\n".to_string();
        }
        results
            .iter()
            .map(|r| {
                format!(
                    "{id} ||| {} ||| {} ||| {}\n",
                    r.text,
                    self.format_features(&r.features),
                    r.score
                )
            })
            .collect()
    }

    /// Decode every line of `input` across the worker pool, writing results
    /// to `sink` strictly in input order. Returns the sink once the pool
    /// has drained.
    pub fn decode_corpus<R, W>(self: &Arc<Self>, input: R, sink: W) -> Result<W, DecoderError>
    where
        R: BufRead,
        W: Write + Send + 'static,
    {
        let collector = Arc::new(OutputCollector::new(sink));
        let pool = ThreadPool::new(self.threads, self.queue_limit);
        for (id, line) in input.lines().enumerate() {
            let line = line?;
            let decoder = Arc::clone(self);
            let collector = Arc::clone(&collector);
            pool.submit(move || {
                let text = match decoder.decode(&line) {
                    Ok(results) => decoder.format_nbest(id, &results),
                    Err(e) => {
                        error!(sentence = id, error = %e, "decode failed");
                        "\n".to_string()
                    }
                };
                if let Err(e) = collector.write(id, text) {
                    error!(sentence = id, error = %e, "output write failed");
                }
            });
        }
        pool.stop(Shutdown::Drain);
        let collector = Arc::try_unwrap(collector)
            .ok()
            .expect("workers still hold the collector after drain");
        Ok(collector.into_sink())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;

    fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn decoder_with(config_toml: &str) -> Decoder {
        let config = DecoderConfig::from_toml(config_toml).unwrap();
        Decoder::from_config(&config).unwrap()
    }

    fn basic_config(dir: &Path) -> String {
        let rules = write_file(
            dir,
            "rules.txt",
            "\"the\" \"cat\" @ X ||| \"le\" \"chat\" @ X ||| w=1\n",
        );
        format!(
            "[grammar]\nrule_tables = [{:?}]\n\n[weights]\nw = 1.0\n",
            rules.display()
        )
    }

    #[test]
    fn decodes_the_example_sentence() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = decoder_with(&basic_config(dir.path()));
        let results = decoder.decode("the cat").unwrap();
        assert_eq!(results[0].text, "le chat");
        let w = decoder.symbols().get("w").unwrap();
        assert_eq!(results[0].features.get(w), 1.0);
        assert!((results[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unmatched_words_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = decoder_with(&basic_config(dir.path()));
        let results = decoder.decode("the cat naps").unwrap();
        assert_eq!(results[0].text, "le chat naps");
    }

    #[test]
    fn empty_line_decodes_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = decoder_with(&basic_config(dir.path()));
        assert!(decoder.decode("").unwrap().is_empty());
        assert_eq!(decoder.format_nbest(0, &[]), "\n");
    }

    #[test]
    fn corpus_output_stays_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = basic_config(dir.path());
        config.push_str("\n[pool]\nthreads = 4\nqueue_limit = 2\n");
        let decoder = Arc::new(decoder_with(&config));
        let input = "the cat\nzip\nthe cat\n";
        let out = decoder
            .decode_corpus(Cursor::new(input), Vec::new())
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "le chat\nzip\nle chat\n");
    }

    #[test]
    fn nbest_lines_carry_features_and_scores() {
        let dir = tempfile::tempdir().unwrap();
        let rules = write_file(
            dir.path(),
            "rules.txt",
            "\"x\" @ X ||| \"a\" @ X ||| w=2\n\
             \"x\" @ X ||| \"b\" @ X ||| w=1\n",
        );
        let config = format!(
            "[search]\nnbest = 2\n\n[grammar]\nrule_tables = [{:?}]\n\n[weights]\nw = 1.0\n",
            rules.display()
        );
        let decoder = decoder_with(&config);
        let results = decoder.decode("x").unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "a");
        assert_eq!(results[1].text, "b");
        let block = decoder.format_nbest(7, &results);
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("7 ||| a ||| "));
        assert!(lines[0].contains("w=2"));
    }

    #[test]
    fn missing_rule_table_fails_to_load() {
        let config = DecoderConfig::from_toml(
            "[grammar]\nrule_tables = [\"/nonexistent/rules.txt\"]\n",
        )
        .unwrap();
        assert!(matches!(
            Decoder::from_config(&config),
            Err(DecoderError::Io(_))
        ));
    }

    #[test]
    fn tree_input_decodes_over_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let rules = write_file(
            dir.path(),
            "rules.txt",
            "\"the\" \"cat\" @ X ||| \"le\" \"chat\" @ X ||| w=1\n",
        );
        let config = format!(
            "[grammar]\nrule_tables = [{:?}]\ninput = \"tree\"\n\n[weights]\nw = 1.0\n",
            rules.display()
        );
        let decoder = decoder_with(&config);
        let results = decoder.decode("(NP (D the) (N cat))").unwrap();
        assert_eq!(results[0].text, "le chat");
    }
}
