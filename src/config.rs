//! Decoder configuration loaded from TOML.
//!
//! Every section has defaults, so an empty document is a valid minimal
//! configuration (no grammar, no LM, one thread). Values are validated
//! after parsing; validation failures name the offending field.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::compose::{LmCombination, SearchStrategy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub search: SearchSettings,
    pub pool: PoolSettings,
    pub grammar: GrammarSettings,
    pub lm: LmSettings,
    /// Feature name to weight; features without a weight count as zero.
    pub weights: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchSettings {
    pub strategy: SearchStrategy,
    pub combination: LmCombination,
    /// Max source tokens a matched rule may span.
    pub span_limit: usize,
    /// Max distinct survivors per node in cube pruning; zero is unlimited.
    pub chart_limit: usize,
    /// Max queue pops per node in cube pruning; zero is unlimited.
    pub pop_limit: usize,
    /// Max queue pops per node in incremental search; zero is unlimited.
    pub stack_pop_limit: usize,
    /// Max edges kept per input edge in incremental search; zero is
    /// unlimited.
    pub edge_limit: usize,
    /// How many ranked hypotheses to emit per sentence.
    pub nbest: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        let limits = crate::compose::SearchLimits::default();
        Self {
            strategy: SearchStrategy::default(),
            combination: LmCombination::default(),
            span_limit: crate::matcher::DEFAULT_SPAN_LIMIT,
            chart_limit: limits.chart_limit,
            pop_limit: limits.pop_limit,
            stack_pop_limit: limits.stack_pop_limit,
            edge_limit: limits.edge_limit,
            nbest: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub threads: usize,
    /// Task-queue backpressure limit; zero is unbounded.
    pub queue_limit: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            queue_limit: 64,
        }
    }
}

/// How input lines are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Whitespace-separated tokens.
    #[default]
    Words,
    /// Penn-style bracketed parse trees; decoding runs over the leaves.
    Tree,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrammarSettings {
    pub rule_tables: Vec<PathBuf>,
    pub input: InputMode,
    pub root_symbol: String,
    /// Label for unknown-word fallback nodes; `None` attaches unknown
    /// rules to every single-token label.
    pub unk_symbol: Option<String>,
    /// Drop unknown source words instead of passing them through.
    pub delete_unknown: bool,
    /// Number of target-side output factors.
    pub factors: usize,
}

impl Default for GrammarSettings {
    fn default() -> Self {
        Self {
            rule_tables: Vec::new(),
            input: InputMode::Words,
            root_symbol: "X".to_string(),
            unk_symbol: Some("X".to_string()),
            delete_unknown: false,
            factors: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LmSettings {
    /// Model spec strings, `path|key=value,...` (see the `lm` module).
    pub models: Vec<String>,
}

impl DecoderConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: DecoderConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        macro_rules! check_positive {
            ($section:ident . $field:ident) => {
                if self.$section.$field == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: concat!(stringify!($section), ".", stringify!($field)).to_string(),
                        reason: "must be positive".to_string(),
                    });
                }
            };
        }
        check_positive!(search.span_limit);
        check_positive!(search.nbest);
        check_positive!(pool.threads);
        check_positive!(grammar.factors);
        if self.grammar.root_symbol.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "grammar.root_symbol".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
