//! Rule-table text parsing.
//!
//! One rule per line, three ` ||| `-separated fields:
//!
//! ```text
//! "eat" "two" x0:X @ X ||| "futatsu" "no" x0:X "wo" "taberu" @ X ||| Pegf=0.02 ppen=2.718
//! ```
//!
//! Terminals are double-quoted, nonterminal placeholders are `xN` or
//! `xN:LABEL`, and an optional ` @ LABEL` suffix names the head label
//! (default `X`). The target field may hold several factor templates
//! separated by ` | `. Features are space-separated `name=value` pairs.

use crate::features::FeatureVec;
use crate::symbol::{tail_symbol, SymbolError, SymbolTable, WordId};

use super::{CfgData, TranslationRule};

pub const DEFAULT_LABEL: &str = "X";

#[derive(Debug, thiserror::Error)]
pub enum RuleTableError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error("wrong number of columns, expected at least 3: {0}")]
    BadColumnCount(String),

    #[error("bad token {0:?}")]
    BadToken(String),

    #[error("bad feature string {0:?}")]
    BadFeature(String),

    #[error("source nonterminals must be x0, x1, ... in ascending order: {0}")]
    UnorderedNonterminals(String),

    #[error("mismatched number of nonterminals between source and target: {0}")]
    MismatchedFactors(String),

    #[error("empty source patterns are not allowed: {0}")]
    EmptySource(String),

    #[error("placeholder {index} out of range in: {line}")]
    BadPlaceholder { index: usize, line: String },

    #[error("unary cycle through label {0:?}")]
    UnaryCycle(String),
}

/// Parse one pattern field (`"w" xN:LABEL ... [@ HEAD]`) into a `CfgData`.
pub fn parse_annotated_words(syms: &SymbolTable, field: &str) -> Result<CfgData, RuleTableError> {
    let mut tokens: Vec<&str> = field.split_whitespace().collect();
    let label = match tokens.iter().position(|&t| t == "@") {
        Some(at) => {
            if at + 2 != tokens.len() {
                return Err(RuleTableError::BadToken(field.to_string()));
            }
            let head = tokens[at + 1];
            tokens.truncate(at);
            syms.intern(head)?
        }
        None => syms.intern(DEFAULT_LABEL)?,
    };

    let mut words = Vec::with_capacity(tokens.len());
    let mut child_labels: Vec<Option<WordId>> = Vec::new();
    for tok in tokens {
        if let Some(rest) = tok.strip_prefix('x') {
            let (index, child) = match rest.split_once(':') {
                Some((n, lab)) => (n, lab),
                None => (rest, DEFAULT_LABEL),
            };
            let index: usize = index
                .parse()
                .map_err(|_| RuleTableError::BadToken(tok.to_string()))?;
            if index >= child_labels.len() {
                child_labels.resize(index + 1, None);
            }
            child_labels[index] = Some(syms.intern(child)?);
            words.push(tail_symbol(index));
        } else if tok.len() >= 2 && tok.starts_with('"') && tok.ends_with('"') {
            words.push(syms.intern(&tok[1..tok.len() - 1])?);
        } else {
            return Err(RuleTableError::BadToken(tok.to_string()));
        }
    }

    let mut child_syms = Vec::with_capacity(child_labels.len());
    for (index, label) in child_labels.into_iter().enumerate() {
        child_syms.push(label.ok_or_else(|| RuleTableError::BadPlaceholder {
            index,
            line: field.to_string(),
        })?);
    }
    Ok(CfgData::new(words, label, child_syms))
}

/// Parse a space-separated `name=value` feature string.
pub fn parse_features(syms: &SymbolTable, field: &str) -> Result<FeatureVec, RuleTableError> {
    let mut features = FeatureVec::new();
    for tok in field.split_whitespace() {
        let eq = tok
            .rfind('=')
            .ok_or_else(|| RuleTableError::BadFeature(tok.to_string()))?;
        let value: f64 = tok[eq + 1..]
            .parse()
            .map_err(|_| RuleTableError::BadFeature(tok.to_string()))?;
        features.add(syms.intern(&tok[..eq])?, value);
    }
    Ok(features)
}

/// Parse and validate one rule-table line.
pub fn parse_rule_line(syms: &SymbolTable, line: &str) -> Result<TranslationRule, RuleTableError> {
    let columns: Vec<&str> = line.split(" ||| ").collect();
    if columns.len() < 3 {
        return Err(RuleTableError::BadColumnCount(line.to_string()));
    }
    let src = parse_annotated_words(syms, columns[0])?;
    if !src.nonterms_are_ordered() {
        return Err(RuleTableError::UnorderedNonterminals(line.to_string()));
    }
    if src.words.is_empty() {
        return Err(RuleTableError::EmptySource(line.to_string()));
    }
    let mut trg = Vec::new();
    for factor in columns[1].split(" | ") {
        let data = parse_annotated_words(syms, factor)?;
        if data.syms.len() != src.syms.len() {
            return Err(RuleTableError::MismatchedFactors(line.to_string()));
        }
        for &w in &data.words {
            if w < 0 && crate::symbol::tail_index(w) >= src.syms.len() {
                return Err(RuleTableError::BadPlaceholder {
                    index: crate::symbol::tail_index(w),
                    line: line.to_string(),
                });
            }
        }
        trg.push(data);
    }
    let features = parse_features(syms, columns[2])?;
    Ok(TranslationRule::new(src, trg, features))
}
