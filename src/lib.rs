//! A syntax-based statistical translation decoder.
//!
//! Decoding runs as a pipeline of hypergraph transforms: a trie automaton
//! matches translation rules over the input and builds a derivation forest
//! ([`matcher`]), n-gram language models rescore the forest by cube pruning
//! or incremental state-grouping search ([`compose`]), and ranked outputs
//! come from lazy n-best extraction over the final graph ([`forest`]).
//! [`Decoder`] ties the stages together and drives whole corpora across a
//! worker pool with output kept in input order.

pub mod compose;
pub mod config;
pub mod decoder;
pub mod features;
pub mod forest;
pub mod input;
pub mod lm;
pub mod matcher;
pub mod pool;
pub mod rule;
pub mod symbol;
pub mod trace_init;

pub use config::DecoderConfig;
pub use decoder::{Decoder, DecoderError, Translation};
pub use features::FeatureVec;
pub use forest::HyperGraph;
pub use symbol::SymbolTable;
