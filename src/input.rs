//! Input parsing: flat token sequences and Penn-style bracketed trees.
//!
//! A tree input becomes a hypergraph with the root at node 0, one node per
//! tree position, and one edge per internal node connecting it to its
//! children in order. Leaves are terminal nodes over single-token spans and
//! their words form the graph's sentence, which is what rule matching runs
//! over.

use tracing::debug;

use crate::config::InputMode;
use crate::features::FeatureVec;
use crate::forest::{ForestError, HyperGraph, NodeId};
use crate::rule::CfgData;
use crate::symbol::{tail_symbol, Sentence, SymbolError, SymbolTable};

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    Forest(#[from] ForestError),

    #[error("unbalanced parentheses in tree: {0}")]
    Unbalanced(String),

    #[error("malformed tree near {0:?}")]
    Malformed(String),
}

enum Tree {
    Leaf(String),
    Node(String, Vec<Tree>),
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' | ')' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_string());
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_subtree(tokens: &[String], pos: &mut usize, text: &str) -> Result<Tree, InputError> {
    match tokens.get(*pos) {
        Some(t) if t == "(" => {
            *pos += 1;
            let label = match tokens.get(*pos) {
                Some(t) if t != "(" && t != ")" => t.clone(),
                _ => return Err(InputError::Malformed(text.to_string())),
            };
            *pos += 1;
            let mut children = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(t) if t == ")" => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => children.push(parse_subtree(tokens, pos, text)?),
                    None => return Err(InputError::Unbalanced(text.to_string())),
                }
            }
            if children.is_empty() {
                return Err(InputError::Malformed(text.to_string()));
            }
            Ok(Tree::Node(label, children))
        }
        Some(t) if t != ")" => {
            let leaf = Tree::Leaf(t.clone());
            *pos += 1;
            Ok(leaf)
        }
        _ => Err(InputError::Unbalanced(text.to_string())),
    }
}

fn collect_words(syms: &SymbolTable, tree: &Tree, out: &mut Sentence) -> Result<(), SymbolError> {
    match tree {
        Tree::Leaf(w) => out.push(syms.intern(w)?),
        Tree::Node(_, children) => {
            for c in children {
                collect_words(syms, c, out)?;
            }
        }
    }
    Ok(())
}

fn emit(
    syms: &SymbolTable,
    graph: &mut HyperGraph,
    tree: &Tree,
    next_leaf: &mut usize,
) -> Result<NodeId, InputError> {
    match tree {
        Tree::Leaf(w) => {
            let start = *next_leaf;
            *next_leaf += 1;
            Ok(graph.add_node(syms.intern(w)?, (start, start + 1), true))
        }
        Tree::Node(label, children) => {
            let start = *next_leaf;
            // Head first so the tree root lands at node 0.
            let head = graph.add_node(syms.intern(label)?, (start, start), false);
            let mut tails = Vec::with_capacity(children.len());
            for child in children {
                tails.push(emit(syms, graph, child, next_leaf)?);
            }
            let end = *next_leaf;
            let trg = {
                let words: Sentence = (0..tails.len()).map(tail_symbol).collect();
                let child_labels: Sentence =
                    tails.iter().map(|&t| graph.node(t).label).collect();
                vec![CfgData::new(words, syms.intern(label)?, child_labels)]
            };
            graph.set_span(head, (start, end));
            graph.add_edge(head, tails, trg, FeatureVec::new(), 0.0)?;
            Ok(head)
        }
    }
}

/// Parse one bracketed tree into a hypergraph rooted at node 0.
pub fn parse_penn_tree(syms: &SymbolTable, text: &str) -> Result<HyperGraph, InputError> {
    let tokens = tokenize(text);
    let mut pos = 0usize;
    let tree = parse_subtree(&tokens, &mut pos, text)?;
    if pos != tokens.len() {
        return Err(InputError::Malformed(text.to_string()));
    }
    let mut words = Sentence::new();
    collect_words(syms, &tree, &mut words)?;
    let mut graph = HyperGraph::new(words);
    let mut next_leaf = 0usize;
    emit(syms, &mut graph, &tree, &mut next_leaf)?;
    debug!(nodes = graph.num_nodes(), leaves = next_leaf);
    Ok(graph)
}

/// Extract the token sequence of one input line under the configured mode.
pub fn parse_input(
    syms: &SymbolTable,
    mode: InputMode,
    line: &str,
) -> Result<Sentence, InputError> {
    match mode {
        InputMode::Words => Ok(syms.parse_words(line)?),
        InputMode::Tree => {
            if line.trim().is_empty() {
                return Ok(Sentence::new());
            }
            Ok(parse_penn_tree(syms, line)?.words().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_small_tree() {
        let syms = SymbolTable::new();
        let g = parse_penn_tree(&syms, "(S (NP (D the) (N cat)) (V sleeps))").unwrap();
        assert_eq!(syms.print_words(g.words()), "the cat sleeps");
        let root = g.node(0);
        assert_eq!(root.label, syms.get("S").unwrap());
        assert_eq!(root.span, (0, 3));
        assert_eq!(root.edges.len(), 1);
        let top = g.edge(root.edges[0]);
        assert_eq!(top.tails.len(), 2);
        assert_eq!(g.node(top.tails[0]).label, syms.get("NP").unwrap());
        assert_eq!(g.node(top.tails[0]).span, (0, 2));
    }

    #[test]
    fn leaves_are_terminal_nodes() {
        let syms = SymbolTable::new();
        let g = parse_penn_tree(&syms, "(X (A a) (B b))").unwrap();
        let leaves: Vec<_> = g.nodes().iter().filter(|n| n.terminal).collect();
        assert_eq!(leaves.len(), 2);
        assert!(leaves.iter().all(|n| n.edges.is_empty()));
        assert!(g.viterbi_score(0).is_ok());
    }

    #[test]
    fn unbalanced_trees_are_rejected() {
        let syms = SymbolTable::new();
        assert!(matches!(
            parse_penn_tree(&syms, "(S (NP the"),
            Err(InputError::Unbalanced(_))
        ));
        assert!(matches!(
            parse_penn_tree(&syms, "(S ()"),
            Err(InputError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let syms = SymbolTable::new();
        assert!(matches!(
            parse_penn_tree(&syms, "(S a) extra"),
            Err(InputError::Malformed(_))
        ));
    }

    #[test]
    fn input_modes_share_token_output() {
        let syms = SymbolTable::new();
        let flat = parse_input(&syms, InputMode::Words, "the cat sleeps").unwrap();
        let tree = parse_input(
            &syms,
            InputMode::Tree,
            "(S (NP (D the) (N cat)) (V sleeps))",
        )
        .unwrap();
        assert_eq!(flat, tree);
        assert!(parse_input(&syms, InputMode::Tree, "  ").unwrap().is_empty());
    }
}
