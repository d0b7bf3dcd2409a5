//! String interning shared by every decoder component.
//!
//! Terminals and nonterminal labels are interned once into `WordId`s.
//! Non-negative ids name a symbol; a negative id `v` inside a rule template
//! denotes "nonterminal tail number `-1-v`". The table is append-only and can
//! be frozen after loading so that later lookups never mutate it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// An interned symbol id. Negative values are nonterminal placeholders.
pub type WordId = i32;

/// An ordered sequence of symbols.
pub type Sentence = Vec<WordId>;

/// Tail index encoded by a negative template symbol.
#[inline]
pub fn tail_index(v: WordId) -> usize {
    debug_assert!(v < 0);
    (-1 - v) as usize
}

/// Negative template symbol for tail number `idx`.
#[inline]
pub fn tail_symbol(idx: usize) -> WordId {
    -1 - idx as WordId
}

#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    #[error("symbol table is frozen, cannot intern {0:?}")]
    Frozen(String),
    #[error("unknown symbol id {0}")]
    UnknownId(WordId),
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, WordId>,
    vocab: Vec<String>,
}

/// Append-only symbol interner, safe for concurrent reads and guarded
/// appends. Passed by `Arc` to every component that needs id↔string
/// conversion.
pub struct SymbolTable {
    inner: RwLock<Inner>,
    frozen: AtomicBool,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Reject any further additions. Lookups of known symbols keep working.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Id for `sym`, interning it if it is new.
    pub fn intern(&self, sym: &str) -> Result<WordId, SymbolError> {
        {
            let inner = self.inner.read().expect("symbol table poisoned");
            if let Some(&id) = inner.map.get(sym) {
                return Ok(id);
            }
        }
        if self.is_frozen() {
            return Err(SymbolError::Frozen(sym.to_string()));
        }
        let mut inner = self.inner.write().expect("symbol table poisoned");
        // Another thread may have interned it between the locks.
        if let Some(&id) = inner.map.get(sym) {
            return Ok(id);
        }
        let id = inner.vocab.len() as WordId;
        inner.vocab.push(sym.to_string());
        inner.map.insert(sym.to_string(), id);
        Ok(id)
    }

    /// Id for `sym` if it has been interned.
    pub fn get(&self, sym: &str) -> Option<WordId> {
        let inner = self.inner.read().expect("symbol table poisoned");
        inner.map.get(sym).copied()
    }

    /// String for an id. Placeholder (negative) ids have no string.
    pub fn symbol(&self, id: WordId) -> Result<String, SymbolError> {
        let inner = self.inner.read().expect("symbol table poisoned");
        inner
            .vocab
            .get(usize::try_from(id).map_err(|_| SymbolError::UnknownId(id))?)
            .cloned()
            .ok_or(SymbolError::UnknownId(id))
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("symbol table poisoned").vocab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Intern each whitespace-separated token of `line`.
    pub fn parse_words(&self, line: &str) -> Result<Sentence, SymbolError> {
        line.split_whitespace().map(|w| self.intern(w)).collect()
    }

    /// Space-joined symbols for a sentence. Unknown ids render as `<?id>`.
    pub fn print_words(&self, words: &[WordId]) -> String {
        let mut out = String::new();
        for (i, &w) in words.iter().enumerate() {
            if i != 0 {
                out.push(' ');
            }
            match self.symbol(w) {
                Ok(s) => out.push_str(&s),
                Err(_) => out.push_str(&format!("<?{w}>")),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable() {
        let syms = SymbolTable::new();
        let a = syms.intern("the").unwrap();
        let b = syms.intern("cat").unwrap();
        assert_ne!(a, b);
        assert_eq!(syms.intern("the").unwrap(), a);
        assert_eq!(syms.symbol(b).unwrap(), "cat");
    }

    #[test]
    fn freeze_rejects_new_symbols() {
        let syms = SymbolTable::new();
        let a = syms.intern("known").unwrap();
        syms.freeze();
        assert_eq!(syms.intern("known").unwrap(), a);
        assert!(matches!(
            syms.intern("fresh"),
            Err(SymbolError::Frozen(_))
        ));
        assert_eq!(syms.get("fresh"), None);
    }

    #[test]
    fn tail_encoding_round_trips() {
        assert_eq!(tail_symbol(0), -1);
        assert_eq!(tail_symbol(2), -3);
        assert_eq!(tail_index(-1), 0);
        assert_eq!(tail_index(-3), 2);
    }

    #[test]
    fn parse_and_print_words() {
        let syms = SymbolTable::new();
        let sent = syms.parse_words("le chat dort").unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(syms.print_words(&sent), "le chat dort");
    }
}
