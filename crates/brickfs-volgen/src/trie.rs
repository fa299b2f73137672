//! Prefix tree over option keys used for "did you mean" hints.
//!
//! Keys are split on the first dot into a domain and a specifier. A
//! misspelled dotted key is corrected one segment at a time: first the
//! closest domain, then up to two closest specifiers inside that domain.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Default, Clone)]
struct TrieNode {
    children: BTreeMap<char, usize>,
    terminal: bool,
}

/// Character-keyed prefix tree stored in an arena
#[derive(Debug, Clone)]
pub struct Trie {
    nodes: Vec<TrieNode>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    /// Creates an empty trie holding only the root
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    /// Adds a word, ignoring duplicates
    pub fn insert(&mut self, word: &str) {
        let mut cur = 0;
        for ch in word.chars() {
            cur = match self.nodes[cur].children.get(&ch) {
                Some(&next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[cur].children.insert(ch, next);
                    next
                }
            };
        }
        self.nodes[cur].terminal = true;
    }

    /// Whether the exact word was inserted
    pub fn contains(&self, word: &str) -> bool {
        let mut cur = 0;
        for ch in word.chars() {
            match self.nodes[cur].children.get(&ch) {
                Some(&next) => cur = next,
                None => return false,
            }
        }
        self.nodes[cur].terminal
    }

    /// Number of distinct words
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.terminal).count()
    }

    /// Whether no word was inserted
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `n` words closest to `word` by edit distance, ties in lexical order
    pub fn nearest(&self, word: &str, n: usize) -> Vec<(String, usize)> {
        let target: Vec<char> = word.chars().collect();
        let first_row: Vec<usize> = (0..=target.len()).collect();
        let mut found = Vec::new();
        let mut prefix = String::new();

        for (&ch, &child) in &self.nodes[0].children {
            self.walk(child, ch, &target, &first_row, &mut prefix, &mut found);
        }

        // stable sort keeps the lexical order of the DFS for equal distances
        found.sort_by_key(|(_, dist)| *dist);
        found.truncate(n);
        found
    }

    fn walk(
        &self,
        node: usize,
        ch: char,
        target: &[char],
        prev_row: &[usize],
        prefix: &mut String,
        found: &mut Vec<(String, usize)>,
    ) {
        prefix.push(ch);

        let mut row = Vec::with_capacity(prev_row.len());
        row.push(prev_row[0] + 1);
        for i in 1..prev_row.len() {
            let insert = row[i - 1] + 1;
            let delete = prev_row[i] + 1;
            let replace = prev_row[i - 1] + usize::from(target[i - 1] != ch);
            row.push(insert.min(delete).min(replace));
        }

        if self.nodes[node].terminal {
            found.push((prefix.clone(), row[target.len()]));
        }
        for (&next_ch, &child) in &self.nodes[node].children {
            self.walk(child, next_ch, target, &row, prefix, found);
        }

        prefix.pop();
    }
}

/// Suggested completions for a mistyped option key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionHint {
    domain: Option<String>,
    words: Vec<String>,
}

impl OptionHint {
    /// Full dotted suggestions, best first
    pub fn suggestions(&self) -> Vec<String> {
        match &self.domain {
            Some(dom) => self.words.iter().map(|w| format!("{}.{}", dom, w)).collect(),
            None => self.words.clone(),
        }
    }
}

impl fmt::Display for OptionHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let infix = if self.domain.is_some() { "..." } else { "" };
        if let Some(dom) = &self.domain {
            write!(f, "{}.", dom)?;
        }
        match self.words.as_slice() {
            [first] => write!(f, "{}", first),
            [first, second, ..] => write!(f, "{} or {}{}", first, infix, second),
            [] => Ok(()),
        }
    }
}

/// Build-once hint index over every option key
#[derive(Debug, Clone, Default)]
pub struct OptionTrie {
    keys: BTreeSet<String>,
    domains: Trie,
    specifiers: BTreeMap<String, Trie>,
    all_specifiers: Trie,
}

fn first_segment(s: &str) -> &str {
    s.split('.').next().unwrap_or(s)
}

impl OptionTrie {
    /// Indexes the given keys
    pub fn build<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut trie = OptionTrie::default();
        for key in keys {
            trie.keys.insert(key.to_string());
            match key.split_once('.') {
                Some((dom, rest)) => {
                    let spec = first_segment(rest);
                    trie.domains.insert(dom);
                    trie.specifiers.entry(dom.to_string()).or_default().insert(spec);
                    trie.all_specifiers.insert(spec);
                }
                None => trie.domains.insert(key),
            }
        }
        trie
    }

    /// Whether the key is indexed verbatim
    pub fn is_exact(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Suggestions for `key`, `None` for exact matches or when nothing is close
    pub fn hint(&self, key: &str) -> Option<OptionHint> {
        if self.is_exact(key) {
            return None;
        }

        let Some((dom, spec)) = key.split_once('.') else {
            let words: Vec<String> = self
                .all_specifiers
                .nearest(key, 2)
                .into_iter()
                .map(|(w, _)| w)
                .collect();
            return (!words.is_empty()).then_some(OptionHint { domain: None, words });
        };

        let (best_dom, _) = self.domains.nearest(dom, 1).into_iter().next()?;
        let words: Vec<String> = self
            .specifiers
            .get(&best_dom)?
            .nearest(spec, 2)
            .into_iter()
            .map(|(w, _)| w)
            .collect();
        if words.is_empty() {
            return None;
        }
        Some(OptionHint {
            domain: Some(best_dom),
            words,
        })
    }
}
