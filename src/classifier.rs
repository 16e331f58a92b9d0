//! Statistical classifier over the statfile pool: tokenization, scoring,
//! and the learn path driven from the control channel.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::error::ClassifierError;
use crate::message::ParsedMessage;
use crate::statfile::{Statfile, StatfilePool, TokenUpdate};

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"[A-Za-z][A-Za-z']{2,}").expect("token regex");
}

/// Identity of the word tokenizer; tasks cache token lists under this key.
pub const WORD_TOKENIZER: &str = "words";

/// FNV-1a. Tokens are stored hashed; the statfiles never see plaintext.
pub fn hash_token(token: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in token.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

pub fn tokenize(text: &str) -> Vec<u64> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| hash_token(&m.as_str().to_lowercase()))
        .collect()
}

pub fn tokenize_message(msg: &ParsedMessage) -> Vec<u64> {
    let mut tokens = Vec::new();
    if let Some(subject) = &msg.subject {
        tokens.extend(tokenize(subject));
    }
    for part in msg.text_parts() {
        tokens.extend(tokenize(&part.body));
    }
    tokens
}

/// Near-duplicate fingerprint: the minimum hash over word 3-grams, which
/// tolerates small edits while staying stable for bulk-identical content.
/// Short messages fall back to hashing the normalized text whole.
pub fn fuzzy_hash(text: &str) -> u64 {
    let words: Vec<String> = TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    if words.len() < 3 {
        return hash_token(&words.join(" "));
    }
    words
        .windows(3)
        .map(|w| hash_token(&w.join(" ")))
        .min()
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct LearnSummary {
    pub classifier: String,
    pub statfile: String,
    pub tokens: usize,
}

/// How a message's tokens hit each half of a classifier; the control
/// channel's `weights` command renders this as JSON.
#[derive(Debug, Serialize)]
pub struct WeightsReport {
    pub classifier: String,
    pub tokens: usize,
    pub spam_hits: u64,
    pub ham_hits: u64,
}

/// Naive-bayes style classifier over a spam/ham statfile pair.
pub struct Classifier {
    name: String,
    spam: Arc<Statfile>,
    ham: Arc<Statfile>,
    /// Per-message cap on the absolute contributed score.
    score_cap: f64,
}

impl Classifier {
    pub fn new(name: &str, spam: Arc<Statfile>, ham: Arc<Statfile>) -> Self {
        Classifier {
            name: name.to_string(),
            spam,
            ham,
            score_cap: 4.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log-ratio score over the token set; positive leans spam. Tokens the
    /// statfiles have never seen contribute nothing.
    pub fn classify(&self, tokens: &[u64]) -> f64 {
        let mut score = 0.0;
        for &t in tokens {
            let cs = self.spam.get(t).map(|(c, _)| c).unwrap_or(0);
            let ch = self.ham.get(t).map(|(c, _)| c).unwrap_or(0);
            if cs == 0 && ch == 0 {
                continue;
            }
            score += ((cs as f64 + 0.5) / (ch as f64 + 0.5)).ln();
        }
        score.clamp(-self.score_cap, self.score_cap)
    }

    pub fn weights(&self, tokens: &[u64]) -> WeightsReport {
        let mut spam_hits = 0;
        let mut ham_hits = 0;
        for &t in tokens {
            if self.spam.get(t).is_some() {
                spam_hits += 1;
            }
            if self.ham.get(t).is_some() {
                ham_hits += 1;
            }
        }
        WeightsReport {
            classifier: self.name.clone(),
            tokens: tokens.len(),
            spam_hits,
            ham_hits,
        }
    }

    /// Train one message's tokens into the spam or ham statfile. The whole
    /// message is one batched update: one lock round, one revision bump.
    pub fn learn(
        &self,
        tokens: &[u64],
        spam: bool,
        multiplier: f64,
    ) -> Result<LearnSummary, ClassifierError> {
        if tokens.is_empty() {
            return Err(ClassifierError::Learn("message has no tokens".to_string()));
        }
        let target = if spam { &self.spam } else { &self.ham };

        // Collapse duplicate tokens so one batch entry covers all repeats.
        let mut counts: HashMap<u64, i64> = HashMap::new();
        for &t in tokens {
            *counts.entry(t).or_insert(0) += 1;
        }
        let updates: Vec<TokenUpdate> = counts
            .into_iter()
            .map(|(token, n)| TokenUpdate {
                token,
                delta_count: n,
                delta_weight: n as f64 * multiplier,
            })
            .collect();
        target.update(&updates)?;

        log::info!(
            "classifier {}: learned {} tokens into {}",
            self.name,
            updates.len(),
            target.name()
        );
        Ok(LearnSummary {
            classifier: self.name.clone(),
            statfile: target.name().to_string(),
            tokens: updates.len(),
        })
    }
}

/// Classifiers by identity, as the control channel addresses them.
pub struct ClassifierRegistry {
    by_name: HashMap<String, Arc<Classifier>>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        ClassifierRegistry {
            by_name: HashMap::new(),
        }
    }

    pub fn register(&mut self, classifier: Arc<Classifier>) {
        self.by_name
            .insert(classifier.name().to_string(), classifier);
    }

    pub fn get(&self, name: &str) -> Result<Arc<Classifier>, ClassifierError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ClassifierError::UnknownClassifier(name.to_string()))
    }

    /// Open the statfile pair for a bayes classifier and register it.
    pub fn open_bayes(
        &mut self,
        name: &str,
        pool: &StatfilePool,
        statfile_size: u64,
    ) -> Result<Arc<Classifier>, ClassifierError> {
        let spam = pool.open_or_create(&format!("{name}.spam"), statfile_size)?;
        let ham = pool.open_or_create(&format!("{name}.ham"), statfile_size)?;
        let classifier = Arc::new(Classifier::new(name, spam, ham));
        self.register(classifier.clone());
        Ok(classifier)
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bayes_fixture() -> (tempfile::TempDir, Arc<Classifier>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = StatfilePool::new(dir.path());
        let mut reg = ClassifierRegistry::new();
        let c = reg.open_bayes("bayes", &pool, 64 * 1024).unwrap();
        (dir, c)
    }

    #[test]
    fn tokenizer_is_stable_and_case_insensitive() {
        let a = tokenize("Cheap PILLS cheap pills");
        let b = tokenize("cheap pills CHEAP PILLS");
        assert_eq!(a.len(), 4);
        let mut a2 = a.clone();
        let mut b2 = b.clone();
        a2.sort_unstable();
        b2.sort_unstable();
        assert_eq!(a2, b2);
        // Short words are dropped.
        assert!(tokenize("a an to").is_empty());
    }

    #[test]
    fn learn_then_classify_leans_spam() {
        let (_dir, c) = bayes_fixture();
        let spam_tokens = tokenize("buy cheap pills now amazing offer");
        let ham_tokens = tokenize("meeting agenda quarterly report attached");
        c.learn(&spam_tokens, true, 1.0).unwrap();
        c.learn(&ham_tokens, false, 1.0).unwrap();

        assert!(c.classify(&tokenize("cheap pills offer")) > 0.0);
        assert!(c.classify(&tokenize("quarterly report agenda")) < 0.0);
        // Never-seen tokens are neutral.
        assert_eq!(c.classify(&tokenize("zyxwvut qponmlk")), 0.0);
    }

    #[test]
    fn learn_updates_statfile_counts() {
        let (_dir, c) = bayes_fixture();
        let tokens = tokenize("duplicate duplicate duplicate word");
        let summary = c.learn(&tokens, true, 2.0).unwrap();
        assert_eq!(summary.tokens, 2); // "duplicate" and "word"
        let (count, weight) = c.spam.get(hash_token("duplicate")).unwrap();
        assert_eq!(count, 3);
        assert!((weight - 6.0).abs() < 1e-9);
    }

    #[test]
    fn empty_learn_is_an_error() {
        let (_dir, c) = bayes_fixture();
        assert!(matches!(
            c.learn(&[], true, 1.0),
            Err(ClassifierError::Learn(_))
        ));
    }

    #[test]
    fn unknown_classifier_identity() {
        let reg = ClassifierRegistry::new();
        assert!(matches!(
            reg.get("nope"),
            Err(ClassifierError::UnknownClassifier(_))
        ));
    }

    #[test]
    fn fuzzy_hash_tolerates_small_edits() {
        let a = fuzzy_hash("please wire the funds to this account immediately today");
        let b = fuzzy_hash("please wire the funds to this account immediately today thanks");
        let c = fuzzy_hash("completely different text about gardening and weather patterns");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
