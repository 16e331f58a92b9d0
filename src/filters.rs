//! Filter invocation: the `Filter` trait, per-task scan context, and the
//! chain driver with suspend/resume support.
//!
//! A filter runs against one task and either completes synchronously,
//! registers an async sub-operation with the task's session and lets the
//! chain continue (fan-out), or suspends the chain until its sub-operation
//! resolves (when later filters depend on the result). All contributions
//! land in the task's per-metric results.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::Notify;

use crate::classifier::{self, Classifier, WORD_TOKENIZER};
use crate::config::HeaderRule;
use crate::fuzzy::FuzzyStore;
use crate::message::ParsedMessage;
use crate::protocol::RequestMeta;
use crate::resolver::Resolver;
use crate::savepoint::{PendingItem, SavePoint};
use crate::session::AsyncSession;

#[derive(Debug, Clone)]
pub struct SymbolResult {
    pub name: String,
    pub score: f64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricResult {
    pub score: f64,
    pub symbols: Vec<SymbolResult>,
}

/// Everything a filter may read or contribute to for one task. The decoded
/// message is written once and read-only from then on.
pub struct ScanContext {
    pub message: ParsedMessage,
    pub meta: RequestMeta,
    pub session: Arc<AsyncSession>,
    /// Wakes the chain driver after a suspending filter resolves.
    pub resume: Notify,
    results: Mutex<HashMap<String, MetricResult>>,
    /// Token lists per tokenizer identity, computed once and shared.
    tokens: Mutex<HashMap<String, Arc<Vec<u64>>>>,
}

impl ScanContext {
    pub fn new(message: ParsedMessage, meta: RequestMeta, session: Arc<AsyncSession>) -> Self {
        ScanContext {
            message,
            meta,
            session,
            resume: Notify::new(),
            results: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_symbol(&self, metric: &str, name: &str, score: f64, description: Option<String>) {
        let mut results = self.results.lock();
        let m = results.entry(metric.to_string()).or_default();
        m.score += score;
        m.symbols.push(SymbolResult {
            name: name.to_string(),
            score,
            description,
        });
    }

    pub fn results_snapshot(&self) -> HashMap<String, MetricResult> {
        self.results.lock().clone()
    }

    /// Word tokens for this message, computed on first use.
    pub fn word_tokens(&self) -> Arc<Vec<u64>> {
        let mut tokens = self.tokens.lock();
        tokens
            .entry(WORD_TOKENIZER.to_string())
            .or_insert_with(|| Arc::new(classifier::tokenize_message(&self.message)))
            .clone()
    }

    /// Concatenated text content, the fuzzy hash input.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for part in self.message.text_parts() {
            out.push_str(&part.body);
            out.push('\n');
        }
        out
    }
}

pub enum FilterOutcome {
    /// Contribution recorded (or nothing to do).
    Completed,
    /// Sub-operation dispatched under the session; chain continues.
    Pending,
    /// Sub-operation dispatched; chain must wait for it before the next
    /// filter runs.
    Suspend,
}

pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, ctx: &Arc<ScanContext>) -> FilterOutcome;
}

pub struct FilterRegistry {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        FilterRegistry {
            filters: Vec::new(),
        }
    }

    pub fn register(&mut self, filter: Arc<dyn Filter>) {
        log::debug!("registered filter {}", filter.name());
        self.filters.push(filter);
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub enum ChainProgress {
    Done,
    Suspended,
}

/// Advance the filter chain from the save point (or the start). Filters
/// already run are never re-entered: their side effects must not repeat.
pub fn advance_chain(
    ctx: &Arc<ScanContext>,
    registry: &FilterRegistry,
    save: &mut SavePoint,
) -> ChainProgress {
    let start = match save.resume() {
        Some((pos, item)) => {
            log::debug!("resuming filter chain at {pos} after {}", item.filter);
            pos
        }
        None => 0,
    };
    for (i, filter) in registry.filters().iter().enumerate().skip(start) {
        match filter.run(ctx) {
            FilterOutcome::Completed | FilterOutcome::Pending => {}
            FilterOutcome::Suspend => {
                save.save(
                    i + 1,
                    PendingItem {
                        filter: filter.name().to_string(),
                    },
                );
                return ChainProgress::Suspended;
            }
        }
    }
    ChainProgress::Done
}

// ---------------------------------------------------------------------------
// Built-in filters
// ---------------------------------------------------------------------------

/// Regex rules over headers and subject, one symbol per match.
pub struct HeaderRuleFilter {
    rules: Vec<CompiledRule>,
}

struct CompiledRule {
    symbol: String,
    metric: String,
    header: String,
    pattern: Regex,
    score: f64,
}

impl HeaderRuleFilter {
    pub fn new(rules: &[HeaderRule]) -> anyhow::Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for r in rules {
            compiled.push(CompiledRule {
                symbol: r.symbol.clone(),
                metric: r.metric.clone(),
                header: r.header.clone(),
                pattern: Regex::new(&r.pattern)
                    .map_err(|e| anyhow::anyhow!("rule {}: {e}", r.symbol))?,
                score: r.score,
            });
        }
        Ok(HeaderRuleFilter { rules: compiled })
    }
}

impl Filter for HeaderRuleFilter {
    fn name(&self) -> &str {
        "header_rules"
    }

    fn run(&self, ctx: &Arc<ScanContext>) -> FilterOutcome {
        for rule in &self.rules {
            let value = if rule.header.eq_ignore_ascii_case("subject") {
                ctx.message.subject.as_deref()
            } else {
                ctx.message.header(&rule.header)
            };
            if let Some(v) = value {
                if rule.pattern.is_match(v) {
                    ctx.add_symbol(&rule.metric, &rule.symbol, rule.score, None);
                }
            }
        }
        FilterOutcome::Completed
    }
}

/// Statistical classification; degrades to a neutral contribution when the
/// statfiles are unusable.
pub struct BayesFilter {
    classifier: Arc<Classifier>,
    metric: String,
    weight: f64,
}

impl BayesFilter {
    pub fn new(classifier: Arc<Classifier>, metric: &str, weight: f64) -> Self {
        BayesFilter {
            classifier,
            metric: metric.to_string(),
            weight,
        }
    }
}

impl Filter for BayesFilter {
    fn name(&self) -> &str {
        "bayes"
    }

    fn run(&self, ctx: &Arc<ScanContext>) -> FilterOutcome {
        let tokens = ctx.word_tokens();
        if tokens.is_empty() {
            return FilterOutcome::Completed;
        }
        let score = self.classifier.classify(&tokens) * self.weight;
        if score > 0.0 {
            ctx.add_symbol(&self.metric, "BAYES_SPAM", score, None);
        } else if score < 0.0 {
            ctx.add_symbol(&self.metric, "BAYES_HAM", score, None);
        }
        FilterOutcome::Completed
    }
}

/// Near-duplicate check against the shared fuzzy store. The lookup touches
/// a cold mapping, so it runs off the event loop and the chain suspends
/// until it resolves.
pub struct FuzzyFilter {
    store: Arc<FuzzyStore>,
    metric: String,
    score: f64,
}

impl FuzzyFilter {
    pub fn new(store: Arc<FuzzyStore>, metric: &str, score: f64) -> Self {
        FuzzyFilter {
            store,
            metric: metric.to_string(),
            score,
        }
    }
}

impl Filter for FuzzyFilter {
    fn name(&self) -> &str {
        "fuzzy_check"
    }

    fn run(&self, ctx: &Arc<ScanContext>) -> FilterOutcome {
        let text = ctx.text_content();
        if text.trim().is_empty() {
            return FilterOutcome::Completed;
        }
        let hash = classifier::fuzzy_hash(&text);
        ctx.session.watch();
        let store = self.store.clone();
        let metric = self.metric.clone();
        let score = self.score;
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(meta) = store.lookup(hash) {
                ctx.add_symbol(
                    &metric,
                    "FUZZY_DENIED",
                    score,
                    Some(format!("flags:{} value:{}", meta.flags, meta.value)),
                );
            }
            ctx.resume.notify_one();
            ctx.session.finish();
        });
        FilterOutcome::Suspend
    }
}

/// Checks every URL host against a DNS blocklist zone. Pure fan-out: each
/// lookup registers with the session and the chain moves on.
pub struct UrlDnsFilter {
    resolver: Arc<Resolver>,
    zone: String,
    metric: String,
    score: f64,
    max_urls: usize,
}

impl UrlDnsFilter {
    pub fn new(resolver: Arc<Resolver>, zone: &str, metric: &str, score: f64) -> Self {
        UrlDnsFilter {
            resolver,
            zone: zone.to_string(),
            metric: metric.to_string(),
            score,
            max_urls: 10,
        }
    }
}

impl Filter for UrlDnsFilter {
    fn name(&self) -> &str {
        "url_dns"
    }

    fn run(&self, ctx: &Arc<ScanContext>) -> FilterOutcome {
        let mut hosts: Vec<String> = ctx
            .message
            .urls
            .iter()
            .filter_map(|u| u.host_str().map(|h| h.to_string()))
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts.truncate(self.max_urls);
        if hosts.is_empty() {
            return FilterOutcome::Completed;
        }

        for host in hosts {
            ctx.session.watch();
            let resolver = self.resolver.clone();
            let zone = self.zone.clone();
            let metric = self.metric.clone();
            let score = self.score;
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if resolver.host_listed(&host, &zone).await {
                    ctx.add_symbol(&metric, "URL_DNSBL", score, Some(host));
                }
                ctx.session.finish();
            });
        }
        FilterOutcome::Pending
    }
}
