//! Daemon configuration. The core only consumes resolved values; loading
//! and validation happen once at startup.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Metric every symbol lands in unless a rule says otherwise.
pub const DEFAULT_METRIC: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scan_listen: String,
    pub controller_listen: String,
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
    /// Per-connection I/O timeout, seconds.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// Watchdog bound on WaitFilter, seconds.
    #[serde(default = "default_filter_timeout")]
    pub filter_timeout_secs: u64,
    /// Grace period for in-flight tasks on shutdown, seconds.
    #[serde(default = "default_soft_shutdown")]
    pub soft_shutdown_secs: u64,

    pub statfile_dir: PathBuf,
    #[serde(default = "default_statfile_size")]
    pub statfile_size: u64,
    #[serde(default = "default_statfile_size")]
    pub fuzzy_size: u64,
    #[serde(default = "default_fuzzy_ttl")]
    pub fuzzy_ttl_secs: u64,
    #[serde(default = "default_fuzzy_sweep")]
    pub fuzzy_sweep_secs: u64,
    #[serde(default = "default_fuzzy_score")]
    pub fuzzy_score: f64,

    /// Controller sessions must present this before privileged commands.
    pub controller_password: Option<String>,

    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
    #[serde(default = "default_classifier")]
    pub classifier: ClassifierConfig,
    pub url_dnsbl: Option<UrlDnsblConfig>,

    /// Optional log sink; stderr when unset. SIGHUP reopens it.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub name: String,
    pub threshold: f64,
    pub subject_prefix: Option<String>,
}

/// One regex rule over a header (or the subject), contributing a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    pub symbol: String,
    #[serde(default = "default_metric_name")]
    pub metric: String,
    pub header: String,
    pub pattern: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub name: String,
    #[serde(default = "default_classifier_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlDnsblConfig {
    pub zone: String,
    pub score: f64,
}

fn default_scan_workers() -> usize {
    2
}
fn default_io_timeout() -> u64 {
    60
}
fn default_filter_timeout() -> u64 {
    10
}
fn default_soft_shutdown() -> u64 {
    10
}
fn default_statfile_size() -> u64 {
    4 * 1024 * 1024
}
fn default_fuzzy_ttl() -> u64 {
    10 * 24 * 3600
}
fn default_fuzzy_sweep() -> u64 {
    600
}
fn default_fuzzy_score() -> f64 {
    8.0
}
fn default_metric_name() -> String {
    DEFAULT_METRIC.to_string()
}
fn default_classifier_weight() -> f64 {
    1.0
}
fn default_metrics() -> Vec<MetricConfig> {
    vec![MetricConfig {
        name: DEFAULT_METRIC.to_string(),
        threshold: 10.0,
        subject_prefix: Some("*** SPAM *** ".to_string()),
    }]
}
fn default_classifier() -> ClassifierConfig {
    ClassifierConfig {
        name: "bayes".to_string(),
        weight: 1.0,
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan_listen: "127.0.0.1:11333".to_string(),
            controller_listen: "127.0.0.1:11334".to_string(),
            scan_workers: default_scan_workers(),
            io_timeout_secs: default_io_timeout(),
            filter_timeout_secs: default_filter_timeout(),
            soft_shutdown_secs: default_soft_shutdown(),
            statfile_dir: PathBuf::from("/var/lib/mailvet"),
            statfile_size: default_statfile_size(),
            fuzzy_size: default_statfile_size(),
            fuzzy_ttl_secs: default_fuzzy_ttl(),
            fuzzy_sweep_secs: default_fuzzy_sweep(),
            fuzzy_score: default_fuzzy_score(),
            controller_password: None,
            metrics: default_metrics(),
            header_rules: vec![HeaderRule {
                symbol: "FAKE_PRECEDENCE".to_string(),
                metric: DEFAULT_METRIC.to_string(),
                header: "Precedence".to_string(),
                pattern: r"(?i)junk|bulk".to_string(),
                score: 1.5,
            }],
            classifier: default_classifier(),
            url_dnsbl: None,
            log_file: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.metrics.is_empty() {
            anyhow::bail!("at least one metric must be configured");
        }
        if self.scan_workers == 0 {
            anyhow::bail!("scan_workers must be at least 1");
        }
        for m in &self.metrics {
            if m.threshold <= 0.0 {
                anyhow::bail!("metric {} threshold must be positive", m.name);
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> HashMap<String, f64> {
        self.metrics
            .iter()
            .map(|m| (m.name.clone(), m.threshold))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.metrics[0].name, DEFAULT_METRIC);
        assert_eq!(config.thresholds()[DEFAULT_METRIC], 10.0);
    }

    #[test]
    fn yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.scan_listen, config.scan_listen);
        assert_eq!(parsed.header_rules.len(), config.header_rules.len());
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let yaml = r#"
scan_listen: "0.0.0.0:11333"
controller_listen: "0.0.0.0:11334"
statfile_dir: /tmp/statfiles
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.io_timeout_secs, 60);
        assert_eq!(config.filter_timeout_secs, 10);
        assert_eq!(config.classifier.name, "bayes");
        assert_eq!(config.metrics.len(), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.metrics.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scan_workers = 0;
        assert!(config.validate().is_err());
    }
}
