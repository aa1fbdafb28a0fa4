//! Run configuration: worker count, scoring weights, thresholds, bucket
//! strategy, dissector path override. Everything here is a parameter, not
//! a spec.md invariant — defaults match spec.md §4.D.4 exactly.
//!
//! Generalizes `thegwan-retina::config::load_config`, which every teacher
//! example binary calls immediately after `env_logger::init()`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CapMasterError, Result};

/// Weight assigned to each scoring feature (spec.md §4.D.4 table).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub syn_options: f64,
    pub client_isn: f64,
    pub server_isn: f64,
    pub tcp_timestamp: f64,
    pub client_payload_md5: f64,
    pub server_payload_md5: f64,
    pub length_signature: f64,
    pub ipid: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        ScoringWeights {
            syn_options: 0.25,
            client_isn: 0.12,
            server_isn: 0.06,
            tcp_timestamp: 0.10,
            client_payload_md5: 0.15,
            server_payload_md5: 0.08,
            length_signature: 0.08,
            ipid: 0.16,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.syn_options
            + self.client_isn
            + self.server_isn
            + self.tcp_timestamp
            + self.client_payload_md5
            + self.server_payload_md5
            + self.length_signature
            + self.ipid
    }
}

/// Per-feature weights for the behavioural fast path (spec.md §4.D.1).
/// Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BehaviouralWeights {
    pub iat: f64,
    pub duration: f64,
    pub byte_totals: f64,
}

impl Default for BehaviouralWeights {
    fn default() -> Self {
        BehaviouralWeights {
            iat: 0.5,
            duration: 0.2,
            byte_totals: 0.3,
        }
    }
}

/// Thresholds governing matcher acceptance (spec.md §4.D.4).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchThresholds {
    pub default_threshold: f64,
    pub microflow_threshold: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        MatchThresholds {
            default_threshold: 0.60,
            microflow_threshold: 0.75,
        }
    }
}

/// Bucketing strategy (spec.md §4.D.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketStrategy {
    Server,
    Port,
    None,
    Auto,
}

impl Default for BucketStrategy {
    fn default() -> Self {
        BucketStrategy::Auto
    }
}

/// Matcher mode (spec.md §4.D.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    OneToOne,
    OneToMany,
}

impl Default for MatchMode {
    fn default() -> Self {
        MatchMode::OneToOne
    }
}

/// Top-level run configuration, loadable from a TOML file; every field has
/// a spec-conformant default so an absent/empty file still runs correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool size for per-file and per-match parallelism (spec.md
    /// §5). `0` means "use the CPU count", resolved by [`Config::workers`].
    pub workers: usize,
    pub weights: ScoringWeights,
    pub behavioural_weights: BehaviouralWeights,
    pub thresholds: MatchThresholds,
    pub bucket_strategy: BucketStrategy,
    pub match_mode: MatchMode,
    /// Path to a service-list file (spec.md §6). `None` uses the built-in
    /// curated table in [`crate::server_detect::service_list`].
    pub service_list_path: Option<PathBuf>,
    /// Override for locating the dissector executable, independent of the
    /// `TSHARK_PATH` environment variable (spec.md §6).
    pub dissector_path: Option<PathBuf>,
    /// Minimum acceptable dissector version (spec.md §4.A).
    pub dissector_version_floor: String,
    /// Number of leading payload bytes hashed per direction (spec.md §9
    /// Open Questions: "the payload-hash byte budget is not clearly fixed
    /// in the source"). Chosen value, documented in DESIGN.md.
    pub payload_hash_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 0,
            weights: ScoringWeights::default(),
            behavioural_weights: BehaviouralWeights::default(),
            thresholds: MatchThresholds::default(),
            bucket_strategy: BucketStrategy::default(),
            match_mode: MatchMode::default(),
            service_list_path: None,
            dissector_path: None,
            dissector_version_floor: "3.0.0".to_string(),
            payload_hash_bytes: 256,
        }
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| CapMasterError::Config(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| CapMasterError::io(path, e))?;
        Self::from_toml_str(&contents)
    }

    /// Resolved worker count: the configured value, or the CPU count if
    /// `workers == 0` (spec.md §5: "default = CPU count, caller-configurable").
    pub fn workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_match_spec() {
        let w = ScoringWeights::default();
        assert!((w.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.thresholds.default_threshold, 0.60);
        assert_eq!(cfg.bucket_strategy, BucketStrategy::Auto);
    }

    #[test]
    fn workers_zero_resolves_to_cpu_count() {
        let cfg = Config::default();
        assert!(cfg.workers() >= 1);
    }
}
