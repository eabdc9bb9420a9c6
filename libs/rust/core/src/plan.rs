//! Federation plan: the static, per-process configuration shared by the
//! aggregator and every collaborator.
//!
//! Loaded through the `config` crate from a YAML file, with environment
//! overrides under `FEDLINK__` (e.g. `FEDLINK__AGGREGATOR__ADDRESS`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FederationError;
use crate::security::SecuritySettings;
use crate::task::TasksConfig;

pub const MAX_IDENTITY_LEN: usize = 128;
const MAX_PLAN_PATH_LEN: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationPlan {
    /// Maximum rounds a collaborator runs; 0 means unbounded.
    #[serde(default)]
    pub rounds: u64,
    #[serde(default)]
    pub collaborators: Vec<CollaboratorEntry>,
    pub aggregator: AggregatorEntry,
    #[serde(default)]
    pub initial_model: Option<PathBuf>,
    #[serde(default)]
    pub output_model: Option<PathBuf>,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub mode: ModeName,
    #[serde(default)]
    pub async_config: AsyncConfig,
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
    #[serde(default)]
    pub membership: MembershipPolicy,
    #[serde(default)]
    pub collaborator: CollaboratorSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub health_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorEntry {
    pub id: String,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorEntry {
    pub address: String,
    /// Sync mode only: force-close a round once it has been open this long
    /// with at least one pending update. Unset means rounds wait indefinitely.
    #[serde(default)]
    pub round_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeName {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncConfig {
    /// Reject async updates trained against a model more than this many rounds old.
    #[serde(default)]
    pub max_staleness: Option<u64>,
    /// Per-round decay applied to a stale update's influence.
    #[serde(default = "default_one")]
    pub staleness_weight: f64,
    /// Fraction of the way the model moves toward a fresh update.
    #[serde(default = "default_one")]
    pub mixing_rate: f64,
}

impl Default for AsyncConfig {
    fn default() -> Self { Self { max_staleness: None, staleness_weight: 1.0, mixing_rate: 1.0 } }
}

fn default_one() -> f64 { 1.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(default = "default_algorithm")]
    pub name: String,
    #[serde(default)]
    pub hyperparameters: BTreeMap<String, f64>,
}

impl Default for AlgorithmConfig {
    fn default() -> Self { Self { name: default_algorithm(), hyperparameters: BTreeMap::new() } }
}

fn default_algorithm() -> String { "mean".into() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipPolicy {
    /// Only identities listed under `collaborators` may join.
    #[serde(default)]
    pub strict: bool,
    /// Submissions from identities that never joined register them implicitly.
    #[serde(default)]
    pub auto_register: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorSettings {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_round_interval_ms")]
    pub round_interval_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Long-poll budget when fetching the next sync round's model.
    #[serde(default)]
    pub sync_wait_ms: u64,
    #[serde(default = "default_retries")]
    pub submit_retries: usize,
    #[serde(default = "default_retries")]
    pub refresh_retries: usize,
    /// Local training set size reported with each update (0 = unweighted).
    #[serde(default)]
    pub sample_count: u64,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            round_interval_ms: default_round_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            sync_wait_ms: 0,
            submit_retries: default_retries(),
            refresh_retries: default_retries(),
            sample_count: 0,
        }
    }
}

fn default_work_dir() -> PathBuf { PathBuf::from("models") }
fn default_round_interval_ms() -> u64 { 2_000 }
fn default_rpc_timeout_ms() -> u64 { 30_000 }
fn default_retries() -> usize { 3 }

impl CollaboratorSettings {
    pub fn round_interval(&self) -> Duration { Duration::from_millis(self.round_interval_ms) }
    pub fn rpc_timeout(&self) -> Duration { Duration::from_millis(self.rpc_timeout_ms) }
    pub fn sync_wait(&self) -> Duration { Duration::from_millis(self.sync_wait_ms) }
}

/// Coordination policy consumed by the round engine's transition function.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinationMode {
    /// A round closes once every joined collaborator has a pending update.
    Sync,
    /// Every accepted update is folded into the model and advances the round.
    Async { max_staleness: Option<u64> },
}

impl CoordinationMode {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinationMode::Sync => "sync",
            CoordinationMode::Async { .. } => "async",
        }
    }

    pub fn is_async(&self) -> bool { matches!(self, CoordinationMode::Async { .. }) }
}

impl FederationPlan {
    /// Load a plan file, applying `FEDLINK__*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FederationError> {
        let path = path.as_ref();
        validate_plan_path(path)?;
        let cfg = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml).required(true))
            .add_source(config::Environment::with_prefix("FEDLINK").separator("__"))
            .build()
            .map_err(|e| FederationError::Configuration(format!("failed to read plan {}: {e}", path.display())))?;
        Self::from_config(cfg)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, FederationError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Yaml))
            .build()
            .map_err(|e| FederationError::Configuration(format!("failed to parse plan: {e}")))?;
        Self::from_config(cfg)
    }

    fn from_config(cfg: config::Config) -> Result<Self, FederationError> {
        let plan: FederationPlan = cfg
            .try_deserialize()
            .map_err(|e| FederationError::Configuration(format!("invalid plan: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), FederationError> {
        if self.aggregator.address.trim().is_empty() {
            return Err(FederationError::Configuration("aggregator.address is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.collaborators {
            validate_identity(&c.id).map_err(|e| FederationError::Configuration(e.to_string()))?;
            if !seen.insert(c.id.as_str()) {
                return Err(FederationError::Configuration(format!("collaborator `{}` listed twice", c.id)));
            }
        }
        if self.membership.strict && self.collaborators.is_empty() {
            return Err(FederationError::Configuration("membership.strict requires a collaborator list".into()));
        }
        let a = &self.async_config;
        if !(a.staleness_weight > 0.0 && a.staleness_weight <= 1.0) || !(a.mixing_rate > 0.0 && a.mixing_rate <= 1.0) {
            return Err(FederationError::Configuration("async_config weights must be in (0, 1]".into()));
        }
        Ok(())
    }

    pub fn coordination_mode(&self) -> CoordinationMode {
        match self.mode {
            ModeName::Sync => CoordinationMode::Sync,
            ModeName::Async => CoordinationMode::Async { max_staleness: self.async_config.max_staleness },
        }
    }

    pub fn expected_identities(&self) -> impl Iterator<Item = &str> {
        self.collaborators.iter().map(|c| c.id.as_str())
    }

    pub fn lists_collaborator(&self, id: &str) -> bool { self.expected_identities().any(|c| c == id) }
}

/// Plan paths: no traversal, `.yaml`/`.yml` only, bounded length.
pub fn validate_plan_path(path: &Path) -> Result<(), FederationError> {
    let s = path.to_string_lossy();
    if s.len() > MAX_PLAN_PATH_LEN {
        return Err(FederationError::Configuration(format!("plan path too long (max {MAX_PLAN_PATH_LEN})")));
    }
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(FederationError::Configuration("plan path must not contain `..`".into()));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        _ => Err(FederationError::Configuration("plan file must be .yaml or .yml".into())),
    }
}

/// Identities: non-empty, at most 128 bytes of `[A-Za-z0-9._-]`, not made
/// of dots alone (identities name working directories).
pub fn validate_identity(id: &str) -> Result<(), FederationError> {
    if id.is_empty() || id.len() > MAX_IDENTITY_LEN {
        return Err(FederationError::InvalidArgument(format!("collaborator identity must be 1-{MAX_IDENTITY_LEN} bytes")));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(FederationError::InvalidArgument(format!("collaborator identity `{id}` contains forbidden characters")));
    }
    if id.chars().all(|c| c == '.') {
        return Err(FederationError::InvalidArgument(format!("collaborator identity `{id}` is reserved")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ArgValue;

    const PLAN: &str = r#"
rounds: 2
mode: async
collaborators:
  - id: c1
  - id: c2
aggregator:
  address: "127.0.0.1:50051"
initial_model: save/init_model.bin
tasks:
  train:
    script: scripts/train.py
    interpreter: python3
    args:
      epochs: 1
      learning_rate: 0.01
      optimizer: sgd
async_config:
  max_staleness: 4
  staleness_weight: 0.5
algorithm:
  name: fedprox
  hyperparameters:
    mu: 0.1
security:
  tls:
    enabled: false
    allow_insecure: true
"#;

    #[test]
    fn parses_full_plan() {
        let plan = FederationPlan::from_yaml_str(PLAN).unwrap();
        assert_eq!(plan.rounds, 2);
        assert_eq!(plan.coordination_mode(), CoordinationMode::Async { max_staleness: Some(4) });
        assert!(plan.lists_collaborator("c2"));
        assert!(!plan.lists_collaborator("c3"));
        assert_eq!(plan.algorithm.name, "fedprox");
        assert_eq!(plan.algorithm.hyperparameters.get("mu"), Some(&0.1));
        assert_eq!(plan.tasks.train.args.get("epochs"), Some(&ArgValue::Int(1)));
        assert_eq!(plan.tasks.train.args.get("optimizer"), Some(&ArgValue::Text("sgd".into())));
        assert_eq!(plan.async_config.mixing_rate, 1.0);
        assert_eq!(plan.collaborator.round_interval_ms, 2_000);
        assert!(plan.security.tls.allow_insecure);
    }

    #[test]
    fn mode_defaults_to_sync() {
        let plan = FederationPlan::from_yaml_str("aggregator:\n  address: \"localhost:50051\"\n").unwrap();
        assert_eq!(plan.coordination_mode(), CoordinationMode::Sync);
        assert_eq!(plan.rounds, 0);
        assert_eq!(plan.algorithm.name, "mean");
    }

    #[test]
    fn duplicate_collaborators_are_rejected() {
        let text = "aggregator:\n  address: \"a:1\"\ncollaborators:\n  - id: c1\n  - id: c1\n";
        assert!(matches!(FederationPlan::from_yaml_str(text), Err(FederationError::Configuration(_))));
    }

    #[test]
    fn plan_path_rules() {
        assert!(validate_plan_path(Path::new("plans/plan.yaml")).is_ok());
        assert!(validate_plan_path(Path::new("plan.yml")).is_ok());
        assert!(validate_plan_path(Path::new("../etc/plan.yaml")).is_err());
        assert!(validate_plan_path(Path::new("plan.json")).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        std::fs::write(&path, PLAN).unwrap();
        let plan = FederationPlan::load(&path).unwrap();
        assert_eq!(plan.collaborators.len(), 2);
    }

    #[test]
    fn identity_rules() {
        assert!(validate_identity("collab-1.eu_west").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("a b").is_err());
        assert!(validate_identity("..").is_err());
        assert!(validate_identity(&"x".repeat(MAX_IDENTITY_LEN + 1)).is_err());
    }
}
