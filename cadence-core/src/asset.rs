//! Asset definitions
//!
//! An asset is a named unit of data production. Its definition declares how
//! it is partitioned, which assets it reads from (optionally with a partition
//! mapping), how fresh it must be kept, which quality checks guard it, and
//! which compute tier should run it. Definitions are immutable once built.

use crate::freshness::FreshnessPolicy;
use crate::partition::PartitionsDefinition;
use crate::partition_mapping::PartitionMapping;
use crate::quality::CheckDefinition;
use crate::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

/// Unique key of an asset, e.g. `raw_orders` or `warehouse/clean_orders`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(String);

impl AssetKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for AssetKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for AssetKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Class of compute backend an asset should run on
///
/// Tiers differ only in latency and timeout expectations; the engine treats
/// every tier through the same executor contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeTier {
    /// Short-lived serverless function
    Function,

    /// Container task
    #[default]
    Container,

    /// Job on a managed cluster
    Cluster,

    /// Long-running batch job
    Batch,

    /// Tokio task inside the engine process, for development and tests
    InProcess,
}

impl ComputeTier {
    pub const ALL: [ComputeTier; 5] = [
        ComputeTier::Function,
        ComputeTier::Container,
        ComputeTier::Cluster,
        ComputeTier::Batch,
        ComputeTier::InProcess,
    ];

    /// Default max duration for runs on this tier
    pub fn default_max_duration(&self) -> Option<Duration> {
        match self {
            ComputeTier::Function => Some(Duration::from_secs(15 * 60)),
            ComputeTier::Container => Some(Duration::from_secs(2 * 60 * 60)),
            ComputeTier::Cluster => Some(Duration::from_secs(12 * 60 * 60)),
            ComputeTier::Batch => Some(Duration::from_secs(24 * 60 * 60)),
            ComputeTier::InProcess => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeTier::Function => "function",
            ComputeTier::Container => "container",
            ComputeTier::Cluster => "cluster",
            ComputeTier::Batch => "batch",
            ComputeTier::InProcess => "in_process",
        }
    }
}

impl fmt::Display for ComputeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ComputeTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComputeTier::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s)
            .ok_or_else(|| format!("unknown compute tier '{s}'"))
    }
}

/// Dependency on an upstream asset
#[derive(Debug, Clone, PartialEq)]
pub struct AssetDependency {
    pub upstream: AssetKey,

    /// Explicit partition mapping; `None` means infer (identity or all)
    pub mapping: Option<PartitionMapping>,
}

/// Immutable definition of an asset
#[derive(Debug, Clone)]
pub struct AssetDefinition {
    pub key: AssetKey,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub tags: Vec<String>,

    /// `None` means a single implicit partition
    pub partitions: Option<PartitionsDefinition>,

    /// Upstream dependencies, in declaration order
    pub dependencies: Vec<AssetDependency>,

    pub freshness: Option<FreshnessPolicy>,
    pub checks: Vec<CheckDefinition>,
    pub compute_tier: ComputeTier,

    /// Overrides the tier's default max duration
    pub max_duration: Option<Duration>,

    pub metadata: BTreeMap<String, String>,
}

impl AssetDefinition {
    /// Start building a definition
    pub fn builder(key: impl Into<AssetKey>) -> AssetBuilder {
        AssetBuilder::new(key)
    }

    /// Keys of direct upstream assets
    pub fn upstream_keys(&self) -> impl Iterator<Item = &AssetKey> {
        self.dependencies.iter().map(|d| &d.upstream)
    }

    pub fn dependency_on(&self, upstream: &AssetKey) -> Option<&AssetDependency> {
        self.dependencies.iter().find(|d| &d.upstream == upstream)
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitions.is_some()
    }

    /// Effective max duration: explicit override, else the tier default
    pub fn effective_max_duration(&self) -> Option<Duration> {
        self.max_duration.or_else(|| self.compute_tier.default_max_duration())
    }
}

/// Builder for asset definitions
pub struct AssetBuilder {
    key: AssetKey,
    description: Option<String>,
    owner: Option<String>,
    tags: Vec<String>,
    partitions: Option<PartitionsDefinition>,
    dependencies: Vec<AssetDependency>,
    freshness: Option<FreshnessPolicy>,
    checks: Vec<CheckDefinition>,
    compute_tier: ComputeTier,
    max_duration: Option<Duration>,
    metadata: BTreeMap<String, String>,
}

impl AssetBuilder {
    pub fn new(key: impl Into<AssetKey>) -> Self {
        Self {
            key: key.into(),
            description: None,
            owner: None,
            tags: Vec::new(),
            partitions: None,
            dependencies: Vec::new(),
            freshness: None,
            checks: Vec::new(),
            compute_tier: ComputeTier::default(),
            max_duration: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn partitions(mut self, partitions: PartitionsDefinition) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Depend on an upstream asset with an inferred partition mapping
    pub fn depends_on(mut self, upstream: impl Into<AssetKey>) -> Self {
        self.dependencies.push(AssetDependency {
            upstream: upstream.into(),
            mapping: None,
        });
        self
    }

    /// Depend on an upstream asset through an explicit partition mapping
    pub fn depends_on_with(
        mut self,
        upstream: impl Into<AssetKey>,
        mapping: PartitionMapping,
    ) -> Self {
        self.dependencies.push(AssetDependency {
            upstream: upstream.into(),
            mapping: Some(mapping),
        });
        self
    }

    pub fn freshness(mut self, policy: FreshnessPolicy) -> Self {
        self.freshness = Some(policy);
        self
    }

    pub fn check(mut self, check: CheckDefinition) -> Self {
        self.checks.push(check);
        self
    }

    pub fn compute_tier(mut self, tier: ComputeTier) -> Self {
        self.compute_tier = tier;
        self
    }

    pub fn max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate and build the definition
    ///
    /// Only checks that do not need the rest of the graph run here; unknown
    /// upstreams and partition mapping compatibility are checked when the
    /// graph is built.
    pub fn build(self) -> Result<AssetDefinition, ConfigurationError> {
        if self.key.as_str().trim().is_empty() {
            return Err(ConfigurationError::InvalidAsset {
                key: self.key,
                reason: "asset key cannot be empty".to_string(),
            });
        }

        if let Some(partitions) = &self.partitions {
            partitions
                .validate()
                .map_err(|e| ConfigurationError::InvalidPartitionsDefinition {
                    key: self.key.clone(),
                    reason: e.to_string(),
                })?;
        }

        let mut upstreams = HashSet::new();
        for dep in &self.dependencies {
            if dep.upstream == self.key {
                return Err(ConfigurationError::Cycle {
                    path: vec![self.key.clone(), self.key.clone()],
                });
            }
            if !upstreams.insert(&dep.upstream) {
                return Err(ConfigurationError::InvalidAsset {
                    key: self.key.clone(),
                    reason: format!("dependency on '{}' declared twice", dep.upstream),
                });
            }
        }

        let mut check_names = HashSet::new();
        for check in &self.checks {
            if !check_names.insert(check.name.as_str()) {
                return Err(ConfigurationError::DuplicateCheck {
                    key: self.key.clone(),
                    check: check.name.clone(),
                });
            }
        }

        Ok(AssetDefinition {
            key: self.key,
            description: self.description,
            owner: self.owner,
            tags: self.tags,
            partitions: self.partitions,
            dependencies: self.dependencies,
            freshness: self.freshness,
            checks: self.checks,
            compute_tier: self.compute_tier,
            max_duration: self.max_duration,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::TimeWindowPartitions;
    use crate::quality::CheckType;

    #[test]
    fn test_asset_builder() {
        let asset = AssetDefinition::builder("clean")
            .description("Cleaned orders")
            .owner("data-team")
            .tag("orders")
            .depends_on("raw")
            .compute_tier(ComputeTier::Function)
            .build()
            .unwrap();

        assert_eq!(asset.key, AssetKey::new("clean"));
        assert_eq!(asset.upstream_keys().collect::<Vec<_>>(), vec![&AssetKey::new("raw")]);
        assert_eq!(asset.compute_tier, ComputeTier::Function);
        assert!(!asset.is_partitioned());
    }

    #[test]
    fn test_effective_max_duration() {
        let asset = AssetDefinition::builder("a")
            .compute_tier(ComputeTier::Function)
            .build()
            .unwrap();
        assert_eq!(
            asset.effective_max_duration(),
            Some(Duration::from_secs(900))
        );

        let asset = AssetDefinition::builder("b")
            .compute_tier(ComputeTier::Function)
            .max_duration(Duration::from_secs(60))
            .build()
            .unwrap();
        assert_eq!(asset.effective_max_duration(), Some(Duration::from_secs(60)));

        let asset = AssetDefinition::builder("c")
            .compute_tier(ComputeTier::InProcess)
            .build()
            .unwrap();
        assert_eq!(asset.effective_max_duration(), None);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let result = AssetDefinition::builder("a").depends_on("a").build();
        assert!(matches!(result, Err(ConfigurationError::Cycle { .. })));
    }

    #[test]
    fn test_duplicate_check_names_rejected() {
        let result = AssetDefinition::builder("a")
            .check(CheckDefinition::new(
                "rows",
                CheckType::RowCount {
                    min: Some(1),
                    max: None,
                },
            ))
            .check(CheckDefinition::new(
                "rows",
                CheckType::RowCount {
                    min: None,
                    max: Some(10),
                },
            ))
            .build();
        assert!(matches!(result, Err(ConfigurationError::DuplicateCheck { .. })));
    }

    #[test]
    fn test_invalid_partitions_rejected() {
        let result = AssetDefinition::builder("a")
            .partitions(PartitionsDefinition::static_keys(["x", "x"]))
            .build();
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidPartitionsDefinition { .. })
        ));

        let ok = AssetDefinition::builder("b")
            .partitions(PartitionsDefinition::Time(
                TimeWindowPartitions::daily("2024-01-01", None).unwrap(),
            ))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_compute_tier_round_trip_names() {
        for tier in ComputeTier::ALL {
            assert_eq!(tier.as_str().parse::<ComputeTier>().unwrap(), tier);
        }
        assert!("gpu".parse::<ComputeTier>().is_err());
    }
}
