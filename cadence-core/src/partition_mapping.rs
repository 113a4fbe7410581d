//! Partition mapping for asset dependencies
//!
//! A partition mapping is a pure function from a downstream partition key to
//! the set of upstream partition keys it reads. The forward direction
//! (upstream key to affected downstream keys) is derived from it and is what
//! the evaluator uses to propagate changes.
//!
//! - **Identity**: same key on both sides (daily -> daily)
//! - **AllPartitions**: every upstream partition (partitioned -> unpartitioned)
//! - **TimeWindow**: upstream windows overlapping the downstream window,
//!   optionally shifted (previous day) or widened (rolling 7 days)
//! - **Static**: explicit table of downstream key -> upstream keys
//! - **MultiToSingleDimension**: one dimension of a multi-partitioned asset
//!   lines up with a single-dimension asset
//!
//! # Example
//!
//! ```rust
//! use cadence_core::partition::{PartitionContext, PartitionKey, PartitionsDefinition, TimeWindowPartitions};
//! use cadence_core::partition_mapping::PartitionMapping;
//! use chrono::Utc;
//!
//! let daily = PartitionsDefinition::Time(TimeWindowPartitions::daily("2024-01-01", None).unwrap());
//! let ctx = PartitionContext::at(Utc::now());
//!
//! let previous_day = PartitionMapping::time_offset(-1);
//! let upstream = previous_day
//!     .upstream_keys(&PartitionKey::single("2024-01-15"), Some(&daily), Some(&daily), &ctx)
//!     .unwrap();
//! assert_eq!(upstream, vec![PartitionKey::single("2024-01-14")]);
//! ```

use crate::partition::{
    contains_key, keys_of, PartitionContext, PartitionError, PartitionKey, PartitionsDefinition,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partition mapping strategies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionMapping {
    /// Same partition key on both sides
    Identity,

    /// Every upstream partition
    AllPartitions,

    /// Upstream windows overlapping the downstream window shifted by
    /// `start_offset..=end_offset` downstream windows
    TimeWindow { start_offset: i64, end_offset: i64 },

    /// Explicit downstream key -> upstream keys table
    Static {
        mapping: BTreeMap<String, Vec<String>>,
    },

    /// A dimension of the multi-partitioned side matches the single side
    MultiToSingleDimension { dimension: String },
}

impl PartitionMapping {
    /// Upstream windows overlapping the same instant range
    pub fn overlapping() -> Self {
        PartitionMapping::TimeWindow {
            start_offset: 0,
            end_offset: 0,
        }
    }

    /// The window `offset` steps away (`-1` is the previous window)
    pub fn time_offset(offset: i64) -> Self {
        PartitionMapping::TimeWindow {
            start_offset: offset,
            end_offset: offset,
        }
    }

    /// The current window and the `size - 1` before it
    pub fn rolling_window(size: u32) -> Self {
        PartitionMapping::TimeWindow {
            start_offset: -(i64::from(size.max(1)) - 1),
            end_offset: 0,
        }
    }

    pub fn multi_to_single(dimension: impl Into<String>) -> Self {
        PartitionMapping::MultiToSingleDimension {
            dimension: dimension.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PartitionMapping::Identity => "identity",
            PartitionMapping::AllPartitions => "all_partitions",
            PartitionMapping::TimeWindow { .. } => "time_window",
            PartitionMapping::Static { .. } => "static",
            PartitionMapping::MultiToSingleDimension { .. } => "multi_to_single_dimension",
        }
    }

    /// Check the mapping can relate the two definitions
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(
        &self,
        upstream: Option<&PartitionsDefinition>,
        downstream: Option<&PartitionsDefinition>,
    ) -> Result<(), String> {
        match self {
            PartitionMapping::AllPartitions => Ok(()),
            PartitionMapping::Identity => match (upstream, downstream) {
                (None, None) => Ok(()),
                (Some(up), Some(down)) if identity_compatible(up, down) => Ok(()),
                _ => Err(format!(
                    "identity mapping needs matching partitions, got {} and {}",
                    describe(upstream),
                    describe(downstream)
                )),
            },
            PartitionMapping::TimeWindow {
                start_offset,
                end_offset,
            } => {
                if start_offset > end_offset {
                    return Err(format!(
                        "start offset {start_offset} is after end offset {end_offset}"
                    ));
                }
                match (upstream, downstream) {
                    (Some(PartitionsDefinition::Time(_)), Some(PartitionsDefinition::Time(_))) => {
                        Ok(())
                    }
                    _ => Err("time window mapping needs time partitions on both sides".to_string()),
                }
            }
            PartitionMapping::Static { mapping } => match (upstream, downstream) {
                (Some(up), Some(down))
                    if !matches!(up, PartitionsDefinition::Multi { .. })
                        && !matches!(down, PartitionsDefinition::Multi { .. }) =>
                {
                    if mapping.is_empty() {
                        Err("static mapping is empty".to_string())
                    } else {
                        Ok(())
                    }
                }
                _ => Err("static mapping needs one-dimensional partitions on both sides".to_string()),
            },
            PartitionMapping::MultiToSingleDimension { dimension } => {
                let (multi, single) = match (upstream, downstream) {
                    (Some(PartitionsDefinition::Multi { dimensions }), Some(other))
                    | (Some(other), Some(PartitionsDefinition::Multi { dimensions })) => {
                        (dimensions, other)
                    }
                    _ => {
                        return Err(
                            "multi-to-single mapping needs a multi-partitioned side".to_string()
                        )
                    }
                };
                if matches!(single, PartitionsDefinition::Multi { .. }) {
                    return Err("multi-to-single mapping needs one single-dimension side".to_string());
                }
                match multi.get(dimension) {
                    Some(dim) if identity_compatible(dim, single) => Ok(()),
                    Some(_) => Err(format!(
                        "dimension '{dimension}' does not match {}",
                        single.describe()
                    )),
                    None => Err(format!("no dimension named '{dimension}'")),
                }
            }
        }
    }

    /// Upstream keys read by one downstream key
    ///
    /// An empty result means the downstream key has no upstream partition to
    /// wait for; the evaluator decides what that means.
    pub fn upstream_keys(
        &self,
        downstream_key: &PartitionKey,
        upstream: Option<&PartitionsDefinition>,
        downstream: Option<&PartitionsDefinition>,
        ctx: &PartitionContext,
    ) -> Result<Vec<PartitionKey>, PartitionError> {
        match self {
            PartitionMapping::AllPartitions => keys_of(upstream, ctx),
            PartitionMapping::Identity => Ok(contains_key(upstream, downstream_key, ctx)
                .then(|| downstream_key.clone())
                .into_iter()
                .collect()),
            PartitionMapping::TimeWindow {
                start_offset,
                end_offset,
            } => {
                let (
                    Some(PartitionsDefinition::Time(up)),
                    Some(PartitionsDefinition::Time(down)),
                    PartitionKey::Single(key),
                ) = (upstream, downstream, downstream_key)
                else {
                    return Err(PartitionError::InvalidKey {
                        key: downstream_key.to_string(),
                        reason: "time window mapping needs time partition keys".to_string(),
                    });
                };
                let window = down.shifted_window(key, *start_offset, *end_offset)?;
                Ok(up
                    .keys_overlapping(&window)?
                    .into_iter()
                    .map(PartitionKey::Single)
                    .collect())
            }
            PartitionMapping::Static { mapping } => {
                let Some(key) = downstream_key.as_single() else {
                    return Ok(Vec::new());
                };
                Ok(mapping
                    .get(key)
                    .into_iter()
                    .flatten()
                    .map(|k| PartitionKey::single(k.as_str()))
                    .filter(|k| contains_key(upstream, k, ctx))
                    .collect())
            }
            PartitionMapping::MultiToSingleDimension { dimension } => match downstream_key {
                PartitionKey::Multi(_) => Ok(downstream_key
                    .dimension(dimension)
                    .map(PartitionKey::single)
                    .filter(|k| contains_key(upstream, k, ctx))
                    .into_iter()
                    .collect()),
                PartitionKey::Single(value) => Ok(keys_of(upstream, ctx)?
                    .into_iter()
                    .filter(|k| k.dimension(dimension) == Some(value.as_str()))
                    .collect()),
                PartitionKey::Unpartitioned => Ok(Vec::new()),
            },
        }
    }

    /// Downstream keys that read a given upstream key
    pub fn downstream_keys(
        &self,
        upstream_key: &PartitionKey,
        upstream: Option<&PartitionsDefinition>,
        downstream: Option<&PartitionsDefinition>,
        ctx: &PartitionContext,
    ) -> Result<Vec<PartitionKey>, PartitionError> {
        match self {
            PartitionMapping::AllPartitions => keys_of(downstream, ctx),
            PartitionMapping::Identity => Ok(contains_key(downstream, upstream_key, ctx)
                .then(|| upstream_key.clone())
                .into_iter()
                .collect()),
            PartitionMapping::MultiToSingleDimension { dimension } => match upstream_key {
                PartitionKey::Multi(_) => Ok(upstream_key
                    .dimension(dimension)
                    .map(PartitionKey::single)
                    .filter(|k| contains_key(downstream, k, ctx))
                    .into_iter()
                    .collect()),
                PartitionKey::Single(value) => Ok(keys_of(downstream, ctx)?
                    .into_iter()
                    .filter(|k| k.dimension(dimension) == Some(value.as_str()))
                    .collect()),
                PartitionKey::Unpartitioned => Ok(Vec::new()),
            },
            PartitionMapping::TimeWindow { .. } | PartitionMapping::Static { .. } => {
                let mut affected = Vec::new();
                for candidate in keys_of(downstream, ctx)? {
                    let reads = self.upstream_keys(&candidate, upstream, downstream, ctx)?;
                    if reads.contains(upstream_key) {
                        affected.push(candidate);
                    }
                }
                Ok(affected)
            }
        }
    }
}

fn describe(definition: Option<&PartitionsDefinition>) -> String {
    definition.map_or_else(|| "unpartitioned".to_string(), |d| d.describe())
}

/// Returns true if keys of one definition can be used as keys of the other
fn identity_compatible(a: &PartitionsDefinition, b: &PartitionsDefinition) -> bool {
    match (a, b) {
        (PartitionsDefinition::Time(x), PartitionsDefinition::Time(y)) => {
            x.granularity == y.granularity && x.timezone == y.timezone
        }
        (PartitionsDefinition::Static { .. }, PartitionsDefinition::Static { .. }) => true,
        (PartitionsDefinition::Dynamic { name: x }, PartitionsDefinition::Dynamic { name: y }) => {
            x == y
        }
        (
            PartitionsDefinition::Multi { dimensions: x },
            PartitionsDefinition::Multi { dimensions: y },
        ) => {
            x.len() == y.len()
                && x.iter().all(|(name, dim)| {
                    y.get(name)
                        .map_or(false, |other| identity_compatible(dim, other))
                })
        }
        _ => false,
    }
}

/// Mapping implied when a dependency declares none
///
/// An unpartitioned side reads or feeds every partition of the other side,
/// and matching definitions map by identity. Any other pairing has no
/// implied mapping and must declare one.
pub fn infer_mapping(
    upstream: Option<&PartitionsDefinition>,
    downstream: Option<&PartitionsDefinition>,
) -> Option<PartitionMapping> {
    match (upstream, downstream) {
        (None, _) | (_, None) => Some(PartitionMapping::AllPartitions),
        (Some(up), Some(down)) if up == down => Some(PartitionMapping::Identity),
        (Some(PartitionsDefinition::Time(up)), Some(PartitionsDefinition::Time(down)))
            if up.granularity == down.granularity && up.timezone == down.timezone =>
        {
            Some(PartitionMapping::Identity)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{DynamicPartitionsSnapshot, TimeWindowPartitions};
    use chrono::{DateTime, Utc};

    fn ctx() -> PartitionContext {
        PartitionContext::at(
            DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    fn daily() -> PartitionsDefinition {
        PartitionsDefinition::Time(TimeWindowPartitions::daily("2024-01-01", None).unwrap())
    }

    fn hourly() -> PartitionsDefinition {
        PartitionsDefinition::Time(TimeWindowPartitions::hourly("2024-01-01-00:00", None).unwrap())
    }

    fn date_by_region() -> PartitionsDefinition {
        PartitionsDefinition::multi([
            ("date", daily()),
            ("region", PartitionsDefinition::dynamic("regions")),
        ])
    }

    #[test]
    fn test_identity_mapping() {
        let key = PartitionKey::single("2024-01-15");
        let upstream = PartitionMapping::Identity
            .upstream_keys(&key, Some(&daily()), Some(&daily()), &ctx())
            .unwrap();
        assert_eq!(upstream, vec![key]);
    }

    #[test]
    fn test_identity_outside_upstream_bounds_is_empty() {
        let late = PartitionsDefinition::Time(TimeWindowPartitions::daily("2024-01-10", None).unwrap());
        let upstream = PartitionMapping::Identity
            .upstream_keys(
                &PartitionKey::single("2024-01-05"),
                Some(&late),
                Some(&daily()),
                &ctx(),
            )
            .unwrap();
        assert!(upstream.is_empty());
    }

    #[test]
    fn test_all_partitions_for_unpartitioned_downstream() {
        let upstream = PartitionMapping::AllPartitions
            .upstream_keys(&PartitionKey::Unpartitioned, Some(&daily()), None, &ctx())
            .unwrap();
        assert_eq!(upstream.len(), 31);

        let downstream = PartitionMapping::AllPartitions
            .downstream_keys(&PartitionKey::single("2024-01-02"), Some(&daily()), None, &ctx())
            .unwrap();
        assert_eq!(downstream, vec![PartitionKey::Unpartitioned]);
    }

    #[test]
    fn test_rolling_window() {
        let upstream = PartitionMapping::rolling_window(3)
            .upstream_keys(
                &PartitionKey::single("2024-01-10"),
                Some(&daily()),
                Some(&daily()),
                &ctx(),
            )
            .unwrap();
        assert_eq!(
            upstream,
            vec![
                PartitionKey::single("2024-01-08"),
                PartitionKey::single("2024-01-09"),
                PartitionKey::single("2024-01-10"),
            ]
        );
    }

    #[test]
    fn test_time_offset_forward_direction() {
        let downstream = PartitionMapping::time_offset(-1)
            .downstream_keys(
                &PartitionKey::single("2024-01-10"),
                Some(&daily()),
                Some(&daily()),
                &ctx(),
            )
            .unwrap();
        assert_eq!(downstream, vec![PartitionKey::single("2024-01-11")]);
    }

    #[test]
    fn test_hourly_to_daily_aggregation() {
        let mapping = PartitionMapping::overlapping();
        mapping.validate(Some(&hourly()), Some(&daily())).unwrap();

        let upstream = mapping
            .upstream_keys(
                &PartitionKey::single("2024-01-02"),
                Some(&hourly()),
                Some(&daily()),
                &ctx(),
            )
            .unwrap();
        assert_eq!(upstream.len(), 24);
    }

    #[test]
    fn test_static_mapping() {
        let mapping = PartitionMapping::Static {
            mapping: BTreeMap::from([(
                "emea".to_string(),
                vec!["uk".to_string(), "de".to_string()],
            )]),
        };
        let up = PartitionsDefinition::static_keys(["uk", "de", "us"]);
        let down = PartitionsDefinition::static_keys(["emea", "amer"]);
        mapping.validate(Some(&up), Some(&down)).unwrap();

        let upstream = mapping
            .upstream_keys(&PartitionKey::single("emea"), Some(&up), Some(&down), &ctx())
            .unwrap();
        assert_eq!(upstream.len(), 2);

        let downstream = mapping
            .downstream_keys(&PartitionKey::single("us"), Some(&up), Some(&down), &ctx())
            .unwrap();
        assert!(downstream.is_empty());
    }

    #[test]
    fn test_multi_to_single_dimension_both_directions() {
        let mut snapshot = DynamicPartitionsSnapshot::new();
        snapshot.extend("regions", ["us", "eu"]);
        let ctx = PartitionContext::new(ctx().now, snapshot);
        let mapping = PartitionMapping::multi_to_single("date");

        mapping.validate(Some(&daily()), Some(&date_by_region())).unwrap();
        let key = PartitionKey::multi([("date", "2024-01-03"), ("region", "eu")]);
        let upstream = mapping
            .upstream_keys(&key, Some(&daily()), Some(&date_by_region()), &ctx)
            .unwrap();
        assert_eq!(upstream, vec![PartitionKey::single("2024-01-03")]);

        let downstream = mapping
            .downstream_keys(
                &PartitionKey::single("2024-01-03"),
                Some(&daily()),
                Some(&date_by_region()),
                &ctx,
            )
            .unwrap();
        assert_eq!(downstream.len(), 2);
    }

    #[test]
    fn test_validate_rejects_mismatches() {
        assert!(PartitionMapping::Identity
            .validate(Some(&daily()), Some(&hourly()))
            .is_err());
        assert!(PartitionMapping::time_offset(-1)
            .validate(Some(&PartitionsDefinition::static_keys(["a"])), Some(&daily()))
            .is_err());
        assert!(PartitionMapping::multi_to_single("country")
            .validate(Some(&daily()), Some(&date_by_region()))
            .is_err());
        assert!(PartitionMapping::TimeWindow {
            start_offset: 1,
            end_offset: 0
        }
        .validate(Some(&daily()), Some(&daily()))
        .is_err());
    }

    #[test]
    fn test_infer_mapping() {
        assert_eq!(
            infer_mapping(None, Some(&daily())),
            Some(PartitionMapping::AllPartitions)
        );
        assert_eq!(
            infer_mapping(Some(&daily()), None),
            Some(PartitionMapping::AllPartitions)
        );
        assert_eq!(
            infer_mapping(Some(&daily()), Some(&daily())),
            Some(PartitionMapping::Identity)
        );
        assert_eq!(infer_mapping(Some(&hourly()), Some(&daily())), None);
        assert_eq!(
            infer_mapping(Some(&daily()), Some(&PartitionsDefinition::static_keys(["a"]))),
            None
        );
    }
}
