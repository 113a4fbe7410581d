//! Partition model
//!
//! A partitions definition describes the discrete units over which an asset
//! can be materialized independently: time windows, static enumerations,
//! dynamic sets registered at runtime, and multi-dimensional combinations of
//! those. Partition keys are ordered, and enumeration of a definition always
//! yields keys in a stable order.
//!
//! Time windows are half-open intervals `[start, end)` computed in the wall
//! clock of the definition's timezone, so a daily window in `Europe/Berlin`
//! is 23 or 25 hours long across DST transitions.

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Encoded form of the single implicit partition of an unpartitioned asset
pub const UNPARTITIONED: &str = "__unpartitioned__";

const DIMENSION_SEPARATOR: char = '|';
const DIMENSION_ASSIGN: char = '=';

/// Errors raised while building or querying a partitions definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("Invalid partition key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Partition '{key}' does not exist in {definition}")]
    UnknownPartition { key: String, definition: String },

    #[error("Invalid partitions definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid partition selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Time arithmetic out of range at {0}")]
    OutOfRange(NaiveDateTime),
}

/// Identifier of one partition of an asset
///
/// Ordering is lexicographic for single keys and per-dimension for
/// multi-dimensional keys (dimensions are ordered by name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionKey {
    /// The single implicit partition of an unpartitioned asset
    Unpartitioned,

    /// A key in a one-dimensional definition
    Single(String),

    /// A tuple of per-dimension keys
    Multi(BTreeMap<String, String>),
}

impl PartitionKey {
    /// Create a single-dimension key
    pub fn single(key: impl Into<String>) -> Self {
        PartitionKey::Single(key.into())
    }

    /// Create a multi-dimensional key from `(dimension, key)` pairs
    pub fn multi<I, D, K>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = (D, K)>,
        D: Into<String>,
        K: Into<String>,
    {
        PartitionKey::Multi(
            dimensions
                .into_iter()
                .map(|(d, k)| (d.into(), k.into()))
                .collect(),
        )
    }

    /// Returns true for the implicit partition of an unpartitioned asset
    pub fn is_unpartitioned(&self) -> bool {
        matches!(self, PartitionKey::Unpartitioned)
    }

    /// Key of one dimension of a multi-dimensional key
    pub fn dimension(&self, name: &str) -> Option<&str> {
        match self {
            PartitionKey::Multi(dims) => dims.get(name).map(String::as_str),
            _ => None,
        }
    }

    /// Key of a single-dimension key
    pub fn as_single(&self) -> Option<&str> {
        match self {
            PartitionKey::Single(key) => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Unpartitioned => write!(f, "{UNPARTITIONED}"),
            PartitionKey::Single(key) => write!(f, "{key}"),
            PartitionKey::Multi(dims) => {
                let mut first = true;
                for (dim, key) in dims {
                    if !first {
                        write!(f, "{DIMENSION_SEPARATOR}")?;
                    }
                    write!(f, "{dim}{DIMENSION_ASSIGN}{key}")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for PartitionKey {
    type Err = PartitionError;

    /// Parse the encoded form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == UNPARTITIONED {
            return Ok(PartitionKey::Unpartitioned);
        }
        if s.is_empty() {
            return Err(PartitionError::InvalidKey {
                key: s.to_string(),
                reason: "partition key cannot be empty".to_string(),
            });
        }
        if !s.contains(DIMENSION_ASSIGN) {
            return Ok(PartitionKey::Single(s.to_string()));
        }

        let mut dims = BTreeMap::new();
        for segment in s.split(DIMENSION_SEPARATOR) {
            let (dim, key) =
                segment
                    .split_once(DIMENSION_ASSIGN)
                    .ok_or_else(|| PartitionError::InvalidKey {
                        key: s.to_string(),
                        reason: format!("segment '{segment}' is not of the form dimension=key"),
                    })?;
            if dim.is_empty() || key.is_empty() {
                return Err(PartitionError::InvalidKey {
                    key: s.to_string(),
                    reason: "dimension name and key must be non-empty".to_string(),
                });
            }
            if dims.insert(dim.to_string(), key.to_string()).is_some() {
                return Err(PartitionError::InvalidKey {
                    key: s.to_string(),
                    reason: format!("dimension '{dim}' appears more than once"),
                });
            }
        }
        Ok(PartitionKey::Multi(dims))
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        PartitionKey::Single(key.to_string())
    }
}

/// Validate a raw key registered for a static or dynamic dimension
pub fn validate_key(key: &str) -> Result<(), PartitionError> {
    let reason = if key.is_empty() {
        Some("partition key cannot be empty")
    } else if key == UNPARTITIONED {
        Some("partition key is reserved")
    } else if key.contains(DIMENSION_SEPARATOR) || key.contains(DIMENSION_ASSIGN) {
        Some("partition key cannot contain '|' or '='")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(PartitionError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Time granularity for time window partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGranularity {
    /// Hourly partitions, keyed `2024-01-15-09:00`
    Hourly,

    /// Daily partitions, keyed `2024-01-15`
    Daily,

    /// Weekly partitions starting on Monday, keyed by the Monday's date
    Weekly,

    /// Monthly partitions, keyed `2024-01`
    Monthly,

    /// Yearly partitions, keyed `2024`
    Yearly,
}

impl TimeGranularity {
    /// Format a window start as a partition key
    pub fn format_key(&self, start: NaiveDateTime) -> String {
        match self {
            TimeGranularity::Hourly => start.format("%Y-%m-%d-%H:%M").to_string(),
            TimeGranularity::Daily | TimeGranularity::Weekly => {
                start.format("%Y-%m-%d").to_string()
            }
            TimeGranularity::Monthly => start.format("%Y-%m").to_string(),
            TimeGranularity::Yearly => start.format("%Y").to_string(),
        }
    }

    /// Parse a partition key into the local start of its window
    ///
    /// Only the canonical form is accepted, so `2024-1-5` is rejected for
    /// a daily granularity.
    pub fn parse_key(&self, key: &str) -> Result<NaiveDateTime, PartitionError> {
        let invalid = |reason: String| PartitionError::InvalidKey {
            key: key.to_string(),
            reason,
        };

        let start = match self {
            TimeGranularity::Hourly => NaiveDateTime::parse_from_str(key, "%Y-%m-%d-%H:%M")
                .map_err(|e| invalid(e.to_string()))?,
            TimeGranularity::Daily | TimeGranularity::Weekly => {
                NaiveDate::parse_from_str(key, "%Y-%m-%d")
                    .map_err(|e| invalid(e.to_string()))?
                    .and_time(NaiveTime::default())
            }
            TimeGranularity::Monthly => NaiveDate::parse_from_str(&format!("{key}-01"), "%Y-%m-%d")
                .map_err(|e| invalid(e.to_string()))?
                .and_time(NaiveTime::default()),
            TimeGranularity::Yearly => {
                NaiveDate::parse_from_str(&format!("{key}-01-01"), "%Y-%m-%d")
                    .map_err(|e| invalid(e.to_string()))?
                    .and_time(NaiveTime::default())
            }
        };

        if self.truncate(start)? != start {
            return Err(invalid(format!("not aligned to a {self} boundary")));
        }
        if self.format_key(start) != key {
            return Err(invalid(format!(
                "expected canonical form '{}'",
                self.format_key(start)
            )));
        }
        Ok(start)
    }

    /// Align a local timestamp down to the start of its window
    pub fn truncate(&self, dt: NaiveDateTime) -> Result<NaiveDateTime, PartitionError> {
        let date = dt.date();
        let aligned = match self {
            TimeGranularity::Hourly => NaiveTime::from_hms_opt(dt.hour(), 0, 0)
                .map(|time| date.and_time(time)),
            TimeGranularity::Daily => Some(date.and_time(NaiveTime::default())),
            TimeGranularity::Weekly => {
                let back = Duration::days(i64::from(date.weekday().num_days_from_monday()));
                date.checked_sub_signed(back)
                    .map(|monday| monday.and_time(NaiveTime::default()))
            }
            TimeGranularity::Monthly => date
                .with_day(1)
                .map(|first| first.and_time(NaiveTime::default())),
            TimeGranularity::Yearly => NaiveDate::from_ymd_opt(date.year(), 1, 1)
                .map(|first| first.and_time(NaiveTime::default())),
        };
        aligned.ok_or(PartitionError::OutOfRange(dt))
    }

    /// Move an aligned window start by `steps` windows (negative moves back)
    pub fn advance(&self, start: NaiveDateTime, steps: i64) -> Result<NaiveDateTime, PartitionError> {
        let fixed = |unit: Duration| {
            i32::try_from(steps)
                .ok()
                .and_then(|n| unit.checked_mul(n))
                .and_then(|delta| start.checked_add_signed(delta))
        };
        let months = |per_step: i64| {
            let total = per_step.checked_mul(steps)?;
            let magnitude = Months::new(u32::try_from(total.unsigned_abs()).ok()?);
            if total >= 0 {
                start.checked_add_months(magnitude)
            } else {
                start.checked_sub_months(magnitude)
            }
        };

        let moved = match self {
            TimeGranularity::Hourly => fixed(Duration::hours(1)),
            TimeGranularity::Daily => fixed(Duration::days(1)),
            TimeGranularity::Weekly => fixed(Duration::weeks(1)),
            TimeGranularity::Monthly => months(1),
            TimeGranularity::Yearly => months(12),
        };
        moved.ok_or(PartitionError::OutOfRange(start))
    }
}

impl fmt::Display for TimeGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeGranularity::Hourly => "hourly",
            TimeGranularity::Daily => "daily",
            TimeGranularity::Weekly => "weekly",
            TimeGranularity::Monthly => "monthly",
            TimeGranularity::Yearly => "yearly",
        };
        write!(f, "{name}")
    }
}

/// A half-open time interval `[start, end)` in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Returns true if the instant falls inside the window
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Returns true if the two windows share any instant
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Convert a local wall-clock time to UTC
///
/// Ambiguous times (DST fall-back) resolve to the earlier instant. Times
/// inside a DST gap resolve to the first valid instant after the gap.
fn localize(tz: &Tz, local: NaiveDateTime) -> Result<DateTime<Utc>, PartitionError> {
    let mut probe = local;
    for _ in 0..4 {
        if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
            return Ok(dt.with_timezone(&Utc));
        }
        probe = probe
            .checked_add_signed(Duration::minutes(30))
            .ok_or(PartitionError::OutOfRange(local))?;
    }
    Err(PartitionError::OutOfRange(local))
}

/// Time window partitions between a start and an optional end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindowPartitions {
    /// Local start of the first window
    pub start: NaiveDateTime,

    /// Exclusive local end bound; windows starting at or after it do not exist
    pub end: Option<NaiveDateTime>,

    pub granularity: TimeGranularity,

    pub timezone: Tz,
}

impl TimeWindowPartitions {
    /// Create a definition from partition-key formatted bounds
    ///
    /// `end` is exclusive: `daily("2024-01-01", Some("2024-01-04"))` yields
    /// three partitions.
    pub fn new(
        granularity: TimeGranularity,
        start: &str,
        end: Option<&str>,
        timezone: Tz,
    ) -> Result<Self, PartitionError> {
        let start = granularity.parse_key(start)?;
        let end = end.map(|e| granularity.parse_key(e)).transpose()?;

        if let Some(end) = end {
            if end <= start {
                return Err(PartitionError::InvalidDefinition(format!(
                    "end {end} must be after start {start}"
                )));
            }
        }

        Ok(Self {
            start,
            end,
            granularity,
            timezone,
        })
    }

    /// Daily partitions in UTC
    pub fn daily(start: &str, end: Option<&str>) -> Result<Self, PartitionError> {
        Self::new(TimeGranularity::Daily, start, end, Tz::UTC)
    }

    /// Hourly partitions in UTC
    pub fn hourly(start: &str, end: Option<&str>) -> Result<Self, PartitionError> {
        Self::new(TimeGranularity::Hourly, start, end, Tz::UTC)
    }

    /// Window denoted by a key
    pub fn window(&self, key: &str) -> Result<TimeWindow, PartitionError> {
        let start = self.granularity.parse_key(key)?;
        if !self.in_bounds(start) {
            return Err(self.unknown(key));
        }
        self.window_at(start)
    }

    /// Window spanning `start_offset..=end_offset` windows relative to a key
    ///
    /// The shifted span is not clipped to this definition's bounds.
    pub fn shifted_window(
        &self,
        key: &str,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<TimeWindow, PartitionError> {
        let start = self.granularity.parse_key(key)?;
        if !self.in_bounds(start) {
            return Err(self.unknown(key));
        }
        let from = self.granularity.advance(start, start_offset)?;
        let to = self.granularity.advance(start, end_offset + 1)?;
        Ok(TimeWindow {
            start: localize(&self.timezone, from)?,
            end: localize(&self.timezone, to)?,
        })
    }

    fn window_at(&self, local_start: NaiveDateTime) -> Result<TimeWindow, PartitionError> {
        let local_end = self.granularity.advance(local_start, 1)?;
        Ok(TimeWindow {
            start: localize(&self.timezone, local_start)?,
            end: localize(&self.timezone, local_end)?,
        })
    }

    fn in_bounds(&self, local_start: NaiveDateTime) -> bool {
        local_start >= self.start && self.end.map_or(true, |end| local_start < end)
    }

    fn unknown(&self, key: &str) -> PartitionError {
        PartitionError::UnknownPartition {
            key: key.to_string(),
            definition: format!("{} partitions from {}", self.granularity, self.start),
        }
    }

    /// Keys of all windows that exist at `now`
    ///
    /// With an explicit end the full bounded range exists. Without one only
    /// windows that have completed by `now` exist.
    pub fn keys(&self, now: DateTime<Utc>) -> Result<Vec<String>, PartitionError> {
        let mut keys = Vec::new();
        let mut cursor = self.start;
        loop {
            match self.end {
                Some(end) if cursor >= end => break,
                Some(_) => {}
                None => {
                    if self.window_at(cursor)?.end > now {
                        break;
                    }
                }
            }
            keys.push(self.granularity.format_key(cursor));
            cursor = self.granularity.advance(cursor, 1)?;
        }
        Ok(keys)
    }

    /// Key of the most recent window that has completed by `now`
    ///
    /// Unlike [`keys`](Self::keys) this ignores windows of a bounded range
    /// that lie in the future.
    pub fn last_key(&self, now: DateTime<Utc>) -> Result<Option<String>, PartitionError> {
        let local_now = now.with_timezone(&self.timezone).naive_local();
        let mut cursor = self.granularity.truncate(local_now)?;
        if let Some(end) = self.end {
            cursor = cursor.min(end);
        }
        // Either the window containing `now` is still open or `end` is exclusive.
        cursor = self.granularity.advance(cursor, -1)?;
        while cursor >= self.start {
            if self.window_at(cursor)?.end <= now {
                return Ok(Some(self.granularity.format_key(cursor)));
            }
            cursor = self.granularity.advance(cursor, -1)?;
        }
        Ok(None)
    }

    /// Keys whose windows overlap a UTC interval, bounded by this definition
    pub fn keys_overlapping(&self, interval: &TimeWindow) -> Result<Vec<String>, PartitionError> {
        let local_start = interval.start.with_timezone(&self.timezone).naive_local();
        let mut cursor = self.granularity.truncate(local_start)?.max(self.start);
        let mut keys = Vec::new();
        loop {
            if self.end.map_or(false, |end| cursor >= end) {
                break;
            }
            let window = self.window_at(cursor)?;
            if window.start >= interval.end {
                break;
            }
            if window.overlaps(interval) {
                keys.push(self.granularity.format_key(cursor));
            }
            cursor = self.granularity.advance(cursor, 1)?;
        }
        Ok(keys)
    }

    /// Returns true if the key names a window of this definition
    pub fn has_key(&self, key: &str) -> bool {
        self.granularity
            .parse_key(key)
            .map(|start| self.in_bounds(start))
            .unwrap_or(false)
    }
}

/// Dynamic partition keys known at evaluation time, by set name
///
/// Keys keep their registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicPartitionsSnapshot {
    sets: HashMap<String, Vec<String>>,
}

impl DynamicPartitionsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append keys to a set, ignoring keys already present
    pub fn extend<I, K>(&mut self, name: &str, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let set = self.sets.entry(name.to_string()).or_default();
        for key in keys {
            let key = key.into();
            if !set.contains(&key) {
                set.push(key);
            }
        }
    }

    /// Keys of a set, empty if the set has never been registered
    pub fn keys(&self, name: &str) -> &[String] {
        self.sets.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, name: &str, key: &str) -> bool {
        self.keys(name).iter().any(|k| k == key)
    }
}

/// Runtime inputs needed to enumerate partitions
#[derive(Debug, Clone)]
pub struct PartitionContext {
    /// Evaluation instant; bounds open-ended time definitions
    pub now: DateTime<Utc>,

    /// Dynamic partition keys as of this evaluation
    pub dynamic: DynamicPartitionsSnapshot,
}

impl PartitionContext {
    pub fn new(now: DateTime<Utc>, dynamic: DynamicPartitionsSnapshot) -> Self {
        Self { now, dynamic }
    }

    /// Context with no dynamic partitions
    pub fn at(now: DateTime<Utc>) -> Self {
        Self::new(now, DynamicPartitionsSnapshot::new())
    }
}

/// Partitioning scheme of an asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionsDefinition {
    /// Time windows of fixed granularity
    Time(TimeWindowPartitions),

    /// A fixed, ordered list of keys
    Static { keys: Vec<String> },

    /// Keys registered at runtime under a named set
    Dynamic { name: String },

    /// Cartesian product of one-dimensional definitions, by dimension name
    Multi {
        dimensions: BTreeMap<String, PartitionsDefinition>,
    },
}

impl PartitionsDefinition {
    /// Static partitions from a list of keys
    pub fn static_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        PartitionsDefinition::Static {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Dynamic partitions under the given set name
    pub fn dynamic(name: impl Into<String>) -> Self {
        PartitionsDefinition::Dynamic { name: name.into() }
    }

    /// Multi-dimensional partitions from `(dimension, definition)` pairs
    pub fn multi<I, D>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = (D, PartitionsDefinition)>,
        D: Into<String>,
    {
        PartitionsDefinition::Multi {
            dimensions: dimensions.into_iter().map(|(d, p)| (d.into(), p)).collect(),
        }
    }

    /// Check the definition is well formed
    pub fn validate(&self) -> Result<(), PartitionError> {
        match self {
            PartitionsDefinition::Time(_) => Ok(()),
            PartitionsDefinition::Static { keys } => {
                if keys.is_empty() {
                    return Err(PartitionError::InvalidDefinition(
                        "static partitions need at least one key".to_string(),
                    ));
                }
                let mut seen = std::collections::HashSet::new();
                for key in keys {
                    validate_key(key)?;
                    if !seen.insert(key) {
                        return Err(PartitionError::InvalidDefinition(format!(
                            "duplicate static partition key '{key}'"
                        )));
                    }
                }
                Ok(())
            }
            PartitionsDefinition::Dynamic { name } => {
                if name.is_empty() {
                    return Err(PartitionError::InvalidDefinition(
                        "dynamic partitions need a name".to_string(),
                    ));
                }
                Ok(())
            }
            PartitionsDefinition::Multi { dimensions } => {
                if dimensions.len() < 2 {
                    return Err(PartitionError::InvalidDefinition(
                        "multi partitions need at least two dimensions".to_string(),
                    ));
                }
                for (name, dim) in dimensions {
                    validate_key(name)?;
                    if matches!(dim, PartitionsDefinition::Multi { .. }) {
                        return Err(PartitionError::InvalidDefinition(format!(
                            "dimension '{name}' cannot itself be multi-dimensional"
                        )));
                    }
                    dim.validate()?;
                }
                Ok(())
            }
        }
    }

    /// Short description used in errors and logs
    pub fn describe(&self) -> String {
        match self {
            PartitionsDefinition::Time(t) => format!("{} time partitions", t.granularity),
            PartitionsDefinition::Static { keys } => format!("{} static partitions", keys.len()),
            PartitionsDefinition::Dynamic { name } => format!("dynamic partitions '{name}'"),
            PartitionsDefinition::Multi { dimensions } => format!(
                "multi partitions ({})",
                dimensions.keys().cloned().collect::<Vec<_>>().join(" x ")
            ),
        }
    }

    /// All keys of the definition, in enumeration order
    pub fn keys(&self, ctx: &PartitionContext) -> Result<Vec<PartitionKey>, PartitionError> {
        match self {
            PartitionsDefinition::Multi { dimensions } => {
                let mut combos: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
                for (name, dim) in dimensions {
                    let values = dim.raw_keys(ctx)?;
                    let mut next = Vec::with_capacity(combos.len() * values.len());
                    for combo in &combos {
                        for value in &values {
                            let mut extended = combo.clone();
                            extended.insert(name.clone(), value.clone());
                            next.push(extended);
                        }
                    }
                    combos = next;
                }
                Ok(combos.into_iter().map(PartitionKey::Multi).collect())
            }
            _ => Ok(self
                .raw_keys(ctx)?
                .into_iter()
                .map(PartitionKey::Single)
                .collect()),
        }
    }

    fn raw_keys(&self, ctx: &PartitionContext) -> Result<Vec<String>, PartitionError> {
        match self {
            PartitionsDefinition::Time(t) => t.keys(ctx.now),
            PartitionsDefinition::Static { keys } => Ok(keys.clone()),
            PartitionsDefinition::Dynamic { name } => Ok(ctx.dynamic.keys(name).to_vec()),
            PartitionsDefinition::Multi { .. } => Err(PartitionError::InvalidDefinition(
                "nested multi partitions".to_string(),
            )),
        }
    }

    fn has_raw_key(&self, key: &str, ctx: &PartitionContext) -> bool {
        match self {
            PartitionsDefinition::Time(t) => t.has_key(key),
            PartitionsDefinition::Static { keys } => keys.iter().any(|k| k == key),
            PartitionsDefinition::Dynamic { name } => ctx.dynamic.contains(name, key),
            PartitionsDefinition::Multi { .. } => false,
        }
    }

    /// Returns true if the key belongs to this definition
    ///
    /// Time keys are checked against the definition's bounds only, not
    /// against `now`, so a key for an open window is still a member.
    pub fn contains(&self, key: &PartitionKey, ctx: &PartitionContext) -> bool {
        match (self, key) {
            (PartitionsDefinition::Multi { dimensions }, PartitionKey::Multi(parts)) => {
                dimensions.len() == parts.len()
                    && dimensions.iter().all(|(name, dim)| {
                        parts
                            .get(name)
                            .map_or(false, |value| dim.has_raw_key(value, ctx))
                    })
            }
            (PartitionsDefinition::Multi { .. }, _) => false,
            (def, PartitionKey::Single(key)) => def.has_raw_key(key, ctx),
            _ => false,
        }
    }

    /// Resolve a selector to concrete keys in enumeration order
    pub fn select(
        &self,
        selector: &PartitionSelector,
        ctx: &PartitionContext,
    ) -> Result<Vec<PartitionKey>, PartitionError> {
        match selector {
            PartitionSelector::All => self.keys(ctx),
            PartitionSelector::Keys(keys) => {
                for key in keys {
                    if !self.contains(key, ctx) {
                        return Err(PartitionError::UnknownPartition {
                            key: key.to_string(),
                            definition: self.describe(),
                        });
                    }
                }
                Ok(keys.clone())
            }
            PartitionSelector::Range { start, end } => {
                let all = self.keys(ctx)?;
                let position = |key: &PartitionKey| {
                    all.iter()
                        .position(|k| k == key)
                        .ok_or_else(|| PartitionError::UnknownPartition {
                            key: key.to_string(),
                            definition: self.describe(),
                        })
                };
                let from = position(start)?;
                let to = position(end)?;
                if from > to {
                    return Err(PartitionError::InvalidSelector {
                        selector: selector.to_string(),
                        reason: "range start comes after range end".to_string(),
                    });
                }
                Ok(all[from..=to].to_vec())
            }
        }
    }

    /// Window of a time partition key, if the definition is time based
    ///
    /// For multi partitions this is the window of the time dimension.
    pub fn time_window(&self, key: &PartitionKey) -> Option<TimeWindow> {
        match (self, key) {
            (PartitionsDefinition::Time(t), PartitionKey::Single(k)) => t.window(k).ok(),
            (PartitionsDefinition::Multi { dimensions }, PartitionKey::Multi(parts)) => {
                dimensions.iter().find_map(|(name, dim)| match dim {
                    PartitionsDefinition::Time(t) => parts.get(name).and_then(|k| t.window(k).ok()),
                    _ => None,
                })
            }
            _ => None,
        }
    }

    /// Keys whose freshness is tracked
    ///
    /// Time based definitions only track their most recent complete window
    /// (per combination of the other dimensions for multi partitions).
    /// Other definitions track every key.
    pub fn freshness_keys(&self, ctx: &PartitionContext) -> Result<Vec<PartitionKey>, PartitionError> {
        match self {
            PartitionsDefinition::Time(t) => Ok(t
                .last_key(ctx.now)?
                .map(PartitionKey::Single)
                .into_iter()
                .collect()),
            PartitionsDefinition::Multi { dimensions } => {
                let time_dim = dimensions.iter().find_map(|(name, dim)| match dim {
                    PartitionsDefinition::Time(t) => Some((name, t)),
                    _ => None,
                });
                let Some((name, time)) = time_dim else {
                    return self.keys(ctx);
                };
                let Some(latest) = time.last_key(ctx.now)? else {
                    return Ok(Vec::new());
                };
                Ok(self
                    .keys(ctx)?
                    .into_iter()
                    .filter(|key| key.dimension(name) == Some(latest.as_str()))
                    .collect())
            }
            _ => self.keys(ctx),
        }
    }
}

/// Keys of an optional definition; unpartitioned assets have one key
pub fn keys_of(
    definition: Option<&PartitionsDefinition>,
    ctx: &PartitionContext,
) -> Result<Vec<PartitionKey>, PartitionError> {
    match definition {
        Some(def) => def.keys(ctx),
        None => Ok(vec![PartitionKey::Unpartitioned]),
    }
}

/// Membership test for an optional definition
pub fn contains_key(
    definition: Option<&PartitionsDefinition>,
    key: &PartitionKey,
    ctx: &PartitionContext,
) -> bool {
    match definition {
        Some(def) => def.contains(key, ctx),
        None => key.is_unpartitioned(),
    }
}

/// Expression selecting partitions of one definition
///
/// Textual forms: `*` for all, `a..b` for an inclusive range in enumeration
/// order, and `a,b,c` for an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionSelector {
    All,
    Keys(Vec<PartitionKey>),
    Range { start: PartitionKey, end: PartitionKey },
}

impl PartitionSelector {
    /// Select one key
    pub fn key(key: impl Into<PartitionKey>) -> Self {
        PartitionSelector::Keys(vec![key.into()])
    }

    /// Parse a selector expression
    pub fn parse(expr: &str) -> Result<Self, PartitionError> {
        let expr = expr.trim();
        let invalid = |reason: &str| PartitionError::InvalidSelector {
            selector: expr.to_string(),
            reason: reason.to_string(),
        };

        if expr.is_empty() {
            return Err(invalid("empty selector"));
        }
        if expr == "*" {
            return Ok(PartitionSelector::All);
        }
        if let Some((start, end)) = expr.split_once("..") {
            let start = start.trim().parse::<PartitionKey>()?;
            let end = end.trim().parse::<PartitionKey>()?;
            return Ok(PartitionSelector::Range { start, end });
        }

        let keys = expr
            .split(',')
            .map(|k| k.trim().parse::<PartitionKey>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PartitionSelector::Keys(keys))
    }
}

impl fmt::Display for PartitionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionSelector::All => write!(f, "*"),
            PartitionSelector::Range { start, end } => write!(f, "{start}..{end}"),
            PartitionSelector::Keys(keys) => {
                let parts: Vec<String> = keys.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_daily_bounded_enumeration_is_end_exclusive() {
        let def = TimeWindowPartitions::daily("2024-01-01", Some("2024-01-04")).unwrap();
        let keys = def.keys(utc("2020-01-01T00:00:00Z")).unwrap();
        assert_eq!(keys, vec!["2024-01-01", "2024-01-02", "2024-01-03"]);
    }

    #[test]
    fn test_open_ended_enumeration_stops_at_last_complete_window() {
        let def = TimeWindowPartitions::daily("2024-01-01", None).unwrap();
        let keys = def.keys(utc("2024-01-03T12:00:00Z")).unwrap();
        assert_eq!(keys, vec!["2024-01-01", "2024-01-02"]);
        assert_eq!(
            def.last_key(utc("2024-01-03T12:00:00Z")).unwrap(),
            Some("2024-01-02".to_string())
        );
    }

    #[test]
    fn test_bounded_last_key_is_latest_completed_window() {
        let def = TimeWindowPartitions::daily("2024-01-01", Some("2024-12-31")).unwrap();
        assert_eq!(
            def.last_key(utc("2024-01-05T12:00:00Z")).unwrap(),
            Some("2024-01-04".to_string())
        );
        // Past the end, the final window of the range is the latest.
        assert_eq!(
            def.last_key(utc("2025-03-01T00:00:00Z")).unwrap(),
            Some("2024-12-30".to_string())
        );
        assert_eq!(def.last_key(utc("2024-01-01T08:00:00Z")).unwrap(), None);
        assert_eq!(def.last_key(utc("2023-06-01T00:00:00Z")).unwrap(), None);
    }

    #[test]
    fn test_advance_rejects_out_of_range_steps() {
        let start = TimeGranularity::Daily.parse_key("2024-01-01").unwrap();
        assert!(matches!(
            TimeGranularity::Daily.advance(start, i64::from(i32::MAX) + 1),
            Err(PartitionError::OutOfRange(_))
        ));
        assert!(matches!(
            TimeGranularity::Monthly.advance(start, i64::MIN),
            Err(PartitionError::OutOfRange(_))
        ));
        assert!(matches!(
            TimeGranularity::Yearly.advance(start, i64::from(u32::MAX)),
            Err(PartitionError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_window_is_half_open() {
        let def = TimeWindowPartitions::daily("2024-01-01", None).unwrap();
        let window = def.window("2024-01-02").unwrap();
        assert!(window.contains(utc("2024-01-02T00:00:00Z")));
        assert!(window.contains(utc("2024-01-02T23:59:59Z")));
        assert!(!window.contains(utc("2024-01-03T00:00:00Z")));
    }

    #[test]
    fn test_timezone_aware_boundaries() {
        let def = TimeWindowPartitions::new(
            TimeGranularity::Daily,
            "2024-03-30",
            None,
            chrono_tz::Europe::Berlin,
        )
        .unwrap();

        // DST starts on 2024-03-31 in Berlin, so that day has 23 hours.
        let window = def.window("2024-03-31").unwrap();
        assert_eq!(window.start, utc("2024-03-30T23:00:00Z"));
        assert_eq!(window.end, utc("2024-03-31T22:00:00Z"));
    }

    #[test]
    fn test_key_formats() {
        assert!(TimeGranularity::Hourly.parse_key("2024-01-15-09:00").is_ok());
        assert!(TimeGranularity::Hourly.parse_key("2024-01-15-09:30").is_err());
        assert!(TimeGranularity::Monthly.parse_key("2024-02").is_ok());
        assert!(TimeGranularity::Yearly.parse_key("2024").is_ok());
        assert!(TimeGranularity::Weekly.parse_key("2024-01-15").is_ok());
        // 2024-01-16 is a Tuesday.
        assert!(TimeGranularity::Weekly.parse_key("2024-01-16").is_err());
        assert!(TimeGranularity::Daily.parse_key("2024-1-5").is_err());
    }

    #[test]
    fn test_monthly_advance_handles_year_end() {
        let start = TimeGranularity::Monthly.parse_key("2023-12").unwrap();
        let next = TimeGranularity::Monthly.advance(start, 1).unwrap();
        assert_eq!(TimeGranularity::Monthly.format_key(next), "2024-01");
        let prev = TimeGranularity::Monthly.advance(start, -12).unwrap();
        assert_eq!(TimeGranularity::Monthly.format_key(prev), "2022-12");
    }

    #[test]
    fn test_keys_overlapping_across_granularities() {
        let hourly = TimeWindowPartitions::hourly("2024-01-01-00:00", None).unwrap();
        let day = TimeWindow {
            start: utc("2024-01-02T00:00:00Z"),
            end: utc("2024-01-03T00:00:00Z"),
        };
        let keys = hourly.keys_overlapping(&day).unwrap();
        assert_eq!(keys.len(), 24);
        assert_eq!(keys[0], "2024-01-02-00:00");
        assert_eq!(keys[23], "2024-01-02-23:00");
    }

    #[test]
    fn test_static_partitions_validation() {
        assert!(PartitionsDefinition::static_keys(["us", "eu"]).validate().is_ok());
        assert!(PartitionsDefinition::static_keys(["us", "us"]).validate().is_err());
        assert!(PartitionsDefinition::static_keys(["a|b"]).validate().is_err());
        let empty: Vec<String> = Vec::new();
        assert!(PartitionsDefinition::static_keys(empty).validate().is_err());
    }

    #[test]
    fn test_dynamic_partitions_read_from_snapshot() {
        let def = PartitionsDefinition::dynamic("regions");
        let mut snapshot = DynamicPartitionsSnapshot::new();
        let ctx = PartitionContext::new(Utc::now(), snapshot.clone());
        assert!(def.keys(&ctx).unwrap().is_empty());

        snapshot.extend("regions", ["us", "eu", "us"]);
        let ctx = PartitionContext::new(Utc::now(), snapshot);
        assert_eq!(
            def.keys(&ctx).unwrap(),
            vec![PartitionKey::single("us"), PartitionKey::single("eu")]
        );
    }

    #[test]
    fn test_multi_partition_enumeration_and_membership() {
        let def = PartitionsDefinition::multi([
            (
                "date",
                PartitionsDefinition::Time(
                    TimeWindowPartitions::daily("2024-01-01", Some("2024-01-03")).unwrap(),
                ),
            ),
            ("region", PartitionsDefinition::static_keys(["eu", "us"])),
        ]);
        def.validate().unwrap();

        let ctx = PartitionContext::at(Utc::now());
        let keys = def.keys(&ctx).unwrap();
        assert_eq!(keys.len(), 4);
        assert!(def.contains(
            &PartitionKey::multi([("date", "2024-01-02"), ("region", "us")]),
            &ctx
        ));
        assert!(!def.contains(
            &PartitionKey::multi([("date", "2024-01-02"), ("region", "apac")]),
            &ctx
        ));
    }

    #[test]
    fn test_partition_key_encoding() {
        let key = PartitionKey::multi([("region", "us"), ("date", "2024-01-01")]);
        assert_eq!(key.to_string(), "date=2024-01-01|region=us");
        assert_eq!("date=2024-01-01|region=us".parse::<PartitionKey>().unwrap(), key);
        assert_eq!(
            UNPARTITIONED.parse::<PartitionKey>().unwrap(),
            PartitionKey::Unpartitioned
        );
        assert!("date=|region=us".parse::<PartitionKey>().is_err());
    }

    #[test]
    fn test_multi_key_ordering_is_per_dimension() {
        let a = PartitionKey::multi([("date", "2024-01-01"), ("region", "us")]);
        let b = PartitionKey::multi([("date", "2024-01-02"), ("region", "eu")]);
        assert!(a < b);
    }

    #[test]
    fn test_selector_parse_and_resolve() {
        let def = PartitionsDefinition::Time(
            TimeWindowPartitions::daily("2024-01-01", Some("2024-01-10")).unwrap(),
        );
        let ctx = PartitionContext::at(Utc::now());

        let range = PartitionSelector::parse("2024-01-02..2024-01-04").unwrap();
        let keys = def.select(&range, &ctx).unwrap();
        assert_eq!(keys.len(), 3);

        let list = PartitionSelector::parse("2024-01-05, 2024-01-01").unwrap();
        assert_eq!(def.select(&list, &ctx).unwrap().len(), 2);

        assert_eq!(PartitionSelector::parse("*").unwrap(), PartitionSelector::All);

        let outside = PartitionSelector::parse("2025-01-01").unwrap();
        assert!(matches!(
            def.select(&outside, &ctx),
            Err(PartitionError::UnknownPartition { .. })
        ));

        let backwards = PartitionSelector::parse("2024-01-04..2024-01-02").unwrap();
        assert!(def.select(&backwards, &ctx).is_err());
    }

    #[test]
    fn test_freshness_keys_use_latest_time_window() {
        let def = PartitionsDefinition::Time(TimeWindowPartitions::daily("2024-01-01", None).unwrap());
        let ctx = PartitionContext::at(utc("2024-01-05T06:00:00Z"));
        assert_eq!(
            def.freshness_keys(&ctx).unwrap(),
            vec![PartitionKey::single("2024-01-04")]
        );

        let bounded = PartitionsDefinition::Time(
            TimeWindowPartitions::daily("2024-01-01", Some("2024-12-31")).unwrap(),
        );
        assert_eq!(
            bounded.freshness_keys(&ctx).unwrap(),
            vec![PartitionKey::single("2024-01-04")]
        );
    }
}
