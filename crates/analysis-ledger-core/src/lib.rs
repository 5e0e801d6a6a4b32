use std::fmt::{Display, Formatter};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Previous-root value carried by the first cycle summary of a ledger.
///
/// Hex SHA-256 output never consists solely of zeros, so this value cannot
/// collide with a real root.
pub const GENESIS_ROOT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Record kind used for persisted Merkle snapshots.
pub const MERKLE_SNAPSHOT_KIND: &str = "merkle_snapshot";

/// Prefix of record kinds written by the cycle pipeline itself.
pub const PHASE_KIND_PREFIX: &str = "phase.";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("ledger is in safe mode: {0}")]
    SafeMode(String),
    #[error("ledger has not been verified since open; run bootstrap first")]
    NotInitialized,
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub id: Ulid,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub hash: String,
}

impl LogRecord {
    /// Builds a record, hashing the canonical form of `data`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for an empty kind and
    /// [`LedgerError::Serialization`] when the payload cannot be encoded.
    pub fn new(kind: &str, data: Value, timestamp: OffsetDateTime) -> Result<Self, LedgerError> {
        if kind.trim().is_empty() {
            return Err(LedgerError::Validation(
                "record kind MUST be non-empty".to_string(),
            ));
        }

        let hash = content_hash(&data)?;
        Ok(Self {
            id: Ulid::new(),
            kind: kind.to_string(),
            data,
            timestamp: timestamp.to_offset(UtcOffset::UTC),
            hash,
        })
    }

    /// Recomputes the content hash and compares it with the stored one.
    ///
    /// # Errors
    /// Returns [`LedgerError::Serialization`] when the payload cannot be encoded.
    pub fn hash_matches(&self) -> Result<bool, LedgerError> {
        Ok(content_hash(&self.data)? == self.hash)
    }

    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        self.kind == MERKLE_SNAPSHOT_KIND
    }

    #[must_use]
    pub fn is_phase_output(&self) -> bool {
        self.kind.starts_with(PHASE_KIND_PREFIX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerkleSnapshot {
    pub root: String,
    pub count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl MerkleSnapshot {
    /// Builds a snapshot over the ordered record hashes.
    #[must_use]
    pub fn over(hashes: &[String], timestamp: OffsetDateTime) -> Self {
        Self {
            root: compute_root(hashes),
            count: hashes.len(),
            timestamp: timestamp.to_offset(UtcOffset::UTC),
        }
    }

    /// Decodes a snapshot from a `merkle_snapshot` record payload.
    ///
    /// # Errors
    /// Returns [`LedgerError::Serialization`] when the payload shape is wrong.
    pub fn from_record(record: &LogRecord) -> Result<Self, LedgerError> {
        serde_json::from_value(record.data.clone()).map_err(|err| {
            LedgerError::Serialization(format!("invalid merkle snapshot payload: {err}"))
        })
    }

    /// # Errors
    /// Returns [`LedgerError::Serialization`] when encoding fails.
    pub fn to_value(&self) -> Result<Value, LedgerError> {
        serde_json::to_value(self).map_err(|err| LedgerError::Serialization(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseDigest {
    pub hash: String,
    pub count: u64,
}

/// Phase digests in pipeline order.
///
/// Serialized as a JSON object whose key order is the pipeline order; the
/// cycle root depends on that order, so it must survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseDigests(Vec<(String, PhaseDigest)>);

impl PhaseDigests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a phase digest.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for empty or duplicate phase names.
    pub fn push(&mut self, name: &str, digest: PhaseDigest) -> Result<(), LedgerError> {
        if name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "phase name MUST be non-empty".to_string(),
            ));
        }
        if self.get(name).is_some() {
            return Err(LedgerError::Validation(format!(
                "duplicate phase name: {name}"
            )));
        }
        self.0.push((name.to_string(), digest));
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PhaseDigest> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, digest)| digest)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PhaseDigest)> {
        self.0.iter().map(|(name, digest)| (name.as_str(), digest))
    }

    #[must_use]
    pub fn hashes(&self) -> Vec<String> {
        self.0.iter().map(|(_, digest)| digest.hash.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for PhaseDigests {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, digest) in &self.0 {
            map.serialize_entry(name, digest)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PhaseDigests {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PhaseDigestsVisitor;

        impl<'de> Visitor<'de> for PhaseDigestsVisitor {
            type Value = PhaseDigests;

            fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of phase name to {hash, count}")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut digests = PhaseDigests::new();
                while let Some((name, digest)) = access.next_entry::<String, PhaseDigest>()? {
                    digests
                        .push(&name, digest)
                        .map_err(serde::de::Error::custom)?;
                }
                Ok(digests)
            }
        }

        deserializer.deserialize_map(PhaseDigestsVisitor)
    }
}

/// Input to `append_cycle`: the per-phase hashes and counts of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleInput {
    pub phases: PhaseDigests,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub cycle_id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub phases: PhaseDigests,
    pub merkle_root: String,
    pub prev_merkle_root: String,
}

impl CycleSummary {
    /// Root recomputed from the stored phase hashes.
    #[must_use]
    pub fn recompute_root(&self) -> String {
        compute_root(&self.phases.hashes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub name: String,
    pub duration_ms: u64,
    pub success: bool,
    pub item_count: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl PhaseResult {
    #[must_use]
    pub fn succeeded(name: &str, duration_ms: u64, item_count: u64) -> Self {
        Self {
            name: name.to_string(),
            duration_ms,
            success: true,
            item_count,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(name: &str, duration_ms: u64, error: String) -> Self {
        Self {
            name: name.to_string(),
            duration_ms,
            success: false,
            item_count: 0,
            error: Some(error),
        }
    }
}

/// Ledger lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum LedgerState {
    Uninitialized,
    Active,
    SafeMode(String),
}

impl LedgerState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Active => "active",
            Self::SafeMode(_) => "safe_mode",
        }
    }

    #[must_use]
    pub fn is_safe_mode(&self) -> bool {
        matches!(self, Self::SafeMode(_))
    }
}

impl Display for LedgerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SafeMode(reason) => write!(f, "safe_mode ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Returns a copy of `value` with every object's keys sorted recursively.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serializes the canonical form of `value`.
///
/// # Errors
/// Returns [`LedgerError::Serialization`] when encoding fails.
pub fn canonical_json(value: &Value) -> Result<String, LedgerError> {
    serde_json::to_string(&canonicalize(value))
        .map_err(|err| LedgerError::Serialization(err.to_string()))
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn hash_str(value: &str) -> String {
    hash_bytes(value.as_bytes())
}

/// Content hash of a payload, independent of object key order.
///
/// # Errors
/// Returns [`LedgerError::Serialization`] when encoding fails.
pub fn content_hash(value: &Value) -> Result<String, LedgerError> {
    Ok(hash_str(&canonical_json(value)?))
}

/// Deterministic hash over an ordered item list.
///
/// # Errors
/// Returns [`LedgerError::Serialization`] when encoding fails.
pub fn hash_batch(items: &[Value]) -> Result<String, LedgerError> {
    content_hash(&Value::Array(items.to_vec()))
}

/// Hash contributed by a phase that produced nothing.
#[must_use]
pub fn empty_batch_hash() -> String {
    hash_str("[]")
}

/// Binary Merkle root over hex hash strings.
///
/// Adjacent hashes are concatenated and hashed; an odd tail is paired with
/// itself. `[]` yields `""` and `[h]` yields `h`.
#[must_use]
pub fn compute_root(hashes: &[String]) -> String {
    match hashes {
        [] => String::new(),
        [single] => single.clone(),
        _ => {
            let mut level = hashes.to_vec();
            while level.len() > 1 {
                level = level
                    .chunks(2)
                    .map(|pair| match pair {
                        [left, right] => hash_str(&format!("{left}{right}")),
                        [left] => hash_str(&format!("{left}{left}")),
                        _ => String::new(),
                    })
                    .collect();
            }
            level.pop().unwrap_or_default()
        }
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
