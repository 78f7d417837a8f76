//! Test-resource records, teardown filters and the teardown report.
//!
//! Records are immutable once registered. Teardown order is decided here,
//! independent of any database: descending `cleanup_order`, then descending
//! registration sequence within a tier.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `(resource_type, id)`: the registry's primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// What a caller supplies to register a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub resource_type: String,
    pub id: String,
    /// Owning resource; it must outlive this one.
    pub parent_id: Option<String>,
    /// Tenant / workspace the resource belongs to.
    pub scope_id: Option<String>,
    /// Higher values are torn down first.
    pub cleanup_order: i32,
    /// `None` takes the registry's default TTL.
    pub ttl: Option<Duration>,
}

impl ResourceSpec {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            parent_id: None,
            scope_id: None,
            cleanup_order: 0,
            ttl: None,
        }
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub const fn cleanup_order(mut self, cleanup_order: i32) -> Self {
        self.cleanup_order = cleanup_order;
        self
    }

    pub const fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A registered resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResource {
    pub resource_type: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub scope_id: Option<String>,
    pub cleanup_order: i32,
    /// Monotonic registration sequence (durable row id).
    pub registered_seq: i64,
    pub registered_unix_ms: u64,
    pub expires_unix_ms: u64,
}

impl TestResource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
        }
    }

    pub const fn is_expired(&self, now_unix_ms: u64) -> bool {
        self.expires_unix_ms <= now_unix_ms
    }
}

/// Sort into teardown order: descending cleanup order, then most recently
/// registered first.
pub fn sort_for_teardown(resources: &mut [TestResource]) {
    resources.sort_by(|a, b| {
        b.cleanup_order
            .cmp(&a.cleanup_order)
            .then_with(|| b.registered_seq.cmp(&a.registered_seq))
    });
}

/// Which registered resources a teardown selects. Empty filter selects all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownFilter {
    pub resource_type: Option<String>,
    pub scope_id: Option<String>,
    pub expired_as_of_unix_ms: Option<u64>,
}

impl TeardownFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of_type(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: Some(resource_type.into()),
            ..Self::default()
        }
    }

    pub fn in_scope(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: Some(scope_id.into()),
            ..Self::default()
        }
    }

    pub fn expired_as_of(now_unix_ms: u64) -> Self {
        Self {
            expired_as_of_unix_ms: Some(now_unix_ms),
            ..Self::default()
        }
    }

    pub fn matches(&self, resource: &TestResource) -> bool {
        self.resource_type
            .as_ref()
            .is_none_or(|wanted| *wanted == resource.resource_type)
            && self
                .scope_id
                .as_ref()
                .is_none_or(|wanted| resource.scope_id.as_ref() == Some(wanted))
            && self
                .expired_as_of_unix_ms
                .is_none_or(|now| resource.is_expired(now))
    }
}

/// What happened to one selected resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TeardownOutcome {
    Deleted,
    /// The deletion operation failed; the resource stays registered.
    Failed { reason: String },
    /// No deletion operation for this type; skipped and still registered.
    UnknownType,
    /// Children are still registered; skipped and still registered.
    BlockedByChildren { children: Vec<String> },
    /// Removed by a cascade-safe deletion of an ancestor.
    Cascaded { ancestor_id: String },
}

/// One line of a teardown report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownEntry {
    pub resource: TestResource,
    pub outcome: TeardownOutcome,
}

/// Per-resource outcomes of a teardown or sweep, in attempt order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub entries: Vec<TeardownEntry>,
    /// Resources deleted whose tracking record could not be retired.
    pub tracking_errors: Vec<String>,
}

impl TeardownReport {
    pub fn push(&mut self, resource: TestResource, outcome: TeardownOutcome) {
        self.entries.push(TeardownEntry { resource, outcome });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn count(&self, predicate: impl Fn(&TeardownOutcome) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.outcome))
            .count()
    }

    pub fn deleted_count(&self) -> usize {
        self.count(|outcome| {
            matches!(
                outcome,
                TeardownOutcome::Deleted | TeardownOutcome::Cascaded { .. }
            )
        })
    }

    pub fn failed_count(&self) -> usize {
        self.count(|outcome| matches!(outcome, TeardownOutcome::Failed { .. }))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|outcome| {
            matches!(
                outcome,
                TeardownOutcome::UnknownType | TeardownOutcome::BlockedByChildren { .. }
            )
        })
    }

    /// Everything selected was removed and every record retired.
    pub fn is_clean(&self) -> bool {
        self.failed_count() == 0 && self.skipped_count() == 0 && self.tracking_errors.is_empty()
    }

    pub fn outcome_of(&self, resource_type: &str, id: &str) -> Option<&TeardownOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.resource.resource_type == resource_type && entry.resource.id == id)
            .map(|entry| &entry.outcome)
    }

    /// Keys in the order deletion was attempted.
    pub fn attempt_order(&self) -> Vec<ResourceKey> {
        self.entries.iter().map(|entry| entry.resource.key()).collect()
    }

    pub fn triage_line(&self) -> String {
        format!(
            "{}: {} selected, {} deleted, {} failed, {} skipped, {} tracking errors",
            if self.is_clean() { "CLEAN" } else { "PARTIAL" },
            self.entries.len(),
            self.deleted_count(),
            self.failed_count(),
            self.skipped_count(),
            self.tracking_errors.len(),
        )
    }
}
