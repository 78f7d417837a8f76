//! Resource lifecycle registry: dependency-ordered teardown of test data.
//!
//! The `resource_registry` tracking table is the source of truth; the
//! in-memory index is a cache of its live rows, rebuilt by
//! [`ResourceRegistry::open`] and refreshed at the start of every teardown
//! and expiry sweep. Resources registered by another registry or process,
//! including one that crashed, are therefore found by the next teardown.
//!
//! ```text
//! select(filter) -> sort (cleanup_order desc, seq desc)
//!   for each resource:
//!     no deleter for type           -> UnknownType       (kept)
//!     live children, not cascading  -> BlockedByChildren (kept)
//!     deleter fails                 -> Failed            (kept)
//!     deleter succeeds              -> Deleted           (retired)
//!       + cascade-safe deleter      -> descendants Cascaded (retired)
//! ```
//!
//! Deletion itself is domain-specific and supplied per resource type through
//! [`ResourceDeleter`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rusqlite::Connection;
use schemacheck_error::{Result, SchemaCheckError};
use schemacheck_types::{
    ResourceKey, ResourceSpec, TeardownFilter, TeardownOutcome, TeardownReport, TestResource,
    duration_ms, sort_for_teardown, unix_ms,
};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::tracking;

/// TTL for resources registered without one, unless configured otherwise.
pub const DEFAULT_RESOURCE_TTL: Duration = Duration::from_secs(3_600);

/// Error type returned by deletion operations.
pub type DeleteError = Box<dyn std::error::Error + Send + Sync>;

pub type DeleteResult = std::result::Result<(), DeleteError>;

/// Removes the database rows behind one resource type.
pub trait ResourceDeleter: Send + Sync {
    fn delete(&self, conn: &Connection, resource: &TestResource) -> DeleteResult;

    /// Whether deleting a resource also removes everything registered under
    /// it (e.g. `ON DELETE CASCADE`). Only then may a resource with live
    /// children be deleted.
    fn cascade_safe(&self) -> bool {
        false
    }
}

impl<F> ResourceDeleter for F
where
    F: Fn(&Connection, &TestResource) -> DeleteResult + Send + Sync,
{
    fn delete(&self, conn: &Connection, resource: &TestResource) -> DeleteResult {
        self(conn, resource)
    }
}

/// Marks a deleter as cascade-safe.
#[derive(Debug, Clone)]
pub struct CascadeDeleter<D>(pub D);

impl<D: ResourceDeleter> ResourceDeleter for CascadeDeleter<D> {
    fn delete(&self, conn: &Connection, resource: &TestResource) -> DeleteResult {
        self.0.delete(conn, resource)
    }

    fn cascade_safe(&self) -> bool {
        true
    }
}

/// Registry of test-created resources for one database.
pub struct ResourceRegistry {
    live: Mutex<BTreeMap<ResourceKey, TestResource>>,
    deleters: BTreeMap<String, Arc<dyn ResourceDeleter>>,
    default_ttl: Duration,
    /// Serializes teardowns and sweeps.
    teardown: Mutex<()>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("live", &self.live.lock().len())
            .field("deleters", &self.deleters.keys().collect::<Vec<_>>())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl ResourceRegistry {
    /// Create the tracking tables if needed and load every live record.
    pub fn open(conn: &Connection) -> Result<Self> {
        tracking::ensure_schema(conn)?;
        let registry = Self {
            live: Mutex::new(BTreeMap::new()),
            deleters: BTreeMap::new(),
            default_ttl: DEFAULT_RESOURCE_TTL,
            teardown: Mutex::new(()),
        };
        let loaded = registry.reload(conn)?;
        info!(live = loaded, "resource registry opened");
        Ok(registry)
    }

    /// [`Self::open`] with the configured default TTL.
    pub fn open_with_config(conn: &Connection, config: &EngineConfig) -> Result<Self> {
        Ok(Self::open(conn)?.with_default_ttl(config.resource_ttl()))
    }

    /// TTL applied to specs that do not set one.
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Register the deletion operation for `resource_type`, replacing any
    /// previous one.
    #[must_use]
    pub fn with_deleter(
        mut self,
        resource_type: impl Into<String>,
        deleter: impl ResourceDeleter + 'static,
    ) -> Self {
        self.set_deleter(resource_type, deleter);
        self
    }

    pub fn set_deleter(
        &mut self,
        resource_type: impl Into<String>,
        deleter: impl ResourceDeleter + 'static,
    ) {
        self.deleters.insert(resource_type.into(), Arc::new(deleter));
    }

    pub fn has_deleter(&self, resource_type: &str) -> bool {
        self.deleters.contains_key(resource_type)
    }

    /// Random identifier prefixed with the resource type, e.g.
    /// `tenant-3f09c1d2a7b4`.
    pub fn generate_id(resource_type: &str) -> String {
        format!(
            "{resource_type}-{:012x}",
            rand::random::<u64>() & 0xffff_ffff_ffff
        )
    }

    /// Replace the cache with the durable live rows. Returns their count.
    ///
    /// The rows are read while the cache is locked, so a concurrent
    /// `register` lands either in the rows read or after the refresh.
    pub fn reload(&self, conn: &Connection) -> Result<usize> {
        let mut live = self.live.lock();
        let records = tracking::load_active_resources(conn)?;
        live.clear();
        for record in records {
            live.insert(record.key(), record);
        }
        Ok(live.len())
    }

    /// Register a resource now.
    pub fn register(&self, conn: &Connection, spec: ResourceSpec) -> Result<TestResource> {
        self.register_at(conn, spec, unix_ms(SystemTime::now()))
    }

    /// Register a resource as of `registered_unix_ms`; it expires `spec.ttl`
    /// (or the default TTL) later. Fails on an already-live `(type, id)` pair.
    pub fn register_at(
        &self,
        conn: &Connection,
        spec: ResourceSpec,
        registered_unix_ms: u64,
    ) -> Result<TestResource> {
        if spec.resource_type.is_empty() || spec.id.is_empty() {
            return Err(SchemaCheckError::InvalidIdentifier {
                name: format!("{}/{}", spec.resource_type, spec.id),
                reason: "resource type and id must not be empty".to_owned(),
            });
        }
        let ttl = spec.ttl.unwrap_or(self.default_ttl);
        if ttl.is_zero() {
            return Err(SchemaCheckError::invalid_config(format!(
                "ttl for {}/{} must be positive",
                spec.resource_type, spec.id
            )));
        }
        let key = ResourceKey {
            resource_type: spec.resource_type.clone(),
            id: spec.id.clone(),
        };

        let mut live = self.live.lock();
        if live.contains_key(&key) {
            return Err(SchemaCheckError::DuplicateResource {
                resource_type: key.resource_type,
                id: key.id,
            });
        }
        let expires_unix_ms = registered_unix_ms.saturating_add(duration_ms(ttl));
        let seq = tracking::insert_resource(
            conn,
            &spec.resource_type,
            &spec.id,
            spec.parent_id.as_deref(),
            spec.scope_id.as_deref(),
            spec.cleanup_order,
            registered_unix_ms,
            expires_unix_ms,
        )?;
        let resource = TestResource {
            resource_type: spec.resource_type,
            id: spec.id,
            parent_id: spec.parent_id,
            scope_id: spec.scope_id,
            cleanup_order: spec.cleanup_order,
            registered_seq: seq,
            registered_unix_ms,
            expires_unix_ms,
        };
        live.insert(key, resource.clone());
        drop(live);

        debug!(
            resource_type = %resource.resource_type,
            id = %resource.id,
            parent = ?resource.parent_id,
            cleanup_order = resource.cleanup_order,
            seq,
            "resource registered"
        );
        Ok(resource)
    }

    /// Still-registered resources in registration order.
    pub fn active(&self) -> Vec<TestResource> {
        let mut resources: Vec<TestResource> = self.live.lock().values().cloned().collect();
        resources.sort_by_key(|resource| resource.registered_seq);
        resources
    }

    pub fn is_registered(&self, resource_type: &str, id: &str) -> bool {
        self.live.lock().contains_key(&ResourceKey {
            resource_type: resource_type.to_owned(),
            id: id.to_owned(),
        })
    }

    /// Delete every registered resource `filter` selects, children first.
    ///
    /// Best-effort: each failure is recorded and the remaining resources are
    /// still attempted. Resources that were not deleted stay registered, so
    /// calling teardown again retries exactly those.
    ///
    /// The selection is made from the durable records. If they cannot be
    /// read, the cached resources are torn down and the refresh failure is
    /// listed in the report's tracking errors.
    pub fn teardown(&self, conn: &Connection, filter: &TeardownFilter) -> TeardownReport {
        let _serial = self.teardown.lock();
        let mut report = TeardownReport::default();
        if let Err(err) = self.reload(conn) {
            warn!(error = %err, "registry not refreshed; tearing down cached resources");
            report.tracking_errors.push(format!("refresh: {err}"));
        }
        self.teardown_selected(conn, filter, report)
    }

    /// Tear down every resource whose TTL elapsed as of `now`, as recorded
    /// in the durable records.
    pub fn sweep_expired(&self, conn: &Connection, now: SystemTime) -> Result<TeardownReport> {
        let _serial = self.teardown.lock();
        self.reload(conn)?;
        let now_ms = unix_ms(now);
        debug!(now_unix_ms = now_ms, "sweeping expired resources");
        Ok(self.teardown_selected(
            conn,
            &TeardownFilter::expired_as_of(now_ms),
            TeardownReport::default(),
        ))
    }

    /// Teardown body. The caller holds the teardown lock.
    fn teardown_selected(
        &self,
        conn: &Connection,
        filter: &TeardownFilter,
        mut report: TeardownReport,
    ) -> TeardownReport {
        let mut selected: Vec<TestResource> = self
            .live
            .lock()
            .values()
            .filter(|resource| filter.matches(resource))
            .cloned()
            .collect();
        sort_for_teardown(&mut selected);

        let mut settled: BTreeSet<ResourceKey> = BTreeSet::new();
        for resource in selected {
            if settled.contains(&resource.key()) {
                continue;
            }
            let (outcome, cascaded) = self.teardown_one(conn, &resource, &mut report);
            settled.insert(resource.key());
            let ancestor_id = resource.id.clone();
            report.push(resource, outcome);
            for descendant in cascaded {
                settled.insert(descendant.key());
                report.push(
                    descendant,
                    TeardownOutcome::Cascaded {
                        ancestor_id: ancestor_id.clone(),
                    },
                );
            }
        }

        if report.is_clean() {
            info!(selected = report.entries.len(), "{}", report.triage_line());
        } else {
            warn!(selected = report.entries.len(), "{}", report.triage_line());
        }
        report
    }

    fn live_children(&self, parent: &TestResource) -> Vec<TestResource> {
        self.live
            .lock()
            .values()
            .filter(|candidate| {
                candidate.parent_id.as_deref() == Some(parent.id.as_str())
                    && candidate.key() != parent.key()
            })
            .cloned()
            .collect()
    }

    /// Every live resource below `root`, nearest first.
    fn live_descendants(&self, root: &TestResource) -> Vec<TestResource> {
        let mut found: Vec<TestResource> = Vec::new();
        let mut seen: BTreeSet<ResourceKey> = BTreeSet::from([root.key()]);
        let mut frontier = vec![root.clone()];
        while let Some(parent) = frontier.pop() {
            for child in self.live_children(&parent) {
                if seen.insert(child.key()) {
                    frontier.push(child.clone());
                    found.push(child);
                }
            }
        }
        found
    }

    /// Outcome for `resource` plus the descendants its deletion cascaded to.
    fn teardown_one(
        &self,
        conn: &Connection,
        resource: &TestResource,
        report: &mut TeardownReport,
    ) -> (TeardownOutcome, Vec<TestResource>) {
        let Some(deleter) = self.deleters.get(&resource.resource_type) else {
            warn!(
                resource_type = %resource.resource_type,
                id = %resource.id,
                "{}",
                SchemaCheckError::UnknownResourceType {
                    resource_type: resource.resource_type.clone(),
                }
            );
            return (TeardownOutcome::UnknownType, Vec::new());
        };

        let cascade = deleter.cascade_safe();
        let children = self.live_children(resource);
        if !children.is_empty() && !cascade {
            let children: Vec<String> = children
                .iter()
                .map(|child| child.key().to_string())
                .collect();
            warn!(
                resource_type = %resource.resource_type,
                id = %resource.id,
                ?children,
                "teardown blocked by registered children"
            );
            return (TeardownOutcome::BlockedByChildren { children }, Vec::new());
        }
        let descendants = if cascade {
            self.live_descendants(resource)
        } else {
            Vec::new()
        };

        if let Err(err) = deleter.delete(conn, resource) {
            warn!(
                resource_type = %resource.resource_type,
                id = %resource.id,
                error = %err,
                "resource deletion failed"
            );
            let reason = err.to_string();
            return (TeardownOutcome::Failed { reason }, Vec::new());
        }

        let now = unix_ms(SystemTime::now());
        self.retire(conn, resource, now, report);
        debug!(resource_type = %resource.resource_type, id = %resource.id, "resource deleted");
        for descendant in &descendants {
            self.retire(conn, descendant, now, report);
        }
        if !descendants.is_empty() {
            debug!(
                id = %resource.id,
                cascaded = descendants.len(),
                "descendants removed by cascade"
            );
        }
        (TeardownOutcome::Deleted, descendants)
    }

    /// Stamp the durable record, then drop the resource from the cache.
    fn retire(
        &self,
        conn: &Connection,
        resource: &TestResource,
        now_unix_ms: u64,
        report: &mut TeardownReport,
    ) {
        match tracking::mark_torn_down(conn, &resource.resource_type, &resource.id, now_unix_ms) {
            Ok(true) => {}
            Ok(false) => debug!(key = %resource.key(), "tracking record already retired"),
            Err(err) => {
                warn!(key = %resource.key(), error = %err, "tracking record not retired");
                report
                    .tracking_errors
                    .push(format!("{}: {err}", resource.key()));
            }
        }
        self.live.lock().remove(&resource.key());
    }
}
