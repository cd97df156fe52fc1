//! Every mutation of enrollment state flows through `run_unit`: one SQLite
//! transaction spanning the enrollment write, the occupancy adjustment and
//! the student's class pointer, followed by post-commit audit and cache
//! invalidation. Nothing else in the crate writes those rows.

use crate::model::OpError;
use rusqlite::{Connection, Transaction};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Student,
    Class,
    Enrollment,
}

impl Entity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Class => "class",
            Self::Enrollment => "enrollment",
        }
    }
}

/// Host-provided invalidation hook, called after commit for every entity the
/// unit touched. The sidecar itself keeps no occupancy caches; this exists
/// for the shell that embeds it.
pub trait CacheHooks {
    fn invalidate(&self, entity: Entity, id: &str);
}

pub struct NullCache;

impl CacheHooks for NullCache {
    fn invalidate(&self, _entity: Entity, _id: &str) {}
}

#[derive(Debug)]
pub struct AuditEntry {
    pub actor_id: String,
    pub action: String,
    pub resource_kind: Entity,
    pub resource_id: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Default)]
pub struct SideEffects {
    invalidations: Vec<(Entity, String)>,
    audits: Vec<AuditEntry>,
}

impl SideEffects {
    pub fn invalidate(&mut self, entity: Entity, id: &str) {
        self.invalidations.push((entity, id.to_string()));
    }

    pub fn audit(
        &mut self,
        actor_id: &str,
        action: &str,
        resource_kind: Entity,
        resource_id: &str,
        details: Option<serde_json::Value>,
    ) {
        self.audits.push(AuditEntry {
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            resource_kind,
            resource_id: resource_id.to_string(),
            details,
        });
    }
}

pub fn run_unit<T>(
    conn: &Connection,
    cache: &dyn CacheHooks,
    f: impl FnOnce(&Transaction, &mut SideEffects) -> Result<T, OpError>,
) -> Result<T, OpError> {
    let tx = conn.unchecked_transaction()?;
    let mut fx = SideEffects::default();
    let out = match f(&tx, &mut fx) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return Err(e);
        }
    };
    tx.commit()?;

    // Post-commit effects are best-effort: the unit is already durable and
    // audit/cache misses must not fail the caller's request.
    for entry in &fx.audits {
        let _ = write_audit(conn, entry);
    }
    for (entity, id) in &fx.invalidations {
        cache.invalidate(*entity, id);
    }
    Ok(out)
}

fn write_audit(conn: &Connection, entry: &AuditEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log(id, actor_id, action, resource_kind, resource_id, details, logged_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &entry.actor_id,
            &entry.action,
            entry.resource_kind.as_str(),
            &entry.resource_id,
            entry.details.as_ref().map(|d| d.to_string()),
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}
