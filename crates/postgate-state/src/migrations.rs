//! SurrealDB schema migrations and initialization
//!
//! Sets up the reply job table with the constraints the scheduler relies on.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all postgate tables in SurrealDB
///
/// Called on every connection. Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing postgate SurrealDB schema");
    init_reply_jobs_table(db).await?;
    info!("postgate schema initialization complete");
    Ok(())
}

/// Initialize `reply_jobs` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE reply_jobs {
///   job_id:          STRING (unique)
///   comment_id:      STRING (indexed)
///   post_id:         STRING
///   status:          STRING (SCHEDULED | CANCELLED | RUNNING | DONE | FAILED)
///   active_slot:     STRING (unique; comment_id while non-terminal)
///   not_before_ms:   INT (epoch millis, indexed with status)
///   attempts:        INT
///   failure_reason:  STRING?
///   reply_id:        STRING?
///   created_at:      DATETIME
///   finished_at:     DATETIME?
/// }
/// ```
///
/// Constraints:
/// - `active_slot` is unique, so two non-terminal jobs for one comment cannot coexist
/// - transitions are conditional updates on `status` (enforced via app logic)
/// - terminal jobs are never deleted
async fn init_reply_jobs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing reply_jobs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS reply_jobs SCHEMALESS
            PERMISSIONS
                FOR select, create, update FULL,
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_job_id ON TABLE reply_jobs COLUMNS job_id UNIQUE;

        -- At most one in-flight job per comment
        DEFINE INDEX IF NOT EXISTS idx_active_slot ON TABLE reply_jobs COLUMNS active_slot UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_comment_id ON TABLE reply_jobs COLUMNS comment_id;

        -- Due-job scans
        DEFINE INDEX IF NOT EXISTS idx_status_not_before ON TABLE reply_jobs COLUMNS status, not_before_ms;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ reply_jobs table initialized");
    Ok(())
}
