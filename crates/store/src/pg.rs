//! PostgreSQL store.
//!
//! Runtime `sqlx` queries against the tables created by the workspace
//! migrations. Reservations and leases are single `INSERT ... ON CONFLICT`
//! statements, so the database arbitrates between concurrent workers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use atmo_core::config::PostgresConfig;
use atmo_core::{
    Cluster, ClusterState, Identifier, JobTimeout, NotebookRef, ResultVisibility, RunInterval,
    RunRecord, RunStatus, ScheduledJob, Scope,
};

use crate::error::StoreError;
use crate::traits::{
    lease_expiry, ClusterFilter, IdentifierRegistry, JobFilter, Lease, Leases, RunFilter, Store,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply pending migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!(host = %config.host, database = %config.database, "PostgreSQL connected");

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations applied successfully");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ── Row mapping ───────────────────────────────────────────────

const CLUSTER_COLUMNS: &str = "id, identifier, size, release, requested_by, public_key, \
     master_address, state, state_change_reason, created_at, started_at, jobflow_id, run_id, \
     updated_at";

const JOB_COLUMNS: &str = "id, identifier, notebook_key, result_visibility, size, \
     interval_hours, timeout_hours, start_date, end_date, last_run_at, requested_by, release, \
     enabled, active_run_id, created_at, deleted_at";

const RUN_COLUMNS: &str = "id, job_id, cluster_id, status, started_at, finished_at, reason";

#[derive(sqlx::FromRow)]
struct ClusterRow {
    id: Uuid,
    identifier: String,
    size: i32,
    release: String,
    requested_by: String,
    public_key: Option<String>,
    master_address: Option<String>,
    state: String,
    state_change_reason: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    jobflow_id: Option<String>,
    run_id: Option<Uuid>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ClusterRow> for Cluster {
    type Error = StoreError;

    fn try_from(row: ClusterRow) -> Result<Self, Self::Error> {
        let corrupt = |e| StoreError::corrupt("clusters", e);
        Ok(Cluster {
            id: row.id,
            identifier: Identifier::parse(&row.identifier).map_err(corrupt)?,
            size: from_i32("clusters", row.size)?,
            release: row.release,
            requested_by: row.requested_by,
            public_key: row.public_key,
            master_address: row.master_address,
            state: row.state.parse::<ClusterState>().map_err(corrupt)?,
            state_change_reason: row.state_change_reason,
            created_at: row.created_at,
            started_at: row.started_at,
            jobflow_id: row.jobflow_id,
            run_id: row.run_id,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    identifier: String,
    notebook_key: String,
    result_visibility: String,
    size: i32,
    interval_hours: i32,
    timeout_hours: i32,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    requested_by: String,
    release: String,
    enabled: bool,
    active_run_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for ScheduledJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e| StoreError::corrupt("scheduled_jobs", e);
        Ok(ScheduledJob {
            id: row.id,
            identifier: Identifier::parse(&row.identifier).map_err(corrupt)?,
            notebook: NotebookRef::new(row.notebook_key),
            result_visibility: row
                .result_visibility
                .parse::<ResultVisibility>()
                .map_err(corrupt)?,
            size: from_i32("scheduled_jobs", row.size)?,
            interval: RunInterval::from_hours(i64::from(row.interval_hours)).map_err(corrupt)?,
            timeout: JobTimeout::hours(from_i32("scheduled_jobs", row.timeout_hours)?)
                .map_err(corrupt)?,
            start_date: row.start_date,
            end_date: row.end_date,
            last_run_at: row.last_run_at,
            requested_by: row.requested_by,
            release: row.release,
            enabled: row.enabled,
            active_run_id: row.active_run_id,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    job_id: Uuid,
    cluster_id: Option<Uuid>,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    reason: Option<String>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(RunRecord {
            id: row.id,
            job_id: row.job_id,
            cluster_id: row.cluster_id,
            status: row
                .status
                .parse::<RunStatus>()
                .map_err(|e| StoreError::corrupt("job_runs", e))?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            reason: row.reason,
        })
    }
}

fn from_i32(table: &'static str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        table,
        reason: format!("negative value {value}"),
    })
}

fn to_i32(table: &'static str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt {
        table,
        reason: format!("value {value} out of range"),
    })
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ── Store ─────────────────────────────────────────────────────

#[async_trait]
impl Store for PgStore {
    async fn load_cluster(&self, id: Uuid) -> Result<Option<Cluster>, StoreError> {
        let row = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Cluster::try_from).transpose()
    }

    async fn save_cluster(&self, c: &Cluster) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO clusters (id, identifier, size, release, requested_by, public_key,
                                   master_address, state, state_change_reason, created_at,
                                   started_at, jobflow_id, run_id, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (id) DO UPDATE SET
                 master_address = EXCLUDED.master_address,
                 state = EXCLUDED.state,
                 state_change_reason = EXCLUDED.state_change_reason,
                 started_at = EXCLUDED.started_at,
                 jobflow_id = COALESCE(clusters.jobflow_id, EXCLUDED.jobflow_id),
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(c.id)
        .bind(c.identifier.as_str())
        .bind(to_i32("clusters", c.size)?)
        .bind(&c.release)
        .bind(&c.requested_by)
        .bind(&c.public_key)
        .bind(&c.master_address)
        .bind(c.state.as_str())
        .bind(&c.state_change_reason)
        .bind(c.created_at)
        .bind(c.started_at)
        .bind(&c.jobflow_id)
        .bind(c.run_id)
        .bind(c.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_clusters(&self, filter: &ClusterFilter) -> Result<Vec<Cluster>, StoreError> {
        let states: Option<Vec<String>> = filter
            .states
            .as_ref()
            .map(|s| s.iter().map(|st| st.as_str().to_string()).collect());

        let rows = sqlx::query_as::<_, ClusterRow>(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters
             WHERE ($1::text[] IS NULL OR state = ANY($1))
               AND ($2::timestamptz IS NULL OR created_at >= $2)
               AND ($3::boolean IS NULL OR (run_id IS NOT NULL) = $3)
             ORDER BY created_at"
        ))
        .bind(states)
        .bind(filter.created_after)
        .bind(filter.job_runs)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScheduledJob::try_from).transpose()
    }

    async fn save_job(&self, j: &ScheduledJob) -> Result<(), StoreError> {
        let interval_hours = i32::try_from(j.interval.hours()).map_err(|_| StoreError::Corrupt {
            table: "scheduled_jobs",
            reason: format!("interval {} out of range", j.interval.hours()),
        })?;

        sqlx::query(
            "INSERT INTO scheduled_jobs (id, identifier, notebook_key, result_visibility, size,
                                         interval_hours, timeout_hours, start_date, end_date,
                                         last_run_at, requested_by, release, enabled,
                                         active_run_id, created_at, deleted_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT (id) DO UPDATE SET
                 notebook_key = EXCLUDED.notebook_key,
                 result_visibility = EXCLUDED.result_visibility,
                 size = EXCLUDED.size,
                 interval_hours = EXCLUDED.interval_hours,
                 timeout_hours = EXCLUDED.timeout_hours,
                 start_date = EXCLUDED.start_date,
                 end_date = EXCLUDED.end_date,
                 last_run_at = EXCLUDED.last_run_at,
                 release = EXCLUDED.release,
                 enabled = EXCLUDED.enabled,
                 active_run_id = EXCLUDED.active_run_id,
                 deleted_at = EXCLUDED.deleted_at",
        )
        .bind(j.id)
        .bind(j.identifier.as_str())
        .bind(&j.notebook.key)
        .bind(j.result_visibility.as_str())
        .bind(to_i32("scheduled_jobs", j.size)?)
        .bind(interval_hours)
        .bind(to_i32("scheduled_jobs", j.timeout.as_hours())?)
        .bind(j.start_date)
        .bind(j.end_date)
        .bind(j.last_run_at)
        .bind(&j.requested_by)
        .bind(&j.release)
        .bind(j.enabled)
        .bind(j.active_run_id)
        .bind(j.created_at)
        .bind(j.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs
             WHERE ($1 OR deleted_at IS NULL)
               AND (NOT $2 OR enabled)
             ORDER BY created_at"
        ))
        .bind(filter.include_deleted)
        .bind(filter.enabled_only)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RunRecord::try_from).transpose()
    }

    async fn save_run(&self, r: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO job_runs (id, job_id, cluster_id, status, started_at, finished_at, reason)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                 cluster_id = EXCLUDED.cluster_id,
                 status = EXCLUDED.status,
                 finished_at = EXCLUDED.finished_at,
                 reason = EXCLUDED.reason",
        )
        .bind(r.id)
        .bind(r.job_id)
        .bind(r.cluster_id)
        .bind(r.status.as_str())
        .bind(r.started_at)
        .bind(r.finished_at)
        .bind(&r.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs
             WHERE ($1::uuid IS NULL OR job_id = $1)
               AND (NOT $2 OR status IN ('PENDING_CLUSTER', 'ACTIVE'))
             ORDER BY started_at"
        ))
        .bind(filter.job_id)
        .bind(filter.active_only)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }
}

// ── Identifier registry ───────────────────────────────────────

#[async_trait]
impl IdentifierRegistry for PgStore {
    async fn reserve(
        &self,
        scope: Scope,
        identifier: &Identifier,
        owner: Uuid,
    ) -> Result<bool, StoreError> {
        // The no-op update only fires for the current owner, so a conflicting
        // owner gets no row back.
        let row = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO identifier_reservations (scope, identifier, owner)
             VALUES ($1, $2, $3)
             ON CONFLICT (scope, identifier) DO UPDATE
                 SET owner = identifier_reservations.owner
                 WHERE identifier_reservations.owner = EXCLUDED.owner
             RETURNING owner",
        )
        .bind(scope.as_str())
        .bind(identifier.as_str())
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn release(
        &self,
        scope: Scope,
        identifier: &Identifier,
        owner: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM identifier_reservations
             WHERE scope = $1 AND identifier = $2 AND owner = $3",
        )
        .bind(scope.as_str())
        .bind(identifier.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_taken(&self, scope: Scope, identifier: &Identifier) -> Result<bool, StoreError> {
        let taken = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                 SELECT 1 FROM identifier_reservations WHERE scope = $1 AND identifier = $2
             )",
        )
        .bind(scope.as_str())
        .bind(identifier.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(taken)
    }
}

// ── Leases ────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct LeaseRow {
    key: String,
    holder: String,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl Leases for PgStore {
    async fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query_as::<_, LeaseRow>(
            "INSERT INTO leases (key, holder, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE
                 SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                 WHERE leases.expires_at <= $4
             RETURNING key, holder, expires_at",
        )
        .bind(key)
        .bind(holder)
        .bind(lease_expiry(now, ttl))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Lease {
            key: r.key,
            holder: r.holder,
            expires_at: r.expires_at,
        }))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM leases WHERE key = $1 AND holder = $2")
            .bind(&lease.key)
            .bind(&lease.holder)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(key = %lease.key, holder = %lease.holder, "Lease was already taken over or expired");
        }
        Ok(())
    }
}
