use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_f64(profile: &str, key: &str, default: f64) -> f64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub aws: AwsConfig,
    pub emr: EmrConfig,
    pub postgres: PostgresConfig,
    pub limits: LimitsConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `ATMO_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("ATMO_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            aws: AwsConfig::from_env_profiled(p),
            emr: EmrConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            limits: LimitsConfig::from_env_profiled(p),
            scheduler: SchedulerConfig::from_env_profiled(p),
            retry: RetryConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  aws:        region={}, static_credentials={}", self.aws.region, self.aws.has_static_credentials());
        tracing::info!("  emr:        bucket={}, release={}, call_timeout={}s", self.emr.spark_emr_bucket, self.emr.default_release, self.emr.call_timeout_secs);
        tracing::info!("  postgres:   host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!("  limits:     max_cluster_size={}, grace={}m, lease_ttl={}s", self.limits.max_cluster_size, self.limits.provision_grace_minutes, self.limits.lease_ttl_secs);
        tracing::info!("  scheduler:  tick={}s, reconcile_every={} ticks", self.scheduler.tick_interval_secs, self.scheduler.reconcile_every_ticks);
        tracing::info!("  retry:      attempts={}, base={}ms, cap={}ms", self.retry.max_attempts, self.retry.base_delay_ms, self.retry.max_delay_ms);
    }
}

/// Built-in defaults without reading the environment.
impl Default for Config {
    fn default() -> Self {
        Self {
            profile: String::new(),
            aws: AwsConfig::default(),
            emr: EmrConfig::default(),
            postgres: PostgresConfig::default(),
            limits: LimitsConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-west-2"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".into(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint_url: None,
        }
    }
}

// ── EMR ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmrConfig {
    /// Bucket holding bootstrap scripts and step scripts.
    pub spark_emr_bucket: String,
    /// Bucket notebooks are uploaded to.
    pub code_bucket: String,
    pub public_data_bucket: String,
    pub private_data_bucket: String,
    pub log_bucket: String,
    pub master_instance_type: String,
    pub worker_instance_type: String,
    pub ec2_key_name: String,
    pub service_role: String,
    pub job_flow_role: String,
    /// Value of the `Application` tag on every instance.
    pub instance_app_tag: String,
    /// Value of the `App` tag used for cost accounting.
    pub accounting_app_tag: String,
    /// Shared home directory filesystem mounted by the bootstrap script.
    pub efs_dns: String,
    pub default_release: String,
    /// Budget for a single control-plane call.
    pub call_timeout_secs: u64,
}

impl EmrConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            spark_emr_bucket: profiled_env_or(p, "SPARK_EMR_BUCKET", "telemetry-spark-emr-2"),
            code_bucket: profiled_env_or(p, "CODE_BUCKET", "telemetry-analysis-code-2"),
            public_data_bucket: profiled_env_or(p, "PUBLIC_DATA_BUCKET", "telemetry-public-analysis-2"),
            private_data_bucket: profiled_env_or(p, "PRIVATE_DATA_BUCKET", "telemetry-private-analysis-2"),
            log_bucket: profiled_env_or(p, "LOG_BUCKET", "telemetry-analysis-logs-2"),
            master_instance_type: profiled_env_or(p, "EMR_MASTER_INSTANCE_TYPE", "c3.4xlarge"),
            worker_instance_type: profiled_env_or(p, "EMR_WORKER_INSTANCE_TYPE", "c3.4xlarge"),
            ec2_key_name: profiled_env_or(p, "EMR_EC2_KEY_NAME", "atmo-analysis"),
            service_role: profiled_env_or(p, "EMR_SERVICE_ROLE", "EMR_DefaultRole"),
            job_flow_role: profiled_env_or(p, "EMR_JOB_FLOW_ROLE", "EMR_EC2_DefaultRole"),
            instance_app_tag: profiled_env_or(p, "INSTANCE_APP_TAG", "telemetry-analysis-worker-instance"),
            accounting_app_tag: profiled_env_or(p, "ACCOUNTING_APP_TAG", "telemetry-analysis"),
            efs_dns: profiled_env_or(p, "AWS_EFS_DNS", ""),
            default_release: profiled_env_or(p, "EMR_DEFAULT_RELEASE", "5.0.0"),
            call_timeout_secs: profiled_env_u64(p, "EMR_CALL_TIMEOUT_SECONDS", 30),
        }
    }

    /// Bootstrap script run on every node.
    pub fn script_uri(&self) -> String {
        format!("s3://{}/bootstrap/telemetry.sh", self.spark_emr_bucket)
    }

    /// Step script that executes a notebook in batch mode.
    pub fn batch_uri(&self) -> String {
        format!("s3://{}/steps/batch.sh", self.spark_emr_bucket)
    }

    /// Step script that installs Zeppelin on interactive clusters.
    pub fn zeppelin_uri(&self) -> String {
        format!("s3://{}/steps/zeppelin/zeppelin.sh", self.spark_emr_bucket)
    }

    /// Script runner jar that executes step scripts.
    pub fn jar_uri(&self, region: &str) -> String {
        format!("s3://{}.elasticmapreduce/libs/script-runner/script-runner.jar", region)
    }

    pub fn log_uri(&self, log_dir: &str, identifier: &str) -> String {
        format!("s3://{}/{}/{}", self.log_bucket, log_dir, identifier)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for EmrConfig {
    fn default() -> Self {
        Self {
            spark_emr_bucket: "telemetry-spark-emr-2".into(),
            code_bucket: "telemetry-analysis-code-2".into(),
            public_data_bucket: "telemetry-public-analysis-2".into(),
            private_data_bucket: "telemetry-private-analysis-2".into(),
            log_bucket: "telemetry-analysis-logs-2".into(),
            master_instance_type: "c3.4xlarge".into(),
            worker_instance_type: "c3.4xlarge".into(),
            ec2_key_name: "atmo-analysis".into(),
            service_role: "EMR_DefaultRole".into(),
            job_flow_role: "EMR_EC2_DefaultRole".into(),
            instance_app_tag: "telemetry-analysis-worker-instance".into(),
            accounting_app_tag: "telemetry-analysis".into(),
            efs_dns: String::new(),
            default_release: "5.0.0".into(),
            call_timeout_secs: 30,
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "atmo"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            database: "atmo".into(),
            username: None,
            password: None,
            ssl_mode: "prefer".into(),
            max_connections: 10,
        }
    }
}

// ── Limits ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound on worker nodes per cluster.
    pub max_cluster_size: u32,
    /// How long a cluster may sit in PROVISION_SUBMITTED before it is reported as stalled.
    pub provision_grace_minutes: u32,
    /// Lifetime of a per-entity lease.
    pub lease_ttl_secs: u64,
}

impl LimitsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_cluster_size: profiled_env_u32(p, "MAX_CLUSTER_SIZE", 30),
            provision_grace_minutes: profiled_env_u32(p, "PROVISION_GRACE_MINUTES", 30),
            lease_ttl_secs: profiled_env_u64(p, "LEASE_TTL_SECONDS", 60),
        }
    }

    pub fn provision_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.provision_grace_minutes))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_cluster_size: 30,
            provision_grace_minutes: 30,
            lease_ttl_secs: 60,
        }
    }
}

// ── Scheduler driver ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    /// Run a reconciliation sweep every N ticks.
    pub reconcile_every_ticks: u32,
    /// How far back the reconciliation sweep lists clusters.
    pub reconcile_lookback_hours: u32,
    /// Clusters younger than this are left out of the sweep.
    pub reconcile_settle_minutes: u32,
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            tick_interval_secs: profiled_env_u64(p, "SCHEDULER_TICK_SECONDS", 60),
            reconcile_every_ticks: profiled_env_u32(p, "RECONCILE_EVERY_TICKS", 15),
            reconcile_lookback_hours: profiled_env_u32(p, "RECONCILE_LOOKBACK_HOURS", 48),
            reconcile_settle_minutes: profiled_env_u32(p, "RECONCILE_SETTLE_MINUTES", 10),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            reconcile_every_ticks: 15,
            reconcile_lookback_hours: 48,
            reconcile_settle_minutes: 10,
        }
    }
}

// ── Retry / backoff ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Upper bound of the random delay added to each backoff step.
    pub jitter_ms: u64,
}

impl RetryConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_attempts: profiled_env_u32(p, "RETRY_MAX_ATTEMPTS", 5),
            base_delay_ms: profiled_env_u64(p, "RETRY_BASE_DELAY_MS", 500),
            max_delay_ms: profiled_env_u64(p, "RETRY_MAX_DELAY_MS", 30_000),
            backoff_factor: profiled_env_f64(p, "RETRY_BACKOFF_FACTOR", 2.0),
            jitter_ms: profiled_env_u64(p, "RETRY_JITTER_MS", 250),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_ms: 250,
        }
    }
}
