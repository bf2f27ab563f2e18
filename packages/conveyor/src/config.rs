//! Configuration options for stores, dispatchers, and providers.
//!
//! Every option struct has production defaults and a `validate()` that is
//! called at registration time (store construction, builder wiring). Schema
//! and table names are plain SQL identifiers because they are interpolated
//! into statements; validation rejects anything else up front.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default schema all engine tables live under unless configured otherwise.
pub const DEFAULT_SCHEMA: &str = "infra";

const SEVEN_DAYS: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// Checks that `name` is usable as an unquoted SQL identifier.
pub(crate) fn validate_identifier(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::options(format!("{what} must not be blank")));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::options(format!(
            "{what} '{name}' is not a valid SQL identifier"
        )));
    }
    Ok(())
}

fn validate_cleanup(
    what: &str,
    enabled: bool,
    interval: Duration,
    retention: Duration,
) -> Result<()> {
    if enabled && interval.is_zero() {
        return Err(Error::options(format!(
            "{what}: cleanup_interval must be positive when cleanup is enabled"
        )));
    }
    if enabled && retention.is_zero() {
        return Err(Error::options(format!(
            "{what}: retention_period must be positive when cleanup is enabled"
        )));
    }
    Ok(())
}

// ============================================================================
// Outbox / Inbox
// ============================================================================

/// Options for an outbox store.
#[derive(Debug, Clone)]
pub struct OutboxOptions {
    pub schema_name: String,
    pub table_name: String,
    /// Deploy tables/indexes on startup when missing.
    pub enable_schema_deployment: bool,
    /// Run the periodic retention sweep for this store.
    pub enable_automatic_cleanup: bool,
    pub cleanup_interval: Duration,
    pub retention_period: Duration,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            schema_name: DEFAULT_SCHEMA.to_string(),
            table_name: "Outbox".to_string(),
            enable_schema_deployment: true,
            enable_automatic_cleanup: true,
            cleanup_interval: ONE_HOUR,
            retention_period: SEVEN_DAYS,
        }
    }
}

impl OutboxOptions {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("outbox schema_name", &self.schema_name)?;
        validate_identifier("outbox table_name", &self.table_name)?;
        validate_cleanup(
            "outbox",
            self.enable_automatic_cleanup,
            self.cleanup_interval,
            self.retention_period,
        )
    }
}

/// Options for an inbox store. Same shape as [`OutboxOptions`] with a
/// different default table.
#[derive(Debug, Clone)]
pub struct InboxOptions {
    pub schema_name: String,
    pub table_name: String,
    pub enable_schema_deployment: bool,
    pub enable_automatic_cleanup: bool,
    pub cleanup_interval: Duration,
    pub retention_period: Duration,
}

impl Default for InboxOptions {
    fn default() -> Self {
        Self {
            schema_name: DEFAULT_SCHEMA.to_string(),
            table_name: "Inbox".to_string(),
            enable_schema_deployment: true,
            enable_automatic_cleanup: true,
            cleanup_interval: ONE_HOUR,
            retention_period: SEVEN_DAYS,
        }
    }
}

impl InboxOptions {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("inbox schema_name", &self.schema_name)?;
        validate_identifier("inbox table_name", &self.table_name)?;
        validate_cleanup(
            "inbox",
            self.enable_automatic_cleanup,
            self.cleanup_interval,
            self.retention_period,
        )
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Options for a scheduler store (jobs, job runs, timers).
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub schema_name: String,
    pub jobs_table: String,
    pub job_runs_table: String,
    pub timers_table: String,
    pub enable_schema_deployment: bool,
    pub enable_automatic_cleanup: bool,
    pub cleanup_interval: Duration,
    pub retention_period: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            schema_name: DEFAULT_SCHEMA.to_string(),
            jobs_table: "Jobs".to_string(),
            job_runs_table: "JobRuns".to_string(),
            timers_table: "Timers".to_string(),
            enable_schema_deployment: true,
            enable_automatic_cleanup: true,
            cleanup_interval: ONE_HOUR,
            retention_period: SEVEN_DAYS,
        }
    }
}

impl SchedulerOptions {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("scheduler schema_name", &self.schema_name)?;
        validate_identifier("scheduler jobs_table", &self.jobs_table)?;
        validate_identifier("scheduler job_runs_table", &self.job_runs_table)?;
        validate_identifier("scheduler timers_table", &self.timers_table)?;
        validate_cleanup(
            "scheduler",
            self.enable_automatic_cleanup,
            self.cleanup_interval,
            self.retention_period,
        )
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Options for the fencing-lease store.
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    pub schema_name: String,
    pub table_name: String,
    pub enable_schema_deployment: bool,
    /// Fraction of the lease duration after which the auto-renew task fires.
    pub renew_percent: f64,
    /// Upper bound on waiting for the advisory pre-gate before a renew.
    pub gate_timeout: Duration,
    /// Serialize renews per resource through a Postgres advisory lock.
    pub use_gate: bool,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            schema_name: DEFAULT_SCHEMA.to_string(),
            table_name: "DistributedLock".to_string(),
            enable_schema_deployment: true,
            renew_percent: 0.6,
            gate_timeout: Duration::from_millis(250),
            use_gate: false,
        }
    }
}

impl LeaseOptions {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("lease schema_name", &self.schema_name)?;
        validate_identifier("lease table_name", &self.table_name)?;
        if !(self.renew_percent > 0.0 && self.renew_percent <= 1.0) {
            return Err(Error::options(format!(
                "lease renew_percent must be in (0, 1], got {}",
                self.renew_percent
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Join
// ============================================================================

/// Options for the join coordinator tables.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub schema_name: String,
    pub joins_table: String,
    pub members_table: String,
    pub enable_schema_deployment: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            schema_name: DEFAULT_SCHEMA.to_string(),
            joins_table: "Joins".to_string(),
            members_table: "JoinMessages".to_string(),
            enable_schema_deployment: true,
        }
    }
}

impl JoinOptions {
    pub fn validate(&self) -> Result<()> {
        validate_identifier("join schema_name", &self.schema_name)?;
        validate_identifier("join joins_table", &self.joins_table)?;
        validate_identifier("join members_table", &self.members_table)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Options for the multi-outbox dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Total attempts before a message is failed terminally.
    pub max_attempts: u32,
    /// Lease the dispatcher takes per claimed batch.
    pub claim_lease: Duration,
    /// Lease requested from the lease router per outbox, when configured.
    pub store_lease_duration: Duration,
    /// Idle sleep of the dispatch loop when a pass processed nothing.
    pub poll_interval: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            claim_lease: Duration::from_secs(60),
            store_lease_duration: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl DispatcherOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::options("dispatcher max_attempts must be >= 1"));
        }
        if self.claim_lease.is_zero() {
            return Err(Error::options("dispatcher claim_lease must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Tenants
// ============================================================================

/// Per-tenant configuration consumed by the provider layer.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// Stable tenant key, used by routers and as the lease resource name.
    pub identifier: String,
    pub connection_string: String,
    pub outbox: OutboxOptions,
    pub inbox: InboxOptions,
    pub scheduler: SchedulerOptions,
    pub lease: LeaseOptions,
    pub join: JoinOptions,
}

impl TenantConfig {
    /// A config with default table layout for `identifier`.
    pub fn new(identifier: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            connection_string: connection_string.into(),
            outbox: OutboxOptions::default(),
            inbox: InboxOptions::default(),
            scheduler: SchedulerOptions::default(),
            lease: LeaseOptions::default(),
            join: JoinOptions::default(),
        }
    }

    /// Applies one schema name to every table family.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        self.outbox.schema_name = schema.clone();
        self.inbox.schema_name = schema.clone();
        self.scheduler.schema_name = schema.clone();
        self.lease.schema_name = schema.clone();
        self.join.schema_name = schema;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(Error::options("tenant identifier must not be blank"));
        }
        if self.connection_string.trim().is_empty() {
            return Err(Error::options(format!(
                "tenant '{}': connection_string must not be blank",
                self.identifier
            )));
        }
        self.outbox.validate()?;
        self.inbox.validate()?;
        self.scheduler.validate()?;
        self.lease.validate()?;
        self.join.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        OutboxOptions::default().validate().unwrap();
        InboxOptions::default().validate().unwrap();
        SchedulerOptions::default().validate().unwrap();
        LeaseOptions::default().validate().unwrap();
        JoinOptions::default().validate().unwrap();
        DispatcherOptions::default().validate().unwrap();
    }

    #[test]
    fn blank_schema_is_rejected() {
        let opts = OutboxOptions {
            schema_name: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(
            opts.validate(),
            Err(Error::OptionsValidation(_))
        ));
    }

    #[test]
    fn quoted_identifier_is_rejected() {
        let opts = InboxOptions {
            table_name: "inbox; drop table members".into(),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn zero_cleanup_interval_rejected_when_enabled() {
        let opts = OutboxOptions {
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let disabled = OutboxOptions {
            enable_automatic_cleanup: false,
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        };
        disabled.validate().unwrap();
    }

    #[test]
    fn renew_percent_bounds() {
        for bad in [0.0, -0.5, 1.5] {
            let opts = LeaseOptions {
                renew_percent: bad,
                ..Default::default()
            };
            assert!(opts.validate().is_err(), "renew_percent {bad} should fail");
        }
        let ok = LeaseOptions {
            renew_percent: 1.0,
            ..Default::default()
        };
        ok.validate().unwrap();
    }

    #[test]
    fn tenant_config_requires_connection_string() {
        let cfg = TenantConfig::new("t1", "   ");
        assert!(cfg.validate().is_err());
        TenantConfig::new("t1", "postgres://localhost/app")
            .validate()
            .unwrap();
    }

    #[test]
    fn with_schema_applies_everywhere() {
        let cfg = TenantConfig::new("t1", "postgres://localhost/app").with_schema("platform");
        assert_eq!(cfg.outbox.schema_name, "platform");
        assert_eq!(cfg.lease.schema_name, "platform");
        assert_eq!(cfg.join.schema_name, "platform");
        cfg.validate().unwrap();
    }
}
