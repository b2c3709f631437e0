//! Coordinator configuration.
//!
//! The configuration surface mirrors the options the rest of the coordinator
//! consumes: server identity, journal storage and fsync policy, timeouts and
//! recovery cadence. String values run through `${name}` property
//! substitution before they are accepted, resolving first against the
//! builder's own property set and then against a process-wide override map.

use std::collections::HashMap;
use std::time::Duration;

use tandem_core::{Result, TransactionError};

const DEFAULT_SERVER_ID: &str = "tandem-local";
const DEFAULT_LOG_PART1: &str = "tandem1.tlog";
const DEFAULT_LOG_PART2: &str = "tandem2.tlog";
const DEFAULT_MAX_LOG_SIZE_MB: u64 = 2;
const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_GRACEFUL_SHUTDOWN_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_BACKGROUND_RECOVERY_INTERVAL_MINUTES: u64 = 1;

/// Immutable coordinator configuration, built through
/// [`Configuration::builder`].
#[derive(Debug, Clone)]
pub struct Configuration {
    server_id: String,
    log_part1_filename: String,
    log_part2_filename: String,
    max_log_size_mb: u64,
    forced_write_enabled: bool,
    force_batching_enabled: bool,
    skip_corrupted_logs: bool,
    default_transaction_timeout: Duration,
    graceful_shutdown_interval: Duration,
    background_recovery_interval_minutes: u64,
    current_node_only_recovery: bool,
    asynchronous_two_pc: bool,
    warn_about_zero_resource_transaction: bool,
    filter_log_status: bool,
}

impl Configuration {
    /// Returns a builder initialized with default values.
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::new()
    }

    /// The server id embedded in every generated UID.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Path of the first journal fragment.
    pub fn log_part1_filename(&self) -> &str {
        &self.log_part1_filename
    }

    /// Path of the second journal fragment.
    pub fn log_part2_filename(&self) -> &str {
        &self.log_part2_filename
    }

    /// Capacity of each journal fragment in megabytes.
    pub fn max_log_size_mb(&self) -> u64 {
        self.max_log_size_mb
    }

    /// Whether journal writes are forced to stable storage before a log call
    /// returns.
    pub fn forced_write_enabled(&self) -> bool {
        self.forced_write_enabled
    }

    /// Whether concurrent forced writes may coalesce into a single fsync.
    pub fn force_batching_enabled(&self) -> bool {
        self.force_batching_enabled
    }

    /// Whether journal corruption at open is tolerated by skipping past the
    /// damaged record instead of failing.
    pub fn skip_corrupted_logs(&self) -> bool {
        self.skip_corrupted_logs
    }

    /// Transaction timeout applied when none is set explicitly.
    pub fn default_transaction_timeout(&self) -> Duration {
        self.default_transaction_timeout
    }

    /// How long shutdown waits for in-flight work before giving up.
    pub fn graceful_shutdown_interval(&self) -> Duration {
        self.graceful_shutdown_interval
    }

    /// Background recovery period in minutes; 0 disables the periodic run.
    pub fn background_recovery_interval_minutes(&self) -> u64 {
        self.background_recovery_interval_minutes
    }

    /// Whether recovery skips Xids whose gtrid embeds a foreign server id.
    pub fn current_node_only_recovery(&self) -> bool {
        self.current_node_only_recovery
    }

    /// Whether two-phase jobs are dispatched in parallel or executed
    /// in-caller.
    pub fn asynchronous_two_pc(&self) -> bool {
        self.asynchronous_two_pc
    }

    /// Whether committing a transaction with no enlisted resource logs a
    /// warning.
    pub fn warn_about_zero_resource_transaction(&self) -> bool {
        self.warn_about_zero_resource_transaction
    }

    /// Whether only decision statuses (COMMITTING, COMMITTED, ROLLING_BACK,
    /// ROLLEDBACK) are written to the journal.
    pub fn filter_log_status(&self) -> bool {
        self.filter_log_status
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::builder().build().expect("default configuration is valid")
    }
}

/// Builder for [`Configuration`].
#[derive(Debug, Clone, Default)]
pub struct ConfigurationBuilder {
    server_id: Option<String>,
    log_part1_filename: Option<String>,
    log_part2_filename: Option<String>,
    max_log_size_mb: Option<u64>,
    forced_write_enabled: Option<bool>,
    force_batching_enabled: Option<bool>,
    skip_corrupted_logs: Option<bool>,
    default_transaction_timeout: Option<Duration>,
    graceful_shutdown_interval: Option<Duration>,
    background_recovery_interval_minutes: Option<u64>,
    current_node_only_recovery: Option<bool>,
    asynchronous_two_pc: Option<bool>,
    warn_about_zero_resource_transaction: Option<bool>,
    filter_log_status: Option<bool>,
    properties: HashMap<String, String>,
    overrides: HashMap<String, String>,
}

impl ConfigurationBuilder {
    /// Creates a builder with every option unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server id. Subject to `${name}` substitution.
    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Sets the journal fragment paths. Subject to `${name}` substitution.
    pub fn journal_files(
        mut self,
        part1: impl Into<String>,
        part2: impl Into<String>,
    ) -> Self {
        self.log_part1_filename = Some(part1.into());
        self.log_part2_filename = Some(part2.into());
        self
    }

    /// Sets the per-fragment journal capacity in megabytes.
    pub fn max_log_size_mb(mut self, megabytes: u64) -> Self {
        self.max_log_size_mb = Some(megabytes);
        self
    }

    /// Enables or disables forcing journal writes to stable storage.
    pub fn forced_write_enabled(mut self, enabled: bool) -> Self {
        self.forced_write_enabled = Some(enabled);
        self
    }

    /// Enables or disables fsync batching across concurrent log calls.
    pub fn force_batching_enabled(mut self, enabled: bool) -> Self {
        self.force_batching_enabled = Some(enabled);
        self
    }

    /// Tolerates journal corruption at open instead of failing.
    pub fn skip_corrupted_logs(mut self, skip: bool) -> Self {
        self.skip_corrupted_logs = Some(skip);
        self
    }

    /// Sets the transaction timeout applied when none is given.
    pub fn default_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.default_transaction_timeout = Some(timeout);
        self
    }

    /// Sets the graceful shutdown wait.
    pub fn graceful_shutdown_interval(mut self, interval: Duration) -> Self {
        self.graceful_shutdown_interval = Some(interval);
        self
    }

    /// Sets the background recovery period in minutes; 0 disables it.
    pub fn background_recovery_interval_minutes(mut self, minutes: u64) -> Self {
        self.background_recovery_interval_minutes = Some(minutes);
        self
    }

    /// Restricts recovery to Xids generated by this node.
    pub fn current_node_only_recovery(mut self, enabled: bool) -> Self {
        self.current_node_only_recovery = Some(enabled);
        self
    }

    /// Selects parallel (true) or in-caller (false) two-phase dispatch.
    pub fn asynchronous_two_pc(mut self, enabled: bool) -> Self {
        self.asynchronous_two_pc = Some(enabled);
        self
    }

    /// Warns when a transaction commits with zero enlisted resources.
    pub fn warn_about_zero_resource_transaction(mut self, warn: bool) -> Self {
        self.warn_about_zero_resource_transaction = Some(warn);
        self
    }

    /// Writes only decision statuses to the journal.
    pub fn filter_log_status(mut self, filter: bool) -> Self {
        self.filter_log_status = Some(filter);
        self
    }

    /// Adds a property `${name}` references resolve against.
    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Adds a process-wide override consulted when the property set has no
    /// match.
    pub fn property_override(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    /// Builds the configuration, applying property substitution to string
    /// values.
    pub fn build(self) -> Result<Configuration> {
        let ConfigurationBuilder {
            server_id,
            log_part1_filename,
            log_part2_filename,
            max_log_size_mb,
            forced_write_enabled,
            force_batching_enabled,
            skip_corrupted_logs,
            default_transaction_timeout,
            graceful_shutdown_interval,
            background_recovery_interval_minutes,
            current_node_only_recovery,
            asynchronous_two_pc,
            warn_about_zero_resource_transaction,
            filter_log_status,
            properties,
            overrides,
        } = self;
        let resolve = |raw: String| substitute(&raw, &properties, &overrides);

        Ok(Configuration {
            server_id: resolve(server_id.unwrap_or_else(|| DEFAULT_SERVER_ID.into()))?,
            log_part1_filename: resolve(
                log_part1_filename.unwrap_or_else(|| DEFAULT_LOG_PART1.into()),
            )?,
            log_part2_filename: resolve(
                log_part2_filename.unwrap_or_else(|| DEFAULT_LOG_PART2.into()),
            )?,
            max_log_size_mb: max_log_size_mb.unwrap_or(DEFAULT_MAX_LOG_SIZE_MB).max(1),
            forced_write_enabled: forced_write_enabled.unwrap_or(true),
            force_batching_enabled: force_batching_enabled.unwrap_or(true),
            skip_corrupted_logs: skip_corrupted_logs.unwrap_or(false),
            default_transaction_timeout: default_transaction_timeout
                .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT),
            graceful_shutdown_interval: graceful_shutdown_interval
                .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_INTERVAL),
            background_recovery_interval_minutes: background_recovery_interval_minutes
                .unwrap_or(DEFAULT_BACKGROUND_RECOVERY_INTERVAL_MINUTES),
            current_node_only_recovery: current_node_only_recovery.unwrap_or(true),
            asynchronous_two_pc: asynchronous_two_pc.unwrap_or(false),
            warn_about_zero_resource_transaction: warn_about_zero_resource_transaction
                .unwrap_or(true),
            filter_log_status: filter_log_status.unwrap_or(false),
        })
    }
}

/// Resolves `${name}` references in `value` against `properties`, then
/// `overrides`.
///
/// An empty reference (`${}`) and an unclosed reference (`${foo`) fail with a
/// configuration error quoting the offending token. Unknown names resolve to
/// the empty string, matching property-file semantics.
pub fn substitute(
    value: &str,
    properties: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> Result<String> {
    let mut result = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(TransactionError::Configuration(format!(
                "unclosed property reference \"{}\"",
                &rest[start..]
            )));
        };
        let name = &after[..end];
        if name.is_empty() {
            return Err(TransactionError::Configuration(
                "invalid property reference \"${}\"".to_string(),
            ));
        }
        if let Some(replacement) = properties.get(name).or_else(|| overrides.get(name)) {
            result.push_str(replacement);
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}
