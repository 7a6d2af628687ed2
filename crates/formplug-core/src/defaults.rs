//! Centralized default constants for formplug.
//!
//! **This module is the single source of truth** for all shared default values.
//! Crates and the worker binary reference these constants instead of defining
//! their own magic numbers.

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum number of execution attempts per job.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Base delay of the exponential retry backoff in milliseconds.
///
/// The first retry waits this long, each later retry doubles it.
pub const JOB_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound for a single retry delay in milliseconds (5 minutes).
pub const JOB_BACKOFF_MAX_MS: u64 = 300_000;

/// How often the stale-job watchdog scans for stuck `running` jobs.
pub const JOB_WATCHDOG_INTERVAL_SECS: u64 = 60;

/// Message recorded when a job's plugin configuration is missing or disabled.
pub const PLUGIN_CONFIG_UNAVAILABLE: &str = "Plugin config not found or disabled";

// =============================================================================
// EVENTS
// =============================================================================

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// WEBHOOK PLUGIN
// =============================================================================

/// Default webhook HTTP request timeout in seconds.
pub const WEBHOOK_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// DATABASE
// =============================================================================

/// Default database URL when `DATABASE_URL` is unset.
pub const DATABASE_URL: &str = "postgres://localhost/formplug";
