// Execution-layer configuration.
//
// A typed view over the recognized key-value options. Options arrive as
// string pairs (from whatever configuration source the embedding system
// uses); unknown keys are rejected at startup since a misspelled option is
// worse than a missing one.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::{DoraError, DoraResult};

/// Default CPU stride between partitions of the same table.
pub const DEFAULT_CPU_BINDING_STEP: usize = 2;

/// Default spin-loop bound before a worker parks on its queue.
pub const DEFAULT_WORKER_QUEUE_LOOPS: usize = 256;

/// Default client batch size; caps the per-queue refill thresholds.
pub const DEFAULT_CLIENT_BATCH_SIZE: usize = 10;

/// Default refill threshold for input and commit queues.
pub const DEFAULT_QUEUE_THRESHOLD: usize = 64;

/// Default group-commit thresholds.
pub const DEFAULT_FLUSHER_MAX_XCTS: usize = 16;
pub const DEFAULT_FLUSHER_MAX_BYTES: u64 = 128 * 1024;
pub const DEFAULT_FLUSHER_MAX_MS: u64 = 10;

/// Typed configuration for the execution layer.
///
/// Recognized options:
///
/// | option | meaning |
/// |---|---|
/// | `dora-cpu-binding` | CPU stride between partitions of one table |
/// | `active-cpu-count` | CPUs available for pinning (default: detected) |
/// | `db-worker-sli` | speculative lock inheritance flag, carried to workers |
/// | `db-worker-queueloops` | spin bound before a worker parks |
/// | `db-cl-batchsz` | client batch size; caps queue thresholds |
/// | `<table>-inp-q-sz` | input-queue refill threshold for `<table>` |
/// | `<table>-com-q-sz` | commit-queue refill threshold for `<table>` |
/// | `flusher-max-xcts` | group commit: max unflushed transactions |
/// | `flusher-max-bytes` | group commit: max unflushed log bytes |
/// | `flusher-max-ms` | group commit: max milliseconds between flushes |
#[derive(Debug, Clone, Serialize)]
pub struct DoraConfig {
    cpu_binding_step: usize,
    active_cpu_count: usize,
    worker_sli: bool,
    worker_queue_loops: usize,
    client_batch_size: usize,
    flusher_max_xcts: usize,
    flusher_max_bytes: u64,
    flusher_max_ms: u64,
    input_queue_thresholds: HashMap<String, usize>,
    commit_queue_thresholds: HashMap<String, usize>,
}

impl Default for DoraConfig {
    fn default() -> Self {
        Self {
            cpu_binding_step: DEFAULT_CPU_BINDING_STEP,
            active_cpu_count: num_cpus::get(),
            worker_sli: false,
            worker_queue_loops: DEFAULT_WORKER_QUEUE_LOOPS,
            client_batch_size: DEFAULT_CLIENT_BATCH_SIZE,
            flusher_max_xcts: DEFAULT_FLUSHER_MAX_XCTS,
            flusher_max_bytes: DEFAULT_FLUSHER_MAX_BYTES,
            flusher_max_ms: DEFAULT_FLUSHER_MAX_MS,
            input_queue_thresholds: HashMap::new(),
            commit_queue_thresholds: HashMap::new(),
        }
    }
}

impl DoraConfig {
    /// Builds a configuration from string key-value pairs.
    ///
    /// # Errors
    ///
    /// Returns `DoraError::Config` for an unrecognized key or a value that
    /// does not parse. Configuration errors are fatal at startup.
    pub fn from_pairs<I, K, V>(pairs: I) -> DoraResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply(key.as_ref(), value.as_ref())?;
        }
        if config.active_cpu_count == 0 {
            return Err(DoraError::config("active-cpu-count", "must be at least 1"));
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> DoraResult<()> {
        match key {
            "dora-cpu-binding" => self.cpu_binding_step = parse(key, value)?,
            "active-cpu-count" => self.active_cpu_count = parse(key, value)?,
            "db-worker-sli" => self.worker_sli = parse::<u32>(key, value)? != 0,
            "db-worker-queueloops" => self.worker_queue_loops = parse(key, value)?,
            "db-cl-batchsz" => self.client_batch_size = parse(key, value)?,
            "flusher-max-xcts" => self.flusher_max_xcts = parse(key, value)?,
            "flusher-max-bytes" => self.flusher_max_bytes = parse(key, value)?,
            "flusher-max-ms" => self.flusher_max_ms = parse(key, value)?,
            _ => {
                if let Some(table) = key.strip_suffix("-inp-q-sz") {
                    self.input_queue_thresholds
                        .insert(table.to_string(), parse(key, value)?);
                } else if let Some(table) = key.strip_suffix("-com-q-sz") {
                    self.commit_queue_thresholds
                        .insert(table.to_string(), parse(key, value)?);
                } else {
                    return Err(DoraError::config(key, "unrecognized option"));
                }
            }
        }
        Ok(())
    }

    /// CPU stride between partitions of the same table.
    pub fn cpu_binding_step(&self) -> usize {
        self.cpu_binding_step.max(1)
    }

    /// Number of CPUs available for partition pinning.
    pub fn active_cpu_count(&self) -> usize {
        self.active_cpu_count
    }

    /// Speculative lock inheritance flag, carried to workers.
    pub fn worker_sli(&self) -> bool {
        self.worker_sli
    }

    /// Spin-loop bound before a worker parks on its queue.
    pub fn worker_queue_loops(&self) -> usize {
        self.worker_queue_loops
    }

    /// Client batch size.
    pub fn client_batch_size(&self) -> usize {
        self.client_batch_size
    }

    /// Input-queue refill threshold for a table.
    ///
    /// Thresholds larger than the client batch size are capped down to it;
    /// a worker never sees more pending input per client round than the
    /// client submits.
    pub fn input_queue_threshold(&self, table: &str) -> usize {
        self.input_queue_thresholds
            .get(table)
            .copied()
            .unwrap_or(DEFAULT_QUEUE_THRESHOLD)
            .min(self.client_batch_size)
            .max(1)
    }

    /// Commit-queue refill threshold for a table.
    pub fn commit_queue_threshold(&self, table: &str) -> usize {
        self.commit_queue_thresholds
            .get(table)
            .copied()
            .unwrap_or(DEFAULT_QUEUE_THRESHOLD)
            .min(self.client_batch_size)
            .max(1)
    }

    /// Group commit: maximum unflushed transactions before a forced flush.
    pub fn flusher_max_xcts(&self) -> usize {
        self.flusher_max_xcts.max(1)
    }

    /// Group commit: maximum unflushed log bytes before a forced flush.
    pub fn flusher_max_bytes(&self) -> u64 {
        self.flusher_max_bytes.max(1)
    }

    /// Group commit: maximum age of an unflushed commit.
    pub fn flusher_max_age(&self) -> Duration {
        Duration::from_millis(self.flusher_max_ms.max(1))
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> DoraResult<T> {
    value
        .parse::<T>()
        .map_err(|_| DoraError::config(key, format!("cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DoraConfig::default();
        assert_eq!(config.cpu_binding_step(), DEFAULT_CPU_BINDING_STEP);
        assert!(config.active_cpu_count() >= 1);
        assert!(!config.worker_sli());
        assert_eq!(config.flusher_max_xcts(), DEFAULT_FLUSHER_MAX_XCTS);
    }

    #[test]
    fn test_from_pairs() {
        let config = DoraConfig::from_pairs([
            ("dora-cpu-binding", "4"),
            ("active-cpu-count", "8"),
            ("db-worker-sli", "1"),
            ("db-worker-queueloops", "500"),
            ("db-cl-batchsz", "20"),
            ("warehouse-inp-q-sz", "100"),
            ("warehouse-com-q-sz", "80"),
            ("flusher-max-xcts", "8"),
            ("flusher-max-bytes", "65536"),
            ("flusher-max-ms", "5"),
        ])
        .unwrap();

        assert_eq!(config.cpu_binding_step(), 4);
        assert_eq!(config.active_cpu_count(), 8);
        assert!(config.worker_sli());
        assert_eq!(config.worker_queue_loops(), 500);
        // Both capped down to the client batch size of 20.
        assert_eq!(config.input_queue_threshold("warehouse"), 20);
        assert_eq!(config.commit_queue_threshold("warehouse"), 20);
        assert_eq!(config.flusher_max_xcts(), 8);
        assert_eq!(config.flusher_max_bytes(), 65536);
        assert_eq!(config.flusher_max_age(), Duration::from_millis(5));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = DoraConfig::from_pairs([("dora-cpu-bindng", "2")]).unwrap_err();
        assert!(matches!(err, DoraError::Config { .. }));
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn test_bad_value_rejected() {
        assert!(DoraConfig::from_pairs([("flusher-max-ms", "soon")]).is_err());
        assert!(DoraConfig::from_pairs([("active-cpu-count", "0")]).is_err());
    }

    #[test]
    fn test_threshold_capped_by_batch_size() {
        let config =
            DoraConfig::from_pairs([("db-cl-batchsz", "32"), ("orders-inp-q-sz", "4")]).unwrap();
        // Below the batch size the configured threshold stands.
        assert_eq!(config.input_queue_threshold("orders"), 4);
        // Unconfigured tables get the default, capped by the batch size.
        assert_eq!(config.input_queue_threshold("customers"), 32);
    }
}
