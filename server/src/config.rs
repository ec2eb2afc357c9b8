//! Runtime configuration, read from the environment once at startup and
//! threaded explicitly through dispatcher, workers, and supervisor.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Slack added on top of the execution limit for process creation, result
/// marshalling, and broker round trips.
const PROCESS_TIME_SLACK: u64 = 5;

/// Floor on the long-batch deadline: an hour of queueing plus one full run.
const LONG_BATCH_FLOOR: u64 = 60 * 60;

const HEARTBEAT_SLACK: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

// timeline of one short-mode submission:
// |------------------- max_queue_wait_time ----------------------|
// |-- max_queue_work_life_time --|------ max_process_time -------|
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-run wall-clock budget in seconds.
    pub max_execution_time: u64,
    /// Per-run memory budget in MiB.
    pub max_memory_mib: u64,
    pub max_workers: usize,
    /// Short-mode items older than this (seconds) are cancelled unexecuted.
    pub max_queue_work_life_time: u64,
    pub long_batch_max_queue_wait_time: u64,
    pub max_batch_chunk_size: usize,
    pub max_long_batch_chunk_size: usize,
    /// Truncation cap applied to stdout/stderr before a result leaves the
    /// worker.
    pub max_stdout_error_length: usize,
    pub python_execute_command: String,
    pub cpp_compile_command: String,
    pub cpp_execute_command: String,
    pub redis_uri: Option<String>,
    pub key_prefix: String,
    pub socket_timeout: u64,
    pub block_pop_timeout: u64,
    pub result_ttl: u64,
    pub result_ttl_long: u64,
    pub worker_heartbeat_ttl: u64,
    pub bind_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        let max_execution_time = 10;
        let block_pop_timeout = 30;
        let long_batch_max_queue_wait_time =
            LONG_BATCH_FLOOR + max_execution_time + PROCESS_TIME_SLACK;
        Self {
            max_execution_time,
            max_memory_mib: 256,
            max_workers: default_worker_count(),
            max_queue_work_life_time: 4,
            long_batch_max_queue_wait_time,
            max_batch_chunk_size: 2,
            max_long_batch_chunk_size: 100,
            max_stdout_error_length: 1000,
            python_execute_command: "python3 {source}".to_string(),
            cpp_compile_command: "g++ -O2 -o {exe} {source}".to_string(),
            cpp_execute_command: "{exe}".to_string(),
            redis_uri: None,
            key_prefix: "judge".to_string(),
            socket_timeout: 60,
            block_pop_timeout,
            result_ttl: 60,
            result_ttl_long: long_batch_max_queue_wait_time,
            worker_heartbeat_ttl: HEARTBEAT_SLACK
                + block_pop_timeout
                + max_execution_time
                + PROCESS_TIME_SLACK,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

impl Config {
    /// Read the configuration from the environment, with the documented
    /// defaults, and reject values that violate the timeout relationships.
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_execution_time = env_parse("MAX_EXECUTION_TIME", 10)?;
        let max_process_time = max_execution_time + PROCESS_TIME_SLACK;
        let block_pop_timeout = env_parse("REDIS_WORK_QUEUE_BLOCK_TIMEOUT", 30)?;
        let long_batch_max_queue_wait_time = env_parse(
            "LONG_BATCH_MAX_QUEUE_WAIT_TIME",
            LONG_BATCH_FLOOR + max_process_time,
        )?;

        let config = Self {
            max_execution_time,
            max_memory_mib: env_parse("MAX_MEMORY", 256)?,
            max_workers: env_parse("MAX_WORKERS", default_worker_count())?,
            max_queue_work_life_time: env_parse("MAX_QUEUE_WORK_LIFE_TIME", 4)?,
            long_batch_max_queue_wait_time,
            max_batch_chunk_size: env_parse("MAX_BATCH_CHUNK_SIZE", 2)?,
            max_long_batch_chunk_size: env_parse("MAX_LONG_BATCH_CHUNK_SIZE", 100)?,
            max_stdout_error_length: env_parse("MAX_STDOUT_ERROR_LENGTH", 1000)?,
            python_execute_command: env_string("PYTHON_EXECUTE_COMMAND", "python3 {source}"),
            cpp_compile_command: env_string("CPP_COMPILE_COMMAND", "g++ -O2 -o {exe} {source}"),
            cpp_execute_command: env_string("CPP_EXECUTE_COMMAND", "{exe}"),
            redis_uri: std::env::var("REDIS_URI").ok().filter(|uri| !uri.is_empty()),
            key_prefix: env_string("REDIS_KEY_PREFIX", "judge"),
            socket_timeout: env_parse("REDIS_SOCKET_TIMEOUT", 60)?,
            block_pop_timeout,
            result_ttl: env_parse("RESULT_TTL", 60)?,
            result_ttl_long: env_parse("RESULT_TTL_LONG", long_batch_max_queue_wait_time)?,
            worker_heartbeat_ttl: env_parse(
                "WORKER_HEARTBEAT_TTL",
                HEARTBEAT_SLACK + block_pop_timeout + max_process_time,
            )?,
            bind_addr: env_parse(
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8000)),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Enforce the relationships the three-layer timeout onion depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_execution_time == 0 {
            return Err(invalid("MAX_EXECUTION_TIME", "must be positive"));
        }
        if self.max_workers == 0 {
            return Err(invalid("MAX_WORKERS", "must be positive"));
        }
        if self.max_batch_chunk_size == 0 {
            return Err(invalid("MAX_BATCH_CHUNK_SIZE", "must be positive"));
        }
        if self.max_long_batch_chunk_size == 0 {
            return Err(invalid("MAX_LONG_BATCH_CHUNK_SIZE", "must be positive"));
        }
        if self.socket_timeout < 10 {
            return Err(invalid(
                "REDIS_SOCKET_TIMEOUT",
                "must be at least 10 seconds",
            ));
        }
        if self.long_batch_max_queue_wait_time < LONG_BATCH_FLOOR + self.max_process_time() {
            return Err(invalid(
                "LONG_BATCH_MAX_QUEUE_WAIT_TIME",
                "must be at least one hour plus the process time budget",
            ));
        }
        if self.worker_heartbeat_ttl
            < HEARTBEAT_SLACK + self.block_pop_timeout + self.max_process_time()
        {
            return Err(invalid(
                "WORKER_HEARTBEAT_TTL",
                "must cover a full block-pop plus the process time budget, with margin",
            ));
        }
        Ok(())
    }

    /// Budget for one whole process lifetime: execution plus spawn/teardown
    /// slack.
    pub fn max_process_time(&self) -> u64 {
        self.max_execution_time + PROCESS_TIME_SLACK
    }

    /// How long a short-mode submitter waits on the result queue.
    pub fn max_queue_wait_time(&self) -> u64 {
        self.max_process_time() + self.max_queue_work_life_time
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mib * 1024 * 1024
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.max_execution_time)
    }

    pub fn block_pop_duration(&self) -> Duration {
        Duration::from_secs(self.block_pop_timeout)
    }
}

fn invalid(var: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.to_string(),
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

fn env_parse<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            var,
            reason: err.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_string(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    fn clear_judge_env() {
        for var in [
            "MAX_EXECUTION_TIME",
            "MAX_MEMORY",
            "MAX_WORKERS",
            "MAX_QUEUE_WORK_LIFE_TIME",
            "LONG_BATCH_MAX_QUEUE_WAIT_TIME",
            "MAX_BATCH_CHUNK_SIZE",
            "MAX_LONG_BATCH_CHUNK_SIZE",
            "MAX_STDOUT_ERROR_LENGTH",
            "PYTHON_EXECUTE_COMMAND",
            "CPP_COMPILE_COMMAND",
            "CPP_EXECUTE_COMMAND",
            "REDIS_URI",
            "REDIS_KEY_PREFIX",
            "REDIS_SOCKET_TIMEOUT",
            "REDIS_WORK_QUEUE_BLOCK_TIMEOUT",
            "RESULT_TTL",
            "RESULT_TTL_LONG",
            "WORKER_HEARTBEAT_TTL",
            "BIND_ADDR",
        ] {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn defaults_line_up_with_the_documented_table() {
        clear_judge_env();
        let config = Config::from_env().expect("load");
        assert_eq!(config.max_execution_time, 10);
        assert_eq!(config.max_process_time(), 15);
        assert_eq!(config.max_queue_wait_time(), 19);
        assert_eq!(config.max_memory_mib, 256);
        assert_eq!(config.max_batch_chunk_size, 2);
        assert_eq!(config.max_long_batch_chunk_size, 100);
        assert_eq!(config.max_stdout_error_length, 1000);
        assert_eq!(config.long_batch_max_queue_wait_time, 3615);
        assert_eq!(config.result_ttl_long, 3615);
        assert_eq!(config.worker_heartbeat_ttl, 165);
        assert_eq!(config.python_execute_command, "python3 {source}");
        assert_eq!(config.redis_uri, None);
    }

    #[test]
    #[serial]
    fn env_overrides_are_honored() {
        clear_judge_env();
        unsafe {
            std::env::set_var("MAX_EXECUTION_TIME", "3");
            std::env::set_var("REDIS_URI", "redis://broker:6379/2");
            std::env::set_var("REDIS_KEY_PREFIX", "ci");
        }
        let config = Config::from_env().expect("load");
        assert_eq!(config.max_execution_time, 3);
        assert_eq!(config.max_process_time(), 8);
        // the long-batch floor follows the shrunken process budget
        assert_eq!(config.long_batch_max_queue_wait_time, 3608);
        assert_eq!(config.redis_uri.as_deref(), Some("redis://broker:6379/2"));
        assert_eq!(config.key_prefix, "ci");
        clear_judge_env();
    }

    #[test]
    #[serial]
    fn unparseable_values_are_rejected() {
        clear_judge_env();
        unsafe { std::env::set_var("MAX_EXECUTION_TIME", "ten") };
        assert!(Config::from_env().is_err());
        clear_judge_env();
    }

    #[test]
    fn long_batch_deadline_must_cover_an_hour_of_queueing() {
        let config = Config {
            long_batch_max_queue_wait_time: 60,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_ttl_must_cover_a_blocked_worker() {
        let config = Config {
            worker_heartbeat_ttl: 10,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn socket_timeout_floor_is_enforced() {
        let config = Config {
            socket_timeout: 5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
