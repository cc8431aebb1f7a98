use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::AuditError;

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];

    loop {
        let count = file
            .read(&mut buf)
            .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_text(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;

    let mut file = File::create(path)
        .with_context(|| format!("failed to create json file: {}", path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("failed to write json file: {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("failed to finalize json file: {}", path.display()))?;

    Ok(())
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    fs::write(path, contents)
        .with_context(|| format!("failed to write text file: {}", path.display()))
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Comparison key for "same query" checks: case-insensitive, whitespace-collapsed.
pub fn query_key(query: &str) -> String {
    normalize_whitespace(query).to_lowercase()
}

pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &input[..byte_index],
        None => input,
    }
}

/// Shared stop signal: an explicit flag plus an optional wall-clock deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub cancel: CancelToken,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            cancel: CancelToken::default(),
        }
    }

    pub fn cancelled_by(mut self, cancel: &CancelToken) -> Self {
        self.cancel = cancel.clone();
        self
    }

    /// Backoff before retry `retry_index`, never past the cancel deadline.
    fn delay_for(&self, retry_index: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(retry_index));
        match self.cancel.remaining() {
            Some(left) => delay.min(left),
            None => delay,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are spent. Delays double after each transient failure.
/// The policy's cancel token is checked before every attempt and every sleep.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    stage: &str,
    mut operation: impl FnMut() -> Result<T, AuditError>,
) -> Result<T, AuditError> {
    let mut attempt = 0_u32;
    loop {
        if policy.cancel.is_cancelled() {
            return Err(AuditError::cancelled(stage, attempt));
        }
        attempt += 1;
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.attempts => {
                if policy.cancel.is_cancelled() {
                    return Err(error);
                }
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    stage,
                    attempt,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;

    #[test]
    fn query_key_ignores_case_and_spacing() {
        assert_eq!(
            query_key("  Registered   TAX id\n"),
            query_key("registered tax ID")
        );
        assert_ne!(query_key("tax id"), query_key("tax ids"));
    }

    #[test]
    fn truncate_chars_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("contratação", 9), "contrataç");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn retry_stops_after_policy_attempts_on_transient_errors() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let result: Result<(), AuditError> = retry_with_backoff(&policy, "test", || {
            calls.set(calls.get() + 1);
            Err(AuditError::transient("test", "busy"))
        });

        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retry_does_not_repeat_permanent_errors() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let result: Result<(), AuditError> = retry_with_backoff(&policy, "test", || {
            calls.set(calls.get() + 1);
            Err(AuditError::malformed("not json"))
        });

        assert!(matches!(result, Err(AuditError::MalformedOutput { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_returns_first_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result = retry_with_backoff(&policy, "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(AuditError::transient("test", "timeout"))
            } else {
                Ok(calls.get())
            }
        });

        assert_eq!(result.ok(), Some(2));
    }

    #[test]
    fn expired_deadline_stops_before_first_attempt() {
        let calls = Cell::new(0);
        let cancel = CancelToken::with_deadline(Instant::now());
        let policy = RetryPolicy::new(5, Duration::from_secs(30)).cancelled_by(&cancel);
        let result: Result<(), AuditError> = retry_with_backoff(&policy, "test", || {
            calls.set(calls.get() + 1);
            Err(AuditError::transient("test", "busy"))
        });

        assert!(matches!(result, Err(AuditError::Cancelled { attempts: 0, .. })));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn cancelling_mid_retry_returns_last_error_without_sleeping() {
        let calls = Cell::new(0);
        let cancel = CancelToken::new();
        let policy = RetryPolicy::new(5, Duration::from_secs(30)).cancelled_by(&cancel);
        let started = Instant::now();
        let result: Result<(), AuditError> = retry_with_backoff(&policy, "test", || {
            calls.set(calls.get() + 1);
            cancel.cancel();
            Err(AuditError::transient("test", "busy"))
        });

        assert!(matches!(result, Err(AuditError::Transient { .. })));
        assert_eq!(calls.get(), 1);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn backoff_never_sleeps_past_deadline() {
        let cancel = CancelToken::with_deadline(Instant::now() + Duration::from_millis(50));
        let policy = RetryPolicy::new(3, Duration::from_secs(60)).cancelled_by(&cancel);
        assert!(policy.delay_for(2) <= Duration::from_millis(50));
        assert_eq!(
            RetryPolicy::new(3, Duration::from_millis(10)).delay_for(2),
            Duration::from_millis(40)
        );
    }
}
