//! Meta file parsing for isolate
//!
//! Parses the meta file isolate writes after a run to extract CPU time,
//! memory usage, exit status and isolate's own verdict.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::sandbox::{SandboxError, SandboxReport};
use crate::types::LimitExceeded;

/// Error that occurs during meta file parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("meta file parse error at line {line_number}: {message} (line: {line:?})")]
pub struct MetaParseError {
    /// Line number (1-indexed) where the error occurred
    pub line_number: usize,
    /// The problematic line content
    pub line: String,
    /// Description of the error
    pub message: String,
}

/// Isolate's two-letter verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateStatus {
    /// No status line: the program exited normally with code 0
    Ok,
    /// RE: non-zero exit code
    RuntimeError,
    /// TO: time limit exceeded
    TimedOut,
    /// SG: killed by a signal
    Signaled,
    /// XX: isolate itself failed
    InternalError,
}

impl IsolateStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "RE" => IsolateStatus::RuntimeError,
            "TO" => IsolateStatus::TimedOut,
            "SG" => IsolateStatus::Signaled,
            "XX" => IsolateStatus::InternalError,
            _ => IsolateStatus::Ok,
        }
    }
}

/// Parsed meta file from Isolate
#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    /// Raw key-value pairs from the meta file
    pub entries: HashMap<String, String>,
}

impl MetaFile {
    /// Parse meta file content from a string
    ///
    /// This is a lenient parser that skips malformed lines. For strict parsing
    /// that reports errors, use [`try_parse`](Self::try_parse).
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| line.trim().split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();

        Self { entries }
    }

    /// Parse meta file content with strict error handling
    ///
    /// Returns an error if any non-empty line is missing its colon or key.
    pub fn try_parse(content: &str) -> Result<Self, MetaParseError> {
        let mut entries = HashMap::new();

        for (line_idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let error = |message: &str| MetaParseError {
                line_number: line_idx + 1,
                line: line.to_owned(),
                message: message.to_owned(),
            };

            let (key, value) = trimmed
                .split_once(':')
                .ok_or_else(|| error("missing colon separator"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(error("empty key before colon"));
            }
            entries.insert(key.to_owned(), value.trim().to_owned());
        }

        Ok(Self { entries })
    }

    /// Load and parse a meta file from disk
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn status(&self) -> IsolateStatus {
        self.get("status")
            .map(IsolateStatus::from_code)
            .unwrap_or(IsolateStatus::Ok)
    }

    /// CPU time used in seconds
    pub fn time(&self) -> Option<f64> {
        self.get_f64("time")
    }

    /// Wall clock time used in seconds
    pub fn wall_time(&self) -> Option<f64> {
        self.get_f64("time-wall")
    }

    /// Peak memory in kilobytes, preferring the cgroup figure over max-rss
    pub fn memory(&self) -> Option<u64> {
        self.get_u64("cg-mem").or_else(|| self.get_u64("max-rss"))
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.get_i32("exitcode")
    }

    pub fn signal(&self) -> Option<i32> {
        self.get_i32("exitsig")
    }

    pub fn message(&self) -> Option<String> {
        self.get("message").map(String::from)
    }

    /// Whether isolate killed the program
    pub fn killed(&self) -> bool {
        self.get("killed").is_some()
    }

    /// Determine which limit was exceeded based on status and message
    pub fn limit_exceeded(&self) -> LimitExceeded {
        let from_message = LimitExceeded::from_message(self.message().as_deref());
        if from_message.is_exceeded() {
            return from_message;
        }

        if self.get("cg-oom-killed").is_some() {
            return LimitExceeded::Memory;
        }

        if self.status() == IsolateStatus::TimedOut {
            return LimitExceeded::Time;
        }

        LimitExceeded::NotExceeded
    }

    pub fn to_report(&self) -> SandboxReport {
        let status = self.status();
        let exit_code = match status {
            IsolateStatus::Ok => Some(self.exit_code().unwrap_or(0)),
            _ => self.exit_code(),
        };
        SandboxReport {
            cpu_time: self.time(),
            peak_memory: self.memory(),
            reports_exit_status: true,
            exit_code,
            signal: self.signal(),
            timed_out: status == IsolateStatus::TimedOut,
            limit_exceeded: self.limit_exceeded(),
            message: self.message(),
            internal_error: status == IsolateStatus::InternalError,
        }
    }
}
