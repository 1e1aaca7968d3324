//! Structured error reporting for the CNI protocol.
//!
//! Every failure leaves the plugin as a single [`CniError`]: the `msg` field
//! names the pipeline stage that failed and `details` carries the text of the
//! underlying cause unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generic plugin error code; every stage reports with it.
pub const GENERIC_ERROR_CODE: u32 = 100;

/// Pipeline stages, named the way callers see them in `msg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadConfig,
    DiscoverNetworkInfo,
    WriteContainerMetadata,
    RunIpamPlugin,
    CreateConfig,
    CreateVethPair,
}

impl Stage {
    /// Name reported in the `msg` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::LoadConfig => "load config",
            Stage::DiscoverNetworkInfo => "discover network info",
            Stage::WriteContainerMetadata => "write container metadata",
            Stage::RunIpamPlugin => "run ipam plugin",
            Stage::CreateConfig => "create config",
            Stage::CreateVethPair => "create veth pair",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error object written to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniError {
    pub code: u32,
    pub msg: String,
    pub details: String,
}

impl CniError {
    pub fn new<S>(stage: Stage, details: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            code: GENERIC_ERROR_CODE,
            msg: stage.as_str().to_string(),
            details: details.into(),
        }
    }

    /// Build from any error, keeping its display text as `details`.
    pub fn from_err<E>(stage: Stage, err: E) -> Self
    where
        E: fmt::Display,
    {
        Self::new(stage, err.to_string())
    }

    /// Whether this error was raised by the given stage.
    pub fn is_stage(&self, stage: Stage) -> bool {
        self.msg == stage.as_str()
    }

    /// Print the error as a single JSON object on stdout.
    pub fn print_json(&self) {
        println!(
            "{}",
            serde_json::to_string(self).unwrap_or(format!(
                r#"{{"code":{},"msg":"{}","details":"failed to serialize error"}}"#,
                self.code, self.msg
            ))
        );
    }
}

impl fmt::Display for CniError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.msg)
        } else {
            write!(f, "{}: {}", self.msg, self.details)
        }
    }
}

impl std::error::Error for CniError {}
