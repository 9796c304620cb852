//! Error types for vpnctl

use std::io;
use thiserror::Error;

use crate::tunnel::TunnelKind;

/// Which manual action the trust policy refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VetoKind {
    /// Manual connect on a trusted network
    Connect,
    /// Manual disconnect on an untrusted network
    Disconnect,
}

#[derive(Debug, Error)]
pub enum VpnError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", exit_suffix(.code))]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),
    /// A tunnel backend rejected the access details it was given
    #[error("{kind} backend rejected configuration: {reason}")]
    Configuration { kind: TunnelKind, reason: String },
    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Refused by network trust policy
    #[error("Refused by network protection policy: {0:?}")]
    PolicyVeto(VetoKind),
    /// The coordinator task has exited
    #[error("Connection coordinator is not running")]
    CoordinatorStopped,
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {}", code),
        None => String::new(),
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(error: serde_json::Error) -> Self {
        VpnError::ParseError(error.to_string())
    }
}

impl From<toml::de::Error> for VpnError {
    fn from(error: toml::de::Error) -> Self {
        VpnError::Config(error.to_string())
    }
}

pub type VpnResult<T> = Result<T, VpnError>;
