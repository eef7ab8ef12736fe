//! Error types for remote provisioning.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Stage of `create_client_config` at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    GenerateClientKeys,
    ReadServerInfo,
    AllocateAddress,
    AppendPeer,
    RestartService,
    WriteArtifact,
}

impl ProvisionStage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateClientKeys => "generate-client-keys",
            Self::ReadServerInfo => "read-server-info",
            Self::AllocateAddress => "allocate-address",
            Self::AppendPeer => "append-peer",
            Self::RestartService => "restart-service",
            Self::WriteArtifact => "write-artifact",
        }
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors from remote sessions, the peer registry and provisioning workflows.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("authentication failed for {user}@{host}")]
    AuthFailed { host: String, user: String },

    #[error("{user}@{host} cannot run privileged commands non-interactively")]
    PrivilegeDenied { host: String, user: String },

    #[error("remote command failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("server setup for {host} did not connect within {secs}s")]
    SetupTimeout { host: String, secs: u64 },

    #[error("unsupported operating system: {0}")]
    UnsupportedOs(String),

    #[error("interface {0} is not present after setup")]
    InterfaceVerificationFailed(String),

    #[error("invalid client config path: {0:?}")]
    InvalidConfigPath(String),

    #[error("provisioning failed at {stage}: {reason}")]
    ProvisioningFailed {
        stage: ProvisionStage,
        reason: String,
    },

    #[error("peer {0} not found in registry")]
    PeerNotFound(String),

    #[error("no free tunnel address left in {0}/24")]
    AddressPoolExhausted(Ipv4Addr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Transport, authentication and privilege failures.
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::AuthFailed { .. } | Self::PrivilegeDenied { .. }
        )
    }

    /// Attribute a mid-workflow failure to `stage`. Connection errors and
    /// errors that already carry a stage are returned unchanged.
    #[must_use]
    pub fn at_stage(self, stage: ProvisionStage) -> Self {
        if self.is_connection_error() || matches!(self, Self::ProvisioningFailed { .. }) {
            return self;
        }
        Self::ProvisioningFailed {
            stage,
            reason: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_stage_wraps_command_failures() {
        let err = ProvisionError::CommandFailed {
            command: "wg genkey".into(),
            stderr: "wg: command not found".into(),
        }
        .at_stage(ProvisionStage::GenerateClientKeys);

        assert!(matches!(
            err,
            ProvisionError::ProvisioningFailed {
                stage: ProvisionStage::GenerateClientKeys,
                ..
            }
        ));
        assert!(err.to_string().contains("wg: command not found"));
    }

    #[test]
    fn at_stage_keeps_connection_errors() {
        let err = ProvisionError::AuthFailed {
            host: "198.51.100.7".into(),
            user: "root".into(),
        }
        .at_stage(ProvisionStage::AppendPeer);
        assert!(matches!(err, ProvisionError::AuthFailed { .. }));
    }

    #[test]
    fn at_stage_keeps_first_stage() {
        let err = ProvisionError::ProvisioningFailed {
            stage: ProvisionStage::AppendPeer,
            reason: "disk full".into(),
        }
        .at_stage(ProvisionStage::RestartService);
        assert!(matches!(
            err,
            ProvisionError::ProvisioningFailed {
                stage: ProvisionStage::AppendPeer,
                ..
            }
        ));
    }
}
