// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failure of a single low-level TPM command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("TPM communication failure: {0}")]
    Communication(String),
    #[error("TPM asked for the command to be retried: 0x{0:08x}")]
    Retry(u32),
    #[error("TPM rejected the command: 0x{0:08x}")]
    Rejected(u32),
}

impl CommandError {
    /// Timeouts, I/O failures and retry-class warnings.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::Retry(_))
    }

    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Communication(_) => None,
            Self::Retry(code) | Self::Rejected(code) => Some(*code),
        }
    }
}

#[derive(Debug, Error)]
pub enum TpmManagerError {
    #[error("TPM device error: {0}")]
    Device(String),
    #[error("TPM is disabled")]
    NotAvailable,
    #[error("secret store I/O error: {0}")]
    Io(String),
    #[error("invalid state: {0}")]
    State(String),
}

impl TpmManagerError {
    pub(crate) fn device(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Device(format!("{context}: {err}"))
    }

    pub(crate) fn io(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Io(format!("{context}: {err}"))
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}

impl From<CommandError> for TpmManagerError {
    fn from(err: CommandError) -> Self {
        Self::Device(err.to_string())
    }
}

pub type Result<T, E = TpmManagerError> = std::result::Result<T, E>;
