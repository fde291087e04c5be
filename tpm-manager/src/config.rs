// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SECRET_PATH: &str = "/var/lib/tpm_manager/local_tpm_data";
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Hardware generation a process drives. Chosen once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpmGeneration {
    Tpm1,
    #[default]
    Tpm2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub generation: TpmGeneration,
    /// TPM device path; `/dev/tpmrm0` then `/dev/tpm0` when unset.
    pub device: Option<String>,
    pub secret_path: PathBuf,
    /// Only take ownership on an explicit request.
    pub wait_for_ownership: bool,
    /// Subsystems that need the owner password right after ownership is taken.
    pub initial_owner_dependencies: Vec<String>,
    /// Requests that may wait for the worker; further ones are refused.
    pub queue_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            generation: TpmGeneration::default(),
            device: None,
            secret_path: PathBuf::from(DEFAULT_SECRET_PATH),
            wait_for_ownership: false,
            initial_owner_dependencies: vec!["nvram".into(), "attestation".into()],
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ManagerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config {}", path.as_ref().display()))
    }
}
