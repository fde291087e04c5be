// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info};

use super::{Tpm1Commands, Tpm1Device, WELL_KNOWN_SECRET};
use crate::error::{Result, TpmManagerError};
use crate::hardware::{retry_transient, TpmInitializer, TpmStatus};
use crate::secret_store::{SecretRecord, SecretStore};

const PASSWORD_SIZE: usize = 20;

pub struct Tpm1Initializer<D> {
    device: D,
    store: Arc<dyn SecretStore>,
    initial_dependencies: Vec<String>,
}

impl<D: Tpm1Device> Tpm1Initializer<D> {
    pub fn new(device: D, store: Arc<dyn SecretStore>, initial_dependencies: Vec<String>) -> Self {
        Self {
            device,
            store,
            initial_dependencies,
        }
    }

    /// Only the owner password means anything to a TPM 1.2.
    fn generate_record(&self) -> SecretRecord {
        let mut record = SecretRecord::default();
        record.owner_password = vec![0u8; PASSWORD_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut record.owner_password);
        record.owner_dependencies = self.initial_dependencies.iter().cloned().collect();
        record
    }
}

impl<D: Tpm1Device> TpmInitializer for Tpm1Initializer<D> {
    fn initialize_ownership(&mut self, status: &mut dyn TpmStatus) -> Result<()> {
        let owned = status.is_owned()?;
        let mut conn = self.device.open()?;
        if owned {
            let default_works = conn
                .test_owner_auth(&WELL_KNOWN_SECRET)
                .map_err(|e| TpmManagerError::device("failed to test owner auth", e))?;
            if !default_works {
                debug!("TPM already owned");
                return Ok(());
            }
            info!("TPM owned with the well-known secret, finishing initialization");
        }

        let mut record = self.store.read()?;
        if record.has_owner_password() {
            info!("resuming an unfinished ownership attempt with the stored password");
        } else {
            record = self.generate_record();
            self.store.write(&record)?;
        }

        if !owned {
            retry_transient("take ownership", || conn.take_ownership(&WELL_KNOWN_SECRET))
                .map_err(|e| TpmManagerError::device("failed to take ownership", e))?;
        }
        conn.unrestrict_srk(&WELL_KNOWN_SECRET)
            .map_err(|e| TpmManagerError::device("failed to unrestrict SRK", e))?;
        retry_transient("change owner auth", || {
            conn.change_owner_auth(&WELL_KNOWN_SECRET, &record.owner_password)
        })
        .map_err(|e| TpmManagerError::device("failed to change owner auth", e))?;

        if record.owner_dependencies.is_empty() {
            record.clear_passwords();
            self.store.write(&record)?;
        }
        info!("took ownership of the TPM");
        Ok(())
    }
}
