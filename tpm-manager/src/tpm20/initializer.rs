// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{Tpm2Commands, Tpm2Device};
use crate::error::{Result, TpmManagerError};
use crate::hardware::{retry_transient, TpmInitializer, TpmStatus};
use crate::secret_store::{SecretRecord, SecretStore};

/// Length of each generated hierarchy password.
const PASSWORD_SIZE: usize = 20;
/// Host entropy hashed into the TPM RNG before passwords are drawn from it.
const ENTROPY_SIZE: usize = 128;

pub struct Tpm2Initializer<D> {
    device: D,
    store: Arc<dyn SecretStore>,
    initial_dependencies: Vec<String>,
}

impl<D: Tpm2Device> Tpm2Initializer<D> {
    pub fn new(device: D, store: Arc<dyn SecretStore>, initial_dependencies: Vec<String>) -> Self {
        Self {
            device,
            store,
            initial_dependencies,
        }
    }

    fn seed_tpm_rng(conn: &mut D::Connection) -> Result<()> {
        let mut entropy = zeroize::Zeroizing::new([0u8; ENTROPY_SIZE]);
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, entropy.as_mut_slice());
        let digest = Sha256::digest(entropy.as_slice());
        conn.stir_random(&digest)
            .map_err(|e| TpmManagerError::device("failed to seed TPM RNG", e))
    }

    fn generate_passwords(&self, conn: &mut D::Connection) -> Result<SecretRecord> {
        let mut draw = || {
            conn.get_random(PASSWORD_SIZE)
                .map_err(|e| TpmManagerError::device("failed to generate password", e))
        };
        let mut record = SecretRecord::default();
        record.owner_password = draw()?;
        record.endorsement_password = draw()?;
        record.lockout_password = draw()?;
        record.owner_dependencies = self.initial_dependencies.iter().cloned().collect();
        Ok(record)
    }
}

impl<D: Tpm2Device> TpmInitializer for Tpm2Initializer<D> {
    fn initialize_ownership(&mut self, status: &mut dyn TpmStatus) -> Result<()> {
        if status.is_owned()? {
            debug!("TPM already owned");
            return Ok(());
        }

        let mut conn = self.device.open()?;
        Self::seed_tpm_rng(&mut conn)?;

        let mut record = self.store.read()?;
        if record.has_owner_password() {
            info!("resuming an unfinished ownership attempt with stored passwords");
        } else {
            record = self.generate_passwords(&mut conn)?;
            // persisted before the TPM sees the passwords so a crash cannot lose them
            self.store.write(&record)?;
        }

        retry_transient("take ownership", || {
            conn.take_ownership(
                &record.owner_password,
                &record.endorsement_password,
                &record.lockout_password,
            )
        })
        .map_err(|e| TpmManagerError::device("failed to take ownership", e))?;

        if record.owner_dependencies.is_empty() {
            // nothing waits for the passwords
            record.clear_passwords();
            self.store.write(&record)?;
        }
        info!("took ownership of the TPM");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use crate::secret_store::MemorySecretStore;
    use crate::simulator::Tpm2Simulator;
    use crate::tpm20::Tpm2Status;

    fn deps() -> Vec<String> {
        vec!["nvram".into(), "attestation".into()]
    }

    fn setup(deps: Vec<String>) -> (Tpm2Simulator, Arc<MemorySecretStore>, Tpm2Initializer<Tpm2Simulator>) {
        let sim = Tpm2Simulator::new();
        let store = Arc::new(MemorySecretStore::default());
        let init = Tpm2Initializer::new(sim.clone(), store.clone(), deps);
        (sim, store, init)
    }

    #[test]
    fn test_take_ownership_records_passwords_first() {
        let (sim, store, mut init) = setup(deps());
        let mut status = Tpm2Status::new(sim.clone());
        init.initialize_ownership(&mut status).unwrap();

        let record = store.read().unwrap();
        assert_eq!(record.owner_password.len(), PASSWORD_SIZE);
        assert_eq!(record.endorsement_password.len(), PASSWORD_SIZE);
        assert_eq!(record.lockout_password.len(), PASSWORD_SIZE);
        assert_ne!(record.owner_password, record.endorsement_password);
        assert_eq!(record.owner_dependencies.len(), 2);
        assert_eq!(sim.owner_auth(), Some(record.owner_password.clone()));
        assert_eq!(sim.stir_random_calls(), 1);
        assert!(sim.is_owned());
    }

    #[test]
    fn test_already_owned_is_a_noop() {
        let (sim, store, mut init) = setup(deps());
        let mut status = Tpm2Status::new(sim.clone());
        init.initialize_ownership(&mut status).unwrap();
        let record = store.read().unwrap();

        init.initialize_ownership(&mut status).unwrap();
        assert_eq!(sim.take_ownership_calls(), 1);
        assert_eq!(sim.stir_random_calls(), 1);
        assert_eq!(store.read().unwrap(), record);
    }

    #[test]
    fn test_unfinished_attempt_reuses_stored_passwords() {
        let (sim, store, mut init) = setup(deps());
        let mut record = SecretRecord::default();
        record.owner_password = b"stored-owner".to_vec();
        record.endorsement_password = b"stored-endorsement".to_vec();
        record.lockout_password = b"stored-lockout".to_vec();
        record.owner_dependencies.insert("nvram".into());
        store.write(&record).unwrap();

        init.initialize_ownership(&mut Tpm2Status::new(sim.clone()))
            .unwrap();
        assert_eq!(sim.owner_auth(), Some(b"stored-owner".to_vec()));
        assert_eq!(store.read().unwrap(), record);
    }

    #[test]
    fn test_failed_attempt_keeps_passwords_for_retry() {
        let (sim, store, mut init) = setup(deps());
        sim.fail_take_ownership([CommandError::Rejected(0x101)]);
        assert!(init
            .initialize_ownership(&mut Tpm2Status::new(sim.clone()))
            .is_err());
        let first = store.read().unwrap();
        assert!(first.has_owner_password());
        assert!(!sim.is_owned());

        init.initialize_ownership(&mut Tpm2Status::new(sim.clone()))
            .unwrap();
        assert_eq!(sim.owner_auth(), Some(first.owner_password.clone()));
        assert_eq!(store.read().unwrap(), first);
    }

    #[test]
    fn test_transient_failures_are_retried_within_bound() {
        let (sim, _store, mut init) = setup(deps());
        sim.fail_take_ownership([
            CommandError::Retry(0x922),
            CommandError::Communication("timeout".into()),
        ]);
        init.initialize_ownership(&mut Tpm2Status::new(sim.clone()))
            .unwrap();
        assert_eq!(sim.take_ownership_calls(), 3);

        let (sim, _store, mut init) = setup(deps());
        sim.fail_take_ownership(vec![CommandError::Retry(0x922); 10]);
        let err = init
            .initialize_ownership(&mut Tpm2Status::new(sim.clone()))
            .unwrap_err();
        assert!(matches!(err, TpmManagerError::Device(_)));
        assert_eq!(
            sim.take_ownership_calls(),
            crate::hardware::MAX_OWNERSHIP_ATTEMPTS
        );
    }

    #[test]
    fn test_store_failure_aborts_before_hardware() {
        let (sim, store, mut init) = setup(deps());
        store.set_fail_writes(true);
        let err = init
            .initialize_ownership(&mut Tpm2Status::new(sim.clone()))
            .unwrap_err();
        assert!(matches!(err, TpmManagerError::Io(_)));
        assert_eq!(sim.take_ownership_calls(), 0);
    }

    #[test]
    fn test_no_dependencies_clears_passwords() {
        let (sim, store, mut init) = setup(Vec::new());
        init.initialize_ownership(&mut Tpm2Status::new(sim.clone()))
            .unwrap();
        assert!(sim.is_owned());
        let record = store.read().unwrap();
        assert!(!record.has_owner_password());
        assert!(record.owner_dependencies.is_empty());
    }
}
