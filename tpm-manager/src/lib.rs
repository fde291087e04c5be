// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM ownership and NVRAM lifecycle manager.
//!
//! Takes ownership of the TPM once, keeps the resulting passwords on disk
//! only while some subsystem still needs them, and manages write-once NVRAM
//! spaces. TPM 1.2 and TPM 2.0 sit behind the same [`hardware`] traits; a
//! process picks one generation when it builds its [`Backend`].
//!
//! ```no_run
//! use tpm_manager::{LifecycleService, ManagerConfig};
//!
//! let config = ManagerConfig::default();
//! let service = LifecycleService::from_config(&config)?;
//! service.initialize()?;
//! # Ok::<(), tpm_manager::TpmManagerError>(())
//! ```

pub mod config;
pub mod error;
pub mod hardware;
pub mod messages;
pub mod secret_store;
pub mod service;
pub mod simulator;
pub mod tpm12;
pub mod tpm20;

pub use config::{ManagerConfig, TpmGeneration};
pub use error::{CommandError, Result, TpmManagerError};
pub use hardware::{DictionaryAttackInfo, TpmInitializer, TpmNvram, TpmStatus};
pub use secret_store::{FileSecretStore, MemorySecretStore, SecretRecord, SecretStore};
pub use service::{
    reply_channel, Backend, LifecycleService, ReplyCallback, TpmNvramInterface,
    TpmOwnershipInterface,
};
