// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Durable storage of the ownership secrets.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Result, TpmManagerError};

/// Secrets produced by taking ownership, kept only while some subsystem
/// still needs them.
///
/// An empty password field means the password is absent.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub owner_password: Vec<u8>,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub endorsement_password: Vec<u8>,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub lockout_password: Vec<u8>,
    #[serde(default)]
    pub owner_dependencies: BTreeSet<String>,
}

impl SecretRecord {
    pub fn has_owner_password(&self) -> bool {
        !self.owner_password.is_empty()
    }

    pub fn has_endorsement_password(&self) -> bool {
        !self.endorsement_password.is_empty()
    }

    pub fn has_lockout_password(&self) -> bool {
        !self.lockout_password.is_empty()
    }

    /// Owner password copy that is wiped when dropped.
    pub fn owner_password(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.has_owner_password()
            .then(|| Zeroizing::new(self.owner_password.clone()))
    }

    pub fn clear_passwords(&mut self) {
        self.owner_password.zeroize();
        self.endorsement_password.zeroize();
        self.lockout_password.zeroize();
    }

    /// Drop `name` from the outstanding dependencies. Once none remain the
    /// passwords are cleared. Returns whether `name` was present.
    pub fn remove_owner_dependency(&mut self, name: &str) -> bool {
        let removed = self.owner_dependencies.remove(name);
        if self.owner_dependencies.is_empty() {
            self.clear_passwords();
        }
        removed
    }
}

impl Drop for SecretRecord {
    fn drop(&mut self) {
        self.clear_passwords();
    }
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("has_owner_password", &self.has_owner_password())
            .field("has_endorsement_password", &self.has_endorsement_password())
            .field("has_lockout_password", &self.has_lockout_password())
            .field("owner_dependencies", &self.owner_dependencies)
            .finish()
    }
}

/// Storage of the single [`SecretRecord`].
///
/// Callers do read/modify/write cycles without locking; the service's
/// single worker is what keeps them from interleaving.
pub trait SecretStore: Send + Sync {
    /// An absent record reads as the empty record.
    fn read(&self) -> Result<SecretRecord>;
    fn write(&self, record: &SecretRecord) -> Result<()>;
}

/// JSON record in a file only its owner may read or write.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> Result<&Path> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir),
            Some(_) => Ok(Path::new(".")),
            None => Err(TpmManagerError::Io(format!(
                "secret path {} has no parent directory",
                self.path.display()
            ))),
        }
    }
}

impl SecretStore for FileSecretStore {
    fn read(&self) -> Result<SecretRecord> {
        let data = match fs::read(&self.path) {
            Ok(data) => Zeroizing::new(data),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SecretRecord::default()),
            Err(e) => return Err(TpmManagerError::io("failed to read secret record", e)),
        };
        serde_json::from_slice(&data)
            .map_err(|e| TpmManagerError::io("failed to parse secret record", e))
    }

    fn write(&self, record: &SecretRecord) -> Result<()> {
        let dir = self.parent_dir()?;
        fs::create_dir_all(dir)
            .map_err(|e| TpmManagerError::io("failed to create secret directory", e))?;

        let encoded = Zeroizing::new(
            serde_json::to_vec(record)
                .map_err(|e| TpmManagerError::io("failed to serialize secret record", e))?,
        );
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| TpmManagerError::io("failed to create temporary secret file", e))?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(|e| TpmManagerError::io("failed to restrict secret file", e))?;
        tmp.as_file_mut()
            .write_all(&encoded)
            .map_err(|e| TpmManagerError::io("failed to write secret record", e))?;
        tmp.as_file_mut()
            .sync_all()
            .map_err(|e| TpmManagerError::io("failed to flush secret record", e))?;
        tmp.persist(&self.path).map_err(|e| {
            TpmManagerError::io(
                &format!("failed to persist secret record to {}", self.path.display()),
                e,
            )
        })?;

        // the rename is only durable once the directory entry is
        fs::File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| TpmManagerError::io("failed to sync secret directory", e))?;
        debug!(path = %self.path.display(), "stored secret record");
        Ok(())
    }
}

/// Record kept in memory, for the simulators and tests.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    record: Mutex<SecretRecord>,
    fail_writes: AtomicBool,
}

impl MemorySecretStore {
    pub fn new(record: SecretRecord) -> Self {
        Self {
            record: Mutex::new(record),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn record(&self) -> MutexGuard<'_, SecretRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecretStore for MemorySecretStore {
    fn read(&self) -> Result<SecretRecord> {
        Ok(self.record().clone())
    }

    fn write(&self, record: &SecretRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TpmManagerError::Io("simulated write failure".into()));
        }
        *self.record() = record.clone();
        Ok(())
    }
}
