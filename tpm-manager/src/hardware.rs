// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Generation-independent contracts for status, ownership and NVRAM.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CommandError, Result};

/// Attempts made at the take-ownership command before giving up.
pub const MAX_OWNERSHIP_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryAttackInfo {
    pub counter: u32,
    pub threshold: u32,
    pub in_lockout: bool,
    pub seconds_remaining: u32,
}

/// Read-only view of the TPM's state.
pub trait TpmStatus: Send {
    /// Cached after the first successful query.
    fn is_enabled(&mut self) -> Result<bool>;
    /// Cached once true; ownership never reverts.
    fn is_owned(&mut self) -> Result<bool>;
    /// Always queried afresh.
    fn dictionary_attack_info(&mut self) -> Result<DictionaryAttackInfo>;
}

/// Takes ownership of the TPM. Safe to re-run after any failure or crash.
pub trait TpmInitializer: Send {
    fn initialize_ownership(&mut self, status: &mut dyn TpmStatus) -> Result<()>;
}

/// NVRAM space lifecycle: define, write once, read, destroy.
pub trait TpmNvram: Send {
    fn define(&mut self, index: u32, length: usize) -> Result<()>;
    /// Destroying an undefined space succeeds.
    fn destroy(&mut self, index: u32) -> Result<()>;
    /// Writes at most once; a successful write also locks the space.
    fn write(&mut self, index: u32, data: &[u8]) -> Result<()>;
    /// Returns the whole space, `size(index)` bytes. After a short or empty
    /// write the tail keeps the device's fill bytes.
    fn read(&mut self, index: u32) -> Result<Vec<u8>>;
    /// Never fails for a space that is absent or could not exist.
    fn is_defined(&mut self, index: u32) -> Result<bool>;
    fn is_locked(&mut self, index: u32) -> Result<bool>;
    fn size(&mut self, index: u32) -> Result<usize>;
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
pub(crate) fn retry_transient<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, CommandError>,
) -> Result<T, CommandError> {
    let mut last_err = None;
    for attempt in 1..=MAX_OWNERSHIP_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                warn!(attempt, "{what} failed transiently: {err}");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        CommandError::Communication(format!("{what} was never attempted"))
    }))
}
