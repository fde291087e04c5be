// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tpm2::{
    tpm_rc, NvPublic, TpmaNv, TpmsNvPublic, MAX_NV_BUFFER_SIZE, MAX_NV_INDEX, MAX_NV_INDEX_SIZE,
    NV_INDEX_FIRST,
};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{base_code, Tpm2Commands, Tpm2Device};
use crate::error::{CommandError, Result, TpmManagerError};
use crate::hardware::TpmNvram;
use crate::secret_store::SecretStore;

pub struct Tpm2Nvram<D> {
    device: D,
    store: Arc<dyn SecretStore>,
}

fn nv_handle(index: u32) -> Result<u32> {
    if index > MAX_NV_INDEX {
        return Err(TpmManagerError::state(format!(
            "NV index 0x{index:x} out of range"
        )));
    }
    Ok(NV_INDEX_FIRST + index)
}

/// Rejections caused by the space's state or its authorization are
/// reported as state errors, everything else as device errors.
fn nv_error(context: &str, err: CommandError) -> TpmManagerError {
    match base_code(&err) {
        Some(
            tpm_rc::NV_DEFINED
            | tpm_rc::NV_LOCKED
            | tpm_rc::NV_UNINITIALIZED
            | tpm_rc::NV_AUTHORIZATION
            | tpm_rc::NV_RANGE
            | tpm_rc::NV_SIZE
            | tpm_rc::NV_SPACE
            | tpm_rc::BAD_AUTH
            | tpm_rc::AUTH_FAIL,
        ) => TpmManagerError::State(format!("{context}: {err}")),
        _ => TpmManagerError::device(context, err),
    }
}

/// Run `f` inside a fresh owner session, flushing it whatever `f` returns.
fn with_session<C: Tpm2Commands, T>(
    conn: &mut C,
    f: impl FnOnce(&mut C, &mut C::Session) -> Result<T, CommandError>,
) -> Result<T, CommandError> {
    let mut session = conn.start_session()?;
    let result = f(conn, &mut session);
    if let Err(err) = conn.flush_session(session) {
        warn!("failed to flush NV session: {err}");
    }
    result
}

impl<D: Tpm2Device> Tpm2Nvram<D> {
    pub fn new(device: D, store: Arc<dyn SecretStore>) -> Self {
        Self { device, store }
    }

    fn owner_password(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.store
            .read()?
            .owner_password()
            .ok_or_else(|| TpmManagerError::state("owner password is not available"))
    }

    fn public(&self, conn: &mut D::Connection, index: u32) -> Result<Option<NvPublic>> {
        conn.nv_read_public(nv_handle(index)?)
            .map_err(|e| TpmManagerError::device("failed to read NV public area", e))
    }

    fn defined_public(&self, conn: &mut D::Connection, index: u32) -> Result<NvPublic> {
        self.public(conn, index)?
            .ok_or_else(|| TpmManagerError::state(format!("NV index {index} is not defined")))
    }
}

impl<D: Tpm2Device> TpmNvram for Tpm2Nvram<D> {
    fn define(&mut self, index: u32, length: usize) -> Result<()> {
        let handle = nv_handle(index)?;
        if length > MAX_NV_INDEX_SIZE {
            return Err(TpmManagerError::state(format!(
                "NV space of {length} bytes exceeds {MAX_NV_INDEX_SIZE}"
            )));
        }
        let owner_password = self.owner_password()?;
        let public = TpmsNvPublic::new(handle, length as u16, TpmaNv::managed_space());

        let mut conn = self.device.open()?;
        with_session(&mut conn, |conn, session| {
            conn.nv_define_space(session, &owner_password, &public)
        })
        .map_err(|e| nv_error("failed to define NV space", e))?;
        debug!(index, length, "defined NV space");
        Ok(())
    }

    fn destroy(&mut self, index: u32) -> Result<()> {
        let mut conn = self.device.open()?;
        let Some(nv) = self.public(&mut conn, index)? else {
            debug!(index, "NV space already absent");
            return Ok(());
        };
        let owner_password = self.owner_password()?;
        with_session(&mut conn, |conn, session| {
            conn.nv_undefine_space(session, &owner_password, &nv)
        })
        .map_err(|e| nv_error("failed to destroy NV space", e))?;
        debug!(index, "destroyed NV space");
        Ok(())
    }

    fn write(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let mut conn = self.device.open()?;
        let nv = self.defined_public(&mut conn, index)?;
        if data.len() > nv.size() {
            return Err(TpmManagerError::state(format!(
                "{} bytes do not fit NV space {index} of {} bytes",
                data.len(),
                nv.size()
            )));
        }
        if nv.attributes().is_written() || nv.attributes().is_write_locked() {
            return Err(TpmManagerError::state(format!(
                "NV space {index} was already written"
            )));
        }
        let owner_password = self.owner_password()?;
        let handle = nv.index();

        with_session(&mut conn, |conn, session| {
            let mut current = nv;
            let mut offset = 0usize;
            loop {
                let end = (offset + MAX_NV_BUFFER_SIZE).min(data.len());
                conn.nv_write(
                    session,
                    &owner_password,
                    &current,
                    offset as u16,
                    &data[offset..end],
                )?;
                // the name covers the WRITTEN attribute and has now changed
                current = conn.nv_read_public(handle)?.ok_or_else(|| {
                    CommandError::Communication(format!("NV index 0x{handle:08x} vanished"))
                })?;
                offset = end;
                if offset >= data.len() {
                    break;
                }
            }
            conn.nv_write_lock(session, &owner_password, &current)
        })
        .map_err(|e| nv_error("failed to write NV space", e))?;
        debug!(index, len = data.len(), "wrote and locked NV space");
        Ok(())
    }

    fn read(&mut self, index: u32) -> Result<Vec<u8>> {
        let mut conn = self.device.open()?;
        let nv = self.defined_public(&mut conn, index)?;
        if !nv.attributes().is_written() {
            return Err(TpmManagerError::state(format!(
                "NV space {index} has not been written"
            )));
        }

        let mut data = Vec::with_capacity(nv.size());
        while data.len() < nv.size() {
            let len = (nv.size() - data.len()).min(MAX_NV_BUFFER_SIZE);
            let chunk = conn
                .nv_read(&nv, data.len() as u16, len as u16)
                .map_err(|e| nv_error("failed to read NV space", e))?;
            if chunk.is_empty() {
                return Err(TpmManagerError::device(
                    "failed to read NV space",
                    "TPM returned no data",
                ));
            }
            data.extend_from_slice(&chunk);
        }
        data.truncate(nv.size());
        Ok(data)
    }

    fn is_defined(&mut self, index: u32) -> Result<bool> {
        if index > MAX_NV_INDEX {
            return Ok(false);
        }
        let mut conn = self.device.open()?;
        Ok(self.public(&mut conn, index)?.is_some())
    }

    fn is_locked(&mut self, index: u32) -> Result<bool> {
        if index > MAX_NV_INDEX {
            return Ok(false);
        }
        let mut conn = self.device.open()?;
        Ok(self
            .public(&mut conn, index)?
            .is_some_and(|nv| nv.attributes().is_write_locked()))
    }

    fn size(&mut self, index: u32) -> Result<usize> {
        let mut conn = self.device.open()?;
        Ok(self.defined_public(&mut conn, index)?.size())
    }
}
