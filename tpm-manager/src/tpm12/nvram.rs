// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::debug;

use super::{
    tpm1_rc, PcrBinding, Tpm1Commands, Tpm1Device, Tpm1NvInfo, MAX_NV_CHUNK, NV_BINDING_LOCALITY,
    NV_BINDING_PCR,
};
use crate::error::{CommandError, Result, TpmManagerError};
use crate::hardware::TpmNvram;
use crate::secret_store::SecretStore;

pub struct Tpm1Nvram<D> {
    device: D,
    store: Arc<dyn SecretStore>,
}

fn nv_error(context: &str, err: CommandError) -> TpmManagerError {
    match err.code() {
        Some(
            tpm1_rc::AUTHFAIL
            | tpm1_rc::BADINDEX
            | tpm1_rc::NOSPACE
            | tpm1_rc::WRONGPCRVAL
            | tpm1_rc::BAD_DATASIZE
            | tpm1_rc::AREA_LOCKED
            | tpm1_rc::BAD_LOCALITY,
        ) => TpmManagerError::State(format!("{context}: {err}")),
        _ => TpmManagerError::device(context, err),
    }
}

impl<D: Tpm1Device> Tpm1Nvram<D> {
    pub fn new(device: D, store: Arc<dyn SecretStore>) -> Self {
        Self { device, store }
    }

    fn owner_password(&self) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        self.store
            .read()?
            .owner_password()
            .ok_or_else(|| TpmManagerError::state("owner password is not available"))
    }

    fn info(conn: &mut D::Connection, index: u32) -> Result<Option<Tpm1NvInfo>> {
        conn.nv_info(index)
            .map_err(|e| TpmManagerError::device("failed to query NV space", e))
    }

    fn defined_info(conn: &mut D::Connection, index: u32) -> Result<Tpm1NvInfo> {
        Self::info(conn, index)?
            .ok_or_else(|| TpmManagerError::state(format!("NV index {index} is not defined")))
    }
}

impl<D: Tpm1Device> TpmNvram for Tpm1Nvram<D> {
    fn define(&mut self, index: u32, length: usize) -> Result<()> {
        let size = u32::try_from(length)
            .map_err(|_| TpmManagerError::state(format!("NV length {length} is too large")))?;
        let owner_password = self.owner_password()?;
        let mut conn = self.device.open()?;
        let value = conn
            .read_pcr(NV_BINDING_PCR)
            .map_err(|e| TpmManagerError::device("failed to read PCR", e))?;
        let binding = PcrBinding {
            pcr: NV_BINDING_PCR,
            value,
            locality: NV_BINDING_LOCALITY,
        };
        conn.nv_define(&owner_password, index, size, &binding)
            .map_err(|e| nv_error("failed to define NV space", e))?;
        debug!(index, length, "defined NV space");
        Ok(())
    }

    fn destroy(&mut self, index: u32) -> Result<()> {
        let mut conn = self.device.open()?;
        if Self::info(&mut conn, index)?.is_none() {
            debug!(index, "NV space already absent");
            return Ok(());
        }
        let owner_password = self.owner_password()?;
        conn.nv_release(&owner_password, index)
            .map_err(|e| nv_error("failed to destroy NV space", e))?;
        debug!(index, "destroyed NV space");
        Ok(())
    }

    fn write(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let mut conn = self.device.open()?;
        let info = Self::defined_info(&mut conn, index)?;
        if data.len() > info.size as usize {
            return Err(TpmManagerError::state(format!(
                "{} bytes do not fit NV space {index} of {} bytes",
                data.len(),
                info.size
            )));
        }
        if info.written || info.write_locked {
            return Err(TpmManagerError::state(format!(
                "NV space {index} was already written"
            )));
        }
        conn.nv_write(index, data)
            .map_err(|e| nv_error("failed to write NV space", e))?;
        debug!(index, len = data.len(), "wrote NV space");
        Ok(())
    }

    fn read(&mut self, index: u32) -> Result<Vec<u8>> {
        let mut conn = self.device.open()?;
        let info = Self::defined_info(&mut conn, index)?;
        if !info.written {
            return Err(TpmManagerError::state(format!(
                "NV space {index} has not been written"
            )));
        }
        let mut data = Vec::with_capacity(info.size as usize);
        let mut offset = 0;
        while offset < info.size {
            let len = (info.size - offset).min(MAX_NV_CHUNK);
            let chunk = conn
                .nv_read(index, offset, len)
                .map_err(|e| nv_error("failed to read NV space", e))?;
            if chunk.len() != len as usize {
                return Err(TpmManagerError::device(
                    "failed to read NV space",
                    format!("expected {len} bytes, got {}", chunk.len()),
                ));
            }
            data.extend_from_slice(&chunk);
            offset += len;
        }
        Ok(data)
    }

    fn is_defined(&mut self, index: u32) -> Result<bool> {
        let mut conn = self.device.open()?;
        Ok(Self::info(&mut conn, index)?.is_some())
    }

    fn is_locked(&mut self, index: u32) -> Result<bool> {
        let mut conn = self.device.open()?;
        Ok(Self::info(&mut conn, index)?.is_some_and(|info| info.write_locked))
    }

    fn size(&mut self, index: u32) -> Result<usize> {
        let mut conn = self.device.open()?;
        Ok(Self::defined_info(&mut conn, index)?.size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::{MemorySecretStore, SecretRecord};
    use crate::simulator::Tpm1Simulator;

    const OWNER: &[u8] = b"owner-password";

    fn owned_nvram() -> (Tpm1Simulator, Tpm1Nvram<Tpm1Simulator>) {
        let sim = Tpm1Simulator::new();
        sim.open().unwrap().take_ownership(OWNER).unwrap();
        let mut record = SecretRecord::default();
        record.owner_password = OWNER.to_vec();
        record.owner_dependencies.insert("nvram".into());
        let nvram = Tpm1Nvram::new(sim.clone(), Arc::new(MemorySecretStore::new(record)));
        (sim, nvram)
    }

    #[test]
    fn test_write_locks_implicitly() {
        let (_sim, mut nvram) = owned_nvram();
        nvram.define(5, 10).unwrap();
        assert_eq!(nvram.size(5).unwrap(), 10);
        assert!(matches!(nvram.read(5), Err(TpmManagerError::State(_))));

        nvram.write(5, b"nvram_data").unwrap();
        assert!(nvram.is_locked(5).unwrap());
        assert_eq!(nvram.read(5).unwrap(), b"nvram_data");
        assert!(matches!(
            nvram.write(5, b"again"),
            Err(TpmManagerError::State(_))
        ));

        nvram.destroy(5).unwrap();
        nvram.destroy(5).unwrap();
        assert!(!nvram.is_defined(5).unwrap());
    }

    #[test]
    fn test_space_is_bound_to_pcr0() {
        let (sim, mut nvram) = owned_nvram();
        nvram.define(1, 4).unwrap();
        nvram.write(1, b"boot").unwrap();

        sim.extend_pcr0(b"recovery mode");
        assert!(matches!(nvram.read(1), Err(TpmManagerError::State(_))));
    }

    #[test]
    fn test_space_is_bound_to_locality() {
        let (sim, mut nvram) = owned_nvram();
        nvram.define(1, 4).unwrap();
        sim.set_locality(0);
        assert!(matches!(
            nvram.write(1, b"boot"),
            Err(TpmManagerError::State(_))
        ));
        sim.set_locality(NV_BINDING_LOCALITY);
        nvram.write(1, b"boot").unwrap();
    }

    #[test]
    fn test_read_is_chunked() {
        let (_sim, mut nvram) = owned_nvram();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        nvram.define(9, data.len()).unwrap();
        nvram.write(9, &data).unwrap();
        assert_eq!(nvram.read(9).unwrap(), data);
    }
}
