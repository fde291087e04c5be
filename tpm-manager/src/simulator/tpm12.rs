// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};

use crate::error::CommandError;
use crate::hardware::DictionaryAttackInfo;
use crate::tpm12::{
    tpm1_rc, PcrBinding, PcrValue, Tpm1Commands, Tpm1Device, Tpm1Flags, Tpm1NvInfo,
    NV_BINDING_LOCALITY,
};

const TPM_DISABLED: u32 = 0x007;
const MAX_NV_SIZE: u32 = 2048;

#[derive(Debug)]
struct NvSpace {
    binding: PcrBinding,
    data: Vec<u8>,
    written: bool,
    locked: bool,
}

#[derive(Debug)]
struct State {
    disabled: bool,
    offline: bool,
    owner_auth: Option<Vec<u8>>,
    srk_restricted: bool,
    pcr0: PcrValue,
    locality: u8,
    nv: BTreeMap<u32, NvSpace>,
    ownership_failures: VecDeque<CommandError>,
    take_ownership_calls: usize,
    auth_failures: u32,
    auth_fail_threshold: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            disabled: false,
            offline: false,
            owner_auth: None,
            srk_restricted: false,
            pcr0: [0; 20],
            locality: NV_BINDING_LOCALITY,
            nv: BTreeMap::new(),
            ownership_failures: VecDeque::new(),
            take_ownership_calls: 0,
            auth_failures: 0,
            auth_fail_threshold: 10,
        }
    }
}

impl State {
    fn online(&self) -> Result<(), CommandError> {
        if self.offline {
            return Err(CommandError::Communication("simulated TPM is offline".into()));
        }
        Ok(())
    }

    fn authorize_owner(&mut self, password: &[u8]) -> Result<(), CommandError> {
        if self.owner_auth.as_deref() != Some(password) {
            self.auth_failures = self.auth_failures.saturating_add(1);
            return Err(CommandError::Rejected(tpm1_rc::AUTHFAIL));
        }
        Ok(())
    }

    fn bound_space(&mut self, index: u32) -> Result<&mut NvSpace, CommandError> {
        let (pcr0, locality) = (self.pcr0, self.locality);
        let space = self
            .nv
            .get_mut(&index)
            .ok_or(CommandError::Rejected(tpm1_rc::BADINDEX))?;
        if space.binding.locality != locality {
            return Err(CommandError::Rejected(tpm1_rc::BAD_LOCALITY));
        }
        if space.binding.value != pcr0 {
            return Err(CommandError::Rejected(tpm1_rc::WRONGPCRVAL));
        }
        Ok(space)
    }
}

/// In-memory TPM 1.2 with owner auth, PCR 0 and PCR-bound NV spaces.
#[derive(Debug, Clone, Default)]
pub struct Tpm1Simulator {
    state: Arc<Mutex<State>>,
}

impl Tpm1Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn disable(&self) {
        self.state().disabled = true;
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn fail_take_ownership(&self, errors: impl IntoIterator<Item = CommandError>) {
        self.state().ownership_failures.extend(errors);
    }

    pub fn take_ownership_calls(&self) -> usize {
        self.state().take_ownership_calls
    }

    pub fn owner_auth(&self) -> Option<Vec<u8>> {
        self.state().owner_auth.clone()
    }

    pub fn is_srk_restricted(&self) -> bool {
        self.state().srk_restricted
    }

    /// Extend PCR 0; the digest is truncated to the PCR width.
    pub fn extend_pcr0(&self, measurement: &[u8]) {
        let mut state = self.state();
        let digest = Sha256::new()
            .chain_update(state.pcr0)
            .chain_update(measurement)
            .finalize();
        state.pcr0.copy_from_slice(&digest[..20]);
    }

    pub fn set_locality(&self, locality: u8) {
        self.state().locality = locality;
    }
}

impl Tpm1Device for Tpm1Simulator {
    type Connection = Tpm1SimulatorConnection;

    fn open(&self) -> Result<Self::Connection, CommandError> {
        self.state().online()?;
        Ok(Tpm1SimulatorConnection { sim: self.clone() })
    }
}

pub struct Tpm1SimulatorConnection {
    sim: Tpm1Simulator,
}

impl Tpm1SimulatorConnection {
    fn state(&self) -> Result<MutexGuard<'_, State>, CommandError> {
        let state = self.sim.state();
        state.online()?;
        Ok(state)
    }
}

impl Tpm1Commands for Tpm1SimulatorConnection {
    fn read_flags(&mut self) -> Result<Tpm1Flags, CommandError> {
        let state = self.state()?;
        Ok(Tpm1Flags {
            disabled: state.disabled,
            owned: state.owner_auth.is_some(),
        })
    }

    fn dictionary_attack_info(&mut self) -> Result<DictionaryAttackInfo, CommandError> {
        let state = self.state()?;
        let in_lockout = state.auth_failures >= state.auth_fail_threshold;
        Ok(DictionaryAttackInfo {
            counter: state.auth_failures,
            threshold: state.auth_fail_threshold,
            in_lockout,
            seconds_remaining: if in_lockout { 60 } else { 0 },
        })
    }

    fn test_owner_auth(&mut self, owner_password: &[u8]) -> Result<bool, CommandError> {
        let state = self.state()?;
        Ok(state.owner_auth.as_deref() == Some(owner_password))
    }

    fn take_ownership(&mut self, owner_password: &[u8]) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.take_ownership_calls += 1;
        if let Some(err) = state.ownership_failures.pop_front() {
            return Err(err);
        }
        if state.disabled {
            return Err(CommandError::Rejected(TPM_DISABLED));
        }
        if state.owner_auth.is_some() {
            return Err(CommandError::Rejected(tpm1_rc::OWNER_SET));
        }
        state.owner_auth = Some(owner_password.to_vec());
        state.srk_restricted = true;
        Ok(())
    }

    fn unrestrict_srk(&mut self, owner_password: &[u8]) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.authorize_owner(owner_password)?;
        state.srk_restricted = false;
        Ok(())
    }

    fn change_owner_auth(&mut self, current: &[u8], new: &[u8]) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.authorize_owner(current)?;
        state.owner_auth = Some(new.to_vec());
        Ok(())
    }

    fn read_pcr(&mut self, pcr: u32) -> Result<PcrValue, CommandError> {
        let state = self.state()?;
        if pcr != 0 {
            return Err(CommandError::Rejected(tpm1_rc::BADINDEX));
        }
        Ok(state.pcr0)
    }

    fn nv_info(&mut self, index: u32) -> Result<Option<Tpm1NvInfo>, CommandError> {
        let state = self.state()?;
        Ok(state.nv.get(&index).map(|space| Tpm1NvInfo {
            size: space.data.len() as u32,
            written: space.written,
            write_locked: space.locked,
        }))
    }

    fn nv_define(
        &mut self,
        owner_password: &[u8],
        index: u32,
        size: u32,
        binding: &PcrBinding,
    ) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.authorize_owner(owner_password)?;
        if size > MAX_NV_SIZE {
            return Err(CommandError::Rejected(tpm1_rc::NOSPACE));
        }
        if state.nv.contains_key(&index) {
            return Err(CommandError::Rejected(tpm1_rc::BADINDEX));
        }
        state.nv.insert(
            index,
            NvSpace {
                binding: *binding,
                data: vec![0xff; size as usize],
                written: false,
                locked: false,
            },
        );
        Ok(())
    }

    fn nv_release(&mut self, owner_password: &[u8], index: u32) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.authorize_owner(owner_password)?;
        state
            .nv
            .remove(&index)
            .map(drop)
            .ok_or(CommandError::Rejected(tpm1_rc::BADINDEX))
    }

    fn nv_write(&mut self, index: u32, data: &[u8]) -> Result<(), CommandError> {
        let mut state = self.state()?;
        let space = state.bound_space(index)?;
        if space.locked {
            return Err(CommandError::Rejected(tpm1_rc::AREA_LOCKED));
        }
        if data.len() > space.data.len() {
            return Err(CommandError::Rejected(tpm1_rc::BAD_DATASIZE));
        }
        space.data[..data.len()].copy_from_slice(data);
        space.written = true;
        space.locked = true;
        Ok(())
    }

    fn nv_read(&mut self, index: u32, offset: u32, len: u32) -> Result<Vec<u8>, CommandError> {
        let mut state = self.state()?;
        let space = state.bound_space(index)?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > space.data.len() {
            return Err(CommandError::Rejected(tpm1_rc::BAD_DATASIZE));
        }
        Ok(space.data[start..end].to_vec())
    }
}
