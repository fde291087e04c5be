// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::RngCore;
use tpm2::{
    tpm_rc, NvPublic, TpmaNv, TpmaPermanent, TpmaStartupClear, TpmsNvPublic, MAX_NV_INDEX,
    MAX_NV_INDEX_SIZE, MAX_STIR_RANDOM_SIZE, NV_INDEX_FIRST,
};

use crate::error::CommandError;
use crate::tpm20::{Tpm2Commands, Tpm2Device, Tpm2State};

/// Session number one, as the TPM encodes it into format-one codes.
const SESSION_1: u32 = 0x100;
const FIRST_SESSION_HANDLE: u32 = 0x0200_0000;

#[derive(Debug)]
struct NvSpace {
    public: TpmsNvPublic,
    data: Vec<u8>,
}

impl NvSpace {
    fn nv_public(&self) -> Result<NvPublic, CommandError> {
        let name = self
            .public
            .name()
            .map_err(|e| CommandError::Communication(format!("{e:#}")))?;
        Ok(NvPublic {
            public: self.public.clone(),
            name,
        })
    }

    fn set(&mut self, bits: u32) {
        self.public.attributes = self.public.attributes.with(bits);
    }
}

#[derive(Debug)]
struct State {
    disabled: bool,
    offline: bool,
    owner_auth: Option<Vec<u8>>,
    endorsement_auth: Option<Vec<u8>>,
    lockout_auth: Option<Vec<u8>>,
    nv: BTreeMap<u32, NvSpace>,
    sessions: BTreeSet<u32>,
    next_session: u32,
    ownership_failures: VecDeque<CommandError>,
    take_ownership_calls: usize,
    stir_random_calls: usize,
    lockout_counter: u32,
    max_auth_fail: u32,
    lockout_interval: u32,
    lockout_recovery: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            disabled: false,
            offline: false,
            owner_auth: None,
            endorsement_auth: None,
            lockout_auth: None,
            nv: BTreeMap::new(),
            sessions: BTreeSet::new(),
            next_session: FIRST_SESSION_HANDLE,
            ownership_failures: VecDeque::new(),
            take_ownership_calls: 0,
            stir_random_calls: 0,
            lockout_counter: 0,
            max_auth_fail: 32,
            lockout_interval: 7200,
            lockout_recovery: 86400,
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

    fn authorize_owner(&mut self, session: u32, password: &[u8]) -> Result<(), CommandError> {
        if !self.sessions.contains(&session) {
            return Err(CommandError::Rejected(tpm_rc::HANDLE | SESSION_1));
        }
        let expected = self.owner_auth.as_deref().unwrap_or_default();
        if expected != password {
            self.lockout_counter = self.lockout_counter.saturating_add(1);
            return Err(CommandError::Rejected(tpm_rc::AUTH_FAIL | SESSION_1));
        }
        Ok(())
    }

    /// The session HMAC covers the index name, so a stale name fails auth.
    fn space_named(&mut self, nv: &NvPublic) -> Result<&mut NvSpace, CommandError> {
        let space = self
            .nv
            .get_mut(&nv.index())
            .ok_or(CommandError::Rejected(tpm_rc::HANDLE))?;
        if space.nv_public()?.name != nv.name {
            return Err(CommandError::Rejected(tpm_rc::AUTH_FAIL | SESSION_1));
        }
        Ok(space)
    }
}

/// In-memory TPM 2.0 with the hierarchy and NV behaviour the manager relies on.
///
/// Clones share the same state, so a test can keep one handle for
/// inspection while the manager owns another.
#[derive(Debug, Clone, Default)]
pub struct Tpm2Simulator {
    state: Arc<Mutex<State>>,
}

impl Tpm2Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turn off the storage and endorsement hierarchies.
    pub fn disable(&self) {
        self.state().disabled = true;
    }

    /// While offline every command fails with a communication error.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail the next take-ownership attempts with `errors`, in order.
    pub fn fail_take_ownership(&self, errors: impl IntoIterator<Item = CommandError>) {
        self.state().ownership_failures.extend(errors);
    }

    pub fn take_ownership_calls(&self) -> usize {
        self.state().take_ownership_calls
    }

    pub fn stir_random_calls(&self) -> usize {
        self.state().stir_random_calls
    }

    /// Sessions started and not yet flushed.
    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn owner_auth(&self) -> Option<Vec<u8>> {
        self.state().owner_auth.clone()
    }

    pub fn is_owned(&self) -> bool {
        let state = self.state();
        state.owner_auth.is_some() && state.endorsement_auth.is_some() && state.lockout_auth.is_some()
    }

    /// Set the owner authorization behind the manager's back.
    pub fn set_owner_auth(&self, password: &[u8]) {
        self.state().owner_auth = Some(password.to_vec());
    }

    pub fn set_lockout_counter(&self, counter: u32) {
        self.state().lockout_counter = counter;
    }

    /// Raw attributes of a defined space, for inspection.
    pub fn nv_attributes(&self, index: u32) -> Option<TpmaNv> {
        self.state().nv.get(&index).map(|s| s.public.attributes)
    }
}

impl Tpm2Device for Tpm2Simulator {
    type Connection = Tpm2SimulatorConnection;

    fn open(&self) -> Result<Self::Connection, CommandError> {
        self.state().online()?;
        Ok(Tpm2SimulatorConnection {
            sim: self.clone(),
        })
    }
}

pub struct Tpm2SimulatorConnection {
    sim: Tpm2Simulator,
}

impl Tpm2SimulatorConnection {
    fn state(&self) -> Result<MutexGuard<'_, State>, CommandError> {
        let state = self.sim.state();
        state.online()?;
        Ok(state)
    }
}

impl Tpm2Commands for Tpm2SimulatorConnection {
    type Session = u32;

    fn read_state(&mut self) -> Result<Tpm2State, CommandError> {
        let state = self.state()?;
        let mut permanent = 0;
        if state.owner_auth.is_some() {
            permanent |= TpmaPermanent::OWNER_AUTH_SET;
        }
        if state.endorsement_auth.is_some() {
            permanent |= TpmaPermanent::ENDORSEMENT_AUTH_SET;
        }
        if state.lockout_auth.is_some() {
            permanent |= TpmaPermanent::LOCKOUT_AUTH_SET;
        }
        if state.lockout_counter >= state.max_auth_fail {
            permanent |= TpmaPermanent::IN_LOCKOUT;
        }
        let mut startup_clear = TpmaStartupClear::PH_ENABLE;
        if !state.disabled {
            startup_clear |= TpmaStartupClear::SH_ENABLE | TpmaStartupClear::EH_ENABLE;
        }
        Ok(Tpm2State {
            permanent,
            startup_clear,
            lockout_counter: state.lockout_counter,
            max_auth_fail: state.max_auth_fail,
            lockout_interval: state.lockout_interval,
            lockout_recovery: state.lockout_recovery,
        })
    }

    fn stir_random(&mut self, entropy: &[u8]) -> Result<(), CommandError> {
        let mut state = self.state()?;
        if entropy.len() > MAX_STIR_RANDOM_SIZE {
            return Err(CommandError::Rejected(tpm_rc::SIZE));
        }
        state.stir_random_calls += 1;
        Ok(())
    }

    fn get_random(&mut self, len: usize) -> Result<Vec<u8>, CommandError> {
        self.state().map(drop)?;
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Ok(bytes)
    }

    fn take_ownership(
        &mut self,
        owner_password: &[u8],
        endorsement_password: &[u8],
        lockout_password: &[u8],
    ) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.take_ownership_calls += 1;
        if let Some(err) = state.ownership_failures.pop_front() {
            return Err(err);
        }
        if state.disabled {
            return Err(CommandError::Rejected(tpm_rc::HIERARCHY));
        }
        // hierarchies already holding an auth keep it, owner is set last
        if state.endorsement_auth.is_none() {
            state.endorsement_auth = Some(endorsement_password.to_vec());
        }
        if state.lockout_auth.is_none() {
            state.lockout_auth = Some(lockout_password.to_vec());
        }
        if state.owner_auth.is_none() {
            state.owner_auth = Some(owner_password.to_vec());
        }
        Ok(())
    }

    fn start_session(&mut self) -> Result<u32, CommandError> {
        let mut state = self.state()?;
        let handle = state.next_session;
        state.next_session += 1;
        state.sessions.insert(handle);
        Ok(handle)
    }

    fn flush_session(&mut self, session: u32) -> Result<(), CommandError> {
        let mut state = self.state()?;
        if !state.sessions.remove(&session) {
            return Err(CommandError::Rejected(tpm_rc::HANDLE));
        }
        Ok(())
    }

    fn nv_read_public(&mut self, index: u32) -> Result<Option<NvPublic>, CommandError> {
        let state = self.state()?;
        state.nv.get(&index).map(NvSpace::nv_public).transpose()
    }

    fn nv_define_space(
        &mut self,
        session: &mut u32,
        owner_password: &[u8],
        public: &TpmsNvPublic,
    ) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.authorize_owner(*session, owner_password)?;
        let index = public.nv_index;
        if !(NV_INDEX_FIRST..=NV_INDEX_FIRST + MAX_NV_INDEX).contains(&index) {
            return Err(CommandError::Rejected(tpm_rc::VALUE));
        }
        if usize::from(public.data_size) > MAX_NV_INDEX_SIZE {
            return Err(CommandError::Rejected(tpm_rc::SIZE));
        }
        if state.nv.contains_key(&index) {
            return Err(CommandError::Rejected(tpm_rc::NV_DEFINED));
        }
        state.nv.insert(
            index,
            NvSpace {
                public: public.clone(),
                data: vec![0; public.data_size.into()],
            },
        );
        Ok(())
    }

    fn nv_undefine_space(
        &mut self,
        session: &mut u32,
        owner_password: &[u8],
        nv: &NvPublic,
    ) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.authorize_owner(*session, owner_password)?;
        state.space_named(nv)?;
        state.nv.remove(&nv.index());
        Ok(())
    }

    fn nv_write(
        &mut self,
        session: &mut u32,
        owner_password: &[u8],
        nv: &NvPublic,
        offset: u16,
        data: &[u8],
    ) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.authorize_owner(*session, owner_password)?;
        let space = state.space_named(nv)?;
        let attributes = space.public.attributes;
        if attributes.is_write_locked() {
            return Err(CommandError::Rejected(tpm_rc::NV_LOCKED));
        }
        if !attributes.contains(TpmaNv::OWNER_WRITE) {
            return Err(CommandError::Rejected(tpm_rc::NV_AUTHORIZATION));
        }
        let start = usize::from(offset);
        let end = start + data.len();
        if end > space.data.len() {
            return Err(CommandError::Rejected(tpm_rc::NV_RANGE));
        }
        space.data[start..end].copy_from_slice(data);
        space.set(TpmaNv::WRITTEN);
        Ok(())
    }

    fn nv_write_lock(
        &mut self,
        session: &mut u32,
        owner_password: &[u8],
        nv: &NvPublic,
    ) -> Result<(), CommandError> {
        let mut state = self.state()?;
        state.authorize_owner(*session, owner_password)?;
        let space = state.space_named(nv)?;
        let attributes = space.public.attributes;
        if !attributes.contains(TpmaNv::WRITE_DEFINE) && !attributes.contains(TpmaNv::WRITE_STCLEAR)
        {
            return Err(CommandError::Rejected(tpm_rc::NV_AUTHORIZATION));
        }
        space.set(TpmaNv::WRITE_LOCKED);
        Ok(())
    }

    fn nv_read(&mut self, nv: &NvPublic, offset: u16, len: u16) -> Result<Vec<u8>, CommandError> {
        let state = self.state()?;
        let space = state
            .nv
            .get(&nv.index())
            .ok_or(CommandError::Rejected(tpm_rc::HANDLE))?;
        if !space.public.attributes.is_written() {
            return Err(CommandError::Rejected(tpm_rc::NV_UNINITIALIZED));
        }
        let start = usize::from(offset);
        let end = start + usize::from(len);
        if end > space.data.len() {
            return Err(CommandError::Rejected(tpm_rc::NV_RANGE));
        }
        Ok(space.data[start..end].to_vec())
    }
}
