// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 backend.
//!
//! The hardware is reached through [`Tpm2Device`], which hands out one
//! owned [`Tpm2Commands`] connection per operation. `tpm2::TpmContext`
//! is the production implementation.

mod initializer;
mod nvram;
mod status;

pub use initializer::Tpm2Initializer;
pub use nvram::Tpm2Nvram;
pub use status::Tpm2Status;

use tpm2::{
    tpm_pt, tpm_rc, HmacSession, NvPublic, TaggedProperty, TpmContext, TpmDevice, TpmRcError,
    TpmaPermanent, TpmaStartupClear, TpmsNvPublic, Transport,
};

use crate::error::CommandError;
use crate::hardware::DictionaryAttackInfo;

/// Opens connections to a TPM 2.0.
pub trait Tpm2Device: Send {
    type Connection: Tpm2Commands;

    fn open(&self) -> Result<Self::Connection, CommandError>;
}

/// The TPM 2.0 commands the manager issues.
///
/// NV commands that need owner authorization run inside a session
/// returned by [`start_session`](Self::start_session); the caller flushes it.
pub trait Tpm2Commands {
    type Session;

    fn read_state(&mut self) -> Result<Tpm2State, CommandError>;
    fn stir_random(&mut self, entropy: &[u8]) -> Result<(), CommandError>;
    fn get_random(&mut self, len: usize) -> Result<Vec<u8>, CommandError>;
    fn take_ownership(
        &mut self,
        owner_password: &[u8],
        endorsement_password: &[u8],
        lockout_password: &[u8],
    ) -> Result<(), CommandError>;

    fn start_session(&mut self) -> Result<Self::Session, CommandError>;
    fn flush_session(&mut self, session: Self::Session) -> Result<(), CommandError>;

    /// `None` when the index is not defined.
    fn nv_read_public(&mut self, index: u32) -> Result<Option<NvPublic>, CommandError>;
    fn nv_define_space(
        &mut self,
        session: &mut Self::Session,
        owner_password: &[u8],
        public: &TpmsNvPublic,
    ) -> Result<(), CommandError>;
    fn nv_undefine_space(
        &mut self,
        session: &mut Self::Session,
        owner_password: &[u8],
        nv: &NvPublic,
    ) -> Result<(), CommandError>;
    fn nv_write(
        &mut self,
        session: &mut Self::Session,
        owner_password: &[u8],
        nv: &NvPublic,
        offset: u16,
        data: &[u8],
    ) -> Result<(), CommandError>;
    fn nv_write_lock(
        &mut self,
        session: &mut Self::Session,
        owner_password: &[u8],
        nv: &NvPublic,
    ) -> Result<(), CommandError>;
    fn nv_read(&mut self, nv: &NvPublic, offset: u16, len: u16) -> Result<Vec<u8>, CommandError>;
}

/// Snapshot of the TPM properties status queries are answered from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tpm2State {
    pub permanent: u32,
    pub startup_clear: u32,
    pub lockout_counter: u32,
    pub max_auth_fail: u32,
    pub lockout_interval: u32,
    pub lockout_recovery: u32,
}

impl Tpm2State {
    pub fn is_enabled(&self) -> bool {
        let required = TpmaStartupClear::SH_ENABLE | TpmaStartupClear::EH_ENABLE;
        self.startup_clear & required == required
    }

    pub fn is_owned(&self) -> bool {
        let required = TpmaPermanent::OWNER_AUTH_SET
            | TpmaPermanent::ENDORSEMENT_AUTH_SET
            | TpmaPermanent::LOCKOUT_AUTH_SET;
        self.permanent & required == required
    }

    pub fn dictionary_attack_info(&self) -> DictionaryAttackInfo {
        DictionaryAttackInfo {
            counter: self.lockout_counter,
            threshold: self.max_auth_fail,
            in_lockout: self.permanent & TpmaPermanent::IN_LOCKOUT != 0,
            seconds_remaining: self.lockout_counter.saturating_mul(self.lockout_interval),
        }
    }

    fn from_properties(props: &[TaggedProperty]) -> Result<Self, CommandError> {
        let find = |property: u32| {
            props
                .iter()
                .find(|p| p.property == property)
                .map(|p| p.value)
                .ok_or_else(|| {
                    CommandError::Communication(format!(
                        "TPM did not report property 0x{property:08x}"
                    ))
                })
        };
        Ok(Self {
            permanent: find(tpm_pt::PERMANENT)?,
            startup_clear: find(tpm_pt::STARTUP_CLEAR)?,
            lockout_counter: find(tpm_pt::LOCKOUT_COUNTER)?,
            max_auth_fail: find(tpm_pt::MAX_AUTH_FAIL)?,
            lockout_interval: find(tpm_pt::LOCKOUT_INTERVAL)?,
            lockout_recovery: find(tpm_pt::LOCKOUT_RECOVERY)?,
        })
    }
}

/// Sort a `tpm2` crate error into retry, rejection or communication failure.
pub(crate) fn classify(err: anyhow::Error) -> CommandError {
    match err.downcast_ref::<TpmRcError>() {
        Some(rc) if rc.is_retry() => CommandError::Retry(rc.code),
        Some(rc) => CommandError::Rejected(rc.code),
        None => CommandError::Communication(format!("{err:#}")),
    }
}

/// Response code with handle/parameter/session numbers stripped.
pub(crate) fn base_code(err: &CommandError) -> Option<u32> {
    err.code().map(tpm_rc::base)
}

impl<T: Transport> Tpm2Commands for TpmContext<T> {
    type Session = HmacSession;

    fn read_state(&mut self) -> Result<Tpm2State, CommandError> {
        // PERMANENT and STARTUP_CLEAR are adjacent, as are the four lockout properties
        let mut props = self.get_properties(tpm_pt::PERMANENT, 2).map_err(classify)?;
        props.extend(
            self.get_properties(tpm_pt::LOCKOUT_COUNTER, 4)
                .map_err(classify)?,
        );
        Tpm2State::from_properties(&props)
    }

    fn stir_random(&mut self, entropy: &[u8]) -> Result<(), CommandError> {
        TpmContext::stir_random(self, entropy).map_err(classify)
    }

    fn get_random(&mut self, len: usize) -> Result<Vec<u8>, CommandError> {
        TpmContext::get_random(self, len).map_err(classify)
    }

    fn take_ownership(
        &mut self,
        owner_password: &[u8],
        endorsement_password: &[u8],
        lockout_password: &[u8],
    ) -> Result<(), CommandError> {
        TpmContext::take_ownership(self, owner_password, endorsement_password, lockout_password)
            .map_err(classify)
    }

    fn start_session(&mut self) -> Result<HmacSession, CommandError> {
        self.start_hmac_session().map_err(classify)
    }

    fn flush_session(&mut self, session: HmacSession) -> Result<(), CommandError> {
        self.flush_context(session.handle()).map_err(classify)
    }

    fn nv_read_public(&mut self, index: u32) -> Result<Option<NvPublic>, CommandError> {
        TpmContext::nv_read_public(self, index).map_err(classify)
    }

    fn nv_define_space(
        &mut self,
        session: &mut HmacSession,
        owner_password: &[u8],
        public: &TpmsNvPublic,
    ) -> Result<(), CommandError> {
        TpmContext::nv_define_space(self, session, owner_password, public, &[]).map_err(classify)
    }

    fn nv_undefine_space(
        &mut self,
        session: &mut HmacSession,
        owner_password: &[u8],
        nv: &NvPublic,
    ) -> Result<(), CommandError> {
        TpmContext::nv_undefine_space(self, session, owner_password, nv).map_err(classify)
    }

    fn nv_write(
        &mut self,
        session: &mut HmacSession,
        owner_password: &[u8],
        nv: &NvPublic,
        offset: u16,
        data: &[u8],
    ) -> Result<(), CommandError> {
        TpmContext::nv_write(self, session, owner_password, nv, offset, data).map_err(classify)
    }

    fn nv_write_lock(
        &mut self,
        session: &mut HmacSession,
        owner_password: &[u8],
        nv: &NvPublic,
    ) -> Result<(), CommandError> {
        TpmContext::nv_write_lock(self, session, owner_password, nv).map_err(classify)
    }

    fn nv_read(&mut self, nv: &NvPublic, offset: u16, len: u16) -> Result<Vec<u8>, CommandError> {
        TpmContext::nv_read(self, nv, offset, len).map_err(classify)
    }
}

/// The TPM character device of this machine.
#[derive(Debug, Clone, Default)]
pub struct SystemTpm2 {
    path: Option<String>,
}

impl SystemTpm2 {
    /// `None` picks `/dev/tpmrm0`, falling back to `/dev/tpm0`.
    pub fn new(path: Option<String>) -> Self {
        Self { path }
    }
}

impl Tpm2Device for SystemTpm2 {
    type Connection = TpmContext<TpmDevice>;

    fn open(&self) -> Result<Self::Connection, CommandError> {
        TpmContext::new(self.path.as_deref()).map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2::TpmCc;

    #[test]
    fn test_state_flags() {
        let state = Tpm2State {
            permanent: TpmaPermanent::OWNER_AUTH_SET
                | TpmaPermanent::ENDORSEMENT_AUTH_SET
                | TpmaPermanent::LOCKOUT_AUTH_SET
                | TpmaPermanent::IN_LOCKOUT,
            startup_clear: TpmaStartupClear::SH_ENABLE | TpmaStartupClear::EH_ENABLE,
            lockout_counter: 3,
            max_auth_fail: 32,
            lockout_interval: 7200,
            lockout_recovery: 86400,
        };
        assert!(state.is_enabled());
        assert!(state.is_owned());
        let da = state.dictionary_attack_info();
        assert!(da.in_lockout);
        assert_eq!(da.counter, 3);
        assert_eq!(da.threshold, 32);
        assert_eq!(da.seconds_remaining, 3 * 7200);
    }

    #[test]
    fn test_partial_auth_is_not_owned() {
        let state = Tpm2State {
            permanent: TpmaPermanent::OWNER_AUTH_SET,
            startup_clear: TpmaStartupClear::SH_ENABLE,
            ..Default::default()
        };
        assert!(!state.is_owned());
        assert!(!state.is_enabled());
    }

    #[test]
    fn test_classify() {
        let retry: anyhow::Error = TpmRcError {
            command: TpmCc::HierarchyChangeAuth,
            code: tpm_rc::RETRY,
        }
        .into();
        assert_eq!(classify(retry), CommandError::Retry(tpm_rc::RETRY));

        let rejected = anyhow::Error::from(TpmRcError {
            command: TpmCc::NvWrite,
            code: tpm_rc::NV_LOCKED,
        })
        .context("NV_Write failed at offset 0");
        assert_eq!(classify(rejected), CommandError::Rejected(tpm_rc::NV_LOCKED));

        let io = anyhow::anyhow!("failed to read TPM response");
        assert!(classify(io).is_transient());
    }
}
