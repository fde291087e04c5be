// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! This module provides the ownership, random and NV space operations.

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::constants::*;
use super::device::*;
use super::marshal::*;
use super::session::*;
use super::types::*;

/// Most entropy a single TPM2_StirRandom accepts.
pub const MAX_STIR_RANDOM_SIZE: usize = 128;

/// Pure Rust TPM context
pub struct TpmContext<T = TpmDevice> {
    transport: T,
}

impl TpmContext<TpmDevice> {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self { transport: device })
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.transport.path()
    }
}

impl<T: Transport> TpmContext<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn execute(
        &mut self,
        cmd: &TpmCommand,
        auths: &[AuthCommand],
        response_handles: usize,
    ) -> Result<ResponseParts> {
        let bytes = cmd.encode(auths)?;
        let raw = self
            .transport
            .transmit(&bytes)
            .with_context(|| format!("failed to exchange TPM2_{:?}", cmd.code()))?;
        let response = TpmResponse::parse(&raw)?;
        response.ensure_success(cmd.code())?;
        response.into_parts(response_handles)
    }

    fn execute_with_session(
        &mut self,
        cmd: &TpmCommand,
        session: &mut HmacSession,
        auth_value: &[u8],
        response_handles: usize,
    ) -> Result<ResponseParts> {
        let auth = session.authorize(&cmd.cp_hash(), auth_value)?;
        let parts = self.execute(cmd, &[auth], response_handles)?;
        let resp_auth = parts
            .auths
            .first()
            .with_context(|| format!("TPM2_{:?} response lacks session", cmd.code()))?;
        session.verify(&parts.rp_hash(cmd.code()), auth_value, resp_auth)?;
        Ok(parts)
    }

    // ==================== Capabilities ====================

    /// Read `count` TPM properties starting at `first`.
    pub fn get_properties(&mut self, first: u32, count: u32) -> Result<Vec<TaggedProperty>> {
        let mut cmd = TpmCommand::new(TpmCc::GetCapability);
        cmd.add_u32(TpmCap::TpmProperties as u32);
        cmd.add_u32(first);
        cmd.add_u32(count);

        let parts = self.execute(&cmd, &[], 0)?;
        let mut buf = parts.parameter_buffer();
        let _more_data = buf.get_u8()?;
        let capability = buf.get_u32()?;
        if capability != TpmCap::TpmProperties as u32 {
            bail!("unexpected capability in response: 0x{capability:08x}");
        }
        let n = buf.get_u32()?;
        (0..n).map(|_| TaggedProperty::unmarshal(&mut buf)).collect()
    }

    /// Read a single TPM property.
    pub fn get_property(&mut self, property: u32) -> Result<u32> {
        self.get_properties(property, 1)?
            .into_iter()
            .find(|p| p.property == property)
            .map(|p| p.value)
            .with_context(|| format!("TPM did not report property 0x{property:08x}"))
    }

    // ==================== Random Number Generation ====================

    /// Generate random bytes using the TPM's hardware RNG
    pub fn get_random(&mut self, num_bytes: usize) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(num_bytes);

        // TPM may return fewer bytes than requested, so loop
        while result.len() < num_bytes {
            let request_size = (num_bytes - result.len()).min(48) as u16;

            let mut cmd = TpmCommand::new(TpmCc::GetRandom);
            cmd.add_u16(request_size);

            let parts = self.execute(&cmd, &[], 0).context("GetRandom failed")?;
            let random_bytes = parts.parameter_buffer().get_tpm2b()?;
            if random_bytes.is_empty() {
                bail!("TPM returned no random bytes");
            }
            result.extend_from_slice(&random_bytes);
        }

        result.truncate(num_bytes);
        Ok(result)
    }

    /// Mix caller-supplied entropy into the TPM's RNG state.
    pub fn stir_random(&mut self, entropy: &[u8]) -> Result<()> {
        if entropy.len() > MAX_STIR_RANDOM_SIZE {
            bail!(
                "StirRandom accepts at most {MAX_STIR_RANDOM_SIZE} bytes, got {}",
                entropy.len()
            );
        }
        let mut cmd = TpmCommand::new(TpmCc::StirRandom);
        cmd.add_tpm2b(entropy);
        self.execute(&cmd, &[], 0).context("StirRandom failed")?;
        Ok(())
    }

    // ==================== Sessions ====================

    /// Start an unbound, unsalted HMAC session using SHA-256.
    pub fn start_hmac_session(&mut self) -> Result<HmacSession> {
        let nonce_caller = random_nonce()?;

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        cmd.add_handle(tpm_rh::NULL); // tpmKey
        cmd.add_handle(tpm_rh::NULL); // bind
        cmd.add_tpm2b(&nonce_caller);
        cmd.add_tpm2b(&[]); // encryptedSalt
        cmd.add_u8(TpmSe::Hmac as u8);
        cmd.add(&TpmtSymDef::null());
        cmd.add_u16(TpmAlgId::Sha256.to_u16());

        let parts = self.execute(&cmd, &[], 1)?;
        let handle = parts.handles[0];
        let nonce_tpm = parts.parameter_buffer().get_tpm2b()?;
        debug!("started HMAC session 0x{handle:08x}");
        Ok(HmacSession::new(handle, nonce_caller, nonce_tpm))
    }

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_u32(handle);

        self.execute(&cmd, &[], 0).context("FlushContext failed")?;
        Ok(())
    }

    // ==================== Ownership ====================

    /// Replace the auth value of `hierarchy`, authorizing with `current`.
    pub fn hierarchy_change_auth(&mut self, hierarchy: u32, current: &[u8], new: &[u8]) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::HierarchyChangeAuth);
        cmd.add_handle(hierarchy);
        cmd.add_tpm2b(new);

        self.execute(&cmd, &[password_auth(current)], 0)?;
        debug!("changed auth of hierarchy 0x{hierarchy:08x}");
        Ok(())
    }

    /// Check if a persistent handle exists
    pub fn handle_exists(&mut self, handle: u32) -> Result<bool> {
        let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
        cmd.add_handle(handle);

        match self.execute(&cmd, &[], 0) {
            Ok(_) => Ok(true),
            Err(e) if is_missing_handle(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a primary key in `hierarchy` and return its transient handle
    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        hierarchy_auth: &[u8],
        template: &TpmtPublic,
    ) -> Result<u32> {
        let mut cmd = TpmCommand::new(TpmCc::CreatePrimary);
        cmd.add_handle(hierarchy);
        cmd.add(&Tpm2bSensitiveCreate::default());
        cmd.add_sized(template);
        cmd.add_tpm2b(&[]); // outsideInfo
        cmd.add_u32(0); // creationPCR: empty TPML_PCR_SELECTION

        let parts = self
            .execute(&cmd, &[password_auth(hierarchy_auth)], 1)
            .context("CreatePrimary failed")?;
        let handle = parts.handles[0];
        debug!("created primary key with handle 0x{handle:08x}");
        Ok(handle)
    }

    /// Make a key persistent at a given handle
    pub fn evict_control(
        &mut self,
        owner_auth: &[u8],
        object_handle: u32,
        persistent_handle: u32,
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::EvictControl);
        cmd.add_handle(tpm_rh::OWNER);
        cmd.add_handle(object_handle);
        cmd.add_u32(persistent_handle);

        self.execute(&cmd, &[password_auth(owner_auth)], 0)
            .context("EvictControl failed")?;
        debug!("made key persistent at 0x{persistent_handle:08x}");
        Ok(())
    }

    /// Ensure the RSA storage root key is persisted at its well-known handle.
    pub fn ensure_storage_root_key(&mut self, owner_auth: &[u8]) -> Result<()> {
        if self.handle_exists(RSA_STORAGE_ROOT_KEY)? {
            return Ok(());
        }

        debug!("creating storage root key at 0x{RSA_STORAGE_ROOT_KEY:08x}");
        let transient =
            self.create_primary(tpm_rh::OWNER, owner_auth, &TpmtPublic::rsa_storage_key())?;
        let persisted = self.evict_control(owner_auth, transient, RSA_STORAGE_ROOT_KEY);
        let flushed = self.flush_context(transient);
        persisted?;
        flushed
    }

    /// Take ownership of a TPM whose hierarchies still use empty auth.
    ///
    /// The storage root key is created while the owner auth is still empty.
    /// Endorsement and lockout auth are set next, each only if not yet set,
    /// and the owner auth last, so a TPM with owner auth set has completed
    /// every earlier step. A rejected owner auth change on a TPM whose owner
    /// auth is already set counts as success.
    pub fn take_ownership(
        &mut self,
        owner_password: &[u8],
        endorsement_password: &[u8],
        lockout_password: &[u8],
    ) -> Result<()> {
        let permanent = self.get_property(tpm_pt::PERMANENT)?;
        let owner_set = permanent & TpmaPermanent::OWNER_AUTH_SET != 0;

        if !owner_set {
            self.ensure_storage_root_key(&[])
                .context("failed to create storage root key")?;
        }
        if permanent & TpmaPermanent::ENDORSEMENT_AUTH_SET == 0 {
            self.hierarchy_change_auth(tpm_rh::ENDORSEMENT, &[], endorsement_password)
                .context("failed to set endorsement password")?;
        }
        if permanent & TpmaPermanent::LOCKOUT_AUTH_SET == 0 {
            self.hierarchy_change_auth(tpm_rh::LOCKOUT, &[], lockout_password)
                .context("failed to set lockout password")?;
        }
        if owner_set {
            return Ok(());
        }
        match self.hierarchy_change_auth(tpm_rh::OWNER, &[], owner_password) {
            Ok(()) => Ok(()),
            Err(e) if is_bad_auth(&e) => {
                if self.owner_auth_set()? {
                    debug!("owner password was already set");
                    Ok(())
                } else {
                    Err(e.context("failed to set owner password"))
                }
            }
            Err(e) => Err(e.context("failed to set owner password")),
        }
    }

    fn owner_auth_set(&mut self) -> Result<bool> {
        let permanent = self.get_property(tpm_pt::PERMANENT)?;
        Ok(permanent & TpmaPermanent::OWNER_AUTH_SET != 0)
    }

    // ==================== NV Operations ====================

    /// Read the public area of an NV index, `None` when it is not defined.
    pub fn nv_read_public(&mut self, index: u32) -> Result<Option<NvPublic>> {
        let mut cmd = TpmCommand::new(TpmCc::NvReadPublic);
        cmd.add_handle(index);

        let parts = match self.execute(&cmd, &[], 0) {
            Ok(parts) => parts,
            Err(e) if is_missing_handle(&e) => return Ok(None),
            Err(e) => return Err(e.context("NV_ReadPublic failed")),
        };
        let mut buf = parts.parameter_buffer();
        let public = Tpm2bNvPublic::unmarshal(&mut buf)?.nv_public;
        let name = buf.get_tpm2b()?;
        Ok(Some(NvPublic { public, name }))
    }

    /// Define a new NV index authorized by the owner
    pub fn nv_define_space(
        &mut self,
        session: &mut HmacSession,
        owner_auth: &[u8],
        public: &TpmsNvPublic,
        index_auth: &[u8],
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::NvDefineSpace);
        cmd.add_handle(tpm_rh::OWNER);
        cmd.add_tpm2b(index_auth);
        cmd.add(&Tpm2bNvPublic {
            nv_public: public.clone(),
        });

        self.execute_with_session(&cmd, session, owner_auth, 0)?;
        debug!(
            "defined NV index 0x{:08x} with size {}",
            public.nv_index, public.data_size
        );
        Ok(())
    }

    /// Undefine (delete) an NV index
    pub fn nv_undefine_space(
        &mut self,
        session: &mut HmacSession,
        owner_auth: &[u8],
        nv: &NvPublic,
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::NvUndefineSpace);
        cmd.add_handle(tpm_rh::OWNER);
        cmd.add_named_handle(nv.index(), nv.name.clone());

        self.execute_with_session(&cmd, session, owner_auth, 0)?;
        debug!("undefined NV index 0x{:08x}", nv.index());
        Ok(())
    }

    /// Write one chunk of at most [`MAX_NV_BUFFER_SIZE`] bytes at `offset`.
    pub fn nv_write(
        &mut self,
        session: &mut HmacSession,
        owner_auth: &[u8],
        nv: &NvPublic,
        offset: u16,
        data: &[u8],
    ) -> Result<()> {
        if data.len() > MAX_NV_BUFFER_SIZE {
            bail!("NV_Write chunk of {} bytes is too large", data.len());
        }
        let mut cmd = TpmCommand::new(TpmCc::NvWrite);
        cmd.add_handle(tpm_rh::OWNER);
        cmd.add_named_handle(nv.index(), nv.name.clone());
        cmd.add_tpm2b(data);
        cmd.add_u16(offset);

        self.execute_with_session(&cmd, session, owner_auth, 0)
            .with_context(|| format!("NV_Write failed at offset {offset}"))?;
        Ok(())
    }

    /// Block further writes to an index until it is redefined.
    pub fn nv_write_lock(
        &mut self,
        session: &mut HmacSession,
        owner_auth: &[u8],
        nv: &NvPublic,
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::NvWriteLock);
        cmd.add_handle(tpm_rh::OWNER);
        cmd.add_named_handle(nv.index(), nv.name.clone());

        self.execute_with_session(&cmd, session, owner_auth, 0)?;
        debug!("write-locked NV index 0x{:08x}", nv.index());
        Ok(())
    }

    /// Read one chunk using the index's own (empty) auth value.
    pub fn nv_read(&mut self, nv: &NvPublic, offset: u16, len: u16) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::new(TpmCc::NvRead);
        cmd.add_named_handle(nv.index(), nv.name.clone()); // authHandle
        cmd.add_named_handle(nv.index(), nv.name.clone());
        cmd.add_u16(len);
        cmd.add_u16(offset);

        let parts = self
            .execute(&cmd, &[password_auth(&[])], 0)
            .with_context(|| format!("NV_Read failed at offset {offset}"))?;
        parts.parameter_buffer().get_tpm2b()
    }
}

fn rc_base(e: &anyhow::Error) -> Option<u32> {
    e.downcast_ref::<TpmRcError>().map(TpmRcError::base)
}

fn is_missing_handle(e: &anyhow::Error) -> bool {
    rc_base(e) == Some(tpm_rc::HANDLE)
}

fn is_bad_auth(e: &anyhow::Error) -> bool {
    matches!(rc_base(e), Some(tpm_rc::BAD_AUTH | tpm_rc::AUTH_FAIL))
}
