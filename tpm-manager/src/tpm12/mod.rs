// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 backend.
//!
//! The TPM 1.2 command library lives outside this workspace; it is plugged
//! in by implementing [`Tpm1Device`] and [`Tpm1Commands`].

mod initializer;
mod nvram;
mod status;

pub use initializer::Tpm1Initializer;
pub use nvram::Tpm1Nvram;
pub use status::Tpm1Status;

use crate::error::CommandError;
use crate::hardware::DictionaryAttackInfo;

/// TPM 1.2 result codes the manager tells apart.
pub mod tpm1_rc {
    pub const AUTHFAIL: u32 = 0x001;
    pub const BADINDEX: u32 = 0x002;
    pub const NOSPACE: u32 = 0x011;
    pub const OWNER_SET: u32 = 0x014;
    pub const WRONGPCRVAL: u32 = 0x018;
    pub const BAD_DATASIZE: u32 = 0x02B;
    pub const AREA_LOCKED: u32 = 0x03C;
    pub const BAD_LOCALITY: u32 = 0x03D;
    pub const RETRY: u32 = 0x800;
}

/// Authorization value the TPM 1.2 tooling uses before a real secret is set.
pub const WELL_KNOWN_SECRET: [u8; 20] = [0; 20];
/// PCR whose value gates access to managed NV spaces.
pub const NV_BINDING_PCR: u32 = 0;
/// Locality at which managed NV spaces are accessible.
pub const NV_BINDING_LOCALITY: u8 = 1;
/// Largest single NV read transfer.
pub const MAX_NV_CHUNK: u32 = 1024;

pub type PcrValue = [u8; 20];

/// Opens connections to a TPM 1.2.
pub trait Tpm1Device: Send {
    type Connection: Tpm1Commands;

    fn open(&self) -> Result<Self::Connection, CommandError>;
}

/// The TPM 1.2 commands the manager issues.
pub trait Tpm1Commands {
    fn read_flags(&mut self) -> Result<Tpm1Flags, CommandError>;
    fn dictionary_attack_info(&mut self) -> Result<DictionaryAttackInfo, CommandError>;

    /// Whether `owner_password` currently authorizes the owner.
    fn test_owner_auth(&mut self, owner_password: &[u8]) -> Result<bool, CommandError>;
    /// Take ownership with `owner_password`; the SRK gets the well-known auth.
    fn take_ownership(&mut self, owner_password: &[u8]) -> Result<(), CommandError>;
    fn unrestrict_srk(&mut self, owner_password: &[u8]) -> Result<(), CommandError>;
    fn change_owner_auth(&mut self, current: &[u8], new: &[u8]) -> Result<(), CommandError>;

    fn read_pcr(&mut self, pcr: u32) -> Result<PcrValue, CommandError>;

    /// `None` when the index is not defined.
    fn nv_info(&mut self, index: u32) -> Result<Option<Tpm1NvInfo>, CommandError>;
    fn nv_define(
        &mut self,
        owner_password: &[u8],
        index: u32,
        size: u32,
        binding: &PcrBinding,
    ) -> Result<(), CommandError>;
    fn nv_release(&mut self, owner_password: &[u8], index: u32) -> Result<(), CommandError>;
    /// Write the whole space; write-define spaces lock as part of the write.
    fn nv_write(&mut self, index: u32, data: &[u8]) -> Result<(), CommandError>;
    fn nv_read(&mut self, index: u32, offset: u32, len: u32) -> Result<Vec<u8>, CommandError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tpm1Flags {
    pub disabled: bool,
    pub owned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tpm1NvInfo {
    pub size: u32,
    pub written: bool,
    pub write_locked: bool,
}

/// Read and write of a space are allowed only while `pcr` holds `value`
/// and commands arrive at `locality`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcrBinding {
    pub pcr: u32,
    pub value: PcrValue,
    pub locality: u8,
}
