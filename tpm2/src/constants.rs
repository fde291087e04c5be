// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    NvUndefineSpace = 0x00000122,
    EvictControl = 0x00000120,
    HierarchyChangeAuth = 0x00000129,
    NvDefineSpace = 0x0000012A,
    CreatePrimary = 0x00000131,
    NvWrite = 0x00000137,
    NvWriteLock = 0x00000138,
    StirRandom = 0x00000146,
    NvRead = 0x0000014E,
    FlushContext = 0x00000165,
    NvReadPublic = 0x00000169,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017A,
    GetRandom = 0x0000017B,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// TPM 2.0 Response Codes (TPM_RC)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x000;

    pub const RC_VER1: u32 = 0x100;
    pub const INITIALIZE: u32 = RC_VER1;
    pub const FAILURE: u32 = RC_VER1 + 0x001;
    pub const NV_RANGE: u32 = RC_VER1 + 0x046;
    pub const NV_SIZE: u32 = RC_VER1 + 0x047;
    pub const NV_LOCKED: u32 = RC_VER1 + 0x048;
    pub const NV_AUTHORIZATION: u32 = RC_VER1 + 0x049;
    pub const NV_UNINITIALIZED: u32 = RC_VER1 + 0x04A;
    pub const NV_SPACE: u32 = RC_VER1 + 0x04B;
    pub const NV_DEFINED: u32 = RC_VER1 + 0x04C;

    /// Format-one errors carry a handle/parameter/session number in the
    /// upper bits; mask them with [`FMT1_MASK`] before comparing.
    pub const RC_FMT1: u32 = 0x080;
    pub const FMT1_MASK: u32 = RC_FMT1 | 0x03F;
    pub const VALUE: u32 = RC_FMT1 + 0x004;
    pub const HIERARCHY: u32 = RC_FMT1 + 0x005;
    pub const HANDLE: u32 = RC_FMT1 + 0x00B;
    pub const AUTH_FAIL: u32 = RC_FMT1 + 0x00E;
    pub const SIZE: u32 = RC_FMT1 + 0x015;
    pub const BAD_AUTH: u32 = RC_FMT1 + 0x022;

    pub const RC_WARN: u32 = 0x900;
    pub const YIELDED: u32 = RC_WARN + 0x008;
    pub const CANCELED: u32 = RC_WARN + 0x009;
    pub const TESTING: u32 = RC_WARN + 0x00A;
    pub const NV_RATE: u32 = RC_WARN + 0x020;
    pub const LOCKOUT: u32 = RC_WARN + 0x021;
    pub const RETRY: u32 = RC_WARN + 0x022;
    pub const NV_UNAVAILABLE: u32 = RC_WARN + 0x023;

    /// Strip the handle/parameter/session number from a format-one code.
    pub fn base(code: u32) -> u32 {
        if code & RC_FMT1 != 0 {
            code & FMT1_MASK
        } else {
            code
        }
    }

    /// Warning codes after which the same command may simply be resent.
    pub fn is_retry_class(code: u32) -> bool {
        matches!(code, YIELDED | CANCELED | TESTING | RETRY | NV_RATE | NV_UNAVAILABLE)
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Aes = 0x0006,
    Sha256 = 0x000B,
    Null = 0x0010,
    Cfb = 0x0043,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(TpmAlgId::Rsa),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0006 => Some(TpmAlgId::Aes),
            0x000B => Some(TpmAlgId::Sha256),
            0x0010 => Some(TpmAlgId::Null),
            0x0043 => Some(TpmAlgId::Cfb),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            _ => 0,
        }
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
}

/// First handle of the NV index range.
pub const NV_INDEX_FIRST: u32 = 0x01000000;
/// Largest user NV index accepted (24-bit index field).
pub const MAX_NV_INDEX: u32 = (1 << 24) - 1;
/// Largest NV space the manager will define.
pub const MAX_NV_INDEX_SIZE: usize = 2048;
/// Largest payload of a single NV_Read/NV_Write.
pub const MAX_NV_BUFFER_SIZE: usize = 1024;
/// Persistent handle of the RSA storage root key.
pub const RSA_STORAGE_ROOT_KEY: u32 = 0x81000001;

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Handles = 0x00000001,
    TpmProperties = 0x00000006,
}

/// TPM 2.0 property tags (TPM_PT) for `TPM_CAP_TPM_PROPERTIES`
pub mod tpm_pt {
    pub const PT_VAR: u32 = 0x200;
    pub const PERMANENT: u32 = PT_VAR;
    pub const STARTUP_CLEAR: u32 = PT_VAR + 1;
    pub const LOCKOUT_COUNTER: u32 = PT_VAR + 14;
    pub const MAX_AUTH_FAIL: u32 = PT_VAR + 15;
    pub const LOCKOUT_INTERVAL: u32 = PT_VAR + 16;
    pub const LOCKOUT_RECOVERY: u32 = PT_VAR + 17;
}

/// TPMA_PERMANENT bits
pub struct TpmaPermanent;

impl TpmaPermanent {
    pub const OWNER_AUTH_SET: u32 = 1 << 0;
    pub const ENDORSEMENT_AUTH_SET: u32 = 1 << 1;
    pub const LOCKOUT_AUTH_SET: u32 = 1 << 2;
    pub const DISABLE_CLEAR: u32 = 1 << 8;
    pub const IN_LOCKOUT: u32 = 1 << 9;
}

/// TPMA_STARTUP_CLEAR bits
pub struct TpmaStartupClear;

impl TpmaStartupClear {
    pub const PH_ENABLE: u32 = 1 << 0;
    pub const SH_ENABLE: u32 = 1 << 1;
    pub const EH_ENABLE: u32 = 1 << 2;
    pub const PH_ENABLE_NV: u32 = 1 << 3;
    pub const ORDERLY: u32 = 1 << 31;
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const NO_DA: u32 = 1 << 10;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, bits: u32) -> Self {
        self.0 |= bits;
        self
    }
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const PP_WRITE: u32 = 1 << 0;
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const POLICY_WRITE: u32 = 1 << 3;
    pub const WRITE_LOCKED: u32 = 1 << 11;
    pub const WRITE_ALL: u32 = 1 << 12;
    pub const WRITE_DEFINE: u32 = 1 << 13;
    pub const WRITE_STCLEAR: u32 = 1 << 14;
    pub const PP_READ: u32 = 1 << 16;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const POLICY_READ: u32 = 1 << 19;
    pub const NO_DA: u32 = 1 << 25;
    pub const ORDERLY: u32 = 1 << 26;
    pub const READ_LOCKED: u32 = 1 << 28;
    pub const WRITTEN: u32 = 1 << 29;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, bits: u32) -> Self {
        self.0 |= bits;
        self
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    /// Attributes for spaces managed on behalf of callers: owner writes,
    /// the empty index auth reads, write-define lock survives reboot.
    pub fn managed_space() -> Self {
        Self::new().with(Self::NO_DA | Self::OWNER_WRITE | Self::WRITE_DEFINE | Self::AUTH_READ)
    }

    pub fn is_written(self) -> bool {
        self.contains(Self::WRITTEN)
    }

    pub fn is_write_locked(self) -> bool {
        self.contains(Self::WRITE_LOCKED)
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    RspCommand = 0x00C4,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x00C4 => Some(TpmSt::RspCommand),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rc_base_strips_handle_number() {
        // TPM_RC_HANDLE reported for handle 1
        assert_eq!(tpm_rc::base(0x18B), tpm_rc::HANDLE);
        // TPM_RC_BAD_AUTH reported for session 1
        assert_eq!(tpm_rc::base(0x9A2), tpm_rc::BAD_AUTH);
        assert_eq!(tpm_rc::base(tpm_rc::NV_LOCKED), tpm_rc::NV_LOCKED);
    }

    #[test]
    fn test_retry_class() {
        assert!(tpm_rc::is_retry_class(tpm_rc::RETRY));
        assert!(tpm_rc::is_retry_class(tpm_rc::YIELDED));
        assert!(!tpm_rc::is_retry_class(tpm_rc::LOCKOUT));
        assert!(!tpm_rc::is_retry_class(tpm_rc::NV_LOCKED));
    }

    #[test]
    fn test_managed_space_attributes() {
        let attrs = TpmaNv::managed_space();
        assert!(attrs.contains(TpmaNv::OWNER_WRITE | TpmaNv::AUTH_READ));
        assert!(!attrs.is_written());
        assert!(!attrs.is_write_locked());
    }
}
