// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use super::constants::*;
use super::marshal::*;

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::empty(),
            data_size,
        }
    }

    /// TPM name of the index: `nameAlg || H(TPMS_NV_PUBLIC)`.
    ///
    /// The name covers the attributes, so it changes once the index is
    /// written or locked.
    pub fn name(&self) -> Result<Vec<u8>> {
        if self.name_alg != TpmAlgId::Sha256 {
            bail!("unsupported NV name algorithm: {:?}", self.name_alg);
        }
        let mut name = self.name_alg.to_u16().to_be_bytes().to_vec();
        name.extend_from_slice(&Sha256::digest(self.to_bytes()));
        Ok(name)
    }
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let nv_index = buf.get_u32()?;
        let raw_alg = buf.get_u16()?;
        let name_alg = TpmAlgId::from_u16(raw_alg)
            .with_context(|| format!("unknown NV name algorithm: 0x{raw_alg:04x}"))?;
        Ok(Self {
            nv_index,
            name_alg,
            attributes: TpmaNv(buf.get_u32()?),
            auth_policy: Tpm2bDigest::unmarshal(buf)?,
            data_size: buf.get_u16()?,
        })
    }
}

/// TPM2B_NV_PUBLIC - NV public with size prefix
#[derive(Debug, Clone)]
pub struct Tpm2bNvPublic {
    pub nv_public: TpmsNvPublic,
}

impl Marshal for Tpm2bNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized(&self.nv_public);
    }
}

impl Unmarshal for Tpm2bNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let size = buf.get_u16()? as usize;
        if size == 0 {
            bail!("empty NV public");
        }
        let mut inner = ResponseBuffer::new(buf.get_slice(size)?);
        Ok(Self {
            nv_public: TpmsNvPublic::unmarshal(&mut inner)?,
        })
    }
}

/// Public area of an NV index together with the name the TPM reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPublic {
    pub public: TpmsNvPublic,
    pub name: Vec<u8>,
}

impl NvPublic {
    pub fn index(&self) -> u32 {
        self.public.nv_index
    }

    pub fn size(&self) -> usize {
        self.public.data_size as usize
    }

    pub fn attributes(&self) -> TpmaNv {
        self.public.attributes
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
#[derive(Debug, Clone, Copy)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

/// TPMS_RSA_PARMS for a restricted decryption key
#[derive(Debug, Clone)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub key_bits: u16,
    pub exponent: u32,
}

impl TpmsRsaParms {
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_128_cfb(),
            key_bits: 2048,
            exponent: 0, // 65537
        }
    }
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        // TPMT_RSA_SCHEME: storage keys carry no signing scheme
        buf.put_u16(TpmAlgId::Null.to_u16());
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

/// TPMT_PUBLIC template for RSA objects
#[derive(Debug, Clone)]
pub struct TpmtPublic {
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmsRsaParms,
}

impl TpmtPublic {
    /// Create an RSA storage key template (SRK)
    pub fn rsa_storage_key() -> Self {
        Self {
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new().with(
                TpmaObject::FIXED_TPM
                    | TpmaObject::FIXED_PARENT
                    | TpmaObject::SENSITIVE_DATA_ORIGIN
                    | TpmaObject::USER_WITH_AUTH
                    | TpmaObject::NO_DA
                    | TpmaObject::RESTRICTED
                    | TpmaObject::DECRYPT,
            ),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmsRsaParms::storage_key(),
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(TpmAlgId::Rsa.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        // unique: empty TPM2B_PUBLIC_KEY_RSA
        buf.put_tpm2b(&[]);
    }
}

/// TPM2B_SENSITIVE_CREATE with an empty user auth and no data
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Vec<u8>,
    pub data: Vec<u8>,
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        let mut inner = CommandBuffer::new();
        inner.put_tpm2b(&self.user_auth);
        inner.put_tpm2b(&self.data);
        buf.put_tpm2b(inner.as_bytes());
    }
}

/// One entry of a TPML_TAGGED_TPM_PROPERTY list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedProperty {
    pub property: u32,
    pub value: u32,
}

impl Unmarshal for TaggedProperty {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            property: buf.get_u32()?,
            value: buf.get_u32()?,
        })
    }
}
