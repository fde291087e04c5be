// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! Provides low-level communication with TPM devices via /dev/tpmrm0 or /dev/tpm0,
//! plus the command/response framing shared by every command.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

use super::constants::*;
use super::marshal::*;

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Header of every command and response: tag, size, code.
const HEADER_SIZE: usize = 10;

/// A non-zero response code returned for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("TPM2_{command:?} failed with TPM error 0x{code:08x}")]
pub struct TpmRcError {
    pub command: TpmCc,
    pub code: u32,
}

impl TpmRcError {
    /// Response code with the handle/parameter/session number removed.
    pub fn base(&self) -> u32 {
        tpm_rc::base(self.code)
    }

    /// Whether resending the same command may succeed.
    pub fn is_retry(&self) -> bool {
        tpm_rc::is_retry_class(self.base())
    }
}

/// Byte pipe to a TPM.
pub trait Transport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// TPM device handle
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device
    pub fn open(path: &str) -> Result<Self> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device: {device_path}"))?;

        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Detect and open the default TPM device, preferring the resource manager
    pub fn detect() -> Result<Self> {
        for candidate in ["/dev/tpmrm0", "/dev/tpm0"] {
            if Path::new(candidate).exists() {
                return Self::open(candidate);
            }
        }
        bail!("TPM device not found")
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .context("failed to write TPM command")?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self
            .file
            .read(&mut response)
            .context("failed to read TPM response")?;

        response.truncate(n);
        Ok(response)
    }
}

/// One entry of a command authorization area.
#[derive(Debug, Clone)]
pub struct AuthCommand {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: u8,
    pub hmac: Vec<u8>,
}

impl Marshal for AuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes);
        buf.put_tpm2b(&self.hmac);
    }
}

/// One entry of a response authorization area.
#[derive(Debug, Clone, Default)]
pub struct AuthResponse {
    pub nonce: Vec<u8>,
    pub attributes: u8,
    pub hmac: Vec<u8>,
}

impl Unmarshal for AuthResponse {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce: buf.get_tpm2b()?,
            attributes: buf.get_u8()?,
            hmac: buf.get_tpm2b()?,
        })
    }
}

/// TPM command builder
///
/// Handles, their names and the parameter area are kept apart so the
/// command parameter hash can be computed before the auth area exists.
#[derive(Debug)]
pub struct TpmCommand {
    code: TpmCc,
    handles: Vec<u32>,
    names: Vec<Vec<u8>>,
    params: CommandBuffer,
}

impl TpmCommand {
    pub fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::new(),
            names: Vec::new(),
            params: CommandBuffer::with_capacity(256),
        }
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    /// Add a handle whose name is the handle value itself (permanent
    /// hierarchies, sessions, persistent objects).
    pub fn add_handle(&mut self, handle: u32) {
        self.add_named_handle(handle, handle.to_be_bytes().to_vec());
    }

    /// Add a handle with an explicit name, as NV indices require.
    pub fn add_named_handle(&mut self, handle: u32, name: Vec<u8>) {
        self.handles.push(handle);
        self.names.push(name);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.params.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.params.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.params.put_u32(v);
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.params.put_tpm2b(data);
    }

    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.params);
    }

    /// Add a structure wrapped in a TPM2B size prefix.
    pub fn add_sized<T: Marshal>(&mut self, value: &T) {
        self.params.put_sized(value);
    }

    /// cpHash = SHA256(commandCode || names || parameters)
    pub fn cp_hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.code.to_u32().to_be_bytes());
        for name in &self.names {
            hasher.update(name);
        }
        hasher.update(self.params.as_bytes());
        hasher.finalize().to_vec()
    }

    /// Frame the command with the given authorization entries.
    pub fn encode(&self, auths: &[AuthCommand]) -> Result<Vec<u8>> {
        let tag = if auths.is_empty() {
            TpmSt::NoSessions
        } else {
            TpmSt::Sessions
        };

        let mut buf = CommandBuffer::with_capacity(HEADER_SIZE + self.params.len() + 64);
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // size placeholder
        buf.put_u32(self.code.to_u32());
        for handle in &self.handles {
            buf.put_u32(*handle);
        }
        if !auths.is_empty() {
            let mut area = CommandBuffer::new();
            for auth in auths {
                auth.marshal(&mut area);
            }
            buf.put_u32(area.len() as u32);
            buf.put_bytes(area.as_bytes());
        }
        buf.put_bytes(self.params.as_bytes());

        if buf.len() > TPM_MAX_COMMAND_SIZE {
            bail!(
                "TPM2_{:?} command too large: {} bytes",
                self.code,
                buf.len()
            );
        }
        let size = buf.len() as u32;
        buf.patch_u32(2, size)?;
        Ok(buf.into_vec())
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub body: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            bail!("TPM response too short: {} bytes", response.len());
        }

        let mut buf = ResponseBuffer::new(response);
        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .with_context(|| format!("invalid response tag: 0x{tag_raw:04x}"))?;

        let size = buf.get_u32()? as usize;
        if size < HEADER_SIZE || response.len() < size {
            bail!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            );
        }

        let response_code = buf.get_u32()?;
        Ok(Self {
            tag,
            response_code,
            body: response[HEADER_SIZE..size].to_vec(),
        })
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.response_code == tpm_rc::SUCCESS
    }

    /// Turn a failure code into a [`TpmRcError`] for `command`.
    pub fn ensure_success(&self, command: TpmCc) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(TpmRcError {
                command,
                code: self.response_code,
            }
            .into())
        }
    }

    /// Split a successful response body into handles, parameters and the
    /// authorization area.
    pub fn into_parts(self, handle_count: usize) -> Result<ResponseParts> {
        let mut buf = ResponseBuffer::new(&self.body);
        let handles = (0..handle_count)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()?;

        let (parameters, auths) = if self.tag == TpmSt::Sessions {
            let param_size = buf.get_u32()? as usize;
            let parameters = buf.get_bytes(param_size)?;
            let mut auths = Vec::new();
            while buf.remaining() > 0 {
                auths.push(AuthResponse::unmarshal(&mut buf)?);
            }
            (parameters, auths)
        } else {
            (buf.get_remaining().to_vec(), Vec::new())
        };

        Ok(ResponseParts {
            handles,
            parameters,
            auths,
        })
    }
}

/// Body of a successful response.
#[derive(Debug, Default)]
pub struct ResponseParts {
    pub handles: Vec<u32>,
    pub parameters: Vec<u8>,
    pub auths: Vec<AuthResponse>,
}

impl ResponseParts {
    /// rpHash = SHA256(responseCode || commandCode || parameters)
    pub fn rp_hash(&self, code: TpmCc) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(tpm_rc::SUCCESS.to_be_bytes());
        hasher.update(code.to_u32().to_be_bytes());
        hasher.update(&self.parameters);
        hasher.finalize().to_vec()
    }

    pub fn parameter_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_without_sessions() {
        let mut cmd = TpmCommand::new(TpmCc::GetRandom);
        cmd.add_u16(32);

        let bytes = cmd.encode(&[]).unwrap();

        assert_eq!(&bytes[0..2], &[0x80, 0x01]); // TPM_ST_NO_SESSIONS
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x7B]); // TPM_CC_GetRandom
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
        assert_eq!(&bytes[10..], &[0x00, 0x20]);
    }

    #[test]
    fn test_command_with_password_auth() {
        let mut cmd = TpmCommand::new(TpmCc::HierarchyChangeAuth);
        cmd.add_handle(tpm_rh::LOCKOUT);
        cmd.add_tpm2b(b"new");
        let auth = AuthCommand {
            session_handle: tpm_rh::PW,
            nonce: Vec::new(),
            attributes: 0,
            hmac: b"old".to_vec(),
        };

        let bytes = cmd.encode(&[auth]).unwrap();
        assert_eq!(&bytes[0..2], &[0x80, 0x02]); // TPM_ST_SESSIONS
        assert_eq!(&bytes[10..14], &tpm_rh::LOCKOUT.to_be_bytes());
        // authorizationSize = handle(4) + nonce(2) + attrs(1) + hmac(2 + 3)
        assert_eq!(&bytes[14..18], &12u32.to_be_bytes());
        assert_eq!(&bytes[18..22], &tpm_rh::PW.to_be_bytes());
        assert_eq!(&bytes[bytes.len() - 5..], &[0x00, 0x03, b'n', b'e', b'w']);
    }

    #[test]
    fn test_cp_hash_covers_names() {
        let mut a = TpmCommand::new(TpmCc::NvWriteLock);
        a.add_handle(tpm_rh::OWNER);
        a.add_named_handle(0x01000001, vec![0x00, 0x0B, 1]);
        let mut b = TpmCommand::new(TpmCc::NvWriteLock);
        b.add_handle(tpm_rh::OWNER);
        b.add_named_handle(0x01000001, vec![0x00, 0x0B, 2]);
        assert_ne!(a.cp_hash(), b.cp_hash());
    }

    #[test]
    fn test_response_parse() {
        let response = vec![
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0A, // Size = 10
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
        ];

        let parsed = TpmResponse::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_response_error_code_is_typed() {
        let response = vec![
            0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x09, 0x22, // TPM_RC_RETRY
        ];
        let parsed = TpmResponse::parse(&response).unwrap();
        let err = parsed.ensure_success(TpmCc::NvWrite).unwrap_err();
        let rc = err.downcast_ref::<TpmRcError>().unwrap();
        assert_eq!(rc.code, tpm_rc::RETRY);
        assert!(rc.is_retry());
    }

    #[test]
    fn test_response_parts_with_sessions() {
        let mut body = CommandBuffer::new();
        body.put_u32(0x02000000); // handle
        body.put_u32(4); // parameterSize
        body.put_tpm2b(&[0xAB, 0xCD]);
        body.put_tpm2b(&[1; 16]); // nonceTPM
        body.put_u8(TpmaSa::CONTINUE_SESSION);
        body.put_tpm2b(&[2; 32]);

        let response = TpmResponse {
            tag: TpmSt::Sessions,
            response_code: 0,
            body: body.into_vec(),
        };
        let parts = response.into_parts(1).unwrap();
        assert_eq!(parts.handles, vec![0x02000000]);
        assert_eq!(parts.parameters, vec![0x00, 0x02, 0xAB, 0xCD]);
        assert_eq!(parts.auths.len(), 1);
        assert_eq!(parts.auths[0].nonce, vec![1; 16]);
        assert_eq!(parts.auths[0].hmac, vec![2; 32]);
    }
}
