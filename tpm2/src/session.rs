// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization: password sessions and unbound, unsalted HMAC sessions

use anyhow::{anyhow, bail, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::constants::*;
use super::device::{AuthCommand, AuthResponse};

type HmacSha256 = Hmac<Sha256>;

/// Size of the caller nonce sent with every command, matching SHA-256.
pub(crate) const NONCE_SIZE: usize = 32;

pub(crate) fn random_nonce() -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; NONCE_SIZE];
    getrandom::fill(&mut nonce).map_err(|e| anyhow!("failed to generate nonce: {e}"))?;
    Ok(nonce)
}

/// Plaintext password authorization (TPM_RS_PW).
pub fn password_auth(auth_value: &[u8]) -> AuthCommand {
    AuthCommand {
        session_handle: tpm_rh::PW,
        nonce: Vec::new(),
        attributes: 0,
        hmac: auth_value.to_vec(),
    }
}

/// An HMAC authorization session with no bind entity and no salt.
///
/// With neither, the session key is empty and every HMAC is keyed by the
/// authorized entity's auth value alone.
#[derive(Debug)]
pub struct HmacSession {
    handle: u32,
    nonce_caller: Vec<u8>,
    nonce_tpm: Vec<u8>,
}

impl HmacSession {
    pub(crate) fn new(handle: u32, nonce_caller: Vec<u8>, nonce_tpm: Vec<u8>) -> Self {
        Self {
            handle,
            nonce_caller,
            nonce_tpm,
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    fn mac(
        auth_value: &[u8],
        param_hash: &[u8],
        nonce_newer: &[u8],
        nonce_older: &[u8],
        attributes: u8,
    ) -> Result<HmacSha256> {
        let key = hmac_key(auth_value);
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| anyhow!("invalid session HMAC key: {e}"))?;
        mac.update(param_hash);
        mac.update(nonce_newer);
        mac.update(nonce_older);
        mac.update(&[attributes]);
        Ok(mac)
    }

    /// Build the authorization entry for a command with the given cpHash.
    pub fn authorize(&mut self, cp_hash: &[u8], auth_value: &[u8]) -> Result<AuthCommand> {
        self.nonce_caller = random_nonce()?;
        let attributes = TpmaSa::CONTINUE_SESSION;
        let mac = Self::mac(
            auth_value,
            cp_hash,
            &self.nonce_caller,
            &self.nonce_tpm,
            attributes,
        )?;
        Ok(AuthCommand {
            session_handle: self.handle,
            nonce: self.nonce_caller.clone(),
            attributes,
            hmac: mac.finalize().into_bytes().to_vec(),
        })
    }

    /// Check the TPM's response HMAC and adopt its new nonce.
    pub fn verify(&mut self, rp_hash: &[u8], auth_value: &[u8], resp: &AuthResponse) -> Result<()> {
        if resp.nonce.is_empty() {
            bail!("session response carries no nonce");
        }
        let mac = Self::mac(
            auth_value,
            rp_hash,
            &resp.nonce,
            &self.nonce_caller,
            resp.attributes,
        )?;
        mac.verify_slice(&resp.hmac)
            .map_err(|_| anyhow!("response HMAC mismatch for session 0x{:08x}", self.handle))?;
        self.nonce_tpm = resp.nonce.clone();
        Ok(())
    }
}

/// Auth values are used as HMAC keys with trailing zero octets removed.
fn hmac_key(auth_value: &[u8]) -> Zeroizing<Vec<u8>> {
    let end = auth_value
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |last| last + 1);
    Zeroizing::new(auth_value[..end].to_vec())
}
