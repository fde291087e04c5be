// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 command layer
//!
//! This crate talks directly to the TPM device without C library
//! dependencies and covers what is needed to take ownership of a TPM and
//! manage owner-authorized NV spaces.
//!
//! ## Supported Commands
//!
//! - Capabilities: `GetCapability` (TPM properties)
//! - Random: `GetRandom`, `StirRandom`
//! - Ownership: `HierarchyChangeAuth`, `CreatePrimary`, `EvictControl`
//! - NV operations: `NV_DefineSpace`, `NV_UndefineSpace`, `NV_ReadPublic`,
//!   `NV_Read`, `NV_Write`, `NV_WriteLock`
//! - Sessions: password authorization and unbound HMAC sessions
//!
//! Failed commands surface as [`TpmRcError`] inside the returned
//! `anyhow::Error`, so callers can branch on the response code.
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::{tpm_pt, TpmContext, TpmaPermanent};
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let permanent = ctx.get_property(tpm_pt::PERMANENT)?;
//! let owned = permanent & TpmaPermanent::OWNER_AUTH_SET != 0;
//! # let _ = owned;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod device;
mod marshal;
mod session;
mod types;

pub use commands::{TpmContext, MAX_STIR_RANDOM_SIZE};
pub use constants::*;
pub use types::*;

pub use device::{
    AuthCommand, AuthResponse, ResponseParts, TpmCommand, TpmDevice, TpmRcError, TpmResponse,
    Transport,
};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::{password_auth, HmacSession};
