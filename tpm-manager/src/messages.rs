// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Request and reply messages of the ownership and NVRAM interfaces.

use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

use crate::error::TpmManagerError;
use crate::secret_store::SecretRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Success,
    /// The TPM is disabled.
    NotAvailable,
    UnexpectedDeviceError,
}

impl From<&TpmManagerError> for Status {
    fn from(err: &TpmManagerError) -> Self {
        match err {
            TpmManagerError::NotAvailable => Status::NotAvailable,
            TpmManagerError::Device(_) | TpmManagerError::Io(_) | TpmManagerError::State(_) => {
                Status::UnexpectedDeviceError
            }
        }
    }
}

/// Every reply carries a status; a failed reply carries nothing else.
pub trait Reply: Default + Send + 'static {
    fn status(&self) -> Status;
    fn set_status(&mut self, status: Status);

    fn with_status(status: Status) -> Self {
        let mut reply = Self::default();
        reply.set_status(status);
        reply
    }
}

macro_rules! impl_reply {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Reply for $ty {
                fn status(&self) -> Status {
                    self.status
                }

                fn set_status(&mut self, status: Status) {
                    self.status = status;
                }
            }
        )*
    };
}

impl_reply!(
    GetTpmStatusReply,
    TakeOwnershipReply,
    RemoveOwnerDependencyReply,
    DefineNvramReply,
    DestroyNvramReply,
    WriteNvramReply,
    ReadNvramReply,
    IsNvramDefinedReply,
    IsNvramLockedReply,
    GetNvramSizeReply,
);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetTpmStatusRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetTpmStatusReply {
    pub status: Status,
    pub enabled: bool,
    pub owned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_record: Option<SecretRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary_attack_counter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary_attack_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary_attack_lockout_in_effect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary_attack_lockout_seconds_remaining: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TakeOwnershipRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeOwnershipReply {
    pub status: Status,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveOwnerDependencyRequest {
    pub owner_dependency: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOwnerDependencyReply {
    pub status: Status,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefineNvramRequest {
    pub index: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefineNvramReply {
    pub status: Status,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestroyNvramRequest {
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyNvramReply {
    pub status: Status,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteNvramRequest {
    pub index: u32,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteNvramReply {
    pub status: Status,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadNvramRequest {
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadNvramReply {
    pub status: Status,
    #[serde(default, with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsNvramDefinedRequest {
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsNvramDefinedReply {
    pub status: Status,
    pub is_defined: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsNvramLockedRequest {
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsNvramLockedReply {
    pub status: Status,
    pub is_locked: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetNvramSizeRequest {
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetNvramSizeReply {
    pub status: Status,
    pub size: u32,
}
