// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software TPMs for tests and local development.

mod tpm12;
mod tpm20;

pub use tpm12::{Tpm1Simulator, Tpm1SimulatorConnection};
pub use tpm20::{Tpm2Simulator, Tpm2SimulatorConnection};
