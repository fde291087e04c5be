// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use tracing::debug;

use super::{Tpm2Commands, Tpm2Device, Tpm2State};
use crate::error::Result;
use crate::hardware::{DictionaryAttackInfo, TpmStatus};

pub struct Tpm2Status<D> {
    device: D,
    enabled: Option<bool>,
    owned: bool,
}

impl<D: Tpm2Device> Tpm2Status<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            enabled: None,
            owned: false,
        }
    }

    fn query(&self) -> Result<Tpm2State> {
        let mut conn = self.device.open()?;
        Ok(conn.read_state()?)
    }
}

impl<D: Tpm2Device> TpmStatus for Tpm2Status<D> {
    fn is_enabled(&mut self) -> Result<bool> {
        if let Some(enabled) = self.enabled {
            return Ok(enabled);
        }
        let state = self.query()?;
        debug!(
            startup_clear = format_args!("0x{:08x}", state.startup_clear),
            "queried TPM enabled state"
        );
        self.enabled = Some(state.is_enabled());
        self.owned |= state.is_owned();
        Ok(state.is_enabled())
    }

    fn is_owned(&mut self) -> Result<bool> {
        if self.owned {
            return Ok(true);
        }
        // the first enabled query also refreshes the owned flag
        let fresh = self.enabled.is_none();
        if !self.is_enabled()? {
            return Ok(false);
        }
        if !fresh {
            self.owned = self.query()?.is_owned();
        }
        Ok(self.owned)
    }

    fn dictionary_attack_info(&mut self) -> Result<DictionaryAttackInfo> {
        Ok(self.query()?.dictionary_attack_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Tpm2Simulator;

    #[test]
    fn test_owned_is_cached_once_true() {
        let sim = Tpm2Simulator::new();
        let mut status = Tpm2Status::new(sim.clone());
        assert!(status.is_enabled().unwrap());
        assert!(!status.is_owned().unwrap());

        let mut conn = sim.open().unwrap();
        conn.take_ownership(b"owner", b"endorsement", b"lockout")
            .unwrap();
        assert!(status.is_owned().unwrap());

        // cached: an unreachable TPM no longer matters
        sim.set_offline(true);
        assert!(status.is_owned().unwrap());
        assert!(status.is_enabled().unwrap());
    }

    #[test]
    fn test_disabled_tpm_is_not_owned() {
        let sim = Tpm2Simulator::new();
        sim.disable();
        let mut status = Tpm2Status::new(sim);
        assert!(!status.is_enabled().unwrap());
        assert!(!status.is_owned().unwrap());
    }

    #[test]
    fn test_dictionary_attack_info_is_always_queried() {
        let sim = Tpm2Simulator::new();
        let mut status = Tpm2Status::new(sim.clone());
        assert!(status.is_enabled().unwrap());
        assert_eq!(status.dictionary_attack_info().unwrap().counter, 0);

        sim.set_lockout_counter(40);
        let da = status.dictionary_attack_info().unwrap();
        assert_eq!(da.counter, 40);
        assert!(da.in_lockout);

        sim.set_offline(true);
        assert!(status.dictionary_attack_info().is_err());
        assert!(status.is_enabled().unwrap());
    }
}
