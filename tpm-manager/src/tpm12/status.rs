// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use super::{Tpm1Commands, Tpm1Device, Tpm1Flags};
use crate::error::Result;
use crate::hardware::{DictionaryAttackInfo, TpmStatus};

pub struct Tpm1Status<D> {
    device: D,
    enabled: Option<bool>,
    owned: bool,
}

impl<D: Tpm1Device> Tpm1Status<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            enabled: None,
            owned: false,
        }
    }

    fn flags(&self) -> Result<Tpm1Flags> {
        Ok(self.device.open()?.read_flags()?)
    }
}

impl<D: Tpm1Device> TpmStatus for Tpm1Status<D> {
    fn is_enabled(&mut self) -> Result<bool> {
        if let Some(enabled) = self.enabled {
            return Ok(enabled);
        }
        let flags = self.flags()?;
        self.enabled = Some(!flags.disabled);
        self.owned |= flags.owned;
        Ok(!flags.disabled)
    }

    fn is_owned(&mut self) -> Result<bool> {
        if !self.owned {
            self.owned = self.flags()?.owned;
        }
        Ok(self.owned)
    }

    fn dictionary_attack_info(&mut self) -> Result<DictionaryAttackInfo> {
        Ok(self.device.open()?.dictionary_attack_info()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Tpm1Simulator;

    #[test]
    fn test_flags() {
        let sim = Tpm1Simulator::new();
        let mut status = Tpm1Status::new(sim.clone());
        assert!(status.is_enabled().unwrap());
        assert!(!status.is_owned().unwrap());

        sim.open().unwrap().take_ownership(b"owner").unwrap();
        assert!(status.is_owned().unwrap());
        sim.set_offline(true);
        assert!(status.is_owned().unwrap());
        assert!(status.dictionary_attack_info().is_err());
    }

    #[test]
    fn test_disabled() {
        let sim = Tpm1Simulator::new();
        sim.disable();
        assert!(!Tpm1Status::new(sim).is_enabled().unwrap());
    }
}
