// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The chassis hardware that IPMB commands report on.

use ipmb_messages::DeviceId;
use ipmb_messages::DeviceSupport;
use ipmb_messages::SledPresence;
use std::net::Ipv4Addr;
use std::sync::PoisonError;
use std::sync::RwLock;
use thiserror::Error;

/// An error reading chassis state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Failed to read {what}: {reason}")]
    Read { what: &'static str, reason: String },
}

/// Access to chassis state, as needed by the built-in commands.
pub trait ChassisPlatform: Send + Sync {
    /// The identity reported by Get Device ID.
    fn device_id(&self) -> DeviceId;

    /// The sleds currently present in the chassis.
    fn sled_presence(&self) -> Result<SledPresence, PlatformError>;

    /// The chassis management IPv4 address.
    fn ip_address(&self) -> Result<Ipv4Addr, PlatformError>;

    /// The chassis management MAC address.
    fn mac_address(&self) -> Result<[u8; 6], PlatformError>;
}

/// Return the device identity the agent reports by default.
pub fn default_device_id() -> DeviceId {
    DeviceId {
        device_id: 0x20,
        device_revision: 0x01,
        firmware_major: 0x01,
        firmware_minor: 0x00,
        ipmi_version: DeviceId::IPMI_VERSION_2_0,
        additional_support: DeviceSupport::CHASSIS.bits(),
        manufacturer_id: [0x57, 0x01, 0x00],
        product_id: 0x0001,
        aux_firmware: [0; 4],
    }
}

#[derive(Clone, Debug)]
struct State {
    device_id: DeviceId,
    presence: SledPresence,
    ip: Ipv4Addr,
    mac: [u8; 6],
}

/// A platform whose values are configured, and updated, by its owner.
#[derive(Debug)]
pub struct StaticPlatform {
    state: RwLock<State>,
}

impl Default for StaticPlatform {
    fn default() -> Self {
        Self::new(default_device_id(), Ipv4Addr::UNSPECIFIED, [0; 6])
    }
}

impl StaticPlatform {
    pub fn new(device_id: DeviceId, ip: Ipv4Addr, mac: [u8; 6]) -> Self {
        Self {
            state: RwLock::new(State {
                device_id,
                presence: SledPresence::default(),
                ip,
                mac,
            }),
        }
    }

    /// Record the set of sleds currently present.
    pub fn set_sled_presence(&self, presence: SledPresence) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .presence = presence;
    }

    pub fn set_ip_address(&self, ip: Ipv4Addr) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .ip = ip;
    }

    fn read(&self) -> State {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ChassisPlatform for StaticPlatform {
    fn device_id(&self) -> DeviceId {
        self.read().device_id
    }

    fn sled_presence(&self) -> Result<SledPresence, PlatformError> {
        Ok(self.read().presence)
    }

    fn ip_address(&self) -> Result<Ipv4Addr, PlatformError> {
        Ok(self.read().ip)
    }

    fn mac_address(&self) -> Result<[u8; 6], PlatformError> {
        Ok(self.read().mac)
    }
}
