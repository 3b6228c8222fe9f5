// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Hardware and software health of managed components.

use crate::bmc::Bmc;
use crate::bmc::BmcProbe;
use crate::bmc::BmcState;
use crate::bmc::ConnectionData;
use crate::bmc::OnlineStatus;
use crate::bmc::ProbeError;
use crate::client::SharedTransport;
use serde::Serialize;
use slog::o;
use slog::warn;
use slog::Logger;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use thiserror::Error;

/// Whether a component's hardware is there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareStatus {
    Present,
    NotPresent,
    Unknown,
}

impl fmt::Display for HardwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HardwareStatus::Present => "present",
            HardwareStatus::NotPresent => "not_present",
            HardwareStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Whether a component's software is serving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftwareStatus {
    Running,
    NotRunning,
    Unknown,
}

impl fmt::Display for SoftwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SoftwareStatus::Running => "running",
            SoftwareStatus::NotRunning => "not_running",
            SoftwareStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// An error determining health.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("Probe failed")]
    Probe(#[from] ProbeError),

    #[error("Status unavailable: {0}")]
    Unavailable(String),
}

/// A source of health for one kind of component.
pub trait HealthProbe: Send + Sync {
    fn hardware_status(&self) -> Result<HardwareStatus, HealthError>;

    fn software_status(&self) -> Result<SoftwareStatus, HealthError>;
}

/// Health of a remote BMC.
pub enum BmcHealth {
    /// Report the last state polled by a supervised BMC.
    Cached(Arc<Bmc>),

    /// Probe the BMC on every query.
    Live {
        connection: ConnectionData,
        probe: Arc<dyn BmcProbe>,
    },
}

impl BmcHealth {
    pub fn cached(bmc: Arc<Bmc>) -> Self {
        BmcHealth::Cached(bmc)
    }

    pub fn live(connection: ConnectionData, probe: Arc<dyn BmcProbe>) -> Self {
        BmcHealth::Live { connection, probe }
    }
}

impl HealthProbe for BmcHealth {
    fn hardware_status(&self) -> Result<HardwareStatus, HealthError> {
        match self {
            BmcHealth::Cached(bmc) => Ok(match bmc.state() {
                BmcState::Absent => HardwareStatus::NotPresent,
                BmcState::Unknown | BmcState::Online | BmcState::Offline => {
                    HardwareStatus::Present
                }
            }),
            BmcHealth::Live { connection, probe } => {
                if probe.read_presence(connection)? {
                    Ok(HardwareStatus::Present)
                } else {
                    Ok(HardwareStatus::NotPresent)
                }
            }
        }
    }

    fn software_status(&self) -> Result<SoftwareStatus, HealthError> {
        match self {
            BmcHealth::Cached(bmc) => match bmc.state() {
                BmcState::Online => Ok(SoftwareStatus::Running),
                BmcState::Offline | BmcState::Absent => Ok(SoftwareStatus::NotRunning),
                BmcState::Unknown => Err(HealthError::Unavailable(format!(
                    "status of BMC {} is not known",
                    bmc.id()
                ))),
            },
            BmcHealth::Live { connection, probe } => {
                if !probe.read_presence(connection)? {
                    return Ok(SoftwareStatus::NotRunning);
                }
                Ok(match probe.read_online_status(connection)? {
                    OnlineStatus::Online => SoftwareStatus::Running,
                    OnlineStatus::Offline => SoftwareStatus::NotRunning,
                    OnlineStatus::Unknown => SoftwareStatus::Unknown,
                })
            }
        }
    }
}

/// Health of the IPMB responder.
///
/// The hardware is the MUX connection, and the software the receiver and
/// worker pipeline.
#[derive(Clone)]
pub struct IpmbHealth {
    transport: SharedTransport,
    running: Arc<AtomicBool>,
}

impl IpmbHealth {
    pub fn new(transport: SharedTransport, running: Arc<AtomicBool>) -> Self {
        Self { transport, running }
    }
}

impl HealthProbe for IpmbHealth {
    fn hardware_status(&self) -> Result<HardwareStatus, HealthError> {
        let connected = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_connected();
        if connected {
            Ok(HardwareStatus::Present)
        } else {
            Ok(HardwareStatus::NotPresent)
        }
    }

    fn software_status(&self) -> Result<SoftwareStatus, HealthError> {
        if self.running.load(Ordering::Acquire) {
            Ok(SoftwareStatus::Running)
        } else {
            Ok(SoftwareStatus::NotRunning)
        }
    }
}

/// Reports the health of one component, never failing.
pub struct StatusManager {
    log: Logger,
    probe: Box<dyn HealthProbe>,
}

impl StatusManager {
    pub fn new(log: &Logger, component: impl Into<String>, probe: Box<dyn HealthProbe>) -> Self {
        let component = component.into();
        Self {
            log: log.new(o!("component" => "status", "target" => component)),
            probe,
        }
    }

    /// Return the hardware status, or `Unknown` if it cannot be read.
    pub fn get_hw_status(&self) -> HardwareStatus {
        self.probe.hardware_status().unwrap_or_else(|e| {
            warn!(self.log, "failed to read hardware status"; "reason" => %e);
            HardwareStatus::Unknown
        })
    }

    /// Return the software status, or `Unknown` if it cannot be read.
    pub fn get_sw_status(&self) -> SoftwareStatus {
        self.probe.software_status().unwrap_or_else(|e| {
            warn!(self.log, "failed to read software status"; "reason" => %e);
            SoftwareStatus::Unknown
        })
    }
}
