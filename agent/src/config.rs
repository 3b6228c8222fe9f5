// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Configuration of the chassis agent.

use crate::Error;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::time::Duration;

/// The TCP port on which the MUX accepts connections.
pub const MUX_PORT: u16 = 5623;

/// Return the default address of the MUX daemon.
///
/// The MUX only accepts connections on the loopback interface.
pub const fn default_mux_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, MUX_PORT))
}

/// Return the default time allowed to connect and register with the MUX.
pub const fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Return the default time the receiver sleeps when no data is available.
pub const fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

/// Return the default time a partial frame may wait for the rest of its
/// bytes.
pub const fn default_fragment_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Return the default delay before reconnecting to the MUX.
pub const fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}

/// Return the default number of requests buffered between receiver and
/// worker.
pub const fn default_queue_depth() -> usize {
    16
}

/// Return the default interval on which BMC state is polled.
pub const fn default_bmc_update_interval() -> Duration {
    Duration::from_secs(10)
}

/// Return the default timeout for a single BMC probe.
pub const fn default_probe_timeout() -> Duration {
    Duration::from_secs(1)
}

/// Configuration for an [`crate::IpmbAgent`] and the BMCs it supervises.
///
/// The [`ConfigBuilder`] can be used to construct this with defaults suitable
/// for a MUX running on the same host.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// The address of the MUX daemon.
    pub mux_addr: SocketAddr,

    /// The time allowed to connect and register as a responder.
    pub connect_timeout: Duration,

    /// The time the receiver waits before polling an idle connection again.
    pub poll_interval: Duration,

    /// The time a partial frame is held for the rest of its bytes before it
    /// is discarded.
    pub fragment_timeout: Duration,

    /// The delay before reconnecting after the MUX connection fails.
    pub reconnect_interval: Duration,

    /// The number of framed requests the receiver may queue for the worker.
    ///
    /// Requests arriving while the queue is full are dropped.
    pub queue_depth: usize,

    /// The interval on which each BMC's presence and status are polled.
    pub bmc_update_interval: Duration,

    /// The timeout for a single BMC probe.
    pub probe_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mux_addr: default_mux_addr(),
            connect_timeout: default_connect_timeout(),
            poll_interval: default_poll_interval(),
            fragment_timeout: default_fragment_timeout(),
            reconnect_interval: default_reconnect_interval(),
            queue_depth: default_queue_depth(),
            bmc_update_interval: default_bmc_update_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// A builder interface for generating agent configuration.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    mux_addr: Option<SocketAddr>,
    connect_timeout: Option<Duration>,
    poll_interval: Option<Duration>,
    fragment_timeout: Option<Duration>,
    reconnect_interval: Option<Duration>,
    queue_depth: Option<usize>,
    bmc_update_interval: Option<Duration>,
    probe_timeout: Option<Duration>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address of the MUX daemon.
    pub fn mux_addr(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.mux_addr = Some(addr.into());
        self
    }

    /// Set the time allowed to connect and register with the MUX.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the time the receiver sleeps when no data is available.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the time a partial frame may wait for the rest of its bytes.
    pub fn fragment_timeout(mut self, timeout: Duration) -> Self {
        self.fragment_timeout = Some(timeout);
        self
    }

    /// Set the delay before reconnecting to the MUX.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }

    /// Set the number of requests buffered between receiver and worker.
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Set the interval on which BMC state is polled.
    pub fn bmc_update_interval(mut self, interval: Duration) -> Self {
        self.bmc_update_interval = Some(interval);
        self
    }

    /// Set the timeout of a single BMC probe.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Build a `Config` from `self`.
    pub fn build(self) -> Result<Config, Error> {
        let config = Config {
            mux_addr: self.mux_addr.unwrap_or_else(default_mux_addr),
            connect_timeout: self.connect_timeout.unwrap_or_else(default_connect_timeout),
            poll_interval: self.poll_interval.unwrap_or_else(default_poll_interval),
            fragment_timeout: self
                .fragment_timeout
                .unwrap_or_else(default_fragment_timeout),
            reconnect_interval: self
                .reconnect_interval
                .unwrap_or_else(default_reconnect_interval),
            queue_depth: self.queue_depth.unwrap_or_else(default_queue_depth),
            bmc_update_interval: self
                .bmc_update_interval
                .unwrap_or_else(default_bmc_update_interval),
            probe_timeout: self.probe_timeout.unwrap_or_else(default_probe_timeout),
        };
        let durations = [
            ("connect_timeout", config.connect_timeout),
            ("poll_interval", config.poll_interval),
            ("fragment_timeout", config.fragment_timeout),
            ("reconnect_interval", config.reconnect_interval),
            ("bmc_update_interval", config.bmc_update_interval),
            ("probe_timeout", config.probe_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        if config.queue_depth == 0 {
            return Err(Error::Config(String::from("queue_depth must be non-zero")));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::default_mux_addr;
    use super::Config;
    use super::ConfigBuilder;
    use crate::Error;
    use std::net::Ipv4Addr;
    use std::net::SocketAddr;
    use std::time::Duration;

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.mux_addr, default_mux_addr());
        assert!(config.mux_addr.ip().is_loopback());
    }

    #[test]
    fn test_config_builder_overrides() {
        let addr = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 9000));
        let config = ConfigBuilder::new()
            .mux_addr(addr)
            .queue_depth(4)
            .poll_interval(Duration::from_millis(1))
            .fragment_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        assert_eq!(config.mux_addr, addr);
        assert_eq!(config.queue_depth, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.fragment_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_config_builder_rejects_zero_values() {
        assert!(matches!(
            ConfigBuilder::new().queue_depth(0).build(),
            Err(Error::Config(_))
        ));
        let Err(Error::Config(msg)) = ConfigBuilder::new()
            .bmc_update_interval(Duration::ZERO)
            .build()
        else {
            panic!("expected a configuration error");
        };
        assert!(msg.contains("bmc_update_interval"));
        let Err(Error::Config(msg)) = ConfigBuilder::new()
            .fragment_timeout(Duration::ZERO)
            .build()
        else {
            panic!("expected a configuration error");
        };
        assert!(msg.contains("fragment_timeout"));
    }
}
