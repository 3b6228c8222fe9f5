// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Supervising remote BMCs.
//!
//! Each [`Bmc`] owns a [`Watcher`] whose `state_update` task polls the
//! controller through a [`BmcProbe`], first for presence and then, only if
//! present, for online status. Changes of state are reported as
//! [`Transition`]s to a [`TransitionHandler`], which may veto them.

use crate::probes;
use crate::watcher::Task;
use crate::watcher::Watcher;
use crate::Error;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

/// The state of a supervised BMC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BmcState {
    /// The BMC is not physically present.
    #[default]
    Absent,
    /// The BMC is present, but its status is not known.
    Unknown,
    Online,
    Offline,
}

impl BmcState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BmcState::Absent => "absent",
            BmcState::Unknown => "unknown",
            BmcState::Online => "online",
            BmcState::Offline => "offline",
        }
    }
}

impl fmt::Display for BmcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer of an online-status probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    Online,
    Offline,
    Unknown,
}

/// A step between two states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// The BMC appeared.
    Insertion,
    /// The BMC disappeared.
    Extraction,
    BecomeOnline,
    BecomeOffline,
    /// The status of a present BMC could no longer be determined.
    StatusLost,
}

impl Transition {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Transition::Insertion => "insertion",
            Transition::Extraction => "extraction",
            Transition::BecomeOnline => "become_online",
            Transition::BecomeOffline => "become_offline",
            Transition::StatusLost => "status_lost",
        }
    }

    /// The state this transition leads to.
    pub const fn target(&self) -> BmcState {
        match self {
            Transition::Insertion | Transition::StatusLost => BmcState::Unknown,
            Transition::Extraction => BmcState::Absent,
            Transition::BecomeOnline => BmcState::Online,
            Transition::BecomeOffline => BmcState::Offline,
        }
    }
}

// The transitions leading from `from` to `to`, in order.
fn path(from: BmcState, to: BmcState) -> Vec<Transition> {
    use BmcState::*;
    match (from, to) {
        (a, b) if a == b => vec![],
        (_, Absent) => vec![Transition::Extraction],
        (Absent, Unknown) => vec![Transition::Insertion],
        (Absent, Online) => vec![Transition::Insertion, Transition::BecomeOnline],
        (Absent, Offline) => vec![Transition::Insertion, Transition::BecomeOffline],
        (_, Unknown) => vec![Transition::StatusLost],
        (_, Online) => vec![Transition::BecomeOnline],
        (_, Offline) => vec![Transition::BecomeOffline],
    }
}

/// An error probing a BMC.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Probe I/O error: {0}")]
    Io(String),

    #[error("Probe failed: {0}")]
    Other(String),
}

/// How to reach a BMC.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionData {
    pub ip: IpAddr,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ConnectionData {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// The key identifying the BMC, `ip:port`.
    pub fn id(&self) -> String {
        self.socket_addr().to_string()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for ConnectionData {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Debug for ConnectionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionData")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Hardware access used to poll a BMC.
pub trait BmcProbe: Send + Sync {
    /// Return true if the BMC is physically present.
    fn read_presence(&self, connection: &ConnectionData) -> Result<bool, ProbeError>;

    /// Return the BMC's online status. Only called for a present BMC.
    fn read_online_status(&self, connection: &ConnectionData) -> Result<OnlineStatus, ProbeError>;
}

/// Receives state transitions of a BMC.
pub trait TransitionHandler: Send + Sync {
    /// Handle `transition` of the BMC `id`, returning false to veto it.
    ///
    /// A vetoed transition is retried on the next poll.
    fn on_transition(&self, id: &str, transition: Transition) -> bool;
}

impl<F> TransitionHandler for F
where
    F: Fn(&str, Transition) -> bool + Send + Sync,
{
    fn on_transition(&self, id: &str, transition: Transition) -> bool {
        self(id, transition)
    }
}

/// A handler accepting every transition.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl TransitionHandler for AcceptAll {
    fn on_transition(&self, _: &str, _: Transition) -> bool {
        true
    }
}

/// A probe over TCP.
///
/// A BMC is present if its host answers a connection attempt at all, and
/// online if its port accepts the connection. A refused connection means
/// the host is up but the service is not.
#[derive(Clone, Copy, Debug)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn try_connect(&self, connection: &ConnectionData) -> std::io::Result<()> {
        TcpStream::connect_timeout(&connection.socket_addr(), self.timeout).map(|_| ())
    }
}

impl BmcProbe for TcpProbe {
    fn read_presence(&self, connection: &ConnectionData) -> Result<bool, ProbeError> {
        match self.try_connect(connection) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(false),
            Err(e) => Err(ProbeError::Io(e.to_string())),
        }
    }

    fn read_online_status(&self, connection: &ConnectionData) -> Result<OnlineStatus, ProbeError> {
        match self.try_connect(connection) {
            Ok(()) => Ok(OnlineStatus::Online),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(OnlineStatus::Offline),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(ProbeError::Timeout(self.timeout))
            }
            Err(e) => Err(ProbeError::Io(e.to_string())),
        }
    }
}

// A task added by the owner of a BMC, re-armed on every start.
struct ExtraTask {
    name: String,
    delay: Duration,
    period: Duration,
    body: Arc<dyn Fn() + Send + Sync>,
}

struct BmcShared {
    log: Logger,
    id: String,
    connection: ConnectionData,
    probe: Arc<dyn BmcProbe>,
    handler: Arc<dyn TransitionHandler>,
    state: Mutex<BmcState>,
    // Held for a whole probe and its transitions. Readers only take `state`.
    update: Mutex<()>,
}

impl BmcShared {
    fn state(&self) -> MutexGuard<'_, BmcState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Probe the BMC, returning the state it should be in.
    fn probe(&self) -> BmcState {
        match self.probe.read_presence(&self.connection) {
            Ok(false) => BmcState::Absent,
            Ok(true) => match self.probe.read_online_status(&self.connection) {
                Ok(OnlineStatus::Online) => BmcState::Online,
                Ok(OnlineStatus::Offline) => BmcState::Offline,
                Ok(OnlineStatus::Unknown) => BmcState::Unknown,
                Err(e) => {
                    warn!(self.log, "failed to read online status"; "reason" => %e);
                    BmcState::Unknown
                }
            },
            Err(e) => {
                warn!(self.log, "failed to read presence"; "reason" => %e);
                BmcState::Unknown
            }
        }
    }

    fn update_state(&self) -> BmcState {
        let _update = self.update.lock().unwrap_or_else(PoisonError::into_inner);
        let target = self.probe();
        let mut state = *self.state();
        for transition in path(state, target) {
            if !self.handler.on_transition(&self.id, transition) {
                debug!(
                    self.log,
                    "transition vetoed";
                    "transition" => transition.as_str(),
                    "state" => state.as_str(),
                );
                break;
            }
            state = transition.target();
            *self.state() = state;
            probes::bmc__transition!(|| {
                (self.id.clone(), transition.as_str().to_string(), state.as_str().to_string())
            });
            info!(
                self.log,
                "BMC changed state";
                "transition" => transition.as_str(),
                "state" => state.as_str(),
            );
        }
        state
    }
}

/// A supervised BMC.
pub struct Bmc {
    shared: Arc<BmcShared>,
    interval: Duration,
    extra_tasks: Mutex<Vec<ExtraTask>>,
    watcher: Watcher,
}

impl fmt::Debug for Bmc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bmc")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("interval", &self.interval)
            .field("watcher", &self.watcher)
            .finish()
    }
}

impl Bmc {
    /// The name of the task polling the BMC's state.
    pub const STATE_UPDATE_TASK: &'static str = "state_update";

    pub fn new(
        log: &Logger,
        connection: ConnectionData,
        interval: Duration,
        probe: Arc<dyn BmcProbe>,
        handler: Arc<dyn TransitionHandler>,
    ) -> Self {
        let id = connection.id();
        let log = log.new(o!("bmc" => id.clone()));
        let watcher = Watcher::new(&log, format!("bmc-{id}"));
        Self {
            shared: Arc::new(BmcShared {
                log,
                id,
                connection,
                probe,
                handler,
                state: Mutex::new(BmcState::Absent),
                update: Mutex::new(()),
            }),
            interval,
            extra_tasks: Mutex::new(Vec::new()),
            watcher,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn connection(&self) -> &ConnectionData {
        &self.shared.connection
    }

    pub fn state(&self) -> BmcState {
        *self.shared.state()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Probe the BMC now, and move to the resulting state.
    pub fn update_state(&self) -> BmcState {
        self.shared.update_state()
    }

    /// Add a periodic task, run alongside the state update.
    ///
    /// The task is kept across restarts. If the BMC is running, it is
    /// scheduled immediately.
    pub fn periodic_task<F>(
        &self,
        name: impl Into<String>,
        delay: Duration,
        period: Duration,
        body: F,
    ) where
        F: Fn() + Send + Sync + 'static,
    {
        let task = ExtraTask {
            name: name.into(),
            delay,
            period,
            body: Arc::new(body),
        };
        if self.watcher.is_running() {
            self.watcher.add_task(extra(&task));
        }
        let mut tasks = self.extra_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| t.name != task.name);
        tasks.push(task);
    }

    /// Replace all scheduled tasks with a fresh `state_update` task, and any
    /// tasks added with [`Bmc::periodic_task`].
    pub fn reset_tasks(&self) {
        self.watcher.clear_tasks();
        let shared = self.shared.clone();
        self.watcher.add_task(Task::periodic(
            Self::STATE_UPDATE_TASK,
            Duration::ZERO,
            self.interval,
            move || {
                shared.update_state();
            },
        ));
        let tasks = self.extra_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.iter() {
            self.watcher.add_task(extra(task));
        }
    }

    /// Start polling. Starting a running BMC re-arms its tasks.
    pub fn start(&self) -> Result<(), Error> {
        self.reset_tasks();
        self.watcher.start()
    }

    /// Stop polling. This may be called any number of times.
    pub fn stop(&self) {
        self.watcher.stop();
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_running()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.watcher.task_names()
    }
}

fn extra(task: &ExtraTask) -> Task {
    let body = task.body.clone();
    Task::periodic(task.name.clone(), task.delay, task.period, move || body())
}

impl Drop for Bmc {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A fleet of BMCs, keyed by `ip:port`.
pub struct BmcManager {
    log: Logger,
    interval: Duration,
    probe: Arc<dyn BmcProbe>,
    handler: Arc<dyn TransitionHandler>,
    bmcs: Mutex<BTreeMap<String, Arc<Bmc>>>,
}

impl BmcManager {
    pub fn new(
        log: &Logger,
        interval: Duration,
        probe: Arc<dyn BmcProbe>,
        handler: Arc<dyn TransitionHandler>,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "bmc_manager")),
            interval,
            probe,
            handler,
            bmcs: Mutex::new(BTreeMap::new()),
        }
    }

    fn bmcs(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Bmc>>> {
        self.bmcs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start supervising a BMC, replacing any with the same key.
    pub fn add(&self, connection: ConnectionData) -> Result<Arc<Bmc>, Error> {
        let bmc = Arc::new(Bmc::new(
            &self.log,
            connection,
            self.interval,
            self.probe.clone(),
            self.handler.clone(),
        ));
        bmc.start()?;
        let old = self.bmcs().insert(bmc.id().to_string(), bmc.clone());
        if let Some(old) = old {
            debug!(self.log, "replacing BMC"; "bmc" => old.id());
            old.stop();
        }
        info!(self.log, "supervising BMC"; "bmc" => bmc.id());
        Ok(bmc)
    }

    /// Stop supervising a BMC, returning true if it was known.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.bmcs().remove(id);
        match removed {
            Some(bmc) => {
                bmc.stop();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Bmc>> {
        self.bmcs().get(id).cloned()
    }

    pub fn state(&self, id: &str) -> Option<BmcState> {
        self.get(id).map(|bmc| bmc.state())
    }

    /// The state of every BMC, ordered by key.
    pub fn states(&self) -> Vec<(String, BmcState)> {
        self.bmcs()
            .iter()
            .map(|(id, bmc)| (id.clone(), bmc.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bmcs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bmcs().is_empty()
    }

    /// Stop every BMC.
    pub fn stop_all(&self) {
        let bmcs = std::mem::take(&mut *self.bmcs());
        for bmc in bmcs.values() {
            bmc.stop();
        }
    }
}

impl Drop for BmcManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}
