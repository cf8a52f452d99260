//! In-process enforcement daemon.
//!
//! Mirrors the observable behaviour of the real daemon closely enough for
//! the engine: not-OK on redundant start/stop, "does not exist" for jails
//! that are not running, and bans that vanish when a jail stops. Knobs on
//! the handle let callers simulate outages, slow jails and daemons that
//! accept commands without acting on them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use super::{DaemonError, DaemonReply, EnforcementDaemon, GlobalStatus, JailSettings, JailStatus};
use crate::names::JailName;

/// Only the most recent calls are remembered.
const MAX_RECORDED_CALLS: usize = 1024;

#[derive(Debug, Default, Clone)]
struct SimJail {
    active: bool,
    banned: Vec<String>,
    total_banned: u64,
    total_failed: u64,
    settings: JailSettings,
}

#[derive(Debug)]
struct SimState {
    installed: bool,
    running: bool,
    version: String,
    jails: BTreeMap<String, SimJail>,
    stalls: HashMap<String, Duration>,
    list_stall: Option<Duration>,
    status_errors: HashMap<String, DaemonError>,
    control_errors: HashMap<String, DaemonError>,
    frozen: HashSet<String>,
    calls: VecDeque<String>,
}

impl SimState {
    fn record(&mut self, call: String) {
        if self.calls.len() == MAX_RECORDED_CALLS {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            installed: true,
            running: true,
            version: "1.0.2".to_string(),
            jails: BTreeMap::new(),
            stalls: HashMap::new(),
            list_stall: None,
            status_errors: HashMap::new(),
            control_errors: HashMap::new(),
            frozen: HashSet::new(),
            calls: VecDeque::new(),
        }
    }
}

/// Simulated daemon; cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryDaemon {
    state: Mutex<SimState>,
}

fn nok_missing(jail: &str) -> DaemonError {
    DaemonError::NotOk(format!("Sorry but the jail '{jail}' does not exist"))
}

impl MemoryDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a jail known to the daemon.
    pub fn add_jail(&self, name: &str, active: bool) {
        self.state.lock().jails.insert(
            name.to_string(),
            SimJail {
                active,
                ..SimJail::default()
            },
        );
    }

    /// Record a ban in a running jail. Duplicates are ignored.
    pub fn ban(&self, jail: &str, address: &str) {
        let mut state = self.state.lock();
        if let Some(j) = state.jails.get_mut(jail)
            && j.active
            && !j.banned.iter().any(|a| a == address)
        {
            j.banned.push(address.to_string());
            j.total_banned += 1;
        }
    }

    pub fn set_settings(&self, jail: &str, settings: JailSettings) {
        if let Some(j) = self.state.lock().jails.get_mut(jail) {
            j.settings = settings;
        }
    }

    /// Simulate the client binary being absent.
    pub fn set_installed(&self, installed: bool) {
        self.state.lock().installed = installed;
    }

    /// Simulate the server process being down.
    pub fn set_running(&self, running: bool) {
        self.state.lock().running = running;
    }

    /// Delay every status query for `jail`.
    pub fn stall(&self, jail: &str, delay: Duration) {
        self.state.lock().stalls.insert(jail.to_string(), delay);
    }

    /// Delay every global status query.
    pub fn stall_list(&self, delay: Duration) {
        self.state.lock().list_stall = Some(delay);
    }

    /// Make status queries for `jail` fail with `err` (`None` clears).
    pub fn fail_status(&self, jail: &str, err: Option<DaemonError>) {
        let mut state = self.state.lock();
        match err {
            Some(e) => state.status_errors.insert(jail.to_string(), e),
            None => state.status_errors.remove(jail),
        };
    }

    /// Make start, stop and unban for `jail` fail with `err` (`None` clears).
    pub fn fail_control(&self, jail: &str, err: Option<DaemonError>) {
        let mut state = self.state.lock();
        match err {
            Some(e) => state.control_errors.insert(jail.to_string(), e),
            None => state.control_errors.remove(jail),
        };
    }

    /// Accept control commands for `jail` without acting on them.
    pub fn freeze(&self, jail: &str) {
        self.state.lock().frozen.insert(jail.to_string());
    }

    pub fn is_active(&self, jail: &str) -> bool {
        self.state.lock().jails.get(jail).is_some_and(|j| j.active)
    }

    pub fn banned(&self, jail: &str) -> Vec<String> {
        self.state
            .lock()
            .jails
            .get(jail)
            .map(|j| j.banned.clone())
            .unwrap_or_default()
    }

    /// Recent commands received, oldest first, as `verb [jail] [arg]`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.iter().cloned().collect()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Log the call and check reachability.
    fn enter(&self, call: String) -> Result<(), DaemonError> {
        let mut state = self.state.lock();
        state.record(call);
        if !state.installed {
            return Err(DaemonError::NotInstalled("fail2ban-client: command not found".to_string()));
        }
        if !state.running {
            return Err(DaemonError::ServiceDown(
                "Failed to access socket path: /var/run/fail2ban/fail2ban.sock. Is fail2ban running?"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn stall_for(&self, jail: &str) -> Option<Duration> {
        self.state.lock().stalls.get(jail).copied()
    }

    fn reply(text: &str) -> DaemonReply {
        DaemonReply {
            output: text.to_string(),
        }
    }
}

#[async_trait]
impl EnforcementDaemon for MemoryDaemon {
    async fn global_status(&self) -> Result<GlobalStatus, DaemonError> {
        self.enter("status".to_string())?;
        let stall = self.state.lock().list_stall;
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        let jail_names: Vec<String> = state
            .jails
            .iter()
            .filter(|(_, j)| j.active)
            .map(|(n, _)| n.clone())
            .collect();
        Ok(GlobalStatus {
            jail_count: jail_names.len(),
            jail_names,
        })
    }

    async fn jail_status(&self, jail: &JailName) -> Result<JailStatus, DaemonError> {
        self.enter(format!("status {jail}"))?;
        if let Some(delay) = self.stall_for(jail.as_str()) {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        if let Some(err) = state.status_errors.get(jail.as_str()) {
            return Err(err.clone());
        }
        match state.jails.get(jail.as_str()) {
            Some(j) if j.active => Ok(JailStatus {
                currently_failed: 0,
                total_failed: j.total_failed,
                file_list: vec![format!("/var/log/{jail}.log")],
                currently_banned: j.banned.len() as u64,
                total_banned: Some(j.total_banned),
                banned_addresses: j.banned.clone(),
            }),
            _ => Err(nok_missing(jail.as_str())),
        }
    }

    async fn jail_settings(&self, jail: &JailName) -> JailSettings {
        if self.enter(format!("get {jail}")).is_err() {
            return JailSettings::default();
        }
        let state = self.state.lock();
        match state.jails.get(jail.as_str()) {
            Some(j) if j.active => j.settings,
            _ => JailSettings::default(),
        }
    }

    async fn start(&self, jail: &JailName) -> Result<DaemonReply, DaemonError> {
        self.enter(format!("start {jail}"))?;
        let mut state = self.state.lock();
        if let Some(err) = state.control_errors.get(jail.as_str()) {
            return Err(err.clone());
        }
        if state.frozen.contains(jail.as_str()) {
            return Ok(Self::reply("Jail started"));
        }
        match state.jails.get_mut(jail.as_str()) {
            Some(j) if !j.active => {
                j.active = true;
                Ok(Self::reply("Jail started"))
            }
            Some(_) => Err(DaemonError::NotOk(format!("NOK: ('{jail}',)"))),
            None => Err(nok_missing(jail.as_str())),
        }
    }

    async fn stop(&self, jail: &JailName) -> Result<DaemonReply, DaemonError> {
        self.enter(format!("stop {jail}"))?;
        let mut state = self.state.lock();
        if let Some(err) = state.control_errors.get(jail.as_str()) {
            return Err(err.clone());
        }
        if state.frozen.contains(jail.as_str()) {
            return Ok(Self::reply("Jail stopped"));
        }
        match state.jails.get_mut(jail.as_str()) {
            Some(j) if j.active => {
                j.active = false;
                j.banned.clear();
                Ok(Self::reply("Jail stopped"))
            }
            _ => Err(nok_missing(jail.as_str())),
        }
    }

    async fn unban(&self, jail: &JailName, address: IpAddr) -> Result<DaemonReply, DaemonError> {
        let addr = address.to_string();
        self.enter(format!("unban {jail} {addr}"))?;
        let mut state = self.state.lock();
        if let Some(err) = state.control_errors.get(jail.as_str()) {
            return Err(err.clone());
        }
        let frozen = state.frozen.contains(jail.as_str());
        match state.jails.get_mut(jail.as_str()) {
            Some(j) if j.active => {
                let before = j.banned.len();
                if !frozen {
                    j.banned.retain(|a| *a != addr);
                }
                if before == j.banned.len() && !frozen {
                    return Err(DaemonError::NotOk(format!("NOK: ('{addr} is not banned',)")));
                }
                Ok(Self::reply("1"))
            }
            _ => Err(nok_missing(jail.as_str())),
        }
    }

    async fn restart(&self) -> Result<DaemonReply, DaemonError> {
        {
            let mut state = self.state.lock();
            state.record("restart".to_string());
            if !state.installed {
                return Err(DaemonError::NotInstalled("fail2ban-client: command not found".to_string()));
            }
            // A restart brings a stopped server back.
            state.running = true;
        }
        Ok(Self::reply("Shutdown successful\nServer ready"))
    }

    async fn ping(&self) -> Result<bool, DaemonError> {
        self.enter("ping".to_string())?;
        Ok(true)
    }

    async fn version(&self) -> Result<String, DaemonError> {
        self.enter("version".to_string())?;
        Ok(self.state.lock().version.clone())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
