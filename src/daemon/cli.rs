//! `fail2ban-client` adapter.
//!
//! Each call spawns the client through the [`CommandRunner`], classifies
//! the raw output, and only then hands stdout to a structural parser.

use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use super::{
    CommandRunner, DaemonError, DaemonReply, EnforcementDaemon, GlobalStatus, JailSettings,
    JailStatus, RunnerError,
};
use crate::config::DaemonConfig;
use crate::names::JailName;
use crate::parser::{
    self, ErrorKind, classify_error, parse_global_status, parse_jail_status, parse_ping,
    parse_setting_value, parse_unban_reply, parse_version, safe_parse,
};

/// Talks to fail2ban over its command-line client.
#[derive(Debug, Clone)]
pub struct Fail2banClient {
    runner: CommandRunner,
    binary: String,
    extra_args: Vec<String>,
    command_timeout: Duration,
    probe_timeout: Duration,
}

impl Fail2banClient {
    pub fn new(
        runner: CommandRunner,
        binary: impl Into<String>,
        extra_args: Vec<String>,
        probe_timeout: Duration,
    ) -> Self {
        let command_timeout = runner.default_timeout();
        Self {
            runner,
            binary: binary.into(),
            extra_args,
            command_timeout,
            probe_timeout,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        let runner = CommandRunner::new(
            config.allowed_binaries.iter().cloned(),
            config.command_timeout(),
            config.max_output_bytes,
            config.max_concurrent_processes,
        );
        Self::new(
            runner,
            config.client_binary.clone(),
            config.extra_args.clone(),
            config.probe_timeout(),
        )
    }

    /// Run one client command and return stdout once it classifies clean.
    async fn exec(&self, args: &[&str], limit: Duration) -> Result<String, DaemonError> {
        let mut argv = self.extra_args.clone();
        argv.extend(args.iter().map(|a| a.to_string()));

        let output = self
            .runner
            .run_with_timeout(&self.binary, &argv, limit)
            .await
            .map_err(|e| match e {
                RunnerError::NotFound(p) => DaemonError::NotInstalled(p),
                RunnerError::TimedOut { after, .. } => DaemonError::Timeout(after),
                other => DaemonError::Command(other.to_string()),
            })?;

        let class = classify_error(&output.stdout, &output.stderr, output.status);
        if class.is_error {
            debug!(command = ?args, kind = ?class.kind, message = %class.message, "daemon command failed");
            return Err(match class.kind {
                Some(ErrorKind::CommandNotFound) => DaemonError::NotInstalled(class.message),
                Some(ErrorKind::ServiceDown) => DaemonError::ServiceDown(class.message),
                Some(ErrorKind::NotOk) => DaemonError::NotOk(class.message),
                Some(ErrorKind::Malformed) => DaemonError::Malformed(class.message),
                Some(ErrorKind::Failed) | None => DaemonError::Command(class.message),
            });
        }
        if output.truncated {
            return Err(DaemonError::Malformed(format!(
                "output of `{}` exceeded the capture limit",
                args.join(" ")
            )));
        }
        Ok(output.stdout)
    }

    async fn control(&self, args: &[&str]) -> Result<DaemonReply, DaemonError> {
        let output = self.exec(args, self.command_timeout).await?;
        Ok(DaemonReply { output })
    }

    async fn setting(&self, jail: &JailName, key: &str) -> Option<i64> {
        match self.exec(&["get", jail.as_str(), key], self.probe_timeout).await {
            Ok(raw) => {
                let parsed = safe_parse(parse_setting_value, &raw, 0);
                match parsed.error {
                    None => Some(parsed.value),
                    Some(note) => {
                        debug!(jail = %jail, setting = key, note = %note, "unparseable setting");
                        None
                    }
                }
            }
            Err(e) => {
                debug!(jail = %jail, setting = key, error = %e, "setting unavailable");
                None
            }
        }
    }
}

fn malformed(note: String, raw: &str) -> DaemonError {
    DaemonError::Malformed(format!("{note} (output: {})", parser::excerpt(raw, 120)))
}

#[async_trait]
impl EnforcementDaemon for Fail2banClient {
    async fn global_status(&self) -> Result<GlobalStatus, DaemonError> {
        let raw = self.exec(&["status"], self.probe_timeout).await?;
        safe_parse(parse_global_status, &raw, GlobalStatus::default())
            .into_result()
            .map_err(|note| malformed(note, &raw))
    }

    async fn jail_status(&self, jail: &JailName) -> Result<JailStatus, DaemonError> {
        let raw = self.exec(&["status", jail.as_str()], self.probe_timeout).await?;
        safe_parse(parse_jail_status, &raw, JailStatus::default())
            .into_result()
            .map_err(|note| malformed(note, &raw))
    }

    async fn jail_settings(&self, jail: &JailName) -> JailSettings {
        let (max_retry, ban_time, find_time) = tokio::join!(
            self.setting(jail, "maxretry"),
            self.setting(jail, "bantime"),
            self.setting(jail, "findtime"),
        );
        JailSettings {
            max_retry,
            ban_time,
            find_time,
        }
    }

    async fn start(&self, jail: &JailName) -> Result<DaemonReply, DaemonError> {
        self.control(&["start", jail.as_str()]).await
    }

    async fn stop(&self, jail: &JailName) -> Result<DaemonReply, DaemonError> {
        self.control(&["stop", jail.as_str()]).await
    }

    async fn unban(&self, jail: &JailName, address: IpAddr) -> Result<DaemonReply, DaemonError> {
        let addr = address.to_string();
        let reply = self.control(&["set", jail.as_str(), "unbanip", &addr]).await?;
        let released = safe_parse(parse_unban_reply, &reply.output, 0);
        debug!(jail = %jail, address = %addr, released = released.value, "unban dispatched");
        Ok(reply)
    }

    async fn restart(&self) -> Result<DaemonReply, DaemonError> {
        self.control(&["restart"]).await
    }

    async fn ping(&self) -> Result<bool, DaemonError> {
        let raw = self.exec(&["ping"], self.probe_timeout).await?;
        Ok(safe_parse(parse_ping, &raw, false).value)
    }

    async fn version(&self) -> Result<String, DaemonError> {
        let raw = self.exec(&["version"], self.probe_timeout).await?;
        safe_parse(parse_version, &raw, String::new())
            .into_result()
            .map_err(|note| malformed(note, &raw))
    }

    fn backend_name(&self) -> &'static str {
        "fail2ban-client"
    }
}
