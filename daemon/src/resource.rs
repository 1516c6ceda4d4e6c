//! Managed external processes the watchdog keeps alive.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use log::{info, warn};

use crate::config::ResourceConfig;

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

pub trait ManagedResource: Send {
    fn id(&self) -> &str;

    fn start(&mut self) -> anyhow::Result<()>;

    /// Must return within roughly `timeout`.
    fn probe(&mut self, timeout: Duration) -> Health;

    fn restart(&mut self) -> anyhow::Result<()>;

    fn stop(&mut self);
}

/// A child process, optionally with an HTTP health endpoint.
pub struct ProcessResource {
    id: String,
    command: Vec<String>,
    health_url: Option<String>,
    child: Option<Child>,
    client: reqwest::blocking::Client,
}

impl ProcessResource {
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            id: config.id.clone(),
            command: config.command.clone(),
            health_url: config.health_url.clone(),
            child: None,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn spawn_child(&mut self) -> anyhow::Result<()> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(());
        };
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn `{program}` for {}", self.id))?;
        info!("[Watchdog] {}: started pid {}", self.id, child.id());
        self.child = Some(child);
        Ok(())
    }

    fn check_process(&mut self) -> Health {
        if self.command.is_empty() {
            return Health::Healthy;
        }
        let Some(child) = self.child.as_mut() else {
            return Health::Unhealthy("not running".into());
        };
        match child.try_wait() {
            Ok(None) => Health::Healthy,
            Ok(Some(status)) => Health::Unhealthy(format!("exited with {status}")),
            Err(err) => Health::Unhealthy(format!("wait failed: {err}")),
        }
    }

    fn check_endpoint(&self, timeout: Duration) -> Health {
        let Some(url) = self.health_url.as_deref() else {
            return Health::Healthy;
        };
        match self.client.head(url).timeout(timeout).send() {
            Ok(response) if response.status().is_success() => Health::Healthy,
            Ok(response) => Health::Unhealthy(format!("{url} returned {}", response.status())),
            Err(err) if err.is_timeout() => Health::Unhealthy(format!("{url} timed out")),
            Err(err) => Health::Unhealthy(format!("{url} unreachable: {err}")),
        }
    }
}

impl ManagedResource for ProcessResource {
    fn id(&self) -> &str {
        &self.id
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.child.is_some() {
            return Err(anyhow!("{} is already running", self.id));
        }
        self.spawn_child()
    }

    fn probe(&mut self, timeout: Duration) -> Health {
        match self.check_process() {
            Health::Healthy => self.check_endpoint(timeout),
            unhealthy => unhealthy,
        }
    }

    fn restart(&mut self) -> anyhow::Result<()> {
        self.stop();
        self.spawn_child()
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if terminate(&mut child) {
            return;
        }
        if let Err(err) = child.kill() {
            warn!("[Watchdog] {}: kill failed: {}", self.id, err);
        }
        let _ = child.wait();
    }
}

/// SIGTERM, then wait briefly for a clean exit. Returns true once reaped.
fn terminate(child: &mut Child) -> bool {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return false;
    };
    // SAFETY: `pid` belongs to a child we spawned and have not yet reaped.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return false;
    }
    let deadline = Instant::now() + TERMINATE_TIMEOUT;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

impl Drop for ProcessResource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(command: &[&str]) -> ProcessResource {
        let mut config = ResourceConfig::new("test");
        config.command = command.iter().map(|part| part.to_string()).collect();
        ProcessResource::new(&config)
    }

    #[test]
    fn probe_only_resource_without_url_is_healthy() {
        let mut resource = resource(&[]);
        resource.start().unwrap();
        assert_eq!(resource.probe(Duration::from_millis(100)), Health::Healthy);
    }

    #[test]
    fn exited_child_is_unhealthy_until_restarted() {
        let mut resource = resource(&["sleep", "30"]);
        assert!(!resource.probe(Duration::from_millis(100)).is_healthy());

        resource.start().unwrap();
        assert!(resource.probe(Duration::from_millis(100)).is_healthy());
        assert!(resource.start().is_err());

        if let Some(child) = resource.child.as_mut() {
            child.kill().unwrap();
            child.wait().unwrap();
        }
        assert!(matches!(
            resource.probe(Duration::from_millis(100)),
            Health::Unhealthy(_)
        ));

        resource.restart().unwrap();
        assert!(resource.probe(Duration::from_millis(100)).is_healthy());
        resource.stop();
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let mut resource = resource(&["/nonexistent/minus-test-binary"]);
        assert!(resource.start().is_err());
    }

    #[test]
    fn unreachable_health_url_is_unhealthy() {
        let mut config = ResourceConfig::new("http");
        config.health_url = Some("http://127.0.0.1:9/health".into());
        let mut resource = ProcessResource::new(&config);
        assert!(!resource.probe(Duration::from_millis(500)).is_healthy());
    }
}
