use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, warn};

use crate::blocking::DisplaySink;
use crate::config::DisplayConfig;

const SOURCE_PLACEHOLDER: &str = "{source}";
const HOOK_POLL_INTERVAL: Duration = Duration::from_millis(10);

const MUTE_UNKNOWN: u8 = 0;
const MUTE_ON: u8 = 1;
const MUTE_OFF: u8 = 2;

/// Display sink that shells out to configured commands.
///
/// An empty command is a no-op that still succeeds. A hook that outlives
/// `hook_timeout_ms` is killed so the detector thread never waits on it.
pub struct HookSink {
    config: DisplayConfig,
    muted: AtomicU8,
}

impl HookSink {
    pub fn new(config: DisplayConfig) -> Self {
        Self {
            config,
            muted: AtomicU8::new(MUTE_UNKNOWN),
        }
    }

    fn run(&self, name: &str, argv: &[String], label: Option<&str>) -> Result<()> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        let args: Vec<String> = args
            .iter()
            .map(|arg| match label {
                Some(label) => arg.replace(SOURCE_PLACEHOLDER, label),
                None => arg.clone(),
            })
            .collect();
        debug!("Running {name} hook: {program} {}", args.join(" "));
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to run {name} hook `{program}`"))?;

        let timeout = self.config.hook_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let polled = child
                .try_wait()
                .with_context(|| format!("failed to wait for {name} hook `{program}`"))?;
            if let Some(status) = polled {
                if !status.success() {
                    bail!("{name} hook `{program}` exited with {status}");
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "{name} hook `{program}` still running after {}ms, killing it",
                    timeout.as_millis()
                );
                let _ = child.kill();
                let _ = child.wait();
                bail!("{name} hook `{program}` timed out");
            }
            thread::sleep(HOOK_POLL_INTERVAL);
        }
    }
}

impl DisplaySink for HookSink {
    fn show_blocking(&self, label: &str, _context: &str) -> Result<()> {
        self.run("show_blocking", &self.config.show_blocking, Some(label))
    }

    fn show_program(&self) -> Result<()> {
        self.run("show_program", &self.config.show_program, None)
    }

    fn mute(&self) -> Result<()> {
        self.run("mute", &self.config.mute, None)?;
        self.muted.store(MUTE_ON, Ordering::Release);
        Ok(())
    }

    fn unmute(&self) -> Result<()> {
        self.run("unmute", &self.config.unmute, None)?;
        self.muted.store(MUTE_OFF, Ordering::Release);
        Ok(())
    }

    fn is_muted(&self) -> Option<bool> {
        match self.muted.load(Ordering::Acquire) {
            MUTE_ON => Some(true),
            MUTE_OFF => Some(false),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn empty_hooks_succeed_and_track_mute() {
        let sink = HookSink::new(DisplayConfig::default());
        assert_eq!(sink.is_muted(), None);
        sink.mute().unwrap();
        assert_eq!(sink.is_muted(), Some(true));
        sink.unmute().unwrap();
        assert_eq!(sink.is_muted(), Some(false));
        sink.show_program().unwrap();
    }

    #[test]
    fn placeholder_is_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("label");
        let config = DisplayConfig {
            show_blocking: argv(&["sh", "-c", &format!("printf %s {{source}} > {}", out.display())]),
            ..DisplayConfig::default()
        };
        HookSink::new(config).show_blocking("PRIMARY", "").unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "PRIMARY");
    }

    #[test]
    fn hung_hook_is_killed_at_the_deadline() {
        let config = DisplayConfig {
            mute: argv(&["sleep", "5"]),
            hook_timeout_ms: 200,
            ..DisplayConfig::default()
        };
        let sink = HookSink::new(config);
        let started = Instant::now();
        let result = sink.mute();
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(sink.is_muted(), None);
    }

    #[test]
    fn failing_hook_keeps_previous_mute_state() {
        let config = DisplayConfig {
            mute: argv(&["false"]),
            ..DisplayConfig::default()
        };
        let sink = HookSink::new(config);
        assert!(sink.mute().is_err());
        assert_eq!(sink.is_muted(), None);
    }
}
