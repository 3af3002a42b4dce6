//! Unified memory and swap usage
//!
//! powermetrics reports no memory figures, so they are read separately: `sysctl` for the
//! RAM size and swap usage, `vm_stat` for available pages. [`MemoryPoller`] refreshes them
//! on its own thread so the ingest path never waits on those commands.

use crate::error::{Error, Result};
use crate::view::ViewPublisher;
use serde::Serialize;
use std::process::Command;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Swap below this size is shown as inactive
const SWAP_ACTIVE_MIN_BYTES: u64 = 100 * 1024 * 1024;

/// RAM information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RamInfo {
    /// Total RAM in bytes
    pub total: u64,
    /// RAM not available for reuse, in bytes
    pub used: u64,
}

/// Swap information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwapInfo {
    /// Total swap in bytes
    pub total: u64,
    /// Used swap in bytes
    pub used: u64,
}

/// Memory statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub ram: RamInfo,
    pub swap: SwapInfo,
}

impl MemoryInfo {
    /// Current figures from the OS
    #[cfg(target_os = "macos")]
    pub fn read() -> Result<Self> {
        let total = command_output("sysctl", &["-n", "hw.memsize"])?
            .trim()
            .parse::<u64>()
            .map_err(|e| Error::Parse(format!("hw.memsize: {}", e)))?;
        let available = parse_vm_stat(&command_output("vm_stat", &[])?)
            .ok_or_else(|| Error::Parse("vm_stat output has no page counts".into()))?;
        let swap = parse_swap_usage(&command_output("sysctl", &["-n", "vm.swapusage"])?)
            .ok_or_else(|| Error::Parse("unrecognised vm.swapusage".into()))?;

        Ok(Self {
            ram: RamInfo {
                total,
                used: total.saturating_sub(available),
            },
            swap,
        })
    }

    #[cfg(not(target_os = "macos"))]
    pub fn read() -> Result<Self> {
        Err(Error::UnsupportedPlatform(
            "memory figures are read with sysctl/vm_stat on macOS".into(),
        ))
    }

    /// Get RAM usage percentage
    pub fn ram_usage_percent(&self) -> f64 {
        percent(self.ram.used, self.ram.total)
    }

    /// Get swap usage percentage
    pub fn swap_usage_percent(&self) -> f64 {
        percent(self.swap.used, self.swap.total)
    }

    pub fn swap_active(&self) -> bool {
        self.swap.total >= SWAP_ACTIVE_MIN_BYTES
    }
}

/// Bytes as GiB
pub fn gib(bytes: u64) -> f64 {
    bytes as f64 / GIB
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn command_output(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Spawn {
            program: program.into(),
            source: e,
        })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Available bytes (free + inactive pages) from `vm_stat` output
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_vm_stat(text: &str) -> Option<u64> {
    let page_size: u64 = text
        .lines()
        .next()?
        .split("page size of ")
        .nth(1)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;

    let pages = |key: &str| -> Option<u64> {
        text.lines()
            .find_map(|line| line.strip_prefix(key))
            .and_then(|rest| rest.trim().trim_end_matches('.').parse().ok())
    };
    let free = pages("Pages free:")?;
    let inactive = pages("Pages inactive:")?;
    Some((free + inactive) * page_size)
}

/// `total = 2048.00M  used = 1024.50M  free = 1023.50M  (encrypted)`
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_swap_usage(text: &str) -> Option<SwapInfo> {
    let value = |key: &str| -> Option<u64> {
        let mut words = text.split_whitespace();
        words.find(|w| *w == key)?;
        if words.next()? != "=" {
            return None;
        }
        parse_size(words.next()?)
    };
    Some(SwapInfo {
        total: value("total")?,
        used: value("used")?,
    })
}

fn parse_size(text: &str) -> Option<u64> {
    let (number, scale) = match text.chars().last()? {
        'K' => (&text[..text.len() - 1], 1024.0),
        'M' => (&text[..text.len() - 1], 1024.0 * 1024.0),
        'G' => (&text[..text.len() - 1], GIB),
        _ => (text, 1.0),
    };
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * scale).round() as u64)
}

/// Background refresh of `View::memory`
pub struct MemoryPoller {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MemoryPoller {
    /// Poll with [`MemoryInfo::read`] every `interval`
    pub fn start(publisher: ViewPublisher, interval: Duration) -> Result<Self> {
        Self::with_source(publisher, interval, MemoryInfo::read)
    }

    /// Poll with a custom reading function
    ///
    /// A fatal error (no support on this platform) ends polling; anything else is logged
    /// and retried on the next tick.
    pub fn with_source<F>(publisher: ViewPublisher, interval: Duration, mut read: F) -> Result<Self>
    where
        F: FnMut() -> Result<MemoryInfo> + Send + 'static,
    {
        let (stop, stop_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("asmon-memory".into())
            .spawn(move || loop {
                match read() {
                    Ok(info) => publisher.update(|view| view.memory = Some(info)),
                    Err(e) if e.is_fatal() => {
                        log::debug!("Memory figures unavailable: {}", e);
                        return;
                    }
                    Err(e) => log::warn!("Failed to read memory figures: {}", e),
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.stop.send(());
        thread
            .join()
            .map_err(|_| Error::Supervisor("memory thread panicked".into()))
    }
}

impl Drop for MemoryPoller {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Memory poller shutdown failed: {}", e);
        }
    }
}
