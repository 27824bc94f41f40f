//! Hot reload of the TCP/UDP idle timeout files
//!
//! The containing directory is watched rather than the files, since
//! editors and sysctl tooling may replace a file by rename. Values are
//! parsed best-effort: anything that is not a number reads as 0.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Externally managed timeouts applied live
//! - AU-12: Audit Record Generation - Every applied change is logged

use crate::error::{CtsyncError, Result};
use crate::nat::NatTimeoutStore;
use crate::types::{L4Protocol, TimeoutValue};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Directory holding the netfilter timeout files
pub const DEFAULT_TIMEOUT_DIR: &str = "/proc/sys/net/ipv4/netfilter";
/// TCP established idle timeout file
pub const DEFAULT_TCP_TIMEOUT_FILE: &str = "ip_conntrack_tcp_timeout_established";
/// UDP stream idle timeout file
pub const DEFAULT_UDP_TIMEOUT_FILE: &str = "ip_conntrack_udp_timeout_stream";

/// Parse a timeout the way `atoi` does.
///
/// Leading whitespace and an optional sign are accepted, parsing stops at
/// the first non-digit, and input without digits yields 0. Negative values
/// clamp to 0 and overly large values saturate. The input need not be
/// UTF-8.
pub fn parse_timeout(content: impl AsRef<[u8]>) -> u32 {
    let bytes = content.as_ref();
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r'))
        .unwrap_or(bytes.len());
    let trimmed = &bytes[start..];
    let (negative, digits) = match trimmed.first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let value = digits
        .iter()
        .take_while(|d| d.is_ascii_digit())
        .fold(0u32, |acc, d| {
            acc.saturating_mul(10).saturating_add(u32::from(d - b'0'))
        });

    if negative { 0 } else { value }
}

/// Watches the timeout files and pushes changes to the NAT store
pub struct TimeoutWatcher {
    dir: PathBuf,
    tcp_file: String,
    udp_file: String,
    store: Arc<dyn NatTimeoutStore>,
    poll_interval: Duration,
    last_pushed: HashMap<L4Protocol, u32>,
}

impl TimeoutWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        tcp_file: impl Into<String>,
        udp_file: impl Into<String>,
        store: Arc<dyn NatTimeoutStore>,
    ) -> Self {
        Self {
            dir: dir.into(),
            tcp_file: tcp_file.into(),
            udp_file: udp_file.into(),
            store,
            poll_interval: Duration::from_millis(200),
            last_pushed: HashMap::new(),
        }
    }

    /// How long to sleep between polls of an idle notification queue
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of a protocol's timeout file
    pub fn path(&self, protocol: L4Protocol) -> PathBuf {
        match protocol {
            L4Protocol::Tcp => self.dir.join(&self.tcp_file),
            L4Protocol::Udp => self.dir.join(&self.udp_file),
        }
    }

    /// Protocol whose timeout file has this name
    pub fn protocol_for(&self, name: &OsStr) -> Option<L4Protocol> {
        if name == OsStr::new(&self.tcp_file) {
            Some(L4Protocol::Tcp)
        } else if name == OsStr::new(&self.udp_file) {
            Some(L4Protocol::Udp)
        } else {
            None
        }
    }

    fn read_timeout(&self, protocol: L4Protocol) -> Result<u32> {
        let path = self.path(protocol);
        let content =
            std::fs::read(&path).map_err(|source| CtsyncError::ConfigRead { path, source })?;
        let first_line = content.split(|b| *b == b'\n').next().unwrap_or_default();
        Ok(parse_timeout(first_line))
    }

    fn push(&mut self, protocol: L4Protocol, seconds: u32) {
        self.store.set_timeout(TimeoutValue { protocol, seconds });
        self.last_pushed.insert(protocol, seconds);
    }

    /// Read both files once and push their values.
    ///
    /// An unreadable file is fatal to the watcher: no timeout can be assumed.
    pub fn load_initial(&mut self) -> Result<()> {
        for protocol in [L4Protocol::Tcp, L4Protocol::Udp] {
            let seconds = self.read_timeout(protocol)?;
            info!(%protocol, seconds, "Initial conntrack timeout");
            self.push(protocol, seconds);
        }
        Ok(())
    }

    /// React to a modified file in the watched directory.
    ///
    /// Returns whether a new value was pushed. Coalesced notifications that
    /// re-read an unchanged value push nothing.
    pub fn handle_change(&mut self, name: &OsStr) -> Result<bool> {
        let Some(protocol) = self.protocol_for(name) else {
            debug!(file = ?name, "Ignoring unrelated file");
            return Ok(false);
        };

        let seconds = self.read_timeout(protocol)?;
        if self.last_pushed.get(&protocol) == Some(&seconds) {
            debug!(%protocol, seconds, "Timeout unchanged");
            return Ok(false);
        }

        info!(%protocol, seconds, "Conntrack timeout changed");
        self.push(protocol, seconds);
        Ok(true)
    }

    fn resync(&mut self) {
        for name in [self.tcp_file.clone(), self.udp_file.clone()] {
            if let Err(e) = self.handle_change(OsStr::new(&name)) {
                warn!(error = %e, "Failed to re-read timeout file");
            }
        }
    }

    /// Subscribe to modifications in the timeout directory
    pub fn subscribe(&self) -> Result<DirectoryWatch> {
        DirectoryWatch::new(&self.dir)
    }

    /// Subscribe and process notifications until cancelled
    pub fn watch(&mut self, cancel: &CancellationToken) -> Result<()> {
        let subscription = self.subscribe()?;
        self.watch_with(subscription, cancel)
    }

    /// Process notifications from an existing subscription until cancelled.
    ///
    /// Only a failure of the notification subsystem ends the watch; an
    /// unreadable file is logged and skipped.
    pub fn watch_with(
        &mut self,
        subscription: DirectoryWatch,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(dir = %self.dir.display(), "Waiting for timeout notifications");

        while !cancel.is_cancelled() {
            match subscription.poll()? {
                DirectoryEvents::Files(names) => {
                    for name in names {
                        if let Err(e) = self.handle_change(&name) {
                            warn!(error = %e, "Failed to apply timeout change");
                        }
                    }
                }
                DirectoryEvents::Overflow => {
                    warn!("Notification queue overflow, re-reading timeout files");
                    self.resync();
                }
                DirectoryEvents::Idle => std::thread::sleep(self.poll_interval),
            }
        }

        debug!("Timeout watch cancelled");
        Ok(())
    }

    /// Load initial values and watch on a dedicated thread.
    ///
    /// A watcher that stops on an error cancels `cancel`, so the rest of
    /// the daemon winds down with it.
    pub fn spawn(mut self, cancel: CancellationToken) -> std::io::Result<JoinHandle<Result<()>>> {
        std::thread::Builder::new()
            .name("ctsyncd-timeout".to_string())
            .spawn(move || {
                let result = self.load_initial().and_then(|()| self.watch(&cancel));
                if let Err(e) = &result {
                    error!(dir = %self.dir.display(), error = %e, "Timeout watcher stopped");
                    cancel.cancel();
                }
                result
            })
    }
}

/// Outcome of one poll of the directory subscription
#[derive(Debug)]
pub enum DirectoryEvents {
    /// Regular files whose modification completed
    Files(Vec<std::ffi::OsString>),
    /// Events were lost, state must be re-read
    Overflow,
    /// Nothing pending
    Idle,
}

#[cfg(target_os = "linux")]
mod linux {
    use super::DirectoryEvents;
    use crate::error::{CtsyncError, Result};
    use nix::errno::Errno;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
    use std::path::Path;
    use tracing::{debug, trace};

    /// inotify subscription on a directory
    pub struct DirectoryWatch {
        inotify: Inotify,
        wd: WatchDescriptor,
    }

    impl DirectoryWatch {
        pub(crate) fn new(dir: &Path) -> Result<Self> {
            let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
                .map_err(|e| CtsyncError::Watch(format!("inotify_init failed: {}", e)))?;

            let mask = AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO;
            let wd = inotify.add_watch(dir, mask).map_err(|e| {
                CtsyncError::Watch(format!("Failed to watch {}: {}", dir.display(), e))
            })?;

            debug!(dir = %dir.display(), mask = mask.bits(), "Watching timeout directory");
            Ok(Self { inotify, wd })
        }

        pub(crate) fn poll(&self) -> Result<DirectoryEvents> {
            let events = match self.inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(DirectoryEvents::Idle),
                Err(e) => {
                    return Err(CtsyncError::Watch(format!("inotify read failed: {}", e)));
                }
            };

            if events
                .iter()
                .any(|ev| ev.mask.contains(AddWatchFlags::IN_Q_OVERFLOW))
            {
                return Ok(DirectoryEvents::Overflow);
            }

            let names = events
                .into_iter()
                .filter(|ev| !ev.mask.contains(AddWatchFlags::IN_ISDIR))
                .filter_map(|ev| {
                    trace!(name = ?ev.name, mask = ev.mask.bits(), "inotify event");
                    ev.name
                })
                .collect();
            Ok(DirectoryEvents::Files(names))
        }
    }

    impl Drop for DirectoryWatch {
        fn drop(&mut self) {
            let _ = self.inotify.rm_watch(self.wd);
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::DirectoryWatch;

#[cfg(not(target_os = "linux"))]
mod mock {
    use super::DirectoryEvents;
    use crate::error::{CtsyncError, Result};
    use std::path::Path;

    pub struct DirectoryWatch;

    impl DirectoryWatch {
        pub(crate) fn new(dir: &Path) -> Result<Self> {
            Err(CtsyncError::Watch(format!(
                "file notifications unsupported on this platform ({})",
                dir.display()
            )))
        }

        pub(crate) fn poll(&self) -> Result<DirectoryEvents> {
            Ok(DirectoryEvents::Idle)
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::DirectoryWatch;
