//! Kernel cmdline oracle.
//!
//! Every query re-reads the source so that the answer reflects the file at
//! the time of the call. A missing source reads as an empty cmdline and every
//! typed query falls back to its default.

use std::path::PathBuf;
use std::time::Duration;

use crate::paths::CMDLINE_PATH;

/// Default OEM mount timeout in seconds.
pub const DEFAULT_OEM_TIMEOUT: u64 = 5;

/// Default time to wait for a live sysroot, in seconds.
pub const DEFAULT_SYSROOT_WAIT: u64 = 60;

/// Default backing store for the writable overlays.
pub const DEFAULT_OVERLAY_BASE: &str = "tmpfs:20%";

const UKI_FLAG: &str = "rd.immucore.uki";
const DISABLE_FLAGS: &[&str] = &["rd.cos.disable", "rd.immucore.disable", "netboot"];
const LIVE_ROOT_PREFIXES: &[&str] = &["root=live:LABEL=", "root=live:CDLABEL="];
const DEBUG_RW_FLAGS: &[&str] = &["rd.cos.debugrw", "rd.immucore.debugrw"];

/// How the root filesystem is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootMode {
    /// Read-only (the default).
    ReadOnly,
    /// Read-write, for debugging.
    ReadWrite,
}

impl RootMode {
    /// Mount option for this mode.
    #[must_use]
    pub const fn as_option(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Inline(String),
}

/// Read-only view over the kernel cmdline.
#[derive(Debug, Clone)]
pub struct Cmdline {
    source: Source,
}

impl Default for Cmdline {
    fn default() -> Self {
        Self::from_path(CMDLINE_PATH.clone())
    }
}

impl Cmdline {
    /// Oracle over `/proc/cmdline` (or `HOST_PROC_CMDLINE`).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Oracle over an arbitrary file.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::File(path.into()),
        }
    }

    /// Oracle over a fixed string.
    #[must_use]
    pub fn from_string(contents: impl Into<String>) -> Self {
        Self {
            source: Source::Inline(contents.into()),
        }
    }

    /// Raw cmdline text, trimmed. Empty when the source is missing.
    #[must_use]
    pub fn read(&self) -> String {
        match &self.source {
            Source::Inline(contents) => contents.trim().to_string(),
            Source::File(path) => match std::fs::read_to_string(path) {
                Ok(contents) => contents.trim().to_string(),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Cmdline source unreadable");
                    String::new()
                }
            },
        }
    }

    /// Whitespace separated tokens of the cmdline.
    #[must_use]
    pub fn tokens(&self) -> Vec<String> {
        tokenize(&self.read())
    }

    /// All values of `flag`. A bare flag yields an empty value.
    #[must_use]
    pub fn values(&self, flag: &str) -> Vec<String> {
        self.tokens()
            .into_iter()
            .filter_map(|token| {
                if token == flag {
                    Some(String::new())
                } else {
                    token
                        .strip_prefix(flag)
                        .and_then(|rest| rest.strip_prefix('='))
                        .map(str::to_string)
                }
            })
            .collect()
    }

    /// Whether `flag` occurs, with or without a value.
    #[must_use]
    pub fn has(&self, flag: &str) -> bool {
        !self.values(flag).is_empty()
    }

    /// First non-empty value among `flags`, in precedence order.
    #[must_use]
    pub fn first_value(&self, flags: &[&str]) -> Option<String> {
        flags
            .iter()
            .flat_map(|flag| self.values(flag))
            .find(|value| !value.is_empty())
    }

    /// Booting a unified kernel image.
    #[must_use]
    pub fn is_uki(&self) -> bool {
        self.has(UKI_FLAG)
    }

    /// Immucore must not compose a root (live media, netboot, explicit opt-out).
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        let tokens = self.tokens();
        tokens.iter().any(|token| {
            DISABLE_FLAGS.contains(&token.as_str())
                || LIVE_ROOT_PREFIXES
                    .iter()
                    .any(|prefix| token.starts_with(prefix))
        })
    }

    /// Root mount mode.
    #[must_use]
    pub fn root_mode(&self) -> RootMode {
        if DEBUG_RW_FLAGS.iter().any(|flag| self.has(flag)) {
            RootMode::ReadWrite
        } else {
            RootMode::ReadOnly
        }
    }

    /// OEM label from the cmdline only; discovery is up to the caller.
    #[must_use]
    pub fn oem_label(&self) -> Option<String> {
        self.first_value(&["rd.immucore.oemlabel", "rd.cos.oemlabel"])
    }

    /// OEM mount timeout.
    #[must_use]
    pub fn oem_timeout(&self) -> Duration {
        let seconds = self
            .first_value(&["rd.immucore.oemtimeout", "rd.cos.oemtimeout"])
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_OEM_TIMEOUT);
        Duration::from_secs(seconds)
    }

    /// Overlay base specification (`tmpfs:<size>`, `LABEL=…`, `UUID=…`).
    #[must_use]
    pub fn overlay_base(&self) -> String {
        self.first_value(&["rd.immucore.overlay", "rd.cos.overlay"])
            .unwrap_or_else(|| DEFAULT_OVERLAY_BASE.to_string())
    }

    /// Image to loop-mount from the state partition.
    #[must_use]
    pub fn target_image(&self) -> Option<String> {
        self.first_value(&["cos-img/filename"])
    }

    /// Extra mounts as `(device-spec, mountpoint)` pairs.
    #[must_use]
    pub fn mounts(&self) -> Vec<(String, String)> {
        ["rd.cos.mount", "rd.immucore.mount"]
            .iter()
            .flat_map(|flag| self.values(flag))
            .filter_map(|value| {
                let (device, mountpoint) = value.rsplit_once(':')?;
                if device.is_empty() || mountpoint.is_empty() {
                    tracing::warn!(value = %value, "Ignoring malformed mount flag");
                    return None;
                }
                Some((device.to_string(), mountpoint.to_string()))
            })
            .collect()
    }

    /// How long a live boot waits for its sysroot.
    #[must_use]
    pub fn sysroot_wait(&self) -> Duration {
        let seconds = self
            .first_value(&["rd.immucore.sysrootwait"])
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SYSROOT_WAIT);
        Duration::from_secs(seconds)
    }

    /// Secure boot enforcement has been explicitly waived.
    #[must_use]
    pub fn secure_boot_waived(&self) -> bool {
        self.has("rd.immucore.securebootdisabled")
    }

    /// Debug logging requested.
    #[must_use]
    pub fn debug(&self) -> bool {
        self.has("rd.immucore.debug")
    }

    /// Extra cloud-config location handed to the stage runner.
    #[must_use]
    pub fn setup_uri(&self) -> Option<String> {
        self.first_value(&["cos.setup"])
    }
}

/// Split a cmdline into tokens. Double quotes group whitespace and are dropped.
#[must_use]
pub fn tokenize(cmdline: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;

    for c in cmdline.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        tokens.push(current);
    }

    tokens
}
