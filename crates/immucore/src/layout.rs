//! Reading the rootfs layout from `cos-layout.env`.

use std::collections::BTreeMap;
use std::io;

use immucore_common::ImmucoreResult;

use crate::context::BootContext;
use crate::state::{DEFAULT_RW_PATHS, DEFAULT_STATE_DIR, Layout};

/// Layout file below the staging root.
pub const LAYOUT_FILE: &str = "/run/cos/cos-layout.env";

/// Parse shell-style `KEY="value"` lines.
///
/// Comments, blank lines and an `export ` prefix are accepted. Matching
/// single or double quotes around the value are dropped.
#[must_use]
pub fn parse_env(contents: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            tracing::warn!(%line, "Ignoring malformed layout line");
            continue;
        };
        vars.insert(key.trim().to_string(), unquote(value.trim()).to_string());
    }
    vars
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Whitespace separated list with duplicates and empties removed, order kept.
fn list(value: Option<&String>) -> Vec<String> {
    let mut seen = Vec::new();
    for item in value.map(String::as_str).unwrap_or_default().split_whitespace() {
        if !seen.iter().any(|s| s == item) {
            seen.push(item.to_string());
        }
    }
    seen
}

/// Build the layout from the layout file and the cmdline.
///
/// A missing file yields the defaults.
pub fn load(ctx: &BootContext) -> ImmucoreResult<Layout> {
    let path = ctx.in_root(LAYOUT_FILE);
    let vars = match std::fs::read_to_string(&path) {
        Ok(contents) => parse_env(&contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No layout file, using defaults");
            BTreeMap::new()
        }
        Err(e) => return Err(e.into()),
    };
    Ok(build(ctx, &vars))
}

/// Layout for already parsed variables.
#[must_use]
pub fn build(ctx: &BootContext, vars: &BTreeMap<String, String>) -> Layout {
    let mut overlay_dirs = list(vars.get("RW_PATHS"));
    if overlay_dirs.is_empty() {
        overlay_dirs = DEFAULT_RW_PATHS.iter().map(ToString::to_string).collect();
    }

    let mut bind_mounts = list(vars.get("PERSISTENT_STATE_PATHS"));
    for path in list(vars.get("CUSTOM_BIND_MOUNTS")) {
        if !bind_mounts.contains(&path) {
            bind_mounts.push(path);
        }
    }

    let overlay_base_spec = vars
        .get("OVERLAY")
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| ctx.cmdline.overlay_base());

    let state_dir = vars
        .get("PERSISTENT_STATE_TARGET")
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string());

    let mut custom_mounts = BTreeMap::new();
    let volumes = list(vars.get("VOLUMES")).into_iter().filter_map(|volume| {
        match volume.rsplit_once(':') {
            Some((device, mountpoint)) if !device.is_empty() && !mountpoint.is_empty() => {
                Some((device.to_string(), mountpoint.to_string()))
            }
            _ => {
                tracing::warn!(%volume, "Ignoring malformed volume");
                None
            }
        }
    });
    for (device, mountpoint) in volumes.chain(ctx.cmdline.mounts()) {
        custom_mounts.insert(ctx.resolve_spec(&device), mountpoint);
    }

    let layout = Layout {
        overlay_dirs,
        bind_mounts,
        custom_mounts,
        overlay_base_spec,
        state_dir,
    };
    tracing::debug!(?layout, "Layout loaded");
    layout
}
