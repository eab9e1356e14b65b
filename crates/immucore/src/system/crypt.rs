//! Encrypted partition handling.

use immucore_common::{ImmucoreError, ImmucoreResult};
use uuid::Uuid;

use crate::context::BootContext;
use crate::host::CommandSpec;
use crate::system::blockdev;

/// Label of the persistent partition.
pub const PERSISTENT_LABEL: &str = "COS_PERSISTENT";

/// LUKS header label of encrypted persistent partitions.
const LUKS_PERSISTENT_LABEL: &str = "persistent";

/// Stable LUKS UUID every encrypted persistent partition is expected to carry.
#[must_use]
pub fn persistent_uuid() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, PERSISTENT_LABEL.as_bytes())
}

/// Unlock every encrypted partition, optionally through the TPM.
///
/// The helper shipped inside the mounted rootfs is preferred over the one
/// in the initramfs.
pub async fn unlock_all(ctx: &BootContext, tpm: bool) -> ImmucoreResult<()> {
    let bundled = ctx.in_root("/usr/bin/kcrypt");
    let program = if bundled.is_file() {
        bundled.display().to_string()
    } else {
        "kcrypt".to_string()
    };

    let mut cmd = CommandSpec::new(program).arg("unlock-all");
    if tpm {
        cmd = cmd.arg("--tpm");
    }
    tracing::info!(%cmd, "Unlocking encrypted partitions");
    ctx.host.run_checked(&cmd).await?;
    Ok(())
}

/// Rewrite the LUKS UUID of persistent partitions created before the UUID
/// was made deterministic.
pub async fn upgrade_persistent(ctx: &BootContext) -> ImmucoreResult<()> {
    let expected = persistent_uuid().to_string();
    let mut errors = Vec::new();

    for device in blockdev::list(ctx).await? {
        let is_luks = device.fstype.as_deref() == Some("crypto_LUKS");
        let is_persistent = device.label.as_deref() == Some(LUKS_PERSISTENT_LABEL)
            || device.partlabel.as_deref() == Some(LUKS_PERSISTENT_LABEL);
        if !is_luks || !is_persistent {
            continue;
        }
        if device.uuid.as_deref() == Some(expected.as_str()) {
            tracing::debug!(device = %device.name, "Persistent LUKS UUID up to date");
            continue;
        }

        let path = device.path(&ctx.paths).display().to_string();
        tracing::info!(device = %path, uuid = %expected, "Upgrading persistent LUKS UUID");
        let cmd = CommandSpec::new("cryptsetup")
            .args(["luksUUID", "-q"])
            .arg(format!("--uuid={expected}"))
            .arg(path);
        if let Err(e) = ctx.host.run_checked(&cmd).await {
            errors.push(e);
        }
    }

    ImmucoreError::collect(errors)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use immucore_common::{BootPaths, Cmdline};
    use tempfile::tempdir;

    use super::*;
    use crate::host::CommandOutput;
    use crate::host::fake::RecordingHost;

    fn context(root: &Path, host: &Arc<RecordingHost>) -> BootContext {
        BootContext::new(
            Cmdline::from_string("cos-img/filename=/cOS/active.img"),
            BootPaths::with_root(root),
            host.clone(),
        )
        .unwrap()
    }

    #[test]
    fn persistent_uuid_is_stable() {
        assert_eq!(persistent_uuid(), persistent_uuid());
        assert_eq!(persistent_uuid().get_version_num(), 5);
    }

    #[tokio::test]
    async fn unlock_prefers_bundled_helper() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), &host);

        unlock_all(&ctx, false).await.unwrap();
        assert_eq!(host.commands(), ["kcrypt unlock-all"]);

        let bundled = ctx.in_root("/usr/bin/kcrypt");
        std::fs::create_dir_all(bundled.parent().unwrap()).unwrap();
        std::fs::write(&bundled, "").unwrap();
        unlock_all(&ctx, true).await.unwrap();
        assert_eq!(
            host.commands()[1],
            format!("{} unlock-all --tpm", bundled.display())
        );
    }

    #[tokio::test]
    async fn upgrade_rewrites_only_stale_headers() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let expected = persistent_uuid();
        host.respond(
            "lsblk",
            CommandOutput::ok(format!(
                r#"{{"blockdevices": [
                    {{"name": "vda4", "label": "persistent", "fstype": "crypto_LUKS", "uuid": "old"}},
                    {{"name": "vda5", "label": "persistent", "fstype": "crypto_LUKS", "uuid": "{expected}"}},
                    {{"name": "vda6", "label": "COS_OEM", "fstype": "crypto_LUKS", "uuid": "x"}},
                    {{"name": "vda7", "label": "persistent", "fstype": "ext4", "uuid": "y"}}
                ]}}"#
            )),
        );
        let ctx = context(temp.path(), &host);

        upgrade_persistent(&ctx).await.unwrap();

        let upgrades: Vec<_> = host
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("cryptsetup"))
            .collect();
        assert_eq!(
            upgrades,
            [format!(
                "cryptsetup luksUUID -q --uuid={expected} {}",
                temp.path().join("dev/vda4").display()
            )]
        );
    }
}
