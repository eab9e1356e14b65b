//! Block device discovery.

use std::path::{Path, PathBuf};

use immucore_common::{BootPaths, ImmucoreError, ImmucoreResult};
use serde::Deserialize;

use crate::context::BootContext;
use crate::host::CommandSpec;
use crate::system::efi;

/// GPT partition type of an EFI system partition.
pub const ESP_PARTTYPE: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

/// Partition label of the OEM partition.
pub const OEM_PARTLABEL: &str = "oem";

const LSBLK_COLUMNS: &str = "NAME,LABEL,PARTLABEL,PARTTYPE,FSTYPE,UUID,MOUNTPOINT";

/// One device as reported by `lsblk -J`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BlockDevice {
    /// Kernel name, e.g. `vda2`.
    pub name: String,
    /// Filesystem label.
    #[serde(default)]
    pub label: Option<String>,
    /// GPT partition label.
    #[serde(default)]
    pub partlabel: Option<String>,
    /// GPT partition type.
    #[serde(default)]
    pub parttype: Option<String>,
    /// Filesystem type.
    #[serde(default)]
    pub fstype: Option<String>,
    /// Filesystem UUID.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Where the device is mounted, if anywhere.
    #[serde(default)]
    pub mountpoint: Option<String>,
    /// Partitions and holders.
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Device node on this host.
    #[must_use]
    pub fn path(&self, paths: &BootPaths) -> PathBuf {
        paths.host("/dev").join(&self.name)
    }

    /// Whether the device carries a mount.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mountpoint.as_deref().is_some_and(|m| !m.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    blockdevices: Vec<BlockDevice>,
}

/// Parse `lsblk -J` output into a flat list, parents before children.
pub fn parse_lsblk(json: &str) -> ImmucoreResult<Vec<BlockDevice>> {
    let listing: Listing = serde_json::from_str(json)?;
    let mut flat = Vec::new();
    let mut pending: Vec<BlockDevice> = listing.blockdevices.into_iter().rev().collect();
    while let Some(mut device) = pending.pop() {
        let children = std::mem::take(&mut device.children);
        pending.extend(children.into_iter().rev());
        flat.push(device);
    }
    Ok(flat)
}

/// Every block device on the host.
pub async fn list(ctx: &BootContext) -> ImmucoreResult<Vec<BlockDevice>> {
    let lsblk = CommandSpec::new("lsblk").args(["-J", "-o", LSBLK_COLUMNS]);
    let output = ctx.host.run_checked(&lsblk).await?;
    parse_lsblk(&output.stdout)
}

/// Filesystem label of the partition named `oem`, if any.
pub async fn discover_oem_label(ctx: &BootContext) -> Option<String> {
    let devices = match list(ctx).await {
        Ok(devices) => devices,
        Err(e) => {
            tracing::debug!(error = %e, "Could not list block devices");
            return None;
        }
    };
    devices
        .into_iter()
        .find(|d| d.partlabel.as_deref() == Some(OEM_PARTLABEL))
        .and_then(|d| d.label)
        .filter(|label| !label.is_empty())
}

/// OEM label from the cmdline, falling back to discovery.
pub async fn oem_label(ctx: &BootContext) -> Option<String> {
    match ctx.cmdline.oem_label() {
        Some(label) => Some(label),
        None => discover_oem_label(ctx).await,
    }
}

/// The EFI system partition.
pub async fn find_esp(ctx: &BootContext) -> ImmucoreResult<BlockDevice> {
    list(ctx)
        .await?
        .into_iter()
        .find(|d| d.parttype.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(ESP_PARTTYPE)))
        .ok_or_else(|| ImmucoreError::config("no EFI system partition found"))
}

/// Attach `file` to the first free loop device and return the device path.
pub async fn losetup(ctx: &BootContext, file: &Path) -> ImmucoreResult<String> {
    let cmd = CommandSpec::new("losetup").args(["--show", "-f"]).arg(file.display().to_string());
    let output = ctx.host.run_checked(&cmd).await?;
    let device = output.stdout.trim().to_string();
    tracing::debug!(file = %file.display(), %device, "Attached loop device");
    Ok(device)
}

/// Whether this boot came from install media rather than the installed disk.
#[must_use]
pub fn is_removable_boot(ctx: &BootContext) -> bool {
    if ctx.cmdline.has("install-mode") {
        return true;
    }
    let Some(uuid) = efi::loader_device_part_uuid(&ctx.paths) else {
        return false;
    };
    let link = ctx.paths.dev_disk().join("by-partuuid").join(&uuid);
    let Some(partition) = device_name(&link) else {
        tracing::debug!(%uuid, "Boot partition not found");
        return false;
    };
    let disk = parent_disk(&ctx.paths, &partition).unwrap_or(partition);
    let removable = is_removable_disk(&ctx.paths, &disk);
    tracing::debug!(%disk, removable, "Boot device");
    removable
}

/// Kernel name behind a `/dev/disk/by-*` entry.
fn device_name(link: &Path) -> Option<String> {
    let resolved = match std::fs::read_link(link) {
        Ok(target) => target,
        Err(_) if link.exists() => link.to_path_buf(),
        Err(_) => return None,
    };
    Some(resolved.file_name()?.to_str()?.to_string())
}

/// Whole disk holding `partition`, if it is a partition.
fn parent_disk(paths: &BootPaths, partition: &str) -> Option<String> {
    let entry = paths.sys_class_block().join(partition);
    if !entry.join("partition").exists() {
        return None;
    }
    let target = std::fs::read_link(&entry).ok()?;
    Some(target.parent()?.file_name()?.to_str()?.to_string())
}

fn is_removable_disk(paths: &BootPaths, disk: &str) -> bool {
    if disk.starts_with("sr") {
        return true;
    }
    std::fs::read_to_string(paths.sys_class_block().join(disk).join("removable"))
        .is_ok_and(|value| value.trim() == "1")
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;
    use std::sync::Arc;

    use immucore_common::Cmdline;
    use tempfile::tempdir;

    use super::*;
    use crate::host::CommandOutput;
    use crate::host::fake::RecordingHost;
    use crate::system::efi::testing::write_loader_string;

    const LSBLK: &str = r#"{
        "blockdevices": [
            {"name": "vda", "label": null, "partlabel": null, "parttype": null,
             "fstype": null, "uuid": null, "mountpoint": null,
             "children": [
                {"name": "vda1", "label": "COS_GRUB", "partlabel": "efi",
                 "parttype": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "fstype": "vfat",
                 "uuid": "AB12", "mountpoint": null},
                {"name": "vda2", "label": "COS_OEM", "partlabel": "oem",
                 "parttype": "0fc63daf-8483-4772-8e79-3d69d8477de4", "fstype": "ext4",
                 "uuid": "1111", "mountpoint": "/oem"}
             ]},
            {"name": "loop0", "fstype": "ext4", "label": "COS_ACTIVE"}
        ]
    }"#;

    /// Scratch `/sys/class/block` with `disk` holding `partition`.
    fn sysfs_disk(paths: &BootPaths, disk: &str, partition: &str, removable: &str) {
        let devices = paths.host("/sys/devices/pci0000:00/block").join(disk);
        std::fs::create_dir_all(devices.join(partition)).unwrap();
        std::fs::write(devices.join(partition).join("partition"), "1").unwrap();
        std::fs::write(devices.join("removable"), removable).unwrap();
        std::fs::create_dir_all(paths.sys_class_block()).unwrap();
        symlink(&devices, paths.sys_class_block().join(disk)).unwrap();
        symlink(devices.join(partition), paths.sys_class_block().join(partition)).unwrap();

        let by_partuuid = paths.dev_disk().join("by-partuuid");
        std::fs::create_dir_all(&by_partuuid).unwrap();
        symlink(format!("../../{partition}"), by_partuuid.join("aaaa-bbbb")).unwrap();
        write_loader_string(paths, "LoaderDevicePartUUID", "AAAA-BBBB");
    }

    fn context(root: &Path, cmdline: &str, host: &Arc<RecordingHost>) -> BootContext {
        BootContext::new(
            Cmdline::from_string(cmdline),
            BootPaths::with_root(root),
            host.clone(),
        )
        .unwrap()
    }

    #[test]
    fn lsblk_is_flattened() {
        let devices = parse_lsblk(LSBLK).unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["vda", "vda1", "vda2", "loop0"]);
        assert!(devices[2].is_mounted());
        assert!(!devices[1].is_mounted());
    }

    #[test]
    fn bad_lsblk_is_a_serialization_error() {
        let err = parse_lsblk("{not json").unwrap_err();
        assert!(matches!(err, ImmucoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn oem_label_prefers_cmdline() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        host.respond("lsblk", CommandOutput::ok(LSBLK));

        let ctx = context(temp.path(), "rd.immucore.uki rd.cos.oemlabel=MY_OEM", &host);
        assert_eq!(oem_label(&ctx).await.as_deref(), Some("MY_OEM"));
        assert!(!host.ran("lsblk"));

        let ctx = context(temp.path(), "rd.immucore.uki", &host);
        assert_eq!(oem_label(&ctx).await.as_deref(), Some("COS_OEM"));
    }

    #[tokio::test]
    async fn esp_is_matched_case_insensitively() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        host.respond("lsblk", CommandOutput::ok(LSBLK));
        let ctx = context(temp.path(), "rd.immucore.uki", &host);

        let esp = find_esp(&ctx).await.unwrap();
        assert_eq!(esp.name, "vda1");
        assert_eq!(esp.path(&ctx.paths), temp.path().join("dev/vda1"));
    }

    #[tokio::test]
    async fn losetup_returns_device() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        host.respond("losetup", CommandOutput::ok("/dev/loop3\n"));
        let ctx = context(temp.path(), "rd.immucore.uki", &host);

        let device = losetup(&ctx, Path::new("/run/initramfs/cos-state/cOS/active.img"))
            .await
            .unwrap();
        assert_eq!(device, "/dev/loop3");
        assert!(host.ran("losetup --show -f /run/initramfs/cos-state/cOS/active.img"));
    }

    #[test]
    fn removable_boot_follows_loader_partition() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "rd.immucore.uki", &host);
        sysfs_disk(&ctx.paths, "sdb", "sdb1", "1\n");
        assert!(is_removable_boot(&ctx));
    }

    #[test]
    fn fixed_disk_is_not_removable() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "rd.immucore.uki", &host);
        sysfs_disk(&ctx.paths, "nvme0n1", "nvme0n1p1", "0\n");
        assert!(!is_removable_boot(&ctx));

        let ctx = context(temp.path(), "rd.immucore.uki install-mode", &host);
        assert!(is_removable_boot(&ctx));
    }

    #[test]
    fn no_loader_variable_means_installed() {
        let temp = tempdir().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = context(temp.path(), "rd.immucore.uki", &host);
        assert!(!is_removable_boot(&ctx));
    }
}
