//! Encryption and volume management steps.

use std::sync::Arc;

use immucore_common::ImmucoreResult;

use crate::context::BootContext;
use crate::system::{crypt, udev};

/// Unlock encrypted partitions with the helper from the rootfs.
pub async fn kcrypt_unlock(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    crypt::unlock_all(&ctx, false).await
}

/// Unlock encrypted partitions through the TPM on an installed UKI boot.
pub async fn uki_unlock(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    crypt::unlock_all(&ctx, true).await
}

/// Migrate legacy persistent LUKS headers. Failures are tolerated.
pub async fn kcrypt_upgrade(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    if let Err(e) = crypt::upgrade_persistent(&ctx).await {
        tracing::warn!(error = %e, "Persistent LUKS upgrade failed, continuing");
    }
    Ok(())
}

/// Activate LVM volume groups. Failures are tolerated.
pub async fn lvm_activate(ctx: Arc<BootContext>) -> ImmucoreResult<()> {
    if let Err(e) = udev::activate_lvm(&ctx).await {
        tracing::warn!(error = %e, "LVM activation failed, continuing");
    }
    Ok(())
}
