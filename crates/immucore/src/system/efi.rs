//! EFI variables exported by the firmware and systemd-boot.

use std::path::Path;

use immucore_common::BootPaths;

/// systemd helper measuring boot phases into the TPM.
pub const PCRPHASE: &str = "/usr/lib/systemd/systemd-pcrphase";

/// Length of the attribute header preceding every efivarfs payload.
const ATTRIBUTE_LEN: usize = 4;

/// Raw payload of an efivar, without the attribute header.
fn read_payload(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() > ATTRIBUTE_LEN => Some(bytes[ATTRIBUTE_LEN..].to_vec()),
        Ok(_) => None,
        Err(e) => {
            tracing::trace!(path = %path.display(), error = %e, "efivar unreadable");
            None
        }
    }
}

/// Decode a NUL-terminated UTF-16LE string payload.
fn decode_utf16(payload: &[u8]) -> String {
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// String variable published by systemd-boot.
#[must_use]
pub fn loader_string(paths: &BootPaths, name: &str) -> Option<String> {
    let value = decode_utf16(&read_payload(&paths.loader_var(name))?);
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Boot loader entry picked for this boot, e.g. `active.conf`.
#[must_use]
pub fn loader_entry_selected(paths: &BootPaths) -> Option<String> {
    loader_string(paths, "LoaderEntrySelected")
}

/// GPT partition UUID of the partition the loader was started from.
#[must_use]
pub fn loader_device_part_uuid(paths: &BootPaths) -> Option<String> {
    loader_string(paths, "LoaderDevicePartUUID").map(|uuid| uuid.to_lowercase())
}

/// Whether the firmware reports secure boot as on.
#[must_use]
pub fn secure_boot_enabled(paths: &BootPaths) -> bool {
    read_payload(&paths.secure_boot_var()).is_some_and(|payload| payload.last() == Some(&1))
}
