//! Collaborators outside the process: firmware, block devices, udev,
//! encryption and the stage runner.

pub mod blockdev;
pub mod crypt;
pub mod efi;
pub mod stages;
pub mod udev;
