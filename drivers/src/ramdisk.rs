// SPDX-License-Identifier: GPL-2.0

//! RAM-disk block device driver

use kos_kernel::blockdev;
use kos_kernel::device::{Device, DeviceClass, DeviceFlags};
use kos_kernel::driver::{self, Driver};
use kos_kernel::error::{Error, Result};
use kos_kernel::sync::Arc;

/// Default ram-disk geometry
pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const DEFAULT_SIZE: u64 = 4 * 1024 * 1024;

/// Probe/attach policy for ram-disk devices
pub struct RamdiskDriver;

impl Driver for RamdiskDriver {
	fn name(&self) -> &str {
		"ramdisk"
	}

	fn class(&self) -> DeviceClass {
		DeviceClass::Block
	}

	fn probe(&self, device: &Arc<Device>) -> Result<()> {
		log::info!(target: "ramdisk", "probed {}", device.name());
		Ok(())
	}

	fn remove(&self, device: &Arc<Device>) -> Result<()> {
		device.flush()
	}
}

/// Register the driver
pub fn register() -> Result<()> {
	driver::register_driver(Arc::new(RamdiskDriver))
}

/// Create a ram-disk of `size` bytes with `block_size`-byte blocks
pub fn create(name: &str, size: u64, block_size: usize) -> Result<Arc<Device>> {
	if block_size == 0 || size == 0 || size % block_size as u64 != 0 {
		return Err(Error::InvalidParam);
	}
	let device = blockdev::create(
		name,
		block_size,
		size / block_size as u64,
		DeviceFlags::RDWR,
	)?;
	if let Some(driver) = driver::match_driver(&device) {
		driver.probe(&device)?;
	}
	Ok(device)
}
