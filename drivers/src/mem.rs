// SPDX-License-Identifier: GPL-2.0

//! Null and zero character devices

use kos_kernel::device::{
	self, Device, DeviceClass, DeviceFlags, DeviceOps, DeviceState,
};
use kos_kernel::error::Result;
use kos_kernel::sync::Arc;
use kos_kernel::types::DeviceNumber;

/// Major number shared by the memory devices
pub const MEM_MAJOR: u32 = 1;

/// Minor numbers
pub const NULL_MINOR: u32 = 3;
pub const ZERO_MINOR: u32 = 5;

fn null_read(_dev: &Device, _buf: &mut [u8], _offset: u64) -> Result<usize> {
	// Always at EOF.
	Ok(0)
}

fn null_write(_dev: &Device, buf: &[u8], _offset: u64) -> Result<usize> {
	// Discards everything.
	Ok(buf.len())
}

fn zero_read(_dev: &Device, buf: &mut [u8], _offset: u64) -> Result<usize> {
	buf.fill(0);
	Ok(buf.len())
}

const NULL_OPS: DeviceOps = DeviceOps {
	read: Some(null_read),
	write: Some(null_write),
	ioctl: None,
	flush: None,
};

const ZERO_OPS: DeviceOps = DeviceOps {
	read: Some(zero_read),
	write: Some(null_write),
	ioctl: None,
	flush: None,
};

/// Register `null` and `zero`
pub fn register_devices() -> Result<(Arc<Device>, Arc<Device>)> {
	let null = device::register_device(Device::new(
		"null",
		DeviceClass::Char,
		DeviceNumber::new(MEM_MAJOR, NULL_MINOR),
		DeviceFlags::RDWR,
		NULL_OPS,
		DeviceState::Plain,
	))?;
	let zero = device::register_device(Device::new(
		"zero",
		DeviceClass::Char,
		DeviceNumber::new(MEM_MAJOR, ZERO_MINOR),
		DeviceFlags::RDWR,
		ZERO_OPS,
		DeviceState::Plain,
	))?;
	log::info!(target: "mem", "memory devices registered");
	Ok((null, zero))
}

/// Unregister the memory devices
pub fn unregister_devices() -> Result<()> {
	device::unregister_device("null")?;
	device::unregister_device("zero")?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use kos_kernel::error::Error;

	#[test]
	fn null_discards_and_zero_fills() {
		let (null, zero) = register_devices().unwrap();
		assert_eq!(null.write(b"ignored", 0).unwrap(), 7);
		let mut buf = [0xAAu8; 8];
		assert_eq!(null.read(&mut buf, 0).unwrap(), 0);
		assert_eq!(buf[0], 0xAA);

		assert_eq!(zero.read(&mut buf, 0).unwrap(), 8);
		assert!(buf.iter().all(|&b| b == 0));

		// Partial vtable: no ioctl surface.
		assert_eq!(
			null.ioctl(device::ioctl::GET_INFO, 0),
			Err(Error::NotSupported)
		);

		let by_number = device::find_by_number(MEM_MAJOR, ZERO_MINOR).unwrap();
		assert_eq!(by_number.name(), "zero");
		device::put(&by_number).unwrap();
		unregister_devices().unwrap();
	}
}
