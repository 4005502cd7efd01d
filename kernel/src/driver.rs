// SPDX-License-Identifier: GPL-2.0

//! Driver framework
//!
//! Drivers are registered by name, independently of devices. A driver's
//! probe attaches it to a device of its class; remove detaches it.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::device::{Device, DeviceClass};
use crate::error::{Error, Result};

/// Probe/attach policy for a class of devices
pub trait Driver: Send + Sync {
	/// Driver name, unique in the registry
	fn name(&self) -> &str;

	/// Device class this driver serves
	fn class(&self) -> DeviceClass;

	/// Called when a device of the right class is bound
	fn probe(&self, device: &Arc<Device>) -> Result<()>;

	/// Called when the device is unbound
	fn remove(&self, device: &Arc<Device>) -> Result<()>;

	/// Power management, optional
	fn suspend(&self, _device: &Arc<Device>) -> Result<()> {
		Ok(())
	}

	/// Power management, optional
	fn resume(&self, _device: &Arc<Device>) -> Result<()> {
		Ok(())
	}
}

static DRIVERS: Lazy<SpinLock<BTreeMap<String, Arc<dyn Driver>>>> =
	Lazy::new(|| SpinLock::new(BTreeMap::new()));

/// Register a driver
pub fn register_driver(driver: Arc<dyn Driver>) -> Result<()> {
	let name = driver.name().to_string();
	if name.is_empty() {
		return Err(Error::InvalidParam);
	}
	let mut drivers = DRIVERS.lock();
	if drivers.contains_key(&name) {
		return Err(Error::Busy);
	}
	drivers.insert(name.clone(), driver);
	drop(drivers);
	crate::info!(target: "driver", "registered driver {}", name);
	Ok(())
}

/// Unregister a driver
pub fn unregister_driver(name: &str) -> Result<()> {
	let mut drivers = DRIVERS.lock();
	if drivers.remove(name).is_none() {
		return Err(Error::NotFound);
	}
	drop(drivers);
	crate::info!(target: "driver", "unregistered driver {}", name);
	Ok(())
}

/// Look a driver up by name
pub fn find_driver(name: &str) -> Result<Arc<dyn Driver>> {
	DRIVERS.lock().get(name).cloned().ok_or(Error::NotFound)
}

/// First registered driver serving the device's class
pub fn match_driver(device: &Device) -> Option<Arc<dyn Driver>> {
	DRIVERS
		.lock()
		.values()
		.find(|driver| driver.class() == device.class())
		.cloned()
}

/// Names of all registered drivers
pub fn list_drivers() -> Vec<String> {
	DRIVERS.lock().keys().cloned().collect()
}
