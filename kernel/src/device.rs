// SPDX-License-Identifier: GPL-2.0

//! Device registry
//!
//! Named device records with reference counts. The registry owns every
//! record; callers hold transient references obtained via `find`, balanced
//! by `put`. Unregistration removes the device from the tables, then waits
//! for outstanding references to drain before implicit resources (IRQ
//! binding, DMA chain) are released.
//!
//! Lock order: registry < device < class substate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;
use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};
use crate::irq::{self, IrqFlags, IrqHandlerFn};
use crate::sync::WaitQueue;
use crate::types::DeviceNumber;
use crate::{blockdev, chardev, netdev, tty};

/// First dynamically assigned major number
const DYNAMIC_MAJOR_BASE: u32 = 240;

bitflags! {
	/// Device flag bits
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct DeviceFlags: u32 {
		const READONLY = 0x01;
		const WRITEONLY = 0x02;
		const NONBLOCK = 0x04;
		const DMA = 0x08;
		const IRQ = 0x10;
		const OFFLINE = 0x8000_0000;
	}
}

impl DeviceFlags {
	pub const RDWR: DeviceFlags = DeviceFlags::READONLY.union(DeviceFlags::WRITEONLY);
}

/// IOCTL command space
pub mod ioctl {
	pub const RESET: u32 = 0x1000;
	pub const GET_INFO: u32 = 0x1001;
	pub const FLUSH: u32 = 0x1004;
	pub const BLKGETSIZE: u32 = 0x2000;
	pub const BLKFLSBUF: u32 = 0x2001;
	pub const NETUP: u32 = 0x3000;
	pub const NETDOWN: u32 = 0x3001;
	pub const NETSETADDR: u32 = 0x3002;
	pub const TTYSETRAW: u32 = 0x4000;
	pub const TTYSETCOOKED: u32 = 0x4001;
	pub const TTYGETATTR: u32 = 0x4002;
}

/// Device class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
	Char,
	Block,
	Net,
	Tty,
}

/// Operation vtable.
///
/// Partial vtables are permitted; a missing operation surfaces as
/// [`Error::NotSupported`].
#[derive(Clone, Copy)]
pub struct DeviceOps {
	pub read: Option<fn(&Device, &mut [u8], u64) -> Result<usize>>,
	pub write: Option<fn(&Device, &[u8], u64) -> Result<usize>>,
	pub ioctl: Option<fn(&Device, u32, usize) -> Result<usize>>,
	pub flush: Option<fn(&Device) -> Result<()>>,
}

impl DeviceOps {
	pub const fn empty() -> Self {
		Self {
			read: None,
			write: None,
			ioctl: None,
			flush: None,
		}
	}
}

/// Class-specific device state
pub enum DeviceState {
	/// No pipeline; the vtable carries everything
	Plain,
	Char(chardev::CharState),
	Block(blockdev::BlockState),
	Net(netdev::NetState),
	Tty(tty::TtyState),
}

/// One DMA descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
	pub addr: u64,
	pub len: u32,
	pub flags: u32,
}

struct IrqBinding {
	irq: u32,
	handler: String,
}

/// Addressable peripheral abstraction
pub struct Device {
	name: String,
	class: DeviceClass,
	number: DeviceNumber,
	flags: AtomicU32,
	refcount: Mutex<u32>,
	refwq: WaitQueue,
	ops: DeviceOps,
	state: DeviceState,
	irq: SpinLock<Option<IrqBinding>>,
	dma: SpinLock<Vec<DmaDescriptor>>,
}

impl Device {
	/// Build an unregistered device record
	pub fn new(
		name: &str,
		class: DeviceClass,
		number: DeviceNumber,
		flags: DeviceFlags,
		ops: DeviceOps,
		state: DeviceState,
	) -> Self {
		Self {
			name: name.into(),
			class,
			number,
			flags: AtomicU32::new(flags.bits()),
			refcount: Mutex::new(0),
			refwq: WaitQueue::new(),
			ops,
			state,
			irq: SpinLock::new(None),
			dma: SpinLock::new(Vec::new()),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn class(&self) -> DeviceClass {
		self.class
	}

	pub fn number(&self) -> DeviceNumber {
		self.number
	}

	pub fn flags(&self) -> DeviceFlags {
		DeviceFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
	}

	pub fn add_flags(&self, flags: DeviceFlags) {
		self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
	}

	pub fn clear_flags(&self, flags: DeviceFlags) {
		self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
	}

	pub fn state(&self) -> &DeviceState {
		&self.state
	}

	/// Current reference count
	pub fn refcount(&self) -> u32 {
		*self.refcount.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn ref_get(&self) {
		let mut count = self.refcount.lock().unwrap_or_else(PoisonError::into_inner);
		*count += 1;
	}

	fn ref_put(&self) -> Result<()> {
		let mut count = self.refcount.lock().unwrap_or_else(PoisonError::into_inner);
		if *count <= 1 {
			return Err(Error::InvalidParam);
		}
		*count -= 1;
		drop(count);
		self.refwq.notify_all();
		Ok(())
	}

	fn wait_last_reference(&self) {
		let count = self.refcount.lock().unwrap_or_else(PoisonError::into_inner);
		let _unused = self.refwq.wait_until(count, None, |count| *count <= 1);
	}

	/// Read through the operation vtable
	pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
		match self.ops.read {
			Some(op) => op(self, buf, offset),
			None => Err(Error::NotSupported),
		}
	}

	/// Write through the operation vtable
	pub fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
		match self.ops.write {
			Some(op) => op(self, buf, offset),
			None => Err(Error::NotSupported),
		}
	}

	/// Control through the operation vtable
	pub fn ioctl(&self, cmd: u32, arg: usize) -> Result<usize> {
		match self.ops.ioctl {
			Some(op) => op(self, cmd, arg),
			None => Err(Error::NotSupported),
		}
	}

	/// Flush through the operation vtable
	pub fn flush(&self) -> Result<()> {
		match self.ops.flush {
			Some(op) => op(self),
			None => Err(Error::NotSupported),
		}
	}

	/// Bind the device's interrupt handler; one binding per device
	pub fn request_irq(&self, irq_id: u32, flags: IrqFlags, handler: IrqHandlerFn) -> Result<()> {
		let mut binding = self.irq.lock();
		if binding.is_some() {
			return Err(Error::Busy);
		}
		irq::register_handler(irq_id, &self.name, flags, handler)?;
		*binding = Some(IrqBinding {
			irq: irq_id,
			handler: self.name.clone(),
		});
		drop(binding);
		self.add_flags(DeviceFlags::IRQ);
		Ok(())
	}

	/// Release the interrupt binding, if any
	pub fn free_irq(&self) -> Result<()> {
		let binding = self.irq.lock().take();
		match binding {
			Some(binding) => {
				irq::free_handler(binding.irq, &binding.handler)?;
				self.clear_flags(DeviceFlags::IRQ);
				Ok(())
			}
			None => Err(Error::NotFound),
		}
	}

	/// Bound interrupt source, if any
	pub fn irq_line(&self) -> Option<u32> {
		self.irq.lock().as_ref().map(|b| b.irq)
	}

	/// Install a DMA descriptor chain
	pub fn set_dma_chain(&self, chain: Vec<DmaDescriptor>) -> Result<()> {
		if chain.is_empty() {
			return Err(Error::InvalidParam);
		}
		*self.dma.lock() = chain;
		self.add_flags(DeviceFlags::DMA);
		Ok(())
	}

	/// Copy of the DMA chain
	pub fn dma_chain(&self) -> Vec<DmaDescriptor> {
		self.dma.lock().clone()
	}

	/// Drop implicit resources; runs after the refcount drains
	fn release_resources(&self) {
		if self.irq.lock().is_some() {
			let _ = self.free_irq();
		}
		self.dma.lock().clear();
		self.clear_flags(DeviceFlags::DMA);
		match &self.state {
			DeviceState::Net(state) => netdev::teardown(state),
			DeviceState::Block(state) => blockdev::teardown(state),
			_ => {}
		}
	}
}

struct Registry {
	devices: BTreeMap<String, Arc<Device>>,
	next_major: u32,
}

static REGISTRY: Lazy<SpinLock<Registry>> = Lazy::new(|| {
	SpinLock::new(Registry {
		devices: BTreeMap::new(),
		next_major: DYNAMIC_MAJOR_BASE,
	})
});

/// Initialize the device registry
pub fn init() -> Result<()> {
	Lazy::force(&REGISTRY);
	crate::info!(target: "device", "device registry initialized");
	Ok(())
}

/// Register a device.
///
/// Assigns a dynamic major if the record carries zero; rejects duplicate
/// names. The registry's own reference sets the count to one.
pub fn register_device(mut device: Device) -> Result<Arc<Device>> {
	if device.name.is_empty() {
		return Err(Error::InvalidParam);
	}
	let mut registry = REGISTRY.lock();
	if registry.devices.contains_key(&device.name) {
		return Err(Error::Busy);
	}
	if device.number.major == 0 {
		device.number.major = registry.next_major;
		registry.next_major += 1;
	}
	*device.refcount.lock().unwrap_or_else(PoisonError::into_inner) = 1;
	let device = Arc::new(device);
	registry
		.devices
		.insert(device.name.clone(), device.clone());
	drop(registry);
	crate::info!(
		target: "device",
		"registered {} ({:?} {})",
		device.name,
		device.class,
		device.number
	);
	Ok(device)
}

/// Remove a device, waiting for outstanding references to drain
pub fn unregister_device(name: &str) -> Result<()> {
	let device = {
		let mut registry = REGISTRY.lock();
		registry.devices.remove(name).ok_or(Error::NotFound)?
	};
	device.add_flags(DeviceFlags::OFFLINE);
	device.wait_last_reference();
	device.release_resources();
	crate::info!(target: "device", "unregistered {}", name);
	Ok(())
}

/// Look a device up by name, taking a reference
pub fn find(name: &str) -> Result<Arc<Device>> {
	let registry = REGISTRY.lock();
	let device = registry.devices.get(name).ok_or(Error::NotFound)?.clone();
	device.ref_get();
	Ok(device)
}

/// Look a device up by major/minor, taking a reference
pub fn find_by_number(major: u32, minor: u32) -> Result<Arc<Device>> {
	let registry = REGISTRY.lock();
	let device = registry
		.devices
		.values()
		.find(|d| d.number.major == major && d.number.minor == minor)
		.cloned()
		.ok_or(Error::NotFound)?;
	device.ref_get();
	Ok(device)
}

/// Balance a successful `find`
pub fn put(device: &Device) -> Result<()> {
	device.ref_put()
}

/// Names of all registered devices
pub fn list_devices() -> Vec<String> {
	REGISTRY.lock().devices.keys().cloned().collect()
}

/// Whether a device name is currently registered
pub fn is_registered(name: &str) -> bool {
	REGISTRY.lock().devices.contains_key(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn plain_device(name: &str) -> Device {
		Device::new(
			name,
			DeviceClass::Char,
			DeviceNumber::new(0, 0),
			DeviceFlags::RDWR,
			DeviceOps::empty(),
			DeviceState::Plain,
		)
	}

	#[test]
	fn register_assigns_dynamic_major() {
		let dev = register_device(plain_device("regtest-major")).unwrap();
		assert!(dev.number().major >= DYNAMIC_MAJOR_BASE);
		assert_eq!(dev.refcount(), 1);
		unregister_device("regtest-major").unwrap();
		assert!(!is_registered("regtest-major"));
	}

	#[test]
	fn duplicate_names_rejected() {
		let _dev = register_device(plain_device("regtest-dup")).unwrap();
		let err = register_device(plain_device("regtest-dup"));
		assert!(matches!(err, Err(Error::Busy)));
		unregister_device("regtest-dup").unwrap();
	}

	#[test]
	fn find_and_put_balance_the_refcount() {
		let dev = register_device(plain_device("regtest-ref")).unwrap();
		let found = find("regtest-ref").unwrap();
		assert_eq!(found.refcount(), 2);
		put(&found).unwrap();
		assert_eq!(dev.refcount(), 1);
		// Unbalanced put must not drop the registry's own reference.
		assert_eq!(put(&dev), Err(Error::InvalidParam));
		unregister_device("regtest-ref").unwrap();
		assert_eq!(find("regtest-ref").err(), Some(Error::NotFound));
	}

	#[test]
	fn unregister_waits_for_holders() {
		let _dev = register_device(plain_device("regtest-wait")).unwrap();
		let held = find("regtest-wait").unwrap();
		let waiter = std::thread::spawn(|| unregister_device("regtest-wait"));
		std::thread::sleep(std::time::Duration::from_millis(30));
		assert!(!waiter.is_finished());
		put(&held).unwrap();
		waiter.join().unwrap().unwrap();
	}

	#[test]
	fn missing_vtable_entries_surface_not_supported() {
		let dev = register_device(plain_device("regtest-ops")).unwrap();
		let mut buf = [0u8; 4];
		assert_eq!(dev.read(&mut buf, 0), Err(Error::NotSupported));
		assert_eq!(dev.write(&buf, 0), Err(Error::NotSupported));
		assert_eq!(dev.ioctl(ioctl::GET_INFO, 0), Err(Error::NotSupported));
		assert_eq!(dev.flush(), Err(Error::NotSupported));
		unregister_device("regtest-ops").unwrap();
	}

	#[test]
	fn dma_chain_lifecycle() {
		let dev = register_device(plain_device("regtest-dma")).unwrap();
		dev.set_dma_chain(vec![DmaDescriptor {
			addr: 0x1000,
			len: 512,
			flags: 0,
		}])
		.unwrap();
		assert!(dev.flags().contains(DeviceFlags::DMA));
		assert_eq!(dev.dma_chain().len(), 1);
		unregister_device("regtest-dma").unwrap();
		assert!(dev.dma_chain().is_empty());
	}
}
