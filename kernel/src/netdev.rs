// SPDX-License-Identifier: GPL-2.0

//! Network device pipeline
//!
//! Bounded RX and TX packet queues per device plus a background service
//! task that drains TX and accounts statistics. RX frames arrive through
//! the host-facing [`inject_rx`] surface; the RX queue is lossy at the
//! producer, the TX queue back-pressures the writer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use core::fmt;

use spin::Mutex as SpinLock;

use crate::device::{
	self, ioctl, Device, DeviceClass, DeviceFlags, DeviceOps, DeviceState,
};
use crate::error::{Error, Result};
use crate::sync::WaitQueue;
use crate::types::DeviceNumber;

/// Default MTU in bytes
pub const DEFAULT_MTU: u32 = 1500;

/// Valid MTU range
pub const MTU_MIN: u32 = 64;
pub const MTU_MAX: u32 = 9000;

/// Link-layer header allowance on top of the MTU
pub const HEADER_LEN: usize = 14;

/// Packets per bounded queue
pub const QUEUE_CAPACITY: usize = 64;

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
	pub const fn new(bytes: [u8; 6]) -> Self {
		Self(bytes)
	}

	pub const fn broadcast() -> Self {
		Self([0xFF; 6])
	}

	pub const fn zero() -> Self {
		Self([0; 6])
	}

	pub fn bytes(&self) -> &[u8; 6] {
		&self.0
	}

	pub fn is_multicast(&self) -> bool {
		(self.0[0] & 0x01) != 0
	}

	pub fn from_raw(raw: u64) -> Self {
		let bytes = raw.to_be_bytes();
		Self([bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]])
	}
}

impl fmt::Display for MacAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
			self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
		)
	}
}

/// Interface statistics
#[derive(Debug, Clone, Default)]
pub struct NetStats {
	pub rx_packets: u64,
	pub tx_packets: u64,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	pub rx_dropped: u64,
	pub tx_errors: u64,
}

struct PacketQueue {
	packets: VecDeque<Vec<u8>>,
	dropped: u64,
}

impl PacketQueue {
	fn new() -> Self {
		Self {
			packets: VecDeque::with_capacity(QUEUE_CAPACITY),
			dropped: 0,
		}
	}
}

/// Handler invoked by the service task for every transmitted frame
pub type TxHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Network pipeline state
pub struct NetState {
	mac: SpinLock<MacAddress>,
	mtu: AtomicU32,
	up: AtomicBool,
	rx: Mutex<PacketQueue>,
	rx_wq: WaitQueue,
	tx: Mutex<PacketQueue>,
	tx_wq: WaitQueue,
	stats: SpinLock<NetStats>,
	tx_hook: SpinLock<Option<TxHook>>,
	service_stop: AtomicBool,
	service: SpinLock<Option<JoinHandle<()>>>,
}

impl NetState {
	fn new(mac: MacAddress) -> Self {
		Self {
			mac: SpinLock::new(mac),
			mtu: AtomicU32::new(DEFAULT_MTU),
			up: AtomicBool::new(false),
			rx: Mutex::new(PacketQueue::new()),
			rx_wq: WaitQueue::new(),
			tx: Mutex::new(PacketQueue::new()),
			tx_wq: WaitQueue::new(),
			stats: SpinLock::new(NetStats::default()),
			tx_hook: SpinLock::new(None),
			service_stop: AtomicBool::new(false),
			service: SpinLock::new(None),
		}
	}

	fn is_up(&self) -> bool {
		self.up.load(Ordering::SeqCst)
	}
}

fn net_state(dev: &Device) -> Result<&NetState> {
	match dev.state() {
		DeviceState::Net(state) => Ok(state),
		_ => Err(Error::InvalidParam),
	}
}

fn dev_write(dev: &Device, data: &[u8], _offset: u64) -> Result<usize> {
	let state = net_state(dev)?;
	if !state.is_up() {
		return Err(Error::Io);
	}
	let mtu = state.mtu.load(Ordering::Relaxed) as usize;
	if data.len() > mtu + HEADER_LEN {
		return Err(Error::InvalidParam);
	}
	let nonblock = dev.flags().contains(DeviceFlags::NONBLOCK);
	let mut queue = state.tx.lock().unwrap_or_else(PoisonError::into_inner);
	if queue.packets.len() >= QUEUE_CAPACITY {
		if nonblock {
			return Err(Error::Busy);
		}
		queue = state.tx_wq.wait_until(queue, None, |queue| {
			queue.packets.len() < QUEUE_CAPACITY
		})?;
	}
	queue.packets.push_back(data.to_vec());
	drop(queue);
	state.tx_wq.notify_all();
	Ok(data.len())
}

fn dev_read(dev: &Device, buf: &mut [u8], _offset: u64) -> Result<usize> {
	let state = net_state(dev)?;
	let nonblock = dev.flags().contains(DeviceFlags::NONBLOCK);
	let mut queue = state.rx.lock().unwrap_or_else(PoisonError::into_inner);
	if queue.packets.is_empty() {
		if !state.is_up() {
			return Ok(0);
		}
		if nonblock {
			return Err(Error::Busy);
		}
		queue = state.rx_wq.wait_until(queue, None, |queue| {
			!queue.packets.is_empty() || !state.is_up()
		})?;
	}
	let packet = match queue.packets.pop_front() {
		Some(packet) => packet,
		// Drained by a concurrent down().
		None => return Ok(0),
	};
	drop(queue);
	let count = buf.len().min(packet.len());
	buf[..count].copy_from_slice(&packet[..count]);
	Ok(count)
}

fn dev_ioctl(dev: &Device, cmd: u32, arg: usize) -> Result<usize> {
	match cmd {
		ioctl::NETUP => {
			up(dev)?;
			Ok(0)
		}
		ioctl::NETDOWN => {
			down(dev)?;
			Ok(0)
		}
		ioctl::NETSETADDR => {
			let state = net_state(dev)?;
			*state.mac.lock() = MacAddress::from_raw(arg as u64);
			Ok(0)
		}
		ioctl::GET_INFO => {
			let state = net_state(dev)?;
			let stats = state.stats.lock().clone();
			crate::info!(
				target: "netdev",
				"{}: {} mtu {} up {} tx {}/{} rx {}/{}",
				dev.name(),
				*state.mac.lock(),
				state.mtu.load(Ordering::Relaxed),
				state.is_up(),
				stats.tx_packets,
				stats.tx_bytes,
				stats.rx_packets,
				stats.rx_bytes
			);
			Ok(0)
		}
		_ => Err(Error::NotSupported),
	}
}

const NET_OPS: DeviceOps = DeviceOps {
	read: Some(dev_read),
	write: Some(dev_write),
	ioctl: Some(dev_ioctl),
	flush: None,
};

fn service_loop(dev: Arc<Device>) {
	let state = match net_state(&dev) {
		Ok(state) => state,
		Err(_) => return,
	};
	loop {
		let frame = {
			let queue = state.tx.lock().unwrap_or_else(PoisonError::into_inner);
			let mut queue = match state.tx_wq.wait_until(queue, Some(100), |queue| {
				!queue.packets.is_empty()
			}) {
				Ok(queue) => queue,
				Err(_) => {
					if state.service_stop.load(Ordering::SeqCst) {
						return;
					}
					continue;
				}
			};
			if state.service_stop.load(Ordering::SeqCst) {
				return;
			}
			if !state.is_up() {
				continue;
			}
			queue.packets.pop_front()
		};
		let frame = match frame {
			Some(frame) => frame,
			None => continue,
		};
		// Space freed; unblock writers.
		state.tx_wq.notify_all();
		{
			let mut stats = state.stats.lock();
			stats.tx_packets += 1;
			stats.tx_bytes += frame.len() as u64;
		}
		let hook = state.tx_hook.lock().clone();
		if let Some(hook) = hook {
			hook(&frame);
		}
	}
}

/// Create and register a network device; the service task starts down
pub fn create(name: &str, mac: MacAddress, flags: DeviceFlags) -> Result<Arc<Device>> {
	let device = Device::new(
		name,
		DeviceClass::Net,
		DeviceNumber::new(0, 0),
		flags,
		NET_OPS,
		DeviceState::Net(NetState::new(mac)),
	);
	let device = device::register_device(device)?;
	let state = net_state(&device)?;
	let worker = {
		let device = device.clone();
		std::thread::Builder::new()
			.name(format!("net/{}", name))
			.spawn(move || service_loop(device))
			.map_err(|_| Error::NoMemory)?
	};
	*state.service.lock() = Some(worker);
	Ok(device)
}

/// Bring the interface up
pub fn up(dev: &Device) -> Result<()> {
	let state = net_state(dev)?;
	state.up.store(true, Ordering::SeqCst);
	state.tx_wq.notify_all();
	crate::info!(target: "netdev", "{} up", dev.name());
	Ok(())
}

/// Bring the interface down and drain both queues
pub fn down(dev: &Device) -> Result<()> {
	let state = net_state(dev)?;
	state.up.store(false, Ordering::SeqCst);
	state
		.tx
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.packets
		.clear();
	state
		.rx
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.packets
		.clear();
	state.tx_wq.notify_all();
	state.rx_wq.notify_all();
	crate::info!(target: "netdev", "{} down", dev.name());
	Ok(())
}

/// Host-facing RX injection surface.
///
/// The RX queue is lossy: a full queue evicts its oldest frame and raises
/// the drop counter.
pub fn inject_rx(dev: &Device, frame: &[u8]) -> Result<()> {
	let state = net_state(dev)?;
	if !state.is_up() {
		return Err(Error::Io);
	}
	let mut queue = state.rx.lock().unwrap_or_else(PoisonError::into_inner);
	if queue.packets.len() >= QUEUE_CAPACITY {
		queue.packets.pop_front();
		queue.dropped += 1;
		state.stats.lock().rx_dropped += 1;
	}
	queue.packets.push_back(frame.to_vec());
	drop(queue);
	{
		let mut stats = state.stats.lock();
		stats.rx_packets += 1;
		stats.rx_bytes += frame.len() as u64;
	}
	state.rx_wq.notify_all();
	Ok(())
}

/// Install the transmit hook run by the service task
pub fn set_tx_hook(dev: &Device, hook: TxHook) -> Result<()> {
	let state = net_state(dev)?;
	*state.tx_hook.lock() = Some(hook);
	Ok(())
}

/// Interface statistics snapshot
pub fn stats(dev: &Device) -> Result<NetStats> {
	Ok(net_state(dev)?.stats.lock().clone())
}

/// Current RX and TX queue depths
pub fn queue_sizes(dev: &Device) -> Result<(usize, usize)> {
	let state = net_state(dev)?;
	let rx = state
		.rx
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.packets
		.len();
	let tx = state
		.tx
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.packets
		.len();
	Ok((rx, tx))
}

/// Interface MAC address
pub fn mac(dev: &Device) -> Result<MacAddress> {
	Ok(*net_state(dev)?.mac.lock())
}

/// Change the MTU within the valid range
pub fn set_mtu(dev: &Device, mtu: u32) -> Result<()> {
	if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
		return Err(Error::InvalidParam);
	}
	net_state(dev)?.mtu.store(mtu, Ordering::Relaxed);
	Ok(())
}

/// Current MTU
pub fn mtu(dev: &Device) -> Result<u32> {
	Ok(net_state(dev)?.mtu.load(Ordering::Relaxed))
}

/// Stop the service task; used by device teardown
pub(crate) fn teardown(state: &NetState) {
	state.service_stop.store(true, Ordering::SeqCst);
	state.tx_wq.notify_all();
	if let Some(worker) = state.service.lock().take() {
		let _ = worker.join();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn test_mac(last: u8) -> MacAddress {
		MacAddress::new([0x02, 0, 0, 0, 0, last])
	}

	fn wait_for<F: Fn() -> bool>(cond: F) {
		for _ in 0..200 {
			if cond() {
				return;
			}
			std::thread::sleep(Duration::from_millis(5));
		}
	}

	#[test]
	fn write_requires_up() {
		let dev = create("nettest-down", test_mac(1), DeviceFlags::RDWR).unwrap();
		assert_eq!(dev.write(&[0u8; 64], 0), Err(Error::Io));
		device::unregister_device("nettest-down").unwrap();
	}

	#[test]
	fn service_accounts_transmitted_frames() {
		let dev = create("nettest-tx", test_mac(2), DeviceFlags::RDWR).unwrap();
		up(&dev).unwrap();
		for _ in 0..3 {
			assert_eq!(dev.write(&[0xAB; 128], 0).unwrap(), 128);
		}
		wait_for(|| stats(&dev).map(|s| s.tx_packets == 3).unwrap_or(false));
		let stats = stats(&dev).unwrap();
		assert_eq!(stats.tx_packets, 3);
		assert_eq!(stats.tx_bytes, 384);
		device::unregister_device("nettest-tx").unwrap();
	}

	#[test]
	fn oversized_frames_rejected() {
		let dev = create("nettest-mtu", test_mac(3), DeviceFlags::RDWR).unwrap();
		up(&dev).unwrap();
		let frame = vec![0u8; DEFAULT_MTU as usize + HEADER_LEN + 1];
		assert_eq!(dev.write(&frame, 0), Err(Error::InvalidParam));
		assert_eq!(set_mtu(&dev, 63), Err(Error::InvalidParam));
		set_mtu(&dev, 9000).unwrap();
		assert_eq!(dev.write(&frame, 0).unwrap(), frame.len());
		device::unregister_device("nettest-mtu").unwrap();
	}

	#[test]
	fn rx_injection_feeds_readers_and_is_lossy() {
		let dev = create("nettest-rx", test_mac(4), DeviceFlags::RDWR).unwrap();
		up(&dev).unwrap();
		inject_rx(&dev, &[1, 2, 3, 4]).unwrap();
		let mut buf = [0u8; 16];
		assert_eq!(dev.read(&mut buf, 0).unwrap(), 4);
		assert_eq!(&buf[..4], &[1, 2, 3, 4]);

		for i in 0..(QUEUE_CAPACITY + 3) {
			inject_rx(&dev, &[i as u8; 8]).unwrap();
		}
		let stats = stats(&dev).unwrap();
		assert_eq!(stats.rx_dropped, 3);
		let (rx_len, _) = queue_sizes(&dev).unwrap();
		assert_eq!(rx_len, QUEUE_CAPACITY);
		device::unregister_device("nettest-rx").unwrap();
	}

	#[test]
	fn down_drains_queues() {
		let dev = create("nettest-drain", test_mac(5), DeviceFlags::RDWR).unwrap();
		up(&dev).unwrap();
		inject_rx(&dev, &[9; 32]).unwrap();
		down(&dev).unwrap();
		let (rx_len, tx_len) = queue_sizes(&dev).unwrap();
		assert_eq!((rx_len, tx_len), (0, 0));
		// Reads on a downed interface do not block.
		let mut buf = [0u8; 8];
		assert_eq!(dev.read(&mut buf, 0).unwrap(), 0);
		device::unregister_device("nettest-drain").unwrap();
	}

	#[test]
	fn tx_hook_sees_every_frame() {
		let dev = create("nettest-hook", test_mac(6), DeviceFlags::RDWR).unwrap();
		let seen = Arc::new(SpinLock::new(Vec::new()));
		{
			let seen = seen.clone();
			set_tx_hook(
				&dev,
				Arc::new(move |frame: &[u8]| {
					seen.lock().push(frame.len());
				}),
			)
			.unwrap();
		}
		up(&dev).unwrap();
		dev.write(&[0u8; 100], 0).unwrap();
		dev.write(&[0u8; 200], 0).unwrap();
		wait_for(|| seen.lock().len() == 2);
		assert_eq!(*seen.lock(), vec![100, 200]);
		device::unregister_device("nettest-hook").unwrap();
	}
}
