// SPDX-License-Identifier: GPL-2.0

//! Loopback network device
//!
//! Every frame the service task transmits is reflected back into the
//! device's own RX queue.

use kos_kernel::device::{self, Device, DeviceFlags};
use kos_kernel::error::Result;
use kos_kernel::netdev::{self, MacAddress};
use kos_kernel::sync::Arc;

/// Locally administered loopback MAC
pub const LOOPBACK_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// Create a loopback interface; frames written to it come back on read
pub fn create(name: &str) -> Result<Arc<Device>> {
	let device = netdev::create(name, LOOPBACK_MAC, DeviceFlags::RDWR)?;
	let weak = Arc::downgrade(&device);
	netdev::set_tx_hook(
		&device,
		Arc::new(move |frame: &[u8]| {
			if let Some(device) = weak.upgrade() {
				let _ = netdev::inject_rx(&device, frame);
			}
		}),
	)?;
	log::info!(target: "loopback", "{} ready", name);
	Ok(device)
}
