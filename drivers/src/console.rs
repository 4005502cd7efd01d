// SPDX-License-Identifier: GPL-2.0

//! Console driver
//!
//! Wires a TTY device up as the system console: cooked mode, echo on, a
//! signal sink that reports control-character signals through the kernel
//! log.

use kos_kernel::device::{self, Device, DeviceFlags};
use kos_kernel::error::Result;
use kos_kernel::sync::Arc;
use kos_kernel::tty::{self, Signal};

/// Create the console TTY and install the logging signal sink
pub fn create(name: &str, pgrp: i32) -> Result<Arc<Device>> {
	let device = tty::create(name, DeviceFlags::RDWR)?;
	tty::set_pgrp(&device, pgrp)?;
	let label = name.to_string();
	tty::set_signal_sink(
		&device,
		Arc::new(move |target: i32, signal: Signal| {
			log::info!(target: "console", "{}: signal {:?} to {}", label, signal, target);
		}),
	)?;
	log::info!(target: "console", "{} attached, pgrp {}", name, pgrp);
	Ok(device)
}

/// Type a line of input, newline included
pub fn feed_line(device: &Device, line: &str) -> Result<()> {
	tty::receive_bytes(device, line.as_bytes())?;
	tty::receive_input(device, b'\n')
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn console_delivers_typed_lines() {
		let dev = create("contest0", 100).unwrap();
		feed_line(&dev, "uptime").unwrap();
		let mut buf = [0u8; 32];
		let n = dev.read(&mut buf, 0).unwrap();
		assert_eq!(&buf[..n], b"uptime\n");

		// ^C reaches the foreground group through the discipline.
		tty::receive_input(&dev, 0x03).unwrap();
		assert_eq!(
			tty::take_signals(&dev).unwrap(),
			vec![(-100, Signal::Interrupt)]
		);
		device::unregister_device("contest0").unwrap();
	}
}
