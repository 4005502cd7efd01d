// SPDX-License-Identifier: GPL-2.0

//! End-to-end device pipeline scenarios

use std::thread;
use std::time::Duration;

use kos_kernel::device::{self, ioctl, DeviceFlags};
use kos_kernel::error::Error;
use kos_kernel::{blockdev, boot, chardev, netdev, tty};

fn boot_fabric() {
	static BOOT: std::sync::Once = std::sync::Once::new();
	BOOT.call_once(|| {
		boot::boot(&boot::default_modules(), &boot::AutoContinue).unwrap();
	});
}

#[test]
fn char_pipe_two_producers_one_consumer() {
	boot_fabric();
	let dev = chardev::create("pipe", chardev::DEFAULT_BUF_SIZE, DeviceFlags::RDWR).unwrap();

	let consumer = {
		let dev = dev.clone();
		thread::spawn(move || {
			let mut collected = Vec::new();
			while collected.len() < 8 {
				let mut buf = [0u8; 8];
				let n = dev.read(&mut buf, 0).unwrap();
				collected.extend_from_slice(&buf[..n]);
			}
			collected
		})
	};

	let producers: Vec<_> = [b"ABCD", b"EFGH"]
		.into_iter()
		.map(|quartet| {
			let dev = dev.clone();
			thread::spawn(move || {
				assert_eq!(dev.write(quartet, 0).unwrap(), 4);
			})
		})
		.collect();
	for producer in producers {
		producer.join().unwrap();
	}

	let bytes = consumer.join().unwrap();
	assert_eq!(bytes.len(), 8);
	let mut multiset = bytes.clone();
	multiset.sort_unstable();
	assert_eq!(multiset, b"ABCDEFGH".to_vec());
	// Whole writes are atomic, so the stream is one quartet after the
	// other.
	assert!(bytes == b"ABCDEFGH".to_vec() || bytes == b"EFGHABCD".to_vec());
	assert_eq!(chardev::stats(&dev).unwrap().chars_in, 8);

	device::unregister_device("pipe").unwrap();
	assert!(!device::is_registered("pipe"));
}

#[test]
fn block_disk0_round_trip_and_write_through() {
	boot_fabric();
	// 1 MiB of 512-byte blocks.
	let dev = blockdev::create("disk0", 512, 2048, DeviceFlags::RDWR).unwrap();

	let payload = vec![0x41u8; 1024];
	assert_eq!(dev.write(&payload, 1024).unwrap(), 1024);
	let mut back = vec![0u8; 1024];
	assert_eq!(dev.read(&mut back, 1024).unwrap(), 1024);
	assert_eq!(back, payload);

	assert_eq!(blockdev::dirty_entries(&dev).unwrap(), 0);
	dev.flush().unwrap();
	assert_eq!(blockdev::dirty_entries(&dev).unwrap(), 0);

	assert_eq!(dev.ioctl(ioctl::BLKGETSIZE, 0).unwrap(), 2048);
	device::unregister_device("disk0").unwrap();
}

#[test]
fn net_eth0_service_accounting_and_drain() {
	boot_fabric();
	let dev = netdev::create(
		"eth0",
		netdev::MacAddress::new([0x02, 0, 0, 0, 0, 0x10]),
		DeviceFlags::RDWR,
	)
	.unwrap();
	netdev::up(&dev).unwrap();

	for _ in 0..3 {
		assert_eq!(dev.write(&[0x55u8; 128], 0).unwrap(), 128);
	}
	for _ in 0..200 {
		if netdev::stats(&dev).unwrap().tx_packets == 3 {
			break;
		}
		thread::sleep(Duration::from_millis(5));
	}
	let stats = netdev::stats(&dev).unwrap();
	assert_eq!(stats.tx_packets, 3);
	assert_eq!(stats.tx_bytes, 384);

	netdev::inject_rx(&dev, &[0u8; 60]).unwrap();
	netdev::down(&dev).unwrap();
	assert_eq!(netdev::queue_sizes(&dev).unwrap(), (0, 0));

	device::unregister_device("eth0").unwrap();
}

#[test]
fn tty0_cooked_line_and_sigint() {
	boot_fabric();
	let dev = tty::create("tty0", DeviceFlags::RDWR).unwrap();
	tty::set_pgrp(&dev, 42).unwrap();

	let reader = {
		let dev = dev.clone();
		thread::spawn(move || {
			let mut buf = [0u8; 128];
			let n = dev.read(&mut buf, 0).unwrap();
			buf[..n].to_vec()
		})
	};
	thread::sleep(Duration::from_millis(20));
	tty::receive_bytes(&dev, b"Hi\n").unwrap();
	assert_eq!(reader.join().unwrap(), b"Hi\n");

	// Echo went through ONLCR processing.
	let mut out = [0u8; 16];
	let n = tty::drain_output(&dev, &mut out).unwrap();
	assert_eq!(&out[..n], b"Hi\r\n");

	tty::receive_input(&dev, 0x03).unwrap();
	let signals = tty::take_signals(&dev).unwrap();
	assert_eq!(signals, vec![(-42, tty::Signal::Interrupt)]);

	device::unregister_device("tty0").unwrap();
}

#[test]
fn nonblocking_pipelines_surface_busy() {
	boot_fabric();
	let dev = chardev::create(
		"pipe-nb",
		64,
		DeviceFlags::RDWR | DeviceFlags::NONBLOCK,
	)
	.unwrap();
	let mut buf = [0u8; 8];
	assert_eq!(dev.read(&mut buf, 0), Err(Error::Busy));
	device::unregister_device("pipe-nb").unwrap();
}
