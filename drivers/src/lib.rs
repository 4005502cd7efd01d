// SPDX-License-Identifier: GPL-2.0

//! Sample drivers for the KOS kernel fabric
//!
//! Small in-process drivers exercising the device framework: the memory
//! character devices, a RAM-disk block device, a loopback network device,
//! and a TTY console.

pub mod console;
pub mod loopback;
pub mod mem;
pub mod ramdisk;
