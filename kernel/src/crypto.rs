// SPDX-License-Identifier: GPL-2.0

//! Cryptographic collaborator interface
//!
//! The kernel consumes cryptography through a provider the host installs
//! at boot; primitive implementations live outside this crate. The only
//! primitives implemented here are the timing-safe helpers every consumer
//! must use: constant-time comparison and guaranteed zeroization.

use std::sync::Arc;

use once_cell::sync::Lazy;
use spin::Mutex as SpinLock;

use crate::error::{Error, Result};

/// Digest algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
	Sha256,
	Sha512,
	Md5,
}

impl HashKind {
	/// Digest length in bytes
	pub fn digest_len(&self) -> usize {
		match self {
			HashKind::Sha256 => 32,
			HashKind::Sha512 => 64,
			HashKind::Md5 => 16,
		}
	}
}

/// Cipher algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
	Aes128Cbc,
	Aes256Cbc,
	ChaCha20,
}

impl CipherKind {
	/// Key length in bytes
	pub fn key_len(&self) -> usize {
		match self {
			CipherKind::Aes128Cbc => 16,
			CipherKind::Aes256Cbc | CipherKind::ChaCha20 => 32,
		}
	}
}

/// Primitive provider installed by the host application
pub trait Provider: Send + Sync {
	fn hash(&self, kind: HashKind, input: &[u8]) -> Result<Vec<u8>>;
	fn encrypt(
		&self,
		kind: CipherKind,
		key: &[u8],
		iv: &[u8],
		input: &[u8],
	) -> Result<Vec<u8>>;
	fn decrypt(
		&self,
		kind: CipherKind,
		key: &[u8],
		iv: &[u8],
		input: &[u8],
	) -> Result<Vec<u8>>;
	fn random(&self, buf: &mut [u8]) -> Result<()>;
	fn kdf(&self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>>;
}

static PROVIDER: Lazy<SpinLock<Option<Arc<dyn Provider>>>> =
	Lazy::new(|| SpinLock::new(None));

/// Install (or replace) the primitive provider
pub fn install_provider(provider: Arc<dyn Provider>) {
	*PROVIDER.lock() = Some(provider);
	crate::notice!(target: "crypto", "crypto provider installed");
}

/// Current provider, if one is installed
pub fn provider() -> Result<Arc<dyn Provider>> {
	PROVIDER.lock().clone().ok_or(Error::NotSupported)
}

/// Hash through the installed provider
pub fn hash(kind: HashKind, input: &[u8]) -> Result<Vec<u8>> {
	provider()?.hash(kind, input)
}

/// Encrypt through the installed provider
pub fn encrypt(kind: CipherKind, key: &[u8], iv: &[u8], input: &[u8]) -> Result<Vec<u8>> {
	provider()?.encrypt(kind, key, iv, input)
}

/// Decrypt through the installed provider
pub fn decrypt(kind: CipherKind, key: &[u8], iv: &[u8], input: &[u8]) -> Result<Vec<u8>> {
	provider()?.decrypt(kind, key, iv, input)
}

/// Fill `buf` with random bytes through the installed provider
pub fn random(buf: &mut [u8]) -> Result<()> {
	provider()?.random(buf)
}

/// Derive a key through the installed provider
pub fn kdf(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
	provider()?.kdf(password, salt, iterations)
}

/// Constant-time equality; the comparison time depends only on length
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

/// Zeroization the optimizer cannot elide
pub fn secure_zero(buf: &mut [u8]) {
	for byte in buf.iter_mut() {
		// Volatile store keeps the wipe in place even when the buffer is
		// dead afterwards.
		unsafe { core::ptr::write_volatile(byte, 0) };
	}
	core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Stand-in provider for tests; not cryptography
	struct XorProvider;

	impl Provider for XorProvider {
		fn hash(&self, kind: HashKind, input: &[u8]) -> Result<Vec<u8>> {
			let mut digest = vec![0u8; kind.digest_len()];
			let len = digest.len();
			for (i, byte) in input.iter().enumerate() {
				digest[i % len] ^= byte;
			}
			Ok(digest)
		}

		fn encrypt(
			&self,
			_kind: CipherKind,
			key: &[u8],
			_iv: &[u8],
			input: &[u8],
		) -> Result<Vec<u8>> {
			if key.is_empty() {
				return Err(Error::InvalidParam);
			}
			Ok(input
				.iter()
				.enumerate()
				.map(|(i, b)| b ^ key[i % key.len()])
				.collect())
		}

		fn decrypt(
			&self,
			kind: CipherKind,
			key: &[u8],
			iv: &[u8],
			input: &[u8],
		) -> Result<Vec<u8>> {
			self.encrypt(kind, key, iv, input)
		}

		fn random(&self, buf: &mut [u8]) -> Result<()> {
			for (i, byte) in buf.iter_mut().enumerate() {
				*byte = (i as u8).wrapping_mul(31).wrapping_add(7);
			}
			Ok(())
		}

		fn kdf(&self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
			if iterations == 0 {
				return Err(Error::InvalidParam);
			}
			let mut key: Vec<u8> = password.to_vec();
			key.extend_from_slice(salt);
			Ok(self.hash(HashKind::Sha256, &key)?)
		}
	}

	#[test]
	fn provider_round_trip() {
		install_provider(Arc::new(XorProvider));
		let key = b"0123456789abcdef";
		let ct = encrypt(CipherKind::Aes128Cbc, key, &[0; 16], b"secret").unwrap();
		let pt = decrypt(CipherKind::Aes128Cbc, key, &[0; 16], &ct).unwrap();
		assert_eq!(pt, b"secret");
		assert_eq!(hash(HashKind::Sha256, b"x").unwrap().len(), 32);
	}

	#[test]
	fn secure_compare_matches_equality() {
		assert!(secure_compare(b"same", b"same"));
		assert!(!secure_compare(b"same", b"sane"));
		assert!(!secure_compare(b"short", b"longer"));
		assert!(secure_compare(b"", b""));
	}

	#[test]
	fn secure_zero_wipes() {
		let mut buf = [0xAAu8; 32];
		secure_zero(&mut buf);
		assert!(buf.iter().all(|&b| b == 0));
	}
}
