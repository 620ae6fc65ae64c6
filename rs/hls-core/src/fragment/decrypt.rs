//! AES-128-CBC segment decryption (spec.md §4.4 step 2, §9's `Cipher` note).

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};

use crate::error::{Error, Result};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Streaming AES-128-CBC decryptor with PKCS#7 unpadding at end-of-fragment.
///
/// Input is buffered to 16-byte multiples so every `push` call advances the
/// cipher over whole blocks; the final partial buffer is unpadded only once
/// `finish` is called, since PKCS#7 padding is only meaningful at the end of
/// the ciphertext (spec.md §9: "absence of any backend makes AES-128
/// streams fail with DecryptionFailed at start-of-fragment -- never at
/// parse time").
pub struct Decryptor {
	cipher: Aes128CbcDec,
	pending: Vec<u8>,
}

impl Decryptor {
	pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
		Self {
			cipher: Aes128CbcDec::new(key.into(), iv.into()),
			pending: Vec::new(),
		}
	}

	/// Feed ciphertext bytes, returning whatever whole-block plaintext can
	/// be released immediately. The tail (< 16 bytes, or the final block
	/// held back for unpadding) stays buffered.
	pub fn push(&mut self, data: &[u8]) -> Vec<u8> {
		self.pending.extend_from_slice(data);

		// Always keep at least one block buffered so `finish` has a final
		// block to unpad.
		let available_blocks = self.pending.len() / 16;
		let releasable_blocks = available_blocks.saturating_sub(1);
		let releasable_bytes = releasable_blocks * 16;

		if releasable_bytes == 0 {
			return Vec::new();
		}

		let mut block = self.pending.drain(..releasable_bytes).collect::<Vec<u8>>();
		for chunk in block.chunks_exact_mut(16) {
			self.cipher.decrypt_block_mut(chunk.into());
		}
		block
	}

	/// Decrypt and unpad the final buffered block.
	pub fn finish(mut self) -> Result<Vec<u8>> {
		if self.pending.is_empty() {
			return Ok(Vec::new());
		}
		if self.pending.len() % 16 != 0 {
			return Err(Error::DecryptionFailed("ciphertext not a multiple of the AES block size".into()));
		}
		self.cipher
			.decrypt_padded_mut::<Pkcs7>(&mut self.pending)
			.map(|plain| plain.to_vec())
			.map_err(|_| Error::DecryptionFailed("invalid PKCS#7 padding".into()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use aes::cipher::BlockEncryptMut;

	fn encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
		type Enc = cbc::Encryptor<aes::Aes128>;
		let enc = Enc::new(key.into(), iv.into());
		enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
	}

	#[test]
	fn round_trips_through_streamed_push_and_finish() {
		let key = [0x42u8; 16];
		let iv = [0x24u8; 16];
		let plaintext = b"the quick brown fox jumps over a lazy dog, repeatedly, many times over";
		let ciphertext = encrypt(&key, &iv, plaintext);

		let mut dec = Decryptor::new(&key, &iv);
		let mut out = Vec::new();
		for chunk in ciphertext.chunks(7) {
			out.extend(dec.push(chunk));
		}
		out.extend(dec.finish().unwrap());

		assert_eq!(out, plaintext);
	}

	#[test]
	fn malformed_length_fails_decryption() {
		let key = [0u8; 16];
		let iv = [0u8; 16];
		let mut dec = Decryptor::new(&key, &iv);
		dec.push(&[1, 2, 3, 4, 5]);
		assert!(dec.finish().is_err());
	}
}
