//! Keyed pseudorandom payload generator.
//!
//! AES-128 in counter mode: the 16-byte block starting at stream offset `o`
//! is the encryption of `o` (little-endian `u32`, zero padded) under the
//! per-test key, and the counter advances by the block size.  A trailing
//! partial block is the truncated encryption of the next counter value.
//!
//! Senders fill each packet from its own byte offset and then overwrite the
//! first four bytes with that offset in plaintext, so receivers can rebuild
//! the expected payload for any packet independently of arrival order.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Block};

use crate::params::AuthKey;

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Width of the plaintext offset field at the start of every packet.
pub const OFFSET_LEN: usize = 4;

/// Deterministic keyed byte-stream generator.
pub struct PayloadGenerator {
    cipher: Aes128,
}

impl PayloadGenerator {
    pub fn new(key: &AuthKey) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key.as_bytes())),
        }
    }

    /// Fill `data` with the keystream starting at byte offset `offset`.
    pub fn fill(&self, offset: u32, data: &mut [u8]) {
        let mut counter = offset;
        let mut chunks = data.chunks_exact_mut(BLOCK_SIZE);
        for chunk in &mut chunks {
            chunk.copy_from_slice(&self.block(counter));
            counter = counter.wrapping_add(BLOCK_SIZE as u32);
        }

        let tail = chunks.into_remainder();
        if !tail.is_empty() {
            let block = self.block(counter);
            tail.copy_from_slice(&block[..tail.len()]);
        }
    }

    /// Build a data-channel packet for stream offset `offset`.
    pub fn fill_packet(&self, offset: u32, packet: &mut [u8]) {
        self.fill(offset, packet);
        write_offset(packet, offset);
    }

    /// Check a received packet byte-for-byte against the expected payload.
    ///
    /// `scratch` must be exactly as long as the expected packet size; packets
    /// of any other length never verify.
    pub fn verify_packet(&self, packet: &[u8], scratch: &mut [u8]) -> bool {
        if packet.len() != scratch.len() {
            return false;
        }
        let Some(offset) = read_offset(packet) else {
            return false;
        };
        self.fill_packet(offset, scratch);
        packet == &scratch[..]
    }

    fn block(&self, counter: u32) -> Block {
        let mut block = Block::default();
        block[..OFFSET_LEN].copy_from_slice(&counter.to_le_bytes());
        self.cipher.encrypt_block(&mut block);
        block
    }
}

/// Stream offset carried by the first four bytes of a packet.
pub fn read_offset(packet: &[u8]) -> Option<u32> {
    let field: [u8; OFFSET_LEN] = packet.get(..OFFSET_LEN)?.try_into().ok()?;
    Some(u32::from_le_bytes(field))
}

fn write_offset(packet: &mut [u8], offset: u32) {
    let len = packet.len().min(OFFSET_LEN);
    packet[..len].copy_from_slice(&offset.to_le_bytes()[..len]);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
