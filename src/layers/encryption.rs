//! Block-aligned AES-256-XTS encryption.
//!
//! Each `block_size` span of the file is one XTS data unit; the tweak is the
//! unit number (`offset / block_size`) encrypted under the second half of
//! the 64-byte key, then multiplied by alpha in GF(2^128) per 16-byte cipher
//! block. Ciphertext is the same length as plaintext, so offsets and sizes
//! pass through unchanged.
//!
//! The layer expects a Block-Align parent: `offset` must land on a unit
//! boundary and lengths must be multiples of the AES block. It does not
//! authenticate ciphertext — integrity is the anti-tampering layer's job.
//!
//! The key is either given in configuration or fetched once at construction
//! from a vault-style HTTP key source; a failed retrieval aborts
//! construction.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use anyhow::{Context, ensure};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{LayerError, Result};
use crate::layer::{Fd, FileStat, HandleTable, Layer, OpContext, OpenFlags, SharedLayer};

/// AES cipher block size.
const AES_BLOCK: usize = 16;

/// XTS key length: two AES-256 keys back to back.
pub const XTS_KEY_LEN: usize = 64;

/// Multiplies a 128-bit tweak by alpha in GF(2^128), little-endian.
fn mul_alpha(tweak: &mut [u8; AES_BLOCK]) {
    let mut carry = 0u8;
    for byte in tweak.iter_mut() {
        let next = *byte >> 7;
        *byte = (*byte << 1) | carry;
        carry = next;
    }
    if carry != 0 {
        // x^128 = x^7 + x^2 + x + 1
        tweak[0] ^= 0x87;
    }
}

/// AES-XTS transform over a child layer.
pub struct EncryptionLayer {
    next: SharedLayer,
    block_size: usize,
    data_cipher: Aes256,
    tweak_cipher: Aes256,
    fds: Mutex<HandleTable<Fd>>,
}

impl EncryptionLayer {
    /// Builds the layer from a raw 64-byte XTS key.
    ///
    /// # Errors
    ///
    /// Fails if `block_size` is zero or not a multiple of the AES block.
    pub fn new(next: SharedLayer, block_size: usize, key: &[u8]) -> anyhow::Result<Self> {
        ensure!(block_size > 0, "encryption: block_size must be non-zero");
        ensure!(
            block_size % AES_BLOCK == 0,
            "encryption: block_size must be a multiple of {AES_BLOCK}"
        );
        ensure!(key.len() == XTS_KEY_LEN, "encryption: XTS key must be {XTS_KEY_LEN} bytes");

        Ok(Self {
            next,
            block_size,
            data_cipher: Aes256::new(GenericArray::from_slice(&key[..32])),
            tweak_cipher: Aes256::new(GenericArray::from_slice(&key[32..])),
            fds: Mutex::new(HandleTable::new()),
        })
    }

    /// Builds the layer with a key fetched from a vault-style HTTP source.
    ///
    /// # Errors
    ///
    /// Fails on any transport, authorization, or key-format problem.
    pub fn from_vault(
        next: SharedLayer,
        block_size: usize,
        vault_addr: &str,
        secret_path: &str,
        api_key: &str,
    ) -> anyhow::Result<Self> {
        let key = fetch_vault_key(vault_addr, secret_path, api_key)?;
        Self::new(next, block_size, &key)
    }

    fn child_fd(&self, fd: Fd) -> Result<Fd> {
        self.fds.lock().get(fd).copied()
    }

    fn check_aligned(&self, buf_len: usize, offset: u64) -> Result<()> {
        if offset % self.block_size as u64 != 0 {
            return Err(LayerError::InvalidArgument("offset not on an encryption unit boundary"));
        }
        if buf_len % AES_BLOCK != 0 {
            return Err(LayerError::InvalidArgument("length not a multiple of the cipher block"));
        }
        Ok(())
    }

    /// Initial tweak for the data unit containing `offset`.
    fn unit_tweak(&self, offset: u64) -> [u8; AES_BLOCK] {
        let unit = offset / self.block_size as u64;
        let mut tweak = [0u8; AES_BLOCK];
        tweak[..8].copy_from_slice(&unit.to_le_bytes());
        let mut block = GenericArray::clone_from_slice(&tweak);
        self.tweak_cipher.encrypt_block(&mut block);
        tweak.copy_from_slice(&block);
        tweak
    }

    /// XTS over `data` starting at file position `offset`.
    fn transform(&self, data: &mut [u8], offset: u64, encrypt: bool) {
        let unit_blocks = self.block_size / AES_BLOCK;
        let mut tweak = self.unit_tweak(offset);
        let mut block_in_unit = 0usize;
        let mut unit = offset / self.block_size as u64;

        for chunk in data.chunks_exact_mut(AES_BLOCK) {
            if block_in_unit == unit_blocks {
                unit += 1;
                tweak = self.unit_tweak(unit * self.block_size as u64);
                block_in_unit = 0;
            }

            for (b, t) in chunk.iter_mut().zip(tweak.iter()) {
                *b ^= t;
            }
            let mut block = GenericArray::clone_from_slice(chunk);
            if encrypt {
                self.data_cipher.encrypt_block(&mut block);
            } else {
                self.data_cipher.decrypt_block(&mut block);
            }
            for ((b, out), t) in chunk.iter_mut().zip(block.iter()).zip(tweak.iter()) {
                *b = out ^ t;
            }

            mul_alpha(&mut tweak);
            block_in_unit += 1;
        }
    }
}

/// Fetches a hex-encoded XTS key from `{vault_addr}/v1/{secret_path}`.
fn fetch_vault_key(vault_addr: &str, secret_path: &str, api_key: &str) -> anyhow::Result<Vec<u8>> {
    #[derive(Deserialize)]
    struct VaultResponse {
        data: VaultData,
    }
    #[derive(Deserialize)]
    struct VaultData {
        key: String,
    }

    let url = format!("{}/v1/{}", vault_addr.trim_end_matches('/'), secret_path);
    let response = reqwest::blocking::Client::new()
        .get(&url)
        .header("X-Vault-Token", api_key)
        .send()
        .with_context(|| format!("key fetch from {url} failed"))?
        .error_for_status()
        .with_context(|| format!("key source {url} rejected the request"))?;

    let parsed: VaultResponse =
        response.json().with_context(|| format!("malformed key response from {url}"))?;
    hex::decode(parsed.data.key.trim()).context("key source returned non-hex key material")
}

impl Layer for EncryptionLayer {
    fn kind(&self) -> &'static str {
        "encryption"
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32, ctx: &OpContext) -> Result<Fd> {
        let cfd = self.next.open(path, flags, mode, ctx)?;
        Ok(self.fds.lock().insert(cfd))
    }

    fn close(&self, fd: Fd, ctx: &OpContext) -> Result<()> {
        let cfd = self.fds.lock().remove(fd)?;
        self.next.close(cfd, ctx)
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cfd = self.child_fd(fd)?;
        self.check_aligned(buf.len(), offset)?;

        let got = self.next.pread(cfd, buf, offset, ctx)?;
        // Data written through this layer is cipher-block aligned; anything
        // ragged at end of file never decrypts cleanly, so it is not
        // returned.
        let whole = got - got % AES_BLOCK;
        self.transform(&mut buf[..whole], offset, false);
        Ok(whole)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64, ctx: &OpContext) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cfd = self.child_fd(fd)?;
        self.check_aligned(buf.len(), offset)?;

        let mut sealed = buf.to_vec();
        self.transform(&mut sealed, offset, true);
        self.next.pwrite(cfd, &sealed, offset, ctx)
    }

    fn ftruncate(&self, fd: Fd, length: u64, ctx: &OpContext) -> Result<()> {
        let cfd = self.child_fd(fd)?;
        self.next.ftruncate(cfd, length, ctx)
    }

    fn fstat(&self, fd: Fd, ctx: &OpContext) -> Result<FileStat> {
        let cfd = self.child_fd(fd)?;
        self.next.fstat(cfd, ctx)
    }

    fn lstat(&self, path: &str, ctx: &OpContext) -> Result<FileStat> {
        self.next.lstat(path, ctx)
    }

    fn unlink(&self, path: &str, ctx: &OpContext) -> Result<()> {
        self.next.unlink(path, ctx)
    }

    fn descendant_count(&self) -> usize {
        1 + self.next.descendant_count()
    }
}
