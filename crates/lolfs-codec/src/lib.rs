#![forbid(unsafe_code)]
//! Per-block compression and encryption.
//!
//! Stateless with respect to the filesystem: callers pass the algorithm
//! id, the key and the logical block number. The write pipeline is
//! compress-then-encrypt; reads invert it.
//!
//! IV/tweak derivation: the logical block number is serialized
//! little-endian into the first 8 bytes of a zero-padded IV of the
//! algorithm's native size (a 16-byte tweak for AES-XTS, a 12-byte nonce
//! for ChaCha20). AES-256-XTS wants two 32-byte key halves; the 32-byte
//! master key is replicated into both.

use aes::cipher::KeyInit;
use aes::Aes256;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lolfs_error::{LolfsError, Result};
use lolfs_types::{BLOCK_SIZE, CompAlgo, EncAlgo};
use std::io::{Read, Write};
use xts_mode::{get_tweak_default, Xts128};

/// Compression is kept only when the output is below this fraction of the
/// input: saved space must clear a 5 % threshold.
const COMP_KEEP_NUM: usize = 95;
const COMP_KEEP_DEN: usize = 100;

// ── Compression ─────────────────────────────────────────────────────────────

/// Compress one block of plaintext.
///
/// Returns `None` when the algorithm is `None` or the result would not
/// clear the 5 % savings threshold; the caller then stores the block raw.
pub fn compress(algo: CompAlgo, src: &[u8]) -> Result<Option<Vec<u8>>> {
    let compressed = match algo {
        CompAlgo::None => return Ok(None),
        CompAlgo::Lz4 => lz4::block::compress(src, None, false)
            .map_err(|e| LolfsError::Format(format!("lz4 compression failed: {e}")))?,
        CompAlgo::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(src)?;
            encoder.finish()?
        }
        CompAlgo::Zstd => zstd::stream::encode_all(src, 3)
            .map_err(|e| LolfsError::Format(format!("zstd compression failed: {e}")))?,
    };

    if compressed.len() < src.len() * COMP_KEEP_NUM / COMP_KEEP_DEN {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Decompress exactly `src` back into an `expected`-byte block.
pub fn decompress(algo: CompAlgo, src: &[u8], expected: usize) -> Result<Vec<u8>> {
    let out = match algo {
        CompAlgo::None => {
            return Err(LolfsError::Format(
                "cannot decompress with algorithm none".into(),
            ));
        }
        CompAlgo::Lz4 => lz4::block::decompress(src, Some(expected as i32))
            .map_err(|e| LolfsError::Format(format!("lz4 decompression failed: {e}")))?,
        CompAlgo::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(src);
            let mut out = Vec::with_capacity(expected);
            decoder.read_to_end(&mut out)?;
            out
        }
        CompAlgo::Zstd => zstd::stream::decode_all(src)
            .map_err(|e| LolfsError::Format(format!("zstd decompression failed: {e}")))?,
    };

    if out.len() != expected {
        return Err(LolfsError::Format(format!(
            "decompressed size mismatch: {} != {expected}",
            out.len()
        )));
    }
    Ok(out)
}

// ── Encryption ──────────────────────────────────────────────────────────────

fn aes_xts(key: &[u8; 32]) -> Result<Xts128<Aes256>> {
    let data_cipher = Aes256::new_from_slice(key)
        .map_err(|_| LolfsError::Format("bad AES key length".into()))?;
    let tweak_cipher = Aes256::new_from_slice(key)
        .map_err(|_| LolfsError::Format("bad AES key length".into()))?;
    Ok(Xts128::new(data_cipher, tweak_cipher))
}

fn chacha_nonce(block_num: u64) -> Nonce {
    let mut nonce = [0_u8; 12];
    nonce[..8].copy_from_slice(&block_num.to_le_bytes());
    Nonce::from(nonce)
}

/// Encrypt exactly one 4 KiB block.
///
/// AES-256-XTS is size-preserving; ChaCha20-Poly1305 appends its 16-byte
/// authentication tag to the output.
pub fn encrypt_block(
    algo: EncAlgo,
    key: &[u8; 32],
    block_num: u64,
    src: &[u8],
) -> Result<Vec<u8>> {
    if src.len() != BLOCK_SIZE as usize {
        return Err(LolfsError::Format(format!(
            "encrypt input must be {BLOCK_SIZE} bytes, got {}",
            src.len()
        )));
    }

    match algo {
        EncAlgo::None => Err(LolfsError::Format(
            "cannot encrypt with algorithm none".into(),
        )),
        EncAlgo::Aes256Xts => {
            let cipher = aes_xts(key)?;
            let mut out = src.to_vec();
            cipher.encrypt_area(
                &mut out,
                BLOCK_SIZE as usize,
                u128::from(block_num),
                get_tweak_default,
            );
            Ok(out)
        }
        EncAlgo::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new(key.into());
            cipher
                .encrypt(&chacha_nonce(block_num), src)
                .map_err(|_| LolfsError::AuthFailure)
        }
    }
}

/// Decrypt exactly one block (plus tag for AEAD modes).
///
/// AES-XTS never fails on garbled keys; a wrong key simply yields garbled
/// plaintext. ChaCha20-Poly1305 verifies its tag and reports
/// `AuthFailure` on mismatch.
pub fn decrypt_block(
    algo: EncAlgo,
    key: &[u8; 32],
    block_num: u64,
    src: &[u8],
) -> Result<Vec<u8>> {
    match algo {
        EncAlgo::None => Err(LolfsError::Format(
            "cannot decrypt with algorithm none".into(),
        )),
        EncAlgo::Aes256Xts => {
            if src.len() != BLOCK_SIZE as usize {
                return Err(LolfsError::Format(format!(
                    "decrypt input must be {BLOCK_SIZE} bytes, got {}",
                    src.len()
                )));
            }
            let cipher = aes_xts(key)?;
            let mut out = src.to_vec();
            cipher.decrypt_area(
                &mut out,
                BLOCK_SIZE as usize,
                u128::from(block_num),
                get_tweak_default,
            );
            Ok(out)
        }
        EncAlgo::ChaCha20Poly1305 => {
            if src.len() != BLOCK_SIZE as usize + algo.tag_size() {
                return Err(LolfsError::Format(format!(
                    "decrypt input must be {} bytes, got {}",
                    BLOCK_SIZE as usize + algo.tag_size(),
                    src.len()
                )));
            }
            let cipher = ChaCha20Poly1305::new(key.into());
            cipher
                .decrypt(&chacha_nonce(block_num), src)
                .map_err(|_| LolfsError::AuthFailure)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
