use crate::model::error::{Error, KmsError, KmsErrorKind, KmsResult};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const AES_BLOCK_SIZE: usize = 16;

/// Published per version KMS key material
pub const V4_KEY: [u8; 16] = [
    0x05, 0x3D, 0x83, 0x07, 0xF9, 0xE5, 0xF0, 0x88, 0xEB, 0x5E, 0xA6, 0x68, 0x6C, 0xF0, 0x37, 0xC7,
];
pub const V5_KEY: [u8; 16] = [
    0xCD, 0x7E, 0x79, 0x6F, 0x2A, 0xB2, 0x5D, 0xCB, 0x55, 0xFF, 0xC8, 0xEF, 0x83, 0x64, 0xC4, 0x70,
];
pub const V6_KEY: [u8; 16] = [
    0xA9, 0x4A, 0x41, 0x95, 0xE2, 0x01, 0x43, 0x2D, 0x9B, 0xCB, 0x46, 0x04, 0x05, 0xD8, 0x4A, 0x21,
];

type HmacSha256 = Hmac<Sha256>;

/// Byte count padding to the AES block size;
/// an already aligned buffer gains a full 0x10 block
pub fn pad(data: &mut Vec<u8>) {
    let pad = AES_BLOCK_SIZE - (data.len() % AES_BLOCK_SIZE);
    data.resize(data.len() + pad, pad as u8);
}

/// Strip and validate the byte count padding
pub fn unpad(data: &mut Vec<u8>) -> KmsResult<()> {
    let pad = *data.last().ok_or_else(|| {
        Error::KmsError(KmsError::new(KmsErrorKind::MalformedField, "empty buffer"))
    })? as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE || pad > data.len() {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::MalformedField,
            "invalid padding length",
        )));
    }
    if data[data.len() - pad..].iter().any(|byte| *byte as usize != pad) {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::MalformedField,
            "invalid padding bytes",
        )));
    }
    data.truncate(data.len() - pad);
    Ok(())
}

fn check_aligned(data: &[u8]) -> KmsResult<()> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::InvalidSize,
            "buffer is not block aligned",
        )));
    }
    Ok(())
}

/// In place AES-128-CBC encryption with an explicit IV
pub fn cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> KmsResult<()> {
    check_aligned(data)?;
    let cipher = Aes128::new(key.into());
    let mut chain = *iv;
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        for (byte, prev) in block.iter_mut().zip(chain.iter()) {
            *byte ^= prev;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        chain.copy_from_slice(block);
    }
    Ok(())
}

/// In place AES-128-CBC decryption with an explicit IV
pub fn cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> KmsResult<()> {
    check_aligned(data)?;
    let cipher = Aes128::new(key.into());
    let mut chain = *iv;
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        let mut saved = [0u8; AES_BLOCK_SIZE];
        saved.copy_from_slice(block);
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        for (byte, prev) in block.iter_mut().zip(chain.iter()) {
            *byte ^= prev;
        }
        chain = saved;
    }
    Ok(())
}

/// The V4 message hash: a zero IV AES chain over the body,
/// `state = AES(key, state XOR block)` per block, final state
/// is the 16 byte hash
pub fn chained_hash(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut state = [0u8; AES_BLOCK_SIZE];
    for chunk in data.chunks(AES_BLOCK_SIZE) {
        let mut block = [0u8; AES_BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        for (byte, prev) in block.iter_mut().zip(state.iter()) {
            *byte ^= prev;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        state = block;
    }
    state
}

/// The V6 HMAC key: the high 8 bytes of the response salt
/// concatenated with the request filetime, encrypted once
/// under the V6 key
pub fn derive_hmac_key(salt: &[u8; 16], request_time: u64) -> [u8; 16] {
    let mut block = [0u8; AES_BLOCK_SIZE];
    block[..8].copy_from_slice(&salt[8..]);
    block[8..].copy_from_slice(&request_time.to_le_bytes());
    let cipher = Aes128::new((&V6_KEY).into());
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
    block
}

/// Full 32 byte HMAC-SHA256 tag over a response body
pub fn hmac_tag(key: &[u8; 16], data: &[u8]) -> KmsResult<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| {
        Error::KmsError(KmsError::new(KmsErrorKind::InvalidSize, "invalid HMAC key"))
    })?;
    mac.update(data);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}
