use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

/// The literal master key used to encrypt the KV storage key block.
///
/// This is the fixed 16-byte ASCII key every BK72xx KV store's key block is
/// encrypted under, regardless of device.
pub const MASTER_KEY: &[u8; 16] = b"qwertyuiopasdfgh";

const KEY_PART_1: &[u8; 7] = b"8710_2M";
const KEY_PART_2: &[u8; 16] = b"HHRRQbyemofrtytf";

/// Derives the per-storage AES-128 data key from the 16-byte inner key that
/// was recovered by decrypting the key block with [`MASTER_KEY`].
///
/// `data_key[i] = (KEY_PART_1[i & 3] + KEY_PART_2[i] + inner_key[i]) mod
/// 256`.
pub fn derive_data_key(inner_key: &[u8; 16]) -> [u8; 16] {
    let mut data_key = [0u8; 16];
    for i in 0..16 {
        let part1 = KEY_PART_1[i & 3] as u32;
        let part2 = KEY_PART_2[i] as u32;
        let inner = inner_key[i] as u32;
        data_key[i] = ((part1 + part2 + inner) % 256) as u8;
    }
    data_key
}

/// Decrypts `data` in place under AES-128-ECB with `key`.
///
/// `data`'s length must be a multiple of 16 bytes; each block is decrypted
/// independently, matching the unauthenticated, unchained ECB mode the key
/// and data blocks are stored in.
pub fn ecb_decrypt(key: &[u8; 16], data: &mut [u8]) {
    assert_eq!(data.len() % 16, 0, "ECB data must be block-aligned");
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_mut(16) {
        let block = GenericArray::from_mut_slice(block);
        cipher.decrypt_block(block);
    }
}

/// Encrypts `data` in place under AES-128-ECB with `key`.
pub fn ecb_encrypt(key: &[u8; 16], data: &mut [u8]) {
    assert_eq!(data.len() % 16, 0, "ECB data must be block-aligned");
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_mut(16) {
        let block = GenericArray::from_mut_slice(block);
        cipher.encrypt_block(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_round_trip_ecb_encrypt_decrypt() {
        let key = *MASTER_KEY;
        let mut data = *b"0123456789abcdef0123456789abcdef";
        let original = data;
        ecb_encrypt(&key, &mut data[..32]);
        assert_ne!(&data[..32], &original[..32]);
        ecb_decrypt(&key, &mut data[..32]);
        assert_eq!(&data[..32], &original[..32]);
    }

    #[test]
    fn it_should_derive_stable_data_key() {
        let inner = [0u8; 16];
        let derived = derive_data_key(&inner);
        // part1 + part2 alone, mod 256, with inner all zero.
        let mut expected = [0u8; 16];
        for i in 0..16 {
            let part1 = KEY_PART_1[i & 3] as u32;
            let part2 = KEY_PART_2[i] as u32;
            expected[i] = ((part1 + part2) % 256) as u8;
        }
        assert_eq!(derived, expected);
    }
}
