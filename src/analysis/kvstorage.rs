//! Parser for the BK72xx "easyflash"-style key/value storage partition:
//! an AES-ECB-encrypted key block followed by one or more data blocks of
//! index and data pages.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::codec::aes::{derive_data_key, ecb_decrypt, MASTER_KEY};
use crate::error::Error;

const MAGIC_KEY: u32 = 0x1357_9753;
const MAGIC_DATA_1: u32 = 0x9876_1234;
const MAGIC_DATA_2: u32 = 0x1357_26AB;

const BLOCK_SIZE: usize = 4096;
const PAGE_SIZE: usize = 128;
const PAGES_PER_BLOCK: usize = BLOCK_SIZE / PAGE_SIZE - 1;

const ASCII_PRINTABLE: std::ops::RangeInclusive<u8> = 32..=127;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

#[derive(Debug, Clone)]
struct IndexPart {
    block_id: u16,
    page_id_start: u8,
    page_id_end: u8,
}

#[derive(Debug, Clone)]
pub struct IndexPage {
    pub block_id: u16,
    pub page_id: u8,
    pub length: u32,
    pub name: String,
    parts: Vec<IndexPart>,
}

#[derive(Debug, Clone)]
enum Page {
    Data([u8; PAGE_SIZE]),
    Index(IndexPage),
}

struct DataBlock {
    block_id: u16,
    pages: Vec<Page>,
}

fn parse_index_page(raw: &[u8], block_id: u16, page_id: u8) -> Result<IndexPage, Error> {
    if raw.len() != PAGE_SIZE {
        return Err(Error::WrongLength {
            expected: PAGE_SIZE,
            actual: raw.len(),
        });
    }
    let length = read_u32(raw, 4);
    let page_block_id = read_u16(raw, 8);
    let page_id_field = raw[10];
    let parts_size = read_u16(raw, 11) as usize;
    let name_len = raw[17] as usize;

    if page_block_id != block_id || page_id_field != page_id {
        return Err(Error::CorruptStorage(format!(
            "index page block/page ID mismatch: block_id={} page_id={} (expected {}/{})",
            page_block_id, page_id_field, block_id, page_id
        )));
    }

    let name_start = 18;
    let name_end = name_start + name_len;
    if name_end > raw.len() {
        return Err(Error::CorruptStorage("index page name overruns page".into()));
    }
    let name = String::from_utf8_lossy(&raw[name_start..name_end])
        .trim_end_matches('\0')
        .to_string();

    let parts_start = name_end;
    let parts_end = parts_start + parts_size * 4;
    if parts_end > raw.len() {
        return Err(Error::CorruptStorage("index page parts overrun page".into()));
    }
    let mut parts = Vec::with_capacity(parts_size);
    for i in 0..parts_size {
        let base = parts_start + i * 4;
        parts.push(IndexPart {
            block_id: read_u16(raw, base),
            page_id_start: raw[base + 2],
            page_id_end: raw[base + 3],
        });
    }

    Ok(IndexPage {
        block_id: page_block_id,
        page_id: page_id_field,
        length,
        name,
        parts,
    })
}

fn parse_data_block(decrypted: &[u8]) -> Result<DataBlock, Error> {
    let magic = read_u32(decrypted, 0);
    if magic != MAGIC_DATA_1 && magic != MAGIC_DATA_2 {
        return Err(Error::CorruptStorage(format!("bad data block magic 0x{:08X}", magic)));
    }
    let stored_checksum = read_u32(decrypted, 4);
    let calculated = checksum(&decrypted[8..]);
    if stored_checksum != calculated {
        return Err(Error::CorruptStorage(format!(
            "data block checksum mismatch: stored 0x{:08X}, calculated 0x{:08X}",
            stored_checksum, calculated
        )));
    }

    let block_id = read_u16(decrypted, 8);
    let map_size = decrypted[14] as usize;
    let map_data = &decrypted[15..15 + map_size];

    let mut pages = Vec::with_capacity(PAGES_PER_BLOCK);
    for i in 0..PAGES_PER_BLOCK {
        let page_num = i + 1;
        let is_index = map_data
            .get(page_num / 8)
            .map(|byte| byte & (1 << (page_num % 8)) != 0)
            .unwrap_or(false);

        let start = BLOCK_SIZE - PAGES_PER_BLOCK * PAGE_SIZE + i * PAGE_SIZE;
        let raw = &decrypted[start..start + PAGE_SIZE];

        if is_index {
            pages.push(Page::Index(parse_index_page(raw, block_id, page_num as u8)?));
        } else {
            let mut buf = [0u8; PAGE_SIZE];
            buf.copy_from_slice(raw);
            pages.push(Page::Data(buf));
        }
    }

    Ok(DataBlock { block_id, pages })
}

/// A decoded KV storage partition: one key block and a set of data blocks,
/// flattened into a name-to-index lookup for reading values back out.
pub struct KvStorage {
    blocks: BTreeMap<u16, DataBlock>,
    indexes: BTreeMap<String, (u16, u8)>,
}

impl KvStorage {
    /// Decrypts and parses a KV storage dump starting at its key block.
    ///
    /// `data` must start exactly at the key block (use [`find_storage`] to
    /// locate it within a larger firmware dump first).
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < BLOCK_SIZE {
            return Err(Error::WrongLength {
                expected: BLOCK_SIZE,
                actual: data.len(),
            });
        }

        let mut key_block = data[0..BLOCK_SIZE].to_vec();
        ecb_decrypt(MASTER_KEY, &mut key_block);

        let magic = read_u32(&key_block, 0);
        if magic != MAGIC_KEY {
            return Err(Error::CorruptStorage(format!("bad key block magic 0x{:08X}", magic)));
        }
        let stored_checksum = read_u32(&key_block, 4);
        let inner_key: [u8; 16] = key_block[8..24].try_into().unwrap();
        if checksum(&inner_key) != stored_checksum {
            return Err(Error::CorruptStorage("key block checksum mismatch".into()));
        }

        let data_key = derive_data_key(&inner_key);

        let mut blocks = BTreeMap::new();
        let mut indexes = BTreeMap::new();

        let mut offset = BLOCK_SIZE;
        while offset + BLOCK_SIZE <= data.len() {
            let mut raw = data[offset..offset + BLOCK_SIZE].to_vec();
            ecb_decrypt(&data_key, &mut raw);
            offset += BLOCK_SIZE;

            let block = match parse_data_block(&raw) {
                Ok(block) => block,
                Err(_) => continue,
            };
            let block_id = block.block_id;
            if blocks.contains_key(&block_id) {
                // a swap block: keep the first occurrence only.
                continue;
            }

            for page in &block.pages {
                if let Page::Index(index) = page {
                    if indexes.contains_key(&index.name) {
                        log::warn!("duplicate index for '{}' in block {}", index.name, block_id);
                    }
                    indexes
                        .entry(index.name.clone())
                        .or_insert((block_id, index.page_id));
                }
            }
            blocks.insert(block_id, block);
        }

        Ok(KvStorage { blocks, indexes })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(|s| s.as_str())
    }

    fn index_page(&self, name: &str) -> Option<&IndexPage> {
        let (block_id, page_id) = self.indexes.get(name)?;
        self.blocks.get(block_id).and_then(|block| {
            block.pages.iter().find_map(|page| match page {
                Page::Index(index) if index.page_id == *page_id => Some(index),
                _ => None,
            })
        })
    }

    /// Reassembles the raw value bytes for `name` from its index page's
    /// referenced data pages.
    pub fn read_value(&self, name: &str) -> Result<Vec<u8>, Error> {
        let index = self
            .index_page(name)
            .ok_or_else(|| Error::CorruptStorage(format!("no such key: {}", name)))?;

        let mut value = Vec::new();
        for part in &index.parts {
            let block = self
                .blocks
                .get(&part.block_id)
                .ok_or_else(|| Error::CorruptStorage(format!("block {} does not exist", part.block_id)))?;
            for page_id in part.page_id_start..=part.page_id_end {
                let page = block
                    .pages
                    .get(page_id as usize - 1)
                    .ok_or_else(|| Error::CorruptStorage(format!("page {} does not exist", page_id)))?;
                match page {
                    Page::Data(raw) => value.extend_from_slice(raw),
                    Page::Index(_) => {
                        return Err(Error::CorruptStorage(format!("page {} is an index page, not data", page_id)))
                    }
                }
            }
        }
        value.truncate(index.length as usize);
        Ok(value)
    }

    /// Reads a value and, where possible, decodes it as JSON or text.
    pub fn read_value_parsed(&self, name: &str) -> Result<Value, Error> {
        let raw = self.read_value(name)?;
        let trimmed_end = raw.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
        let raw = &raw[..trimmed_end];

        if !raw.iter().all(|b| ASCII_PRINTABLE.contains(b) || *b == b'\r' || *b == b'\n') {
            return Ok(Value::String(format!("HEX:{}", hex_encode(raw))));
        }
        let text = String::from_utf8_lossy(raw).into_owned();

        if let Ok(value) = serde_json::from_str(&text) {
            return Ok(value);
        }
        if name == "user_param_key" {
            if let Some(value) = parse_user_param_key(&text) {
                return Ok(value);
            }
        }
        Ok(Value::String(text))
    }

    pub fn read_all_values(&self) -> BTreeMap<String, Vec<u8>> {
        self.indexes
            .keys()
            .filter_map(|name| self.read_value(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Locates a KV storage partition within a larger firmware dump by finding
/// the key block's characteristic ciphertext: the master key encrypting a
/// run of `0xFF` bytes, which is what an erased flash region decrypts to.
pub fn find_storage(data: &[u8]) -> Option<usize> {
    let mut needle = [0xFFu8; 16];
    crate::codec::aes::ecb_encrypt(MASTER_KEY, &mut needle);

    let pos = data
        .windows(needle.len())
        .position(|window| window == needle)?;
    pos.checked_sub(32)
}

/// Locates Tuya's free-text `user_param_key` blob (a near-JSON string with
/// unquoted keys) inside a firmware dump, independent of the KV storage
/// container itself.
pub fn find_user_param_key(data: &[u8]) -> Option<String> {
    const PATTERNS: &[&[u8]] = &[b",crc:", b",module:", b"Jsonver:"];

    let mut found = None;
    'patterns: for pattern in PATTERNS {
        let mut search_from = 0;
        while let Some(rel) = find_subslice(&data[search_from..], pattern) {
            let pos = search_from + rel;
            let after = pos + pattern.len();
            if data.get(after).copied() != Some(0) {
                found = Some(pos);
                break 'patterns;
            }
            search_from = pos + 1;
        }
    }

    let pos = found?;
    let start = data[..pos].iter().rposition(|&b| b == 0).map(|i| i + 1)?;
    let end = start + find_subslice(&data[start..], b"\0")?;
    Some(String::from_utf8_lossy(&data[start..end]).into_owned())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Turns Tuya's bare-identifier JSON dialect (`{crc:123,module:abc}`) into
/// valid JSON by quoting unquoted tokens and unquoting integers.
pub fn parse_user_param_key(value: &str) -> Option<Value> {
    let word = Regex::new(r"[^{}\[\]:,]+").unwrap();
    let quoted = word.replace_all(value, |caps: &regex::Captures| format!("\"{}\"", &caps[0]));

    let number = Regex::new(r#""([1-9][0-9]*|0)""#).unwrap();
    let unquoted_numbers = number.replace_all(&quoted, "$1");

    let trailing_comma = Regex::new(r",\}").unwrap();
    let cleaned = trailing_comma.replace_all(&unquoted_numbers, "}");

    serde_json::from_str(&cleaned).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_key_block(inner_key: [u8; 16]) -> Vec<u8> {
        let mut plaintext = vec![0u8; BLOCK_SIZE];
        plaintext[0..4].copy_from_slice(&MAGIC_KEY.to_le_bytes());
        let crc = checksum(&inner_key);
        plaintext[4..8].copy_from_slice(&crc.to_le_bytes());
        plaintext[8..24].copy_from_slice(&inner_key);
        crate::codec::aes::ecb_encrypt(MASTER_KEY, &mut plaintext);
        plaintext
    }

    #[test]
    fn it_should_parse_a_key_block_with_no_data_blocks() {
        let inner_key = [0x42u8; 16];
        let dump = build_key_block(inner_key);
        let storage = KvStorage::parse(&dump).unwrap();
        assert_eq!(storage.keys().count(), 0);
    }

    #[test]
    fn it_should_reject_a_key_block_with_bad_checksum() {
        let mut dump = build_key_block([0u8; 16]);
        // corrupt the stored checksum (still ciphertext at this point, so
        // decrypt, tamper, re-encrypt to keep the magic/structure valid).
        ecb_decrypt(MASTER_KEY, &mut dump);
        dump[4] ^= 0xFF;
        crate::codec::aes::ecb_encrypt(MASTER_KEY, &mut dump);

        let err = KvStorage::parse(&dump).unwrap_err();
        assert!(matches!(err, Error::CorruptStorage(_)));
    }

    #[test]
    fn it_should_convert_tuya_bare_identifier_json() {
        let value = parse_user_param_key("{crc:123,module:abc,}").unwrap();
        assert_eq!(value["crc"], 123);
        assert_eq!(value["module"], "abc");
    }

    #[test]
    fn it_should_find_the_storage_magic_and_rewind_to_block_start() {
        let mut needle = [0xFFu8; 16];
        crate::codec::aes::ecb_encrypt(MASTER_KEY, &mut needle);

        let mut dump = vec![0xAAu8; 32];
        dump.extend_from_slice(&needle);

        let pos = find_storage(&dump).unwrap();
        assert_eq!(pos, 0);
    }
}
