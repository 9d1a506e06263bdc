//! RBL container parsing: the `RBL\0`-magic header format BK72xx firmware
//! images wrap their bootloader/app payloads in.

use crate::codec::{crc16::block_crc_check, crc32};
use crate::error::Error;
use crate::layout::FlashLayout;

pub const MAGIC: &[u8; 4] = b"RBL\0";
pub const HEADER_SIZE: usize = 96;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OtaAlgorithm(u32);

impl OtaAlgorithm {
    pub const NONE: OtaAlgorithm = OtaAlgorithm(0);
    pub const CRYPT_XOR: OtaAlgorithm = OtaAlgorithm(1);
    pub const CRYPT_AES256: OtaAlgorithm = OtaAlgorithm(2);
    pub const COMPRESS_GZIP: OtaAlgorithm = OtaAlgorithm(256);
    pub const COMPRESS_QUICKLZ: OtaAlgorithm = OtaAlgorithm(512);
    pub const COMPRESS_FASTLZ: OtaAlgorithm = OtaAlgorithm(768);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: OtaAlgorithm) -> bool {
        self.0 & flag.0 == flag.0
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub algo: OtaAlgorithm,
    pub timestamp: u32,
    pub name: String,
    pub version: String,
    pub sn: String,
    pub crc32: u32,
    pub hash: u32,
    pub size_raw: u32,
    pub size_package: u32,
    pub info_crc32: u32,
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn clean_c_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

impl Header {
    /// Parses a 96-byte header, validating its self-describing CRC-32 over
    /// everything but the trailing `info_crc32` field.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() != HEADER_SIZE {
            return Err(Error::WrongLength {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        if &data[0..4] != MAGIC {
            return Err(Error::BadContainer(format!(
                "bytestream magic {:02x?} does not match an RBL container magic",
                &data[0..4]
            )));
        }

        let info_crc32 = read_u32(data, 92);
        let calculated = crc32(&data[0..92]);
        if calculated != info_crc32 {
            return Err(Error::BadContainer(format!(
                "header crc32 0x{:08X} does not match calculated header crc32 0x{:08X}",
                info_crc32, calculated
            )));
        }

        Ok(Header {
            algo: OtaAlgorithm(read_u32(data, 4)),
            timestamp: read_u32(data, 8),
            name: clean_c_string(&data[12..28]),
            version: clean_c_string(&data[28..52]),
            sn: clean_c_string(&data[52..76]),
            crc32: read_u32(data, 76),
            hash: read_u32(data, 80),
            size_raw: read_u32(data, 84),
            size_package: read_u32(data, 88),
            info_crc32,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Container {
    pub header: Header,
    /// `None` when the payload's CRC-32 didn't validate; reported to the
    /// caller rather than treated as fatal.
    pub payload: Option<Vec<u8>>,
}

/// Reverses 32-byte-data-plus-CRC-16 interleaving, as used by code
/// partitions under layouts with `with_crc = true`.
///
/// Disambiguates a 2-byte shift some dumps carry (observed when the
/// interleaving starts mid-block) by trying both alignments against the
/// first block's checksum before committing to one.
pub fn destripe_32_2(data: &[u8]) -> Vec<u8> {
    let mut start = 0usize;
    if data.len() >= 36 {
        if block_crc_check(&data[0..32], [data[32], data[33]]) {
            start = 0;
        } else if block_crc_check(&data[2..34], [data[34], data[35]]) {
            start = 2;
        }
    }

    let mut out = Vec::with_capacity(data.len() / 34 * 32);
    let mut i = start;
    while i + 32 <= data.len() {
        out.extend_from_slice(&data[i..i + 32]);
        i += 34;
    }
    out
}

/// Scans `data` for every occurrence of the RBL magic.
pub fn scan_containers(data: &[u8]) -> Vec<usize> {
    let mut indices = Vec::new();
    if data.len() < MAGIC.len() {
        return indices;
    }
    for i in 0..=data.len() - MAGIC.len() {
        if &data[i..i + MAGIC.len()] == MAGIC {
            indices.push(i);
        }
    }
    indices
}

/// Bytes a 96-byte header occupies on the wire once 32+2 CRC interleaving
/// is applied (three full 32-byte blocks, each followed by a 2-byte CRC).
const HEADER_CRC_OVERHEAD: usize = (HEADER_SIZE / 32) * 2;

/// Parses one RBL container starting at `offset` within `data`.
///
/// When `layout` names a `with_crc` layout, the header is first
/// de-interleaved via [`destripe_32_2`]; otherwise it's read directly.
///
/// The payload's position depends on whether a layout is given at all, not
/// just on `with_crc`. With no layout, the payload follows the header
/// directly (a bare RBL file). With a layout, the header actually sits at
/// the *end* of its named partition: the payload occupies the partition's
/// remaining bytes immediately *before* the header, so it's located by
/// seeking backward `partition.size` bytes from just past the header
/// rather than forward from just after it. This mirrors
/// `__create_bytestream_for_layout` in the original dissector, including
/// its fixed `header + crc` advance regardless of the destripe shift.
pub fn parse_container(data: &[u8], offset: usize, layout: Option<&FlashLayout>) -> Result<Container, Error> {
    let with_crc = layout.map(|l| l.with_crc).unwrap_or(false);

    let header = if with_crc {
        let destriped = destripe_32_2(&data[offset..]);
        if destriped.len() < HEADER_SIZE {
            return Err(Error::BadContainer("truncated RBL header".into()));
        }
        Header::from_bytes(&destriped[..HEADER_SIZE])?
    } else {
        if data.len() < offset + HEADER_SIZE {
            return Err(Error::BadContainer("truncated RBL header".into()));
        }
        Header::from_bytes(&data[offset..offset + HEADER_SIZE])?
    };

    let size_package = header.size_package as usize;

    let payload_raw = match layout {
        None => {
            let payload_start = offset + HEADER_SIZE;
            let payload_end = (payload_start + size_package).min(data.len());
            data[payload_start..payload_end].to_vec()
        }
        Some(layout) => {
            let partition = layout.partition(&header.name).ok_or_else(|| {
                Error::BadContainer(format!("no partition named '{}' in flash layout '{}'", header.name, layout.name))
            })?;
            let header_overhead = HEADER_SIZE + if with_crc { HEADER_CRC_OVERHEAD } else { 0 };
            let package_read_bytes = (partition.size as usize).checked_sub(header_overhead).ok_or_else(|| {
                Error::BadContainer(format!("partition '{}' is smaller than an RBL header", header.name))
            })?;
            let payload_start = offset.checked_sub(package_read_bytes).ok_or_else(|| {
                Error::BadContainer(format!(
                    "partition '{}' extends before the start of the dump",
                    header.name
                ))
            })?;
            let raw = &data[payload_start..offset];
            if with_crc {
                let destriped = destripe_32_2(raw);
                destriped[..size_package.min(destriped.len())].to_vec()
            } else {
                raw[..size_package.min(raw.len())].to_vec()
            }
        }
    };

    let mut payload = payload_raw;
    if header.algo == OtaAlgorithm::NONE {
        let padding = header.size_package.saturating_sub(header.size_raw) as usize;
        let raw_len = (header.size_raw as usize).min(payload.len());
        payload.truncate(raw_len);
        if padding > 0 && padding <= u8::MAX as usize {
            payload.extend(std::iter::repeat(padding as u8).take(padding));
        }
    }

    let payload = if crc32(&payload) == header.crc32 {
        Some(payload)
    } else {
        None
    };

    Ok(Container { header, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header_bytes(name: &str, size_raw: u32, size_package: u32, payload_crc: u32) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&0u32.to_le_bytes()); // algo NONE
        buf[8..12].copy_from_slice(&0u32.to_le_bytes()); // timestamp
        let name_bytes = name.as_bytes();
        buf[12..12 + name_bytes.len()].copy_from_slice(name_bytes);
        buf[76..80].copy_from_slice(&payload_crc.to_le_bytes());
        buf[84..88].copy_from_slice(&size_raw.to_le_bytes());
        buf[88..92].copy_from_slice(&size_package.to_le_bytes());
        let crc = crc32(&buf[0..92]);
        buf[92..96].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    #[test]
    fn it_should_round_trip_a_header_without_crc_interleaving() {
        let payload = vec![0x11u8; 8];
        let payload_crc = crc32(&payload);
        let header_bytes = build_header_bytes("app", 8, 8, payload_crc);

        let mut image = header_bytes;
        image.extend_from_slice(&payload);

        let container = parse_container(&image, 0, None).unwrap();
        assert_eq!(container.header.name, "app");
        assert_eq!(container.payload.unwrap(), vec![0x11u8; 8]);
    }

    #[test]
    fn it_should_report_none_payload_on_crc_mismatch() {
        let header_bytes = build_header_bytes("app", 4, 4, 0xDEAD_BEEF);
        let mut image = header_bytes;
        image.extend_from_slice(&[0xAAu8; 4]);

        let container = parse_container(&image, 0, None).unwrap();
        assert!(container.payload.is_none());
    }

    #[test]
    fn it_should_find_all_magic_occurrences() {
        let mut image = vec![0u8; 10];
        image.extend_from_slice(MAGIC);
        image.extend_from_slice(&[0u8; 5]);
        image.extend_from_slice(MAGIC);

        let indices = scan_containers(&image);
        assert_eq!(indices, vec![10, 19]);
    }

    #[test]
    fn it_should_destripe_32_2_blocks_cleanly_aligned() {
        let block = [0x7Au8; 32];
        let crc = crate::codec::crc16::crc16(&block, 0xFFFF);
        let mut raw = block.to_vec();
        raw.extend_from_slice(&crc.to_be_bytes());
        raw.extend_from_slice(&block);
        raw.extend_from_slice(&crc.to_be_bytes());

        let out = destripe_32_2(&raw);
        assert_eq!(out.len(), 64);
        assert_eq!(&out[0..32], &block[..]);
        assert_eq!(&out[32..64], &block[..]);
    }

    fn stripe_32_2(clean: &[u8]) -> Vec<u8> {
        assert_eq!(clean.len() % 32, 0);
        let mut out = Vec::with_capacity(clean.len() / 32 * 34);
        for block in clean.chunks(32) {
            out.extend_from_slice(block);
            let crc = crate::codec::crc16::crc16(block, 0xFFFF);
            out.extend_from_slice(&crc.to_be_bytes());
        }
        out
    }

    #[test]
    fn it_should_locate_payload_backward_from_header_within_a_partition() {
        use crate::layout::{FlashLayout, FlashPartition};

        // No CRC interleaving: payload occupies the partition bytes
        // immediately preceding the header.
        let layout = FlashLayout {
            name: "test",
            with_crc: false,
            partitions: &[FlashPartition {
                name: "app",
                size: 128,
                start_address: 0,
                mapped_address: 0,
            }],
        };

        let payload = vec![0x42u8; 32];
        let payload_crc = crc32(&payload);
        let header_bytes = build_header_bytes("app", 32, 32, payload_crc);

        let mut image = payload.clone();
        image.extend_from_slice(&header_bytes);
        let offset = payload.len();

        let container = parse_container(&image, offset, Some(&layout)).unwrap();
        assert_eq!(container.payload.unwrap(), payload);
    }

    #[test]
    fn it_should_locate_and_destripe_payload_backward_within_a_crc_partition() {
        use crate::layout::{FlashLayout, FlashPartition};

        let layout = FlashLayout {
            name: "test",
            with_crc: true,
            partitions: &[FlashPartition {
                name: "app",
                size: (HEADER_SIZE + HEADER_CRC_OVERHEAD + 68) as u32,
                start_address: 0,
                mapped_address: 0,
            }],
        };

        let payload = vec![0x99u8; 64];
        let payload_crc = crc32(&payload);
        let header_bytes = build_header_bytes("app", 64, 64, payload_crc);

        let mut image = stripe_32_2(&payload);
        image.extend_from_slice(&stripe_32_2(&header_bytes));
        let offset = image.len() - stripe_32_2(&header_bytes).len();

        let container = parse_container(&image, offset, Some(&layout)).unwrap();
        assert_eq!(container.payload.unwrap(), payload);
    }
}
