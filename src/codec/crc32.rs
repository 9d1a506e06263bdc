/// Calculates the CRC-32 checksum for the given slice of `bytes`.
///
/// Standard IEEE CRC-32: polynomial `0xEDB88320` (reflected), initial value
/// `0xFFFFFFFF`, xorout `0xFFFFFFFF`. No lookup table — matches the
/// teacher crate's own hand-rolled `crc32` (present twice there, in
/// `bl60x.rs` and `bl/firmware.rs`), and the spec's explicit non-goal of a
/// general-purpose CRC library.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32_update(0xFFFFFFFF, bytes) ^ 0xFFFFFFFF
}

/// Continues a CRC-32 computation from a prior raw (non-finalized) state.
///
/// Used by the flash-program loop, which accumulates a running CRC across
/// many 4 KiB chunks and only finalizes (xors with `0xFFFFFFFF`) once, at
/// the end, after padding.
pub fn crc32_update(mut crc: u32, bytes: &[u8]) -> u32 {
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Finalizes a running CRC-32 state obtained from repeated `crc32_update`
/// calls starting at `0xFFFFFFFF`.
pub fn crc32_finalize(crc: u32) -> u32 {
    crc ^ 0xFFFFFFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_compute_crc32_of_empty_buffer() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn it_should_compute_crc32_of_all_zero_4096_bytes() {
        let buf = [0u8; 4096];
        assert_eq!(crc32(&buf), 0x8A9136AA);
    }

    #[test]
    fn it_should_compute_crc32_of_all_ff_4096_bytes() {
        let buf = [0xFFu8; 4096];
        assert_eq!(crc32(&buf), 0xF154670A);
    }

    #[test]
    fn it_should_accumulate_running_crc_equivalently_to_one_shot() {
        let a = b"hello ";
        let b = b"world";
        let mut combined = Vec::new();
        combined.extend_from_slice(a);
        combined.extend_from_slice(b);

        let one_shot = crc32(&combined);

        let mut running = 0xFFFFFFFF;
        running = crc32_update(running, a);
        running = crc32_update(running, b);
        let accumulated = crc32_finalize(running);

        assert_eq!(one_shot, accumulated);
    }
}
