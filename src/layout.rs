//! Static flash partition layouts for known BK72xx firmware builds.

#[derive(Debug, Clone, Copy)]
pub struct FlashPartition {
    pub name: &'static str,
    pub size: u32,
    pub start_address: u32,
    pub mapped_address: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FlashLayout {
    pub name: &'static str,
    pub partitions: &'static [FlashPartition],
    /// Whether this layout's code partitions use 32+2 CRC-16 interleaving.
    pub with_crc: bool,
}

impl FlashLayout {
    pub fn partition(&self, name: &str) -> Option<&'static FlashPartition> {
        self.partitions.iter().find(|p| p.name == name)
    }
}

pub const OTA_1: FlashLayout = FlashLayout {
    name: "ota_1",
    with_crc: true,
    partitions: &[
        FlashPartition {
            name: "bootloader",
            size: 68 * 1024,
            start_address: 0x0000_0000,
            mapped_address: 0x0000_0000,
        },
        FlashPartition {
            name: "app",
            size: 1_150_832,
            start_address: 0x0001_1000,
            mapped_address: 0x0001_0000,
        },
    ],
};

/// All known named layouts, looked up by name from the CLI.
pub const KNOWN_LAYOUTS: &[FlashLayout] = &[OTA_1];

pub fn layout_by_name(name: &str) -> Option<&'static FlashLayout> {
    KNOWN_LAYOUTS.iter().find(|l| l.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_find_ota_1_layout_by_name() {
        let layout = layout_by_name("ota_1").unwrap();
        assert_eq!(layout.partitions.len(), 2);
        assert!(layout.with_crc);
    }

    #[test]
    fn it_should_find_app_partition_within_ota_1() {
        let layout = layout_by_name("ota_1").unwrap();
        let app = layout.partition("app").unwrap();
        assert_eq!(app.start_address, 0x11000);
        assert_eq!(app.mapped_address, 0x10000);
        assert_eq!(app.size, 1_150_832);
    }

    #[test]
    fn it_should_return_none_for_unknown_layout() {
        assert!(layout_by_name("not_a_layout").is_none());
    }
}
