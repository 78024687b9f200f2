use super::{
    super::signing::PartRecord,
    base64_content_id,
    fixed::{FixedPartEngine, PartPolicy},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt::Write;

pub const MICROSOFT_AZURE: &str = "MicrosoftAzure";

/// Azure block blobs: 2 MiB blocks capped at 4 MiB each, up to 50000 per
/// blob. Block ids are base64 of the zero-padded six-digit part number,
/// and completion submits the ordered block list as XML.
#[derive(Debug, Default)]
pub(super) struct MicrosoftAzure;

impl PartPolicy for MicrosoftAzure {
    const RESIDENCE: &'static str = MICROSOFT_AZURE;
    const DEFAULT_PART_SIZE: u64 = 2 * 1024 * 1024;
    const MAX_PARTS: u64 = 50000;
    const PART_SIZE_CAP: u64 = 4 * 1024 * 1024;
    const SIZE_LIMIT_MESSAGE: &'static str = "file exceeds maximum size of 195GB";
    const SENDS_PART_DATA: bool = false;

    fn content_id(record: &PartRecord) -> String {
        base64_content_id(record)
    }

    fn manifest(engine: &FixedPartEngine<Self>) -> Vec<u8> {
        let part_size = engine.part_size();
        let parts = engine.core().size().div_euclid(part_size)
            + u64::from(engine.core().size() % part_size != 0);
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for part in 1..=parts {
            write!(xml, "<Latest>{}</Latest>", block_id(part)).ok();
        }
        xml.push_str("</BlockList>");
        xml.into_bytes()
    }
}

/// Base64 of the part number zero-padded to six digits, the fixed-width
/// block id format Azure requires.
pub(super) fn block_id(part: u64) -> String {
    STANDARD.encode(format!("{:06}", part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_is_padded_base64() {
        assert_eq!(block_id(1), "MDAwMDAx");
        assert_eq!(block_id(142), "MDAwMTQy");
    }

    #[test]
    fn test_block_ids_share_width() {
        assert_eq!(block_id(1).len(), block_id(49999).len());
    }
}
