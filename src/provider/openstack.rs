use super::{
    super::signing::{PartRecord, SigningResponse},
    fixed::{FixedPartEngine, PartPolicy},
};

pub const OPENSTACK_SWIFT: &str = "OpenStackSwift";

/// OpenStack Swift static large objects: 2 MiB segments, at most 1000 of
/// them, 5 GiB per segment. Each signed part comes back with the segment
/// path Swift stored it under; the completion manifest is a JSON array
/// of those paths with their etags and sizes.
#[derive(Debug, Default)]
pub(super) struct OpenStackSwift;

impl PartPolicy for OpenStackSwift {
    const RESIDENCE: &'static str = OPENSTACK_SWIFT;
    const DEFAULT_PART_SIZE: u64 = 2 * 1024 * 1024;
    const MAX_PARTS: u64 = 1000;
    const PART_SIZE_CAP: u64 = 5 * 1024 * 1024 * 1024;
    const SIZE_LIMIT_MESSAGE: &'static str = "file exceeds maximum size";
    const SENDS_PART_DATA: bool = true;

    /// Swift checks the plain hex digest as the segment's etag.
    fn content_id(record: &PartRecord) -> String {
        record.md5.to_owned()
    }

    fn manifest(engine: &FixedPartEngine<Self>) -> Vec<u8> {
        let manifest: Vec<_> = engine
            .core()
            .contiguous_memo_records()
            .into_iter()
            .map(|record| {
                serde_json::json!({
                    "path": record.path,
                    "etag": record.md5,
                    "size_bytes": record.size_bytes,
                })
            })
            .collect();
        serde_json::to_vec(&manifest).unwrap_or_default()
    }

    /// A recovered record without a path was hashed but never
    /// acknowledged by Swift, so those parts are re-queued for transfer
    /// alongside the server's own outstanding list. Parts the server
    /// does not report at all are committed and stay untouched.
    fn merge_recovered(engine: &FixedPartEngine<Self>, recovered: &SigningResponse) {
        let core = engine.core();
        if let Some(part_data) = recovered.part_data.as_ref() {
            for record in part_data.values() {
                if record.path.is_none() {
                    core.seed_pending([record.part]);
                }
                core.insert_memo(record.to_owned());
            }
        }
        if let Some(part_list) = recovered.part_list.as_deref() {
            core.seed_pending(part_list.iter().copied());
        }
        core.normalize_pending();
    }

    fn note_signed_part(engine: &FixedPartEngine<Self>, part: u64, signed: &SigningResponse) {
        if let Some(path) = signed.path.as_deref() {
            engine.core().set_memo_path(part, path);
        }
    }
}
