use super::{
    super::{
        error::{ErrorKind, UploadError, UploadResult},
        signing::{PartRecord, SigningResponse},
    },
    base64_content_id,
    fixed::{FixedPartEngine, PartPolicy},
};
use serde_json::json;
use std::fmt::Write;

pub const AMAZON_S3: &str = "AmazonS3";

/// Amazon S3 multipart uploads: 5 MiB parts, at most 9999 of them, and a
/// 5 GiB ceiling per part. Completion submits an XML manifest listing
/// every part's number and ETag.
#[derive(Debug, Default)]
pub(super) struct AmazonS3;

impl PartPolicy for AmazonS3 {
    const RESIDENCE: &'static str = AMAZON_S3;
    const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;
    const MAX_PARTS: u64 = 9999;
    const PART_SIZE_CAP: u64 = 5 * 1024 * 1024 * 1024;
    const SIZE_LIMIT_MESSAGE: &'static str = "file exceeds maximum size";
    const SENDS_PART_DATA: bool = true;

    fn content_id(record: &PartRecord) -> String {
        base64_content_id(record)
    }

    fn manifest(engine: &FixedPartEngine<Self>) -> Vec<u8> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for record in engine.core().contiguous_memo_records() {
            write!(
                xml,
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                record.part, record.md5
            )
            .ok();
        }
        xml.push_str("</CompleteMultipartUpload>");
        xml.into_bytes()
    }

    /// The create signature authorizes S3's own create-multipart call;
    /// its XML response carries the provider upload id the signing
    /// server needs for every later part signature.
    fn open_upload(
        engine: &FixedPartEngine<Self>,
        create: &SigningResponse,
        first: &PartRecord,
    ) -> UploadResult<SigningResponse> {
        let response = engine.channel().signed_request(create, None)?;
        let body = String::from_utf8_lossy(response.body());
        let resumable_id = extract_xml_tag(&body, "UploadId").ok_or_else(|| {
            UploadError::with_msg(
                ErrorKind::InvalidResponse,
                "create-multipart response carries no UploadId",
            )
        })?;
        engine.channel().update_status(json!({
            "resumable_id": resumable_id,
            "file_id": Self::content_id(first),
            "part": 1,
        }))
    }

    fn merge_recovered(engine: &FixedPartEngine<Self>, recovered: &SigningResponse) {
        if let Some(part_list) = recovered.part_list.as_deref() {
            engine.core().seed_pending(part_list.iter().copied());
        }
        if let Some(part_data) = recovered.part_data.as_ref() {
            for record in part_data.values() {
                engine.core().insert_memo(record.to_owned());
            }
        }
    }
}

fn extract_xml_tag<'x>(xml: &'x str, tag: &str) -> Option<&'x str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}
