use super::{
    cancellation::CancellationToken,
    config::ServiceConfig,
    error::{ErrorKind, UploadError, UploadResult},
    transport::{ProgressCallback, Transport, TransportRequest, TransportResponse},
};
use mime::Mime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, RwLock},
};
use url::form_urlencoded;

/// Upload mode negotiated with the signing server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Single-shot transfer of the whole payload
    DirectUpload,
    /// Freshly created resumable multi-part upload
    ChunkedUpload,
    /// Server already tracks this upload; continue from its part list
    Parts,
    /// Probe the provider for how far a previous stream got
    Status,
    #[serde(other)]
    Unknown,
}

impl UploadStrategy {
    #[inline]
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::DirectUpload)
    }
}

/// Request details for one authorized call against the cloud provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSignature {
    pub verb: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Memoized metadata for a single uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub part: u64,
    /// Lowercase hex MD5 of the part's bytes.
    pub md5: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Provider-assigned storage path, where the provider uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Response from `GET {endpoint}/new`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderIdentity {
    /// Name of the storage provider the server picked for this upload.
    pub residence: String,
}

/// Response shape shared by the create / sign / next-chunk operations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SigningResponse {
    pub upload_id: Option<String>,
    #[serde(rename = "type")]
    pub strategy: Option<UploadStrategy>,
    pub signature: Option<UploadSignature>,
    /// Status code (other than 2xx) the signed request is expected to answer.
    pub expected: Option<u16>,
    /// Server-provided request body for the signed request.
    pub data: Option<JsonValue>,
    /// Provider-assigned storage path for the part just signed.
    pub path: Option<String>,
    pub part_list: Option<Vec<u64>>,
    pub part_data: Option<HashMap<String, PartRecord>>,
}

/// Options for [`SigningChannel::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub file_id: String,
    pub parameters: Option<JsonValue>,
    pub permissions: Option<String>,
    pub public: Option<bool>,
    pub expires: Option<i64>,
}

impl CreateOptions {
    #[inline]
    pub fn with_file_id(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            ..Default::default()
        }
    }
}

/// Identity of the file a channel is negotiating for.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub size: u64,
    pub name: String,
    pub dir_path: Option<String>,
    pub mime: Mime,
}

/// A part reference in a signing request. The finalization round reuses
/// the part slot with the literal `finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartRef {
    Number(u64),
    Finish,
}

impl fmt::Display for PartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(num) => num.fmt(f),
            Self::Finish => f.write_str("finish"),
        }
    }
}

/// Authenticated client for one upload's conversation with the signing
/// server, plus the raw transfers the server authorizes.
///
/// Bound to exactly one upload session. Holds the upload resource id
/// (empty until [`create`](Self::create) succeeds) and the cancellation
/// token shared by every request it issues.
#[derive(Debug)]
pub struct SigningChannel {
    config: Arc<ServiceConfig>,
    transport: Arc<dyn Transport>,
    file: FileInfo,
    params: Mutex<JsonMap<String, JsonValue>>,
    upload_id: RwLock<Option<String>>,
    cancellation: CancellationToken,
}

impl SigningChannel {
    pub fn new(
        config: Arc<ServiceConfig>,
        transport: Arc<dyn Transport>,
        file: FileInfo,
        params: JsonMap<String, JsonValue>,
    ) -> Self {
        Self {
            config,
            transport,
            file,
            params: Mutex::new(params),
            upload_id: RwLock::new(None),
            cancellation: CancellationToken::new(),
        }
    }

    /// The upload resource id, failing before `create()` has assigned one.
    pub fn upload_id(&self) -> UploadResult<String> {
        self.upload_id.read().unwrap().clone().ok_or_else(|| {
            UploadError::with_msg(
                ErrorKind::IllegalState,
                "operation requires an upload resource, call create() first",
            )
        })
    }

    #[inline]
    pub fn has_upload_resource(&self) -> bool {
        self.upload_id.read().unwrap().is_some()
    }

    /// Cancel every request currently sharing the channel's token.
    pub fn abort(&self) {
        self.cancellation.cancel();
    }

    /// Install a fresh cancellation generation before re-entering an
    /// upload that was paused on this channel.
    pub fn renew_cancellation(&self) {
        self.cancellation.renew();
    }

    /// Ask the server which provider this upload should go to.
    pub fn initialise(&self) -> UploadResult<ProviderIdentity> {
        let query = {
            let mut params = self.params.lock().unwrap();
            params.insert("file_size".into(), JsonValue::from(self.file.size.to_string()));
            params.insert("file_name".into(), JsonValue::from(self.file.name.to_owned()));
            if let Some(dir_path) = self.file.dir_path.as_deref().filter(|path| !path.is_empty()) {
                params.insert("file_path".into(), JsonValue::from(dir_path.to_owned()));
            }
            encode_query(&params)
        };
        let url = format!("{}/new?{}", self.endpoint(), query);
        let response = self.call_signing("GET", &url, None)?;
        parse_json(&response)
    }

    /// Create (or re-attach to) the upload resource server-side.
    pub fn create(&self, options: &CreateOptions) -> UploadResult<SigningResponse> {
        let body = {
            let mut params = self.params.lock().unwrap();
            params.insert("file_id".into(), JsonValue::from(options.file_id.to_owned()));
            params.insert("file_mime".into(), JsonValue::from(self.file.mime.to_string()));
            if let Some(parameters) = options.parameters.as_ref() {
                params.insert("parameters".into(), parameters.to_owned());
            }
            if let Some(permissions) = options.permissions.as_deref() {
                params.insert("permissions".into(), JsonValue::from(permissions.to_owned()));
            }
            if let Some(public) = options.public {
                params.insert("public".into(), JsonValue::from(public));
            }
            if let Some(expires) = options.expires {
                params.insert("expires".into(), JsonValue::from(expires));
            }
            serde_json::to_vec(&*params)
                .map_err(|err| UploadError::new(ErrorKind::InvalidResponse, err))?
        };
        let response = self.call_signing("POST", self.endpoint(), Some(body.as_slice()))?;
        let parsed: SigningResponse = parse_json(&response)?;
        if let Some(upload_id) = parsed.upload_id.as_deref() {
            *self.upload_id.write().unwrap() = Some(upload_id.to_owned());
        }
        Ok(parsed)
    }

    /// Request authorization to re-probe or continue a specific part.
    pub fn sign(&self, part: PartRef, part_id: Option<&str>) -> UploadResult<SigningResponse> {
        let upload_id = self.upload_id()?;
        let mut pairs = vec![("part", part.to_string())];
        if let Some(part_id) = part_id {
            pairs.push(("file_id", part_id.to_owned()));
        }
        let url = format!(
            "{}/{}/edit?{}",
            self.endpoint(),
            upload_id,
            encode_pairs(&pairs)
        );
        let response = self.call_signing("GET", &url, None)?;
        parse_json_or_default(&response)
    }

    /// Request the signature for the next chunk, carrying the full
    /// outstanding-part snapshot for crash-resume bookkeeping.
    pub fn sign_next_chunk(
        &self,
        part: u64,
        content_id: &str,
        part_list: &[u64],
        part_data: Option<Vec<PartRecord>>,
    ) -> UploadResult<SigningResponse> {
        let upload_id = self.upload_id()?;
        let pairs = vec![
            ("part", part.to_string()),
            ("file_id", content_id.to_owned()),
            ("file_mime", self.file.mime.to_string()),
        ];
        let url = format!("{}/{}?{}", self.endpoint(), upload_id, encode_pairs(&pairs));
        let mut body = JsonMap::new();
        body.insert("part_list".into(), serde_json::to_value(part_list).unwrap_or_default());
        if let Some(part_data) = part_data {
            body.insert(
                "part_data".into(),
                serde_json::to_value(part_data).unwrap_or_default(),
            );
        }
        let body = serde_json::to_vec(&body)
            .map_err(|err| UploadError::new(ErrorKind::InvalidResponse, err))?;
        let response = self.call_signing("PUT", &url, Some(body.as_slice()))?;
        parse_json_or_default(&response)
    }

    /// Checkpoint or finalization bookkeeping against the upload resource.
    ///
    /// The response is parsed as a [`SigningResponse`] because the ack for
    /// a first-chunk checkpoint carries the first part's transfer
    /// signature.
    pub fn update_status(&self, params: JsonValue) -> UploadResult<SigningResponse> {
        let upload_id = self.upload_id()?;
        let url = format!("{}/{}", self.endpoint(), upload_id);
        let body = serde_json::to_vec(&params)
            .map_err(|err| UploadError::new(ErrorKind::InvalidResponse, err))?;
        let response = self.call_signing("PUT", &url, Some(body.as_slice()))?;
        parse_json_or_default(&response)
    }

    /// Cancel the channel's token and release the server-side resource.
    pub fn destroy(&self) -> UploadResult<()> {
        self.abort();
        self.release()
    }

    /// Release the server-side upload resource, if one was ever created.
    pub fn release(&self) -> UploadResult<()> {
        if let Some(upload_id) = self.upload_id.read().unwrap().as_deref() {
            let url = format!("{}/{}", self.endpoint(), upload_id);
            let headers = self.signing_headers();
            // runs after abort(), so it gets a token-independent guard
            let request = TransportRequest::new("DELETE", &url).headers(&headers);
            let response = self.transport.call(request)?;
            if !response.is_success() {
                return Err(unexpected_status(&response));
            }
        }
        Ok(())
    }

    /// Perform the provider call described by a signature without
    /// progress reporting (manifest submission, status probes).
    pub fn signed_request(
        &self,
        details: &SigningResponse,
        body: Option<&[u8]>,
    ) -> UploadResult<TransportResponse> {
        self.perform_signed_request(details, body, None)
    }

    /// Perform the raw transfer described by a signature, straight to the
    /// cloud endpoint. Resolves on 2xx or the explicitly expected status;
    /// aborting the channel's token rejects with an [`ErrorKind::Aborted`]
    /// reason distinct from transport failure.
    pub fn perform_signed_request(
        &self,
        details: &SigningResponse,
        body: Option<&[u8]>,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> UploadResult<TransportResponse> {
        let signature = details.signature.as_ref().ok_or_else(|| {
            UploadError::with_msg(ErrorKind::InvalidResponse, "response carries no signature")
        })?;

        let mut headers: Vec<(String, String)> = signature
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("content-type"))
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();
        headers.push(("Content-Type".to_owned(), self.file.mime.to_string()));

        let fallback_body = body.is_none().then(|| body_from_data(details)).unwrap_or_default();
        let body = body.unwrap_or(&fallback_body);

        let mut request = TransportRequest::new(&signature.verb, &signature.url)
            .headers(&headers)
            .body(body)
            .cancellation(self.cancellation.guard());
        if let Some(on_progress) = on_progress {
            request = request.on_progress(on_progress);
        }
        let response = self.transport.call(request)?;
        if response.is_success() || Some(response.status()) == details.expected {
            Ok(response)
        } else {
            Err(unexpected_status(&response))
        }
    }

    #[inline]
    fn endpoint(&self) -> &str {
        self.config.endpoint()
    }

    fn signing_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Accept".to_owned(), "application/json".to_owned()),
            ("Content-Type".to_owned(), "application/json".to_owned()),
        ];
        if let Some(credential) = self.config.credential() {
            let (name, value) = credential.header();
            headers.push((name.to_owned(), value));
        }
        headers
    }

    fn call_signing(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
    ) -> UploadResult<TransportResponse> {
        let headers = self.signing_headers();
        let request = TransportRequest::new(method, url)
            .headers(&headers)
            .body(body.unwrap_or_default())
            .cancellation(self.cancellation.guard());
        let response = self.transport.call(request)?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(unexpected_status(&response))
        }
    }
}

fn unexpected_status(response: &TransportResponse) -> UploadError {
    UploadError::with_msg(
        ErrorKind::UnexpectedStatus,
        format!(
            "{}: {}",
            response.status(),
            String::from_utf8_lossy(response.body())
        ),
    )
}

fn parse_json<T: DeserializeOwned>(response: &TransportResponse) -> UploadResult<T> {
    serde_json::from_slice(response.body())
        .map_err(|err| UploadError::new(ErrorKind::InvalidResponse, err))
}

fn parse_json_or_default<T: DeserializeOwned + Default>(
    response: &TransportResponse,
) -> UploadResult<T> {
    if response.body().is_empty() {
        Ok(Default::default())
    } else {
        parse_json(response)
    }
}

fn body_from_data(details: &SigningResponse) -> Vec<u8> {
    match details.data.as_ref() {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::String(text)) => text.to_owned().into_bytes(),
        Some(other) => serde_json::to_vec(other).unwrap_or_default(),
    }
}

fn encode_query(params: &JsonMap<String, JsonValue>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        match value {
            JsonValue::Null => continue,
            JsonValue::String(text) => serializer.append_pair(key, text),
            other => serializer.append_pair(key, &other.to_string()),
        };
    }
    serializer.finish()
}

fn encode_pairs(pairs: &[(&str, String)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{json_response, response_with_headers, FakeTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn test_channel(transport: Arc<FakeTransport>) -> SigningChannel {
        let config = Arc::new(
            crate::ServiceConfig::builder("https://api.test/uploads")
                .bearer_token("secret")
                .build(),
        );
        let file = FileInfo {
            size: 1024,
            name: "report.pdf".to_owned(),
            dir_path: Some("docs".to_owned()),
            mime: "application/pdf".parse().unwrap(),
        };
        SigningChannel::new(config, transport, file, JsonMap::new())
    }

    #[test]
    fn test_initialise_carries_file_details_and_auth() {
        let transport = Arc::new(FakeTransport::default());
        transport.json_route("GET", "/new", json!({ "residence": "AmazonS3" }));
        let channel = test_channel(transport.to_owned());

        let identity = channel.initialise().unwrap();
        assert_eq!(identity.residence, "AmazonS3");

        let request = transport.requests().remove(0);
        assert_eq!(request.query_param("file_size").as_deref(), Some("1024"));
        assert_eq!(request.query_param("file_name").as_deref(), Some("report.pdf"));
        assert_eq!(request.query_param("file_path").as_deref(), Some("docs"));
        assert_eq!(
            request.header("Authorization").as_deref(),
            Some("Bearer secret")
        );
        assert!(request.header("X-API-Key").is_none());
    }

    #[test]
    fn test_create_accumulates_params_and_stores_upload_id() {
        let transport = Arc::new(FakeTransport::default());
        transport.json_route("GET", "/new", json!({ "residence": "AmazonS3" }));
        transport.json_route(
            "POST",
            "/uploads",
            json!({ "upload_id": "u-1", "type": "chunked_upload" }),
        );
        let channel = test_channel(transport.to_owned());
        channel.initialise().unwrap();

        assert!(!channel.has_upload_resource());
        let response = channel
            .create(&CreateOptions::with_file_id("abc123"))
            .unwrap();
        assert_eq!(response.strategy, Some(UploadStrategy::ChunkedUpload));
        assert_eq!(channel.upload_id().unwrap(), "u-1");

        let body = transport.requests().remove(1).json();
        assert_eq!(body["file_id"], "abc123");
        assert_eq!(body["file_mime"], "application/pdf");
        assert_eq!(body["file_size"], "1024");
        assert_eq!(body["file_name"], "report.pdf");
    }

    #[test]
    fn test_operations_fail_without_upload_id() {
        let channel = test_channel(Arc::new(FakeTransport::default()));
        let err = channel.sign(PartRef::Finish, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        let err = channel
            .sign_next_chunk(1, "id", &[1], None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        let err = channel.update_status(json!({})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        // destroy without a resource only cancels the token
        channel.destroy().unwrap();
    }

    #[test]
    fn test_perform_signed_request_accepts_expected_status() {
        let transport = Arc::new(FakeTransport::default());
        transport.route("PUT", "googleapis", |_| {
            response_with_headers(308, &[("Range", "bytes=0-511")], Vec::new())
        });
        let channel = test_channel(transport);

        let details = SigningResponse {
            signature: Some(UploadSignature {
                verb: "PUT".to_owned(),
                url: "https://storage.googleapis.com/session".to_owned(),
                headers: HashMap::new(),
            }),
            expected: Some(308),
            ..Default::default()
        };
        let response = channel.signed_request(&details, None).unwrap();
        assert_eq!(response.status(), 308);
        assert_eq!(response.header("Range"), Some("bytes=0-511"));

        let rejected = SigningResponse {
            expected: Some(201),
            ..details
        };
        let channel = {
            let transport = Arc::new(FakeTransport::default());
            transport.route("PUT", "googleapis", |_| json_response(308, json!({})));
            test_channel(transport)
        };
        let err = channel.signed_request(&rejected, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedStatus);
    }

    #[test]
    fn test_abort_rejects_with_distinguishable_reason() {
        let transport = Arc::new(FakeTransport::default());
        transport.json_route("GET", "/new", json!({ "residence": "AmazonS3" }));
        let channel = test_channel(transport);
        channel.abort();
        let err = channel.initialise().unwrap_err();
        assert!(err.is_aborted());

        // a renewed token lets the channel be reused
        channel.renew_cancellation();
        assert!(channel.initialise().is_ok());
    }

    #[test]
    fn test_signature_content_type_overridden_by_file_mime() {
        let transport = Arc::new(FakeTransport::default());
        transport.json_route("PUT", "bucket", json!({}));
        let channel = test_channel(transport.to_owned());

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_owned(), "text/plain".to_owned());
        headers.insert("x-amz-acl".to_owned(), "private".to_owned());
        let details = SigningResponse {
            signature: Some(UploadSignature {
                verb: "PUT".to_owned(),
                url: "https://bucket.s3.amazonaws.com/key".to_owned(),
                headers,
            }),
            ..Default::default()
        };
        channel.signed_request(&details, Some(b"data".as_slice())).unwrap();

        let request = transport.requests().remove(0);
        assert_eq!(
            request.header("Content-Type").as_deref(),
            Some("application/pdf")
        );
        assert_eq!(request.header("x-amz-acl").as_deref(), Some("private"));
        assert!(request.header("Authorization").is_none());
    }

    #[test]
    fn test_strategy_wire_names() {
        let parsed: UploadStrategy = serde_json::from_str("\"direct_upload\"").unwrap();
        assert!(parsed.is_direct());
        let parsed: UploadStrategy = serde_json::from_str("\"parts\"").unwrap();
        assert_eq!(parsed, UploadStrategy::Parts);
        let parsed: UploadStrategy = serde_json::from_str("\"status\"").unwrap();
        assert_eq!(parsed, UploadStrategy::Status);
        let parsed: UploadStrategy = serde_json::from_str("\"mystery\"").unwrap();
        assert_eq!(parsed, UploadStrategy::Unknown);
    }
}
