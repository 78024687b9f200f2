use super::{
    super::{
        data_source::DataSource,
        error::{ErrorKind, UploadError, UploadResult},
        session::SessionHandle,
        signing::{CreateOptions, PartRecord, PartRef, SigningChannel, SigningResponse, UploadStrategy},
    },
    base64_content_id, EngineContext, EngineCore, EngineState, Initiation, ProviderEngine,
};
use serde_json::json;
use std::{
    cmp::min,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::Builder as ThreadBuilder,
};
use tap::TapFallible;
use url::form_urlencoded;

pub const GOOGLE_CLOUD_STORAGE: &str = "GoogleCloudStorage";

/// Google Cloud Storage resumable uploads.
///
/// Google streams the whole file in one request instead of fixed parts.
/// An interrupted stream is recovered by probing the resumable session:
/// the probe's range indicator says how many bytes landed, and a second
/// stream carries the remainder.
#[derive(Debug)]
pub(super) struct GoogleCloudEngine {
    core: EngineCore,
    channel: Arc<SigningChannel>,
    session: SessionHandle,
    source: Arc<dyn DataSource>,
    direct: AtomicBool,
}

impl GoogleCloudEngine {
    pub(super) fn factory(
        channel: Arc<SigningChannel>,
        session: SessionHandle,
        context: EngineContext,
    ) -> Arc<dyn ProviderEngine> {
        Arc::new(Self {
            core: EngineCore::new(context.source.total_size()),
            channel,
            session,
            source: context.source,
            direct: AtomicBool::new(false),
        })
    }

    fn drive(&self) -> UploadResult<()> {
        let size = self.core.size();
        let data = Arc::new(self.source.slice(0..size)?);
        let whole = self.core.hash_part(0, &data)?;
        if !self.core.is_uploading() {
            return Ok(());
        }

        let response = self
            .channel
            .create(&CreateOptions::with_file_id(base64_content_id(&whole)))?;
        let strategy = response.strategy.to_owned().ok_or_else(|| {
            UploadError::with_msg(
                ErrorKind::InvalidResponse,
                "create response carries no upload strategy",
            )
        })?;
        self.core.set_initiation(Initiation::Active(strategy.to_owned()));
        if let Some(signature) = response.signature.as_ref() {
            let access_url = signature.url.split('?').next().unwrap_or_default();
            self.session.set_access_url(access_url);
        }

        match strategy {
            UploadStrategy::DirectUpload => {
                self.direct.store(true, Ordering::SeqCst);
                self.transfer(0, &response, &data)?;
                self.finalize()
            }
            UploadStrategy::Status => self.resume_from_probe(&response, size),
            _ => self.fresh_session(&response, &whole, &data),
        }
    }

    /// Ask the resumable session how far the interrupted stream got and
    /// push the remainder.
    fn resume_from_probe(&self, details: &SigningResponse, size: u64) -> UploadResult<()> {
        let probe = self.channel.signed_request(details, None)?;
        if probe.is_success() {
            // every byte already landed, only the bookkeeping is missing
            return self.finalize();
        }
        let range = probe.header("range").ok_or_else(|| {
            UploadError::with_msg(
                ErrorKind::InvalidResponse,
                "status response carries no range header",
            )
        })?;
        let offset = resume_offset_from_range(range).ok_or_else(|| {
            UploadError::with_msg(
                ErrorKind::InvalidResponse,
                format!("unparsable range header {:?}", range),
            )
        })?;
        if offset >= size {
            return self.finalize();
        }

        let rest = Arc::new(self.source.slice(offset..size)?);
        let record = self.core.hash_part(offset, &rest)?;
        if !self.core.is_uploading() {
            return Ok(());
        }
        let signed = self
            .channel
            .sign(PartRef::Number(offset), Some(&base64_content_id(&record)))?;
        // the landed prefix counts as transferred
        self.core.update_progress(0, offset, offset);
        self.transfer(offset, &signed, &rest)?;
        self.finalize()
    }

    /// Open a fresh resumable session on the provider and stream the
    /// whole file into it.
    fn fresh_session(
        &self,
        details: &SigningResponse,
        whole: &PartRecord,
        data: &Arc<Vec<u8>>,
    ) -> UploadResult<()> {
        let created = self.channel.signed_request(details, None)?;
        let location = created.header("location").ok_or_else(|| {
            UploadError::with_msg(
                ErrorKind::InvalidResponse,
                "session response carries no location header",
            )
        })?;
        let resumable_id = upload_id_from_location(location).ok_or_else(|| {
            UploadError::with_msg(
                ErrorKind::InvalidResponse,
                format!("location header carries no upload id: {:?}", location),
            )
        })?;
        let signed = self.channel.update_status(json!({
            "resumable_id": resumable_id,
            "file_id": base64_content_id(whole),
            "part": 0,
        }))?;
        self.transfer(0, &signed, data)?;
        self.finalize()
    }

    fn transfer(&self, key: u64, signed: &SigningResponse, data: &Arc<Vec<u8>>) -> UploadResult<()> {
        let total = data.len() as u64;
        self.core.update_progress(key, 0, total);
        let core = &self.core;
        let session = &self.session;
        let on_progress = |transferred: u64, _: u64| {
            core.update_progress(key, min(transferred, total), total);
            core.publish_progress(session);
        };
        self.channel
            .perform_signed_request(signed, Some(data.as_slice()), Some(&on_progress))?;
        self.core.update_progress(key, total, total);
        self.core.publish_progress(&self.session);
        Ok(())
    }

    fn finalize(&self) -> UploadResult<()> {
        self.channel.update_status(json!({}))?;
        self.core.set_state(EngineState::Completed);
        self.session.on_complete();
        Ok(())
    }

    fn fail(&self, err: UploadError) {
        if err.is_aborted() {
            log::debug!("{} transfer aborted", GOOGLE_CLOUD_STORAGE);
            return;
        }
        log::error!("{} upload failed: {}", GOOGLE_CLOUD_STORAGE, err);
        self.pause();
        self.session.on_error(&err.to_string());
    }
}

impl ProviderEngine for GoogleCloudEngine {
    fn start(self: Arc<Self>) {
        if !self.core.try_enter_uploading() {
            return;
        }
        self.channel.renew_cancellation();
        if self.core.initiation() == Initiation::NotStarted {
            self.core.set_initiation(Initiation::Creating);
        }

        // every (re)entry renegotiates: the server answers a later
        // create with the status strategy and the stream is recovered
        let engine = self.to_owned();
        ThreadBuilder::new()
            .name(format!("cloud-upload-manager.{}", GOOGLE_CLOUD_STORAGE))
            .spawn(move || {
                if let Err(err) = engine.drive() {
                    engine.fail(err);
                }
            })
            .map_err(|err| self.fail(UploadError::new(ErrorKind::SystemCall, err)))
            .ok();
    }

    fn pause(&self) {
        if self.core.state() < EngineState::Completed {
            self.core.set_state(EngineState::Paused);
        }
        self.channel.abort();
        self.core.zero_incomplete_progress();
        self.core.publish_progress(&self.session);
    }

    fn destroy(&self) {
        if self.core.initiation() != Initiation::NotStarted
            && self.core.state() < EngineState::Completed
        {
            self.channel.abort();
            let channel = self.channel.to_owned();
            ThreadBuilder::new()
                .name("cloud-upload-manager.release".to_owned())
                .spawn(move || {
                    channel
                        .release()
                        .tap_err(|err| log::warn!("failed to release upload resource: {}", err))
                        .ok();
                })
                .ok();
            self.core.set_initiation(Initiation::NotStarted);
            self.core.reset_parts();
            self.core.set_state(EngineState::Aborted);
        }
    }
}

/// Parse the resume offset out of a range indicator like `bytes=0-999`:
/// the next byte the session expects is one past the recorded end.
fn resume_offset_from_range(range: &str) -> Option<u64> {
    let (_, end) = range.trim().rsplit_once('-')?;
    end.trim().parse::<u64>().ok().map(|end| end + 1)
}

/// Pull the session id out of a resumable session's location URL.
fn upload_id_from_location(location: &str) -> Option<String> {
    let (_, query) = location.split_once('?')?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "upload_id")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::UploadStatus,
        test_utils::{
            await_status, json_response, response_with_headers, scenario_session, watch,
            FakeTransport,
        },
        transport::TransportResponse,
    };
    use serde_json::json;

    #[test]
    fn test_fresh_session_streams_whole_file() {
        let transport = Arc::new(FakeTransport::default());
        transport.json_route("GET", "/new", json!({ "residence": "GoogleCloudStorage" }));
        transport.json_route(
            "POST",
            "api.test/uploads",
            json!({
                "upload_id": "u-5",
                "type": "chunked_upload",
                "signature": {
                    "verb": "POST",
                    "url": "https://storage.googleapis.com/upload/b/o?uploadType=resumable",
                    "headers": { "x-goog-resumable": "start" }
                }
            }),
        );
        transport.route("POST", "uploadType=resumable", |_| {
            response_with_headers(
                201,
                &[(
                    "Location",
                    "https://storage.googleapis.com/upload/b/o?uploadType=resumable&upload_id=sess-9",
                )],
                Vec::new(),
            )
        });
        transport.route("PUT", "upload_id=sess-9", |_| {
            TransportResponse::new(200, Vec::new(), Vec::new())
        });
        transport.route("PUT", "api.test/uploads/u-5", |request| {
            if request.json().get("resumable_id").is_some() {
                json_response(
                    200,
                    json!({
                        "signature": {
                            "verb": "PUT",
                            "url": "https://storage.googleapis.com/upload/b/o?upload_id=sess-9&stream=1",
                            "headers": {}
                        }
                    }),
                )
            } else {
                json_response(200, json!({}))
            }
        });

        let session = scenario_session(&transport, vec![5u8; 8192], 3);
        let states = watch(&session);
        session.resume(None);
        let state = await_status(&states, UploadStatus::Complete);
        assert_eq!(state.uploaded, 8192);

        let requests = transport.requests();
        // the provider session id was pulled out of the location header
        let registered = requests
            .iter()
            .find(|request| request.json().get("resumable_id").is_some())
            .unwrap();
        assert_eq!(registered.json()["resumable_id"], "sess-9");
        assert_eq!(registered.json()["part"], 0);

        let stream = requests
            .iter()
            .find(|request| request.url.contains("stream=1"))
            .unwrap();
        assert_eq!(stream.body.len(), 8192);
    }

    #[test]
    fn test_status_probe_resumes_remainder() {
        let transport = Arc::new(FakeTransport::default());
        transport.json_route("GET", "/new", json!({ "residence": "GoogleCloudStorage" }));
        transport.json_route(
            "POST",
            "api.test/uploads",
            json!({
                "upload_id": "u-6",
                "type": "status",
                "expected": 308,
                "signature": {
                    "verb": "PUT",
                    "url": "https://storage.googleapis.com/upload/b/o?upload_id=sess-1&probe=1",
                    "headers": {}
                }
            }),
        );
        transport.route("PUT", "probe=1", |_| {
            response_with_headers(308, &[("Range", "bytes=0-3999")], Vec::new())
        });
        transport.route("GET", "/edit", |_| {
            json_response(
                200,
                json!({
                    "signature": {
                        "verb": "PUT",
                        "url": "https://storage.googleapis.com/upload/b/o?upload_id=sess-1&rest=1",
                        "headers": {}
                    }
                }),
            )
        });
        transport.route("PUT", "rest=1", |_| {
            TransportResponse::new(200, Vec::new(), Vec::new())
        });
        transport.json_route("PUT", "api.test/uploads/u-6", json!({}));

        let session = scenario_session(&transport, vec![3u8; 10000], 3);
        let states = watch(&session);
        session.resume(None);
        let state = await_status(&states, UploadStatus::Complete);
        assert_eq!(state.uploaded, 10000);

        let requests = transport.requests();
        // the probe said 4000 bytes landed, only the rest streams again
        let signed = requests
            .iter()
            .find(|request| request.url.contains("/edit"))
            .unwrap();
        assert_eq!(signed.query_param("part").as_deref(), Some("4000"));
        let rest = requests
            .iter()
            .find(|request| request.url.contains("rest=1"))
            .unwrap();
        assert_eq!(rest.body.len(), 6000);
    }

    #[test]
    fn test_resume_offset_from_range() {
        assert_eq!(resume_offset_from_range("bytes=0-999"), Some(1000));
        assert_eq!(resume_offset_from_range("bytes=0-0"), Some(1));
        assert_eq!(resume_offset_from_range("bytes=0-"), None);
        assert_eq!(resume_offset_from_range("garbage"), None);
    }

    #[test]
    fn test_upload_id_from_location() {
        let location =
            "https://storage.googleapis.com/bucket/o?uploadType=resumable&upload_id=xa298sd_sdlkj2";
        assert_eq!(
            upload_id_from_location(location).as_deref(),
            Some("xa298sd_sdlkj2")
        );
        assert_eq!(upload_id_from_location("https://x.test/path"), None);
        assert_eq!(upload_id_from_location("https://x.test/path?foo=1"), None);
    }
}
