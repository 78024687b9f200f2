use super::{
    super::{
        data_source::DataSource,
        error::{ErrorKind, UploadError, UploadResult},
        session::SessionHandle,
        signing::{CreateOptions, PartRecord, PartRef, SigningChannel, SigningResponse, UploadStrategy},
    },
    EngineContext, EngineCore, EngineState, ExhaustionOutcome, Initiation, ProviderEngine,
};
use serde_json::json;
use std::{
    cmp::min,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::Builder as ThreadBuilder,
};
use tap::TapFallible;

/// Provider-specific policy plugged into [`FixedPartEngine`].
///
/// The engine owns the shared part machinery; the policy supplies the
/// provider's sizing limits, content id encoding, session opening and
/// completion manifest.
pub(super) trait PartPolicy: std::fmt::Debug + Default + Send + Sync + 'static {
    /// Residence name the signing server routes by.
    const RESIDENCE: &'static str;
    const DEFAULT_PART_SIZE: u64;
    const MAX_PARTS: u64;
    /// Hard per-part size cap; needing larger parts than this makes the
    /// file impossible to upload.
    const PART_SIZE_CAP: u64;
    const SIZE_LIMIT_MESSAGE: &'static str;
    /// Whether signing requests carry the memoized part records.
    const SENDS_PART_DATA: bool;

    /// Content id the signing server forwards to the provider for
    /// integrity checking.
    fn content_id(record: &PartRecord) -> String;

    /// Completion manifest body, in the provider's native format.
    fn manifest(engine: &FixedPartEngine<Self>) -> Vec<u8>;

    /// Open the provider-side upload session and return the signature
    /// for the first part's transfer.
    fn open_upload(
        engine: &FixedPartEngine<Self>,
        _create: &SigningResponse,
        first: &PartRecord,
    ) -> UploadResult<SigningResponse> {
        engine.channel().update_status(json!({
            "resumable_id": "n/a",
            "file_id": Self::content_id(first),
            "part": 1,
        }))
    }

    /// Fold the server's recovered part bookkeeping into the engine
    /// before workers start.
    fn merge_recovered(engine: &FixedPartEngine<Self>, recovered: &SigningResponse) {
        if let Some(part_list) = recovered.part_list.as_deref() {
            engine.core().seed_pending(part_list.iter().copied());
        }
    }

    /// Hook for providers that hand back per-part state with each
    /// signature.
    fn note_signed_part(_engine: &FixedPartEngine<Self>, _part: u64, _signed: &SigningResponse) {}
}

enum Flow {
    Continue,
    Stop,
}

/// Pick the part size: the provider default, grown just enough to fit
/// the file under the part-count limit. `None` when even the hard cap
/// cannot fit the file.
fn adjusted_part_size<P: PartPolicy>(size: u64) -> Option<u64> {
    let mut part_size = P::DEFAULT_PART_SIZE;
    if P::MAX_PARTS.saturating_mul(part_size) < size {
        part_size = size / P::MAX_PARTS + u64::from(size % P::MAX_PARTS != 0);
        if part_size > P::PART_SIZE_CAP {
            return None;
        }
    }
    Some(part_size)
}

/// Multi-part engine for providers with fixed-size parts (S3, Azure,
/// Swift).
///
/// `start` sizes the parts, negotiates the strategy with one `create`
/// round, then fans out to `parallelism` worker loops that each pull the
/// next part index until the file is exhausted. The worker that draws
/// the first index past the end of the file wins finalization.
#[derive(Debug)]
pub(super) struct FixedPartEngine<P> {
    core: EngineCore,
    channel: Arc<SigningChannel>,
    session: SessionHandle,
    source: Arc<dyn DataSource>,
    part_size: Mutex<u64>,
    parallelism: AtomicUsize,
    direct: AtomicBool,
    _policy: PhantomData<P>,
}

impl<P: PartPolicy> FixedPartEngine<P> {
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
            part_size: Mutex::new(P::DEFAULT_PART_SIZE),
            parallelism: AtomicUsize::new(context.parallelism.max(1)),
            direct: AtomicBool::new(false),
            _policy: PhantomData,
        })
    }

    #[inline]
    pub(super) fn core(&self) -> &EngineCore {
        &self.core
    }

    #[inline]
    pub(super) fn channel(&self) -> &SigningChannel {
        &self.channel
    }

    #[inline]
    pub(super) fn part_size(&self) -> u64 {
        *self.part_size.lock().unwrap()
    }

    fn run_create(self: &Arc<Self>) {
        let part_size = self.part_size();
        let size = self.core.size();
        let data = match self.source.slice(0..min(part_size, size)) {
            Ok(data) => Arc::new(data),
            Err(err) => return self.fail(err.into()),
        };
        let first = match self.core.hash_part(1, &data) {
            Ok(first) => first,
            Err(err) => return self.fail(err),
        };
        if !self.core.is_uploading() {
            return;
        }

        let response = match self
            .channel
            .create(&CreateOptions::with_file_id(P::content_id(&first)))
        {
            Ok(response) => response,
            Err(err) => return self.fail(err),
        };
        let strategy = match response.strategy.to_owned() {
            Some(strategy) => strategy,
            None => {
                return self.fail(UploadError::with_msg(
                    ErrorKind::InvalidResponse,
                    "create response carries no upload strategy",
                ))
            }
        };
        self.core.set_initiation(Initiation::Active(strategy.to_owned()));
        if let Some(signature) = response.signature.as_ref() {
            let access_url = signature.url.split('?').next().unwrap_or_default();
            self.session.set_access_url(access_url);
        }

        let outcome = match strategy {
            UploadStrategy::DirectUpload => self.direct_transfer(&response, &data),
            UploadStrategy::Parts => {
                P::merge_recovered(self, &response);
                self.run_workers(self.parallelism.load(Ordering::Relaxed));
                Ok(())
            }
            _ => self.chunked_open(&response, &first, data),
        };
        if let Err(err) = outcome {
            self.fail(err);
        }
    }

    fn direct_transfer(&self, response: &SigningResponse, data: &Arc<Vec<u8>>) -> UploadResult<()> {
        self.direct.store(true, Ordering::SeqCst);
        self.transfer_part(1, response, data)?;
        self.finalize()
    }

    fn chunked_open(
        self: &Arc<Self>,
        create: &SigningResponse,
        first: &PartRecord,
        data: Arc<Vec<u8>>,
    ) -> UploadResult<()> {
        let signed = P::open_upload(self, create, first)?;
        let part = self.core.allocate_part();
        P::note_signed_part(self, part, &signed);
        self.transfer_part(part, &signed, &data)?;
        drop(data);
        self.run_workers(self.parallelism.load(Ordering::Relaxed));
        Ok(())
    }

    /// Fan out `count` worker loops and block until all of them stop.
    fn run_workers(self: &Arc<Self>, count: usize) {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(count)
            .thread_name(|index| format!("cloud-upload-manager.{}.{}", P::RESIDENCE, index))
            .build();
        let pool = match pool {
            Ok(pool) => pool,
            Err(err) => return self.fail(UploadError::new(ErrorKind::SystemCall, err)),
        };
        pool.scope_fifo(|scope| {
            for _ in 0..count {
                scope.spawn_fifo(|_| self.worker_loop());
            }
        });
    }

    fn worker_loop(self: &Arc<Self>) {
        while self.core.is_uploading() {
            match self.next_part() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
    }

    /// Pull, sign and transfer one part; drawing an index past the end
    /// of the file resolves finalization instead.
    fn next_part(self: &Arc<Self>) -> UploadResult<Flow> {
        let part = self.core.allocate_part();
        let part_size = self.part_size();
        let size = self.core.size();
        let offset = (part - 1).saturating_mul(part_size);
        if offset >= size {
            return self.resolve_exhausted(part);
        }

        let data = match self.source.slice(offset..min(offset + part_size, size)) {
            Ok(data) => Arc::new(data),
            Err(err) => {
                self.core.return_part(part);
                return Err(err.into());
            }
        };
        let record = match self.core.hash_part(part, &data) {
            Ok(record) => record,
            Err(err) => {
                self.core.return_part(part);
                return Err(err);
            }
        };
        // a pause may have landed while this part was being hashed
        if !self.core.is_uploading() {
            self.core.return_part(part);
            return Ok(Flow::Stop);
        }

        let outstanding = self.core.outstanding_parts();
        let part_data = P::SENDS_PART_DATA.then(|| self.core.part_data_snapshot(&outstanding));
        let signed =
            self.channel
                .sign_next_chunk(part, &P::content_id(&record), &outstanding, part_data)?;
        P::note_signed_part(self, part, &signed);
        self.transfer_part(part, &signed, &data)?;
        Ok(Flow::Continue)
    }

    fn resolve_exhausted(&self, part: u64) -> UploadResult<Flow> {
        match self.core.resolve_exhausted(part) {
            ExhaustionOutcome::Finalize => {
                self.finalize()?;
                Ok(Flow::Stop)
            }
            ExhaustionOutcome::Checkpoint(part_list) => {
                let mut checkpoint = json!({
                    "part_update": true,
                    "part_list": part_list,
                });
                if P::SENDS_PART_DATA {
                    checkpoint["part_data"] = json!(self.core.part_data_snapshot(&part_list));
                }
                // checkpointing is best effort, losing one only costs a
                // rehash on the next resume
                self.channel
                    .update_status(checkpoint)
                    .tap_err(|err| log::warn!("part checkpoint failed: {}", err))
                    .ok();
                Ok(Flow::Stop)
            }
            ExhaustionOutcome::Ignore => Ok(Flow::Stop),
        }
    }

    fn transfer_part(
        &self,
        part: u64,
        signed: &SigningResponse,
        data: &Arc<Vec<u8>>,
    ) -> UploadResult<()> {
        let total = data.len() as u64;
        self.core.update_progress(part, 0, total);
        let core = &self.core;
        let session = &self.session;
        let on_progress = |transferred: u64, _: u64| {
            core.update_progress(part, min(transferred, total), total);
            core.publish_progress(session);
        };
        self.channel
            .perform_signed_request(signed, Some(data.as_slice()), Some(&on_progress))?;
        self.core.complete_part(part);
        self.core.update_progress(part, total, total);
        self.core.publish_progress(&self.session);
        Ok(())
    }

    fn finalize(&self) -> UploadResult<()> {
        if !self.direct.load(Ordering::SeqCst) {
            let finish = self.channel.sign(PartRef::Finish, None)?;
            // providers without a commit endpoint answer with no
            // signature; nothing to submit then
            if finish.signature.is_some() {
                let manifest = P::manifest(self);
                self.channel.signed_request(&finish, Some(manifest.as_slice()))?;
            }
        }
        self.channel.update_status(json!({}))?;
        self.core.set_state(EngineState::Completed);
        self.session.on_complete();
        Ok(())
    }

    fn fail(&self, err: UploadError) {
        if err.is_aborted() {
            log::debug!("{} transfer aborted", P::RESIDENCE);
            return;
        }
        log::error!("{} upload failed: {}", P::RESIDENCE, err);
        self.pause();
        self.session.on_error(&err.to_string());
    }
}

impl<P: PartPolicy> ProviderEngine for FixedPartEngine<P> {
    fn start(self: Arc<Self>) {
        if !self.core.try_enter_uploading() {
            return;
        }
        self.channel.renew_cancellation();

        match self.core.initiation() {
            Initiation::NotStarted => {
                self.core.set_initiation(Initiation::Creating);
                let part_size = match adjusted_part_size::<P>(self.core.size()) {
                    Some(part_size) => part_size,
                    None => {
                        log::error!(
                            "{}: file of {} bytes cannot fit in {} parts",
                            P::RESIDENCE,
                            self.core.size(),
                            P::MAX_PARTS
                        );
                        self.session.cancel();
                        self.session.on_error(P::SIZE_LIMIT_MESSAGE);
                        return;
                    }
                };
                *self.part_size.lock().unwrap() = part_size;

                let engine = self.to_owned();
                ThreadBuilder::new()
                    .name(format!("cloud-upload-manager.{}", P::RESIDENCE))
                    .spawn(move || engine.run_create())
                    .map_err(|err| self.fail(UploadError::new(ErrorKind::SystemCall, err)))
                    .ok();
            }
            Initiation::Creating => {}
            Initiation::Active(_) => {
                let engine = self.to_owned();
                let parallelism = self.parallelism.load(Ordering::Relaxed);
                ThreadBuilder::new()
                    .name(format!("cloud-upload-manager.{}", P::RESIDENCE))
                    .spawn(move || engine.run_workers(parallelism))
                    .map_err(|err| self.fail(UploadError::new(ErrorKind::SystemCall, err)))
                    .ok();
            }
        }
    }

    fn pause(&self) {
        let initiated = matches!(self.core.initiation(), Initiation::Active(_));
        let direct = self.direct.load(Ordering::SeqCst);
        if initiated && !direct && self.core.is_uploading() {
            // keep the bookkeeping, the next start continues these parts
            self.core.set_state(EngineState::Paused);
            self.channel.abort();
            self.core.migrate_current_to_pending();
        } else if !initiated || direct {
            // nothing resumable yet, the next start re-creates
            if self.core.state() < EngineState::Completed {
                self.core.set_state(EngineState::Paused);
            }
            self.channel.abort();
            self.core.set_initiation(Initiation::NotStarted);
            self.core.reset_parts();
        }
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
