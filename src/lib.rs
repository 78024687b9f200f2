#![deny(
    absolute_paths_not_starting_with_crate,
    anonymous_parameters,
    explicit_outlives_requirements,
    keyword_idents,
    macro_use_extern_crate,
    meta_variable_misuse,
    non_ascii_idents,
    trivial_numeric_casts,
    unsafe_code,
    unused_extern_crates,
    unused_import_braces
)]

//! Resumable, chunked uploads straight from the client to S3, Azure,
//! Google Cloud Storage or OpenStack Swift, authorized step by step by
//! an intermediary signing server that never sees the file bytes.

mod cancellation;
mod config;
mod data_source;
mod error;
mod hash_pool;
mod helpers;
mod provider;
mod service;
mod session;
mod signing;
mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cancellation::{CancellationGuard, CancellationToken};
pub use config::{Credential, ServiceConfig, ServiceConfigBuilder};
pub use data_source::{DataSource, FileDataSource, MemoryDataSource};
pub use error::{ErrorKind, UploadError, UploadResult};
pub use hash_pool::{configure_hash_workers, HashWorkerPool, PartDigest, PendingDigest};
pub use helpers::human_readable_byte_count;
pub use provider::{
    register_provider, EngineContext, ProviderEngine, ProviderFactory, AMAZON_S3,
    GOOGLE_CLOUD_STORAGE, MICROSOFT_AZURE, OPENSTACK_SWIFT,
};
pub use service::{UploadService, UploadServiceOptions};
pub use session::{SessionHandle, UploadSession, UploadState, UploadStatus};
pub use signing::{
    CreateOptions, FileInfo, PartRecord, PartRef, ProviderIdentity, SigningChannel,
    SigningResponse, UploadSignature, UploadStrategy,
};
pub use transport::{
    ProgressCallback, Transport, TransportRequest, TransportResponse, UreqTransport,
};
