//! wsusd client web service
//!
//! HTTP+JSON endpoints through which Windows Update clients talk to the
//! update-graph core. The SOAP transport envelope is out of scope for this
//! crate; these handlers carry the same operations over plain JSON bodies.

pub mod handlers;
pub mod wire;

pub use handlers::handle_client_request;

use std::sync::Arc;
use wsusd_core::{
    CookieBinding, DeploySyncStore, NullObserver, OpaqueBinding, SyncPolicy,
    UnapprovedDriverObserver, UpdateEngine,
};

/// Protocol version advertised by `getConfig`.
pub const PROTOCOL_VERSION: &str = "1.20";

/// Everything the endpoints need to serve a request.
pub struct ClientService {
    pub engine: Arc<UpdateEngine>,
    pub deploy: Arc<DeploySyncStore>,
    pub policy: SyncPolicy,
    pub binding: Arc<dyn CookieBinding>,
    pub observer: Arc<dyn UnapprovedDriverObserver>,
    /// When set, file URLs are rewritten to `{content_root}/{hex(digest)}`.
    pub content_root: Option<String>,
}

impl ClientService {
    pub fn new(engine: Arc<UpdateEngine>, deploy: Arc<DeploySyncStore>) -> Self {
        Self {
            engine,
            deploy,
            policy: SyncPolicy::default(),
            binding: Arc::new(OpaqueBinding),
            observer: Arc::new(NullObserver),
            content_root: None,
        }
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_content_root(mut self, content_root: Option<String>) -> Self {
        self.content_root = content_root;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn UnapprovedDriverObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Service-level errors, mapped onto HTTP statuses by the handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Core(#[from] wsusd_core::Error),
}

impl ServiceError {
    /// HTTP status for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::Core(e) => match e {
                wsusd_core::Error::NoMetadataSource => 503,
                wsusd_core::Error::InvalidRevisionIndex(_) => 400,
                wsusd_core::Error::NotImplemented(_) => 501,
                _ => 500,
            },
        }
    }
}
