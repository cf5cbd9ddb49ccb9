//! Pullwatch - an incremental sync engine for GitHub-style trackers.
//!
//! This library keeps a local, transactional object store of repositories,
//! pull requests, issues and their child collections (comments, labels,
//! statuses) consistent with a remote paginated REST API, while respecting
//! the server's rate budget, backing off per broken endpoint, and surviving
//! partial failures without corrupting local state.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pullwatch::{ReqwestTransport, Server, Settings, Store, SyncContext, sync_all};
//!
//! let mut store = pullwatch::Store::new();
//! store.add_server(Server::new("github", "https://api.github.com", Some(token)));
//!
//! let ctx = Arc::new(
//!     SyncContext::builder()
//!         .transport(ReqwestTransport::with_defaults()?)
//!         .store(pullwatch::store::shared(store))
//!         .settings(Settings::default())
//!         .build()?,
//! );
//!
//! if sync_all(&ctx).await {
//!     println!("{}", ctx.refresh_status(chrono::Utc::now()));
//! }
//! ```

pub mod api;
pub mod backoff;
pub mod error;
pub mod http;
pub mod limiter;
pub mod settings;
pub mod store;
pub mod sync;

pub use api::{Api, ApiResponse, PagedOutcome, PageFlow};
pub use error::ApiError;
pub use http::{HttpError, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use limiter::ApiRateLimiter;
pub use settings::{HandlingPolicy, Settings};
pub use store::{
    Comment, Condition, Disposition, Item, ItemKind, Label, Repo, Section, Server, SharedStore,
    Status, Store, StreamKind,
};
pub use sync::{
    sync_all, ChildKind, ProgressCallback, RefreshStatus, RefreshThrottle, SyncContext,
    SyncContextBuilder, SyncEvent,
};
