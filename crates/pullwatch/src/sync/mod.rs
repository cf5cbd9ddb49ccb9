//! The sync engine.
//!
//! # Module structure
//!
//! - [`engine`] - The orchestrator: [`SyncContext`], [`sync_all`]
//! - progress - Progress events and the refresh-status surface
//! - throttle - Per-item child-collection refresh throttling
//! - dirty - Event-stream dirty detection, driven by the engine
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pullwatch::http::ReqwestTransport;
//! use pullwatch::settings::Settings;
//! use pullwatch::store::{self, Server, Store};
//! use pullwatch::sync::{sync_all, SyncContext};
//!
//! let mut store = Store::new();
//! store.add_server(Server::new("github", "https://api.github.com", Some(token)));
//!
//! let ctx = Arc::new(
//!     SyncContext::builder()
//!         .transport(ReqwestTransport::with_defaults()?)
//!         .store(store::shared(store))
//!         .settings(Settings::default())
//!         .build()?,
//! );
//! let success = sync_all(&ctx).await;
//! ```

pub mod engine;

mod dirty;
mod progress;
mod throttle;

pub use engine::{sync_all, SyncContext, SyncContextBuilder, SyncContextError};
pub use progress::{emit, ProgressCallback, RefreshStatus, SyncEvent};
pub use throttle::{ChildKind, RefreshThrottle};
