//! Conversation side of the chat relay: durable message contracts, the change
//! feed, and the merge of confirmed messages with a locally streamed reply.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use relay_stream::prelude::*;
//! use relay_stream::vendors::relay::RelayBackend;
//! use relay_sync::{ConversationId, ConversationView, GenerateOptions, MemoryStore, SyncError};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SyncError> {
//! let backend = Arc::new(RelayBackend::from_env()?);
//! let gateway = Gateway::builder()
//!     .route(Backend::Mojo, backend.clone())
//!     .route(Backend::MojoPlus, backend)
//!     .build()?;
//! let sessions = SessionManager::new(gateway, SessionConfig::default())?;
//!
//! let store = Arc::new(MemoryStore::new());
//! let mut view = ConversationView::open(ConversationId::new(), store, sessions).await?;
//! view.send("Say hello", GenerateOptions::default()).await?;
//! view.wait_generation().await;
//! for item in view.items() {
//!     println!("{}", item.text());
//! }
//! # Ok(())
//! # }
//! ```

/// Store and view error types.
pub mod errors;
/// In-process store and feed.
pub mod memory;
/// Persisted messages and their metadata.
pub mod message;
/// Pure merge of confirmed messages and the placeholder.
pub mod reconcile;
/// Store and change feed contracts.
pub mod store;
/// Live conversation view that drives generations.
pub mod view;

pub use errors::{StoreError, SyncError};
pub use memory::MemoryStore;
pub use message::{
    ConversationId, GenerationTag, Message, MessageId, MessageMetadata, Revision, RevisionKind,
    history_until,
};
pub use reconcile::{Placeholder, PlaceholderTarget, ReconciledView, ViewItem};
pub use store::{ChangeEvent, ChangeFeed, FeedItem, FeedSubscription, MessageStore};
pub use view::{ConversationView, GenerateOptions};
