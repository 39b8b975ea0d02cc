//! # dissem cache
//!
//! The data cache as seen by the replication control plane. Storage and
//! eviction are someone else's job; this crate only defines what the
//! control plane asks of a cache, plus an in-memory implementation.
//!
//! ## Key Types
//!
//! - [`DataCache`] - The async trait the control plane consumes
//! - [`MemoryCache`] - In-memory cache with a transmission history
//! - [`CachedMessage`] - A message announced by a cache update
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dissem_cache::{CachedMessage, DataCache, MemoryCache};
//! use dissem_core::{MessageId, NodeId};
//!
//! async fn example() {
//!     let cache = MemoryCache::new();
//!     let publisher = NodeId::new("uav-1");
//!     let id = MessageId::new("tracks", &publisher, 1);
//!     cache
//!         .insert(CachedMessage::complete(id, "tracks", &b"payload"[..]))
//!         .unwrap();
//!
//!     let pending = cache
//!         .not_replicated(&NodeId::new("gw-1"), &[], None)
//!         .await
//!         .unwrap();
//!     assert_eq!(pending.len(), 1);
//! }
//! ```

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{CacheError, Result};
pub use memory::MemoryCache;
pub use traits::{CachedMessage, DataCache};
