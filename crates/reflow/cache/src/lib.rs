//! Reflow cache layer.
//!
//! Two cooperating tiers behind one interface:
//! - a bounded local [`LruCache`] with strict least-recently-used eviction
//! - an optional [`DistributedCacheProvider`] reached asynchronously
//!
//! Design stance:
//! - The distributed tier is a best-effort accelerator, never a source of
//!   truth. Provider failures are logged and degrade to local-only.
//! - The synchronous API touches only the local tier so it can be used
//!   from call sites that cannot suspend.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod lru;
pub mod memory;
mod provider;
mod tiered;

pub use error::{CacheError, CacheResult};
pub use lru::LruCache;
pub use memory::InMemoryDistributedCache;
pub use provider::{DistributedCacheProvider, ProviderStats};
pub use tiered::{TieredCache, TieredCacheStats};
