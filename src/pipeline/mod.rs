//! Read-path request pipeline: single-flight deduplication and response caching

pub mod dedup;
pub mod response_cache;
pub mod route_key;

pub use dedup::*;
pub use response_cache::*;
pub use route_key::*;
