//! The durable half of renga replication.
//!
//! - [`CommandLog`]: per-category append-only logs with a length-based cursor
//! - [`IdempotencyFilter`]: one id namespace so nothing applies twice
//! - [`CircuitBreaker`]: halts outward sync after repeated oversized diffs
//!
//! Nothing here touches I/O; the session in `renga-sync` owns one of each.

pub mod breaker;
pub mod dedup;
pub mod log;

pub use breaker::{BreakerConfig, CircuitBreaker, Gate};
pub use dedup::{Admission, IdempotencyFilter};
pub use log::{CategoryLog, CommandLog};
