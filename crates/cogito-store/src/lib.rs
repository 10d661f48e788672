pub mod cache;
pub mod clock;

pub use cache::{CacheConfig, CacheEntry, CacheStats, CacheStore};
pub use clock::{Clock, ManualClock, SystemClock};
