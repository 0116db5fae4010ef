pub mod analytics;
pub mod config;
pub mod error;
pub mod limiter;
pub mod utils;

pub use config::{LimiterConfig, RefillMode};
pub use error::{LimiterError, Result};
pub use limiter::{Permit, RateLimiter};
pub use utils::time::{Clock, ManualClock, SystemClock};
