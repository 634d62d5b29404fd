pub mod companion;
pub mod config;
pub mod context;
pub mod detail;
pub mod error;
pub mod policy;
pub mod pool;
pub mod session;

pub use companion::*;
pub use config::*;
pub use context::*;
pub use detail::*;
pub use error::*;
pub use policy::*;
pub use pool::*;
pub use session::*;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
