//! Data models for TrafficGuard

mod alert;
mod traffic;

pub use alert::*;
pub use traffic::*;

pub(crate) use traffic::elapsed;
