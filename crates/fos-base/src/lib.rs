//! fOS Base
//!
//! Leaf primitives shared by the fOS runtime crates:
//! - Monotonic time points and deltas with nanosecond resolution
//! - Waitable events used for synchronous cross-thread hand-offs
//! - Process-wide environment options

pub mod env;
pub mod sync;
pub mod time;

pub use env::{Env, EnvKey};
pub use sync::{AutoResetWaitableEvent, ManualResetWaitableEvent};
pub use time::{TimeDelta, TimePoint};
