//! Small concurrency primitives shared across the migrator and the
//! network stack.

mod locker;

pub use locker::{Locker, LockerGuard};
