//! Synchronization primitives shared by the server engine and client muxer.
//!
//! Lock-across-await state uses the tokio primitives re-exported here; short
//! bookkeeping sections that never await use `std::sync::Mutex` directly.

pub use tokio::sync::{Mutex, RwLock};

use tokio::sync::Notify;

/// A rendez-vous point: a task sleeps here until woken by another task.
///
/// A wake with no sleeper present stores a permit, so a wake racing a sleeper
/// between releasing its lock and going to sleep is not lost. Callers must
/// still re-check their condition after waking.
#[derive(Default)]
pub struct Rendez {
    bell: Notify,
}

impl Rendez {
    pub fn new() -> Rendez {
        Rendez::default()
    }

    pub async fn sleep(&self) {
        self.bell.notified().await;
    }

    pub fn wake(&self) {
        self.bell.notify_one();
    }
}
