/// Keeps the device awake while work is in progress.
///
/// `release()` without a matching `acquire()` must be tolerated.
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// For platforms without power management.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// Releases the wake lock for as long as the guard lives, then takes it back.
pub struct WakeLockRelease<'a> {
    lock: &'a dyn WakeLock,
}

impl<'a> WakeLockRelease<'a> {
    pub fn new(lock: &'a dyn WakeLock) -> Self {
        lock.release();
        Self { lock }
    }
}

impl Drop for WakeLockRelease<'_> {
    fn drop(&mut self) {
        self.lock.acquire();
    }
}
