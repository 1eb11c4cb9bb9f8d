//! Spin-then-yield locks built on `lock_api`.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lock_api::{GuardSend, RawMutex, RawRwLock};

pub const SPIN_AMOUNT: u32 = 10_000;

pub struct LockRawMutex(AtomicBool);

#[inline(always)]
fn lock_loop<T>(this: &T, try_lock: impl Fn(&T) -> bool) {
    let mut spin_count = 0;
    while !try_lock(this) {
        core::hint::spin_loop();
        spin_count += 1;
        if spin_count > SPIN_AMOUNT {
            crate::platform::thread_yield();
            spin_count = 0;
        }
    }
}

unsafe impl RawMutex for LockRawMutex {
    const INIT: Self = Self(AtomicBool::new(false));
    type GuardMarker = GuardSend;

    fn lock(&self) {
        lock_loop(self, Self::try_lock)
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LockRawRwLock(AtomicU32);

impl LockRawRwLock {
    pub const WRITER_BIT: u32 = 1 << 31;
}

unsafe impl RawRwLock for LockRawRwLock {
    const INIT: Self = Self(AtomicU32::new(0));
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        lock_loop(self, Self::try_lock_shared)
    }

    fn lock_exclusive(&self) {
        lock_loop(self, Self::try_lock_exclusive)
    }

    fn try_lock_shared(&self) -> bool {
        let mut state = self.0.load(Ordering::Relaxed);
        loop {
            if state & Self::WRITER_BIT != 0 {
                return false;
            }

            match self.0.compare_exchange_weak(
                state,
                state + 1,
                // Sync when acquired
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(s) => state = s,
            }
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.0
            .compare_exchange(0, Self::WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.0.load(Ordering::Relaxed) & Self::WRITER_BIT != 0
    }

    unsafe fn unlock_shared(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    unsafe fn unlock_exclusive(&self) {
        self.0.store(0, Ordering::Release);
    }
}

type MutexInner<T> = lock_api::Mutex<LockRawMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, LockRawMutex, T>;

type RwLockInner<T> = lock_api::RwLock<LockRawRwLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, LockRawRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, LockRawRwLock, T>;

#[derive(Debug)]
#[repr(transparent)]
pub struct Mutex<T>(MutexInner<T>);

impl<T> Mutex<T> {
    pub const fn new(inner: T) -> Self {
        Self(MutexInner::new(inner))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.0.try_lock()
    }

    #[allow(unused)]
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

#[derive(Debug)]
#[repr(transparent)]
pub struct RwLock<T>(RwLockInner<T>);

impl<T> RwLock<T> {
    pub const fn new(inner: T) -> Self {
        Self(RwLockInner::new(inner))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write()
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.0.try_write()
    }

    #[allow(unused)]
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}
