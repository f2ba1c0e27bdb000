//! Object Pools (C2): reusable `Req`/`Resp`/`Trace`/`Span` objects.
//!
//! A single generic `Pool<T>` rather than five hand-duplicated pool types —
//! pooling is correctness-neutral (§4.2): its absence must never change
//! observable behavior, only allocation pressure.

use std::marker::PhantomData;

use tokio::sync::Mutex;

/// A type that can be reset to a reusable, zero-allocated-but-retained state.
pub trait Poolable {
    fn reset(&mut self);
}

/// Best-effort object pool. Grows under load past `initial_size`; idle
/// `release` calls past the floor are simply dropped rather than retained
/// indefinitely.
pub struct Pool<T: Poolable> {
    items: Mutex<Vec<T>>,
    floor: usize,
    _marker: PhantomData<T>,
}

impl<T: Poolable> Pool<T> {
    pub fn new(initial_size: usize, seed: impl Fn() -> T) -> Self {
        let items = (0..initial_size).map(|_| seed()).collect();
        Self {
            items: Mutex::new(items),
            floor: initial_size,
            _marker: PhantomData,
        }
    }

    /// Takes an item from the pool, already reset, or constructs one with
    /// `fallback` if the pool is empty (growth under load).
    pub async fn acquire(&self, fallback: impl FnOnce() -> T) -> T {
        let mut items = self.items.lock().await;
        match items.pop() {
            Some(mut item) => {
                item.reset();
                item
            }
            None => fallback(),
        }
    }

    /// Returns an item to the pool. Beyond `floor * 2` retained items the
    /// excess is dropped, so a load spike shrinks back to the pre-allocated
    /// floor once traffic subsides.
    pub async fn release(&self, mut item: T) {
        item.reset();
        let mut items = self.items.lock().await;
        if items.len() < self.floor.max(1) * 2 {
            items.push(item);
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Scratch {
        buf: Vec<u8>,
    }

    impl Poolable for Scratch {
        fn reset(&mut self) {
            self.buf.clear();
        }
    }

    #[tokio::test]
    async fn acquire_returns_a_reset_item() {
        let pool = Pool::new(1, Scratch::default);
        let mut item = pool.acquire(Scratch::default).await;
        item.buf.push(1);
        pool.release(item).await;

        let reused = pool.acquire(Scratch::default).await;
        assert!(reused.buf.is_empty());
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_falls_back_to_constructor() {
        let pool: Pool<Scratch> = Pool::new(0, Scratch::default);
        assert_eq!(pool.len().await, 0);
        let item = pool.acquire(Scratch::default).await;
        assert!(item.buf.is_empty());
    }

    #[tokio::test]
    async fn release_past_double_the_floor_is_dropped() {
        let pool = Pool::new(1, Scratch::default);
        for _ in 0..5 {
            pool.release(Scratch::default()).await;
        }
        assert!(pool.len().await <= 2);
    }
}
