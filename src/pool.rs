//! Rendering handle pool
//!
//! Starting a rendering engine is expensive; creating a handle inside a running
//! engine is cheap. The pool keeps up to `pool_size` idle handles and lends them
//! out one task at a time. Concurrent leases are capped at
//! `pool_size + max_ephemeral_handles`; extra handles created under load are
//! discarded on return once the idle set is full.

use crate::{EngineConfig, Error, RenderHandle, Renderer, Result};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles waiting in the idle set
    pub idle: usize,
    /// Leases currently held
    pub in_use: usize,
    /// Handles created since start-up
    pub created: u64,
}

/// Temporary, exclusive use of one pooled handle.
///
/// Return it with [`HandlePool::release`]. Dropping a lease instead discards
/// its handle and frees the slot.
pub struct Lease<H: RenderHandle> {
    handle: Option<H>,
    permit: Option<OwnedSemaphorePermit>,
}

/// A handle moved out of its lease together with the lease's slot. The slot
/// stays taken until this value comes back or is dropped.
pub(crate) struct Detached<H> {
    pub(crate) handle: H,
    permit: Option<OwnedSemaphorePermit>,
}

impl<H: RenderHandle> Lease<H> {
    fn new(handle: H, permit: OwnedSemaphorePermit) -> Self {
        Self {
            handle: Some(handle),
            permit: Some(permit),
        }
    }

    /// Id of the leased handle, `None` once the handle has been abandoned.
    pub fn handle_id(&self) -> Option<u64> {
        self.handle.as_ref().map(RenderHandle::id)
    }

    pub fn handle_mut(&mut self) -> Option<&mut H> {
        self.handle.as_mut()
    }

    fn take(&mut self) -> Option<H> {
        self.handle.take()
    }

    /// Move the handle and its slot out, e.g. onto a blocking thread.
    pub(crate) fn detach(&mut self) -> Option<Detached<H>> {
        let handle = self.handle.take()?;
        Some(Detached {
            handle,
            permit: self.permit.take(),
        })
    }

    pub(crate) fn reattach(&mut self, detached: Detached<H>) {
        self.handle = Some(detached.handle);
        if self.permit.is_none() {
            self.permit = detached.permit;
        }
    }
}

impl<H: RenderHandle> Drop for Lease<H> {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            debug!("lease dropped without release; discarding handle {}", handle.id());
        }
    }
}

/// Owner of every rendering handle.
pub struct HandlePool<R: Renderer> {
    renderer: Arc<R>,
    idle: Mutex<Vec<R::Handle>>,
    capacity: usize,
    ceiling: usize,
    permits: Arc<Semaphore>,
    created: AtomicU64,
    closed: AtomicBool,
}

impl<R: Renderer> HandlePool<R> {
    pub fn new(renderer: R, config: &EngineConfig) -> Self {
        let capacity = config.pool_size.max(1);
        let ceiling = config.handle_ceiling().max(capacity);
        Self {
            renderer: Arc::new(renderer),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            ceiling,
            permits: Arc::new(Semaphore::new(ceiling)),
            created: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Maximum number of idle handles kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum number of simultaneous leases.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.lock_idle().len(),
            in_use: self.ceiling.saturating_sub(self.permits.available_permits()),
            created: self.created.load(Ordering::Relaxed),
        }
    }

    /// Borrow a handle. Returns immediately when one is idle, creates one when
    /// below the ceiling, and otherwise waits for a lease to come back.
    pub async fn acquire(&self) -> Result<Lease<R::Handle>> {
        if self.is_closed() {
            return Err(Error::EngineClosed);
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::EngineClosed)?;

        if let Some(handle) = self.lock_idle().pop() {
            return Ok(Lease::new(handle, permit));
        }

        let handle = self.create_handle().await?;
        debug!("created ephemeral rendering handle {}", handle.id());
        Ok(Lease::new(handle, permit))
    }

    /// Return a lease. The handle is reset and kept if the idle set has room,
    /// otherwise discarded.
    pub async fn release(&self, mut lease: Lease<R::Handle>) {
        let Some(mut handle) = lease.take() else {
            debug!("lease returned without a handle; slot freed");
            return;
        };
        if self.is_closed() {
            debug!("pool closed; discarding handle {}", handle.id());
            return;
        }

        let reset = tokio::task::spawn_blocking(move || {
            let res = handle.reset();
            (handle, res)
        })
        .await;

        match reset {
            Ok((handle, Ok(()))) => {
                let mut idle = self.lock_idle();
                if idle.len() < self.capacity && !self.is_closed() {
                    idle.push(handle);
                } else {
                    debug!("idle set full; discarding handle {}", handle.id());
                }
            }
            Ok((handle, Err(e))) => warn!("discarding handle {} after failed reset: {}", handle.id(), e),
            Err(e) => warn!("handle reset task failed: {}", e),
        }
        // `lease` drops here, after the handle is back in the idle set.
    }

    /// Pre-create idle handles so the first conversion does not pay for them.
    /// Returns the resulting number of idle handles.
    pub async fn warm_up(&self, n: usize) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::EngineClosed);
        }
        let target = n.min(self.capacity);
        while self.lock_idle().len() < target {
            let handle = self.create_handle().await?;
            let mut idle = self.lock_idle();
            if idle.len() < self.capacity {
                idle.push(handle);
            }
        }
        let idle = self.lock_idle().len();
        debug!("rendering pool warm with {} idle handles", idle);
        Ok(idle)
    }

    /// Discard every handle and stop the underlying engine. Leases still out
    /// are discarded when they come back.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.permits.close();
        let handles = std::mem::take(&mut *self.lock_idle());
        debug!("shutting down rendering pool ({} idle handles)", handles.len());

        let renderer = Arc::clone(&self.renderer);
        tokio::task::spawn_blocking(move || {
            drop(handles);
            renderer.shutdown()
        })
        .await
        .map_err(|e| Error::Other(format!("shutdown task failed: {}", e)))?
    }

    async fn create_handle(&self) -> Result<R::Handle> {
        let renderer = Arc::clone(&self.renderer);
        let handle = tokio::task::spawn_blocking(move || renderer.create_handle())
            .await
            .map_err(|e| Error::HandleCreationError(format!("handle creation task failed: {}", e)))??;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<R::Handle>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Canvas;
    use image::RgbaImage;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingRenderer {
        next_id: AtomicU64,
        fail: bool,
        shut_down: Arc<AtomicBool>,
    }

    struct CountingHandle {
        id: u64,
        resets: Arc<AtomicUsize>,
    }

    impl RenderHandle for CountingHandle {
        fn id(&self) -> u64 {
            self.id
        }

        fn render(&mut self, _document: &str, canvas: Canvas, _timeout: Duration) -> Result<RgbaImage> {
            Ok(RgbaImage::new(canvas.width, canvas.height))
        }

        fn reset(&mut self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Renderer for CountingRenderer {
        type Handle = CountingHandle;

        fn create_handle(&self) -> Result<CountingHandle> {
            if self.fail {
                return Err(Error::HandleCreationError("engine unavailable".into()));
            }
            Ok(CountingHandle {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                resets: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn shutdown(&self) -> Result<()> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pool(pool_size: usize, ephemeral: usize, fail: bool) -> HandlePool<CountingRenderer> {
        let config = EngineConfig {
            pool_size,
            max_ephemeral_handles: ephemeral,
            ..Default::default()
        };
        let renderer = CountingRenderer {
            next_id: AtomicU64::new(0),
            fail,
            shut_down: Arc::new(AtomicBool::new(false)),
        };
        HandlePool::new(renderer, &config)
    }

    #[tokio::test]
    async fn warm_up_creates_idle_handles_up_to_capacity() {
        let pool = pool(2, 1, false);
        assert_eq!(pool.warm_up(5).await.unwrap(), 2);
        assert_eq!(pool.stats(), PoolStats { idle: 2, in_use: 0, created: 2 });
    }

    #[tokio::test]
    async fn released_handles_are_reused() {
        let pool = pool(1, 0, false);
        let lease = pool.acquire().await.unwrap();
        let first = lease.handle_id();
        pool.release(lease).await;

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.handle_id(), first);
        assert_eq!(pool.stats().created, 1);
        pool.release(lease).await;
    }

    #[tokio::test]
    async fn ephemeral_handles_are_discarded_when_idle_set_is_full() {
        let pool = pool(1, 2, false);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().in_use, 3);
        pool.release(a).await;
        pool.release(b).await;
        pool.release(c).await;
        assert_eq!(pool.stats(), PoolStats { idle: 1, in_use: 0, created: 3 });
    }

    #[tokio::test]
    async fn dropped_lease_frees_its_slot() {
        let pool = pool(1, 0, false);
        let lease = pool.acquire().await.unwrap();
        drop(lease);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().idle, 0);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.handle_id(), Some(1));
    }

    #[tokio::test]
    async fn creation_failure_propagates() {
        let pool = pool(2, 0, true);
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, Error::HandleCreationError(_)));
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_leases() {
        let pool = pool(2, 0, false);
        pool.warm_up(2).await.unwrap();
        let lease = pool.acquire().await.unwrap();
        pool.shutdown().await.unwrap();
        assert!(pool.renderer().shut_down.load(Ordering::SeqCst));
        assert!(matches!(pool.acquire().await, Err(Error::EngineClosed)));

        pool.release(lease).await;
        assert_eq!(pool.stats().idle, 0);
    }
}
