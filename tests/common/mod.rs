//! Shared fixtures: a scriptable in-memory renderer

#![allow(dead_code)]

use image::{Rgba, RgbaImage};
use layerforge::{Canvas, EngineConfig, Error, RenderHandle, Renderer, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fragments containing this attribute fail to render.
pub const FAIL_MARKER: &str = "data-fail";
/// Fragments containing this attribute render for longer than any test timeout.
pub const HANG_MARKER: &str = "data-hang";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Observations shared between a [`MockRenderer`] and the test.
#[derive(Default)]
pub struct MockState {
    pub created: AtomicU64,
    pub renders: AtomicUsize,
    pub resets: AtomicUsize,
    /// Renders that found their handle already busy
    pub overlaps: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub fail_creation: AtomicBool,
    pub shut_down: AtomicBool,
    busy: Mutex<HashSet<u64>>,
    delay_ms: AtomicU64,
}

impl MockState {
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn enter(&self, id: u64) {
        let mut busy = self.busy.lock().unwrap();
        if !busy.insert(id) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.max_concurrent.fetch_max(busy.len(), Ordering::SeqCst);
    }

    fn leave(&self, id: u64) {
        self.busy.lock().unwrap().remove(&id);
    }
}

#[derive(Clone)]
pub struct MockRenderer {
    state: Arc<MockState>,
}

impl MockRenderer {
    pub fn new() -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Renderer for MockRenderer {
    type Handle = MockHandle;

    fn create_handle(&self) -> Result<MockHandle> {
        if self.state.fail_creation.load(Ordering::SeqCst) {
            return Err(Error::HandleCreationError("mock engine unavailable".into()));
        }
        let id = self.state.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockHandle {
            id,
            state: Arc::clone(&self.state),
        })
    }

    fn shutdown(&self) -> Result<()> {
        self.state.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockHandle {
    id: u64,
    state: Arc<MockState>,
}

impl RenderHandle for MockHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn render(&mut self, document: &str, canvas: Canvas, _timeout: Duration) -> Result<RgbaImage> {
        self.state.enter(self.id);
        self.state.renders.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.delay_ms.load(Ordering::SeqCst);
        if document.contains(HANG_MARKER) {
            std::thread::sleep(Duration::from_millis(500));
        } else if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.state.leave(self.id);

        if document.contains(FAIL_MARKER) {
            return Err(Error::RenderError("injected failure".into()));
        }

        // A small opaque block whose colour depends on the document.
        let mut pixels = RgbaImage::new(canvas.width, canvas.height);
        let shade = (document.len() % 256) as u8;
        for y in 0..canvas.height.min(4) {
            for x in 0..canvas.width.min(4) {
                pixels.put_pixel(x, y, Rgba([shade, 64, 128, 255]));
            }
        }
        Ok(pixels)
    }

    fn reset(&mut self) -> Result<()> {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A fresh, empty output directory.
pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("layerforge-{}-{}", label, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn config_in(dir: &PathBuf) -> EngineConfig {
    EngineConfig {
        pool_size: 2,
        max_ephemeral_handles: 2,
        batch_size: 6,
        render_timeout_ms: 2000,
        temp_dir: Some(dir.clone()),
        ..Default::default()
    }
}

pub fn files_in(dir: &PathBuf) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}
