//! Chrome DevTools Protocol backend
//!
//! One headless Chrome process per renderer and one tab per handle. Tabs are
//! configured once on creation: transparent page background, user agent, and
//! request interception that refuses auxiliary resources.

use crate::{Canvas, EngineConfig, Error, RenderHandle, Renderer, Result};
use base64::Engine as _;
use headless_chrome::browser::tab::{RequestInterceptor, RequestPausedDecision, Tab};
use headless_chrome::protocol::cdp::Fetch::events::RequestPausedEvent;
use headless_chrome::protocol::cdp::Fetch::FailRequest;
use headless_chrome::protocol::cdp::Network::{ErrorReason, ResourceType};
use headless_chrome::protocol::cdp::{Emulation, Page, DOM};
use headless_chrome::{Browser, LaunchOptions};
use image::RgbaImage;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Headless Chrome renderer (uses the `headless_chrome` crate)
pub struct ChromeRenderer {
    browser: Mutex<Option<Browser>>,
    user_agent: String,
    block_auxiliary_resources: bool,
    window: Canvas,
    next_id: AtomicU64,
}

impl ChromeRenderer {
    /// Launch the browser. This is the expensive step; tabs are cheap.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((config.chrome_window.width, config.chrome_window.height)))
            .build()
            .map_err(|e| Error::HandleCreationError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::HandleCreationError(format!("Failed to launch browser: {}", e)))?;
        debug!("launched headless Chrome");

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            user_agent: config.user_agent.clone(),
            block_auxiliary_resources: config.block_auxiliary_resources,
            window: config.chrome_window,
            next_id: AtomicU64::new(1),
        })
    }

    fn new_tab(&self) -> Result<Arc<Tab>> {
        let browser = self.browser.lock().unwrap_or_else(PoisonError::into_inner);
        let browser = browser
            .as_ref()
            .ok_or_else(|| Error::HandleCreationError("browser has been shut down".into()))?;
        browser
            .new_tab()
            .map_err(|e| Error::HandleCreationError(format!("Failed to create tab: {}", e)))
    }

    fn configure(&self, tab: &Tab) -> anyhow::Result<()> {
        tab.set_user_agent(&self.user_agent, None, None)?;
        tab.call_method(Emulation::SetDefaultBackgroundColorOverride {
            color: Some(DOM::RGBA {
                r: 0,
                g: 0,
                b: 0,
                a: Some(0.0),
            }),
        })?;

        if self.block_auxiliary_resources {
            tab.enable_fetch(None, Some(false))?;
            let interceptor: Arc<dyn RequestInterceptor + Send + Sync> =
                Arc::new(move |_transport, _session_id, event: RequestPausedEvent| {
                    if is_auxiliary(&event.params.resource_type) {
                        debug!("blocking {:?} request to {}", event.params.resource_type, event.params.request.url);
                        RequestPausedDecision::Fail(FailRequest {
                            request_id: event.params.request_id,
                            error_reason: ErrorReason::BlockedByClient,
                        })
                    } else {
                        RequestPausedDecision::Continue(None)
                    }
                });
            tab.enable_request_interception(interceptor)?;
        }
        Ok(())
    }
}

fn is_auxiliary(kind: &ResourceType) -> bool {
    matches!(
        kind,
        ResourceType::Stylesheet | ResourceType::Font | ResourceType::Image | ResourceType::Media
    )
}

impl Renderer for ChromeRenderer {
    type Handle = ChromeHandle;

    fn create_handle(&self) -> Result<ChromeHandle> {
        let tab = self.new_tab()?;
        if let Err(e) = self.configure(&tab) {
            let _ = tab.close(false);
            return Err(Error::HandleCreationError(format!("Failed to configure tab: {}", e)));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("created Chrome tab handle {}", id);
        Ok(ChromeHandle {
            id,
            tab,
            window: self.window,
        })
    }

    fn shutdown(&self) -> Result<()> {
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropping the browser terminates the child process.
        drop(browser);
        Ok(())
    }
}

/// One browser tab.
pub struct ChromeHandle {
    id: u64,
    tab: Arc<Tab>,
    window: Canvas,
}

impl RenderHandle for ChromeHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn render(&mut self, document: &str, canvas: Canvas, timeout: Duration) -> Result<RgbaImage> {
        if canvas.width > self.window.width || canvas.height > self.window.height {
            warn!(
                "canvas {}x{} exceeds the {}x{} browser window; content outside it is lost",
                canvas.width, canvas.height, self.window.width, self.window.height
            );
        }

        let url = format!(
            "data:image/svg+xml;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(document)
        );
        self.tab.set_default_timeout(timeout);
        self.tab
            .navigate_to(&url)
            .map_err(|e| Error::RenderError(format!("Navigation failed: {}", e)))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::RenderError(format!("Wait for navigation failed: {}", e)))?;

        let clip = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: canvas.width as f64,
            height: canvas.height as f64,
            scale: 1.0,
        };
        let png = self
            .tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, Some(clip), true)
            .map_err(|e| Error::RenderError(format!("Screenshot failed: {}", e)))?;

        let decoded = image::load_from_memory_with_format(&png, image::ImageFormat::Png)
            .map_err(|e| Error::RenderError(format!("Failed to decode capture: {}", e)))?;
        Ok(decoded.to_rgba8())
    }

    fn reset(&mut self) -> Result<()> {
        self.tab
            .navigate_to("about:blank")
            .and_then(|tab| tab.wait_until_navigated())
            .map(|_| ())
            .map_err(|e| Error::RenderError(format!("Failed to reset tab: {}", e)))
    }
}

impl Drop for ChromeHandle {
    fn drop(&mut self) {
        if let Err(e) = self.tab.close(false) {
            debug!("closing tab {} failed: {}", self.id, e);
        }
    }
}
