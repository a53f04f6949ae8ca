//! Layerforge
//!
//! Converts an SVG document into a layered PSD file in which every distinguishable
//! vector element becomes an independently editable raster layer.
//!
//! # Pipeline
//!
//! - **Extraction**: the markup is split into named layer fragments ([`extract`])
//! - **Rasterization**: each fragment is rendered alone on a pooled rendering handle
//!   ([`pool`], [`rasterize`], [`scheduler`])
//! - **Composition**: the rasters are stacked into a PSD container ([`compose`])
//!
//! Rendering goes through a [`Renderer`] backend. The default backend is the
//! pure-Rust `native` rasterizer; the `cdp` feature adds a headless Chrome backend.
//!
//! # Example
//!
//! ```no_run
//! use layerforge::{ConversionEngine, ConvertOptions, EngineConfig};
//! use layerforge::native::NativeRenderer;
//!
//! # async fn run() -> layerforge::Result<()> {
//! let config = EngineConfig::default();
//! let engine = ConversionEngine::new(NativeRenderer::new(&config), config)?;
//! engine.initialize_for_parallel_conversion().await?;
//!
//! let svg = r#"<svg viewBox="0 0 100 50"><g><rect id="bg" width="100" height="50"/></g></svg>"#;
//! let path = engine
//!     .convert_document_to_layered_image(svg, &ConvertOptions::default())
//!     .await?;
//! println!("wrote {}", path.display());
//!
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod compose;
pub mod document;
pub mod engine;
pub mod extract;
pub mod pool;
pub mod rasterize;
pub mod scheduler;

// Pure-Rust rasterizer backend (resvg)
#[cfg(feature = "native")]
pub mod native;

// Headless Chrome backend over the DevTools protocol
#[cfg(feature = "cdp")]
pub mod cdp;

pub use compose::{Compression, Composer, LayeredDocument};
pub use document::{SharedDefinitions, VectorDocument};
pub use engine::{cleanup_temp_file, ConversionEngine};
pub use extract::{ExtractionTier, LayerDescriptor, LayerExtractor};
pub use pool::{HandlePool, Lease, PoolStats};
pub use rasterize::{LayerRasterizer, RasterLayer};
pub use scheduler::BatchScheduler;

/// Configuration for the conversion engine
///
/// The defaults favour a small, warm pool: creating the rendering engine is
/// expensive, creating a handle inside it is cheap, and the pool keeps up to
/// `pool_size` idle handles around between conversions.
///
/// # Examples
///
/// ```
/// let cfg = layerforge::EngineConfig::default();
/// assert_eq!(cfg.batch_size, 6);
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of idle rendering handles kept by the pool
    pub pool_size: usize,
    /// Extra short-lived handles allowed on top of `pool_size` when the pool is exhausted
    pub max_ephemeral_handles: usize,
    /// Number of layers rendered concurrently before the next batch starts
    pub batch_size: usize,
    /// Per-layer render timeout in milliseconds
    pub render_timeout_ms: u64,
    /// Timeout for fetching remote documents in milliseconds
    pub fetch_timeout_ms: u64,
    /// Whether rendering handles refuse stylesheets, fonts, images and media
    pub block_auxiliary_resources: bool,
    /// Channel compression used when composing the layered file
    pub compression: Compression,
    /// Directory for output files (`std::env::temp_dir()` when unset)
    pub temp_dir: Option<PathBuf>,
    /// User agent sent when fetching remote documents
    pub user_agent: String,
    /// Browser window size for the CDP backend; canvases larger than this are clipped
    pub chrome_window: Canvas,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().clamp(1, 4),
            max_ephemeral_handles: 2,
            batch_size: 6,
            render_timeout_ms: 5000,
            fetch_timeout_ms: 30000,
            block_auxiliary_resources: true,
            compression: Compression::Rle,
            temp_dir: None,
            user_agent: format!("layerforge/{}", env!("CARGO_PKG_VERSION")),
            chrome_window: Canvas {
                width: 2048,
                height: 2048,
            },
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `LAYERFORGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_number("LAYERFORGE_POOL_SIZE")? {
            config.pool_size = v as usize;
        }
        if let Some(v) = env_number("LAYERFORGE_MAX_EPHEMERAL_HANDLES")? {
            config.max_ephemeral_handles = v as usize;
        }
        if let Some(v) = env_number("LAYERFORGE_BATCH_SIZE")? {
            config.batch_size = v as usize;
        }
        if let Some(v) = env_number("LAYERFORGE_RENDER_TIMEOUT_MS")? {
            config.render_timeout_ms = v;
        }
        if let Ok(dir) = std::env::var("LAYERFORGE_TEMP_DIR") {
            if !dir.trim().is_empty() {
                config.temp_dir = Some(PathBuf::from(dir));
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::ConfigError("pool_size must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::ConfigError("batch_size must be at least 1".into()));
        }
        if self.render_timeout_ms == 0 {
            return Err(Error::ConfigError("render_timeout_ms must be positive".into()));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(Error::ConfigError("fetch_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    /// Upper bound on simultaneously leased handles.
    pub fn handle_ceiling(&self) -> usize {
        self.pool_size + self.max_ephemeral_handles
    }
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::ConfigError(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Output canvas dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

/// Per-conversion options
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Canvas width; defaults to the document width
    pub width: Option<u32>,
    /// Canvas height; defaults to the document height
    pub height: Option<u32>,
    /// Fill for the merged composite image (`#rgb`, `#rrggbb`, `#rrggbbaa` or `transparent`)
    pub background_color: Option<String>,
    /// Overrides `EngineConfig::compression`
    pub compression: Option<Compression>,
}

/// A reusable connection to a rendering engine.
///
/// Handles are owned by a [`HandlePool`] and lent out one task at a time, so
/// implementations never see concurrent calls on the same handle.
pub trait RenderHandle: Send + 'static {
    /// Identifier unique within the owning renderer
    fn id(&self) -> u64;

    /// Render a standalone SVG document into a `canvas`-sized RGBA buffer with
    /// a transparent background.
    ///
    /// `timeout` is advisory: backends that can bound their own work should,
    /// but the caller abandons the handle once it elapses either way.
    fn render(&mut self, document: &str, canvas: Canvas, timeout: Duration) -> Result<RgbaImage>;

    /// Return the handle to a blank state before it goes back to the pool.
    fn reset(&mut self) -> Result<()>;
}

/// A rendering engine able to hand out [`RenderHandle`]s.
pub trait Renderer: Send + Sync + 'static {
    type Handle: RenderHandle;

    /// Create a new handle, configured once for isolated fragment rendering.
    fn create_handle(&self) -> Result<Self::Handle>;

    /// Tear down the underlying engine. Handles created afterwards fail.
    fn shutdown(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.pool_size >= 1 && config.pool_size <= 4);
        assert_eq!(config.batch_size, 6);
        assert_eq!(config.render_timeout_ms, 5000);
        assert!(config.block_auxiliary_resources);
        assert_eq!(config.handle_ceiling(), config.pool_size + 2);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = EngineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let config = EngineConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: EngineConfig = serde_json::from_str(r#"{"pool_size": 2, "compression": "raw"}"#).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.compression, Compression::Raw);
        assert_eq!(config.batch_size, 6);
    }

    // Only test in this binary that touches LAYERFORGE_* variables.
    #[test]
    fn test_from_env_overrides_and_rejects_garbage() {
        std::env::set_var("LAYERFORGE_BATCH_SIZE", " 3 ");
        std::env::set_var("LAYERFORGE_TEMP_DIR", "/tmp/layerforge-env");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.temp_dir, Some(PathBuf::from("/tmp/layerforge-env")));

        std::env::set_var("LAYERFORGE_BATCH_SIZE", "many");
        assert!(matches!(EngineConfig::from_env(), Err(Error::ConfigError(_))));

        std::env::set_var("LAYERFORGE_BATCH_SIZE", "0");
        assert!(EngineConfig::from_env().is_err());

        std::env::remove_var("LAYERFORGE_BATCH_SIZE");
        std::env::remove_var("LAYERFORGE_TEMP_DIR");
    }
}
