//! Public conversion surface
//!
//! [`ConversionEngine`] owns the handle pool and wires extraction, batch
//! rasterization and composition together. It is constructed explicitly and
//! shut down explicitly; there is no process-wide engine.

use crate::compose::{parse_color, Composer, LayeredDocument};
use crate::document::VectorDocument;
use crate::extract::{ExtractionTier, LayerExtractor};
use crate::pool::HandlePool;
use crate::scheduler::BatchScheduler;
use crate::{ConvertOptions, EngineConfig, Error, Renderer, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Converts vector documents into layered raster files.
pub struct ConversionEngine<R: Renderer> {
    config: EngineConfig,
    pool: HandlePool<R>,
    scheduler: BatchScheduler,
    #[cfg(feature = "fetch")]
    client: reqwest::Client,
}

impl<R: Renderer> ConversionEngine<R> {
    pub fn new(renderer: R, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "fetch")]
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.fetch_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            pool: HandlePool::new(renderer, &config),
            scheduler: BatchScheduler::new(&config),
            config,
            #[cfg(feature = "fetch")]
            client,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &HandlePool<R> {
        &self.pool
    }

    /// Pre-create the idle handle set so the first conversion starts warm.
    /// Returns the number of idle handles.
    pub async fn initialize_for_parallel_conversion(&self) -> Result<usize> {
        let idle = self.pool.warm_up(self.config.pool_size).await?;
        info!("conversion engine ready ({} idle rendering handles)", idle);
        Ok(idle)
    }

    /// Extract, rasterize and stack `markup` without serializing it.
    pub async fn render_layers(&self, markup: &str, options: &ConvertOptions) -> Result<LayeredDocument> {
        if self.pool.is_closed() {
            return Err(Error::EngineClosed);
        }
        let started = Instant::now();

        let background = match options.background_color.as_deref() {
            Some(raw) => parse_color(raw)?,
            None => None,
        };
        let document = VectorDocument::parse(markup);
        let canvas = document.canvas(options.width, options.height)?;
        let extraction = LayerExtractor::extract_with_tier(&document);
        if extraction.tier == ExtractionTier::WholeDocument {
            debug!("rendering document as a single layer");
        }

        let layers = self
            .scheduler
            .run(&self.pool, &extraction.descriptors, document.shared(), canvas)
            .await?;

        let doc = LayeredDocument::from_paint_order(canvas.width, canvas.height, layers)?
            .with_background(background);
        info!(
            "converted {}x{} document into {} layers ({:?} extraction) in {:?}",
            canvas.width,
            canvas.height,
            doc.layers().len(),
            extraction.tier,
            started.elapsed()
        );
        Ok(doc)
    }

    /// Convert `markup` and return the serialized layered file.
    pub async fn convert_document_to_bytes(&self, markup: &str, options: &ConvertOptions) -> Result<Vec<u8>> {
        let doc = self.render_layers(markup, options).await?;
        self.composer(options).compose(&doc)
    }

    /// Convert `markup` into a new temporary file. The caller owns the
    /// returned path; see [`cleanup_temp_file`].
    pub async fn convert_document_to_layered_image(
        &self,
        markup: &str,
        options: &ConvertOptions,
    ) -> Result<PathBuf> {
        let doc = self.render_layers(markup, options).await?;
        let path = self.composer(options).write_temp(&doc).await?;
        debug!("wrote layered file {}", path.display());
        Ok(path)
    }

    /// Fetch a remote document and convert it. Non-2xx responses and bodies
    /// without SVG markup fail with `FetchError`; there is no retry.
    #[cfg(feature = "fetch")]
    pub async fn convert_url_to_layered_image(&self, url: &str, options: &ConvertOptions) -> Result<PathBuf> {
        let markup = self.fetch_document(url).await?;
        self.convert_document_to_layered_image(&markup, options).await
    }

    #[cfg(feature = "fetch")]
    async fn fetch_document(&self, raw_url: &str) -> Result<String> {
        if self.pool.is_closed() {
            return Err(Error::EngineClosed);
        }
        let url = url::Url::parse(raw_url)
            .map_err(|e| Error::FetchError(format!("Invalid URL {:?}: {}", raw_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::FetchError(format!("Unsupported URL scheme '{}'", url.scheme())));
        }

        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::FetchError(format!("HTTP GET failed: {}", e)))?;
        let status = res.status();
        if !status.is_success() {
            return Err(Error::FetchError(format!("HTTP {} from {}", status.as_u16(), url)));
        }

        let body = res
            .text()
            .await
            .map_err(|e| Error::FetchError(format!("Failed to read response body: {}", e)))?;
        if !VectorDocument::has_vector_markers(&body) {
            return Err(Error::FetchError(format!("No SVG markup found at {}", url)));
        }
        debug!("fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }

    /// Shut down the pool and the rendering engine. Later conversions fail
    /// with `EngineClosed`.
    pub async fn close(&self) -> Result<()> {
        self.pool.shutdown().await?;
        info!("conversion engine closed");
        Ok(())
    }

    fn composer(&self, options: &ConvertOptions) -> Composer {
        Composer::new(
            options.compression.unwrap_or(self.config.compression),
            self.config.temp_dir.clone(),
        )
    }
}

/// Best-effort removal of a file returned by the engine. Returns whether the
/// file is gone; failures are logged, never raised.
pub fn cleanup_temp_file(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed {}", path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("failed to remove {}: {}", path.display(), e);
            false
        }
    }
}
