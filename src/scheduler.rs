//! Batch scheduling of layer rasterization
//!
//! Layers are rendered in fixed-size batches. Every task in a batch runs
//! concurrently and owns its own lease; a failing layer is logged and dropped
//! without disturbing its siblings or later batches.

use crate::document::SharedDefinitions;
use crate::extract::LayerDescriptor;
use crate::pool::HandlePool;
use crate::rasterize::{LayerRasterizer, RasterLayer};
use crate::{Canvas, EngineConfig, Error, Renderer, Result};
use futures::future::join_all;
use log::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BatchScheduler {
    batch_size: usize,
    rasterizer: LayerRasterizer,
}

impl BatchScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            rasterizer: LayerRasterizer::new(config.render_timeout()),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Rasterize every descriptor, preserving input order minus failures.
    ///
    /// Fails only when nothing rendered (`CompositionError`) or when the pool
    /// itself is unusable (`HandleCreationError`, `EngineClosed`).
    pub async fn run<R: Renderer>(
        &self,
        pool: &HandlePool<R>,
        descriptors: &[LayerDescriptor],
        shared: &SharedDefinitions,
        canvas: Canvas,
    ) -> Result<Vec<RasterLayer>> {
        let mut layers = Vec::with_capacity(descriptors.len());
        let mut dropped = 0usize;

        for (index, batch) in descriptors.chunks(self.batch_size).enumerate() {
            debug!("rendering batch {} ({} layers)", index, batch.len());
            let results = join_all(
                batch
                    .iter()
                    .map(|descriptor| self.render_one(pool, descriptor, shared, canvas)),
            )
            .await;

            let mut fatal = None;
            for (descriptor, result) in batch.iter().zip(results) {
                match result {
                    Ok(layer) => layers.push(layer),
                    Err(e) if e.is_fatal() => {
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        dropped += 1;
                        warn!("dropping layer '{}': {}", descriptor.name, e);
                    }
                }
            }
            if let Some(e) = fatal {
                return Err(e);
            }
        }

        if layers.is_empty() {
            return Err(Error::CompositionError(format!(
                "none of the {} layers could be rasterized",
                descriptors.len()
            )));
        }
        info!(
            "rasterized {} of {} layers ({} dropped)",
            layers.len(),
            descriptors.len(),
            dropped
        );
        Ok(layers)
    }

    async fn render_one<R: Renderer>(
        &self,
        pool: &HandlePool<R>,
        descriptor: &LayerDescriptor,
        shared: &SharedDefinitions,
        canvas: Canvas,
    ) -> Result<RasterLayer> {
        let mut lease = pool.acquire().await?;
        let result = self
            .rasterizer
            .rasterize(descriptor, shared, canvas, &mut lease)
            .await;
        pool.release(lease).await;
        result
    }
}
