//! Handle exclusivity under concurrent load

mod common;

use common::{config_in, temp_dir, MockRenderer, HANG_MARKER};
use layerforge::{ConversionEngine, ConvertOptions, HandlePool};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_never_share_a_handle() {
    let dir = temp_dir("pool");
    let config = config_in(&dir);
    let (renderer, state) = MockRenderer::new();
    let pool = Arc::new(HandlePool::new(renderer, &config));
    pool.warm_up(config.pool_size).await.unwrap();

    let busy = Arc::new(Mutex::new(HashSet::new()));
    let cycles = 3 * config.pool_size;
    let tasks: Vec<_> = (0..cycles)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let busy = Arc::clone(&busy);
            tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                let id = lease.handle_id().unwrap();
                assert!(busy.lock().unwrap().insert(id), "handle {} leased twice", id);
                tokio::time::sleep(Duration::from_millis(20)).await;
                busy.lock().unwrap().remove(&id);
                pool.release(lease).await;
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle <= pool.capacity());
    assert!(state.created.load(Ordering::SeqCst) <= cycles as u64);

    pool.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batched_rendering_respects_the_ceiling() {
    let dir = temp_dir("pool-engine");
    let config = config_in(&dir);
    let ceiling = config.handle_ceiling();
    let (renderer, state) = MockRenderer::new();
    state.set_delay(Duration::from_millis(30));
    let engine = ConversionEngine::new(renderer, config).unwrap();

    let shapes: String = (0..12).map(|i| format!(r#"<rect id="r{}" x="{}"/>"#, i, i)).collect();
    let svg = format!(r#"<svg viewBox="0 0 16 16"><g>{}</g></svg>"#, shapes);

    let bytes = engine
        .convert_document_to_bytes(&svg, &ConvertOptions::default())
        .await
        .unwrap();
    let doc = layerforge::compose::inspect::read_layered_document(&bytes).unwrap();
    assert_eq!(doc.layers.len(), 12);
    assert_eq!(doc.layers[0].name, "r11");
    assert_eq!(doc.layers[11].name, "r0");

    assert_eq!(state.overlaps.load(Ordering::SeqCst), 0);
    assert!(state.max_concurrent.load(Ordering::SeqCst) <= ceiling);
    assert!(engine.pool().stats().idle <= engine.pool().capacity());

    engine.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_renders_keep_their_slot() {
    let dir = temp_dir("pool-timeout");
    let config = layerforge::EngineConfig {
        pool_size: 1,
        max_ephemeral_handles: 0,
        render_timeout_ms: 100,
        ..config_in(&dir)
    };
    let (renderer, state) = MockRenderer::new();
    let engine = ConversionEngine::new(renderer, config).unwrap();

    let svg = format!(
        r#"<svg viewBox="0 0 10 10"><rect id="a" {m}="1"/><rect id="b" {m}="1"/><rect id="c"/></svg>"#,
        m = HANG_MARKER
    );
    let bytes = engine
        .convert_document_to_bytes(&svg, &ConvertOptions::default())
        .await
        .unwrap();
    let doc = layerforge::compose::inspect::read_layered_document(&bytes).unwrap();
    assert_eq!(doc.layer_names(), vec!["c"]);

    // Each timed-out render still runs to completion before the next starts.
    assert_eq!(state.max_concurrent.load(Ordering::SeqCst), 1);
    assert_eq!(state.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(state.renders.load(Ordering::SeqCst), 3);

    engine.close().await.unwrap();
    std::fs::remove_dir_all(&dir).unwrap();
}
