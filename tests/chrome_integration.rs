//! Conversions through headless Chrome

#![cfg(feature = "cdp")]

use layerforge::cdp::ChromeRenderer;
use layerforge::compose::inspect::read_layered_document;
use layerforge::{ConversionEngine, ConvertOptions, EngineConfig};

#[tokio::test]
#[ignore] // Requires Chrome to be installed
async fn test_bg_dot_with_chrome() {
    let config = EngineConfig {
        pool_size: 2,
        ..Default::default()
    };
    let renderer = ChromeRenderer::new(&config).expect("Failed to launch Chrome");
    let engine = ConversionEngine::new(renderer, config).unwrap();
    engine.initialize_for_parallel_conversion().await.unwrap();

    let svg = r##"<svg viewBox="0 0 100 50"><g><rect id="bg" width="100" height="50" fill="#eee"/><circle id="dot" cx="50" cy="25" r="10" fill="red"/></g></svg>"##;
    let bytes = engine
        .convert_document_to_bytes(svg, &ConvertOptions::default())
        .await
        .unwrap();
    let doc = read_layered_document(&bytes).unwrap();
    assert_eq!((doc.width, doc.height), (100, 50));
    assert_eq!(doc.layer_names(), vec!["dot", "bg"]);
    let dot = &doc.layers[0];
    assert!(dot.left >= 38 && dot.right <= 62);

    engine.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Chrome to be installed
async fn test_external_images_are_blocked() {
    let config = EngineConfig::default();
    let renderer = ChromeRenderer::new(&config).expect("Failed to launch Chrome");
    let engine = ConversionEngine::new(renderer, config).unwrap();

    // No primitives: the whole document is one layer, and its only content is blocked.
    let svg = r#"<svg viewBox="0 0 20 20"><image href="https://example.com/a.png" width="20" height="20"/></svg>"#;
    let bytes = engine
        .convert_document_to_bytes(svg, &ConvertOptions::default())
        .await
        .unwrap();
    let doc = read_layered_document(&bytes).unwrap();
    assert_eq!(doc.layer_names(), vec!["full_document"]);
    let layer = &doc.layers[0];
    assert_eq!(layer.right - layer.left, 0);

    engine.close().await.unwrap();
}
