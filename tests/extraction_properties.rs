//! Extraction cascade properties over a varied corpus

use layerforge::extract::{ExtractionTier, FULL_DOCUMENT};
use layerforge::{LayerExtractor, VectorDocument};

const CORPUS: &[&str] = &[
    "",
    "not markup at all",
    "<svg",
    "<svg/>",
    "<svg><g></g></svg>",
    r#"<svg viewBox="0 0 10 10"><rect/></svg>"#,
    r#"<svg viewBox="0 0 10 10"><g><circle r="1"><rect></g></svg>"#,
    r#"<?xml version="1.0"?><!DOCTYPE svg><svg><text>unterminated"#,
    r##"<svg><defs><path id="p" d="M0 0"/></defs><use href="#p"/></svg>"##,
    r#"<svg><foreignObject><div>html</div></foreignObject></svg>"#,
    "<svg><g><g><g><polyline points='0,0 1,1'/></g></g></g></svg>",
    "<div><svg><rect id='a'/></svg></div>",
    "<<<>>><svg>&&&<rect class=''/></svg>",
];

#[test]
fn extraction_is_total() {
    for markup in CORPUS {
        let layers = LayerExtractor::extract(&VectorDocument::parse(*markup));
        assert!(!layers.is_empty(), "no layers for {:?}", markup);
        assert!(layers.iter().all(|l| !l.name.is_empty()), "blank name for {:?}", markup);
    }
}

#[test]
fn documents_without_primitives_become_one_layer() {
    for markup in ["", "<svg/>", "<svg><g></g></svg>", "<svg><image href='x.png'/></svg>"] {
        let extraction = LayerExtractor::extract_with_tier(&VectorDocument::parse(markup));
        assert_eq!(extraction.tier, ExtractionTier::WholeDocument);
        assert_eq!(extraction.descriptors.len(), 1);
        assert_eq!(extraction.descriptors[0].name, FULL_DOCUMENT);
        assert_eq!(extraction.descriptors[0].markup_fragment, markup);
    }
}

#[test]
fn grouped_primitives_are_named_by_position() {
    let kinds = ["path", "rect", "circle", "ellipse", "line", "polyline", "polygon", "text"];
    let mut svg = String::from(r#"<svg viewBox="0 0 100 100">"#);
    let mut expected = Vec::new();
    for g in 0..3 {
        svg.push_str("<g>");
        for (i, kind) in kinds.iter().enumerate().skip(g) {
            svg.push_str(&format!("<{0}></{0}>", kind));
            expected.push(format!("{}_{}_{}", kind, g, i - g));
        }
        svg.push_str("</g>");
    }
    svg.push_str("</svg>");

    let extraction = LayerExtractor::extract_with_tier(&VectorDocument::parse(svg));
    assert_eq!(extraction.tier, ExtractionTier::Grouped);
    let names: Vec<_> = extraction.descriptors.iter().map(|d| d.name.clone()).collect();
    assert_eq!(names, expected);
}

#[test]
fn tiers_are_exclusive() {
    // The identified rectangle outside any group is not picked up once the
    // grouped tier has matched.
    let doc = VectorDocument::parse(r#"<svg><rect id="loose"/><g><circle/></g></svg>"#);
    let extraction = LayerExtractor::extract_with_tier(&doc);
    assert_eq!(extraction.tier, ExtractionTier::Grouped);
    let names: Vec<_> = extraction.descriptors.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["circle_0_0"]);
}

#[test]
fn dimensions_fall_back_to_defaults() {
    let doc = VectorDocument::parse("<svg><rect/></svg>");
    assert_eq!((doc.width(), doc.height()), (800, 600));
    let doc = VectorDocument::parse(r#"<svg width="2in" height="0.5in"><rect/></svg>"#);
    assert_eq!((doc.width(), doc.height()), (192, 48));
}
