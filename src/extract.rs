//! Layer extraction: split a vector document into named, independently renderable fragments
//!
//! Extraction is a fallback cascade. Each tier only runs when the previous one
//! found nothing:
//!
//! 1. [`ExtractionTier::Grouped`]: primitives inside top-level `<g>` containers
//! 2. [`ExtractionTier::Identified`]: primitives carrying an `id` or `class`
//! 3. [`ExtractionTier::Unidentified`]: every primitive
//! 4. [`ExtractionTier::WholeDocument`]: the entire input as a single layer
//!
//! The markup goes through a tolerant HTML5 tree builder (SVG is handled as
//! foreign content), so unclosed or malformed tags never abort extraction.

use crate::document::{self, is_definition_container, outer_markup, open_tag, VectorDocument};
use log::{debug, warn};
use scraper::ElementRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the single descriptor produced when no primitive could be isolated.
pub const FULL_DOCUMENT: &str = "full_document";

/// A named fragment of the source document that becomes one raster layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub name: String,
    pub markup_fragment: String,
}

/// Which tier of the cascade produced a set of descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionTier {
    Grouped,
    Identified,
    Unidentified,
    WholeDocument,
}

/// Result of running the cascade.
#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub tier: ExtractionTier,
    pub descriptors: Vec<LayerDescriptor>,
}

/// Drawable element kinds, in the order used for `Layer_<index>_<counter>` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Path,
    Rect,
    Circle,
    Ellipse,
    Line,
    Polyline,
    Polygon,
    Text,
}

impl Primitive {
    pub const ALL: [Primitive; 8] = [
        Primitive::Path,
        Primitive::Rect,
        Primitive::Circle,
        Primitive::Ellipse,
        Primitive::Line,
        Primitive::Polyline,
        Primitive::Polygon,
        Primitive::Text,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.tag() == tag)
    }

    pub fn tag(self) -> &'static str {
        match self {
            Primitive::Path => "path",
            Primitive::Rect => "rect",
            Primitive::Circle => "circle",
            Primitive::Ellipse => "ellipse",
            Primitive::Line => "line",
            Primitive::Polyline => "polyline",
            Primitive::Polygon => "polygon",
            Primitive::Text => "text",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Stateless entry point for the extraction cascade.
pub struct LayerExtractor;

impl LayerExtractor {
    /// Extract layer descriptors in bottom-to-top paint order. Never empty.
    pub fn extract(document: &VectorDocument) -> Vec<LayerDescriptor> {
        Self::extract_with_tier(document).descriptors
    }

    /// Like [`extract`](Self::extract) but also reports which tier matched.
    pub fn extract_with_tier(document: &VectorDocument) -> Extraction {
        let html = document::parse_markup(document.markup());
        let scan_root = document::root_svg(&html).unwrap_or_else(|| html.root_element());

        let tiers: [(ExtractionTier, fn(ElementRef<'_>) -> Vec<LayerDescriptor>); 3] = [
            (ExtractionTier::Grouped, grouped),
            (ExtractionTier::Identified, identified),
            (ExtractionTier::Unidentified, unidentified),
        ];
        for (tier, run) in tiers {
            let descriptors = run(scan_root);
            if !descriptors.is_empty() {
                debug!("{:?} extraction produced {} layers", tier, descriptors.len());
                return Extraction { tier, descriptors };
            }
        }

        warn!(
            "no drawable primitives found in {} bytes of markup; using the whole document as one layer",
            document.markup().len()
        );
        Extraction {
            tier: ExtractionTier::WholeDocument,
            descriptors: vec![LayerDescriptor {
                name: FULL_DOCUMENT.to_string(),
                markup_fragment: document.markup().to_string(),
            }],
        }
    }
}

fn grouped(root: ElementRef<'_>) -> Vec<LayerDescriptor> {
    let mut groups = Vec::new();
    collect_top_level_groups(root, &mut groups);

    let mut out = Vec::new();
    for (group_index, group) in groups.into_iter().enumerate() {
        let mut primitives = Vec::new();
        collect_primitives(group, &mut primitives);
        for (element_index, (kind, el)) in primitives.into_iter().enumerate() {
            let name = identifier(el)
                .unwrap_or_else(|| format!("{}_{}_{}", kind, group_index, element_index));
            out.push(LayerDescriptor {
                name,
                markup_fragment: isolate(el, root),
            });
        }
    }
    out
}

fn identified(root: ElementRef<'_>) -> Vec<LayerDescriptor> {
    let mut primitives = Vec::new();
    collect_primitives(root, &mut primitives);

    let mut out = Vec::new();
    for (kind, el) in primitives {
        let attrs = el.value();
        if attrs.attr("id").is_none() && attrs.attr("class").is_none() {
            continue;
        }
        let name = identifier(el).unwrap_or_else(|| format!("Layer_{}_{}", kind.index(), out.len()));
        out.push(LayerDescriptor {
            name,
            markup_fragment: isolate(el, root),
        });
    }
    out
}

fn unidentified(root: ElementRef<'_>) -> Vec<LayerDescriptor> {
    let mut primitives = Vec::new();
    collect_primitives(root, &mut primitives);

    let mut counters = [0usize; Primitive::ALL.len()];
    primitives
        .into_iter()
        .map(|(kind, el)| {
            let index = counters[kind.index()];
            counters[kind.index()] += 1;
            LayerDescriptor {
                name: format!("{}_{}", kind, index),
                markup_fragment: isolate(el, root),
            }
        })
        .collect()
}

/// Non-blank `id`, else non-blank `class`.
fn identifier(el: ElementRef<'_>) -> Option<String> {
    ["id", "class"]
        .iter()
        .filter_map(|attr| el.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// `<g>` elements with no `<g>` ancestor, skipping definition subtrees.
fn collect_top_level_groups<'a>(el: ElementRef<'a>, out: &mut Vec<ElementRef<'a>>) {
    for child in el.children().filter_map(ElementRef::wrap) {
        let name = child.value().name();
        if name == "g" {
            out.push(child);
        } else if !is_definition_container(name) && Primitive::from_tag(name).is_none() {
            collect_top_level_groups(child, out);
        }
    }
}

/// Primitives below `el` in document order. Does not descend into primitives
/// (a `<text>` keeps its `<tspan>`s) or into definition subtrees.
fn collect_primitives<'a>(el: ElementRef<'a>, out: &mut Vec<(Primitive, ElementRef<'a>)>) {
    for child in el.children().filter_map(ElementRef::wrap) {
        let name = child.value().name();
        if let Some(kind) = Primitive::from_tag(name) {
            out.push((kind, child));
        } else if !is_definition_container(name) {
            collect_primitives(child, out);
        }
    }
}

/// The element's markup wrapped in shallow copies of its containers below
/// `root`, so inherited transforms and paint survive isolation.
fn isolate(el: ElementRef<'_>, root: ElementRef<'_>) -> String {
    let mut ancestors: Vec<ElementRef<'_>> = el
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take_while(|a| a.id() != root.id())
        .collect();
    ancestors.reverse();

    let mut fragment = String::new();
    for a in &ancestors {
        fragment.push_str(&open_tag(*a));
    }
    fragment.push_str(&outer_markup(el));
    for a in ancestors.iter().rev() {
        fragment.push_str("</");
        fragment.push_str(a.value().name());
        fragment.push('>');
    }
    fragment
}
