//! Source documents: canonical dimensions and the definitions every isolated layer needs

use crate::{Canvas, Error, Result};
use scraper::{ElementRef, Html};
use std::fmt;

pub(crate) const SVG_NS: &str = "http://www.w3.org/2000/svg";
pub(crate) const XLINK_NS: &str = "http://www.w3.org/1999/xlink";

/// Fallback size for documents that declare neither a viewBox nor a width/height.
pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;

/// Largest canvas edge the layered container can store.
pub const MAX_CANVAS_EDGE: u32 = 30_000;

/// Elements whose subtree is referenced rather than painted directly.
pub(crate) const DEFINITION_CONTAINERS: &[&str] = &[
    "defs",
    "style",
    "script",
    "clipPath",
    "mask",
    "pattern",
    "symbol",
    "marker",
    "linearGradient",
    "radialGradient",
    "filter",
    "metadata",
    "title",
    "desc",
    "foreignObject",
];

/// Elements copied into every isolated layer document.
const SHARED_ELEMENTS: &[&str] = &[
    "defs",
    "style",
    "linearGradient",
    "radialGradient",
    "pattern",
    "clipPath",
    "mask",
    "filter",
    "symbol",
    "marker",
];

/// Root attributes that inherit into painted content.
const INHERITED_ROOT_ATTRIBUTES: &[&str] = &[
    "fill",
    "fill-opacity",
    "fill-rule",
    "stroke",
    "stroke-width",
    "stroke-opacity",
    "stroke-linecap",
    "stroke-linejoin",
    "stroke-miterlimit",
    "stroke-dasharray",
    "stroke-dashoffset",
    "color",
    "font-family",
    "font-size",
    "font-weight",
    "font-style",
    "letter-spacing",
    "text-anchor",
    "dominant-baseline",
    "visibility",
    "shape-rendering",
    "text-rendering",
    "style",
];

/// The user-space rectangle a document draws into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBox {
    pub min_x: f64,
    pub min_y: f64,
    pub width: f64,
    pub height: f64,
}

impl ViewBox {
    /// Parse `"min-x min-y width height"` (whitespace and/or comma separated).
    pub fn parse(raw: &str) -> Option<Self> {
        let nums = raw
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if nums.len() != 4 || nums.iter().any(|n| !n.is_finite()) {
            return None;
        }
        if nums[2] <= 0.0 || nums[3] <= 0.0 {
            return None;
        }
        Some(Self {
            min_x: nums[0],
            min_y: nums[1],
            width: nums[2],
            height: nums[3],
        })
    }
}

impl fmt::Display for ViewBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.min_x, self.min_y, self.width, self.height)
    }
}

/// Markup shared by every isolated single-layer document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedDefinitions {
    /// Serialized `<defs>`, `<style>` and other referenced-only elements
    pub definitions: String,
    /// Attributes for the isolated document's root element: coordinate system,
    /// extra namespace declarations and inherited paint
    pub root_attributes: Vec<(String, String)>,
}

/// A parsed vector document.
///
/// Holds the raw markup plus everything derived from it up front, so the value
/// can cross await points freely.
#[derive(Debug, Clone)]
pub struct VectorDocument {
    markup: String,
    width: u32,
    height: u32,
    view_box: ViewBox,
    shared: SharedDefinitions,
}

impl VectorDocument {
    /// Parse `markup`. Never fails: unreadable dimensions fall back to
    /// [`DEFAULT_WIDTH`] × [`DEFAULT_HEIGHT`].
    pub fn parse(markup: impl Into<String>) -> Self {
        let markup = markup.into();
        let html = parse_markup(&markup);
        let root = root_svg(&html);

        let (width, height, view_box) = match root {
            Some(svg) => resolve_dimensions(svg),
            None => default_dimensions(),
        };

        let mut shared = SharedDefinitions::default();
        let scan_root = root.unwrap_or_else(|| html.root_element());
        collect_shared(scan_root, &mut shared.definitions);

        shared
            .root_attributes
            .push(("viewBox".to_string(), view_box.to_string()));
        if let Some(svg) = root {
            for (name, value) in svg.value().attrs() {
                let keep = name == "preserveAspectRatio"
                    || (name.starts_with("xmlns:") && name != "xmlns:xlink")
                    || INHERITED_ROOT_ATTRIBUTES.contains(&name);
                if keep {
                    shared.root_attributes.push((name.to_string(), value.to_string()));
                }
            }
        }

        Self {
            markup,
            width,
            height,
            view_box,
            shared,
        }
    }

    pub fn markup(&self) -> &str {
        &self.markup
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn view_box(&self) -> ViewBox {
        self.view_box
    }

    pub fn shared(&self) -> &SharedDefinitions {
        &self.shared
    }

    /// Resolve the output canvas. A single requested edge keeps the document's
    /// aspect ratio.
    pub fn canvas(&self, width: Option<u32>, height: Option<u32>) -> Result<Canvas> {
        let scale = |value: u32, num: u32, den: u32| -> u32 {
            ((value as f64) * (num as f64) / (den as f64)).round().max(1.0) as u32
        };
        let (w, h) = match (width, height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => (w, scale(w, self.height, self.width)),
            (None, Some(h)) => (scale(h, self.width, self.height), h),
            (None, None) => (self.width, self.height),
        };
        if w == 0 || h == 0 {
            return Err(Error::ConfigError(format!("canvas must not be empty, got {}x{}", w, h)));
        }
        if w > MAX_CANVAS_EDGE || h > MAX_CANVAS_EDGE {
            return Err(Error::ConfigError(format!(
                "canvas {}x{} exceeds the {} pixel limit",
                w, h, MAX_CANVAS_EDGE
            )));
        }
        Ok(Canvas { width: w, height: h })
    }

    /// Cheap check that `markup` looks like an SVG document at all.
    pub fn has_vector_markers(markup: &str) -> bool {
        markup.to_ascii_lowercase().contains("<svg")
    }
}

fn default_dimensions() -> (u32, u32, ViewBox) {
    (
        DEFAULT_WIDTH,
        DEFAULT_HEIGHT,
        ViewBox {
            min_x: 0.0,
            min_y: 0.0,
            width: DEFAULT_WIDTH as f64,
            height: DEFAULT_HEIGHT as f64,
        },
    )
}

fn resolve_dimensions(svg: ElementRef<'_>) -> (u32, u32, ViewBox) {
    let el = svg.value();
    if let Some(vb) = el.attr("viewBox").and_then(ViewBox::parse) {
        return (to_pixels(vb.width), to_pixels(vb.height), vb);
    }

    let width = el.attr("width").and_then(parse_length);
    let height = el.attr("height").and_then(parse_length);
    if width.is_none() && height.is_none() {
        return default_dimensions();
    }
    let w = width.unwrap_or(DEFAULT_WIDTH as f64);
    let h = height.unwrap_or(DEFAULT_HEIGHT as f64);
    (
        to_pixels(w),
        to_pixels(h),
        ViewBox {
            min_x: 0.0,
            min_y: 0.0,
            width: w,
            height: h,
        },
    )
}

fn to_pixels(v: f64) -> u32 {
    (v.ceil() as u32).max(1)
}

/// Parse an absolute SVG length into pixels. Percentages and font-relative
/// units have no absolute size and yield `None`.
pub fn parse_length(raw: &str) -> Option<f64> {
    const UNITS: &[(&str, f64)] = &[
        ("px", 1.0),
        ("pt", 4.0 / 3.0),
        ("pc", 16.0),
        ("mm", 96.0 / 25.4),
        ("cm", 96.0 / 2.54),
        ("in", 96.0),
    ];

    let s = raw.trim();
    let (number, factor) = UNITS
        .iter()
        .find_map(|(unit, factor)| s.strip_suffix(unit).map(|n| (n, *factor)))
        .unwrap_or((s, 1.0));
    let value = number.trim().parse::<f64>().ok()? * factor;
    (value.is_finite() && value > 0.0).then_some(value)
}

pub(crate) fn parse_markup(markup: &str) -> Html {
    Html::parse_fragment(markup)
}

/// The outermost `<svg>` element, if any.
pub(crate) fn root_svg(html: &Html) -> Option<ElementRef<'_>> {
    html.root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "svg")
}

pub(crate) fn is_definition_container(name: &str) -> bool {
    DEFINITION_CONTAINERS.contains(&name)
}

/// Serialize an element and its subtree as XML. Comments, doctypes and
/// processing instructions are dropped.
pub(crate) fn outer_markup(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    write_element(el, &mut out);
    out
}

fn write_element(el: ElementRef<'_>, out: &mut String) {
    out.push_str(&start_tag(el));
    if !el.has_children() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            write_element(child_el, out);
        } else if let Some(text) = child.value().as_text() {
            out.push_str(&escape_text(text));
        }
    }
    out.push_str("</");
    out.push_str(el.value().name());
    out.push('>');
}

/// Serialize an element's start tag only.
pub(crate) fn open_tag(el: ElementRef<'_>) -> String {
    let mut tag = start_tag(el);
    tag.push('>');
    tag
}

/// `<name attr="..."` without the closing bracket. Prefixed attributes such as
/// `xlink:href` keep their prefix.
fn start_tag(el: ElementRef<'_>) -> String {
    let mut tag = format!("<{}", el.value().name());
    for (name, value) in el.value().attrs.iter() {
        tag.push(' ');
        if let Some(prefix) = &name.prefix {
            tag.push_str(prefix);
            tag.push(':');
        }
        tag.push_str(&name.local);
        tag.push_str("=\"");
        tag.push_str(&escape_attr(value));
        tag.push('"');
    }
    tag
}

pub(crate) fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub(crate) fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn collect_shared(el: ElementRef<'_>, out: &mut String) {
    for child in el.children().filter_map(ElementRef::wrap) {
        let name = child.value().name();
        if SHARED_ELEMENTS.contains(&name) {
            out.push_str(&outer_markup(child));
        } else {
            collect_shared(child, out);
        }
    }
}
