//! Placeholder images for failed renders.
//!
//! The failure text is laid out as a small SVG document and rasterised with
//! resvg against the system fonts.

use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};

use image::codecs::png::PngEncoder;
use image::ImageEncoder;
use resvg::tiny_skia::{Color, Pixmap, Transform};
use resvg::usvg;
use thiserror::Error;
use tracing::debug;

use crate::render::{GraphicFormat, RenderFailure, RenderedImage};

pub const HEADLINE: &str = "Errors generating an image.";

/// Lines kept from the failure text; the rest are summarised in one line.
pub const MAX_LINES: usize = 200;

const FONT_SIZE: u32 = 12;
const LINE_H: u32 = 16;
/// Approximate advance of a monospace glyph at `FONT_SIZE`.
const CHAR_W: f32 = 7.2;
const MARGIN: u32 = 8;
const DEFAULT_WIDTH: u32 = 480;
const MIN_WIDTH: u32 = 64;
const MAX_SIDE: u32 = 4096;

const BACKGROUND: [u8; 3] = [255, 255, 255];
const FRAME: &str = "#c82828";
const HEADER: &str = "#c82828";
const BODY: &str = "#282828";

/// Loaded once; scanning the system fonts is slow.
static FONTDB: LazyLock<Arc<fontdb::Database>> = LazyLock::new(|| {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    debug!(op = "placeholder::fonts", faces = db.len(), "Loaded system fonts");
    Arc::new(db)
});

#[derive(Debug, Error)]
pub enum PlaceholderError {
    #[error("Invalid placeholder document: {0}")]
    Svg(#[from] usvg::Error),

    #[error("Cannot allocate a {width}x{height} canvas")]
    Canvas { width: u32, height: u32 },

    #[error("Failed to encode placeholder: {0}")]
    Encode(#[from] image::ImageError),
}

/// Full placeholder text for a failure.
pub fn failure_text(failure: &RenderFailure) -> String {
    format!("{HEADLINE}\n{}", failure.summary())
}

/// Draws `failure` into a PNG. Non-positive sizes fall back to a default
/// width and a height that fits the text.
pub fn render_failure(failure: &RenderFailure, width: i32, height: i32) -> Result<RenderedImage, PlaceholderError> {
    render_text(&failure_text(failure), width, height)
}

pub fn render_text(text: &str, width: i32, height: i32) -> Result<RenderedImage, PlaceholderError> {
    let width = positive(width).unwrap_or(DEFAULT_WIDTH).clamp(MIN_WIDTH, MAX_SIDE);
    let columns = (((width - 2 * MARGIN) as f32 / CHAR_W) as usize).max(1);
    let lines = layout(text, columns);

    let fitted = 2 * MARGIN + LINE_H * lines.len().max(1) as u32;
    let height = positive(height)
        .unwrap_or(fitted)
        .clamp(2 * MARGIN + LINE_H, MAX_SIDE);

    let svg = document(&lines, width, height);
    let options = usvg::Options {
        fontdb: FONTDB.clone(),
        ..Default::default()
    };
    let tree = usvg::Tree::from_str(&svg, &options)?;

    let mut pixmap = Pixmap::new(width, height).ok_or(PlaceholderError::Canvas { width, height })?;
    let [r, g, b] = BACKGROUND;
    pixmap.fill(Color::from_rgba8(r, g, b, 255));
    resvg::render(&tree, Transform::default(), &mut pixmap.as_mut());

    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(pixmap.data(), width, height, image::ExtendedColorType::Rgba8)?;
    Ok(RenderedImage {
        bytes,
        width,
        height,
        format: GraphicFormat::Png,
        warning: None,
    })
}

fn positive(value: i32) -> Option<u32> {
    u32::try_from(value).ok().filter(|v| *v > 0)
}

/// Wraps every line at `columns` characters and caps the result at
/// `MAX_LINES` plus a summary line.
fn layout(text: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut dropped = 0usize;
    for raw in text.lines() {
        let chars: Vec<char> = raw.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
        let chunks = chars.len().div_ceil(columns).max(1);
        if lines.len() >= MAX_LINES {
            dropped += chunks;
            continue;
        }
        if chars.is_empty() {
            lines.push(String::new());
            continue;
        }
        for chunk in chars.chunks(columns) {
            if lines.len() < MAX_LINES {
                lines.push(chunk.iter().collect());
            } else {
                dropped += 1;
            }
        }
    }
    if dropped > 0 {
        lines.push(format!("... {dropped} more lines"));
    }
    lines
}

fn document(lines: &[String], width: u32, height: u32) -> String {
    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" xml:space="preserve" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    );
    let _ = write!(
        svg,
        r#"<rect x="0.5" y="0.5" width="{}" height="{}" fill="none" stroke="{FRAME}" stroke-width="1"/>"#,
        width - 1,
        height - 1
    );
    let mut baseline = MARGIN + FONT_SIZE;
    for (idx, line) in lines.iter().enumerate() {
        if baseline + MARGIN / 2 > height {
            break;
        }
        let color = if idx == 0 { HEADER } else { BODY };
        let _ = write!(
            svg,
            r#"<text x="{MARGIN}" y="{baseline}" font-family="monospace" font-size="{FONT_SIZE}" fill="{color}">{}</text>"#,
            escape(line)
        );
        baseline += LINE_H;
    }
    svg.push_str("</svg>");
    svg
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::FailureKind;

    #[test]
    fn test_failure_text_starts_with_headline() {
        let mut failure = RenderFailure::new(FailureKind::NoOutputProduced, "Graphviz produced no output");
        failure.diagnostic_output = "syntax error in line 1 near '->'".into();
        let text = failure_text(&failure);
        assert!(text.starts_with(HEADLINE));
        assert!(text.contains("syntax error in line 1"));
    }

    #[test]
    fn test_placeholder_is_decodable_png_of_requested_size() {
        let image = render_text("Errors generating an image.\nboom", 320, 100).unwrap();
        assert_eq!(image.format, GraphicFormat::Png);
        let decoded = image::load_from_memory(&image.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 100));
    }

    #[test]
    fn test_placeholder_fits_text_without_size() {
        let text = (0..12).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let image = render_text(&text, 0, 0).unwrap();
        assert_eq!(image.width, DEFAULT_WIDTH);
        assert_eq!(image.height, 2 * MARGIN + 12 * LINE_H);
    }

    #[test]
    fn test_frame_is_drawn() {
        let image = render_text("x", 100, 40).unwrap();
        let decoded = image::load_from_memory(&image.bytes).unwrap().to_rgba8();
        let edge = decoded.get_pixel(0, 20);
        assert!(edge[0] > 150 && edge[1] < 100, "frame pixel {edge:?}");
        assert_eq!(decoded.get_pixel(98, 38).0, [255, 255, 255, 255]);
    }

    #[test]
    fn test_non_ascii_and_markup_are_accepted() {
        let image = render_text("Ошибка: <узел> & \"край\" ✗\tend", 240, 60).unwrap();
        assert_eq!((image.width, image.height), (240, 60));
    }

    #[test]
    fn test_huge_diagnostics_are_capped() {
        let mut failure = RenderFailure::new(FailureKind::NoOutputProduced, "Graphviz produced no output");
        failure.diagnostic_output = "Warning: node n1, port p unrecognized\n".repeat(256 * 1024 / 38);

        let image = render_failure(&failure, 0, 0).unwrap();
        assert_eq!(image.width, DEFAULT_WIDTH);
        assert!(image.height <= 2 * MARGIN + (MAX_LINES as u32 + 1) * LINE_H);

        let lines = layout(&failure_text(&failure), 60);
        assert_eq!(lines.len(), MAX_LINES + 1);
        assert!(lines[MAX_LINES].ends_with("more lines"));
    }

    #[test]
    fn test_requested_size_is_clamped() {
        let wide = render_text("x", 100_000, 50).unwrap();
        assert_eq!((wide.width, wide.height), (MAX_SIDE, 50));
        let tall = render_text("x", 10, 100_000).unwrap();
        assert_eq!((tall.width, tall.height), (MIN_WIDTH, MAX_SIDE));
    }

    #[test]
    fn test_layout_wraps_long_lines() {
        assert_eq!(layout("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(layout("a\n\nb", 10), vec!["a", "", "b"]);
    }

    #[test]
    fn test_escape_markup() {
        assert_eq!(escape("a<b & 'c'"), "a&lt;b &amp; &apos;c&apos;");
    }
}
