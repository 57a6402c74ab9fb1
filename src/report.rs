//! PDF summary reports of reviewed predictions.
//!
//! Coordinates are millimetres from the top-left corner of an A4 page, the
//! same way the layout is specified; they are flipped to PDF user space only
//! when drawing.

use std::sync::Arc;

use chrono::Utc;
use deunicode::deunicode;
use image::DynamicImage;
use printpdf::{
    BuiltinFont, Color, Image, ImageTransform, IndirectFontRef, Line, Mm, PdfDocument,
    PdfDocumentReference, PdfLayerReference, Point, Rgb,
};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::storage::{ObjectStore, UrlMode};

pub type Record = Map<String, Value>;

pub const DEFAULT_TITLE: &str = "OCT Prediction Summary Report.";

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const BOTTOM_MARGIN: f32 = 10.0;
const CONTINUATION_TOP: f32 = 20.0;

const LOGO_X: f32 = 6.0;
const LOGO_Y: f32 = 6.0;
const LOGO_WIDTH: f32 = 1586.0 / 80.0;
const LOGO_HEIGHT: f32 = 1920.0 / 80.0;
const LOGO_DPI: f32 = 300.0;

const TITLE_SIZE: f32 = 16.0;
const TITLE_BAND: f32 = 40.0;
const ACCENT: (u8, u8, u8) = (20, 105, 255);
const SEPARATOR_Y: f32 = 35.0;
const SEPARATOR_WIDTH: f32 = 0.5;

const RECORDS_START: f32 = 50.0;
const RECORD_SPACING: f32 = 10.0;
const LINE_HEIGHT: f32 = 5.0;
const TEXT_X: f32 = 10.0;
const TEXT_SIZE: f32 = 12.0;
// baseline offset inside the 10 mm text cell
const TEXT_BASELINE: f32 = 6.5;

const PT_TO_MM: f32 = 25.4 / 72.0;

/// Fields the frontend sends that never appear in the report.
const DROPPED_FIELDS: [&str; 5] = [
    "uploadedImageUrl",
    "gradCamImageUrl",
    "predictedLabel",
    "isConfirmed",
    "inferenceTime",
];

/// Drops display-only fields and renames the reviewed label and confidence.
///
/// Remaining fields keep their order; `assigned label` and
/// `prediction confidence` are appended last.
pub fn clean_record(record: Record) -> Record {
    let assigned = record
        .get("assignedLabel")
        .cloned()
        .unwrap_or_else(|| Value::String("Null".to_string()));
    let confidence = record
        .get("predictionConfidence")
        .cloned()
        .unwrap_or_else(|| Value::from(0.0));

    let mut cleaned: Record = record
        .into_iter()
        .filter(|(key, _)| {
            !DROPPED_FIELDS.contains(&key.as_str())
                && key != "assignedLabel"
                && key != "predictionConfidence"
        })
        .collect();
    cleaned.insert("assigned label".to_string(), assigned);
    cleaned.insert("prediction confidence".to_string(), confidence);
    cleaned
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

pub fn format_field(key: &str, value: &Value) -> String {
    format!("{}: {}.", capitalize(key), display_value(value))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    /// Index of the record this line belongs to.
    pub block: usize,
    pub x: f32,
    pub y: f32,
    pub text: String,
}

/// Positions of every record line, split into pages.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportLayout {
    pub title: String,
    pub pages: Vec<Vec<TextLine>>,
}

impl ReportLayout {
    pub fn build(title: &str, records: &[Record]) -> Self {
        let mut pages = vec![Vec::new()];
        let mut y = RECORDS_START;

        for (block, record) in records.iter().enumerate() {
            y += RECORD_SPACING;
            for (key, value) in record {
                if y + TEXT_BASELINE > PAGE_HEIGHT - BOTTOM_MARGIN {
                    pages.push(Vec::new());
                    y = CONTINUATION_TOP;
                }
                if let Some(page) = pages.last_mut() {
                    page.push(TextLine {
                        block,
                        x: TEXT_X,
                        y,
                        text: format_field(key, value),
                    });
                }
                y += LINE_HEIGHT;
            }
        }

        Self {
            title: title.to_string(),
            pages,
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &TextLine> {
        self.pages.iter().flatten()
    }

    pub fn block_count(&self) -> usize {
        self.lines()
            .map(|l| l.block + 1)
            .max()
            .unwrap_or(0)
    }
}

// The builtin Helvetica faces only draw ASCII reliably.
fn pdf_text(text: &str) -> String {
    deunicode(text)
        .chars()
        .map(|c| match c {
            c if c.is_ascii_graphic() => c,
            c if c.is_ascii_whitespace() => ' ',
            _ => '?',
        })
        .collect()
}

fn pdf_error(e: impl std::fmt::Display) -> Error {
    Error::Report(e.to_string())
}

fn accent() -> Color {
    let (r, g, b) = ACCENT;
    Color::Rgb(Rgb::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0, None))
}

fn black() -> Color {
    Color::Rgb(Rgb::new(0.0, 0.0, 0.0, None))
}

// top-left millimetres to PDF user space
fn flip(y: f32) -> Mm {
    Mm(PAGE_HEIGHT - y)
}

fn draw_logo(layer: &PdfLayerReference, logo: &DynamicImage) {
    let rgb = DynamicImage::ImageRgb8(logo.to_rgb8());
    let natural_w = rgb.width() as f32 / LOGO_DPI * 25.4;
    let natural_h = rgb.height() as f32 / LOGO_DPI * 25.4;

    Image::from_dynamic_image(&rgb).add_to_layer(
        layer.clone(),
        ImageTransform {
            translate_x: Some(Mm(LOGO_X)),
            translate_y: Some(flip(LOGO_Y + LOGO_HEIGHT)),
            scale_x: Some(LOGO_WIDTH / natural_w),
            scale_y: Some(LOGO_HEIGHT / natural_h),
            dpi: Some(LOGO_DPI),
            ..Default::default()
        },
    );
}

fn draw_header(layer: &PdfLayerReference, title: &str, bold: &IndirectFontRef) {
    // Helvetica-Bold averages a little over half an em per glyph
    let approx_width = title.chars().count() as f32 * TITLE_SIZE * 0.55 * PT_TO_MM;
    let x = ((PAGE_WIDTH - approx_width) / 2.0).max(0.0);
    let baseline = TITLE_BAND / 2.0 + TITLE_SIZE * PT_TO_MM / 2.0;

    layer.set_fill_color(accent());
    layer.use_text(title, TITLE_SIZE, Mm(x), flip(baseline), bold);

    layer.set_outline_color(accent());
    layer.set_outline_thickness(SEPARATOR_WIDTH / PT_TO_MM);
    layer.add_line(Line {
        points: vec![
            (Point::new(Mm(5.0), flip(SEPARATOR_Y)), false),
            (Point::new(Mm(205.0), flip(SEPARATOR_Y)), false),
        ],
        is_closed: false,
    });
}

/// Renders the layout, with the optional logo on the first page, to PDF bytes.
pub fn render_pdf(layout: &ReportLayout, logo: Option<&DynamicImage>) -> Result<Vec<u8>> {
    let (doc, first_page, first_layer) =
        PdfDocument::new(&layout.title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
    let regular = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(pdf_error)?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(pdf_error)?;

    let first = doc.get_page(first_page).get_layer(first_layer);
    if let Some(logo) = logo {
        draw_logo(&first, logo);
    }
    draw_header(&first, &pdf_text(&layout.title), &bold);

    for (i, lines) in layout.pages.iter().enumerate() {
        let layer = if i == 0 {
            first.clone()
        } else {
            let (page, layer) = doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
            doc.get_page(page).get_layer(layer)
        };
        layer.set_fill_color(black());
        for line in lines {
            layer.use_text(
                pdf_text(&line.text),
                TEXT_SIZE,
                Mm(line.x),
                flip(line.y + TEXT_BASELINE),
                &regular,
            );
        }
    }

    save(doc)
}

fn save(doc: PdfDocumentReference) -> Result<Vec<u8>> {
    doc.save_to_bytes().map_err(pdf_error)
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub title: String,
    /// Storage prefix for generated reports.
    pub reports_path: String,
    pub logo_path: Option<String>,
    pub url_mode: UrlMode,
}

pub struct ReportGenerator {
    store: Arc<dyn ObjectStore>,
    config: ReportConfig,
}

impl ReportGenerator {
    pub fn new(store: Arc<dyn ObjectStore>, config: ReportConfig) -> Self {
        Self { store, config }
    }

    /// Cleans the records, renders the PDF, stores it and returns its URL.
    ///
    /// Nothing is uploaded unless every earlier step succeeded.
    pub async fn generate(&self, records: Vec<Record>) -> Result<String> {
        let logo = match &self.config.logo_path {
            Some(path) => {
                let bytes = self.store.download(path).await?;
                Some(image::load_from_memory(&bytes).map_err(|e| {
                    Error::Report(format!("logo {} is not an image: {}", path, e))
                })?)
            }
            None => None,
        };

        let cleaned: Vec<Record> = records.into_iter().map(clean_record).collect();
        let layout = ReportLayout::build(&self.config.title, &cleaned);
        let count = cleaned.len();

        let pdf = tokio::task::spawn_blocking(move || render_pdf(&layout, logo.as_ref()))
            .await
            .map_err(|e| Error::Server(format!("report task failed: {}", e)))??;

        let name = format!(
            "{}/oct_summary_report_{}.pdf",
            self.config.reports_path.trim_end_matches('/'),
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        );
        self.store.upload(&name, pdf, "application/pdf").await?;
        info!(path = %name, records = count, "Stored PDF report");

        self.store.url_for(&name, self.config.url_mode)
    }
}
