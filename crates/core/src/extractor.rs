use crate::error::{Fault, PipelineError};
use lopdf::Document;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor: Send + Sync {
    /// Returns one entry per physical page, in page order. Empty pages are kept.
    fn extract_pages(&self, doc_id: &str, bytes: &[u8]) -> Result<Vec<PageText>, PipelineError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, doc_id: &str, bytes: &[u8]) -> Result<Vec<PageText>, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::extraction(
                doc_id,
                Fault::NotFound,
                "pdf byte stream is empty",
            ));
        }

        let document = Document::load_mem(bytes).map_err(|error| {
            PipelineError::extraction(doc_id, Fault::Malformed, format!("pdf parse error: {error}"))
        })?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document.extract_text(&[page_no]).map_err(|error| {
                PipelineError::extraction(
                    doc_id,
                    Fault::Malformed,
                    format!("page {page_no} is unreadable: {error}"),
                )
            })?;

            pages.push(PageText {
                number: page_no,
                text: normalize_page_text(&text),
            });
        }

        if pages.is_empty() {
            return Err(PipelineError::extraction(
                doc_id,
                Fault::Malformed,
                "pdf has no pages",
            ));
        }

        debug!(doc_id, page_count = pages.len(), "extracted pdf pages");
        Ok(pages)
    }
}

/// Collapses horizontal whitespace and trims lines while keeping paragraph breaks.
pub fn normalize_page_text(text: &str) -> String {
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();
    let blank_lines = BLANK_LINES.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let lines = text
        .replace('\u{a0}', " ")
        .replace("\r\n", "\n")
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    blank_lines.replace_all(lines.trim(), "\n\n").into_owned()
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Hand-assembled PDF with one text line per entry; `None` yields a page without content.
    pub fn pdf_with_pages(pages: &[Option<&str>]) -> Vec<u8> {
        let page_count = pages.len();
        let font_id = 3 + page_count * 2;
        let mut objects: Vec<String> = Vec::new();

        objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
        let kids = (0..page_count)
            .map(|index| format!("{} 0 R", 3 + index * 2))
            .collect::<Vec<_>>()
            .join(" ");
        objects.push(format!("<< /Type /Pages /Kids [{kids}] /Count {page_count} >>"));

        for (index, page) in pages.iter().enumerate() {
            let page_id = 3 + index * 2;
            let content_id = page_id + 1;
            match page {
                Some(_) => objects.push(format!(
                    "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {content_id} 0 R /Resources << /Font << /F1 {font_id} 0 R >> >> >>"
                )),
                None => objects.push(
                    "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>".to_string(),
                ),
            }
            let stream = page
                .map(|text| format!("BT /F1 12 Tf 100 700 Td ({text}) Tj ET"))
                .unwrap_or_default();
            objects.push(format!(
                "<< /Length {} >>\nstream\n{stream}\nendstream",
                stream.len()
            ));
        }
        objects.push("<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string());

        let mut out = b"%PDF-1.4\n".to_vec();
        let mut offsets = Vec::new();
        for (index, body) in objects.iter().enumerate() {
            offsets.push(out.len());
            out.extend_from_slice(format!("{} 0 obj {body} endobj\n", index + 1).as_bytes());
        }

        let xref_start = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
        out.extend_from_slice(b"0000000000 65535 f \n");
        for offset in offsets {
            out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
        }
        out.extend_from_slice(
            format!(
                "trailer << /Size {} /Root 1 0 R >>\nstartxref\n{xref_start}\n%%EOF\n",
                objects.len() + 1
            )
            .as_bytes(),
        );
        out
    }
}
