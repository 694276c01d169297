//! External capabilities consumed by the workers.
//!
//! Both are black boxes behind a trait: a page analyzer turns one page
//! image into text, a model invoker turns a whole document's text into an
//! overview and a markdown report.

pub mod catalog;
pub mod http;
#[cfg(feature = "ocr")]
pub mod ocr;
pub mod template;

use crate::error::CapabilityError;
use crate::store::{PageResult, ResultStatus};

pub use catalog::ModelCatalog;
pub use http::{HttpModelClient, HttpModelConfig};
#[cfg(feature = "ocr")]
pub use ocr::OcrPageAnalyzer;
pub use template::TemplateSummarizer;

/// Text extracted from a single page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageAnalysis {
    pub text: String,
    /// 0.0 to 1.0.
    pub confidence: f64,
}

pub trait PageAnalyzer: Send + Sync {
    fn analyze(&self, image: &[u8], model_id: &str) -> Result<PageAnalysis, CapabilityError>;
}

/// Overview and report produced for a whole document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub document_overview: String,
    pub markdown_content: String,
}

pub trait ModelInvoker: Send + Sync {
    fn synthesize(
        &self,
        document: &DocumentText,
        model_id: &str,
    ) -> Result<Synthesis, CapabilityError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSection {
    pub page_number: u32,
    pub text: String,
    /// Set when the page could not be analyzed.
    pub failure: Option<String>,
}

/// Page texts of one document in page order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentText {
    sections: Vec<PageSection>,
}

impl DocumentText {
    /// Builds the document from page results, ordering by page number
    /// regardless of the order they were stored or passed in.
    pub fn from_pages(pages: &[PageResult]) -> Self {
        let mut sections: Vec<PageSection> = pages
            .iter()
            .map(|p| PageSection {
                page_number: p.page_number,
                text: p.extracted_text.clone(),
                failure: match p.status {
                    ResultStatus::Completed => None,
                    ResultStatus::Error => Some(
                        p.error_message
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    ),
                },
            })
            .collect();
        sections.sort_by_key(|s| s.page_number);
        Self { sections }
    }

    pub fn sections(&self) -> &[PageSection] {
        &self.sections
    }

    pub fn page_count(&self) -> usize {
        self.sections.len()
    }

    /// Page texts joined by blank lines, failed pages omitted.
    pub fn plain_text(&self) -> String {
        self.sections
            .iter()
            .filter(|s| s.failure.is_none())
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// `### Page N` sections separated by horizontal rules.
    pub fn markdown_sections(&self) -> String {
        self.sections
            .iter()
            .map(|s| match &s.failure {
                None => format!("### Page {}\n{}", s.page_number, s.text),
                Some(reason) => format!("### Page {}\nError: {}", s.page_number, reason),
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn page(n: u32, text: &str, status: ResultStatus) -> PageResult {
        PageResult {
            job_id: "j".to_string(),
            page_number: n,
            extracted_text: text.to_string(),
            confidence_score: 0.5,
            status,
            error_message: (status == ResultStatus::Error).then(|| "timeout".to_string()),
            model_id: "m".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_sections_follow_page_number() {
        let doc = DocumentText::from_pages(&[
            page(3, "three", ResultStatus::Completed),
            page(1, "one", ResultStatus::Completed),
            page(2, "two", ResultStatus::Completed),
        ]);
        assert_eq!(doc.plain_text(), "one\n\ntwo\n\nthree");
        assert_eq!(
            doc.markdown_sections(),
            "### Page 1\none\n\n---\n\n### Page 2\ntwo\n\n---\n\n### Page 3\nthree"
        );
    }

    #[test]
    fn test_failed_pages_are_marked() {
        let doc = DocumentText::from_pages(&[
            page(1, "one", ResultStatus::Completed),
            page(2, "", ResultStatus::Error),
        ]);
        assert_eq!(doc.plain_text(), "one");
        assert!(doc.markdown_sections().ends_with("### Page 2\nError: timeout"));
        assert_eq!(doc.page_count(), 2);
    }
}
