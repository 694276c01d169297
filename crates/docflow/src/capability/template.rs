use super::{DocumentText, ModelInvoker, Synthesis};
use crate::error::CapabilityError;

/// Upper bound on extracted text embedded in the report, in characters.
pub const MAX_REPORT_TEXT_CHARS: usize = 50_000;

/// Renders the report around an overview.
///
/// The extracted text section is cut at [`MAX_REPORT_TEXT_CHARS`] and
/// marked with `...` when cut.
pub fn render_report(overview: &str, document: &DocumentText) -> String {
    let sections = document.markdown_sections();
    let mut text: String = sections.chars().take(MAX_REPORT_TEXT_CHARS).collect();
    if text.len() < sections.len() {
        text.push_str("...");
    }
    format!(
        "## Summary\n{}\n\n---\n\n## Extracted Texts\n{}\n",
        overview.trim(),
        text
    )
}

/// Deterministic model invoker that summarizes without calling a model.
#[derive(Debug, Clone, Default)]
pub struct TemplateSummarizer;

impl ModelInvoker for TemplateSummarizer {
    fn synthesize(
        &self,
        document: &DocumentText,
        model_id: &str,
    ) -> Result<Synthesis, CapabilityError> {
        let overview = format!(
            "Document processed with {}. Contains {} pages.",
            model_id,
            document.page_count()
        );
        Ok(Synthesis {
            markdown_content: render_report(&overview, document),
            document_overview: overview,
        })
    }
}
