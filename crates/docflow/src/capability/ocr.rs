use std::io::Cursor;

use super::{PageAnalysis, PageAnalyzer};
use crate::error::CapabilityError;

/// Local page analyzer backed by Tesseract.
///
/// The model id is ignored; confidence is Tesseract's mean word confidence
/// scaled to 0.0..=1.0.
#[derive(Debug, Clone)]
pub struct OcrPageAnalyzer {
    languages: String,
}

impl OcrPageAnalyzer {
    pub fn new(languages: &[String]) -> Self {
        let languages = if languages.is_empty() {
            "eng".to_string()
        } else {
            languages.join("+")
        };
        Self { languages }
    }
}

impl PageAnalyzer for OcrPageAnalyzer {
    fn analyze(&self, image: &[u8], _model_id: &str) -> Result<PageAnalysis, CapabilityError> {
        let _span = tracing::info_span!("capability.ocr").entered();

        let img = image::load_from_memory(image)
            .map_err(|e| CapabilityError::permanent(format!("Failed to load image: {}", e)))?;

        let mut png_data = Vec::new();
        img.write_to(&mut Cursor::new(&mut png_data), image::ImageFormat::Png)
            .map_err(|e| CapabilityError::permanent(format!("Failed to convert image: {}", e)))?;

        let mut lt = leptess::LepTess::new(None, &self.languages).map_err(|e| {
            CapabilityError::transient(format!("Failed to initialize Tesseract: {}", e))
        })?;
        lt.set_image_from_mem(&png_data)
            .map_err(|e| CapabilityError::permanent(format!("Failed to set image for OCR: {}", e)))?;

        let text = lt
            .get_utf8_text()
            .map_err(|e| CapabilityError::permanent(format!("OCR failed: {}", e)))?;
        let confidence = (f64::from(lt.mean_text_conf()) / 100.0).clamp(0.0, 1.0);

        Ok(PageAnalysis { text, confidence })
    }
}
