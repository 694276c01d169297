//! Typed payload contracts for the pipeline topics.
//!
//! Payloads are JSON. Consumers decode through these types and treat any
//! failure as a poison message.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    Invalid(#[from] ValidationError),
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

/// Page work as it travels on `page-processing-topic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageWorkMessage {
    pub job_id: String,
    pub page_number: u32,
    /// Base64 (standard alphabet) page image.
    pub image_data: String,
    #[serde(alias = "llm_model")]
    pub model_id: String,
}

/// A decoded and validated page work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWork {
    pub job_id: String,
    pub page_number: u32,
    pub image: Vec<u8>,
    pub model_id: String,
}

impl PageWorkMessage {
    pub fn new(job_id: &str, page_number: u32, image: &[u8], model_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            page_number,
            image_data: BASE64.encode(image),
            model_id: model_id.to_string(),
        }
    }

    /// Parses and validates a raw payload.
    pub fn decode(payload: &[u8]) -> Result<PageWork, MessageError> {
        let message: PageWorkMessage = serde_json::from_slice(payload)?;
        message.validate()
    }

    fn validate(self) -> Result<PageWork, MessageError> {
        require_non_empty("job_id", &self.job_id)?;
        require_non_empty("model_id", &self.model_id)?;
        if self.page_number < 1 {
            return Err(ValidationError::new("page_number", "must be at least 1").into());
        }
        let image = BASE64
            .decode(self.image_data.as_bytes())
            .map_err(|e| ValidationError::new("image_data", format!("invalid base64: {}", e)))?;
        if image.is_empty() {
            return Err(ValidationError::new("image_data", "must not be empty").into());
        }

        Ok(PageWork {
            job_id: self.job_id,
            page_number: self.page_number,
            image,
            model_id: self.model_id,
        })
    }
}

/// Published on `aggregation-trigger-topic` once all pages of a job are in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationTrigger {
    pub job_id: String,
    #[serde(alias = "llm_model")]
    pub model_id: String,
    pub total_pages: u32,
}

impl AggregationTrigger {
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let trigger: AggregationTrigger = serde_json::from_slice(payload)?;
        require_non_empty("job_id", &trigger.job_id)?;
        require_non_empty("model_id", &trigger.model_id)?;
        if trigger.total_pages < 1 {
            return Err(ValidationError::new("total_pages", "must be at least 1").into());
        }
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_work_decodes() {
        let payload = serde_json::to_vec(&PageWorkMessage::new("job", 2, b"\x89PNG", "m")).unwrap();
        let work = PageWorkMessage::decode(&payload).unwrap();
        assert_eq!(work.job_id, "job");
        assert_eq!(work.page_number, 2);
        assert_eq!(work.image, b"\x89PNG");
    }

    #[test]
    fn test_legacy_model_field_is_accepted() {
        let payload = br#"{"job_id":"j","page_number":1,"image_data":"aGk=","llm_model":"gemini-2.5-pro"}"#;
        let work = PageWorkMessage::decode(payload).unwrap();
        assert_eq!(work.model_id, "gemini-2.5-pro");
    }

    #[test]
    fn test_page_work_rejects_bad_payloads() {
        let cases: [&[u8]; 5] = [
            b"not json",
            br#"{"job_id":"j","page_number":1}"#,
            br#"{"job_id":"j","page_number":0,"image_data":"aGk=","model_id":"m"}"#,
            br#"{"job_id":"j","page_number":1,"image_data":"***","model_id":"m"}"#,
            br#"{"job_id":"","page_number":1,"image_data":"aGk=","model_id":"m"}"#,
        ];
        for payload in cases {
            assert!(
                PageWorkMessage::decode(payload).is_err(),
                "accepted {:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn test_negative_page_number_is_malformed() {
        let payload = br#"{"job_id":"j","page_number":-1,"image_data":"aGk=","model_id":"m"}"#;
        assert!(matches!(
            PageWorkMessage::decode(payload),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn test_aggregation_trigger_validation() {
        let ok = br#"{"job_id":"j","model_id":"m","total_pages":3}"#;
        assert_eq!(AggregationTrigger::decode(ok).unwrap().total_pages, 3);

        let zero = br#"{"job_id":"j","model_id":"m","total_pages":0}"#;
        assert!(matches!(
            AggregationTrigger::decode(zero),
            Err(MessageError::Invalid(_))
        ));
    }
}
