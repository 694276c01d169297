//! Scripted page analyzer and recording model invoker.
//!
//! Test pages are a PNG signature followed by UTF-8 text. The analyzer
//! returns that text; text starting with `FAIL` fails permanently and text
//! starting with `FLAKY` fails transiently on the first call.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use docflow::capability::{
    DocumentText, ModelInvoker, PageAnalysis, PageAnalyzer, Synthesis, TemplateSummarizer,
};
use docflow::CapabilityError;

pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Builds a page image carrying `text`.
pub fn page(text: &str) -> Vec<u8> {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(text.as_bytes());
    bytes
}

#[derive(Default)]
pub struct ScriptedAnalyzer {
    calls: AtomicUsize,
    flaky_seen: Mutex<HashSet<String>>,
}

impl ScriptedAnalyzer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PageAnalyzer for ScriptedAnalyzer {
    fn analyze(&self, image: &[u8], _model_id: &str) -> Result<PageAnalysis, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = image
            .strip_prefix(PNG_SIGNATURE)
            .map(|rest| String::from_utf8_lossy(rest).into_owned())
            .ok_or_else(|| CapabilityError::permanent("not a test page"))?;

        if text.starts_with("FAIL") {
            return Err(CapabilityError::permanent(format!("unreadable: {}", text)));
        }
        if text.starts_with("FLAKY") && self.flaky_seen.lock().unwrap().insert(text.clone()) {
            return Err(CapabilityError::transient("analyzer timed out"));
        }
        Ok(PageAnalysis {
            text,
            confidence: 0.9,
        })
    }
}

/// Delegates to `TemplateSummarizer` and records the text it was given.
#[derive(Default)]
pub struct RecordingInvoker {
    inputs: Mutex<Vec<String>>,
    fail_permanently: bool,
}

impl RecordingInvoker {
    pub fn failing() -> Self {
        Self {
            inputs: Mutex::new(Vec::new()),
            fail_permanently: true,
        }
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

impl ModelInvoker for RecordingInvoker {
    fn synthesize(
        &self,
        document: &DocumentText,
        model_id: &str,
    ) -> Result<Synthesis, CapabilityError> {
        self.inputs.lock().unwrap().push(document.plain_text());
        if self.fail_permanently {
            return Err(CapabilityError::permanent("model rejected the document"));
        }
        TemplateSummarizer.synthesize(document, model_id)
    }
}
