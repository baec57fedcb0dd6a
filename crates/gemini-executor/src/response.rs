//! Upstream response parsing
//!
//! A valid 2xx body carries either a non-empty `candidates` array or an
//! `error` object; anything else is structurally invalid. Candidate parts
//! split into answer text and thought text: non-thought parts join into
//! `text`, thought parts into `thoughts`, each newline-separated.

use serde::Deserialize;

/// Top-level generate-content response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub error: Option<ApiError>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
}

#[derive(Debug, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    /// Marks thinking output when true.
    #[serde(default)]
    pub thought: Option<bool>,
}

/// Error object the upstream can embed in a 2xx body.
#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

/// Token accounting reported by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: Option<u64>,
    #[serde(default)]
    pub candidates_token_count: Option<u64>,
    #[serde(default)]
    pub total_token_count: Option<u64>,
    #[serde(default)]
    pub thoughts_token_count: Option<u64>,
}

impl GenerateResponse {
    /// Structurally valid: something to act on (candidates or an error).
    pub fn is_valid(&self) -> bool {
        !self.candidates.is_empty() || self.error.is_some()
    }

    /// Split the first candidate's parts into `(text, thoughts)`.
    pub fn flatten_parts(&self) -> (String, Option<String>) {
        let mut text_parts = Vec::new();
        let mut thought_parts = Vec::new();
        if let Some(content) = self.candidates.first().and_then(|c| c.content.as_ref()) {
            for part in &content.parts {
                let Some(text) = &part.text else { continue };
                if part.thought.unwrap_or(false) {
                    thought_parts.push(text.as_str());
                } else {
                    text_parts.push(text.as_str());
                }
            }
        }
        let thoughts = if thought_parts.is_empty() {
            None
        } else {
            Some(thought_parts.join("\n"))
        };
        (text_parts.join("\n"), thoughts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_response() {
        let json = r#"{
            "candidates": [{"content": {"parts": [{"text": "ok"}]}}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1, "totalTokenCount": 6}
        }"#;
        let response: GenerateResponse = serde_json::from_str(json).unwrap();
        assert!(response.is_valid());
        let (text, thoughts) = response.flatten_parts();
        assert_eq!(text, "ok");
        assert!(thoughts.is_none());
        let usage = response.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, Some(5));
        assert_eq!(usage.total_token_count, Some(6));
    }

    #[test]
    fn splits_thought_and_answer_parts() {
        let json = r#"{"candidates": [{"content": {"parts": [
            {"text": "thinking...", "thought": true},
            {"text": "first"},
            {"text": "more thinking", "thought": true},
            {"text": "second"}
        ]}}]}"#;
        let response: GenerateResponse = serde_json::from_str(json).unwrap();
        let (text, thoughts) = response.flatten_parts();
        assert_eq!(text, "first\nsecond");
        assert_eq!(thoughts.as_deref(), Some("thinking...\nmore thinking"));
    }

    #[test]
    fn parses_embedded_error_object() {
        let json = r#"{"error": {"code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED"}}"#;
        let response: GenerateResponse = serde_json::from_str(json).unwrap();
        assert!(response.is_valid());
        let error = response.error.unwrap();
        assert_eq!(error.code, 429);
        assert_eq!(error.status, "RESOURCE_EXHAUSTED");
    }

    #[test]
    fn empty_object_is_invalid_structure() {
        let response: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(!response.is_valid());
    }

    #[test]
    fn candidate_without_content_flattens_empty() {
        let json = r#"{"candidates": [{}]}"#;
        let response: GenerateResponse = serde_json::from_str(json).unwrap();
        assert!(response.is_valid());
        let (text, thoughts) = response.flatten_parts();
        assert!(text.is_empty());
        assert!(thoughts.is_none());
    }
}
