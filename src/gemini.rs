//! Gemini REST client
//!
//! Two entry points: `generate` for one-shot completions (tool routing,
//! LLM-answered query tools) and `stream_generate`, which follows
//! `streamGenerateContent?alt=sse` and yields text chunks as the model
//! produces them.

use crate::error::OrchestrationError;
use crate::Result;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error};

const MODEL_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash";

pub struct GeminiClient {
    client: Client,
    api_key: String,
    model_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key,
            model_url: MODEL_URL.to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Complete `prompt` in one round trip.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let url = format!("{}:generateContent?key={}", self.model_url, self.api_key);
        let response = self.post(&url, prompt, system).await?;

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| OrchestrationError::LlmError(format!("Gemini parse error: {}", e)))?;

        if let Some(usage) = &body.usage_metadata {
            debug!(
                prompt_tokens = usage.prompt_token_count,
                completion_tokens = usage.candidates_token_count,
                finish_reason = ?body.finish_reason(),
                "Gemini completion received"
            );
        }

        let text = body.text();
        if text.is_empty() {
            return Err(OrchestrationError::LlmError(
                "Empty response from Gemini".to_string(),
            ));
        }
        Ok(text)
    }

    /// Stream the completion of `prompt` as text deltas.
    pub async fn stream_generate(
        &self,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let url = format!(
            "{}:streamGenerateContent?alt=sse&key={}",
            self.model_url, self.api_key
        );
        let response = self.post(&url, prompt, system).await?;

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        Ok(text_deltas(chunks))
    }

    async fn post(&self, url: &str, prompt: &str, system: Option<&str>) -> Result<reqwest::Response> {
        if !self.is_configured() {
            return Err(OrchestrationError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let request = GenerateRequest::new(prompt, system);
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Gemini request failed");
                OrchestrationError::LlmError(format!("Gemini API error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, body = %body, "Gemini returned an error");
            return Err(OrchestrationError::LlmError(format!(
                "Gemini API error ({}): {}",
                status, body
            )));
        }
        Ok(response)
    }
}

//
// ================= Wire types =================
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

impl GenerateRequest {
    fn new(prompt: &str, system: Option<&str>) -> Self {
        Self {
            contents: vec![Content::text(prompt)],
            system_instruction: system.map(Content::text),
            generation_config: GenerationConfig {
                temperature: 0.2,
                max_output_tokens: 1024,
            },
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(text: &str) -> Self {
        Self {
            parts: vec![Part {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

/// Body of a completion, and of every `data:` frame of a streamed one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseCandidate {
    #[serde(default)]
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .map(|c| c.content.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.candidates.first()?.finish_reason.as_deref()
    }
}

//
// ================= SSE decoding =================
//

/// Text carried by one SSE line, if any.
fn parse_sse_line(line: &str) -> Option<Result<String>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str::<GenerateResponse>(data) {
        Ok(chunk) => {
            let text = chunk.text();
            (!text.is_empty()).then_some(Ok(text))
        }
        Err(e) => Some(Err(OrchestrationError::LlmError(format!(
            "Gemini stream parse error: {}",
            e
        )))),
    }
}

struct SseState {
    chunks: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl SseState {
    fn drain_lines(&mut self) {
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if let Some(item) = parse_sse_line(&String::from_utf8_lossy(&line)) {
                self.pending.push_back(item);
            }
        }
    }
}

/// Decode raw SSE bytes into text deltas. Lines are split on bytes, so
/// multi-byte characters may straddle chunk boundaries.
fn text_deltas(
    chunks: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
) -> BoxStream<'static, Result<String>> {
    let state = SseState {
        chunks,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.chunks.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(OrchestrationError::LlmError(format!(
                        "Gemini stream interrupted: {}",
                        e
                    ))));
                }
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    if let Some(item) = parse_sse_line(&String::from_utf8_lossy(&rest)) {
                        state.pending.push_back(item);
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(text: &str) -> String {
        format!(
            "data: {}\r\n\r\n",
            json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
        )
    }

    fn chunked(parts: Vec<Vec<u8>>) -> BoxStream<'static, std::result::Result<Vec<u8>, String>> {
        stream::iter(parts.into_iter().map(Ok)).boxed()
    }

    #[test]
    fn test_request_uses_camel_case_and_optional_system() {
        let with_system = serde_json::to_value(GenerateRequest::new("AAPL?", Some("be brief"))).unwrap();
        assert_eq!(with_system["contents"][0]["parts"][0]["text"], "AAPL?");
        assert_eq!(with_system["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(with_system["generationConfig"]["maxOutputTokens"], 1024);

        let without = serde_json::to_value(GenerateRequest::new("AAPL?", None)).unwrap();
        assert!(without.get("systemInstruction").is_none());
    }

    #[test]
    fn test_response_text_joins_parts() {
        let raw = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "Apple is "}, {"text": "up today."}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 5}
        }"#;

        let response: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.text(), "Apple is up today.");
        assert_eq!(response.finish_reason(), Some("STOP"));
    }

    #[test]
    fn test_sse_line_parsing() {
        assert_eq!(parse_sse_line(frame("Hello").trim()).unwrap().unwrap(), "Hello");
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("").is_none());
        assert!(parse_sse_line(r#"data: {"candidates": []}"#).is_none());
        assert!(parse_sse_line("data: {not json").unwrap().is_err());
    }

    #[tokio::test]
    async fn test_text_deltas_survive_split_chunks() {
        let body = format!("{}{}", frame("Apple "), frame("gained €2"));
        let bytes = body.into_bytes();
        // Split inside the multi-byte euro sign
        let euro = bytes.iter().position(|&b| b == 0xE2).unwrap();
        let parts = vec![
            bytes[..7].to_vec(),
            bytes[7..euro + 1].to_vec(),
            bytes[euro + 1..].to_vec(),
        ];

        let deltas: Vec<String> = text_deltas(chunked(parts))
            .map(|d| d.unwrap())
            .collect()
            .await;

        assert_eq!(deltas, vec!["Apple ", "gained €2"]);
    }

    #[tokio::test]
    async fn test_text_deltas_flush_unterminated_tail_and_report_errors() {
        let tail = frame("done").trim_end().to_string().into_bytes();
        let deltas: Vec<String> = text_deltas(chunked(vec![tail]))
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["done"]);

        let broken = stream::iter(vec![
            Ok(frame("partial").into_bytes()),
            Err("connection reset".to_string()),
        ])
        .boxed();
        let items: Vec<Result<String>> = text_deltas(broken).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(items[1].as_ref().unwrap_err().to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let client = GeminiClient::new(String::new());
        assert!(!client.is_configured());

        let err = client.generate("what is RSI?", None).await.unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
        assert!(client.stream_generate("what is RSI?", None).await.is_err());
    }
}
