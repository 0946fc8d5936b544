//! Gemini-backed language model
//!
//! Planning goes through deterministic intent routing first; Gemini is
//! only asked when no intent is obvious. Answers are streamed straight
//! from `streamGenerateContent`. Without an API key the model behaves
//! exactly like `HeuristicModel`.

use super::{word_deltas, HeuristicModel, LanguageModel};
use crate::error::OrchestrationError;
use crate::gemini::GeminiClient;
use crate::models::{ToolCall, ToolCallResult, ToolSpec};
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const ROUTER_INSTRUCTION: &str =
    "You route financial questions to data tools. Reply with JSON only.";

const ANSWER_INSTRUCTION: &str = "You are a concise financial analyst. \
     Ground every figure in the tool results you are given and never invent prices.";

pub struct GeminiModel {
    client: Arc<GeminiClient>,
}

#[derive(Debug, Deserialize)]
struct PlannedCalls {
    #[serde(default)]
    calls: Vec<PlannedCall>,
}

#[derive(Debug, Deserialize)]
struct PlannedCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl GeminiModel {
    pub fn new(client: Arc<GeminiClient>) -> Self {
        Self { client }
    }

    fn build_plan_prompt(query: &str, candidates: &[ToolSpec]) -> String {
        let tools: Vec<String> = candidates
            .iter()
            .map(|c| format!("{} – {} (input schema: {})", c.name, c.description, c.input_schema))
            .collect();

        format!(
            r#"You are a financial tool router.

Decide which of the available tools must be called to answer the user.
Call a tool more than once when the question needs several inputs
(e.g. one quote per ticker).

USER QUERY:
{}

Available tools:
- {}

Rules:
- Only use the tools listed above
- Arguments must match the tool's input schema
- Return ONLY valid JSON
- No explanation text
- JSON format:

{{
  "calls": [
    {{ "name": "get_stock_quote", "arguments": {{ "symbol": "AAPL" }} }}
  ]
}}
"#,
            query,
            tools.join("\n- "),
        )
    }

    fn build_answer_prompt(query: &str, results: &[ToolCallResult]) -> String {
        let observations: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "tool": r.call.name,
                    "arguments": r.call.arguments,
                    "outcome": r.outcome,
                })
            })
            .collect();

        format!(
            "Answer the user's question using only the tool results below. \
             If a tool failed or timed out, say the data is unavailable.\n\n\
             USER QUERY:\n{}\n\nTOOL RESULTS:\n{}",
            query,
            serde_json::to_string_pretty(&observations).unwrap_or_default(),
        )
    }
}

/// Parse the router's JSON, keeping only calls that name a candidate.
fn parse_plan_response(response: &str, candidates: &[ToolSpec]) -> Result<Vec<ToolCall>> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let planned: PlannedCalls = serde_json::from_str(cleaned).map_err(|e| {
        OrchestrationError::LlmError(format!(
            "Failed to parse Gemini plan response: {} | raw={}",
            e, response
        ))
    })?;

    let calls = planned
        .calls
        .into_iter()
        .filter(|c| {
            let known = candidates.iter().any(|s| s.name == c.name);
            if !known {
                warn!(tool = %c.name, "Gemini proposed a tool outside the candidate set");
            }
            known
        })
        .enumerate()
        .map(|(i, c)| {
            let arguments = if c.arguments.is_null() { json!({}) } else { c.arguments };
            ToolCall::new(format!("call_{}", i + 1), c.name, arguments)
        })
        .collect();

    Ok(calls)
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn plan_calls(&self, query: &str, candidates: &[ToolSpec]) -> Result<Vec<ToolCall>> {
        // Deterministic intent routing for unambiguous requests
        let routed = HeuristicModel::route(query, candidates);
        if !routed.is_empty() || !self.client.is_configured() {
            return Ok(if routed.is_empty() {
                HeuristicModel::plan(query, candidates)
            } else {
                routed
            });
        }

        let prompt = Self::build_plan_prompt(query, candidates);
        let response = self.client.generate(&prompt, Some(ROUTER_INSTRUCTION)).await?;
        debug!(chars = response.len(), "Gemini plan received");

        match parse_plan_response(&response, candidates) {
            Ok(calls) => Ok(calls),
            Err(e) => {
                warn!(error = %e, "Falling back to heuristic plan");
                Ok(HeuristicModel::plan(query, candidates))
            }
        }
    }

    async fn stream_answer(
        &self,
        query: &str,
        results: &[ToolCallResult],
    ) -> Result<BoxStream<'static, Result<String>>> {
        if self.client.is_configured() {
            let prompt = Self::build_answer_prompt(query, results);
            return self
                .client
                .stream_generate(&prompt, Some(ANSWER_INSTRUCTION))
                .await;
        }

        let answer = HeuristicModel::summarize(query, results);
        Ok(stream::iter(word_deltas(&answer).into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::GeminiClient;
    use crate::tools::create_default_registry;

    fn catalog() -> Vec<ToolSpec> {
        create_default_registry(None, Arc::new(GeminiClient::new(String::new()))).catalog()
    }

    #[test]
    fn test_parse_plan_filters_unknown_tools() {
        let raw = r#"```json
{"calls": [
  {"name": "get_stock_quote", "arguments": {"symbol": "AAPL"}},
  {"name": "backtester", "arguments": {}},
  {"name": "news"}
]}
```"#;
        let calls = parse_plan_response(raw, &catalog()).unwrap();

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments, json!({"symbol": "AAPL"}));
        assert_eq!(calls[1].name, "news");
        assert_eq!(calls[1].arguments, json!({}));
    }

    #[test]
    fn test_parse_plan_rejects_prose() {
        assert!(parse_plan_response("I would call the quote tool.", &catalog()).is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_model_routes_heuristically() {
        let model = GeminiModel::new(Arc::new(GeminiClient::new(String::new())));
        let calls = model
            .plan_calls("What is Apple's stock price?", &catalog())
            .await
            .unwrap();

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"symbol": "AAPL"}));
    }
}
