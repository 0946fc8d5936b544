//! Language-model step
//!
//! The model sees only the selector's candidates. It turns a query into
//! concrete tool calls, then narrates an answer over the results as a
//! stream of text deltas.

use crate::error::OrchestrationError;
use crate::models::{ToolCall, ToolCallResult, ToolOutcome, ToolSpec};
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::Mutex;

pub mod gemini;
pub use gemini::GeminiModel;

/// Trait for the LLM step (external collaborator)
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Emit zero or more tool calls, each naming one of `candidates`.
    async fn plan_calls(&self, query: &str, candidates: &[ToolSpec]) -> Result<Vec<ToolCall>>;

    /// Narrative answer over the tool results, as token deltas.
    async fn stream_answer(
        &self,
        query: &str,
        results: &[ToolCallResult],
    ) -> Result<BoxStream<'static, Result<String>>>;
}

/// Split text into word-sized deltas, keeping whitespace attached.
pub fn word_deltas(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

// ===== Deterministic intent routing =====

/// Company names mapped to their tickers.
const KNOWN_COMPANIES: &[(&str, &str)] = &[
    ("apple", "AAPL"),
    ("microsoft", "MSFT"),
    ("google", "GOOGL"),
    ("alphabet", "GOOGL"),
    ("amazon", "AMZN"),
    ("tesla", "TSLA"),
    ("nvidia", "NVDA"),
    ("meta", "META"),
    ("netflix", "NFLX"),
];

/// Uppercase words that look like tickers but are not.
const NOT_TICKERS: &[&str] = &["I", "A", "CEO", "ETF", "GDP", "CPI", "USD", "RSI", "PE", "IPO"];

/// Tickers mentioned in `query`, in order, without duplicates.
pub fn extract_tickers(query: &str) -> Vec<String> {
    let mut tickers: Vec<String> = Vec::new();
    let mut push = |t: String| {
        if !tickers.contains(&t) {
            tickers.push(t);
        }
    };

    for word in query.split(|c: char| !c.is_alphanumeric() && c != '\'') {
        let word = word.trim_end_matches("'s").trim_matches('\'');
        if word.is_empty() {
            continue;
        }

        let lowered = word.to_lowercase();
        if let Some((_, ticker)) = KNOWN_COMPANIES.iter().find(|(name, _)| *name == lowered) {
            push(ticker.to_string());
            continue;
        }

        let looks_like_ticker = (1..=5).contains(&word.len())
            && word.chars().all(|c| c.is_ascii_uppercase())
            && !NOT_TICKERS.contains(&word);
        if looks_like_ticker {
            push(word.to_string());
        }
    }

    tickers
}

/// Keyword-routed model. Used when no LLM is configured and as the
/// fallback when the remote model's plan cannot be parsed.
#[derive(Debug, Default, Clone)]
pub struct HeuristicModel;

impl HeuristicModel {
    /// Calls for every intent the query clearly names. May be empty.
    pub fn route(query: &str, candidates: &[ToolSpec]) -> Vec<ToolCall> {
        let lowered = query.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));
        let offered = |name: &str| candidates.iter().any(|c| c.name == name);

        let mut calls = Vec::new();
        let mut next_id = {
            let mut n = 0;
            move || {
                n += 1;
                format!("call_{}", n)
            }
        };

        if offered("get_stock_quote") {
            for symbol in extract_tickers(query) {
                calls.push(ToolCall::new(
                    next_id(),
                    "get_stock_quote",
                    json!({ "symbol": symbol }),
                ));
            }
        }

        let routes: [(&str, &[&str]); 4] = [
            ("screener", &["screen", "find stocks", "oversold", "momentum", "rsi", "dividend"]),
            ("news", &["news", "sentiment", "headline"]),
            ("insights", &["insight", "opportunit", "risk", "analy"]),
            ("web_search", &["macro", "inflation", "interest rate", "cpi", "gdp", "fed "]),
        ];

        for (tool, keywords) in routes {
            if offered(tool) && has_any(keywords) {
                calls.push(ToolCall::new(next_id(), tool, json!({ "query": query })));
            }
        }

        calls
    }

    /// `route`, falling back to the best candidate that takes a free-form
    /// query when no intent matched.
    pub fn plan(query: &str, candidates: &[ToolSpec]) -> Vec<ToolCall> {
        let calls = Self::route(query, candidates);
        if !calls.is_empty() {
            return calls;
        }

        candidates
            .iter()
            .find(|c| accepts_query(c))
            .map(|spec| vec![ToolCall::new("call_1", spec.name.clone(), json!({ "query": query }))])
            .unwrap_or_default()
    }

    pub fn summarize(query: &str, results: &[ToolCallResult]) -> String {
        if results.is_empty() {
            return format!("No tool data was needed to answer: {}", query);
        }

        let lines: Vec<String> = results.iter().map(summarize_result).collect();
        lines.join("\n")
    }
}

fn accepts_query(spec: &ToolSpec) -> bool {
    spec.input_schema
        .get("properties")
        .and_then(|p| p.get("query"))
        .is_some()
}

fn summarize_result(result: &ToolCallResult) -> String {
    let name = &result.call.name;
    match &result.outcome {
        ToolOutcome::CacheHit { value } | ToolOutcome::Completed { value } => {
            match name.as_str() {
                "get_stock_quote" => {
                    let symbol = value.get("symbol").and_then(Value::as_str).unwrap_or("?");
                    let price = value.get("price").and_then(Value::as_f64);
                    let change = value.get("change").and_then(Value::as_f64).unwrap_or(0.0);
                    match price {
                        Some(price) => format!("{} is trading at {:.2} ({:+.2}).", symbol, price, change),
                        None => format!("Quote for {}: {}", symbol, value),
                    }
                }
                "screener" => {
                    let matched = value.get("total_matched").and_then(Value::as_i64).unwrap_or(0);
                    format!("Screener found {} match(es).", matched)
                }
                _ => match value.get("answer").and_then(Value::as_str) {
                    Some(answer) => answer.to_string(),
                    None => format!("{} returned {}", name, value),
                },
            }
        }
        ToolOutcome::Error { kind, message } => {
            format!("{} failed ({}): {}", name, kind, message)
        }
        ToolOutcome::TimedOut => format!("{} timed out.", name),
    }
}

#[async_trait]
impl LanguageModel for HeuristicModel {
    async fn plan_calls(&self, query: &str, candidates: &[ToolSpec]) -> Result<Vec<ToolCall>> {
        Ok(Self::plan(query, candidates))
    }

    async fn stream_answer(
        &self,
        query: &str,
        results: &[ToolCallResult],
    ) -> Result<BoxStream<'static, Result<String>>> {
        let deltas = word_deltas(&Self::summarize(query, results));
        Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
    }
}

/// Mock model for testing: replays fixed calls and deltas.
pub struct ScriptedModel {
    calls: Vec<ToolCall>,
    deltas: Vec<String>,
    fail_planning: bool,
    fail_answer: bool,
    /// Results handed to `stream_answer`, for assertions.
    observed: Mutex<Vec<ToolCallResult>>,
}

impl ScriptedModel {
    pub fn new(calls: Vec<ToolCall>, deltas: Vec<&str>) -> Self {
        Self {
            calls,
            deltas: deltas.into_iter().map(str::to_string).collect(),
            fail_planning: false,
            fail_answer: false,
            observed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_plan() -> Self {
        Self {
            fail_planning: true,
            ..Self::new(Vec::new(), Vec::new())
        }
    }

    pub fn failing_answer(calls: Vec<ToolCall>) -> Self {
        Self {
            fail_answer: true,
            ..Self::new(calls, Vec::new())
        }
    }

    pub fn observed(&self) -> Vec<ToolCallResult> {
        self.observed
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn plan_calls(&self, _query: &str, _candidates: &[ToolSpec]) -> Result<Vec<ToolCall>> {
        if self.fail_planning {
            return Err(OrchestrationError::LlmError("scripted planning failure".to_string()));
        }
        Ok(self.calls.clone())
    }

    async fn stream_answer(
        &self,
        _query: &str,
        results: &[ToolCallResult],
    ) -> Result<BoxStream<'static, Result<String>>> {
        if let Ok(mut observed) = self.observed.lock() {
            observed.extend_from_slice(results);
        }

        if self.fail_answer {
            let failed = stream::iter(vec![
                Ok("partial ".to_string()),
                Err(OrchestrationError::LlmError("scripted stream failure".to_string())),
            ]);
            return Ok(failed.boxed());
        }

        Ok(stream::iter(self.deltas.clone().into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::GeminiClient;
    use crate::tools::create_default_registry;
    use std::sync::Arc;

    fn catalog() -> Vec<ToolSpec> {
        create_default_registry(None, Arc::new(GeminiClient::new(String::new()))).catalog()
    }

    #[test]
    fn test_extract_tickers() {
        assert_eq!(extract_tickers("What is Apple's stock price?"), vec!["AAPL"]);
        assert_eq!(
            extract_tickers("Compare MSFT and NVDA, and nvidia again"),
            vec!["MSFT", "NVDA"]
        );
        assert!(extract_tickers("what is the GDP outlook").is_empty());
    }

    #[test]
    fn test_plan_routes_quote_query() {
        let calls = HeuristicModel::plan("What is Apple's stock price?", &catalog());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_stock_quote");
        assert_eq!(calls[0].arguments, json!({"symbol": "AAPL"}));
    }

    #[test]
    fn test_plan_only_uses_candidates() {
        let candidates: Vec<ToolSpec> = catalog()
            .into_iter()
            .filter(|s| s.name == "news")
            .collect();
        let calls = HeuristicModel::plan("Apple news sentiment", &candidates);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "news");
    }

    #[test]
    fn test_unmatched_query_falls_back_to_free_form_tool() {
        let calls = HeuristicModel::plan("tell me something interesting", &catalog());
        assert!(HeuristicModel::route("tell me something interesting", &catalog()).is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "screener");
    }

    #[test]
    fn test_word_deltas_rejoin() {
        let text = "AAPL is trading at 150.50 (+2.50).";
        assert_eq!(word_deltas(text).concat(), text);
    }

    #[tokio::test]
    async fn test_heuristic_answer_mentions_timeout() {
        let mut call = ToolCall::new("1", "news", json!({"query": "x"}));
        call.state = crate::models::CallState::TimedOut;
        let results = vec![ToolCallResult {
            call,
            outcome: ToolOutcome::TimedOut,
            elapsed_ms: 1,
            deduplicated: false,
        }];

        let deltas: Vec<String> = HeuristicModel
            .stream_answer("x", &results)
            .await
            .unwrap()
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas.concat(), "news timed out.");
    }
}
