//! Tool trait and registry
//!
//! Tools are read-only data capabilities: `invoke(args) -> result | error`.
//! HTTP-backed tools call the financial API service; query tools are
//! answered by Gemini.

use crate::error::ToolError;
use crate::gemini::GeminiClient;
use crate::models::{CacheType, ToolSpec};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Cache store (and tool kind) this tool's results belong to.
    fn cache_type(&self) -> CacheType;

    fn input_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    /// Confidence offered when the selector falls back to its default subset.
    fn baseline_confidence(&self) -> f32 {
        0.5
    }

    /// Labelled example utterances used by the selector's classifier.
    fn examples(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            baseline_confidence: self.baseline_confidence(),
            cache_type: self.cache_type(),
        }
    }
}

/// Tool registry, preserving declaration order for the catalog.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name replaces the earlier one
    /// in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&i) => self.tools[i] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn tools(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    /// Static catalog in declaration order.
    pub fn catalog(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check arguments against the subset of JSON Schema tools declare:
/// top-level object, `required` keys, and primitive `type`s of properties.
pub fn validate_arguments(spec: &ToolSpec, args: &Value) -> Result<(), ToolError> {
    let obj = args.as_object().ok_or_else(|| {
        ToolError::Validation(format!("{}: arguments must be a JSON object", spec.name))
    })?;

    if let Some(required) = spec.input_schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if obj.get(field).map_or(true, Value::is_null) {
                return Err(ToolError::Validation(format!(
                    "{}: missing required argument '{}'",
                    spec.name, field
                )));
            }
        }
    }

    if let Some(props) = spec.input_schema.get("properties").and_then(Value::as_object) {
        for (field, schema) in props {
            let (Some(value), Some(expected)) =
                (obj.get(field), schema.get("type").and_then(Value::as_str))
            else {
                continue;
            };

            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };

            if !ok && !value.is_null() {
                return Err(ToolError::Validation(format!(
                    "{}: argument '{}' must be of type {}",
                    spec.name, field, expected
                )));
            }
        }
    }

    Ok(())
}

#[derive(Clone)]
pub struct FinancialApiClient {
    client: Client,
    base_url: String,
}

impl FinancialApiClient {
    pub fn new(base_url: &str) -> Option<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;

        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ToolError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                ToolError::Transport(format!("Financial API request failed for {}: {}", path, e))
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| ToolError::Transport(format!("Invalid JSON response: {}", e)))?;

        if status.is_client_error() {
            return Err(ToolError::Validation(format!(
                "Financial API rejected {} ({}): {}",
                path, status, body
            )));
        }
        if !status.is_success() {
            return Err(ToolError::Transport(format!(
                "Financial API returned {} for {}: {}",
                status, path, body
            )));
        }

        Ok(body)
    }
}

fn require_api(api: &Option<FinancialApiClient>) -> Result<&FinancialApiClient, ToolError> {
    api.as_ref().ok_or_else(|| {
        ToolError::Transport(
            "FINANCIAL_API_BASE_URL (or TOOLS_API_BASE_URL) is not configured".to_string(),
        )
    })
}

/// Real-time quote lookup. Without an API configured it serves offline
/// sample data so the service stays usable in development.
pub struct QuoteTool {
    api: Option<FinancialApiClient>,
}

impl QuoteTool {
    pub fn new(api: Option<FinancialApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl Tool for QuoteTool {
    fn name(&self) -> &str {
        "get_stock_quote"
    }

    fn description(&self) -> &str {
        "Get the current stock price quote for a ticker symbol: price, change, volume"
    }

    fn cache_type(&self) -> CacheType {
        CacheType::Quote
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "symbol": { "type": "string" } },
            "required": ["symbol"]
        })
    }

    fn baseline_confidence(&self) -> f32 {
        0.6
    }

    fn examples(&self) -> Vec<String> {
        [
            "apple stock price",
            "current share price of tesla",
            "quote for msft ticker",
            "how much is nvidia trading at",
            "aapl price today",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let symbol = args
            .get("symbol")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::Validation("Expected non-empty 'symbol'".to_string()))?;

        match &self.api {
            Some(api) => {
                api.post_json("/api/v1/market/quote", &json!({ "symbol": symbol }))
                    .await
            }
            None => {
                debug!(%symbol, "Serving offline quote");
                Ok(json!({
                    "symbol": symbol,
                    "price": 150.50,
                    "change": 2.5,
                    "volume": 1000000,
                    "source": "offline",
                }))
            }
        }
    }
}

pub struct ScreenerTool {
    api: Option<FinancialApiClient>,
}

impl ScreenerTool {
    pub fn new(api: Option<FinancialApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl Tool for ScreenerTool {
    fn name(&self) -> &str {
        "screener"
    }

    fn description(&self) -> &str {
        "Screen and filter stocks by technical or fundamental criteria such as rsi, momentum, pe ratio, dividend yield"
    }

    fn cache_type(&self) -> CacheType {
        CacheType::Search
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer" }
            },
            "required": ["query"]
        })
    }

    fn baseline_confidence(&self) -> f32 {
        0.4
    }

    fn examples(&self) -> Vec<String> {
        [
            "find oversold stocks with rsi below 30",
            "screen large cap companies by pe ratio",
            "show momentum stocks breaking out",
            "which companies have dividend yield above 4 percent",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let api = require_api(&self.api)?;
        let mut params = args.clone();

        if params.get("limit").is_none() {
            params["limit"] = json!(10);
        }
        if params.get("data_source").is_none() {
            params["data_source"] = json!("yfinance");
        }
        if params.get("force_database").is_none() {
            params["force_database"] = json!(false);
        }

        api.post_json("/api/v1/screener/nlp-query", &params).await
    }
}

/// Free-form query answered by Gemini with a tool-specific system prefix.
pub struct GeminiQueryTool {
    tool_name: &'static str,
    tool_description: &'static str,
    cache_type: CacheType,
    examples: &'static [&'static str],
    client: Arc<GeminiClient>,
    system_prefix: &'static str,
}

impl GeminiQueryTool {
    pub fn new(
        tool_name: &'static str,
        tool_description: &'static str,
        system_prefix: &'static str,
        cache_type: CacheType,
        examples: &'static [&'static str],
        client: Arc<GeminiClient>,
    ) -> Self {
        Self {
            tool_name,
            tool_description,
            cache_type,
            examples,
            client,
            system_prefix,
        }
    }
}

#[async_trait::async_trait]
impl Tool for GeminiQueryTool {
    fn name(&self) -> &str {
        self.tool_name
    }

    fn description(&self) -> &str {
        self.tool_description
    }

    fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    fn examples(&self) -> Vec<String> {
        self.examples.iter().map(|s| s.to_string()).collect()
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .or_else(|| args.get("text").and_then(Value::as_str))
            .unwrap_or_default();

        if query.trim().is_empty() {
            return Err(ToolError::Validation(
                "Expected 'query' for this tool".to_string(),
            ));
        }

        let answer = self
            .client
            .generate(query, Some(self.system_prefix))
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        Ok(json!({
            "answer": answer,
            "tool": self.tool_name,
        }))
    }
}

/// Adapts a synchronous (blocking) function into a tool. Each invocation
/// runs on tokio's blocking pool so the event loop is never stalled.
pub struct BlockingTool<F> {
    spec: ToolSpec,
    examples: Vec<String>,
    func: Arc<F>,
}

impl<F> BlockingTool<F>
where
    F: Fn(&Value) -> Result<Value, ToolError> + Send + Sync + 'static,
{
    pub fn new(spec: ToolSpec, func: F) -> Self {
        Self {
            spec,
            examples: Vec::new(),
            func: Arc::new(func),
        }
    }

    pub fn with_examples(mut self, examples: &[&str]) -> Self {
        self.examples = examples.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait::async_trait]
impl<F> Tool for BlockingTool<F>
where
    F: Fn(&Value) -> Result<Value, ToolError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn cache_type(&self) -> CacheType {
        self.spec.cache_type
    }

    fn input_schema(&self) -> Value {
        self.spec.input_schema.clone()
    }

    fn baseline_confidence(&self) -> f32 {
        self.spec.baseline_confidence
    }

    fn examples(&self) -> Vec<String> {
        self.examples.clone()
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let func = Arc::clone(&self.func);
        let args = args.clone();

        tokio::task::spawn_blocking(move || func(&args))
            .await
            .map_err(|e| ToolError::Internal(format!("blocking tool did not complete: {}", e)))?
    }
}

const WEB_SEARCH_EXAMPLES: &[&str] = &[
    "what is the current inflation rate",
    "fed interest rate decision",
    "gdp growth forecast for next year",
];

const NEWS_EXAMPLES: &[&str] = &[
    "latest news on tesla",
    "market headlines today",
    "sentiment around nvidia earnings",
];

const INSIGHTS_EXAMPLES: &[&str] = &[
    "give me insights on my portfolio risk",
    "analyze opportunities in semiconductor sector",
    "compare microsoft and google fundamentals",
];

/// Create a registry with the HTTP-backed and Gemini-backed financial tools.
pub fn create_default_registry(
    financial_api_base_url: Option<&str>,
    gemini: Arc<GeminiClient>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let financial_api = financial_api_base_url.and_then(FinancialApiClient::new);

    registry.register(Arc::new(QuoteTool::new(financial_api.clone())));
    registry.register(Arc::new(ScreenerTool::new(financial_api)));

    registry.register(Arc::new(GeminiQueryTool::new(
        "web_search",
        "Search the web for live financial data, macro economics, inflation, interest rates, gdp",
        "Provide concise, up-to-date financial information and macro context.",
        CacheType::Search,
        WEB_SEARCH_EXAMPLES,
        Arc::clone(&gemini),
    )));
    registry.register(Arc::new(GeminiQueryTool::new(
        "news",
        "Retrieve recent financial news headlines and market sentiment",
        "Summarize major market news and sentiment relevant to the query.",
        CacheType::News,
        NEWS_EXAMPLES,
        Arc::clone(&gemini),
    )));
    registry.register(Arc::new(GeminiQueryTool::new(
        "insights",
        "Generate analytical financial insights, opportunities and risks for a portfolio or sector",
        "Provide structured financial insights, opportunities, and risks.",
        CacheType::Search,
        INSIGHTS_EXAMPLES,
        gemini,
    )));

    registry
}
