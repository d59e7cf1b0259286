//! External collaborators: market-data service, funded-project registry,
//! cross-chain analogue scout, and the structured-generation seam over the
//! language-model service.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use voidscan_core::MarketToken;
use voidscan_storage::HttpFetcher;

pub const CRATE_NAME: &str = "voidscan-signals";

// ---------------------------------------------------------------------------
// Structured generation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model returned http status {0}")]
    HttpStatus(u16),
    #[error("model returned an empty body")]
    EmptyResponse,
    #[error("model response failed to decode: {0}")]
    Decode(String),
}

/// Raw completion seam. The pipeline never touches the model wire format
/// directly; it goes through [`generate_structured`].
#[async_trait]
pub trait GenerativeBackend: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, GenerationError>;
}

/// Chat-completions HTTP backend.
#[derive(Debug, Clone)]
pub struct HttpModelClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

impl HttpModelClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl GenerativeBackend for HttpModelClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.4,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GenerationError::HttpStatus(status.as_u16()));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Decode(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(content)
    }
}

/// Strip an optional markdown code fence (with or without a `json` tag) from
/// a model response before JSON decoding.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// One generative call returning a typed value or an explicit failure. All
/// fence stripping and decode error handling lives here.
pub async fn generate_structured<T: DeserializeOwned>(
    backend: &dyn GenerativeBackend,
    system: &str,
    user: &str,
) -> Result<T, GenerationError> {
    let raw = backend.complete(system, user).await?;
    let stripped = strip_code_fences(&raw);
    if stripped.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    serde_json::from_str(stripped).map_err(|e| GenerationError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// One trading pair from the market service's text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingPair {
    #[serde(default)]
    pub chain_id: String,
    #[serde(default)]
    pub base_token: BaseToken,
    #[serde(default)]
    pub liquidity: PairLiquidity,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BaseToken {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PairLiquidity {
    #[serde(default)]
    pub usd: f64,
}

#[derive(Debug, Deserialize)]
struct PairSearchResponse {
    #[serde(default)]
    pairs: Vec<TradingPair>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenListing {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    volume_24h: f64,
    #[serde(default)]
    liquidity_usd: f64,
}

#[derive(Debug, Error)]
pub enum MarketError {
    #[error(transparent)]
    Fetch(#[from] voidscan_storage::FetchError),
    #[error("market response failed to decode: {0}")]
    Decode(#[from] serde_json::Error),
}

pub struct MarketDataClient<'a> {
    fetcher: &'a HttpFetcher,
    base_url: String,
}

impl<'a> MarketDataClient<'a> {
    pub fn new(fetcher: &'a HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }

    /// Text search returning live trading pairs.
    pub async fn search_pairs(
        &self,
        run_id: Uuid,
        query: &str,
    ) -> Result<Vec<TradingPair>, MarketError> {
        let url = format!("{}/latest/dex/search?q={}", self.base_url, query);
        let resp = self.fetcher.fetch_bytes(run_id, "market-data", &url).await?;
        let parsed: PairSearchResponse = serde_json::from_slice(&resp.body)?;
        Ok(parsed.pairs)
    }

    /// Full token listing used by the snapshot builder's project join.
    pub async fn list_tokens(&self, run_id: Uuid) -> Result<Vec<MarketToken>, MarketError> {
        let url = format!("{}/tokens", self.base_url);
        let resp = self.fetcher.fetch_bytes(run_id, "market-data", &url).await?;
        let listings: Vec<TokenListing> = serde_json::from_slice(&resp.body)?;
        Ok(listings
            .into_iter()
            .filter(|t| !t.symbol.is_empty() || !t.name.is_empty())
            .map(|t| MarketToken {
                symbol: t.symbol,
                name: t.name,
                volume_24h: t.volume_24h,
                liquidity_usd: t.liquidity_usd,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Funded-project registry
// ---------------------------------------------------------------------------

/// First-endpoint-wins lookup against a short ordered list of candidate
/// registry endpoints. Total failure resolves to an empty list, never an
/// error.
pub struct FundedRegistryClient<'a> {
    fetcher: &'a HttpFetcher,
    endpoints: Vec<String>,
}

impl<'a> FundedRegistryClient<'a> {
    pub fn new(fetcher: &'a HttpFetcher, endpoints: Vec<String>) -> Self {
        Self { fetcher, endpoints }
    }

    pub async fn lookup(&self, run_id: Uuid) -> Vec<String> {
        for endpoint in &self.endpoints {
            match self.fetcher.fetch_bytes(run_id, "funded-registry", endpoint).await {
                Ok(resp) => {
                    let names = parse_project_names(&resp.body);
                    if !names.is_empty() {
                        info!(endpoint, count = names.len(), "funded registry answered");
                        return names;
                    }
                }
                Err(err) => {
                    warn!(endpoint, %err, "funded registry endpoint failed; trying next");
                }
            }
        }
        Vec::new()
    }
}

/// Accepts either a bare array of `{name|id}` objects or `{"projects": [...]}`.
pub fn parse_project_names(body: &[u8]) -> Vec<String> {
    let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
        return Vec::new();
    };
    let items = value
        .as_array()
        .or_else(|| value.get("projects").and_then(|p| p.as_array()));
    let Some(items) = items else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            item.get("name")
                .and_then(|v| v.as_str())
                .or_else(|| item.get("id").and_then(|v| v.as_str()))
                .map(ToString::to_string)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Cross-chain analogue scout
// ---------------------------------------------------------------------------

pub const CROSS_CHAIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Maps category slugs to hand-curated market search terms via substring
/// matching. Slugs outside the dictionary contribute no evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordDictionary {
    entries: BTreeMap<String, Vec<String>>,
}

impl KeywordDictionary {
    pub fn new(entries: BTreeMap<String, Vec<String>>) -> Self {
        Self { entries }
    }

    /// Up to two search terms for a slug, first dictionary key contained in
    /// the slug wins.
    pub fn terms_for(&self, slug: &str) -> Vec<String> {
        let lower = slug.to_ascii_lowercase();
        for (needle, terms) in &self.entries {
            if lower.contains(needle.as_str()) {
                return terms.iter().take(2).cloned().collect();
            }
        }
        Vec::new()
    }
}

/// Sum liquidity of pairs on allow-listed chains only.
pub fn sum_allowed_liquidity(pairs: &[TradingPair], allowed_chains: &HashSet<String>) -> f64 {
    pairs
        .iter()
        .filter(|p| allowed_chains.contains(&p.chain_id))
        .map(|p| p.liquidity.usd)
        .sum()
}

pub struct CrossChainScout<'a> {
    market: &'a MarketDataClient<'a>,
    dictionary: KeywordDictionary,
    allowed_chains: HashSet<String>,
    per_category_timeout: Duration,
}

impl<'a> CrossChainScout<'a> {
    pub fn new(
        market: &'a MarketDataClient<'a>,
        dictionary: KeywordDictionary,
        allowed_chains: HashSet<String>,
    ) -> Self {
        Self {
            market,
            dictionary,
            allowed_chains,
            per_category_timeout: CROSS_CHAIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_category_timeout = timeout;
        self
    }

    /// Evidence of analogous demand on other chains, keyed by category slug.
    /// All categories are dispatched concurrently; each lookup races its own
    /// timeout and resolves to no evidence on failure. One slow category
    /// never blocks or poisons another's result.
    pub async fn gather(&self, run_id: Uuid, slugs: &[String]) -> HashMap<String, f64> {
        let lookups = slugs.iter().map(|slug| async move {
            let raced = tokio::time::timeout(
                self.per_category_timeout,
                self.liquidity_for_slug(run_id, slug),
            )
            .await;
            match raced {
                Ok(Ok(total)) if total > 0.0 => Some((slug.clone(), total)),
                Ok(Ok(_)) => None,
                Ok(Err(err)) => {
                    warn!(slug, %err, "cross-chain lookup failed; no evidence");
                    None
                }
                Err(_) => {
                    warn!(slug, "cross-chain lookup timed out; no evidence");
                    None
                }
            }
        });

        join_all(lookups).await.into_iter().flatten().collect()
    }

    async fn liquidity_for_slug(&self, run_id: Uuid, slug: &str) -> Result<f64, MarketError> {
        let mut total = 0.0;
        for term in self.dictionary.terms_for(slug) {
            let pairs = self.market.search_pairs(run_id, &term).await?;
            total += sum_allowed_liquidity(&pairs, &self.allowed_chains);
        }
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Aggregated signal bundle
// ---------------------------------------------------------------------------

/// Best-effort auxiliary evidence handed to the synthesizer. Advisory only:
/// it never creates or removes candidates by itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBundle {
    pub funded_projects: Vec<String>,
    pub cross_chain_evidence: HashMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBackend(String);

    #[async_trait]
    impl GenerativeBackend for FixedBackend {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, GenerationError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn fence_stripping_handles_tagged_and_bare_fences() {
        assert_eq!(strip_code_fences("[1,2]"), "[1,2]");
        assert_eq!(strip_code_fences("```json\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_code_fences("```\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_code_fences("  ```json\n{\"a\":1}\n```  "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn structured_generation_decodes_fenced_payload() {
        let backend = FixedBackend("```json\n[\"a\", \"b\"]\n```".to_string());
        let out: Vec<String> = generate_structured(&backend, "sys", "user").await.unwrap();
        assert_eq!(out, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn structured_generation_reports_decode_failure() {
        let backend = FixedBackend("not json at all".to_string());
        let out = generate_structured::<Vec<String>>(&backend, "sys", "user").await;
        assert!(matches!(out, Err(GenerationError::Decode(_))));
    }

    #[test]
    fn registry_parser_accepts_both_body_shapes() {
        let bare = br#"[{"name": "AlphaVault"}, {"id": "beta-bridge"}]"#;
        assert_eq!(parse_project_names(bare), vec!["AlphaVault", "beta-bridge"]);

        let wrapped = br#"{"projects": [{"name": "GammaSwap"}]}"#;
        assert_eq!(parse_project_names(wrapped), vec!["GammaSwap"]);

        assert!(parse_project_names(b"{\"unexpected\": 1}").is_empty());
        assert!(parse_project_names(b"not json").is_empty());
    }

    #[test]
    fn keyword_dictionary_matches_by_substring_and_caps_terms() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "lending".to_string(),
            vec!["lending".to_string(), "borrow".to_string(), "extra".to_string()],
        );
        let dict = KeywordDictionary::new(entries);

        let terms = dict.terms_for("defi-lending-protocols");
        assert_eq!(terms, vec!["lending".to_string(), "borrow".to_string()]);
        assert!(dict.terms_for("nft-marketplaces").is_empty());
    }

    #[test]
    fn liquidity_sum_respects_chain_allow_list() {
        let pairs = vec![
            TradingPair {
                chain_id: "ethereum".into(),
                base_token: BaseToken::default(),
                liquidity: PairLiquidity { usd: 1_000_000.0 },
            },
            TradingPair {
                chain_id: "solana".into(),
                base_token: BaseToken::default(),
                liquidity: PairLiquidity { usd: 500_000.0 },
            },
            TradingPair {
                chain_id: "obscure-chain".into(),
                base_token: BaseToken::default(),
                liquidity: PairLiquidity { usd: 9_999_999.0 },
            },
        ];
        let allowed: HashSet<String> =
            ["ethereum".to_string(), "solana".to_string()].into_iter().collect();
        assert_eq!(sum_allowed_liquidity(&pairs, &allowed), 1_500_000.0);
    }

    #[test]
    fn trading_pair_decodes_market_wire_shape() {
        let json = r#"{
            "pairs": [
                {"chainId": "ethereum", "baseToken": {"name": "Alpha", "symbol": "ALP"},
                 "liquidity": {"usd": 123.5}},
                {"chainId": "base"}
            ]
        }"#;
        let parsed: PairSearchResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.pairs.len(), 2);
        assert_eq!(parsed.pairs[0].base_token.name, "Alpha");
        assert_eq!(parsed.pairs[0].liquidity.usd, 123.5);
        assert_eq!(parsed.pairs[1].liquidity.usd, 0.0);
    }
}
