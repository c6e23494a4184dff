//! Web Search Context
//!
//! Focuses the user's raw question into a search query, asks a
//! [`WebSearch`] collaborator, and reduces the answer to one context block.
//!
//! # DuckDuckGo Instant Answer API
//!
//! [`DuckDuckGoSearch`] uses the keyless Instant Answer endpoint, which
//! returns:
//! - **AbstractText**: a summary, with **AbstractSource** naming its origin
//! - **Answer**: a direct short answer
//! - **RelatedTopics**: snippets, some nested in topic groups

use async_trait::async_trait;
use serde::Deserialize;

use super::RetrievedContext;

/// DuckDuckGo Instant Answer API endpoint (no API key required)
const DDG_API_URL: &str = "https://api.duckduckgo.com/";

/// Conversational openers removed from the front of a query
const FILLER_PHRASES: [&str; 6] = ["can you", "please", "search for", "tell me", "find", "lookup"];

/// Related-topic snippets kept in a context block
const MAX_RELATED_TOPICS: usize = 3;

/// Source tag for blocks that carry no abstract source
const WEB_SOURCE_TAG: &str = "web";

/// Normalized search result
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchPayload {
    /// Summary text
    pub abstract_text: Option<String>,
    /// Where the summary came from
    pub abstract_source: Option<String>,
    /// Direct short answer
    pub answer: Option<String>,
    /// Related snippets in returned order
    pub related: Vec<String>,
}

/// External search collaborator
#[async_trait]
pub trait WebSearch: Send + Sync {
    /// Run a search for an already focused query
    async fn search(&self, query: &str) -> anyhow::Result<SearchPayload>;
}

/// Strip leading conversational filler from a query
///
/// One left-to-right pass: at each step the first phrase from the fixed set
/// that matches (case-insensitively, on a word boundary) is removed, and each
/// phrase can be removed at most once.
#[must_use]
pub fn focus_query(raw: &str) -> String {
    let mut rest = raw.trim_start();
    let mut used = [false; FILLER_PHRASES.len()];

    'pass: loop {
        for (i, phrase) in FILLER_PHRASES.iter().enumerate() {
            if used[i] {
                continue;
            }
            if let Some(after) = strip_phrase(rest, phrase) {
                used[i] = true;
                rest = after.trim_start();
                continue 'pass;
            }
        }
        break;
    }
    rest.trim().to_string()
}

fn strip_phrase<'a>(text: &'a str, phrase: &str) -> Option<&'a str> {
    let head = text.get(..phrase.len())?;
    if !head.eq_ignore_ascii_case(phrase) {
        return None;
    }
    let after = &text[phrase.len()..];
    match after.chars().next() {
        None => Some(after),
        Some(c) if is_separator(c) => Some(after.trim_start_matches(is_separator)),
        Some(_) => None,
    }
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == ',' || c == ':'
}

/// Reduce a search payload to a single context block
///
/// Priority: abstract (tagged with its source), then the direct answer, then
/// up to three related snippets. Pieces are separated by blank lines.
#[must_use]
pub fn reduce_payload(payload: &SearchPayload) -> Option<RetrievedContext> {
    let mut pieces = Vec::new();

    let abstract_text = payload.abstract_text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    if let Some(text) = abstract_text {
        match payload.abstract_source.as_deref().filter(|s| !s.is_empty()) {
            Some(source) => pieces.push(format!("{text}\n(Source: {source})")),
            None => pieces.push(text.to_string()),
        }
    }

    if let Some(answer) = payload.answer.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        pieces.push(answer.to_string());
    }

    pieces.extend(
        payload
            .related
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .take(MAX_RELATED_TOPICS)
            .map(String::from),
    );

    if pieces.is_empty() {
        return None;
    }

    let source_tag = match (abstract_text, payload.abstract_source.as_deref()) {
        (Some(_), Some(source)) if !source.is_empty() => format!("{WEB_SOURCE_TAG}:{source}"),
        _ => WEB_SOURCE_TAG.to_string(),
    };
    Some(RetrievedContext::new(source_tag, pieces.join("\n\n")))
}

// ============================================================================
// DuckDuckGo
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InstantAnswer {
    abstract_text: String,
    abstract_source: String,
    answer: serde_json::Value,
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RelatedTopic {
    text: Option<String>,
    topics: Vec<RelatedTopic>,
}

impl RelatedTopic {
    fn collect_texts(&self, out: &mut Vec<String>) {
        if let Some(text) = &self.text {
            out.push(text.clone());
        }
        for nested in &self.topics {
            nested.collect_texts(out);
        }
    }
}

impl From<InstantAnswer> for SearchPayload {
    fn from(raw: InstantAnswer) -> Self {
        let mut related = Vec::new();
        for topic in &raw.related_topics {
            topic.collect_texts(&mut related);
        }
        // `Answer` is a string for most queries and an object for calculators
        let answer = match raw.answer {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        };
        Self {
            abstract_text: Some(raw.abstract_text).filter(|s| !s.is_empty()),
            abstract_source: Some(raw.abstract_source).filter(|s| !s.is_empty()),
            answer: answer.filter(|s| !s.is_empty()),
            related,
        }
    }
}

/// DuckDuckGo Instant Answer search
#[derive(Clone, Debug)]
pub struct DuckDuckGoSearch {
    http_client: reqwest::Client,
    endpoint: String,
}

impl DuckDuckGoSearch {
    /// Create a client for the public endpoint
    #[must_use]
    pub fn new(http_client: reqwest::Client) -> Self {
        Self::with_endpoint(http_client, DDG_API_URL)
    }

    /// Create a client for a custom endpoint (mirrors, tests)
    pub fn with_endpoint(http_client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoSearch {
    async fn search(&self, query: &str) -> anyhow::Result<SearchPayload> {
        let response = self
            .http_client
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .header("User-Agent", "chat-gateway/0.1")
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("search API returned {}", response.status());
        }

        let raw: InstantAnswer = response.json().await?;
        Ok(raw.into())
    }
}
