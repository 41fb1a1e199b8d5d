//! Indexer (subgraph) consensus client.
//!
//! Every query is issued to all configured replicas in parallel. A result is
//! only returned when a strict majority of replicas agree on it by deep
//! equality; otherwise the call fails closed with [`GraphError::ConsensusFailed`]
//! and the caller retries. Monotone quantities (block heights, sync status)
//! go through [`GraphClient::find_max_consensus`] instead, which tolerates a
//! minority of replicas running ahead without letting a lagging one roll the
//! oracle backward.

use crate::retry;
use backon::Retryable;
use futures::future::join_all;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Subgraphs return at most 1000 rows per page.
pub const PAGE_SIZE: usize = 1000;

const EXECUTE_TIMEOUT: Duration = Duration::from_secs(45);

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no majority among {responded}/{total} indexer replies")]
    ConsensusFailed { responded: usize, total: usize },
    #[error("indexer request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("indexer returned errors: {0}")]
    Query(String),
    #[error("unexpected indexer response shape: {0}")]
    Decode(String),
}

#[derive(Clone, Debug)]
pub struct GraphClient {
    urls: Vec<Url>,
    http: reqwest::Client,
}

impl GraphClient {
    pub fn new(urls: Vec<Url>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(EXECUTE_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self { urls, http }
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    /// Executes `query` against every replica and returns the
    /// majority-agreeing result. Retries with backoff on transport errors
    /// and on consensus failure.
    pub async fn query(&self, query: &str, variables: Value) -> Result<Value> {
        (|| async { self.query_once(query, variables.clone()).await })
            .retry(retry::policy())
            .notify(|err: &GraphError, dur: Duration| {
                warn!("retrying indexer query in {dur:?}: {err}");
            })
            .await
    }

    async fn query_once(&self, query: &str, variables: Value) -> Result<Value> {
        let results = self.fan_out(query, &variables).await;
        if self.urls.len() == 1 {
            return results.into_iter().next().expect("one reply per url");
        }

        let replies: Vec<Value> = results.into_iter().flatten().collect();
        let responded = replies.len();
        majority(replies, self.urls.len()).ok_or(GraphError::ConsensusFailed {
            responded,
            total: self.urls.len(),
        })
    }

    /// Repeatedly executes `query` advancing the `last_id` cursor until a
    /// short page is returned, concatenating the rows of `field`.
    pub async fn query_paginated(
        &self,
        query: &str,
        mut variables: Value,
        field: &str,
    ) -> Result<Vec<Value>> {
        let mut rows: Vec<Value> = Vec::new();
        let mut last_id = String::new();

        loop {
            variables["last_id"] = json!(last_id);
            let result = self.query(query, variables.clone()).await?;
            let chunk = result
                .get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let short_page = chunk.len() < PAGE_SIZE;
            rows.extend(chunk);

            if short_page {
                return Ok(rows);
            }
            last_id = rows
                .last()
                .and_then(|row| row.get("id"))
                .and_then(Value::as_str)
                .ok_or_else(|| GraphError::Decode(format!("row of `{field}` without an id")))?
                .to_string();
        }
    }

    /// Executes `query` against every replica and returns the reply with the
    /// largest `key` that at least `⌊N/2⌋ + 1` replies are at or past.
    pub async fn find_max_consensus<F>(&self, query: &str, variables: Value, key: F) -> Result<Value>
    where
        F: Fn(&Value) -> Option<u64> + Copy,
    {
        (|| async {
            let replies: Vec<Value> = self
                .fan_out(query, &variables)
                .await
                .into_iter()
                .flatten()
                .collect();
            let responded = replies.len();
            max_consensus(replies, self.urls.len(), key).ok_or(GraphError::ConsensusFailed {
                responded,
                total: self.urls.len(),
            })
        })
        .retry(retry::policy())
        .notify(|err: &GraphError, dur: Duration| {
            warn!("retrying indexer consensus query in {dur:?}: {err}");
        })
        .await
    }

    async fn fan_out(&self, query: &str, variables: &Value) -> Vec<Result<Value>> {
        join_all(
            self.urls
                .iter()
                .map(|url| self.execute_single(url, query, variables)),
        )
        .await
    }

    async fn execute_single(&self, url: &Url, query: &str, variables: &Value) -> Result<Value> {
        let response: Value = self
            .http
            .post(url.clone())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(errors) = response.get("errors") {
            if !errors.is_null() {
                return Err(GraphError::Query(errors.to_string()));
            }
        }
        response
            .get("data")
            .filter(|data| !data.is_null())
            .cloned()
            .ok_or_else(|| GraphError::Decode("reply without a data field".to_string()))
    }
}

/// Returns the reply that more than `total / 2` replies are deep-equal to.
fn majority(replies: Vec<Value>, total: usize) -> Option<Value> {
    let threshold = total / 2 + 1;
    let mut best: Option<(usize, &Value)> = None;
    for reply in &replies {
        let count = replies.iter().filter(|other| *other == reply).count();
        if best.is_none_or(|(best_count, _)| count > best_count) {
            best = Some((count, reply));
        }
    }
    best.filter(|(count, _)| *count >= threshold)
        .map(|(_, reply)| reply.clone())
}

/// Returns the reply with the largest key such that at least
/// `total / 2 + 1` replies have a key greater than or equal to it.
fn max_consensus<F>(replies: Vec<Value>, total: usize, key: F) -> Option<Value>
where
    F: Fn(&Value) -> Option<u64> + Copy,
{
    let threshold = total / 2 + 1;
    let mut maximum = None;
    let mut result = None;
    for reply in &replies {
        let Some(candidate) = key(reply) else {
            continue;
        };
        let supporters = replies
            .iter()
            .filter(|other| key(other).is_some_and(|k| k >= candidate))
            .count();
        if maximum.is_none_or(|max| candidate > max) && supporters >= threshold {
            maximum = Some(candidate);
            result = Some(reply.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(id: u64) -> Value {
        json!({ "blocks": [{ "id": id.to_string(), "timestamp": "1700000000" }] })
    }

    #[test]
    fn majority_two_of_three() {
        let a = json!({ "value": "a" });
        let b = json!({ "value": "b" });
        let winner = majority(vec![a.clone(), a.clone(), b], 3).unwrap();
        assert_eq!(winner, a);
    }

    #[test]
    fn majority_fails_closed_on_three_way_split() {
        let replies = vec![json!({"v": 1}), json!({"v": 2}), json!({"v": 3})];
        assert!(majority(replies, 3).is_none());
    }

    #[test]
    fn majority_counts_failures_in_denominator() {
        // one of three replicas errored out; the surviving pair still agrees
        let a = json!({ "value": "a" });
        assert!(majority(vec![a.clone(), a.clone()], 3).is_some());
        // a single survivor is not a majority of three
        assert!(majority(vec![a], 3).is_none());
    }

    #[test]
    fn max_consensus_ignores_minority_ahead() {
        let key = |v: &Value| {
            v["blocks"][0]["id"]
                .as_str()
                .and_then(|id| id.parse::<u64>().ok())
        };
        // one replica ahead at 105, two agree at 100: pick 100
        let picked = max_consensus(vec![reply(105), reply(100), reply(100)], 3, key).unwrap();
        assert_eq!(key(&picked), Some(100));
        // one replica behind at 95: the two at 100 carry it
        let picked = max_consensus(vec![reply(95), reply(100), reply(100)], 3, key).unwrap();
        assert_eq!(key(&picked), Some(100));
    }

    #[test]
    fn max_consensus_requires_majority() {
        let key = |v: &Value| {
            v["blocks"][0]["id"]
                .as_str()
                .and_then(|id| id.parse::<u64>().ok())
        };
        assert!(max_consensus(vec![reply(100)], 3, key).is_none());
    }
}
