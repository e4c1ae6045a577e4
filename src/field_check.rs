//! Debounced asynchronous checks on single edited fields.
//!
//! Each field (session, row, column) has at most one live check. A new edit
//! bumps the field's generation and aborts the pending task; a result is only
//! recorded if its generation is still the current one when it arrives.

use crate::schema::{ColumnDescriptor, ValueType};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Why a field's value was rejected. Local to the field; never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FieldCheckError {
    #[error("URL is not reachable: {0}")]
    Unreachable(String),
    #[error("not a valid URL: {0}")]
    MalformedUrl(String),
    #[error("value does not match the pattern {0}")]
    PatternMismatch(String),
    #[error("check could not be completed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait FieldChecker: Send + Sync {
    async fn check(&self, value: &str) -> Result<(), FieldCheckError>;
}

/// Asks the reachability service whether a URL resolves.
pub struct RemoteUrlCheck {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReachabilityResponse {
    is_reachable: bool,
}

impl RemoteUrlCheck {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl FieldChecker for RemoteUrlCheck {
    async fn check(&self, value: &str) -> Result<(), FieldCheckError> {
        UrlSyntaxCheck.check(value).await?;
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "text/plain")
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| FieldCheckError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FieldCheckError::Transport(format!(
                "reachability service returned {}",
                response.status()
            )));
        }
        let verdict: ReachabilityResponse = response
            .json()
            .await
            .map_err(|e| FieldCheckError::Transport(e.to_string()))?;
        if verdict.is_reachable {
            Ok(())
        } else {
            Err(FieldCheckError::Unreachable(value.to_string()))
        }
    }
}

/// Accepts absolute http(s) URLs. Used when no reachability service is configured.
pub struct UrlSyntaxCheck;

#[async_trait]
impl FieldChecker for UrlSyntaxCheck {
    async fn check(&self, value: &str) -> Result<(), FieldCheckError> {
        match reqwest::Url::parse(value.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
            _ => Err(FieldCheckError::MalformedUrl(value.to_string())),
        }
    }
}

/// Whole-value match against a column's pattern.
pub struct PatternCheck {
    pattern: String,
    regex: Regex,
}

impl PatternCheck {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{})$", pattern))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }
}

#[async_trait]
impl FieldChecker for PatternCheck {
    async fn check(&self, value: &str) -> Result<(), FieldCheckError> {
        if self.regex.is_match(value) {
            Ok(())
        } else {
            Err(FieldCheckError::PatternMismatch(self.pattern.clone()))
        }
    }
}

/// Pick the check a column needs, if any. URL columns use the reachability
/// service when one is configured; columns with a pattern are matched locally.
pub fn checker_for(column: &ColumnDescriptor, url_check: Option<Arc<RemoteUrlCheck>>) -> Option<Arc<dyn FieldChecker>> {
    if column.value_type == ValueType::Url {
        return Some(match url_check {
            Some(remote) => remote as Arc<dyn FieldChecker>,
            None => Arc::new(UrlSyntaxCheck),
        });
    }
    let pattern = column.regex.as_deref().filter(|p| !p.is_empty())?;
    match PatternCheck::new(pattern) {
        Ok(check) => Some(Arc::new(check)),
        Err(e) => {
            warn!("Column '{}' has an unusable pattern {}: {}", column.name, pattern, e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub session: String,
    pub row: usize,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum FieldStatus {
    Unchecked,
    Pending,
    Valid,
    Invalid { reason: String },
}

#[derive(Default)]
struct FieldEntry {
    generation: u64,
    /// Value the current status refers to; `None` when settled without a check.
    value: Option<String>,
    status: Option<FieldStatus>,
    task: Option<JoinHandle<()>>,
}

/// Per-field check state shared by all handlers.
#[derive(Clone)]
pub struct FieldCheckRegistry {
    inner: Arc<Mutex<HashMap<FieldKey, FieldEntry>>>,
    debounce: Duration,
}

impl FieldCheckRegistry {
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            debounce,
        }
    }

    /// Start a debounced check for a new value, superseding any earlier one.
    /// Returns the generation the check belongs to.
    pub fn schedule(&self, key: FieldKey, value: String, checker: Arc<dyn FieldChecker>) -> u64 {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(key.clone()).or_default();
        let generation = supersede(entry);
        entry.status = Some(FieldStatus::Pending);
        entry.value = Some(value.clone());
        debug!(
            "Scheduled check for row {} '{}' (generation {})",
            key.row, key.column, generation
        );

        let inner = Arc::clone(&self.inner);
        let debounce = self.debounce;
        entry.task = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let verdict = checker.check(&value).await;
            let status = match verdict {
                Ok(()) => FieldStatus::Valid,
                Err(e) => FieldStatus::Invalid { reason: e.to_string() },
            };
            complete(&inner, &key, generation, status);
        }));
        generation
    }

    /// Record a status without running a check (e.g. a column with no rules).
    pub fn settle(&self, key: FieldKey, status: FieldStatus) -> u64 {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(key).or_default();
        let generation = supersede(entry);
        entry.value = None;
        entry.status = Some(status);
        generation
    }

    pub fn status(&self, key: &FieldKey) -> FieldStatus {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .and_then(|e| e.status.clone())
            .unwrap_or(FieldStatus::Unchecked)
    }

    /// Status of the check for exactly this value. A different value counts as
    /// unchecked.
    pub fn status_for_value(&self, key: &FieldKey, value: &str) -> FieldStatus {
        let map = self.inner.lock().unwrap();
        match map.get(key) {
            Some(FieldEntry {
                value: Some(checked),
                status: Some(status),
                ..
            }) if checked == value => status.clone(),
            _ => FieldStatus::Unchecked,
        }
    }

    /// Drop every check belonging to a session.
    pub fn forget_session(&self, session: &str) {
        let mut map = self.inner.lock().unwrap();
        map.retain(|key, entry| {
            if key.session != session {
                return true;
            }
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            false
        });
    }
}

/// Bump the generation and abort the pending task.
fn supersede(entry: &mut FieldEntry) -> u64 {
    entry.generation += 1;
    if let Some(task) = entry.task.take() {
        task.abort();
    }
    entry.generation
}

/// Store a finished check's status unless a newer edit has superseded it.
fn complete(inner: &Mutex<HashMap<FieldKey, FieldEntry>>, key: &FieldKey, generation: u64, status: FieldStatus) -> bool {
    let mut map = inner.lock().unwrap();
    match map.get_mut(key) {
        Some(entry) if entry.generation == generation => {
            debug!("Field check row {} '{}' -> {:?}", key.row, key.column, status);
            entry.status = Some(status);
            entry.task = None;
            true
        }
        _ => {
            debug!(
                "Discarding stale check for row {} '{}' (generation {})",
                key.row, key.column, generation
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeCheck {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FieldChecker for FakeCheck {
        async fn check(&self, value: &str) -> Result<(), FieldCheckError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if value == "good" {
                Ok(())
            } else {
                Err(FieldCheckError::PatternMismatch("good".to_string()))
            }
        }
    }

    fn key() -> FieldKey {
        FieldKey {
            session: "s1".to_string(),
            row: 3,
            column: "homepage".to_string(),
        }
    }

    async fn wait_for_settled(registry: &FieldCheckRegistry, key: &FieldKey) -> FieldStatus {
        for _ in 0..100 {
            let status = registry.status(key);
            if status != FieldStatus::Pending {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        registry.status(key)
    }

    #[tokio::test]
    async fn test_last_keystroke_wins() {
        let registry = FieldCheckRegistry::new(Duration::from_millis(30));
        let checker = Arc::new(FakeCheck { calls: AtomicUsize::new(0) });

        registry.schedule(key(), "go".to_string(), checker.clone());
        registry.schedule(key(), "goo".to_string(), checker.clone());
        let generation = registry.schedule(key(), "good".to_string(), checker.clone());
        assert_eq!(generation, 3);
        assert_eq!(registry.status(&key()), FieldStatus::Pending);

        assert_eq!(wait_for_settled(&registry, &key()).await, FieldStatus::Valid);
        // Superseded checks were aborted during their debounce.
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_value_reports_reason() {
        let registry = FieldCheckRegistry::new(Duration::from_millis(1));
        let checker = Arc::new(FakeCheck { calls: AtomicUsize::new(0) });
        registry.schedule(key(), "bad".to_string(), checker);
        match wait_for_settled(&registry, &key()).await {
            FieldStatus::Invalid { reason } => assert!(reason.contains("pattern")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_result_is_ignored() {
        let registry = FieldCheckRegistry::new(Duration::from_secs(60));
        let checker = Arc::new(FakeCheck { calls: AtomicUsize::new(0) });
        let first = registry.schedule(key(), "bad".to_string(), checker.clone());
        let second = registry.schedule(key(), "good".to_string(), checker);
        assert!(second > first);

        // A result for the first edit arriving late must not land.
        let applied = complete(&registry.inner, &key(), first, FieldStatus::Invalid { reason: "late".to_string() });
        assert!(!applied);
        assert_eq!(registry.status(&key()), FieldStatus::Pending);

        assert!(complete(&registry.inner, &key(), second, FieldStatus::Valid));
        assert_eq!(registry.status(&key()), FieldStatus::Valid);
    }

    #[tokio::test]
    async fn test_settle_supersedes_pending_check() {
        let registry = FieldCheckRegistry::new(Duration::from_secs(60));
        let checker = Arc::new(FakeCheck { calls: AtomicUsize::new(0) });
        let pending = registry.schedule(key(), "bad".to_string(), checker);
        registry.settle(key(), FieldStatus::Valid);
        assert!(!complete(&registry.inner, &key(), pending, FieldStatus::Invalid { reason: "x".to_string() }));
        assert_eq!(registry.status(&key()), FieldStatus::Valid);
    }

    #[tokio::test]
    async fn test_status_for_value() {
        let registry = FieldCheckRegistry::new(Duration::from_secs(60));
        let checker = Arc::new(FakeCheck { calls: AtomicUsize::new(0) });
        let generation = registry.schedule(key(), "bad".to_string(), checker);
        complete(&registry.inner, &key(), generation, FieldStatus::Invalid { reason: "x".to_string() });
        assert!(matches!(registry.status_for_value(&key(), "bad"), FieldStatus::Invalid { .. }));
        assert_eq!(registry.status_for_value(&key(), "good"), FieldStatus::Unchecked);
    }

    #[tokio::test]
    async fn test_forget_session() {
        let registry = FieldCheckRegistry::new(Duration::from_secs(60));
        registry.settle(key(), FieldStatus::Valid);
        registry.forget_session("s1");
        assert_eq!(registry.status(&key()), FieldStatus::Unchecked);
    }

    #[tokio::test]
    async fn test_url_syntax_and_pattern_checks() {
        assert!(UrlSyntaxCheck.check("https://example.org/a").await.is_ok());
        assert!(UrlSyntaxCheck.check("example.org").await.is_err());
        assert!(UrlSyntaxCheck.check("ftp://example.org").await.is_err());

        let check = PatternCheck::new("S-[0-9]{4}").unwrap();
        assert!(check.check("S-0042").await.is_ok());
        assert!(check.check("xS-0042").await.is_err());
        assert!(PatternCheck::new("[bad").is_err());
    }

    #[test]
    fn test_checker_selection() {
        let schema = crate::schema::tests::sample_schema();
        assert!(checker_for(schema.column("homepage").unwrap(), None).is_some());
        assert!(checker_for(schema.column("sample_id").unwrap(), None).is_some());
        assert!(checker_for(schema.column("name").unwrap(), None).is_none());
    }
}
