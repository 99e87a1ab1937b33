//! Composable capture filters with per-stage statistics.
//!
//! Stages run cheapest-first: method -> direction -> size -> risk ->
//! content. Each rejection carries a stable machine-readable reason.

use km_core::{Direction, Event, RiskLevel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::risk::RiskScorer;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Declarative filter configuration. All fields optional; empty means
/// "no constraint" except where noted.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FilterRules {
    #[serde(default)]
    pub method_whitelist: Vec<String>,
    #[serde(default)]
    pub method_blacklist: Vec<String>,
    /// Drop the literal `ping` method (case-insensitive). Defaults on in the
    /// resolved monitor configuration.
    #[serde(default)]
    pub exclude_ping_messages: bool,
    /// Allowed directions; empty passes both.
    #[serde(default)]
    pub directions: Vec<Direction>,
    /// Maximum payload size in bytes; 0 disables the check.
    #[serde(default)]
    pub payload_size_limit: usize,
    /// Minimum risk level to capture.
    #[serde(default)]
    pub min_risk_level: Option<RiskLevel>,
    /// Capture only High-risk events; stricter than `min_risk_level`.
    #[serde(default)]
    pub high_risk_only: bool,
    /// Case-insensitive payload substrings that reject an event.
    #[serde(default)]
    pub content_blacklist: Vec<String>,
}

/// Match a method against a pattern supporting one leading or trailing `*`.
fn method_matches(pattern: &str, method: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return method.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return method.ends_with(suffix);
    }
    pattern == method
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FilterStatistics {
    pub evaluated: u64,
    pub captured: u64,
    pub filtered: u64,
    pub by_method: u64,
    pub by_ping: u64,
    pub by_direction: u64,
    pub by_size: u64,
    pub by_risk: u64,
    pub by_content: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reject {
    Method,
    Ping,
    Direction,
    Size,
    Risk,
    Content,
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// The capture decision pipeline.
///
/// Rules can be swapped at runtime; an in-flight evaluation reads the rule
/// set once and finishes against that snapshot. Statistics live behind their
/// own mutex so the predicate path stays contention-free.
pub struct FilterChain {
    rules: RwLock<Arc<FilterRules>>,
    scorer: RiskScorer,
    stats: Mutex<FilterStatistics>,
}

impl FilterChain {
    pub fn new(rules: FilterRules, scorer: RiskScorer) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            scorer,
            stats: Mutex::new(FilterStatistics::default()),
        }
    }

    /// Atomically replace the rule set. In-flight evaluations keep the
    /// snapshot they already took.
    pub async fn update_rules(&self, rules: FilterRules) {
        let mut guard = self.rules.write().await;
        *guard = Arc::new(rules);
    }

    pub fn stats(&self) -> FilterStatistics {
        self.stats.lock().clone()
    }

    /// Decide whether `event` should be captured.
    ///
    /// Always scores the event (one-shot) so downstream consumers and the
    /// upload payload carry a risk score even when no risk rule is enabled.
    pub async fn should_capture(&self, event: &Event) -> (bool, Option<String>) {
        let rules = { self.rules.read().await.clone() };

        let verdict = self.evaluate(&rules, event);

        let mut stats = self.stats.lock();
        stats.evaluated += 1;
        match verdict {
            Ok(()) => {
                stats.captured += 1;
                drop(stats);
                (true, None)
            }
            Err((reject, reason)) => {
                stats.filtered += 1;
                match reject {
                    Reject::Method => stats.by_method += 1,
                    Reject::Ping => stats.by_ping += 1,
                    Reject::Direction => stats.by_direction += 1,
                    Reject::Size => stats.by_size += 1,
                    Reject::Risk => stats.by_risk += 1,
                    Reject::Content => stats.by_content += 1,
                }
                drop(stats);
                (false, Some(reason))
            }
        }
    }

    fn evaluate(&self, rules: &FilterRules, event: &Event) -> Result<(), (Reject, String)> {
        let method = event.method();

        // Method stage: blacklist wins over whitelist.
        if rules.exclude_ping_messages && method.eq_ignore_ascii_case("ping") {
            return Err((Reject::Ping, "ping excluded".to_string()));
        }
        if rules
            .method_blacklist
            .iter()
            .any(|p| method_matches(p, method))
        {
            return Err((Reject::Method, format!("method {method:?} in blacklist")));
        }
        if !rules.method_whitelist.is_empty()
            && !rules
                .method_whitelist
                .iter()
                .any(|p| method_matches(p, method))
        {
            return Err((Reject::Method, "method not in whitelist".to_string()));
        }

        // Direction stage.
        if !rules.directions.is_empty() && !rules.directions.contains(&event.direction()) {
            return Err((
                Reject::Direction,
                format!("direction {} not allowed", event.direction()),
            ));
        }

        // Size stage.
        if rules.payload_size_limit > 0 && event.size() > rules.payload_size_limit {
            return Err((
                Reject::Size,
                format!(
                    "payload size {} exceeds limit {}",
                    event.size(),
                    rules.payload_size_limit
                ),
            ));
        }

        // Score before the risk stage so every captured event carries one.
        let score = self.scorer.score(method, event.payload_view());
        event.update_risk_score(score);

        // Risk stage.
        if rules.high_risk_only && score.level != RiskLevel::High {
            return Err((Reject::Risk, "risk level not high".to_string()));
        }
        if let Some(min) = rules.min_risk_level {
            if score.level < min {
                return Err((
                    Reject::Risk,
                    format!("risk level {} below minimum {}", score.level, min),
                ));
            }
        }

        // Content stage.
        if !rules.content_blacklist.is_empty() {
            let haystack = String::from_utf8_lossy(event.payload_view()).to_ascii_lowercase();
            for needle in &rules.content_blacklist {
                if haystack.contains(&needle.to_ascii_lowercase()) {
                    return Err((
                        Reject::Content,
                        format!("content matches blacklist entry {needle:?}"),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Per-reason counters as a printable map for the shutdown summary.
    pub fn stats_breakdown(&self) -> HashMap<&'static str, u64> {
        let stats = self.stats.lock();
        let mut map = HashMap::new();
        map.insert("evaluated", stats.evaluated);
        map.insert("captured", stats.captured);
        map.insert("filtered", stats.filtered);
        map.insert("method", stats.by_method);
        map.insert("ping", stats.by_ping);
        map.insert("direction", stats.by_direction);
        map.insert("size", stats.by_size);
        map.insert("risk", stats.by_risk);
        map.insert("content", stats.by_content);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use km_core::Direction;

    fn event(method: &str, payload: &[u8], direction: Direction) -> Event {
        Event::new(format!("evt_{method}"), direction, method, payload).unwrap()
    }

    fn chain(rules: FilterRules) -> FilterChain {
        FilterChain::new(rules, RiskScorer::default())
    }

    #[tokio::test]
    async fn default_rules_capture_everything_but_score_it() {
        let chain = chain(FilterRules::default());
        let ev = event("tools/call", b"{}", Direction::Inbound);
        let (ok, reason) = chain.should_capture(&ev).await;
        assert!(ok, "unexpected reject: {reason:?}");
        assert_eq!(ev.risk().unwrap().level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn ping_exclusion_is_case_insensitive() {
        let chain = chain(FilterRules {
            exclude_ping_messages: true,
            ..Default::default()
        });
        let ev = event("PING", b"{}", Direction::Inbound);
        let (ok, reason) = chain.should_capture(&ev).await;
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("ping excluded"));
        assert_eq!(chain.stats().by_ping, 1);
    }

    #[tokio::test]
    async fn blacklist_wins_over_whitelist() {
        let chain = chain(FilterRules {
            method_whitelist: vec!["tools/*".into()],
            method_blacklist: vec!["tools/call".into()],
            ..Default::default()
        });
        let ev = event("tools/call", b"{}", Direction::Inbound);
        assert!(!chain.should_capture(&ev).await.0);

        let ev = event("tools/list", b"{}", Direction::Inbound);
        assert!(chain.should_capture(&ev).await.0);

        let ev = event("resources/read", b"{}", Direction::Inbound);
        let (ok, reason) = chain.should_capture(&ev).await;
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("method not in whitelist"));
    }

    #[tokio::test]
    async fn wildcard_variants() {
        assert!(method_matches("*", "anything"));
        assert!(method_matches("tools/*", "tools/call"));
        assert!(!method_matches("tools/*", "resources/read"));
        assert!(method_matches("*/list", "tools/list"));
        assert!(!method_matches("*/list", "tools/call"));
        assert!(method_matches("ping", "ping"));
    }

    #[tokio::test]
    async fn direction_allow_list() {
        let chain = chain(FilterRules {
            directions: vec![Direction::Outbound],
            ..Default::default()
        });
        let ev = event("x", b"{}", Direction::Inbound);
        let (ok, reason) = chain.should_capture(&ev).await;
        assert!(!ok);
        assert_eq!(reason.as_deref(), Some("direction inbound not allowed"));
    }

    #[tokio::test]
    async fn size_limit_zero_disables() {
        let big = vec![b'x'; 4096];
        let unlimited_chain = chain(FilterRules::default());
        let ev = event("m", &big, Direction::Inbound);
        assert!(unlimited_chain.should_capture(&ev).await.0);

        let chain = chain(FilterRules {
            payload_size_limit: 100,
            ..Default::default()
        });
        let ev = event("m", &big, Direction::Inbound);
        let (ok, reason) = chain.should_capture(&ev).await;
        assert!(!ok);
        assert_eq!(
            reason.as_deref(),
            Some("payload size 4096 exceeds limit 100")
        );
    }

    #[tokio::test]
    async fn min_risk_level_modes() {
        let chain = chain(FilterRules {
            min_risk_level: Some(RiskLevel::Medium),
            ..Default::default()
        });
        let low = event("ping", b"{}", Direction::Inbound);
        assert!(!chain.should_capture(&low).await.0);
        let medium = event("tools/call", b"{}", Direction::Inbound);
        assert!(chain.should_capture(&medium).await.0);

        let high_only = super::FilterChain::new(
            FilterRules {
                high_risk_only: true,
                ..Default::default()
            },
            RiskScorer::default(),
        );
        assert!(!high_only.should_capture(&medium).await.0);
        let high = event("exec", b"{}", Direction::Inbound);
        assert!(high_only.should_capture(&high).await.0);
    }

    #[tokio::test]
    async fn content_blacklist_is_case_insensitive() {
        let chain = chain(FilterRules {
            content_blacklist: vec!["SeCrEt".into()],
            ..Default::default()
        });
        let ev = event("m", b"{\"x\":\"my secret value\"}", Direction::Inbound);
        assert!(!chain.should_capture(&ev).await.0);
        assert_eq!(chain.stats().by_content, 1);
    }

    #[tokio::test]
    async fn update_rules_swaps_atomically() {
        let chain = chain(FilterRules::default());
        let ev = event("ping", b"{}", Direction::Inbound);
        assert!(chain.should_capture(&ev).await.0);

        chain
            .update_rules(FilterRules {
                exclude_ping_messages: true,
                ..Default::default()
            })
            .await;
        let ev = event("ping", b"{}", Direction::Inbound);
        assert!(!chain.should_capture(&ev).await.0);
    }

    #[tokio::test]
    async fn stats_track_every_evaluation() {
        let chain = chain(FilterRules {
            exclude_ping_messages: true,
            ..Default::default()
        });
        for method in ["ping", "tools/call", "ping"] {
            let ev = event(method, b"{}", Direction::Inbound);
            chain.should_capture(&ev).await;
        }
        let stats = chain.stats();
        assert_eq!(stats.evaluated, 3);
        assert_eq!(stats.captured, 1);
        assert_eq!(stats.filtered, 2);
        assert_eq!(stats.by_ping, 2);
    }
}
