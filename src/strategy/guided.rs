// =============================================================================
// Guided engine — operator-suggested markets through the standard pipeline
// =============================================================================
//
// Operators queue markets via the admin API; the engine evaluates only queued
// markets, with the same regime/confluence gates as everything else, and
// consumes the queue entry once an order goes out. A queued suggestion is not
// an order: a market that never passes the gates simply ages out.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::info;

use crate::confluence::ConfluenceClass;
use crate::config::StrategyConfig;
use crate::strategy::{EntrySignal, MarketContext, Strategy};
use crate::types::StrategyCode;

/// Suggestions older than this are dropped.
const SUGGESTION_TTL: Duration = Duration::from_secs(3600);

/// Operator suggestion queue shared between the API and the engine.
pub struct GuidedQueue {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl GuidedQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Queue (or refresh) a suggestion with an operator note.
    pub fn suggest(&self, market: &str, note: &str) {
        info!(market, note, "guided suggestion queued");
        self.entries
            .write()
            .insert(market.to_string(), (note.to_string(), Instant::now()));
    }

    /// The note for a still-fresh suggestion.
    pub fn note_for(&self, market: &str) -> Option<String> {
        let entries = self.entries.read();
        let (note, at) = entries.get(market)?;
        (at.elapsed() <= SUGGESTION_TTL).then(|| note.clone())
    }

    pub fn consume(&self, market: &str) {
        self.entries.write().remove(market);
    }

    /// Current fresh suggestions (dashboard).
    pub fn pending(&self) -> Vec<String> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|(_, (_, at))| at.elapsed() <= SUGGESTION_TTL)
            .map(|(m, _)| m.clone())
            .collect()
    }
}

pub struct GuidedStrategy {
    queue: Arc<GuidedQueue>,
}

impl GuidedStrategy {
    pub fn new(queue: Arc<GuidedQueue>) -> Self {
        Self { queue }
    }
}

impl Strategy for GuidedStrategy {
    fn code(&self) -> StrategyCode {
        StrategyCode::Guided
    }

    fn evaluate(&self, ctx: &MarketContext, _config: &StrategyConfig) -> Option<EntrySignal> {
        let note = self.queue.note_for(&ctx.market)?;

        if ctx.confluence.classification == ConfluenceClass::NoSignal
            || ctx.confluence.classification == ConfluenceClass::InsufficientData
        {
            return None;
        }

        // An operator call gets a modest vote of confidence on top of the
        // measured score.
        Some(EntrySignal {
            confidence: (ctx.confluence.total + 10.0).min(100.0),
            reason: format!("guided entry: {note}"),
        })
    }

    fn on_entry(&self, market: &str) {
        self.queue.consume(market);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::context;

    fn config() -> StrategyConfig {
        StrategyConfig::defaults_for(StrategyCode::Guided)
    }

    #[test]
    fn unqueued_market_is_ignored() {
        let queue = GuidedQueue::new();
        let strategy = GuidedStrategy::new(queue);
        let ctx = context("KRW-BTC");
        assert!(strategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn queued_market_enters_with_bonus() {
        let queue = GuidedQueue::new();
        queue.suggest("KRW-BTC", "post-halving accumulation");
        let strategy = GuidedStrategy::new(queue.clone());

        let ctx = context("KRW-BTC");
        let signal = strategy.evaluate(&ctx, &config()).unwrap();
        assert!((signal.confidence - 70.0).abs() < 1e-10);
        assert!(signal.reason.contains("post-halving"));

        // Entry consumes the suggestion.
        strategy.on_entry("KRW-BTC");
        assert!(queue.note_for("KRW-BTC").is_none());
        assert!(strategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn queued_market_still_needs_a_signal() {
        let queue = GuidedQueue::new();
        queue.suggest("KRW-BTC", "just buy it");
        let strategy = GuidedStrategy::new(queue);

        let mut ctx = context("KRW-BTC");
        ctx.confluence.classification = ConfluenceClass::NoSignal;
        ctx.confluence.total = 10.0;
        assert!(strategy.evaluate(&ctx, &config()).is_none());
    }

    #[test]
    fn pending_lists_fresh_suggestions() {
        let queue = GuidedQueue::new();
        queue.suggest("KRW-BTC", "a");
        queue.suggest("KRW-ETH", "b");
        let mut pending = queue.pending();
        pending.sort();
        assert_eq!(pending, vec!["KRW-BTC", "KRW-ETH"]);
    }
}
