//! Centralized pricing for the metered services.
//!
//! A single source of truth for unit prices across recognition,
//! synthesis, and inference. Prices are refreshed from a
//! [`PricingSource`] on a TTL; when the source is unreachable the
//! static USD defaults below apply. Key format: "service:operation"
//! (lowercase).

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collab::PricingSource;

/// How long a fetched price snapshot stays fresh.
pub const PRICING_REFRESH_TTL: Duration = Duration::from_secs(300);

/// Pricing unit for a metered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingUnit {
    /// Price per minute of audio
    PerMinute,
    /// Price per 1000 characters of synthesized text
    Per1KChars,
    /// Price per 1 million tokens
    Per1MTokens,
}

/// Unit price in USD for one metered operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price {
    pub amount: f64,
    pub unit: PricingUnit,
}

impl Price {
    pub const fn new(amount: f64, unit: PricingUnit) -> Self {
        Self { amount, unit }
    }

    /// Cost of `quantity` in the unit's natural measure: minutes for
    /// time pricing, characters for character pricing, tokens for token
    /// pricing.
    pub fn cost_of(&self, quantity: f64) -> f64 {
        match self.unit {
            PricingUnit::PerMinute => self.amount * quantity,
            PricingUnit::Per1KChars => self.amount * (quantity / 1000.0),
            PricingUnit::Per1MTokens => self.amount * (quantity / 1_000_000.0),
        }
    }
}

/// Fallback prices when the pricing source is unreachable.
/// Key format: "service:operation" (lowercase)
static DEFAULT_PRICES: LazyLock<HashMap<&'static str, Price>> = LazyLock::new(|| {
    let mut m = HashMap::new();

    // Streaming recognition, billed on audio duration
    m.insert(
        "recognition:streaming",
        Price::new(0.0077, PricingUnit::PerMinute),
    );

    // Streaming synthesis, billed on input characters
    m.insert(
        "synthesis:characters",
        Price::new(0.24, PricingUnit::Per1KChars),
    );

    // Chat completion, billed per token direction
    m.insert(
        "inference:prompt_tokens",
        Price::new(0.15, PricingUnit::Per1MTokens),
    );
    m.insert(
        "inference:completion_tokens",
        Price::new(0.60, PricingUnit::Per1MTokens),
    );

    m
});

struct Snapshot {
    prices: HashMap<String, Price>,
    fetched_at: Option<Instant>,
}

/// TTL-refreshed price cache over a [`PricingSource`].
pub struct PricingTable {
    source: Arc<dyn PricingSource>,
    snapshot: ArcSwap<Snapshot>,
    ttl: Duration,
}

impl PricingTable {
    pub fn new(source: Arc<dyn PricingSource>) -> Self {
        Self {
            source,
            snapshot: ArcSwap::from_pointee(Snapshot {
                prices: HashMap::new(),
                fetched_at: None,
            }),
            ttl: PRICING_REFRESH_TTL,
        }
    }

    #[cfg(test)]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Pull fresh prices if the snapshot has aged out. Source failures
    /// keep the previous snapshot (or the static defaults) in place.
    pub async fn refresh_if_stale(&self) {
        let stale = match self.snapshot.load().fetched_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        };
        if !stale {
            return;
        }

        match self.source.current_prices().await {
            Ok(prices) => {
                debug!(entries = prices.len(), "Refreshed pricing snapshot");
                self.snapshot.store(Arc::new(Snapshot {
                    prices,
                    fetched_at: Some(Instant::now()),
                }));
            }
            Err(e) => {
                warn!("Pricing refresh failed, keeping previous prices: {e}");
            }
        }
    }

    /// Current price for `service:operation`, falling back to the static
    /// defaults for keys the source does not carry.
    pub fn price(&self, service: &str, operation: &str) -> Option<Price> {
        let key = format!("{}:{}", service.to_lowercase(), operation.to_lowercase());
        if let Some(price) = self.snapshot.load().prices.get(key.as_str()) {
            return Some(*price);
        }
        DEFAULT_PRICES.get(key.as_str()).copied()
    }

    /// Cost of `quantity` units of `service:operation`; zero for
    /// unpriced operations.
    pub fn cost(&self, service: &str, operation: &str, quantity: f64) -> f64 {
        self.price(service, operation)
            .map(|p| p.cost_of(quantity))
            .unwrap_or(0.0)
    }
}
