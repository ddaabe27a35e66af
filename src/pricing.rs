//! Service pricing lookup.
//!
//! Prices come from a [`PricingSource`] collaborator. A missing price or a
//! failing source never fails a refund: [`Pricing::resolve`] falls back to
//! the hardcoded per-variant defaults in [`fallback_price`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::Amount;
use crate::config::PricingConfig;
use crate::model::Variant;

#[derive(Debug, Clone, Error)]
pub enum PricingError {
    #[error("pricing source unavailable: {0}")]
    Unavailable(String),
}

/// Keyed price lookup for a service of a rental variant.
#[async_trait]
pub trait PricingSource: Send + Sync + 'static {
    async fn unit_price(&self, variant: Variant, service: &str)
    -> Result<Option<Amount>, PricingError>;
}

/// Default price used when no configured price can be obtained.
pub fn fallback_price(variant: Variant) -> Amount {
    match variant {
        Variant::Sms => Amount::from_minor(2_100),
        Variant::Voice => Amount::from_minor(2_500),
        Variant::Rental => Amount::from_minor(15_000),
    }
}

/// Prices fixed at construction, typically from [`PricingConfig`].
///
/// Keys are `"<variant>.<service>"`; a bare `"<variant>"` key applies to
/// every service of that variant.
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    prices: HashMap<String, Amount>,
}

impl StaticPricing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PricingConfig) -> Self {
        let mut pricing = Self::new();
        for (key, &minor) in &config.prices {
            if minor <= 0 {
                warn!(key = %key, price = minor, "ignoring non-positive configured price");
                continue;
            }
            pricing
                .prices
                .insert(key.to_ascii_lowercase(), Amount::from_minor(minor));
        }
        pricing
    }

    pub fn with_price(mut self, variant: Variant, service: &str, price: Amount) -> Self {
        self.prices.insert(
            format!("{}.{}", variant.namespace(), service.to_ascii_lowercase()),
            price,
        );
        self
    }

    pub fn with_variant_price(mut self, variant: Variant, price: Amount) -> Self {
        self.prices.insert(variant.namespace().to_string(), price);
        self
    }
}

#[async_trait]
impl PricingSource for StaticPricing {
    async fn unit_price(
        &self,
        variant: Variant,
        service: &str,
    ) -> Result<Option<Amount>, PricingError> {
        let specific = format!("{}.{}", variant.namespace(), service.to_ascii_lowercase());
        Ok(self
            .prices
            .get(&specific)
            .or_else(|| self.prices.get(variant.namespace()))
            .copied())
    }
}

/// Price resolution with fallback.
#[derive(Clone)]
pub struct Pricing {
    source: Arc<dyn PricingSource>,
}

impl Pricing {
    pub fn new(source: Arc<dyn PricingSource>) -> Self {
        Self { source }
    }

    /// Current unit price, or the variant's fallback if the source has no
    /// usable answer.
    pub async fn resolve(&self, variant: Variant, service: &str) -> Amount {
        match self.source.unit_price(variant, service).await {
            Ok(Some(price)) if price.is_positive() => price,
            Ok(_) => {
                let fallback = fallback_price(variant);
                warn!(
                    variant = %variant,
                    service,
                    fallback = %fallback,
                    "no price configured, using fallback"
                );
                fallback
            }
            Err(err) => {
                let fallback = fallback_price(variant);
                warn!(
                    variant = %variant,
                    service,
                    fallback = %fallback,
                    reason = %err,
                    "pricing lookup failed, using fallback"
                );
                fallback
            }
        }
    }
}
