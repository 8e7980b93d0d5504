//! Cost quotes for prediction requests.
//!
//! ```text
//! base_cost       = price * complexity * priority_factor * batch_size
//! volume_discount = price * batch_size * 5%          (batch_size >= 10)
//! discounted_cost = (base_cost - volume_discount) * (1 - base_discount%)
//! ```

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use tollgate_core::ModelId;

use crate::catalog::ModelCatalog;
use crate::error::{Error, Result};
use crate::task::{Priority, TaskInput};

/// Currency every quote is expressed in.
pub const CURRENCY: &str = "USD";

/// Tunable pricing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingParams {
    /// Discount percent applied to every quote.
    pub base_discount_percent: Decimal,
    /// Minimum batch size for the volume discount.
    pub volume_discount_threshold: usize,
    /// Volume discount percent of `price * batch_size`.
    pub volume_discount_percent: Decimal,
    /// Text length above which the complexity factor applies.
    pub text_size_threshold: usize,
    /// Multiplier for long texts.
    pub text_complexity_factor: Decimal,
    /// Multiplier for high priority.
    pub high_priority_factor: Decimal,
}

impl Default for PricingParams {
    fn default() -> Self {
        Self {
            base_discount_percent: Decimal::ZERO,
            volume_discount_threshold: 10,
            volume_discount_percent: dec!(5),
            text_size_threshold: 1000,
            text_complexity_factor: dec!(1.2),
            high_priority_factor: dec!(1.5),
        }
    }
}

/// Factors that went into a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostFactors {
    /// Model price per call.
    pub model_base_price: Decimal,
    /// Long-text multiplier.
    pub complexity_factor: Decimal,
    /// Priority multiplier.
    pub priority_factor: Decimal,
    /// Amount taken off for volume.
    pub volume_discount: Decimal,
    /// Billable items.
    pub batch_size: usize,
}

/// A priced request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Cost before discounts.
    pub base_cost: Decimal,
    /// Cost after discounts; the amount reserved.
    pub discounted_cost: Decimal,
    /// Total discount as a percent of `base_cost`.
    pub discount_percentage: Decimal,
    /// Currency code.
    pub currency: String,
    /// Inputs to the calculation.
    pub breakdown: CostFactors,
}

impl CostBreakdown {
    /// The amount to reserve for this request.
    #[must_use]
    pub const fn amount(&self) -> Decimal {
        self.discounted_cost
    }

    /// Returns true if the request costs nothing.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.discounted_cost <= Decimal::ZERO
    }
}

/// Computes quotes from catalog prices.
#[derive(Clone)]
pub struct PricingService {
    catalog: Arc<dyn ModelCatalog>,
    params: PricingParams,
}

impl std::fmt::Debug for PricingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingService")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl PricingService {
    /// Creates a pricing service with default parameters.
    #[must_use]
    pub fn new(catalog: Arc<dyn ModelCatalog>) -> Self {
        Self {
            catalog,
            params: PricingParams::default(),
        }
    }

    /// Overrides the pricing parameters.
    #[must_use]
    pub const fn with_params(mut self, params: PricingParams) -> Self {
        self.params = params;
        self
    }

    /// Sets the base discount percent.
    #[must_use]
    pub const fn with_base_discount(mut self, percent: Decimal) -> Self {
        self.params.base_discount_percent = percent;
        self
    }

    /// Quotes a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelNotFound`] if the model does not exist.
    pub async fn quote(
        &self,
        model_id: &ModelId,
        input: &TaskInput,
        priority: Priority,
    ) -> Result<CostBreakdown> {
        let model = self
            .catalog
            .get_model(model_id)
            .await?
            .ok_or(Error::ModelNotFound {
                model_id: *model_id,
                version_id: None,
            })?;
        Ok(self.price(model.price_per_call, input, priority))
    }

    /// Prices a request at a known per-call price.
    #[must_use]
    pub fn price(&self, price: Decimal, input: &TaskInput, priority: Priority) -> CostBreakdown {
        let p = &self.params;
        let batch_size = input.item_count();
        let size = Decimal::from(batch_size);

        let complexity_factor = if self.is_complex(input) {
            p.text_complexity_factor
        } else {
            Decimal::ONE
        };
        let priority_factor = if priority == Priority::High {
            p.high_priority_factor
        } else {
            Decimal::ONE
        };

        let base_cost = price * complexity_factor * priority_factor * size;
        let volume_discount = if batch_size >= p.volume_discount_threshold {
            price * size * p.volume_discount_percent / Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        let after_volume = base_cost - volume_discount;
        let discounted_cost =
            after_volume - after_volume * p.base_discount_percent / Decimal::ONE_HUNDRED;

        let discount_percentage = if base_cost > Decimal::ZERO {
            ((base_cost - discounted_cost) / base_cost * Decimal::ONE_HUNDRED).round_dp(2)
        } else {
            Decimal::ZERO
        };

        CostBreakdown {
            base_cost,
            discounted_cost,
            discount_percentage,
            currency: CURRENCY.to_string(),
            breakdown: CostFactors {
                model_base_price: price,
                complexity_factor,
                priority_factor,
                volume_discount,
                batch_size,
            },
        }
    }

    fn is_complex(&self, input: &TaskInput) -> bool {
        input.items().iter().any(|item| {
            item.get("text")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|text| text.chars().count() > self.params.text_size_threshold)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryModelCatalog, ModelInfo};
    use crate::task::Payload;

    fn text(len: usize) -> Payload {
        let mut p = Payload::new();
        p.insert("text".into(), serde_json::Value::String("x".repeat(len)));
        p
    }

    fn service() -> PricingService {
        PricingService::new(Arc::new(InMemoryModelCatalog::new()))
    }

    #[test]
    fn single_normal_is_price() {
        let quote = service().price(dec!(10), &TaskInput::Single(text(5)), Priority::Normal);
        assert_eq!(quote.base_cost, dec!(10));
        assert_eq!(quote.discounted_cost, dec!(10));
        assert_eq!(quote.discount_percentage, Decimal::ZERO);
        assert_eq!(quote.currency, "USD");
    }

    #[test]
    fn long_text_and_high_priority_multiply() {
        let quote = service().price(dec!(10), &TaskInput::Single(text(1001)), Priority::High);
        assert_eq!(quote.breakdown.complexity_factor, dec!(1.2));
        assert_eq!(quote.breakdown.priority_factor, dec!(1.5));
        assert_eq!(quote.base_cost, dec!(18.0));

        let boundary = service().price(dec!(10), &TaskInput::Single(text(1000)), Priority::Normal);
        assert_eq!(boundary.breakdown.complexity_factor, Decimal::ONE);
    }

    #[test]
    fn volume_discount_from_ten_items() {
        let nine = TaskInput::Batch((0..9).map(|_| text(1)).collect());
        assert_eq!(
            service().price(dec!(1), &nine, Priority::Normal).breakdown.volume_discount,
            Decimal::ZERO
        );

        let ten = TaskInput::Batch((0..10).map(|_| text(1)).collect());
        let quote = service().price(dec!(1), &ten, Priority::Normal);
        assert_eq!(quote.base_cost, dec!(10));
        assert_eq!(quote.breakdown.volume_discount, dec!(0.5));
        assert_eq!(quote.discounted_cost, dec!(9.5));
        assert_eq!(quote.discount_percentage, dec!(5));
    }

    #[test]
    fn base_discount_applies_after_volume() {
        let ten = TaskInput::Batch((0..10).map(|_| text(1)).collect());
        let quote = service()
            .with_base_discount(dec!(10))
            .price(dec!(1), &ten, Priority::Normal);
        assert_eq!(quote.discounted_cost, dec!(8.55));
        assert_eq!(quote.discount_percentage, dec!(14.5));
    }

    #[tokio::test]
    async fn quote_requires_known_model() {
        let model = ModelInfo::new("m", dec!(2));
        let pricing = PricingService::new(Arc::new(InMemoryModelCatalog::new().with_model(model.clone())));

        let quote = pricing
            .quote(&model.id, &TaskInput::Single(text(1)), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(quote.amount(), dec!(2));

        let err = pricing
            .quote(&ModelId::generate(), &TaskInput::Single(text(1)), Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound { .. }));
    }
}
