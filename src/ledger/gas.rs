//! Gas budgeting for closure submissions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use super::traits::GasPriceOracle;
use super::types::GasBudget;
use crate::config::GasConfig;

/// Oracle that always quotes the configured price.
pub struct FixedGasPrice {
    price: u128,
}

impl FixedGasPrice {
    pub fn new(price: u128) -> Self {
        Self { price }
    }
}

#[async_trait]
impl GasPriceOracle for FixedGasPrice {
    async fn gas_price(&self) -> Result<u128> {
        Ok(self.price)
    }
}

/// Turns a gas estimate into a submission budget.
pub struct GasPolicy {
    config: GasConfig,
    oracle: Arc<dyn GasPriceOracle>,
}

impl GasPolicy {
    pub fn new(config: GasConfig, oracle: Arc<dyn GasPriceOracle>) -> Self {
        Self { config, oracle }
    }

    /// Limit used when no estimate is available.
    pub fn fallback_limit(&self) -> u64 {
        self.config.max_gas_limit
    }

    /// Estimate plus the configured buffer, rounded up and capped.
    pub fn gas_limit(&self, estimate: u64) -> u64 {
        let padded = (Decimal::from(estimate) * (Decimal::ONE + self.config.limit_buffer)).ceil();
        padded
            .to_u64()
            .unwrap_or(u64::MAX)
            .min(self.config.max_gas_limit)
    }

    /// Oracle price scaled by the fee multiplier, rounded up.
    pub async fn gas_price(&self) -> Result<u128> {
        let quoted = self
            .oracle
            .gas_price()
            .await
            .context("Gas price oracle failed")?;

        if self.config.fee_multiplier == Decimal::ONE {
            return Ok(quoted);
        }

        let quoted_dec = Decimal::try_from_i128_with_scale(
            i128::try_from(quoted).context("Gas price out of range")?,
            0,
        )
        .context("Gas price out of decimal range")?;
        (quoted_dec * self.config.fee_multiplier)
            .ceil()
            .to_u128()
            .context("Scaled gas price out of range")
    }

    pub async fn budget(&self, estimate: Option<u64>) -> Result<GasBudget> {
        let gas_limit = estimate
            .map(|e| self.gas_limit(e))
            .unwrap_or_else(|| self.fallback_limit());
        let gas_price = self.gas_price().await?;

        debug!(?estimate, gas_limit, gas_price, "Gas budget computed");

        Ok(GasBudget {
            gas_limit,
            gas_price,
        })
    }
}
