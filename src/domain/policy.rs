use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::Side;
use crate::error::{Result, WardenError};

/// Distance kept between the mark and an activation it has already passed
const ACTIVATION_NUDGE: Decimal = dec!(0.0001);

/// Price the trailing-stop activation is measured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationReference {
    #[default]
    Entry,
    Mark,
}

impl std::str::FromStr for ActivationReference {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" => Ok(ActivationReference::Entry),
            "mark" => Ok(ActivationReference::Mark),
            other => Err(WardenError::Validation(format!(
                "invalid activation_reference '{}'; expected entry|mark",
                other
            ))),
        }
    }
}

/// Protection policy applied to every open position, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionPolicy {
    pub stop_loss_percent: Decimal,
    /// Trailing callback in percent; zero disables the trailing stop
    pub trailing_callback_rate: Decimal,
    pub trailing_activation_percent: Decimal,
    pub mandatory: bool,
    pub activation_reference: ActivationReference,
    pub take_profit_percent: Option<Decimal>,
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        Self {
            stop_loss_percent: dec!(6.5),
            trailing_callback_rate: dec!(0.5),
            trailing_activation_percent: dec!(3.0),
            mandatory: true,
            activation_reference: ActivationReference::Entry,
            take_profit_percent: None,
        }
    }
}

impl ProtectionPolicy {
    pub fn trailing_enabled(&self) -> bool {
        self.trailing_callback_rate > Decimal::ZERO
    }

    /// Stop-loss trigger: long `entry × (1 − sl%)`, short `entry × (1 + sl%)`
    pub fn stop_loss_price(&self, side: Side, entry_price: Decimal) -> Decimal {
        let ratio = self.stop_loss_percent / dec!(100);
        match side {
            Side::Long => entry_price * (Decimal::ONE - ratio),
            Side::Short => entry_price * (Decimal::ONE + ratio),
        }
    }

    /// Trailing activation from the configured reference; mark falls back to entry when unknown.
    /// When a known mark is already past that level the venue would reject the
    /// order as immediately triggering, so activation moves just beyond the mark.
    pub fn trailing_activation_price(
        &self,
        side: Side,
        entry_price: Decimal,
        mark_price: Option<Decimal>,
    ) -> Decimal {
        let mark = mark_price.filter(|m| *m > Decimal::ZERO);
        let reference = match self.activation_reference {
            ActivationReference::Entry => entry_price,
            ActivationReference::Mark => mark.unwrap_or(entry_price),
        };
        let ratio = self.trailing_activation_percent / dec!(100);
        match side {
            Side::Long => {
                let activation = reference * (Decimal::ONE + ratio);
                mark.map_or(activation, |m| activation.max(m * (Decimal::ONE + ACTIVATION_NUDGE)))
            }
            Side::Short => {
                let activation = reference * (Decimal::ONE - ratio);
                mark.map_or(activation, |m| activation.min(m * (Decimal::ONE - ACTIVATION_NUDGE)))
            }
        }
    }

    pub fn take_profit_price(&self, side: Side, entry_price: Decimal) -> Option<Decimal> {
        let tp = self.take_profit_percent?;
        let ratio = tp / dec!(100);
        Some(match side {
            Side::Long => entry_price * (Decimal::ONE + ratio),
            Side::Short => entry_price * (Decimal::ONE - ratio),
        })
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.stop_loss_percent <= Decimal::ZERO || self.stop_loss_percent >= dec!(100) {
            errors.push(format!(
                "protection.stop_loss_percent must be in (0, 100), got {}",
                self.stop_loss_percent
            ));
        }
        if self.trailing_callback_rate < Decimal::ZERO || self.trailing_callback_rate > dec!(10) {
            errors.push(format!(
                "protection.trailing_callback_rate must be in [0, 10], got {}",
                self.trailing_callback_rate
            ));
        }
        if self.trailing_activation_percent < Decimal::ZERO
            || self.trailing_activation_percent >= dec!(100)
        {
            errors.push(format!(
                "protection.trailing_activation_percent must be in [0, 100), got {}",
                self.trailing_activation_percent
            ));
        }
        if let Some(tp) = self.take_profit_percent {
            if tp <= Decimal::ZERO || tp >= dec!(100) {
                errors.push(format!(
                    "protection.take_profit_percent must be in (0, 100), got {}",
                    tp
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_loss_formula_by_side() {
        let policy = ProtectionPolicy::default();
        assert_eq!(policy.stop_loss_price(Side::Short, dec!(4000)), dec!(4260));
        assert_eq!(policy.stop_loss_price(Side::Long, dec!(100000)), dec!(93500));
    }

    #[test]
    fn activation_uses_configured_reference() {
        let mut policy = ProtectionPolicy::default();
        assert_eq!(
            policy.trailing_activation_price(Side::Long, dec!(100), Some(dec!(101))),
            dec!(103)
        );

        policy.activation_reference = ActivationReference::Mark;
        assert_eq!(
            policy.trailing_activation_price(Side::Long, dec!(100), Some(dec!(110))),
            dec!(113.3)
        );
        assert_eq!(
            policy.trailing_activation_price(Side::Short, dec!(100), None),
            dec!(97)
        );
    }

    #[test]
    fn activation_moves_past_a_mark_already_beyond_it() {
        let policy = ProtectionPolicy::default();
        assert_eq!(
            policy.trailing_activation_price(Side::Long, dec!(100), Some(dec!(110))),
            dec!(110.011)
        );
        assert_eq!(
            policy.trailing_activation_price(Side::Short, dec!(100), Some(dec!(90))),
            dec!(89.991)
        );
        // Mark exactly at the activation level would trigger on placement
        assert_eq!(
            policy.trailing_activation_price(Side::Long, dec!(100), Some(dec!(103))),
            dec!(103.0103)
        );
    }

    #[test]
    fn take_profit_is_optional() {
        let mut policy = ProtectionPolicy::default();
        assert_eq!(policy.take_profit_price(Side::Long, dec!(100)), None);
        policy.take_profit_percent = Some(dec!(10));
        assert_eq!(policy.take_profit_price(Side::Short, dec!(100)), Some(dec!(90)));
    }

    #[test]
    fn validate_collects_all_errors() {
        let policy = ProtectionPolicy {
            stop_loss_percent: Decimal::ZERO,
            trailing_callback_rate: dec!(-1),
            ..ProtectionPolicy::default()
        };
        let errors = policy.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
