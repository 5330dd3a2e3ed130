use std::sync::Arc;

use tracing::info;

use super::binance::BinanceConnector;
use super::bybit::BybitConnector;
use super::guarded::GuardedConnector;
use super::paper::PaperVenue;
use super::traits::VenueConnector;
use crate::config::{AppConfig, VenueConfig};
use crate::coordination::{CircuitBreaker, Clock};
use crate::domain::Venue;
use crate::error::Result;
use crate::signing::ApiCredentials;
use crate::supervisor::AlertManager;

/// Create the raw connector for one configured venue.
///
/// Live venues read credentials from the environment variables named in the
/// venue config (or `<VENUE>_API_KEY` / `<VENUE>_API_SECRET`).
pub fn build_venue_connector(venue: &VenueConfig) -> Result<Arc<dyn VenueConnector>> {
    match venue.kind {
        Venue::Paper => Ok(Arc::new(PaperVenue::new())),
        Venue::Binance => {
            let (key_var, secret_var) = venue.credential_vars();
            let credentials = ApiCredentials::from_env(&key_var, &secret_var)?;
            info!(venue = %venue.kind, testnet = venue.testnet, "Binance connector configured");
            Ok(Arc::new(BinanceConnector::new(venue, credentials)?))
        }
        Venue::Bybit => {
            let (key_var, secret_var) = venue.credential_vars();
            let credentials = ApiCredentials::from_env(&key_var, &secret_var)?;
            info!(venue = %venue.kind, testnet = venue.testnet, "Bybit connector configured");
            Ok(Arc::new(BybitConnector::new(venue, credentials)?))
        }
    }
}

/// Wrap a connector in the venue's circuit breaker and retry policy
pub fn guard_connector(
    inner: Arc<dyn VenueConnector>,
    app_config: &AppConfig,
    clock: Arc<dyn Clock>,
    alerts: Arc<AlertManager>,
) -> Arc<GuardedConnector> {
    let breaker = Arc::new(CircuitBreaker::new(
        inner.venue(),
        app_config.circuit_breaker.breaker(),
        Arc::clone(&clock),
    ));
    Arc::new(
        GuardedConnector::new(inner, breaker, app_config.retry.policy(), clock).with_alerts(alerts),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paper_venue_needs_no_credentials() {
        let connector = build_venue_connector(&VenueConfig::paper()).unwrap();
        assert_eq!(connector.venue(), Venue::Paper);
    }

    #[test]
    fn live_venue_without_credentials_is_a_config_error() {
        let mut config = VenueConfig::paper();
        config.kind = Venue::Bybit;
        config.api_key_env = Some("WARDEN_TEST_MISSING_KEY".into());
        config.api_secret_env = Some("WARDEN_TEST_MISSING_SECRET".into());
        assert!(build_venue_connector(&config).is_err());
    }
}
