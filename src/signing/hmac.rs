use crate::error::{ConnectorError, Result, WardenError};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Venue API credentials
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &mask(&self.api_key))
            .field("secret", &"***")
            .finish()
    }
}

fn mask(key: &str) -> String {
    if key.len() <= 6 {
        return "***".to_string();
    }
    format!("{}***", &key[..6])
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }

    /// Load from the environment variables named in the venue config
    pub fn from_env(key_var: &str, secret_var: &str) -> Result<Self> {
        let api_key = std::env::var(key_var)
            .map_err(|_| WardenError::Config(config::ConfigError::NotFound(key_var.into())))?;
        let secret = std::env::var(secret_var)
            .map_err(|_| WardenError::Config(config::ConfigError::NotFound(secret_var.into())))?;

        if api_key.trim().is_empty() || secret.trim().is_empty() {
            return Err(WardenError::InvalidConfig(format!(
                "{} / {} must not be empty",
                key_var, secret_var
            )));
        }

        Ok(Self::new(api_key.trim(), secret.trim()))
    }

    /// Hex-encoded HMAC-SHA256 of `payload` keyed by the API secret
    pub fn sign_hex(&self, payload: &str) -> std::result::Result<String, ConnectorError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ConnectorError::AuthFailure(format!("invalid API secret: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_hex_matches_binance_reference() {
        // Reference vector from the Binance API documentation
        let creds = ApiCredentials::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        );
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            creds.sign_hex(payload).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = ApiCredentials::new("abcdefghijkl", "super-secret");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("ghijkl"));
    }
}
