// =============================================================================
// Exchange error taxonomy
// =============================================================================
//
// Transient errors are retried inside the gateway; domain errors surface to
// the order executor untouched; auth errors additionally flip the process-wide
// degraded flag. Data-absent conditions (unlisted coin, empty book) are not
// errors at all — reads return `Ok(None)` for those.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("order below exchange minimum: {0}")]
    MinOrderNotMet(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("trading suspended: {0}")]
    TradingSuspended(String),

    #[error("market unavailable: {0}")]
    MarketUnavailable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response decode error: {0}")]
    Decode(String),

    #[error("exchange error {name}: {message}")]
    Other { name: String, message: String },
}

impl ExchangeError {
    /// Map an exchange error object `{error: {name, message}}` to a variant.
    pub fn from_error_name(name: &str, message: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        let msg = message.to_string();

        if lower.contains("insufficient_funds") || lower.contains("insufficient_balance") {
            Self::InsufficientFunds(msg)
        } else if lower.contains("under_min_total") || lower.contains("min_total") {
            Self::MinOrderNotMet(msg)
        } else if lower.contains("order_not_found") {
            Self::OrderNotFound(msg)
        } else if lower.contains("suspended") || lower.contains("market_halted") {
            Self::TradingSuspended(msg)
        } else if lower.contains("market_not_found") || lower.contains("market_unavailable") {
            Self::MarketUnavailable(msg)
        } else if lower.contains("access_key")
            || lower.contains("jwt")
            || lower.contains("nonce")
            || lower.contains("authorization_ip")
            || lower.contains("no_authorization")
        {
            Self::Auth(msg)
        } else if lower.contains("too_many_requests") {
            Self::RateLimited
        } else if lower.contains("invalid") {
            Self::InvalidOrder(msg)
        } else {
            Self::Other { name: name.to_string(), message: msg }
        }
    }

    /// Transient errors are retried silently by the gateway.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited)
    }

    /// Auth errors are fatal and flip the degraded flag.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_error_names() {
        assert!(matches!(
            ExchangeError::from_error_name("insufficient_funds_bid", "x"),
            ExchangeError::InsufficientFunds(_)
        ));
        assert!(matches!(
            ExchangeError::from_error_name("under_min_total_bid", "x"),
            ExchangeError::MinOrderNotMet(_)
        ));
        assert!(matches!(
            ExchangeError::from_error_name("order_not_found", "x"),
            ExchangeError::OrderNotFound(_)
        ));
        assert!(matches!(
            ExchangeError::from_error_name("market_suspended", "x"),
            ExchangeError::TradingSuspended(_)
        ));
        assert!(matches!(
            ExchangeError::from_error_name("invalid_access_key", "x"),
            ExchangeError::Auth(_)
        ));
        assert!(matches!(
            ExchangeError::from_error_name("invalid_volume_bid", "x"),
            ExchangeError::InvalidOrder(_)
        ));
    }

    #[test]
    fn unknown_names_preserved() {
        match ExchangeError::from_error_name("mystery_code", "details") {
            ExchangeError::Other { name, message } => {
                assert_eq!(name, "mystery_code");
                assert_eq!(message, "details");
            }
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[test]
    fn transient_and_auth_classification() {
        assert!(ExchangeError::Transport("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimited.is_transient());
        assert!(!ExchangeError::InvalidOrder("x".into()).is_transient());
        assert!(ExchangeError::Auth("bad key".into()).is_auth());
        assert!(!ExchangeError::Transport("x".into()).is_auth());
    }
}
