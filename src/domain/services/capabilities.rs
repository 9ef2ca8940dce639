//! Capability Registry
//!
//! Static description of what each broker supports: asset classes, order
//! types, time-in-force values, and accepted auth schemes. Consulted by
//! the connection service before initiating an auth flow and by the order
//! executor before submitting an order, so unsupported requests fail
//! locally instead of as a broker rejection.

use crate::domain::entities::broker::{AuthScheme, BrokerKind};
use crate::domain::entities::order::{OrderType, TimeInForce, UnifiedOrder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
    UsEquity,
    Etf,
    Option,
    Crypto,
}

#[derive(Debug, Clone)]
pub struct BrokerCapabilities {
    pub broker: BrokerKind,
    /// Accepted auth schemes, preferred first
    pub auth_schemes: &'static [AuthScheme],
    pub asset_classes: &'static [AssetClass],
    pub order_types: &'static [OrderType],
    pub time_in_force: &'static [TimeInForce],
    pub supports_paper: bool,
    pub supports_options_chain: bool,
    pub supports_news: bool,
    pub supports_fractional: bool,
}

const ALPACA: BrokerCapabilities = BrokerCapabilities {
    broker: BrokerKind::Alpaca,
    auth_schemes: &[AuthScheme::OAuth2, AuthScheme::ApiKey],
    asset_classes: &[AssetClass::UsEquity, AssetClass::Etf, AssetClass::Crypto],
    order_types: &[
        OrderType::Market,
        OrderType::Limit,
        OrderType::Stop,
        OrderType::StopLimit,
    ],
    time_in_force: &[
        TimeInForce::Day,
        TimeInForce::Gtc,
        TimeInForce::Ioc,
        TimeInForce::Fok,
    ],
    supports_paper: true,
    supports_options_chain: false,
    supports_news: true,
    supports_fractional: true,
};

const INTERACTIVE_BROKERS: BrokerCapabilities = BrokerCapabilities {
    broker: BrokerKind::InteractiveBrokers,
    auth_schemes: &[AuthScheme::OAuth1],
    asset_classes: &[
        AssetClass::UsEquity,
        AssetClass::Etf,
        AssetClass::Option,
    ],
    order_types: &[OrderType::Market, OrderType::Limit, OrderType::Stop],
    time_in_force: &[TimeInForce::Day, TimeInForce::Gtc, TimeInForce::Ioc],
    supports_paper: true,
    supports_options_chain: true,
    supports_news: false,
    supports_fractional: false,
};

/// Look up the capabilities of a broker
pub fn capabilities(broker: BrokerKind) -> &'static BrokerCapabilities {
    match broker {
        BrokerKind::Alpaca => &ALPACA,
        BrokerKind::InteractiveBrokers => &INTERACTIVE_BROKERS,
    }
}

/// Whether a broker accepts the given auth scheme
pub fn supports_auth(broker: BrokerKind, scheme: AuthScheme) -> bool {
    capabilities(broker).auth_schemes.contains(&scheme)
}

/// Check an order against the broker's declared capabilities.
/// Returns a human-readable reason on mismatch.
pub fn validate_order(broker: BrokerKind, order: &UnifiedOrder) -> Result<(), String> {
    let caps = capabilities(broker);
    if !caps.order_types.contains(&order.order_type) {
        return Err(format!(
            "{} does not support {:?} orders",
            broker, order.order_type
        ));
    }
    if !caps.time_in_force.contains(&order.time_in_force) {
        return Err(format!(
            "{} does not support time-in-force {:?}",
            broker, order.time_in_force
        ));
    }
    if !caps.supports_fractional && order.quantity.value().fract() != 0.0 {
        return Err(format!("{} does not support fractional quantities", broker));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderSide;

    fn order(order_type: OrderType, qty: f64, tif: TimeInForce) -> UnifiedOrder {
        UnifiedOrder::new(
            "cid".to_string(),
            "AAPL".to_string(),
            OrderSide::Buy,
            order_type,
            qty,
            Some(100.0),
            Some(95.0),
            tif,
        )
        .unwrap()
    }

    #[test]
    fn test_every_broker_has_capabilities() {
        for kind in BrokerKind::all() {
            let caps = capabilities(*kind);
            assert_eq!(caps.broker, *kind);
            assert!(!caps.auth_schemes.is_empty());
            assert!(!caps.order_types.is_empty());
        }
    }

    #[test]
    fn test_auth_scheme_dispatch() {
        assert!(supports_auth(BrokerKind::Alpaca, AuthScheme::OAuth2));
        assert!(supports_auth(BrokerKind::Alpaca, AuthScheme::ApiKey));
        assert!(!supports_auth(BrokerKind::Alpaca, AuthScheme::OAuth1));
        assert!(supports_auth(BrokerKind::InteractiveBrokers, AuthScheme::OAuth1));
        assert!(!supports_auth(BrokerKind::InteractiveBrokers, AuthScheme::OAuth2));
    }

    #[test]
    fn test_validate_order_unsupported_type() {
        let o = order(OrderType::StopLimit, 1.0, TimeInForce::Day);
        assert!(validate_order(BrokerKind::InteractiveBrokers, &o).is_err());
        assert!(validate_order(BrokerKind::Alpaca, &o).is_ok());
    }

    #[test]
    fn test_validate_order_unsupported_tif() {
        let o = order(OrderType::Limit, 1.0, TimeInForce::Fok);
        assert!(validate_order(BrokerKind::InteractiveBrokers, &o).is_err());
    }

    #[test]
    fn test_validate_order_fractional() {
        let o = order(OrderType::Market, 1.5, TimeInForce::Day);
        assert!(validate_order(BrokerKind::Alpaca, &o).is_ok());
        assert!(validate_order(BrokerKind::InteractiveBrokers, &o).is_err());
    }
}
