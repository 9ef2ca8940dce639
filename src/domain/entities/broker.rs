use serde::{Deserialize, Serialize};

/// Supported brokerages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Alpaca,
    InteractiveBrokers,
}

impl BrokerKind {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerKind::Alpaca => "alpaca",
            BrokerKind::InteractiveBrokers => "interactive_brokers",
        }
    }

    /// Parse a broker name as stored in the database or sent by the API
    pub fn parse(s: &str) -> Option<BrokerKind> {
        match s {
            "alpaca" => Some(BrokerKind::Alpaca),
            "interactive_brokers" | "ibkr" => Some(BrokerKind::InteractiveBrokers),
            _ => None,
        }
    }

    pub fn all() -> &'static [BrokerKind] {
        &[BrokerKind::Alpaca, BrokerKind::InteractiveBrokers]
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How a broker authenticates API calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// Static key/secret pair sent in request headers
    ApiKey,
    /// Authorization-code flow with bearer access/refresh tokens
    OAuth2,
    /// Request-token flow with per-request HMAC signing
    OAuth1,
}

/// Paper vs. live trading environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn is_paper(&self) -> bool {
        matches!(self, TradingMode::Paper)
    }

    pub fn from_paper_flag(paper: bool) -> TradingMode {
        if paper {
            TradingMode::Paper
        } else {
            TradingMode::Live
        }
    }
}
