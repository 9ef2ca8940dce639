//! Tradelink Broker Integration Library
//!
//! Unified abstraction over heterogeneous brokerage APIs: credential
//! lifecycle (API key, OAuth1, OAuth2), order execution with an
//! idempotent local state machine, and scheduled position/account
//! synchronization.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod secrets;
