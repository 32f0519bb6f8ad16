//! Transfer Relayer - on-chain leg of a custodial stablecoin payment service
//!
//! Turns payment intents into signed ERC-20 transfers, allocates nonces per
//! account and network, and tracks each submission until the network settles it.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod payment;
pub mod state;
pub mod tx;
