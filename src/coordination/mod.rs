//! Payment coordination
//!
//! The payment relayer:
//! 1. Claims initiated payment intents from the store
//! 2. Builds, signs and submits one transfer per intent
//! 3. Tracks submissions until their nonce is consumed on-chain
//! 4. Feeds the outcome back to the payment record

pub mod engine;

pub use engine::PaymentRelayer;
