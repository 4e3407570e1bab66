//! Application layer containing the payment lifecycle orchestration.
//!
//! This module defines the `PaymentEngine` which acts as the primary entry point for
//! starting payments and reacting to wallet gateway events, together with the registry of
//! in-flight intents, the retry policy, the intent event bus and startup recovery.

pub mod engine;
pub mod events;
pub mod inbox;
pub mod recovery;
pub mod registry;
pub mod retry;
