//! Payment intent lifecycle engine for a lottery wallet integration.
//!
//! A payment starts as an intent, is bound to the wallet's external id, goes through a
//! server-side approval and a server-side completion, and ends `completed`, `cancelled`,
//! `failed` or `timed_out`. Every accepted transition is recorded in a ledger store.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
pub mod telemetry;
