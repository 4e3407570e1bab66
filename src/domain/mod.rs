//! Domain layer: the payment intent, its status graph and the ports the engine talks through.

pub mod event;
pub mod intent;
pub mod ledger;
pub mod ports;
pub mod status;
