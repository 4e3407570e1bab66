//! Outer adapters: CSV replay scripts in, ledger projections out.

pub mod csv;
pub mod replay;
