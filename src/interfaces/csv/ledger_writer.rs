use crate::domain::ledger::LedgerEntry;
use crate::domain::status::PaymentStatus;
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

/// Metadata key the replay stores its payment label under.
pub const LABEL_KEY: &str = "payment";

#[derive(Debug, Serialize)]
struct LedgerRow<'a> {
    payment: String,
    status: PaymentStatus,
    amount: Decimal,
    attempts: u32,
    settlement_reference: Option<&'a str>,
    reason: Option<&'a str>,
}

/// Writes ledger projections as CSV, one row per payment.
pub struct LedgerWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> LedgerWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_entries<'a>(&mut self, entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Result<()> {
        for entry in entries {
            let intent = &entry.projection;
            let payment = intent
                .metadata()
                .get(LABEL_KEY)
                .map(ToString::to_string)
                .unwrap_or_else(|| intent.internal_id().to_string());
            self.writer.serialize(LedgerRow {
                payment,
                status: intent.status(),
                amount: intent.amount().value(),
                attempts: intent.attempts(),
                settlement_reference: intent.settlement_reference(),
                reason: intent.reason(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
