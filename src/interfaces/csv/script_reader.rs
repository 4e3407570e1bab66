use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ScriptAction {
    /// Caller starts a payment.
    Start,
    /// Gateway issues the external id (`reference` column).
    Issue,
    /// Gateway is ready for approval; `outcome` scripts the approval service.
    Approve,
    /// Gateway is ready for completion with settlement reference `reference`.
    Complete,
    /// Gateway cancels.
    Cancel,
    /// Caller cancels.
    Abort,
    /// Gateway reports an error (`reference` carries the message).
    Error,
    /// Run one timeout sweep.
    Sweep,
}

/// One line of a replay script.
///
/// `outcome` lists what the scripted service answers, in order, separated by `;`
/// (e.g. `transient;transient;approve`).
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ScriptRow {
    pub r#type: ScriptAction,
    #[serde(default)]
    pub payment: String,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

/// Reads replay rows from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over `Result<ScriptRow>`.
/// It handles whitespace trimming and short records automatically.
pub struct ScriptReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ScriptReader<R> {
    /// Creates a new `ScriptReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes rows.
    pub fn rows(self) -> impl Iterator<Item = Result<ScriptRow>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}
