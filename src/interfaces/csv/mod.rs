pub mod ledger_writer;
pub mod script_reader;
