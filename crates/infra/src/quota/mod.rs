//! Quota ledger: usage per owner per billing period.

pub mod ledger;
pub mod postgres;

pub use ledger::{InMemoryQuotaLedger, QuotaDebit, QuotaError, QuotaLedger};
pub use postgres::PostgresQuotaLedger;
