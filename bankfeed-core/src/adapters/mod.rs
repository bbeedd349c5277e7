//! Adapter implementations
//!
//! Adapters implement the port traits with concrete technologies:
//! - DuckDB for the transaction store and notification sink
//! - GoCardless Bank Account Data HTTP client for BankingProvider
//! - TrueLayer Data API HTTP client for BankingProvider

pub mod duckdb;
pub mod gocardless;
mod http;
pub mod truelayer;

#[cfg(test)]
pub mod mock_bank;
