//! Port definitions (hexagonal architecture)
//!
//! Ports define the interfaces for external dependencies. Services depend on
//! these traits; adapters implement them.

mod banking_provider;
mod store;

pub use banking_provider::{
    BankingProvider, CallbackOutcome, CallbackParams, ConnectionRequest, ConnectionStart,
    FetchedTransactions, RefreshOutcome,
};
pub use store::{NotificationSink, TransactionStore, MAX_KEYS_PER_QUERY};
