//! Persistence for orders, submission failures and webhook events.
//!
//! All order mutations go through [`OrderStore::modify_order`], which runs the
//! read-validate-write cycle atomically for one order row.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryOrderStore;
pub use postgres::PostgresOrderStore;
pub use store::{OrderStore, PaymentEventInsert};
