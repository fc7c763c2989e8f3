//! PostgreSQL engine adapter for relkv
//!
//! Implements the [`relkv_core::Driver`] contracts on an r2d2 pool of
//! `postgres` clients. Connections use mutual TLS through native-tls and
//! verify the server certificate against the configured CA. Transactions
//! run at SERIALIZABLE isolation; conflicts surface as Retryable.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod driver;
pub mod error;
pub mod migrate;
pub mod tx;

pub use config::{parse_addr, PostgresConfig, PostgresParams, TlsConfig, TlsParams, DEFAULT_PORT};
pub use driver::{tls_connector, PostgresDb, PostgresDriver, BACKEND_NAME};
pub use error::{classify, convert_error};
pub use tx::PgTx;
