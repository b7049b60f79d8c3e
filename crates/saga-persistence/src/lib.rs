//! saga-persistence
//!
//! Log de estados sobre Postgres (Diesel + r2d2) con el mismo contrato que el
//! log en memoria del core.
//!
//! Módulos:
//! - `pg`: `PgStateLogStore`, pool y proveedor de conexiones.
//! - `migrations`: runner embebido de migraciones Diesel.
//! - `config`: carga de configuración desde .env.
//! - `schema`: tablas Diesel declaradas para compilar queries.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_dev_pool_from_env, build_pool, ConnectionProvider, PgPool, PgStateLogStore, PoolProvider};
