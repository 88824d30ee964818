pub mod app;
pub mod audit;
pub mod authz;
pub mod bundles;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod policy;
pub mod routes;
pub mod telemetry;

pub use app::Vault;
pub use error::{VaultError, VaultResult};
