/// BDRS - BPN Directory Resolution Server
///
/// Maps Catena-X Business Partner Numbers to the DIDs of their wallets.
/// Members resolve mappings through the directory API; operators maintain
/// them through the separately bound management API.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod server;
pub mod store;
pub mod validation;
