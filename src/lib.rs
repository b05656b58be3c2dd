pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod feedback;
pub mod limits;
pub mod matcher;
pub mod model;
pub mod module;
pub mod notify;
pub mod observability;
pub mod reconcile;
pub mod store;
pub mod tickets;
pub mod wal;
