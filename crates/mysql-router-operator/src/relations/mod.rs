//! Relation endpoints the reconciler consumes.
//!
//! Every endpoint reads from and writes to the relations stored in the
//! [`Model`](crate::model::Model). A relation whose broken event is being handled is treated as
//! absent.

pub mod cos;
pub mod database_provides;
pub mod database_requires;
pub mod tls;

pub const BACKEND_DATABASE_ENDPOINT: &str = "backend-database";
pub const DATABASE_ENDPOINT: &str = "database";
pub const CERTIFICATES_ENDPOINT: &str = "certificates";
pub const METRICS_ENDPOINT: &str = "metrics-endpoint";

/// Peer relation storing unit scoped COS secrets.
pub const COS_PEER_ENDPOINT: &str = "cos";
