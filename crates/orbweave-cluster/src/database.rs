//! The local graph database, as seen from the control layer.

use crate::error::DatabaseError;

/// Lifecycle hooks of the local database.
pub trait LocalDatabase: Send + Sync {
    fn start(&self) -> Result<(), DatabaseError>;

    fn stop(&self) -> Result<(), DatabaseError>;

    /// Releases everything the database holds. Called once, after `stop`.
    fn shutdown(&self) -> Result<(), DatabaseError>;

    /// Marks the database unhealthy. Called when the node can no longer
    /// trust its local state; the database refuses further work afterwards.
    fn panic(&self, reason: &str);
}
