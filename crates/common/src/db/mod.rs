//! Database layer
//!
//! Provides:
//! - SeaORM entity models for invoices and line items
//! - `Repository`, the Postgres-backed structured store
//! - Connection pool management with an optional read replica

pub mod models;
mod repository;

pub use repository::{LineItemSummary, Repository};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
///
/// Connections sit behind `Arc` so the pool stays cheap to clone whichever
/// sea-orm backends are enabled.
#[derive(Clone)]
pub struct DbPool {
    /// Primary connection (for writes)
    pub primary: Arc<DatabaseConnection>,

    /// Read replica connection (optional)
    pub replica: Option<Arc<DatabaseConnection>>,
}

impl DbPool {
    /// Wrap already-open connections
    pub fn from_connections(primary: DatabaseConnection, replica: Option<DatabaseConnection>) -> Self {
        Self {
            primary: Arc::new(primary),
            replica: replica.map(Arc::new),
        }
    }

    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!(max_connections = config.max_connections, "Connecting to primary database...");
    
        let mut primary_opts = ConnectOptions::new(&config.url);
        primary_opts
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(config.log_statements);

        let primary = Database::connect(primary_opts)
            .await
            .map_err(|e| AppError::DatabaseConnection { 
                message: format!("Failed to connect to primary: {}", e) 
            })?;
    
        // Connect to replica if configured
        let replica = if let Some(ref read_url) = config.read_url {
            info!("Connecting to read replica...");
        
            let mut replica_opts = ConnectOptions::new(read_url);
            replica_opts
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
                .sqlx_logging(config.log_statements);
        
            let replica_conn = Database::connect(replica_opts)
                .await
                .map_err(|e| AppError::DatabaseConnection { 
                    message: format!("Failed to connect to replica: {}", e) 
                })?;
        
            Some(replica_conn)
        } else {
            None
        };
    
        info!("Database connections established");
    
        Ok(Self::from_connections(primary, replica))
    }

    /// Get the connection for writes (always primary)
    pub fn write(&self) -> &DatabaseConnection {
        &self.primary
    }

    /// Get the connection for reads (replica if available, otherwise primary)
    pub fn read(&self) -> &DatabaseConnection {
        self.replica.as_deref().unwrap_or(&*self.primary)
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        use sea_orm::ConnectionTrait;
    
        self.primary
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Primary ping failed: {}", e),
            })?;
    
        if let Some(ref replica) = self.replica {
            replica
                .execute_unprepared("SELECT 1")
                .await
                .map_err(|e| AppError::DatabaseConnection {
                    message: format!("Replica ping failed: {}", e),
                })?;
        }
    
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_connections() {
        let pool = DbPool::from_connections(DatabaseConnection::Disconnected, None);
        let cloned = pool.clone();

        assert!(Arc::ptr_eq(&pool.primary, &cloned.primary));
        assert!(std::ptr::eq(cloned.read(), cloned.write()));
    }

    #[test]
    fn test_reads_prefer_replica() {
        let pool = DbPool::from_connections(
            DatabaseConnection::Disconnected,
            Some(DatabaseConnection::Disconnected),
        );

        assert!(!std::ptr::eq(pool.read(), pool.write()));
        assert!(std::ptr::eq(pool.read(), &**pool.replica.as_ref().unwrap()));
    }
}
