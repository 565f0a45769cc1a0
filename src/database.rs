//! database (db) union structure.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgUserStore;

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::Postgres;
use crate::error::Result;
use crate::user::UserStore;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "ldapsync";
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Custom db structure.
#[derive(Clone)]
pub struct Database {
    pub postgres: PgPool,
}

impl Database {
    /// Init database connections.
    pub async fn new(
        hostname: &str,
        username: &str,
        password: &str,
        db: &str,
        pool: u32,
    ) -> Result<Self> {
        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new().max_connections(pool);
        let postgres = pool.connect(&addr).await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self { postgres })
    }

    /// Connect using the `postgres` configuration section.
    pub async fn from_config(config: &Postgres) -> Result<Self> {
        Self::new(
            &config.address,
            config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
            config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
            config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME),
            config.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
        )
        .await
    }

    /// Execute migrations scripts.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!().run(&self.postgres).await?;
        Ok(())
    }
}

/// Pick the store matching configuration: PostgreSQL when configured,
/// process memory otherwise.
pub async fn store(config: Option<&Postgres>) -> Result<Arc<dyn UserStore>> {
    match config {
        Some(config) => {
            let db = Database::from_config(config).await?;
            db.migrate().await?;
            Ok(Arc::new(PgUserStore::new(db.postgres)))
        },
        None => {
            tracing::warn!(
                "missing `postgres` entry, users are kept in memory only"
            );
            Ok(Arc::new(MemoryStore::default()))
        },
    }
}
