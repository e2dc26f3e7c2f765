use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::cycle::Cycle;
use crate::garden::{ChangeSet, Garden, Settings};
use crate::plant::Plant;

const SETTINGS_KEY: &str = "settings";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Snapshots cut from the garden while the state lock is held, written
/// after it is released.
#[derive(Debug, Default)]
pub struct PersistBatch {
    pub plants: Vec<Plant>,
    pub cycles: Vec<Cycle>,
    pub removed_plants: Vec<String>,
    pub removed_cycles: Vec<String>,
    pub settings: Option<Settings>,
}

impl PersistBatch {
    pub fn collect(garden: &Garden, changes: &ChangeSet) -> Self {
        Self {
            plants: changes
                .plants
                .iter()
                .filter_map(|id| garden.plant(id).cloned())
                .collect(),
            cycles: changes
                .cycles
                .iter()
                .filter_map(|id| garden.cycle(id).cloned())
                .collect(),
            removed_plants: changes.removed_plants.iter().cloned().collect(),
            removed_cycles: changes.removed_cycles.iter().cloned().collect(),
            settings: changes.settings.then(|| *garden.settings()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plants.is_empty()
            && self.cycles.is_empty()
            && self.removed_plants.is_empty()
            && self.removed_cycles.is_empty()
            && self.settings.is_none()
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/plant-hub/plant-hub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Plants
    // ----------------------------

    pub async fn upsert_plant(&self, plant: &Plant) -> Result<()> {
        let snapshot = serde_json::to_string(plant)
            .with_context(|| format!("failed to serialize plant '{}'", plant.id()))?;
        sqlx::query(
            r#"
            INSERT INTO plants (plant_id, snapshot, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(plant_id) DO UPDATE SET
              snapshot=excluded.snapshot,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(plant.id())
        .bind(snapshot)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .context("upsert_plant failed")?;
        Ok(())
    }

    pub async fn delete_plant(&self, plant_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM plants WHERE plant_id = ?")
            .bind(plant_id)
            .execute(&self.pool)
            .await
            .context("delete_plant failed")?;
        Ok(())
    }

    pub async fn load_plants(&self) -> Result<Vec<Plant>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT plant_id, snapshot FROM plants ORDER BY plant_id")
                .fetch_all(&self.pool)
                .await
                .context("load_plants failed")?;

        rows.into_iter()
            .map(|(id, snapshot)| {
                serde_json::from_str(&snapshot)
                    .with_context(|| format!("corrupt snapshot for plant '{id}'"))
            })
            .collect()
    }

    // ----------------------------
    // Cycles
    // ----------------------------

    pub async fn upsert_cycle(&self, cycle: &Cycle) -> Result<()> {
        let snapshot = serde_json::to_string(cycle)
            .with_context(|| format!("failed to serialize cycle '{}'", cycle.id()))?;
        sqlx::query(
            r#"
            INSERT INTO cycles (cycle_id, snapshot, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(cycle_id) DO UPDATE SET
              snapshot=excluded.snapshot,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(cycle.id())
        .bind(snapshot)
        .bind(now_unix())
        .execute(&self.pool)
        .await
        .context("upsert_cycle failed")?;
        Ok(())
    }

    pub async fn delete_cycle(&self, cycle_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cycles WHERE cycle_id = ?")
            .bind(cycle_id)
            .execute(&self.pool)
            .await
            .context("delete_cycle failed")?;
        Ok(())
    }

    pub async fn load_cycles(&self) -> Result<Vec<Cycle>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT cycle_id, snapshot FROM cycles ORDER BY cycle_id")
                .fetch_all(&self.pool)
                .await
                .context("load_cycles failed")?;

        rows.into_iter()
            .map(|(id, snapshot)| {
                serde_json::from_str(&snapshot)
                    .with_context(|| format!("corrupt snapshot for cycle '{id}'"))
            })
            .collect()
    }

    // ----------------------------
    // Settings
    // ----------------------------

    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let value = serde_json::to_string(settings).context("failed to serialize settings")?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value
            "#,
        )
        .bind(SETTINGS_KEY)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("save_settings failed")?;
        Ok(())
    }

    pub async fn load_settings(&self) -> Result<Option<Settings>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(SETTINGS_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("load_settings failed")?;

        row.map(|(value,)| serde_json::from_str(&value).context("corrupt settings row"))
            .transpose()
    }

    // ----------------------------
    // Batches
    // ----------------------------

    /// Write a batch of snapshots. Each row is its own statement; a failure
    /// stops the batch and is returned to the caller for logging.
    pub async fn write_batch(&self, batch: &PersistBatch) -> Result<()> {
        for plant in &batch.plants {
            self.upsert_plant(plant).await?;
        }
        for cycle in &batch.cycles {
            self.upsert_cycle(cycle).await?;
        }
        for id in &batch.removed_plants {
            self.delete_plant(id).await?;
        }
        for id in &batch.removed_cycles {
            self.delete_cycle(id).await?;
        }
        if let Some(settings) = &batch.settings {
            self.save_settings(settings).await?;
        }
        Ok(())
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ===========================================================================
// Tests
// ===========================================================================
