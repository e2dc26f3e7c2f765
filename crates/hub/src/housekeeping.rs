//! Periodic housekeeping. Light sensors report irregularly, so the hub
//! closes DLI days itself once the local midnight has passed.

use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;

use crate::garden::ChangeSet;
use crate::service::{persist, HubContext};

/// Run the ticker loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(ctx: HubContext, tick_interval: Duration) {
    let mut ticker = tokio::time::interval(tick_interval);
    info!(tick_sec = tick_interval.as_secs(), "housekeeping started");

    loop {
        ticker.tick().await;
        tick(&ctx, OffsetDateTime::now_utc()).await;
    }
}

/// One housekeeping pass.
pub async fn tick(ctx: &HubContext, now: OffsetDateTime) -> ChangeSet {
    let (changes, pending) = {
        let mut st = ctx.shared.write().await;
        let changes = st.garden.tick(now);
        if !changes.plants.is_empty() {
            st.record_system(format!("dli day closed for {} plant(s)", changes.plants.len()));
        }
        let pending = ctx.stage(&st.garden, &changes).await;
        (changes, pending)
    };

    if !changes.is_empty() {
        info!(plants = changes.plants.len(), cycles = changes.cycles.len(), "dli rollover");
    }
    persist(ctx, pending).await;
    changes
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::db::Db;
    use crate::garden::{Garden, Settings};
    use crate::service::{execute, ingest};
    use crate::slot::Slot;
    use crate::species::CatalogLookup;
    use crate::state::{HubState, SourceCache};
    use std::sync::Arc;
    use time::macros::datetime;

    async fn test_ctx() -> HubContext {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        HubContext::new(
            HubState::new(Garden::new(Settings::default()), SourceCache::default())
                .into_shared(),
            db,
            Arc::new(CatalogLookup::default()),
        )
    }

    #[tokio::test]
    async fn tick_closes_the_day_and_persists() {
        let ctx = test_ctx().await;
        execute(
            &ctx,
            Command::CreatePlant {
                id: Some("basil".into()),
                name: "Basil".into(),
                species_id: None,
            },
        )
        .await
        .unwrap();
        ingest(&ctx, "sensor.lux", Some(20_000.0), datetime!(2024-06-01 06:00 UTC)).await;
        execute(
            &ctx,
            Command::ReplaceSensor {
                plant: "basil".into(),
                slot: Slot::Illuminance,
                source: Some("sensor.lux".into()),
            },
        )
        .await
        .unwrap();
        ingest(&ctx, "sensor.lux", Some(20_000.0), datetime!(2024-06-01 18:00 UTC)).await;

        let quiet = tick(&ctx, datetime!(2024-06-01 23:00 UTC)).await;
        assert!(quiet.is_empty());

        let changes = tick(&ctx, datetime!(2024-06-02 00:05 UTC)).await;
        assert!(changes.plants.contains("basil"));
        let stored = ctx.db.load_plants().await.unwrap();
        let dli = stored[0].meter(Slot::Dli).unwrap().value().unwrap();
        assert!(dli > 0.0);
    }

    #[tokio::test]
    async fn tick_on_empty_garden_is_a_no_op() {
        let ctx = test_ctx().await;
        let changes = tick(&ctx, datetime!(2024-06-02 00:05 UTC)).await;
        assert!(changes.is_empty());
        assert!(ctx.shared.read().await.events.is_empty());
    }
}
