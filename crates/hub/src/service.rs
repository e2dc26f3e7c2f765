//! The execution path shared by MQTT and HTTP: apply under the state lock,
//! persist after releasing it.

use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandReply, RefreshRequest};
use crate::db::{Db, PersistBatch};
use crate::error::DomainError;
use crate::garden::{ChangeSet, Garden};
use crate::species::{needs_fetch, SpeciesLookup};
use crate::state::SharedState;

#[derive(Clone)]
pub struct HubContext {
    pub shared: SharedState,
    pub db: Db,
    pub lookup: Arc<dyn SpeciesLookup>,
    write_order: Arc<Mutex<()>>,
}

/// A batch waiting to be written. It holds the write ticket, so batches
/// reach the database in the order they were cut.
pub struct PendingWrite {
    batch: PersistBatch,
    ticket: Option<OwnedMutexGuard<()>>,
}

impl HubContext {
    pub fn new(shared: SharedState, db: Db, lookup: Arc<dyn SpeciesLookup>) -> Self {
        Self {
            shared,
            db,
            lookup,
            write_order: Arc::new(Mutex::new(())),
        }
    }

    /// Cut the snapshots for `changes`. Must be called with the state lock
    /// held; the lock must not be taken again while the ticket is alive.
    pub async fn stage(&self, garden: &Garden, changes: &ChangeSet) -> PendingWrite {
        let batch = PersistBatch::collect(garden, changes);
        let ticket = if batch.is_empty() {
            None
        } else {
            Some(self.write_order.clone().lock_owned().await)
        };
        PendingWrite { batch, ticket }
    }
}

/// Apply one command. Species refreshes are started in the background and
/// answered with `Accepted` right away.
pub async fn execute(ctx: &HubContext, cmd: Command) -> Result<CommandReply, DomainError> {
    let name = cmd.name();
    let refresh = cmd.refresh_request();
    let now = OffsetDateTime::now_utc();

    let (reply, pending) = {
        let mut st = ctx.shared.write().await;
        let st = &mut *st;
        match cmd.apply(&mut st.garden, &st.sources, now) {
            Ok(reply) => {
                st.record_command(format!("{name} ok"));
                let changes = reply.changes().cloned().unwrap_or_default();
                let pending = ctx.stage(&st.garden, &changes).await;
                (reply, pending)
            }
            Err(e) => {
                st.record_error(format!("{name} rejected: {e}"));
                warn!(command = name, error = %e, "command rejected");
                return Err(e);
            }
        }
    };

    info!(command = name, "command applied");
    persist(ctx, pending).await;

    if let Some(request) = refresh {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            refresh_species(&ctx, request).await;
        });
    }
    Ok(reply)
}

/// A sensor entity reported a value. The cache is updated even when no
/// plant is bound to it, so a later bind can adopt the value.
pub async fn ingest(
    ctx: &HubContext,
    entity_id: &str,
    value: Option<f64>,
    timestamp: OffsetDateTime,
) -> ChangeSet {
    let (changes, pending) = {
        let mut st = ctx.shared.write().await;
        st.sources.record(entity_id, value, timestamp);
        let changes = st.garden.on_source_value(entity_id, value, timestamp);
        if !changes.is_empty() {
            st.record_reading(entity_id, value, changes.plants.len());
        }
        let pending = ctx.stage(&st.garden, &changes).await;
        (changes, pending)
    };

    debug!(source = entity_id, ?value, plants = changes.plants.len(), "reading ingested");
    persist(ctx, pending).await;
    changes
}

/// Fetch species metadata and merge it into the plant. The lookup runs
/// without holding the state lock.
pub async fn refresh_species(ctx: &HubContext, request: RefreshRequest) -> ChangeSet {
    let RefreshRequest {
        plant,
        species_id,
        force,
    } = request;

    // Phase 1: decide what to fetch.
    let requested = {
        let st = ctx.shared.read().await;
        let current = match st.garden.species_of(&plant) {
            Ok(current) => current,
            Err(e) => {
                warn!(plant = %plant, error = %e, "species refresh for unknown plant");
                return ChangeSet::default();
            }
        };
        let requested = species_id.unwrap_or_else(|| current.species_id.clone());
        if requested.trim().is_empty() || !needs_fetch(&current, &requested, force) {
            debug!(plant = %plant, "species refresh skipped");
            return ChangeSet::default();
        }
        requested
    };

    // Phase 2: lookup, no lock held.
    let fetched = match ctx.lookup.lookup(&requested).await {
        Ok(fetched) => fetched,
        Err(e) => {
            error!(plant = %plant, species = %requested, error = %e, "species lookup failed");
            ctx.shared
                .write()
                .await
                .record_error(format!("species lookup for '{requested}' failed: {e}"));
            return ChangeSet::default();
        }
    };

    // Phase 3: merge under the lock.
    let (changes, pending) = {
        let mut st = ctx.shared.write().await;
        match st.garden.apply_species(&plant, &requested, fetched, force, OffsetDateTime::now_utc()) {
            Ok(changes) => {
                st.record_species(format!("{plant}: species '{requested}' refreshed"));
                let pending = ctx.stage(&st.garden, &changes).await;
                (changes, pending)
            }
            Err(e) if !e.is_fatal() => {
                warn!(plant = %plant, species = %requested, "species not found; keeping current metadata");
                st.record_species(format!("{plant}: {e}"));
                return ChangeSet::default();
            }
            Err(e) => {
                warn!(plant = %plant, error = %e, "species refresh dropped");
                st.record_error(format!("species refresh for {plant} dropped: {e}"));
                return ChangeSet::default();
            }
        }
    };

    info!(plant = %plant, species = %requested, force, "species refreshed");
    persist(ctx, pending).await;
    changes
}

/// Best-effort write. Failures are logged and recorded, never rolled back.
pub async fn persist(ctx: &HubContext, pending: PendingWrite) {
    let PendingWrite { batch, ticket } = pending;
    if batch.is_empty() {
        return;
    }
    let result = ctx.db.write_batch(&batch).await;
    drop(ticket);
    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "persist failed");
        ctx.shared
            .write()
            .await
            .record_error(format!("persist failed: {e:#}"));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
