//! Species metadata carried by a plant, and the rules for refreshing it
//! from an external catalog.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::DomainError;
use crate::slot::Slot;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PictureOrigin {
    /// Came from the metadata provider; may be replaced by a refresh.
    Provider,
    /// Set by the user; only a forced refresh replaces it.
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Picture {
    pub url: String,
    pub origin: PictureOrigin,
}

/// Recommended range for one slot, in the slot's canonical unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeciesLimit {
    pub min: f64,
    pub max: f64,
}

/// A catalog entry as returned by a lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesRecord {
    pub species_id: String,
    pub display_species: Option<String>,
    pub breeder: Option<String>,
    pub flowering_days: Option<u32>,
    pub website: Option<String>,
    pub infotext: Option<String>,
    pub effects: Option<String>,
    pub smell: Option<String>,
    pub taste: Option<String>,
    pub lineage: Option<String>,
    pub image_url: Option<String>,
    /// Applied to the plant's thresholds on a forced refresh. Slots not
    /// listed fall back to their default bounds.
    pub limits: BTreeMap<Slot, SpeciesLimit>,
}

impl SpeciesRecord {
    /// Bounds a forced refresh installs for `slot`.
    pub fn limit_for(&self, slot: Slot) -> (f64, f64) {
        self.limits
            .get(&slot)
            .map_or_else(|| slot.default_bounds(), |l| (l.min, l.max))
    }
}

/// Species metadata as held by a plant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeciesInfo {
    pub species_id: String,
    /// Label shown instead of the raw id.
    pub display_species: Option<String>,
    pub breeder: Option<String>,
    pub flowering_days: Option<u32>,
    /// Flowering duration as delivered by the provider, before user edits.
    pub original_flowering_days: Option<u32>,
    pub website: Option<String>,
    pub infotext: Option<String>,
    pub effects: Option<String>,
    pub smell: Option<String>,
    pub taste: Option<String>,
    pub lineage: Option<String>,
    pub picture: Option<Picture>,
}

impl SpeciesInfo {
    pub fn new(species_id: impl Into<String>) -> Self {
        Self {
            species_id: species_id.into(),
            ..Self::default()
        }
    }

    pub fn label(&self) -> &str {
        self.display_species.as_deref().unwrap_or(&self.species_id)
    }
}

// ---------------------------------------------------------------------------
// Lookup capability
// ---------------------------------------------------------------------------

/// External species catalog. `Ok(None)` means the catalog answered but has
/// no match; `Err` means the catalog could not be asked.
#[async_trait]
pub trait SpeciesLookup: Send + Sync {
    async fn lookup(&self, species_id: &str) -> anyhow::Result<Option<SpeciesRecord>>;
}

/// Catalog backed by the `[[species]]` entries of the config file.
#[derive(Debug, Default)]
pub struct CatalogLookup {
    records: HashMap<String, SpeciesRecord>,
}

impl CatalogLookup {
    pub fn new(records: impl IntoIterator<Item = SpeciesRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.species_id.to_lowercase(), r))
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SpeciesLookup for CatalogLookup {
    async fn lookup(&self, species_id: &str) -> anyhow::Result<Option<SpeciesRecord>> {
        Ok(self.records.get(&species_id.to_lowercase()).cloned())
    }
}

// ---------------------------------------------------------------------------
// Merge policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Same species and no force: nothing fetched, nothing changed.
    Skipped,
    Updated(SpeciesInfo),
}

/// A fetch only happens when forced or when the species id changes.
pub fn needs_fetch(current: &SpeciesInfo, requested_id: &str, force: bool) -> bool {
    force || current.species_id != requested_id
}

/// Compute the plant's new species metadata. On `Err` the caller must leave
/// the plant untouched.
pub fn merge(
    current: &SpeciesInfo,
    requested_id: &str,
    fetched: Option<SpeciesRecord>,
    force: bool,
) -> Result<MergeOutcome, DomainError> {
    if !needs_fetch(current, requested_id, force) {
        return Ok(MergeOutcome::Skipped);
    }
    let Some(record) = fetched else {
        return Err(DomainError::MetadataNotFound(requested_id.to_string()));
    };

    let mut next = current.clone();
    next.species_id = requested_id.to_string();
    next.breeder = record.breeder;
    next.flowering_days = record.flowering_days;
    next.original_flowering_days = record.flowering_days;
    next.website = record.website;
    next.infotext = record.infotext;
    next.effects = record.effects;
    next.smell = record.smell;
    next.taste = record.taste;
    next.lineage = record.lineage;

    let provider_picture = record.image_url.map(|url| Picture {
        url,
        origin: PictureOrigin::Provider,
    });
    if force {
        if provider_picture.is_some() {
            next.picture = provider_picture;
        }
        next.display_species = record
            .display_species
            .or_else(|| Some(requested_id.to_string()));
    } else if current
        .picture
        .as_ref()
        .map_or(true, |p| p.origin == PictureOrigin::Provider)
    {
        next.picture = provider_picture;
    }

    Ok(MergeOutcome::Updated(next))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> SpeciesRecord {
        SpeciesRecord {
            species_id: id.into(),
            display_species: Some(format!("{id} (catalog)")),
            breeder: Some("Seedhouse".into()),
            flowering_days: Some(63),
            website: Some("https://example.org".into()),
            image_url: Some(format!("https://img.example.org/{id}.jpg")),
            ..SpeciesRecord::default()
        }
    }

    fn user_picture() -> Option<Picture> {
        Some(Picture {
            url: "/local/my_plant.jpg".into(),
            origin: PictureOrigin::User,
        })
    }

    fn current() -> SpeciesInfo {
        SpeciesInfo {
            species_id: "basil".into(),
            display_species: Some("My Basil".into()),
            breeder: Some("old".into()),
            flowering_days: Some(10),
            picture: user_picture(),
            ..SpeciesInfo::default()
        }
    }

    fn updated(outcome: MergeOutcome) -> SpeciesInfo {
        match outcome {
            MergeOutcome::Updated(info) => info,
            MergeOutcome::Skipped => panic!("expected an update"),
        }
    }

    #[test]
    fn unchanged_id_without_force_skips() {
        assert!(!needs_fetch(&current(), "basil", false));
        assert_eq!(
            merge(&current(), "basil", Some(record("basil")), false),
            Ok(MergeOutcome::Skipped)
        );
    }

    #[test]
    fn changed_id_overwrites_metadata_keeps_user_picture_and_label() {
        let info = updated(merge(&current(), "thyme", Some(record("thyme")), false).unwrap());
        assert_eq!(info.species_id, "thyme");
        assert_eq!(info.breeder.as_deref(), Some("Seedhouse"));
        assert_eq!(info.flowering_days, Some(63));
        assert_eq!(info.original_flowering_days, Some(63));
        assert_eq!(info.picture, user_picture());
        assert_eq!(info.display_species.as_deref(), Some("My Basil"));
    }

    #[test]
    fn changed_id_replaces_provider_or_missing_picture() {
        let mut cur = current();
        cur.picture = None;
        let info = updated(merge(&cur, "thyme", Some(record("thyme")), false).unwrap());
        assert_eq!(
            info.picture.map(|p| p.origin),
            Some(PictureOrigin::Provider)
        );

        cur.picture = Some(Picture {
            url: "https://img.example.org/basil.jpg".into(),
            origin: PictureOrigin::Provider,
        });
        let info = updated(merge(&cur, "thyme", Some(record("thyme")), false).unwrap());
        assert_eq!(
            info.picture.unwrap().url,
            "https://img.example.org/thyme.jpg"
        );
    }

    #[test]
    fn force_overwrites_everything() {
        let info = updated(merge(&current(), "basil", Some(record("basil")), true).unwrap());
        assert_eq!(info.display_species.as_deref(), Some("basil (catalog)"));
        assert_eq!(
            info.picture.unwrap().url,
            "https://img.example.org/basil.jpg"
        );
    }

    #[test]
    fn miss_changes_nothing() {
        let err = merge(&current(), "thyme", None, true).unwrap_err();
        assert_eq!(err, DomainError::MetadataNotFound("thyme".into()));
    }

    #[test]
    fn label_falls_back_to_id() {
        assert_eq!(SpeciesInfo::new("mint").label(), "mint");
        assert_eq!(current().label(), "My Basil");
    }

    #[test]
    fn limits_fall_back_to_slot_defaults() {
        let mut rec = record("basil");
        rec.limits.insert(Slot::Moisture, SpeciesLimit { min: 35.0, max: 55.0 });
        assert_eq!(rec.limit_for(Slot::Moisture), (35.0, 55.0));
        assert_eq!(rec.limit_for(Slot::Ph), Slot::Ph.default_bounds());
    }

    #[tokio::test]
    async fn catalog_lookup_is_case_insensitive() {
        let catalog = CatalogLookup::new([record("Basil")]);
        assert_eq!(catalog.len(), 1);
        let found = catalog.lookup("basil").await.unwrap();
        assert_eq!(found.map(|r| r.flowering_days), Some(Some(63)));
        assert!(catalog.lookup("mint").await.unwrap().is_none());
    }
}
