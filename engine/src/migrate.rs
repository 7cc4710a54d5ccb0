//! Schema migrations applied while loading persisted data.
//!
//! A collection declares a target version and a chain of single-step
//! transforms. The chain is validated at database construction; at load time
//! the steps from the stored version up to the target run sequentially over
//! the raw decoded entities, before schema decoding.

use crate::error::Result;
use crate::{CollectionName, Error, SchemaVersion};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Raw persisted entities, before schema decoding: id to raw value.
pub type RawEntities = BTreeMap<String, Value>;

/// Transform one version's raw entities into the next version's.
pub type MigrationTransform = Arc<dyn Fn(RawEntities) -> Result<RawEntities> + Send + Sync>;

/// One migration step.
#[derive(Clone)]
pub struct Migration {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub description: Option<String>,
    transform: MigrationTransform,
}

impl Migration {
    pub fn new(
        from: SchemaVersion,
        to: SchemaVersion,
        transform: impl Fn(RawEntities) -> Result<RawEntities> + Send + Sync + 'static,
    ) -> Self {
        Self {
            from,
            to,
            description: None,
            transform: Arc::new(transform),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("description", &self.description)
            .finish()
    }
}

/// One step of a dry-run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub description: Option<String>,
}

/// What `dryRunMigrations` would apply for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunReport {
    pub collection: CollectionName,
    pub stored_version: SchemaVersion,
    pub target_version: SchemaVersion,
    pub steps: Vec<MigrationStep>,
}

fn chain_error(
    collection: &str,
    target: SchemaVersion,
    step: i64,
    reason: impl Into<String>,
) -> Error {
    Error::Migration {
        collection: collection.to_string(),
        from_version: 0,
        to_version: target,
        step,
        reason: reason.into(),
    }
}

/// Validate a migration chain against the collection's declared version.
///
/// Returns the steps sorted by `from`. Valid chains are either empty with
/// version 0, or a contiguous `0 → 1 → … → version` sequence with every
/// step advancing exactly one version and no duplicate starting points.
pub fn validate_chain(
    collection: &str,
    version: SchemaVersion,
    migrations: &[Migration],
) -> Result<Vec<Migration>> {
    if migrations.is_empty() {
        if version == 0 {
            return Ok(Vec::new());
        }
        return Err(chain_error(
            collection,
            version,
            -1,
            format!("empty migration registry for declared version {version}"),
        ));
    }

    let mut sorted: Vec<Migration> = migrations.to_vec();
    sorted.sort_by_key(|m| m.from);

    for (index, step) in sorted.iter().enumerate() {
        if step.to != step.from + 1 {
            return Err(chain_error(
                collection,
                version,
                index as i64,
                format!("step {} -> {} must advance exactly one version", step.from, step.to),
            ));
        }
        if index > 0 && sorted[index - 1].from == step.from {
            return Err(chain_error(
                collection,
                version,
                index as i64,
                format!("duplicate migration from version {}", step.from),
            ));
        }
        if step.from != index as SchemaVersion {
            return Err(chain_error(
                collection,
                version,
                index as i64,
                format!(
                    "chain is not contiguous: expected a step from version {index}, found {}",
                    step.from
                ),
            ));
        }
    }

    let last = sorted.last().map(|m| m.to).unwrap_or(0);
    if last != version {
        return Err(chain_error(
            collection,
            version,
            sorted.len() as i64 - 1,
            format!("chain ends at version {last} but the collection declares {version}"),
        ));
    }

    Ok(sorted)
}

/// Apply the chain steps from `stored_version` up to `target_version`.
pub fn apply_chain(
    collection: &str,
    stored_version: SchemaVersion,
    target_version: SchemaVersion,
    sorted: &[Migration],
    mut data: RawEntities,
) -> Result<RawEntities> {
    if stored_version > target_version {
        return Err(Error::Migration {
            collection: collection.to_string(),
            from_version: stored_version,
            to_version: target_version,
            step: -1,
            reason: "stored version is newer than the declared schema version".to_string(),
        });
    }

    for (index, step) in sorted.iter().enumerate() {
        if step.from < stored_version {
            continue;
        }
        tracing::debug!(
            collection,
            from = step.from,
            to = step.to,
            "applying migration step"
        );
        data = (step.transform)(data).map_err(|e| Error::Migration {
            collection: collection.to_string(),
            from_version: stored_version,
            to_version: target_version,
            step: index as i64,
            reason: e.to_string(),
        })?;
    }
    Ok(data)
}

/// Build the dry-run report for one collection without touching any data.
pub fn dry_run(
    collection: &str,
    stored_version: SchemaVersion,
    target_version: SchemaVersion,
    sorted: &[Migration],
) -> DryRunReport {
    DryRunReport {
        collection: collection.to_string(),
        stored_version,
        target_version,
        steps: sorted
            .iter()
            .filter(|step| step.from >= stored_version)
            .map(|step| MigrationStep {
                from: step.from,
                to: step.to,
                description: step.description.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rename_step(from: SchemaVersion, old: &'static str, new: &'static str) -> Migration {
        Migration::new(from, from + 1, move |mut data: RawEntities| {
            for entity in data.values_mut() {
                if let Some(object) = entity.as_object_mut() {
                    if let Some(value) = object.remove(old) {
                        object.insert(new.to_string(), value);
                    }
                }
            }
            Ok(data)
        })
    }

    fn sample_data() -> RawEntities {
        let mut data = RawEntities::new();
        data.insert("b1".to_string(), json!({"id": "b1", "name": "Dune"}));
        data.insert("b2".to_string(), json!({"id": "b2", "name": "Neuromancer"}));
        data
    }

    #[test]
    fn version_zero_without_migrations_is_valid() {
        assert!(validate_chain("books", 0, &[]).unwrap().is_empty());
    }

    #[test]
    fn nonzero_version_requires_migrations() {
        let err = validate_chain("books", 2, &[]).unwrap_err();
        assert!(matches!(err, Error::Migration { reason, .. } if reason.contains("empty")));
    }

    #[test]
    fn step_must_advance_one_version() {
        let bad = Migration::new(0, 2, Ok);
        let err = validate_chain("books", 2, &[bad]).unwrap_err();
        assert!(matches!(err, Error::Migration { reason, .. } if reason.contains("exactly one")));
    }

    #[test]
    fn duplicate_from_rejected() {
        let steps = vec![rename_step(0, "a", "b"), rename_step(0, "c", "d")];
        let err = validate_chain("books", 1, &steps).unwrap_err();
        assert!(matches!(err, Error::Migration { reason, .. } if reason.contains("duplicate")));
    }

    #[test]
    fn chain_must_be_contiguous_and_complete() {
        let steps = vec![rename_step(1, "a", "b")];
        assert!(validate_chain("books", 2, &steps).is_err());

        let steps = vec![rename_step(0, "a", "b"), rename_step(2, "c", "d")];
        assert!(validate_chain("books", 3, &steps).is_err());

        let steps = vec![rename_step(0, "a", "b")];
        let err = validate_chain("books", 2, &steps).unwrap_err();
        assert!(matches!(err, Error::Migration { reason, .. } if reason.contains("ends at")));
    }

    #[test]
    fn valid_chain_is_sorted() {
        let steps = vec![rename_step(1, "b", "c"), rename_step(0, "a", "b")];
        let sorted = validate_chain("books", 2, &steps).unwrap();
        assert_eq!(sorted[0].from, 0);
        assert_eq!(sorted[1].from, 1);
    }

    #[test]
    fn apply_runs_steps_in_order() {
        let steps = validate_chain(
            "books",
            2,
            &[rename_step(0, "name", "title"), rename_step(1, "title", "headline")],
        )
        .unwrap();
        let migrated = apply_chain("books", 0, 2, &steps, sample_data()).unwrap();
        assert_eq!(migrated["b1"]["headline"], "Dune");
        assert!(migrated["b1"].get("name").is_none());
    }

    #[test]
    fn apply_skips_steps_below_stored_version() {
        let steps = validate_chain(
            "books",
            2,
            &[rename_step(0, "name", "title"), rename_step(1, "name", "headline")],
        )
        .unwrap();
        // Stored at version 1: only the 1 -> 2 step runs
        let migrated = apply_chain("books", 1, 2, &steps, sample_data()).unwrap();
        assert_eq!(migrated["b1"]["headline"], "Dune");
    }

    #[test]
    fn stepwise_equals_full_chain() {
        let full = validate_chain(
            "books",
            2,
            &[rename_step(0, "name", "title"), rename_step(1, "title", "headline")],
        )
        .unwrap();

        let all_at_once = apply_chain("books", 0, 2, &full, sample_data()).unwrap();

        let after_first = apply_chain("books", 0, 1, &full[..1], sample_data()).unwrap();
        let one_at_a_time = apply_chain("books", 1, 2, &full, after_first).unwrap();

        assert_eq!(all_at_once, one_at_a_time);
    }

    #[test]
    fn failing_transform_reports_step() {
        let steps = validate_chain(
            "books",
            1,
            &[Migration::new(0, 1, |_| Err(Error::operation("boom")))],
        )
        .unwrap();
        let err = apply_chain("books", 0, 1, &steps, sample_data()).unwrap_err();
        assert!(matches!(err, Error::Migration { step: 0, .. }));
    }

    #[test]
    fn newer_stored_version_rejected() {
        let err = apply_chain("books", 3, 1, &[], sample_data()).unwrap_err();
        assert!(matches!(err, Error::Migration { reason, .. } if reason.contains("newer")));
    }

    #[test]
    fn dry_run_report() {
        let steps = validate_chain(
            "books",
            2,
            &[
                rename_step(0, "a", "b").with_description("rename a"),
                rename_step(1, "b", "c"),
            ],
        )
        .unwrap();
        let report = dry_run("books", 1, 2, &steps);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].from, 1);
        assert_eq!(report.stored_version, 1);
    }
}
