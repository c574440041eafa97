//! KPI evaluation semantics.
//!
//! - [`evaluate_atom`]: one comparison against one parameter value
//! - [`evaluate_tree`]: tri-state evaluation of a full expression tree
//! - [`applies`]: whether a definition covers an instance
//! - [`Evaluator`]: the fulfillment check over a whole catalog
//!
//! Evaluation never fails; anomalies in telemetry degrade to
//! [`Fulfillment::Unknown`].

mod applicability;
mod atom;
mod expression;

pub use applicability::applies;
pub use atom::{evaluate_atom, normalize_string_reference};
pub use expression::{combine, evaluate_node, evaluate_tree};

use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::error::{KpiError, KpiResult};
use crate::model::{Fulfillment, FulfillmentCheckResult, SnapshotMap};

/// Runs the fulfillment check for catalog definitions and instances.
pub struct Evaluator<'a> {
    catalog: &'a Catalog,
}

impl<'a> Evaluator<'a> {
    /// Create an evaluator over `catalog`.
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Evaluate one definition for one instance against explicit values.
    ///
    /// # Errors
    /// Returns [`KpiError::UnknownReference`] when either id is not in the
    /// catalog.
    pub fn evaluate(
        &self,
        definition_id: u32,
        instance_id: u32,
        snapshots: &SnapshotMap,
    ) -> KpiResult<Fulfillment> {
        let definition =
            self.catalog
                .definition(definition_id)
                .ok_or(KpiError::UnknownReference {
                    entity: "KPI definition",
                    id: definition_id,
                })?;
        let instance = self
            .catalog
            .instance(instance_id)
            .ok_or(KpiError::UnknownReference {
                entity: "SD instance",
                id: instance_id,
            })?;

        if !instance.confirmed_by_user {
            return Ok(Fulfillment::Unknown);
        }
        Ok(evaluate_tree(&definition.tree, snapshots))
    }

    /// Evaluate every applicable definition for every confirmed instance,
    /// using each instance's own parameter snapshots.
    ///
    /// Results are ordered by instance id, then definition id.
    pub fn evaluate_fleet(&self) -> Vec<FulfillmentCheckResult> {
        let mut results = Vec::new();
        for instance in self.catalog.instances() {
            if !instance.confirmed_by_user {
                debug!(instance_id = instance.id, "Skipping unconfirmed instance");
                continue;
            }
            let snapshots = instance.snapshot_map();
            for definition_id in self.catalog.applicable_definitions(instance.id) {
                let Some(definition) = self.catalog.definition(*definition_id) else {
                    warn!(definition_id, "Applicable definition missing from catalog");
                    continue;
                };
                let fulfillment = evaluate_tree(&definition.tree, &snapshots);
                results.push(FulfillmentCheckResult::new(
                    definition.id,
                    instance.id,
                    fulfillment.as_option(),
                ));
            }
        }
        debug!(results = results.len(), "Fleet evaluation complete");
        results
    }
}
