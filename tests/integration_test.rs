//! Integration tests for the full bulk load → evaluation → stream → stats flow
//!
//! These tests verify the end-to-end behavior of the monitoring pipeline,
//! ensuring all components work together correctly.

use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use kpi_fulfillment::aggregation::KpiStats;
use kpi_fulfillment::catalog::{BulkLoad, Catalog};
use kpi_fulfillment::config::{
    BulkLoadConfig, Config, DatabaseConfig, LogFormat, LoggingConfig, StreamConfig,
};
use kpi_fulfillment::evaluation::Evaluator;
use kpi_fulfillment::model::{FulfillmentCheckResult, KpiDefinition};
use kpi_fulfillment::server::{AppState, Monitor};
use kpi_fulfillment::storage::{DefinitionStorage, SqliteStorage};
use kpi_fulfillment::stream::UpdateBatch;

/// Create test configuration
fn create_test_config() -> Config {
    Config {
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Pretty,
        },
        stream: StreamConfig {
            channel_capacity: 2,
            max_line_bytes: 64 * 1024,
        },
        bulk_load: BulkLoadConfig::default(),
    }
}

fn boiler_fleet() -> BulkLoad {
    serde_json::from_value(json!({
        "sdTypes": [
            { "id": 1, "denotation": "boiler", "parameters": [
                { "id": 10, "denotation": "temperature", "type": "NUMBER" },
                { "id": 11, "denotation": "running", "type": "BOOLEAN" },
                { "id": 12, "denotation": "mode", "type": "STRING" }
            ]}
        ],
        "sdInstances": [
            { "id": 1, "uid": "a", "userIdentifier": "Boiler A", "confirmedByUser": true,
              "type": { "id": 1 },
              "parameterSnapshots": [
                { "parameterID": 10, "value": 65 },
                { "parameterID": 11, "value": true },
                { "parameterID": 12, "value": "eco" }
              ] },
            { "id": 2, "uid": "b", "userIdentifier": "Boiler B", "confirmedByUser": true,
              "type": { "id": 1 },
              "parameterSnapshots": [
                { "parameterID": 10, "value": 30 },
                { "parameterID": 11, "value": false }
              ] },
            { "id": 3, "uid": "c", "userIdentifier": "Boiler C", "confirmedByUser": false,
              "type": { "id": 1 },
              "parameterSnapshots": [ { "parameterID": 10, "value": 80 } ] }
        ],
        "sdInstanceGroups": [
            { "id": 100, "userIdentifier": "Basement", "sdInstanceIDs": [3, 1, 2] }
        ],
        "kpiDefinitions": [
            { "id": 1, "userIdentifier": "Warm", "sdTypeID": 1, "sdTypeSpecification": "boiler",
              "nodes": [
                { "id": 1, "nodeType": "LogicalOperation", "type": "AND" },
                { "id": 2, "nodeType": "NumericGTAtom", "parentNodeID": 1, "sdParameterID": 10,
                  "sdParameterSpecification": "temperature", "numericReferenceValue": 50 },
                { "id": 3, "nodeType": "BooleanEQAtom", "parentNodeID": 1, "sdParameterID": 11,
                  "sdParameterSpecification": "running", "booleanReferenceValue": true }
              ] },
            { "id": 2, "userIdentifier": "Eco mode", "sdTypeID": 1, "sdTypeSpecification": "boiler",
              "nodes": [
                { "id": 1, "nodeType": "StringEQAtom", "sdParameterID": 12,
                  "sdParameterSpecification": "mode", "stringReferenceValue": "\"eco\"" }
              ] },
            { "id": 3, "userIdentifier": "Cold alarm", "sdTypeID": 1, "sdTypeSpecification": "boiler",
              "sdInstanceMode": "SELECTED", "selectedSDInstanceUIDs": ["b"],
              "nodes": [
                { "id": 1, "nodeType": "LogicalOperation", "type": "NOR" },
                { "id": 2, "nodeType": "NumericLTAtom", "parentNodeID": 1, "sdParameterID": 10,
                  "sdParameterSpecification": "temperature", "numericReferenceValue": 20 },
                { "id": 3, "nodeType": "BooleanEQAtom", "parentNodeID": 1, "sdParameterID": 11,
                  "sdParameterSpecification": "running", "booleanReferenceValue": false }
              ] }
        ]
    }))
    .unwrap()
}

fn batch_line(results: Vec<FulfillmentCheckResult>) -> String {
    let mut line = serde_json::to_string(&UpdateBatch::new(results)).unwrap();
    line.push('\n');
    line
}

// ============================================================================
// Evaluation
// ============================================================================

#[test]
fn test_fleet_evaluation_from_snapshots() {
    let catalog = Catalog::from_bulk(&boiler_fleet());
    assert!(catalog.issues().is_empty());

    let results = Evaluator::new(&catalog).evaluate_fleet();
    assert_eq!(
        results,
        vec![
            FulfillmentCheckResult::new(1, 1, Some(true)),
            FulfillmentCheckResult::new(2, 1, Some(true)),
            FulfillmentCheckResult::new(1, 2, Some(false)),
            FulfillmentCheckResult::new(2, 2, None),
            FulfillmentCheckResult::new(3, 2, Some(false)),
        ]
    );
}

// ============================================================================
// Stream → store → aggregation
// ============================================================================

#[tokio::test]
async fn test_evaluated_batch_flows_into_stats() {
    let bulk = boiler_fleet();
    let state = Arc::new(AppState::new(create_test_config(), &bulk));

    // Nothing reported yet: every applicable KPI is Unknown.
    assert_eq!(state.aggregator.fleet_stats(), KpiStats::from_counts(0, 0, 7));

    let results = Evaluator::new(&state.catalog).evaluate_fleet();
    let summary = Monitor::new(Arc::clone(&state))
        .run(batch_line(results).as_bytes())
        .await
        .unwrap();

    assert_eq!(summary.consumer.changed_instances, 2);
    assert_eq!(summary.fleet, KpiStats::from_counts(2, 2, 7));
    assert_eq!(summary.fleet.fulfillment_percentage, 29);

    let basement = state.group_report(100).unwrap();
    assert_eq!(basement.stats, summary.fleet);
    let order: Vec<u32> = basement.members.iter().map(|m| m.sd_instance_id).collect();
    assert_eq!(order, vec![2, 1, 3]);

    let boiler_b = state.instance_report(2).unwrap();
    let names: Vec<&str> = boiler_b
        .kpis
        .iter()
        .map(|k| k.user_identifier.as_str())
        .collect();
    assert_eq!(names, vec!["Cold alarm", "Warm", "Eco mode"]);
}

#[tokio::test]
async fn test_redundant_and_unconfirmed_updates_change_nothing() {
    let mut bulk = boiler_fleet();
    bulk.kpi_fulfillment_check_results = vec![
        FulfillmentCheckResult::new(1, 2, Some(false)),
        FulfillmentCheckResult::new(1, 1, Some(true)),
    ];
    let state = Arc::new(AppState::new(create_test_config(), &bulk));
    let versions: Vec<u64> = (1..=3).map(|id| state.store.version(id)).collect();
    let revision = state.aggregator.group_revision(100);

    let input = [
        // Flaps back to the current value within one batch.
        batch_line(vec![
            FulfillmentCheckResult::new(1, 2, Some(true)),
            FulfillmentCheckResult::new(1, 2, Some(false)),
        ]),
        // Unconfirmed instances stay Unknown.
        batch_line(vec![FulfillmentCheckResult::new(1, 3, Some(true))]),
        // Not applicable to Boiler A.
        batch_line(vec![FulfillmentCheckResult::new(3, 1, Some(false))]),
        batch_line(vec![FulfillmentCheckResult::new(1, 1, Some(true))]),
    ]
    .concat();

    let summary = Monitor::new(Arc::clone(&state))
        .run(input.as_bytes())
        .await
        .unwrap();

    assert_eq!(summary.consumer.batches, 4);
    assert_eq!(summary.consumer.changed_instances, 0);
    let after: Vec<u64> = (1..=3).map(|id| state.store.version(id)).collect();
    assert_eq!(after, versions);
    assert_eq!(state.aggregator.group_revision(100), revision);
    assert_eq!(state.store.fulfilled(3), 0);
}

// ============================================================================
// Stored definitions
// ============================================================================

#[tokio::test]
async fn test_stored_definitions_join_the_catalog() {
    let storage = SqliteStorage::new_in_memory().await.unwrap();
    let authored: KpiDefinition = serde_json::from_value(json!({
        "userIdentifier": "Running",
        "sdTypeID": 1,
        "sdTypeSpecification": "boiler",
        "sdInstanceMode": "SELECTED",
        "selectedSDInstanceUIDs": ["a"],
        "nodes": [
            { "id": 7, "nodeType": "BooleanEQAtom", "sdParameterID": 11,
              "sdParameterSpecification": "running", "booleanReferenceValue": true }
        ]
    }))
    .unwrap();
    let prepared = authored.prepared_for_submission().unwrap();
    assert_eq!(prepared.nodes[0].id, 1);
    let id = storage.create_definition(&prepared).await.unwrap();

    let mut bulk = boiler_fleet();
    bulk.kpi_definitions.clear();
    assert_eq!(bulk.merge_definitions(storage.load_definitions().await.unwrap()), 1);

    let catalog = Catalog::from_bulk(&bulk);
    assert_eq!(catalog.applicable_definitions(1), &[id]);
    assert!(catalog.applicable_definitions(2).is_empty());
    assert_eq!(
        Evaluator::new(&catalog).evaluate_fleet(),
        vec![FulfillmentCheckResult::new(id, 1, Some(true))]
    );
}
