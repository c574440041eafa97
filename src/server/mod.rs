//! Application state and the monitoring loop.
//!
//! [`AppState`] wires a bulk load into the catalog, the fulfillment store
//! and the aggregator. [`Monitor`] feeds an update stream into that state
//! and logs every instance change as it lands.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{debug, info, warn};

use crate::aggregation::{Aggregator, KpiStats, MemberStats};
use crate::catalog::{BulkLoad, Catalog};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::store::{FulfillmentStore, KpiEntry};
use crate::stream::{self, ConsumerStats, ReaderStats};

/// Application state shared across the monitoring components
pub struct AppState {
    pub config: Config,
    pub catalog: Arc<Catalog>,
    pub store: Arc<FulfillmentStore>,
    pub aggregator: Aggregator,
}

impl AppState {
    /// Build the catalog from `bulk`, seed the store with its initial
    /// results and start aggregating.
    pub fn new(config: Config, bulk: &BulkLoad) -> Self {
        let catalog = Arc::new(Catalog::from_bulk(bulk));
        for issue in catalog.issues() {
            warn!(issue = %issue, "KPI definition not loaded");
        }

        let store = Arc::new(FulfillmentStore::new(Arc::clone(&catalog)));
        let changed = store.ingest_initial(&bulk.kpi_fulfillment_check_results);
        let aggregator = Aggregator::new(Arc::clone(&store));

        info!(
            instances = store.instance_ids().len(),
            seeded = changed.len(),
            "AppState initialized"
        );

        Self {
            config,
            catalog,
            store,
            aggregator,
        }
    }

    /// Current state of one instance, `None` for unknown instances.
    pub fn instance_report(&self, instance_id: u32) -> Option<InstanceReport> {
        let instance = self.catalog.instance(instance_id)?;
        Some(InstanceReport {
            sd_instance_id: instance.id,
            user_identifier: instance.user_identifier.clone(),
            confirmed_by_user: instance.confirmed_by_user,
            version: self.store.version(instance.id),
            stats: self.aggregator.instance_stats(instance.id),
            kpis: self.store.get(instance.id),
        })
    }

    /// Current state of one group, `None` for unknown groups.
    pub fn group_report(&self, group_id: u32) -> Option<GroupReport> {
        let group = self.catalog.group(group_id)?;
        Some(GroupReport {
            id: group.id,
            user_identifier: group.user_identifier.clone(),
            stats: self.aggregator.group_stats(group.id)?,
            members: self.aggregator.group_members_by_severity(group.id)?,
        })
    }

    /// Snapshot of the whole fleet: every instance and every group.
    pub fn fleet_report(&self) -> FleetReport {
        let instances = self
            .catalog
            .instances()
            .filter_map(|i| self.instance_report(i.id))
            .collect();
        let groups = self
            .catalog
            .groups()
            .filter_map(|g| self.group_report(g.id))
            .collect();
        FleetReport {
            fleet: self.aggregator.fleet_stats(),
            instances,
            groups,
        }
    }
}

pub type SharedState = Arc<AppState>;

/// KPI state of one device instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReport {
    /// Instance id.
    #[serde(rename = "sdInstanceID")]
    pub sd_instance_id: u32,
    /// Instance display name.
    pub user_identifier: String,
    /// Whether the instance is confirmed.
    pub confirmed_by_user: bool,
    /// Store version of the instance's list.
    pub version: u64,
    /// Fulfillment counts.
    pub stats: KpiStats,
    /// Applicable KPIs in display order.
    pub kpis: Vec<KpiEntry>,
}

/// KPI state of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReport {
    /// Group id.
    pub id: u32,
    /// Group display name.
    pub user_identifier: String,
    /// Sum over the members.
    pub stats: KpiStats,
    /// Members, most failures first.
    pub members: Vec<MemberStats>,
}

/// KPI state of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetReport {
    /// Sum over every instance.
    pub fleet: KpiStats,
    /// Every instance ordered by id.
    pub instances: Vec<InstanceReport>,
    /// Every group ordered by id.
    pub groups: Vec<GroupReport>,
}

/// Counters of one monitoring run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    /// Update stream reader counters.
    pub reader: ReaderStats,
    /// Store consumer counters.
    pub consumer: ConsumerStats,
    /// Fleet stats once the stream is drained.
    pub fleet: KpiStats,
}

/// Drives an update stream into the application state.
pub struct Monitor {
    state: SharedState,
}

impl Monitor {
    /// Create a monitor over shared state.
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Monitor batches arriving on stdin until EOF.
    pub async fn run_stdin(&self) -> AppResult<MonitorSummary> {
        info!("Monitoring KPI updates on stdin");
        self.run(BufReader::new(tokio::io::stdin())).await
    }

    /// Monitor batches read from `reader` until EOF.
    ///
    /// Batches are parsed on this task and merged by a spawned consumer in
    /// arrival order. Each instance change is logged with the instance's new
    /// stats.
    pub async fn run<R>(&self, reader: R) -> AppResult<MonitorSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let state = &self.state;
        let weak = Arc::downgrade(state);
        let subscriptions: Vec<_> = state
            .catalog
            .instances()
            .map(|instance| {
                let weak = Weak::clone(&weak);
                state.store.subscribe(instance.id, move |n| {
                    let Some(state) = weak.upgrade() else {
                        return;
                    };
                    let stats = state.aggregator.instance_stats(n.instance_id);
                    info!(
                        instance_id = n.instance_id,
                        version = n.version,
                        fulfilled = stats.fulfilled,
                        not_fulfilled = stats.not_fulfilled,
                        total = stats.total,
                        percentage = stats.fulfillment_percentage,
                        "Instance KPI fulfillment changed"
                    );
                    for group_id in state.catalog.groups_containing(n.instance_id) {
                        if let Some(group) = state.aggregator.group_stats(*group_id) {
                            debug!(
                                group_id,
                                not_fulfilled = group.not_fulfilled,
                                percentage = group.fulfillment_percentage,
                                "Group KPI fulfillment changed"
                            );
                        }
                    }
                })
            })
            .collect();

        let (sender, receiver) = stream::channel(state.config.stream.channel_capacity);
        let consumer = tokio::spawn(stream::run_consumer(receiver, Arc::clone(&state.store)));

        // The sender is moved into the reader, so the consumer ends with it.
        let read = stream::read_batches(reader, sender, state.config.stream.max_line_bytes).await;
        let consumer_stats = consumer.await.map_err(|e| AppError::Internal {
            message: format!("update consumer failed: {}", e),
        });

        for id in subscriptions {
            state.store.unsubscribe(id);
        }

        let summary = MonitorSummary {
            reader: read?,
            consumer: consumer_stats?,
            fleet: state.aggregator.fleet_stats(),
        };
        info!(
            lines = summary.reader.lines,
            skipped = summary.reader.skipped,
            batches = summary.consumer.batches,
            changed = summary.consumer.changed_instances,
            fleet_percentage = summary.fleet.fulfillment_percentage,
            "Monitoring finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BulkLoadConfig, DatabaseConfig, LogFormat, LoggingConfig, StreamConfig,
    };
    use crate::model::Fulfillment;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;

    fn create_test_config() -> Config {
        Config {
            database: DatabaseConfig {
                path: PathBuf::from(":memory:"),
                max_connections: 1,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            stream: StreamConfig::default(),
            bulk_load: BulkLoadConfig::default(),
        }
    }

    fn create_test_bulk() -> BulkLoad {
        serde_json::from_value(json!({
            "sdInstances": [
                { "id": 1, "uid": "a", "userIdentifier": "Alpha", "confirmedByUser": true, "type": { "id": 1 } },
                { "id": 2, "uid": "b", "userIdentifier": "Bravo", "confirmedByUser": true, "type": { "id": 1 } }
            ],
            "sdInstanceGroups": [
                { "id": 10, "userIdentifier": "Hall", "sdInstanceIDs": [1, 2] }
            ],
            "kpiDefinitions": [
                { "id": 1, "userIdentifier": "Hot", "sdTypeID": 1, "sdTypeSpecification": "t",
                  "nodes": [{ "id": 1, "nodeType": "NumericGTAtom", "sdParameterID": 1,
                              "sdParameterSpecification": "temp", "numericReferenceValue": 50 }] },
                { "id": 2, "userIdentifier": "On", "sdTypeID": 1, "sdTypeSpecification": "t",
                  "nodes": [{ "id": 1, "nodeType": "BooleanEQAtom", "sdParameterID": 2,
                              "sdParameterSpecification": "on", "booleanReferenceValue": true }] }
            ],
            "kpiFulfillmentCheckResults": [
                { "kpiDefinitionID": 1, "sdInstanceID": 1, "fulfilled": true },
                { "kpiDefinitionID": 2, "sdInstanceID": 1, "fulfilled": true },
                { "kpiDefinitionID": 1, "sdInstanceID": 2, "fulfilled": false }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_app_state_seeds_from_bulk() {
        let state = AppState::new(create_test_config(), &create_test_bulk());
        assert_eq!(
            state.aggregator.fleet_stats(),
            KpiStats::from_counts(2, 1, 4)
        );

        let bravo = state.instance_report(2).unwrap();
        assert_eq!(bravo.version, 1);
        let kpis: Vec<Fulfillment> = bravo.kpis.iter().map(|k| k.fulfillment).collect();
        assert_eq!(kpis, vec![Fulfillment::Unfulfilled, Fulfillment::Unknown]);
        assert!(state.instance_report(99).is_none());
    }

    #[test]
    fn test_group_report_orders_members_by_severity() {
        let state = AppState::new(create_test_config(), &create_test_bulk());
        let hall = state.group_report(10).unwrap();
        assert_eq!(hall.stats.fulfillment_percentage, 50);
        let names: Vec<&str> = hall
            .members
            .iter()
            .map(|m| m.user_identifier.as_str())
            .collect();
        assert_eq!(names, vec!["Bravo", "Alpha"]);
        assert!(state.group_report(11).is_none());
    }

    #[test]
    fn test_fleet_report_serializes_wire_names() {
        let state = AppState::new(create_test_config(), &create_test_bulk());
        let report = serde_json::to_value(state.fleet_report()).unwrap();
        assert_eq!(report["fleet"]["fulfillmentPercentage"], 50);
        assert_eq!(report["instances"][0]["sdInstanceID"], 1);
        assert_eq!(report["instances"][0]["kpis"][0]["kpiDefinitionID"], 1);
        assert_eq!(report["groups"][0]["members"][0]["sdInstanceID"], 2);
    }

    #[tokio::test]
    async fn test_monitor_applies_stream() {
        let state = Arc::new(AppState::new(create_test_config(), &create_test_bulk()));
        let input = concat!(
            "{\"kpiFulfillmentCheckResults\":[{\"kpiDefinitionID\":1,\"sdInstanceID\":2,\"fulfilled\":true}]}\n",
            "not json\n",
            "{\"data\":{\"onKPIFulfillmentChecked\":{\"kpiFulfillmentCheckResults\":[",
            "{\"kpiDefinitionID\":2,\"sdInstanceID\":2,\"fulfilled\":true}]}}}\n",
        );

        let summary = Monitor::new(Arc::clone(&state))
            .run(input.as_bytes())
            .await
            .unwrap();

        assert_eq!(summary.reader.batches, 2);
        assert_eq!(summary.reader.skipped, 1);
        assert_eq!(summary.consumer.changed_instances, 2);
        assert_eq!(summary.fleet, KpiStats::from_counts(4, 0, 4));
        assert_eq!(state.store.version(2), 3);
        assert_eq!(state.store.listener_count(2), 1);
    }
}
