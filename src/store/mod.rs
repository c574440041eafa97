//! Fulfillment store: the merged, versioned view of KPI check results.
//!
//! The store keeps one ordered entry list per device instance, merges the
//! initial bulk results with incremental batches, and notifies listeners
//! registered for an instance whenever that instance's list actually changes.
//!
//! Writes are serialized behind a `RwLock`. Listeners run after the lock has
//! been released, so they may read from the store (or anything built on it)
//! without deadlocking.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::catalog::Catalog;
use crate::error::KpiError;
use crate::model::{Fulfillment, FulfillmentCheckResult};


/// Current fulfillment of one KPI definition for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiEntry {
    /// KPI definition id.
    #[serde(rename = "kpiDefinitionID")]
    pub kpi_definition_id: u32,
    /// Display name of the definition.
    pub user_identifier: String,
    /// Current tri-state result.
    pub fulfillment: Fulfillment,
}

impl KpiEntry {
    /// Display ordering: failures first, then unknown, then fulfilled; ties
    /// by display name, then by definition id.
    pub fn display_order(a: &KpiEntry, b: &KpiEntry) -> Ordering {
        a.fulfillment
            .rank()
            .cmp(&b.fulfillment.rank())
            .then_with(|| a.user_identifier.cmp(&b.user_identifier))
            .then_with(|| a.kpi_definition_id.cmp(&b.kpi_definition_id))
    }
}

/// Notification delivered to listeners of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Instance whose entry list changed.
    pub instance_id: u32,
    /// Version of the instance after the change.
    pub version: u64,
    /// When the change was merged.
    pub changed_at: DateTime<Utc>,
}

/// Change listener.
pub type Listener = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

/// Handle returned by [`FulfillmentStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
struct InstanceRecord {
    version: u64,
    entries: Vec<KpiEntry>,
    updated_at: DateTime<Utc>,
}

struct Subscription {
    id: SubscriptionId,
    listener: Listener,
}

/// Process-wide cache of `(instance, KPI definition) -> tri-state`.
pub struct FulfillmentStore {
    catalog: Arc<Catalog>,
    records: RwLock<HashMap<u32, InstanceRecord>>,
    listeners: RwLock<HashMap<u32, Vec<Subscription>>>,
    next_subscription: AtomicU64,
}

impl FulfillmentStore {
    /// Create an empty store resolving definitions and instances in `catalog`.
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            records: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Catalog the store resolves against.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Load the initial result set.
    ///
    /// Every applicable definition of every known instance starts out as
    /// Unknown, then the given results are overlaid in order. Any previous
    /// state is replaced. Returns the ids of instances whose lists changed.
    pub fn ingest_initial(&self, results: &[FulfillmentCheckResult]) -> Vec<u32> {
        let mut lists: BTreeMap<u32, Vec<KpiEntry>> = BTreeMap::new();
        for instance in self.catalog.instances() {
            let seeded: Vec<KpiEntry> = self
                .catalog
                .applicable_definitions(instance.id)
                .iter()
                .filter_map(|id| self.catalog.definition(*id))
                .map(|d| KpiEntry {
                    kpi_definition_id: d.id,
                    user_identifier: d.user_identifier().to_string(),
                    fulfillment: Fulfillment::Unknown,
                })
                .collect();
            if !seeded.is_empty() {
                lists.insert(instance.id, seeded);
            }
        }

        for result in results {
            if let Some(entry) = self.resolve(result) {
                merge_entry(lists.entry(result.sd_instance_id).or_default(), entry);
            }
        }

        let now = Utc::now();
        let mut notifications = Vec::new();
        {
            let mut records = write_lock(&self.records);
            let mut previous = std::mem::take(&mut *records);

            for (instance_id, mut entries) in lists {
                entries.sort_by(KpiEntry::display_order);
                let record = match previous.remove(&instance_id) {
                    Some(old) if old.entries == entries => old,
                    Some(old) => {
                        notifications.push(notification(instance_id, old.version + 1, now));
                        InstanceRecord {
                            version: old.version + 1,
                            entries,
                            updated_at: now,
                        }
                    }
                    None => {
                        notifications.push(notification(instance_id, 1, now));
                        InstanceRecord {
                            version: 1,
                            entries,
                            updated_at: now,
                        }
                    }
                };
                records.insert(instance_id, record);
            }

            // Instances that dropped out keep their version history with an
            // empty list.
            for (instance_id, old) in previous {
                if old.entries.is_empty() {
                    records.insert(instance_id, old);
                    continue;
                }
                notifications.push(notification(instance_id, old.version + 1, now));
                records.insert(
                    instance_id,
                    InstanceRecord {
                        version: old.version + 1,
                        entries: Vec::new(),
                        updated_at: now,
                    },
                );
            }
        }

        debug!(
            results = results.len(),
            changed = notifications.len(),
            "Initial results ingested"
        );
        self.notify(&notifications)
    }

    /// Merge one incremental batch.
    ///
    /// Results are grouped by instance and applied in arrival order, so the
    /// last result for a `(definition, instance)` pair wins. An instance only
    /// counts as changed (version bump plus notification) when its final list
    /// differs from the one before the batch. Returns the changed instance ids.
    pub fn ingest_update(&self, batch: &[FulfillmentCheckResult]) -> Vec<u32> {
        let mut by_instance: BTreeMap<u32, Vec<KpiEntry>> = BTreeMap::new();
        for result in batch {
            if let Some(entry) = self.resolve(result) {
                by_instance
                    .entry(result.sd_instance_id)
                    .or_default()
                    .push(entry);
            }
        }

        let now = Utc::now();
        let mut notifications = Vec::new();
        {
            let mut records = write_lock(&self.records);
            for (instance_id, updates) in by_instance {
                let record = records.entry(instance_id).or_insert_with(|| InstanceRecord {
                    version: 0,
                    entries: Vec::new(),
                    updated_at: now,
                });

                let mut entries = record.entries.clone();
                for entry in updates {
                    merge_entry(&mut entries, entry);
                }
                entries.sort_by(KpiEntry::display_order);

                if entries != record.entries {
                    record.version += 1;
                    record.entries = entries;
                    record.updated_at = now;
                    notifications.push(notification(instance_id, record.version, now));
                } else {
                    trace!(instance_id, "Batch left instance unchanged");
                }
            }
        }

        debug!(
            results = batch.len(),
            changed = notifications.len(),
            "Update batch ingested"
        );
        self.notify(&notifications)
    }

    /// Resolve a raw result into an entry, or drop it.
    fn resolve(&self, result: &FulfillmentCheckResult) -> Option<KpiEntry> {
        let Some(definition) = self.catalog.definition(result.kpi_definition_id) else {
            let e = KpiError::UnknownReference {
                entity: "KPI definition",
                id: result.kpi_definition_id,
            };
            warn!(
                sd_instance_id = result.sd_instance_id,
                error = %e,
                "Dropping fulfillment result"
            );
            return None;
        };
        let Some(instance) = self.catalog.instance(result.sd_instance_id) else {
            let e = KpiError::UnknownReference {
                entity: "SD instance",
                id: result.sd_instance_id,
            };
            warn!(
                kpi_definition_id = result.kpi_definition_id,
                error = %e,
                "Dropping fulfillment result"
            );
            return None;
        };
        if !self
            .catalog
            .is_applicable(result.kpi_definition_id, result.sd_instance_id)
        {
            debug!(
                kpi_definition_id = result.kpi_definition_id,
                sd_instance_id = result.sd_instance_id,
                "Dropping result for non-applicable pair"
            );
            return None;
        }

        let fulfillment = if instance.confirmed_by_user {
            result.fulfillment()
        } else {
            Fulfillment::Unknown
        };
        Some(KpiEntry {
            kpi_definition_id: definition.id,
            user_identifier: definition.user_identifier().to_string(),
            fulfillment,
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current ordered entries of an instance; empty if never ingested.
    pub fn get(&self, instance_id: u32) -> Vec<KpiEntry> {
        read_lock(&self.records)
            .get(&instance_id)
            .map(|r| r.entries.clone())
            .unwrap_or_default()
    }

    /// Version of an instance's list; `0` if never ingested.
    pub fn version(&self, instance_id: u32) -> u64 {
        read_lock(&self.records)
            .get(&instance_id)
            .map(|r| r.version)
            .unwrap_or(0)
    }

    /// Time of the last change of an instance's list.
    pub fn updated_at(&self, instance_id: u32) -> Option<DateTime<Utc>> {
        read_lock(&self.records)
            .get(&instance_id)
            .map(|r| r.updated_at)
    }

    /// Number of fulfilled KPIs of an instance.
    pub fn fulfilled(&self, instance_id: u32) -> usize {
        self.count(instance_id, Fulfillment::Fulfilled)
    }

    /// Number of unfulfilled KPIs of an instance.
    pub fn not_fulfilled(&self, instance_id: u32) -> usize {
        self.count(instance_id, Fulfillment::Unfulfilled)
    }

    fn count(&self, instance_id: u32, fulfillment: Fulfillment) -> usize {
        read_lock(&self.records)
            .get(&instance_id)
            .map(|r| {
                r.entries
                    .iter()
                    .filter(|e| e.fulfillment == fulfillment)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Ids of all instances with a record, ascending.
    pub fn instance_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = read_lock(&self.records).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Register `listener` for changes of one instance.
    pub fn subscribe<F>(&self, instance_id: u32, listener: F) -> SubscriptionId
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, AtomicOrdering::Relaxed));
        write_lock(&self.listeners)
            .entry(instance_id)
            .or_default()
            .push(Subscription {
                id,
                listener: Arc::new(listener),
            });
        trace!(instance_id, subscription = id.0, "Listener subscribed");
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = write_lock(&self.listeners);
        let mut removed = false;
        listeners.retain(|_, subscriptions| {
            let before = subscriptions.len();
            subscriptions.retain(|s| s.id != id);
            removed |= subscriptions.len() != before;
            !subscriptions.is_empty()
        });
        removed
    }

    /// Number of listeners registered for an instance.
    pub fn listener_count(&self, instance_id: u32) -> usize {
        read_lock(&self.listeners)
            .get(&instance_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn notify(&self, notifications: &[ChangeNotification]) -> Vec<u32> {
        for n in notifications {
            // Clone the handles out so listeners may (un)subscribe re-entrantly.
            let listeners: Vec<Listener> = read_lock(&self.listeners)
                .get(&n.instance_id)
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.listener)).collect())
                .unwrap_or_default();
            for listener in listeners {
                listener(n);
            }
        }
        notifications.iter().map(|n| n.instance_id).collect()
    }
}

fn notification(instance_id: u32, version: u64, changed_at: DateTime<Utc>) -> ChangeNotification {
    ChangeNotification {
        instance_id,
        version,
        changed_at,
    }
}

/// Update the entry for the same definition in place, or append.
fn merge_entry(entries: &mut Vec<KpiEntry>, entry: KpiEntry) {
    match entries
        .iter_mut()
        .find(|e| e.kpi_definition_id == entry.kpi_definition_id)
    {
        Some(existing) => existing.fulfillment = entry.fulfillment,
        None => entries.push(entry),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
