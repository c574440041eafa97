//! Per-instance, per-group and fleet KPI statistics.
//!
//! The [`Aggregator`] subscribes to every catalog instance in the store.
//! Notifications only mark an instance dirty; the next read folds dirty
//! instances into the cached totals by subtracting each one's previous
//! contribution and adding the new one, touching exactly the groups that
//! contain it.

use std::collections::{BTreeSet, HashMap};
use std::ops::{AddAssign, SubAssign};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::catalog::Catalog;
use crate::model::Fulfillment;
use crate::store::{FulfillmentStore, KpiEntry, SubscriptionId};

/// Fulfillment statistics of an instance, a group or the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiStats {
    /// KPIs currently fulfilled.
    pub fulfilled: usize,
    /// KPIs currently not fulfilled.
    pub not_fulfilled: usize,
    /// Applicable KPIs, Unknown included.
    pub total: usize,
    /// `round(fulfilled / total * 100)`, `0` when `total` is `0`.
    pub fulfillment_percentage: u32,
}

impl KpiStats {
    /// Stats from raw counts.
    pub fn from_counts(fulfilled: usize, not_fulfilled: usize, total: usize) -> Self {
        Self {
            fulfilled,
            not_fulfilled,
            total,
            fulfillment_percentage: percentage(fulfilled, total),
        }
    }

    /// Stats of one instance's entry list.
    pub fn from_entries(entries: &[KpiEntry]) -> Self {
        let mut counts = Counts::default();
        for entry in entries {
            counts.add(entry.fulfillment);
        }
        counts.stats()
    }

    /// KPIs whose state is Unknown.
    pub fn unknown(&self) -> usize {
        self.total
            .saturating_sub(self.fulfilled)
            .saturating_sub(self.not_fulfilled)
    }
}

/// Integer percentage rounded half up.
fn percentage(fulfilled: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((fulfilled * 200 + total) / (2 * total)) as u32
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counts {
    fulfilled: usize,
    not_fulfilled: usize,
    total: usize,
}

impl Counts {
    fn add(&mut self, fulfillment: Fulfillment) {
        self.total += 1;
        match fulfillment {
            Fulfillment::Fulfilled => self.fulfilled += 1,
            Fulfillment::Unfulfilled => self.not_fulfilled += 1,
            Fulfillment::Unknown => {}
        }
    }

    fn stats(&self) -> KpiStats {
        KpiStats::from_counts(self.fulfilled, self.not_fulfilled, self.total)
    }
}

impl From<KpiStats> for Counts {
    fn from(stats: KpiStats) -> Self {
        Self {
            fulfilled: stats.fulfilled,
            not_fulfilled: stats.not_fulfilled,
            total: stats.total,
        }
    }
}

impl AddAssign for Counts {
    fn add_assign(&mut self, other: Self) {
        self.fulfilled += other.fulfilled;
        self.not_fulfilled += other.not_fulfilled;
        self.total += other.total;
    }
}

impl SubAssign for Counts {
    fn sub_assign(&mut self, other: Self) {
        self.fulfilled -= other.fulfilled;
        self.not_fulfilled -= other.not_fulfilled;
        self.total -= other.total;
    }
}

/// Stats of one group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStats {
    /// Instance id.
    #[serde(rename = "sdInstanceID")]
    pub sd_instance_id: u32,
    /// Instance display name.
    pub user_identifier: String,
    /// Current stats of the instance.
    pub stats: KpiStats,
}

#[derive(Debug, Default)]
struct GroupTotals {
    counts: Counts,
    revision: u64,
}

#[derive(Debug, Default)]
struct Totals {
    members: HashMap<u32, Counts>,
    groups: HashMap<u32, GroupTotals>,
    fleet: Counts,
}

/// Incrementally maintained KPI statistics over a store.
pub struct Aggregator {
    store: Arc<FulfillmentStore>,
    catalog: Arc<Catalog>,
    dirty: Arc<Mutex<BTreeSet<u32>>>,
    totals: RwLock<Totals>,
    subscriptions: Vec<SubscriptionId>,
}

impl Aggregator {
    /// Create an aggregator and subscribe it to every catalog instance.
    pub fn new(store: Arc<FulfillmentStore>) -> Self {
        let catalog = Arc::clone(store.catalog());
        let dirty = Arc::new(Mutex::new(BTreeSet::new()));

        // Subscribe before the first fold so no change can slip in between.
        let mut subscriptions = Vec::new();
        for instance in catalog.instances() {
            let sink = Arc::clone(&dirty);
            subscriptions.push(store.subscribe(instance.id, move |n| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(n.instance_id);
            }));
        }

        let mut totals = Totals::default();
        for group in catalog.groups() {
            totals.groups.insert(group.id, GroupTotals::default());
        }
        for instance in catalog.instances() {
            let counts = Counts::from(KpiStats::from_entries(&store.get(instance.id)));
            totals.members.insert(instance.id, counts);
            totals.fleet += counts;
            for group_id in catalog.groups_containing(instance.id) {
                if let Some(group) = totals.groups.get_mut(group_id) {
                    group.counts += counts;
                }
            }
        }
        debug!(
            instances = totals.members.len(),
            groups = totals.groups.len(),
            "Aggregator initialized"
        );

        Self {
            store,
            catalog,
            dirty,
            totals: RwLock::new(totals),
            subscriptions,
        }
    }

    /// Fold pending instance changes into the cached totals.
    fn refresh(&self) {
        let pending = {
            let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *dirty)
        };
        if pending.is_empty() {
            return;
        }

        let mut totals = self.totals.write().unwrap_or_else(PoisonError::into_inner);
        for instance_id in pending {
            let new = Counts::from(KpiStats::from_entries(&self.store.get(instance_id)));
            let old = totals.members.insert(instance_id, new).unwrap_or_default();
            if old == new {
                continue;
            }
            totals.fleet -= old;
            totals.fleet += new;
            for group_id in self.catalog.groups_containing(instance_id) {
                if let Some(group) = totals.groups.get_mut(group_id) {
                    group.counts -= old;
                    group.counts += new;
                    group.revision += 1;
                    trace!(group_id, instance_id, "Group totals adjusted");
                }
            }
        }
    }

    /// Stats of one instance; all zero for instances without KPIs.
    pub fn instance_stats(&self, instance_id: u32) -> KpiStats {
        self.refresh();
        self.totals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .get(&instance_id)
            .map(Counts::stats)
            .unwrap_or_default()
    }

    /// Stats of one group: the sum over its members. `None` for unknown groups.
    pub fn group_stats(&self, group_id: u32) -> Option<KpiStats> {
        self.refresh();
        self.totals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .groups
            .get(&group_id)
            .map(|g| g.counts.stats())
    }

    /// Stats over every catalog instance.
    pub fn fleet_stats(&self) -> KpiStats {
        self.refresh();
        self.totals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .fleet
            .stats()
    }

    /// Members of a group, most failures first, ties by display name.
    pub fn group_members_by_severity(&self, group_id: u32) -> Option<Vec<MemberStats>> {
        let group = self.catalog.group(group_id)?;
        let mut members: Vec<MemberStats> = group
            .sd_instance_ids
            .iter()
            .map(|id| MemberStats {
                sd_instance_id: *id,
                user_identifier: self
                    .catalog
                    .instance(*id)
                    .map(|i| i.user_identifier.clone())
                    .unwrap_or_default(),
                stats: self.instance_stats(*id),
            })
            .collect();
        members.sort_by(|a, b| {
            b.stats
                .not_fulfilled
                .cmp(&a.stats.not_fulfilled)
                .then_with(|| a.user_identifier.cmp(&b.user_identifier))
                .then_with(|| a.sd_instance_id.cmp(&b.sd_instance_id))
        });
        Some(members)
    }

    /// How many times a group's totals were adjusted since creation.
    pub fn group_revision(&self, group_id: u32) -> u64 {
        self.refresh();
        self.totals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .groups
            .get(&group_id)
            .map(|g| g.revision)
            .unwrap_or(0)
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.store.unsubscribe(id);
        }
    }
}
