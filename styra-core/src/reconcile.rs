//! Generic collection reconciliation
//!
//! One diff algorithm serves every managed collection (users, roles, claims,
//! API keys, reverse-proxy routes): callers supply an identity-key extractor
//! and a payload-equality predicate, and get back an immutable [`Plan`] that
//! partitions the inputs into create/update/delete/keep. Application order is
//! deletes, then creates, then updates, so recreating an item under a reused
//! identity (a `host:port` route, for instance) never collides with the item
//! it replaces.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{StyraError, StyraResult};

/// A matched desired/observed pair
#[derive(Debug, Clone)]
pub struct Pair<T> {
    pub desired: T,
    pub observed: T,
}

/// The computed difference between a desired and an observed collection
///
/// A plan is a value: applying it never mutates the inputs it was computed
/// from. Every partition is sorted by identity key, so a fixed input pair
/// produces the same plan regardless of slice ordering.
#[derive(Debug, Clone)]
pub struct Plan<T> {
    pub create: Vec<T>,
    pub update: Vec<Pair<T>>,
    pub delete: Vec<T>,
    /// Matched and unchanged; carried so callers can copy remote identity
    /// from the observed item into their persisted state.
    pub keep: Vec<Pair<T>>,
    clear_all: bool,
}

impl<T> Plan<T> {
    /// True when no remote call is needed to converge
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    /// True when the desired collection was empty, i.e. the plan removes
    /// everything observed
    pub fn clears_all(&self) -> bool {
        self.clear_all
    }

    pub fn change_count(&self) -> usize {
        self.create.len() + self.update.len() + self.delete.len()
    }
}

/// Compute the plan converging `observed` towards `desired`.
///
/// Matching is by identity key only (case-sensitive). Items present in both
/// collections are scheduled for update only when `payload_eq` reports a
/// difference. An empty `desired` schedules every observed item for deletion.
pub fn plan<T, K, KF, EF>(desired: &[T], observed: &[T], key_of: KF, payload_eq: EF) -> Plan<T>
where
    T: Clone,
    K: Ord,
    KF: Fn(&T) -> K,
    EF: Fn(&T, &T) -> bool,
{
    // BTreeMap keeps every partition key-sorted, which is what makes the
    // plan deterministic for unordered inputs. A duplicated key within one
    // input keeps the last occurrence, matching remote list semantics where
    // identity is unique.
    let desired_by_key: BTreeMap<K, &T> = desired.iter().map(|d| (key_of(d), d)).collect();
    let observed_by_key: BTreeMap<K, &T> = observed.iter().map(|o| (key_of(o), o)).collect();

    let mut result = Plan {
        create: Vec::new(),
        update: Vec::new(),
        delete: Vec::new(),
        keep: Vec::new(),
        clear_all: desired.is_empty(),
    };

    for (key, observed_item) in &observed_by_key {
        if !desired_by_key.contains_key(key) {
            result.delete.push((*observed_item).clone());
        }
    }

    for (key, desired_item) in &desired_by_key {
        match observed_by_key.get(key) {
            None => result.create.push((*desired_item).clone()),
            Some(observed_item) => {
                let pair = Pair {
                    desired: (*desired_item).clone(),
                    observed: (*observed_item).clone(),
                };
                if payload_eq(desired_item, observed_item) {
                    result.keep.push(pair);
                } else {
                    result.update.push(pair);
                }
            }
        }
    }

    result
}

/// Per-item operations a resource front end supplies to apply a plan
#[async_trait]
pub trait PlanApplier<T: Send + Sync>: Send + Sync {
    /// Create the item remotely; returns the item with remote identity filled in
    async fn create(&self, item: &T) -> StyraResult<T>;

    /// Update the observed item to match the desired payload
    async fn update(&self, desired: &T, observed: &T) -> StyraResult<T>;

    async fn delete(&self, item: &T) -> StyraResult<()>;

    /// Copy remote identity from a matched, unchanged observed item into the
    /// desired one so callers can persist it
    fn adopt(&self, desired: &T, observed: &T) -> T;
}

/// Apply a plan sequentially: deletes, then creates, then updates.
///
/// Per-item failures are collected and reported together once the whole plan
/// has been attempted. The one exception is a clear-all plan (desired was
/// empty), where the first delete failure aborts immediately.
///
/// Returns the converged collection: created, updated and kept items with
/// their remote identity populated.
pub async fn apply_plan<T, A>(operation: &str, plan: &Plan<T>, applier: &A) -> StyraResult<Vec<T>>
where
    T: Clone + Send + Sync,
    A: PlanApplier<T> + ?Sized,
{
    let mut errors: Vec<StyraError> = Vec::new();
    let mut converged: Vec<T> = Vec::new();

    debug!(
        "{}: applying plan ({} delete, {} create, {} update, {} unchanged)",
        operation,
        plan.delete.len(),
        plan.create.len(),
        plan.update.len(),
        plan.keep.len()
    );

    for item in &plan.delete {
        if let Err(e) = applier.delete(item).await {
            if plan.clear_all {
                return Err(e);
            }
            warn!("{}: delete failed, continuing with plan: {}", operation, e);
            errors.push(e);
        }
    }

    for item in &plan.create {
        match applier.create(item).await {
            Ok(created) => converged.push(created),
            Err(e) => {
                warn!("{}: create failed, continuing with plan: {}", operation, e);
                errors.push(e);
            }
        }
    }

    for pair in &plan.update {
        match applier.update(&pair.desired, &pair.observed).await {
            Ok(updated) => converged.push(updated),
            Err(e) => {
                warn!("{}: update failed, continuing with plan: {}", operation, e);
                errors.push(e);
            }
        }
    }

    for pair in &plan.keep {
        converged.push(applier.adopt(&pair.desired, &pair.observed));
    }

    if errors.is_empty() {
        Ok(converged)
    } else {
        Err(StyraError::Aggregate {
            operation: operation.to_string(),
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProxyRoute;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: String,
        id: Option<String>,
        payload: String,
    }

    fn item(name: &str, payload: &str) -> Item {
        Item {
            name: name.to_string(),
            id: None,
            payload: payload.to_string(),
        }
    }

    fn observed_item(name: &str, payload: &str) -> Item {
        Item {
            name: name.to_string(),
            id: Some(format!("id-{}", name)),
            payload: payload.to_string(),
        }
    }

    fn plan_items(desired: &[Item], observed: &[Item]) -> Plan<Item> {
        plan(
            desired,
            observed,
            |i| i.name.clone(),
            |a, b| a.payload == b.payload,
        )
    }

    fn names(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn partitions_roles_scenario() {
        let desired = vec![item("admin", ""), item("dev", "")];
        let observed = vec![observed_item("dev", ""), observed_item("ops", "")];

        let plan = plan_items(&desired, &observed);

        assert_eq!(names(&plan.create), vec!["admin"]);
        assert_eq!(names(&plan.delete), vec!["ops"]);
        assert!(plan.update.is_empty());
        assert_eq!(plan.keep.len(), 1);
        assert_eq!(plan.keep[0].desired.name, "dev");
        assert_eq!(plan.keep[0].observed.id.as_deref(), Some("id-dev"));
        assert!(!plan.clears_all());
    }

    #[test]
    fn payload_difference_becomes_update() {
        let desired = vec![item("alice", "editor")];
        let observed = vec![observed_item("alice", "viewer")];

        let plan = plan_items(&desired, &observed);

        assert!(plan.create.is_empty());
        assert!(plan.delete.is_empty());
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].observed.payload, "viewer");
    }

    #[test]
    fn empty_desired_clears_everything() {
        let observed = vec![observed_item("a", ""), observed_item("b", "")];

        let plan = plan_items(&[], &observed);

        assert_eq!(names(&plan.delete), vec!["a", "b"]);
        assert!(plan.create.is_empty());
        assert!(plan.clears_all());
    }

    #[test]
    fn plan_is_deterministic_regardless_of_input_order() {
        let desired_a = vec![item("x", "1"), item("a", "1"), item("m", "1")];
        let mut desired_b = desired_a.clone();
        desired_b.reverse();
        let observed_a = vec![observed_item("m", "2"), observed_item("z", "1")];
        let mut observed_b = observed_a.clone();
        observed_b.reverse();

        let p1 = plan_items(&desired_a, &observed_a);
        let p2 = plan_items(&desired_b, &observed_b);

        assert_eq!(names(&p1.create), names(&p2.create));
        assert_eq!(names(&p1.delete), names(&p2.delete));
        assert_eq!(
            p1.update.iter().map(|p| &p.desired.name).collect::<Vec<_>>(),
            p2.update.iter().map(|p| &p.desired.name).collect::<Vec<_>>()
        );
    }

    #[test]
    fn proxy_route_with_empty_host_plans_wildcard_create() {
        let desired = vec![ProxyRoute {
            id: None,
            host: String::new(),
            port: "8080".to_string(),
            target_host: "10.211.55.3".to_string(),
            target_port: "80".to_string(),
        }];
        let observed: Vec<ProxyRoute> = vec![];

        let plan = plan(&desired, &observed, ProxyRoute::key, ProxyRoute::same_target);

        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].key(), "0.0.0.0:8080");
    }

    #[test]
    fn replanning_after_apply_is_empty() {
        let desired = vec![item("admin", ""), item("dev", "")];
        let observed = vec![observed_item("dev", ""), observed_item("ops", "")];

        let first = plan_items(&desired, &observed);

        // Simulate applying the plan: observed becomes created + updated + kept.
        let mut applied: Vec<Item> = first.create.clone();
        applied.extend(first.update.iter().map(|p| p.desired.clone()));
        applied.extend(first.keep.iter().map(|p| p.observed.clone()));

        let second = plan_items(&desired, &applied);
        assert!(second.is_empty());
    }

    proptest! {
        /// Every key in desired∪observed lands in exactly one partition.
        #[test]
        fn plan_partitions_every_key_exactly_once(
            desired_names in proptest::collection::btree_set("[a-d]{1,2}", 0..6),
            observed_names in proptest::collection::btree_set("[a-d]{1,2}", 0..6),
            changed in proptest::collection::btree_set("[a-d]{1,2}", 0..6),
        ) {
            let desired: Vec<Item> = desired_names.iter().map(|n| item(n, "v2")).collect();
            let observed: Vec<Item> = observed_names
                .iter()
                .map(|n| {
                    let payload = if changed.contains(n) { "v1" } else { "v2" };
                    observed_item(n, payload)
                })
                .collect();

            let plan = plan_items(&desired, &observed);

            let mut seen = BTreeSet::new();
            for i in &plan.create {
                prop_assert!(seen.insert(i.name.clone()));
            }
            for i in &plan.delete {
                prop_assert!(seen.insert(i.name.clone()));
            }
            for p in &plan.update {
                prop_assert!(seen.insert(p.desired.name.clone()));
            }
            for p in &plan.keep {
                prop_assert!(seen.insert(p.desired.name.clone()));
            }

            let union: BTreeSet<String> = desired_names.union(&observed_names).cloned().collect();
            prop_assert_eq!(seen, union);
        }
    }

    // --- apply_plan behavior ---

    struct RecordingApplier {
        fail_deletes: BTreeSet<String>,
        fail_creates: BTreeSet<String>,
        log: Mutex<Vec<String>>,
    }

    impl RecordingApplier {
        fn new() -> Self {
            Self {
                fail_deletes: BTreeSet::new(),
                fail_creates: BTreeSet::new(),
                log: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlanApplier<Item> for RecordingApplier {
        async fn create(&self, item: &Item) -> StyraResult<Item> {
            self.log.lock().unwrap().push(format!("create:{}", item.name));
            if self.fail_creates.contains(&item.name) {
                return Err(StyraError::Api {
                    operation: "create".to_string(),
                    details: format!("create {} refused", item.name),
                });
            }
            let mut created = item.clone();
            created.id = Some(format!("id-{}", item.name));
            Ok(created)
        }

        async fn update(&self, desired: &Item, observed: &Item) -> StyraResult<Item> {
            self.log
                .lock()
                .unwrap()
                .push(format!("update:{}", desired.name));
            let mut updated = desired.clone();
            updated.id = observed.id.clone();
            Ok(updated)
        }

        async fn delete(&self, item: &Item) -> StyraResult<()> {
            self.log.lock().unwrap().push(format!("delete:{}", item.name));
            if self.fail_deletes.contains(&item.name) {
                return Err(StyraError::Api {
                    operation: "delete".to_string(),
                    details: format!("delete {} refused", item.name),
                });
            }
            Ok(())
        }

        fn adopt(&self, desired: &Item, observed: &Item) -> Item {
            let mut adopted = desired.clone();
            adopted.id = observed.id.clone();
            adopted
        }
    }

    #[tokio::test]
    async fn applies_deletes_before_creates_before_updates() {
        let desired = vec![item("new", "1"), item("mod", "2")];
        let observed = vec![observed_item("mod", "1"), observed_item("gone", "1")];
        let plan = plan_items(&desired, &observed);

        let applier = RecordingApplier::new();
        let converged = apply_plan("test", &plan, &applier).await.unwrap();

        assert_eq!(
            applier.calls(),
            vec!["delete:gone", "create:new", "update:mod"]
        );
        // Converged set carries remote identity for every surviving item.
        assert!(converged.iter().all(|i| i.id.is_some()));
    }

    #[tokio::test]
    async fn delete_failure_in_mixed_plan_is_collected_not_fatal_midway() {
        let desired = vec![item("new", "1")];
        let observed = vec![observed_item("bad", "1"), observed_item("worse", "1")];
        let plan = plan_items(&desired, &observed);

        let mut applier = RecordingApplier::new();
        applier.fail_deletes.insert("bad".to_string());

        let err = apply_plan("test", &plan, &applier).await.unwrap_err();

        // Both deletes and the create were still attempted.
        assert_eq!(
            applier.calls(),
            vec!["delete:bad", "delete:worse", "create:new"]
        );
        match err {
            StyraError::Aggregate { errors, .. } => assert_eq!(errors.len(), 1),
            other => panic!("expected aggregate error, got {other}"),
        }
    }

    #[tokio::test]
    async fn clear_all_plan_aborts_on_first_delete_failure() {
        let observed = vec![observed_item("a", "1"), observed_item("b", "1")];
        let plan = plan_items(&[], &observed);

        let mut applier = RecordingApplier::new();
        applier.fail_deletes.insert("a".to_string());

        let err = apply_plan("test", &plan, &applier).await.unwrap_err();

        // Clear-all stops at the first failed delete; "b" is never attempted.
        assert_eq!(applier.calls(), vec!["delete:a"]);
        assert!(matches!(err, StyraError::Api { .. }));
    }

    #[tokio::test]
    async fn create_failures_do_not_block_other_creates() {
        let desired = vec![item("a", "1"), item("b", "1"), item("c", "1")];
        let plan = plan_items(&desired, &[]);

        let mut applier = RecordingApplier::new();
        applier.fail_creates.insert("b".to_string());

        let err = apply_plan("test", &plan, &applier).await.unwrap_err();

        assert_eq!(applier.calls(), vec!["create:a", "create:b", "create:c"]);
        match err {
            StyraError::Aggregate { errors, .. } => assert_eq!(errors.len(), 1),
            other => panic!("expected aggregate error, got {other}"),
        }
    }
}
