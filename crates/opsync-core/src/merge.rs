//! Field-level, order-independent conflict resolution.
//!
//! Entity state is the fold of every verified event for its key, applied in
//! `(physical, logical, device_id, op_id)` order rather than arrival order,
//! so replicas holding the same events converge.
//!
//! # Field rules
//!
//! | Rule | Resolution |
//! |------|------------|
//! | `LastWriterWins` | value from the latest event |
//! | `MaxWins` | numeric maximum across all writes, regardless of age |
//! | `Union` | entries de-duplicated by `op_id`, ordered by `timestamp`, newest N kept |
//!
//! A `delete` event resets the entity; later writes start from empty.

use crate::event::{EntityKey, Event, Op};
use crate::hlc::Timestamp;
use crate::payload::CONSCIOUSNESS_STATE;
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::AddAssign;
use tracing::debug;
use uuid::Uuid;

/// Default number of entries kept by union fields.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// How concurrent writes to one field are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// Latest write by HLC wins
    LastWriterWins,
    /// Largest numeric value wins
    MaxWins,
    /// Arrays are merged by entry `op_id` and truncated to the newest `limit`
    Union {
        /// Entries kept after merging
        limit: usize,
    },
}

/// Field rules for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    default: FieldRule,
    fields: HashMap<String, FieldRule>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::lww()
    }
}

impl MergePolicy {
    /// Every field is last-writer-wins.
    #[must_use]
    pub fn lww() -> Self {
        Self {
            default: FieldRule::LastWriterWins,
            fields: HashMap::new(),
        }
    }

    /// Set the rule for one field.
    #[must_use]
    pub fn with_rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(field.into(), rule);
        self
    }

    /// Rule applied to a field.
    #[must_use]
    pub fn rule_for(&self, field: &str) -> FieldRule {
        self.fields.get(field).copied().unwrap_or(self.default)
    }

    /// Rules for the consciousness state record.
    #[must_use]
    pub fn consciousness(history_limit: usize) -> Self {
        Self::lww()
            .with_rule("canonical_memories_loaded", FieldRule::MaxWins)
            .with_rule("total_memories", FieldRule::MaxWins)
            .with_rule("decision_log", FieldRule::Union { limit: history_limit })
    }
}

/// Merge policies keyed by entity type.
#[derive(Debug, Clone, Default)]
pub struct MergePolicies {
    by_type: HashMap<String, MergePolicy>,
    fallback: MergePolicy,
}

impl MergePolicies {
    /// Built-in policies: consciousness state gets field rules, the rest LWW.
    #[must_use]
    pub fn builtin(history_limit: usize) -> Self {
        Self::default().with_policy(CONSCIOUSNESS_STATE, MergePolicy::consciousness(history_limit))
    }

    /// Register a policy for an entity type.
    #[must_use]
    pub fn with_policy(mut self, entity_type: impl Into<String>, policy: MergePolicy) -> Self {
        self.by_type.insert(entity_type.into(), policy);
        self
    }

    /// Policy for an entity type.
    #[must_use]
    pub fn for_type(&self, entity_type: &str) -> &MergePolicy {
        self.by_type.get(entity_type).unwrap_or(&self.fallback)
    }
}

/// Count of field disagreements resolved, per rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// Overwritten by a later writer
    pub lww: u64,
    /// Lower value discarded by max-wins
    pub max_wins: u64,
    /// Arrays merged by union
    pub union: u64,
    /// Entity reset by a delete
    pub tombstones: u64,
}

impl MergeStats {
    /// Total resolved disagreements.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.lww + self.max_wins + self.union + self.tombstones
    }
}

impl AddAssign for MergeStats {
    fn add_assign(&mut self, rhs: Self) {
        self.lww += rhs.lww;
        self.max_wins += rhs.max_wins;
        self.union += rhs.union;
        self.tombstones += rhs.tombstones;
    }
}

/// Folded state of one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityState {
    fields: Map<String, Value>,
    /// Whether the latest structural event was a delete
    pub deleted: bool,
    /// HLC of the newest folded event
    pub updated_at: Option<Timestamp>,
    /// Number of folded events
    pub event_count: usize,
    /// Disagreements resolved while folding
    pub stats: MergeStats,
}

impl EntityState {
    /// Current value: a JSON object, or `null` when deleted.
    #[must_use]
    pub fn value(&self) -> Value {
        if self.deleted {
            Value::Null
        } else {
            Value::Object(self.fields.clone())
        }
    }

    /// One field of the current value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        if self.deleted {
            None
        } else {
            self.fields.get(name)
        }
    }

    fn step(&mut self, policy: &MergePolicy, hlc: Timestamp, op: Op, payload: &Value) {
        self.event_count += 1;
        self.updated_at = Some(hlc);

        if op == Op::Delete {
            if !self.deleted || !self.fields.is_empty() {
                self.stats.tombstones += 1;
            }
            self.fields.clear();
            self.deleted = true;
            return;
        }
        self.deleted = false;

        let Value::Object(incoming) = payload else {
            return;
        };
        for (name, value) in incoming {
            let rule = policy.rule_for(name);
            match self.fields.get_mut(name) {
                None => {
                    self.fields.insert(name.clone(), initial(rule, value));
                }
                Some(current) => {
                    if let Some(resolved) = resolve(rule, current, value, &mut self.stats) {
                        *current = resolved;
                    }
                }
            }
        }
    }
}

fn initial(rule: FieldRule, value: &Value) -> Value {
    match (rule, value) {
        (FieldRule::Union { limit }, Value::Array(items)) => union(&[], items, limit),
        _ => value.clone(),
    }
}

/// New value for a field, or `None` to keep the current one.
fn resolve(rule: FieldRule, current: &Value, incoming: &Value, stats: &mut MergeStats) -> Option<Value> {
    if current == incoming {
        return None;
    }
    match (rule, current, incoming) {
        (FieldRule::MaxWins, Value::Number(_), Value::Number(_)) => {
            stats.max_wins += 1;
            (compare_numbers(incoming, current) == Ordering::Greater).then(|| incoming.clone())
        }
        (FieldRule::Union { limit }, Value::Array(have), Value::Array(add)) => {
            stats.union += 1;
            Some(union(have, add, limit))
        }
        // Mismatched shapes fall back to last-writer-wins
        _ => {
            stats.lww += 1;
            Some(incoming.clone())
        }
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    match (a.as_u64(), b.as_u64()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => {
            let x = a.as_f64().unwrap_or(f64::NEG_INFINITY);
            let y = b.as_f64().unwrap_or(f64::NEG_INFINITY);
            x.total_cmp(&y)
        }
    }
}

fn entry_id(entry: &Value) -> String {
    match entry.get("op_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => entry.to_string(),
    }
}

fn entry_time(entry: &Value) -> i64 {
    entry.get("timestamp").and_then(Value::as_i64).unwrap_or(0)
}

fn union(have: &[Value], add: &[Value], limit: usize) -> Value {
    let mut merged: BTreeMap<String, Value> = BTreeMap::new();
    for entry in have.iter().chain(add) {
        merged.entry(entry_id(entry)).or_insert_with(|| entry.clone());
    }

    let mut entries: Vec<(i64, String, Value)> = merged
        .into_iter()
        .map(|(id, entry)| (entry_time(&entry), id, entry))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let skip = entries.len().saturating_sub(limit);
    Value::Array(entries.into_iter().skip(skip).map(|(_, _, e)| e).collect())
}

/// A verified, decrypted mutation ready to fold.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Entity the mutation applies to
    pub key: EntityKey,
    /// Ordering timestamp
    pub hlc: Timestamp,
    /// Unique id; repeats are ignored
    pub op_id: Uuid,
    /// Mutation kind
    pub op: Op,
    /// Decrypted payload
    pub payload: Value,
}

impl Mutation {
    /// Pair an event with its decrypted payload.
    #[must_use]
    pub fn from_event(event: &Event, payload: Value) -> Self {
        Self {
            key: event.key(),
            hlc: event.hlc,
            op_id: event.op_id,
            op: event.op,
            payload,
        }
    }
}

#[derive(Debug, Default)]
struct Folded {
    events: BTreeMap<(Timestamp, Uuid), (Op, Value)>,
    state: EntityState,
}

/// Derived entity state for every key.
#[derive(Debug, Default)]
pub struct Resolver {
    policies: MergePolicies,
    entities: HashMap<EntityKey, Folded>,
}

impl Resolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new(policies: MergePolicies) -> Self {
        Self {
            policies,
            entities: HashMap::new(),
        }
    }

    /// Fold a verified event. Returns `false` if its `op_id` was already folded.
    pub fn apply(&mut self, event: &Event, payload: Value) -> bool {
        self.apply_mutation(Mutation::from_event(event, payload))
    }

    /// Fold a mutation. Returns `false` if its `op_id` was already folded.
    pub fn apply_mutation(&mut self, mutation: Mutation) -> bool {
        let policy = self.policies.for_type(&mutation.key.entity_type);
        let folded = self.entities.entry(mutation.key.clone()).or_default();
        let slot = (mutation.hlc, mutation.op_id);
        if folded.events.contains_key(&slot) {
            return false;
        }

        let is_newest = folded
            .events
            .last_key_value()
            .map_or(true, |(last, _)| *last < slot);
        let before = folded.state.stats;
        folded.events.insert(slot, (mutation.op, mutation.payload.clone()));

        if is_newest {
            folded
                .state
                .step(policy, mutation.hlc, mutation.op, &mutation.payload);
        } else {
            // Arrived out of order: replay the key from scratch
            let mut state = EntityState::default();
            for ((hlc, _), (op, payload)) in &folded.events {
                state.step(policy, *hlc, *op, payload);
            }
            folded.state = state;
        }

        if folded.state.stats != before {
            debug!(
                key = %mutation.key,
                op_id = %mutation.op_id,
                lww = folded.state.stats.lww,
                max_wins = folded.state.stats.max_wins,
                union = folded.state.stats.union,
                tombstones = folded.state.stats.tombstones,
                "field conflicts resolved"
            );
        }
        true
    }

    /// Folded state of one entity.
    #[must_use]
    pub fn state(&self, key: &EntityKey) -> Option<&EntityState> {
        self.entities.get(key).map(|f| &f.state)
    }

    /// Every folded entity.
    pub fn states(&self) -> impl Iterator<Item = (&EntityKey, &EntityState)> {
        self.entities.iter().map(|(k, f)| (k, &f.state))
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entity has been folded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Disagreements resolved across all entities.
    #[must_use]
    pub fn stats(&self) -> MergeStats {
        let mut total = MergeStats::default();
        for folded in self.entities.values() {
            total += folded.state.stats;
        }
        total
    }

    /// Drop all derived state.
    pub fn clear(&mut self) {
        self.entities.clear();
    }
}
