//! Versioned policy store.
//!
//! Readers take an `Arc` of the current snapshot and evaluate against it for
//! the whole call; writers build a complete new snapshot and swap it in, so a
//! reader never sees a half-applied update.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use gov_bridge_core::{Policy, Result};

use crate::patterns::PatternSet;

/// A policy with its blocked patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: Policy,
    pub patterns: PatternSet,
}

impl CompiledPolicy {
    pub fn compile(policy: Policy) -> Result<Self> {
        policy.validate()?;
        let patterns = PatternSet::compile(&policy.blocked_patterns)?;
        Ok(Self { policy, patterns })
    }
}

/// An immutable view of every policy and declared tool list.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    version: u64,
    loaded_at: Option<DateTime<Utc>>,
    policies: HashMap<String, Arc<CompiledPolicy>>,
    tools: HashMap<String, HashSet<String>>,
}

impl PolicySnapshot {
    /// Compile a snapshot. Any invalid policy rejects the whole set.
    pub fn build(
        policies: impl IntoIterator<Item = Policy>,
        tools: impl IntoIterator<Item = (String, Vec<String>)>,
    ) -> Result<Self> {
        let policies = policies
            .into_iter()
            .map(|p| -> Result<(String, Arc<CompiledPolicy>)> {
                Ok((p.backend_id.clone(), Arc::new(CompiledPolicy::compile(p)?)))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let tools = tools
            .into_iter()
            .map(|(backend, list)| (backend, list.into_iter().collect()))
            .collect();

        Ok(Self {
            version: 0,
            loaded_at: None,
            policies,
            tools,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn policy(&self, backend_id: &str) -> Option<&Arc<CompiledPolicy>> {
        self.policies.get(backend_id)
    }

    /// Whether `tool` may be addressed on `backend_id`.
    ///
    /// The backend must have a policy. A backend with no declared tools
    /// (or an empty list) accepts any tool name.
    pub fn knows_tool(&self, backend_id: &str, tool: &str) -> bool {
        if !self.policies.contains_key(backend_id) {
            return false;
        }
        match self.tools.get(backend_id) {
            Some(tools) if !tools.is_empty() => tools.contains(tool),
            _ => true,
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Backend ids with a policy, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.policies.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values().map(|c| &c.policy)
    }
}

/// Holder of the current policy snapshot.
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    /// Store seeded with a snapshot (assigned version 1).
    pub fn new(snapshot: PolicySnapshot) -> Self {
        let store = Self {
            current: RwLock::new(Arc::new(PolicySnapshot::default())),
        };
        store.install(snapshot);
        store
    }

    /// Store with no policies. Every call is denied `unknown_target`.
    pub fn empty() -> Self {
        Self::new(PolicySnapshot::default())
    }

    /// Build and install a store from policies and tool declarations.
    pub fn from_policies(
        policies: impl IntoIterator<Item = Policy>,
        tools: impl IntoIterator<Item = (String, Vec<String>)>,
    ) -> Result<Self> {
        Ok(Self::new(PolicySnapshot::build(policies, tools)?))
    }

    /// The current snapshot. Cheap; hold it for the duration of one evaluation.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Atomically replace every policy. On error the current snapshot stays in effect.
    pub fn replace(
        &self,
        policies: impl IntoIterator<Item = Policy>,
        tools: impl IntoIterator<Item = (String, Vec<String>)>,
    ) -> Result<u64> {
        let snapshot = PolicySnapshot::build(policies, tools)?;
        Ok(self.install(snapshot))
    }

    /// Insert or replace one backend's policy.
    pub fn update_policy(&self, policy: Policy) -> Result<u64> {
        let compiled = Arc::new(CompiledPolicy::compile(policy)?);
        Ok(self.modify(|next| {
            next.policies
                .insert(compiled.policy.backend_id.clone(), compiled.clone());
        }))
    }

    /// Replace one backend's declared tool list.
    pub fn update_tools(&self, backend_id: &str, tools: Vec<String>) -> u64 {
        self.modify(|next| {
            next.tools
                .insert(backend_id.to_string(), tools.into_iter().collect());
        })
    }

    /// Drop a backend's policy and tool list.
    pub fn remove_backend(&self, backend_id: &str) -> u64 {
        self.modify(|next| {
            next.policies.remove(backend_id);
            next.tools.remove(backend_id);
        })
    }

    /// Copy-on-write edit of the current snapshot under the write lock.
    fn modify(&self, edit: impl FnOnce(&mut PolicySnapshot)) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = PolicySnapshot::clone(&current);
        edit(&mut next);
        next.version = current.version + 1;
        next.loaded_at = Some(Utc::now());
        let version = next.version;
        *current = Arc::new(next);

        tracing::info!(version, policies = current.len(), "Policy snapshot updated");
        version
    }

    fn install(&self, snapshot: PolicySnapshot) -> u64 {
        self.modify(move |next| *next = snapshot)
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_tools() -> Vec<(String, Vec<String>)> {
        Vec::new()
    }

    fn tools(backend: &str, list: &[&str]) -> (String, Vec<String>) {
        (backend.to_string(), list.iter().map(|t| t.to_string()).collect())
    }

    #[test]
    fn test_knows_tool() {
        let store = PolicyStore::from_policies(
            vec![Policy::new("fs"), Policy::new("open")],
            vec![tools("fs", &["read"]), tools("open", &[])],
        )
        .unwrap();
        let snapshot = store.snapshot();

        assert!(snapshot.knows_tool("fs", "read"));
        assert!(!snapshot.knows_tool("fs", "write"));
        assert!(snapshot.knows_tool("open", "anything"));
        assert!(!snapshot.knows_tool("ghost", "read"));
    }

    #[test]
    fn test_versions_increase_and_old_snapshots_survive() {
        let store = PolicyStore::from_policies(vec![Policy::new("fs")], no_tools()).unwrap();
        let before = store.snapshot();
        assert_eq!(before.version(), 1);

        let v = store.update_policy(Policy::new("fs").with_rate_limit(5)).unwrap();
        assert_eq!(v, 2);

        // a reader holding the old snapshot still sees the old policy
        assert_eq!(before.policy("fs").unwrap().policy.rate_limit_per_minute, 100);
        assert_eq!(store.snapshot().policy("fs").unwrap().policy.rate_limit_per_minute, 5);
    }

    #[test]
    fn test_invalid_replace_keeps_current() {
        let store = PolicyStore::from_policies(vec![Policy::new("fs")], no_tools()).unwrap();
        let bad = Policy::new("fs").block_pattern("(unclosed");

        assert!(store.replace(vec![Policy::new("db"), bad], no_tools()).is_err());
        assert_eq!(store.version(), 1);
        assert_eq!(store.snapshot().backends(), vec!["fs".to_string()]);

        assert!(store.update_policy(Policy::new("fs").with_allowed_hours([24])).is_err());
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_remove_backend() {
        let store = PolicyStore::from_policies(
            vec![Policy::new("fs"), Policy::new("db")],
            vec![tools("fs", &["read"])],
        )
        .unwrap();
        store.remove_backend("fs");
        let snapshot = store.snapshot();
        assert!(snapshot.policy("fs").is_none());
        assert!(!snapshot.knows_tool("fs", "read"));
        assert_eq!(snapshot.len(), 1);
    }
}
