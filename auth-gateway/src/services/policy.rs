//! Policy store and enforcement.
//!
//! Rules live in an immutable [`PolicySnapshot`] behind an `Arc`. Readers clone
//! the `Arc` and evaluate without holding any lock; writers build a new
//! snapshot and swap it in. An evaluation therefore sees either the old or the
//! new rule set, never a mix.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use super::GatewayError;
use crate::models::policy::resource_matches;
use crate::models::{GroupingRule, Identity, PolicyRule};
use crate::store::PolicyRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

#[derive(Debug, Default)]
pub struct PolicySnapshot {
    policies: BTreeSet<PolicyRule>,
    groupings: BTreeSet<GroupingRule>,
    rules_by_role: HashMap<String, Vec<PolicyRule>>,
    /// member → roles it directly belongs to
    parents: HashMap<String, BTreeSet<String>>,
}

impl PolicySnapshot {
    pub fn new(policies: BTreeSet<PolicyRule>, groupings: BTreeSet<GroupingRule>) -> Self {
        let mut rules_by_role: HashMap<String, Vec<PolicyRule>> = HashMap::new();
        for rule in &policies {
            rules_by_role
                .entry(rule.role.clone())
                .or_default()
                .push(rule.clone());
        }

        let mut parents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for g in &groupings {
            parents
                .entry(g.member.clone())
                .or_default()
                .insert(g.role.clone());
        }

        Self {
            policies,
            groupings,
            rules_by_role,
            parents,
        }
    }

    /// Reflexive-transitive closure of membership edges from `seeds`.
    ///
    /// Each name is expanded at most once, so malformed graphs with cycles
    /// terminate after visiting every reachable node; the edge closing a cycle
    /// is skipped.
    pub fn effective_roles<'a, I>(&self, seeds: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for seed in seeds {
            if visited.insert(seed.to_string()) {
                queue.push_back(seed.to_string());
            }
        }

        while let Some(member) = queue.pop_front() {
            let Some(roles) = self.parents.get(&member) else {
                continue;
            };
            for role in roles {
                if visited.insert(role.clone()) {
                    queue.push_back(role.clone());
                } else {
                    tracing::debug!(member = %member, role = %role, "Skipping revisited membership edge");
                }
            }
        }

        visited
    }

    /// Whether any of `roles` holds a rule matching `(resource, action)`.
    pub fn allows(&self, roles: &BTreeSet<String>, resource: &str, action: &str) -> bool {
        roles.iter().any(|role| {
            self.rules_by_role.get(role).is_some_and(|rules| {
                rules
                    .iter()
                    .any(|r| r.matches_action(action) && resource_matches(&r.resource, resource))
            })
        })
    }

    /// Direct members of `role`.
    pub fn members_of(&self, role: &str) -> Vec<String> {
        self.groupings
            .iter()
            .filter(|g| g.role == role)
            .map(|g| g.member.clone())
            .collect()
    }

    pub fn policies(&self) -> impl Iterator<Item = &PolicyRule> {
        self.policies.iter()
    }

    pub fn groupings(&self) -> impl Iterator<Item = &GroupingRule> {
        self.groupings.iter()
    }
}

enum Mutation<'a> {
    AddPolicy(&'a PolicyRule),
    DeletePolicy(&'a PolicyRule),
    AddGrouping(&'a GroupingRule),
    DeleteGrouping(&'a GroupingRule),
}

/// Owner of the policy and grouping tuples.
pub struct PolicyStore {
    repo: Arc<dyn PolicyRepository>,
    current: RwLock<Arc<PolicySnapshot>>,
    // serializes writers so the repository and the snapshot change in the same order
    writer: tokio::sync::Mutex<()>,
}

impl PolicyStore {
    pub async fn load(repo: Arc<dyn PolicyRepository>) -> Result<Self, GatewayError> {
        let (policies, groupings) = repo.load().await?;
        tracing::info!(
            policies = policies.len(),
            groupings = groupings.len(),
            "Policy store loaded"
        );
        Ok(Self {
            repo,
            current: RwLock::new(Arc::new(PolicySnapshot::new(
                policies.into_iter().collect(),
                groupings.into_iter().collect(),
            ))),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    /// Returns whether the tuple was new. Adding an existing tuple is a no-op.
    pub async fn add_policy(&self, rule: &PolicyRule) -> Result<bool, GatewayError> {
        rule.validate()?;
        self.apply(Mutation::AddPolicy(rule)).await
    }

    /// Returns whether the tuple existed. Deleting an absent tuple is a no-op.
    pub async fn delete_policy(&self, rule: &PolicyRule) -> Result<bool, GatewayError> {
        rule.validate()?;
        self.apply(Mutation::DeletePolicy(rule)).await
    }

    pub async fn add_group_policy(&self, rule: &GroupingRule) -> Result<bool, GatewayError> {
        rule.validate()?;
        self.apply(Mutation::AddGrouping(rule)).await
    }

    pub async fn delete_group_policy(&self, rule: &GroupingRule) -> Result<bool, GatewayError> {
        rule.validate()?;
        self.apply(Mutation::DeleteGrouping(rule)).await
    }

    pub fn list_policies(&self) -> Vec<PolicyRule> {
        self.snapshot().policies().cloned().collect()
    }

    pub fn list_group_policies(&self) -> Vec<GroupingRule> {
        self.snapshot().groupings().cloned().collect()
    }

    async fn apply(&self, mutation: Mutation<'_>) -> Result<bool, GatewayError> {
        let _guard = self.writer.lock().await;

        let changed = match &mutation {
            Mutation::AddPolicy(r) => self.repo.insert_policy(r).await?,
            Mutation::DeletePolicy(r) => self.repo.delete_policy(r).await?,
            Mutation::AddGrouping(g) => self.repo.insert_grouping(g).await?,
            Mutation::DeleteGrouping(g) => self.repo.delete_grouping(g).await?,
        };
        if !changed {
            return Ok(false);
        }

        let base = self.snapshot();
        let mut policies = base.policies.clone();
        let mut groupings = base.groupings.clone();
        match mutation {
            Mutation::AddPolicy(r) => {
                policies.insert(r.clone());
                tracing::info!(role = %r.role, resource = %r.resource, action = %r.action, "Policy added");
            }
            Mutation::DeletePolicy(r) => {
                policies.remove(r);
                tracing::info!(role = %r.role, resource = %r.resource, action = %r.action, "Policy deleted");
            }
            Mutation::AddGrouping(g) => {
                groupings.insert(g.clone());
                tracing::info!(role = %g.role, member = %g.member, "Group policy added");
            }
            Mutation::DeleteGrouping(g) => {
                groupings.remove(g);
                tracing::info!(role = %g.role, member = %g.member, "Group policy deleted");
            }
        }

        *self.current.write() = Arc::new(PolicySnapshot::new(policies, groupings));
        Ok(true)
    }
}

/// Evaluates `(subject, resource, action)` against the current snapshot.
#[derive(Clone)]
pub struct PolicyEnforcer {
    store: Arc<PolicyStore>,
}

impl PolicyEnforcer {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Allow iff some role in the subject's closure has a matching rule.
    /// There are no deny rules; the absence of an allow is a deny.
    pub fn enforce(&self, subject: &str, resource: &str, action: &str) -> Decision {
        self.evaluate(std::iter::once(subject), resource, action)
    }

    /// Like [`enforce`](Self::enforce), seeding the closure with the
    /// identity's `user:<username>` node and its directly assigned roles as
    /// they are now.
    pub fn enforce_for(&self, identity: &Identity, resource: &str, action: &str) -> Decision {
        let subject = identity.subject();
        self.evaluate(identity_seeds(&subject, identity), resource, action)
    }

    pub fn effective_roles(&self, subject: &str) -> BTreeSet<String> {
        self.store.snapshot().effective_roles(std::iter::once(subject))
    }

    pub fn effective_roles_for(&self, identity: &Identity) -> BTreeSet<String> {
        let subject = identity.subject();
        self.store
            .snapshot()
            .effective_roles(identity_seeds(&subject, identity))
    }

    fn evaluate<'a, I>(&self, seeds: I, resource: &str, action: &str) -> Decision
    where
        I: IntoIterator<Item = &'a str>,
    {
        let snapshot = self.store.snapshot();
        let roles = snapshot.effective_roles(seeds);
        if snapshot.allows(&roles, resource, action) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

fn identity_seeds<'a>(
    subject: &'a str,
    identity: &'a Identity,
) -> impl Iterator<Item = &'a str> {
    std::iter::once(subject).chain(identity.roles.iter().map(String::as_str))
}
