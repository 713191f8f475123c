//! The network policy engine.
//!
//! Two-step evaluation:
//!
//! 1. *Ingress*: externally sourced traffic is gated by the target's
//!    `exposed` flag alone; visibility is ignored.
//! 2. *Internal*: service-to-service traffic consults the target's
//!    visibility (`public` allows, `private`/`system` require the caller on
//!    the allowlist).
//!
//! The legacy explicit-rule form coexists: whenever any rule rows exist in
//! the namespace the engine is deny-by-default over those rows, and the
//! expose model is not consulted. With zero rows, visibility wins.
//!
//! Decisions depend only on current policy rows, so the engine is stateless
//! and every call is idempotent.

use std::sync::Arc;

use chrono::Utc;
use stark_core::state::{Namespace, PolicyAction, Visibility};
use stark_core::ServiceId;
use stark_store::{NetworkPolicy, Store};

use crate::error::Result;

/// The centralized policy evaluator.
///
/// Consulted by the signaling hub before relaying, by agents before opening
/// a channel, and again before each request on an existing channel; pods are
/// never the sole enforcement point.
pub struct PolicyEngine<S> {
    store: Arc<S>,
}

impl<S: Store> PolicyEngine<S> {
    /// Create an engine over the store.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Whether internal traffic from `source` to `target` is allowed.
    ///
    /// An unknown target denies rather than erroring: callers treat a
    /// vanished service the same as a forbidden one.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store read fails.
    pub fn is_allowed(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        namespace: Namespace,
    ) -> Result<bool> {
        if self.store.network_policy_count(namespace)? > 0 {
            // Explicit rules present: deny-by-default over the rule table.
            let verdict = match self.store.find_network_policy(source, target, namespace)? {
                Some(rule) => rule.action == PolicyAction::Allow,
                None => false,
            };
            tracing::debug!(
                source = %source,
                target = %target,
                allowed = verdict,
                "Policy decision (explicit rules)"
            );
            return Ok(verdict);
        }

        let Some(meta) = self.store.service_network_meta(target)? else {
            tracing::debug!(target = %target, "Policy decision: unknown target, deny");
            return Ok(false);
        };

        let verdict = match meta.visibility {
            Visibility::Public => true,
            Visibility::Private | Visibility::System => meta.allowed_sources.contains(source),
        };
        tracing::debug!(
            source = %source,
            target = %target,
            visibility = ?meta.visibility,
            allowed = verdict,
            "Policy decision (expose model)"
        );
        Ok(verdict)
    }

    /// Whether external ingress may reach `target`. Only the `exposed` flag
    /// gates this step.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store read fails.
    pub fn is_ingress_allowed(&self, target: &ServiceId) -> Result<bool> {
        let Some(meta) = self.store.service_network_meta(target)? else {
            return Ok(false);
        };
        Ok(meta.exposed)
    }

    /// Upsert an explicit allow/deny rule; the `(source, target, namespace)`
    /// pair key is unique and replaced on conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_rule(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        action: PolicyAction,
        namespace: Namespace,
    ) -> Result<NetworkPolicy> {
        let rule = NetworkPolicy {
            id: format!("netpol-{}", uuid_suffix(source, target)),
            source_service: source.clone(),
            target_service: target.clone(),
            action,
            namespace,
            created_at: Utc::now(),
        };
        self.store.upsert_network_policy(&rule)?;
        tracing::info!(
            source = %source,
            target = %target,
            action = ?action,
            "Network policy rule upserted"
        );
        Ok(rule)
    }

    /// Remove the rule for the pair key; returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn remove_rule(
        &self,
        source: &ServiceId,
        target: &ServiceId,
        namespace: Namespace,
    ) -> Result<bool> {
        Ok(self.store.remove_network_policy(source, target, namespace)?)
    }

    /// List rules in a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn list_rules(&self, namespace: Namespace) -> Result<Vec<NetworkPolicy>> {
        Ok(self.store.list_network_policies(namespace)?)
    }
}

/// Rule IDs only need uniqueness; derive a short digest from the pair.
fn uuid_suffix(source: &ServiceId, target: &ServiceId) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update(b"->");
    hasher.update(target.as_str().as_bytes());
    hasher.finalize().to_hex()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_pack, seed_service};
    use stark_store::MemStore;

    fn setup() -> (PolicyEngine<MemStore>, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        (PolicyEngine::new(Arc::clone(&store)), store)
    }

    fn svc(s: &str) -> ServiceId {
        s.parse().unwrap()
    }

    #[test]
    fn public_target_allows_anyone() {
        let (engine, store) = setup();
        let pack = seed_pack(&store);
        seed_service(&store, "b", 1, &pack); // public by fixture

        assert!(engine.is_allowed(&svc("a"), &svc("b"), Namespace::User).unwrap());
    }

    #[test]
    fn private_target_requires_allowlist() {
        let (engine, store) = setup();
        let pack = seed_pack(&store);
        let mut service = seed_service(&store, "b", 1, &pack);
        service.visibility = stark_core::Visibility::Private;
        service.allowed_sources = vec![svc("api")];
        store.update_service(&service).unwrap();

        assert!(engine.is_allowed(&svc("api"), &svc("b"), Namespace::User).unwrap());
        assert!(!engine.is_allowed(&svc("other"), &svc("b"), Namespace::User).unwrap());
    }

    #[test]
    fn system_visibility_uses_allowlist_rule() {
        let (engine, store) = setup();
        let pack = seed_pack(&store);
        let mut service = seed_service(&store, "infra", 1, &pack);
        service.visibility = stark_core::Visibility::System;
        service.allowed_sources = vec![svc("gateway")];
        store.update_service(&service).unwrap();

        assert!(engine
            .is_allowed(&svc("gateway"), &svc("infra"), Namespace::User)
            .unwrap());
        assert!(!engine
            .is_allowed(&svc("rando"), &svc("infra"), Namespace::User)
            .unwrap());
    }

    #[test]
    fn unknown_target_denies() {
        let (engine, _store) = setup();
        assert!(!engine.is_allowed(&svc("a"), &svc("ghost"), Namespace::User).unwrap());
    }

    #[test]
    fn explicit_rules_switch_to_deny_by_default() {
        let (engine, store) = setup();
        let pack = seed_pack(&store);
        seed_service(&store, "b", 1, &pack); // public

        // Before any rules, the expose model allows a -> b.
        assert!(engine.is_allowed(&svc("a"), &svc("b"), Namespace::User).unwrap());

        // One unrelated rule flips the namespace to deny-by-default.
        engine
            .put_rule(&svc("x"), &svc("y"), PolicyAction::Allow, Namespace::User)
            .unwrap();
        assert!(!engine.is_allowed(&svc("a"), &svc("b"), Namespace::User).unwrap());

        // A matching allow row restores it.
        engine
            .put_rule(&svc("a"), &svc("b"), PolicyAction::Allow, Namespace::User)
            .unwrap();
        assert!(engine.is_allowed(&svc("a"), &svc("b"), Namespace::User).unwrap());

        // An explicit deny row wins over everything.
        engine
            .put_rule(&svc("a"), &svc("b"), PolicyAction::Deny, Namespace::User)
            .unwrap();
        assert!(!engine.is_allowed(&svc("a"), &svc("b"), Namespace::User).unwrap());
    }

    #[test]
    fn rule_upsert_is_idempotent_on_pair_key() {
        let (engine, store) = setup();
        engine
            .put_rule(&svc("a"), &svc("b"), PolicyAction::Allow, Namespace::User)
            .unwrap();
        engine
            .put_rule(&svc("a"), &svc("b"), PolicyAction::Allow, Namespace::User)
            .unwrap();
        assert_eq!(store.network_policy_count(Namespace::User).unwrap(), 1);

        assert!(engine.remove_rule(&svc("a"), &svc("b"), Namespace::User).unwrap());
        assert!(!engine.remove_rule(&svc("a"), &svc("b"), Namespace::User).unwrap());
    }

    #[test]
    fn ingress_gated_by_exposed_only() {
        let (engine, store) = setup();
        let pack = seed_pack(&store);
        let mut service = seed_service(&store, "b", 1, &pack);
        service.visibility = stark_core::Visibility::Public;
        service.exposed = false;
        let service = store.update_service(&service).unwrap();

        // Public but unexposed: ingress denied regardless of visibility.
        assert!(!engine.is_ingress_allowed(&svc("b")).unwrap());

        let mut service = service;
        service.exposed = true;
        service.visibility = stark_core::Visibility::Private;
        store.update_service(&service).unwrap();

        // Exposed: ingress allowed even though visibility is private.
        assert!(engine.is_ingress_allowed(&svc("b")).unwrap());
    }

    #[test]
    fn decisions_are_idempotent() {
        let (engine, store) = setup();
        let pack = seed_pack(&store);
        seed_service(&store, "b", 1, &pack);

        let first = engine.is_allowed(&svc("a"), &svc("b"), Namespace::User).unwrap();
        for _ in 0..5 {
            assert_eq!(
                engine.is_allowed(&svc("a"), &svc("b"), Namespace::User).unwrap(),
                first
            );
        }
    }
}
