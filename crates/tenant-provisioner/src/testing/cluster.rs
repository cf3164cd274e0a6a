use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::cluster::crds::Certificate;
use crate::cluster::{ClusterApi, ClusterError, ClusterObject};

/// PEM handed out as the CA of every fake token Secret.
pub const FAKE_CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nRkFLRQ==\n-----END CERTIFICATE-----\n";

/// How fake cert-manager responds to new Certificates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CertificateBehavior {
    /// Issued immediately.
    #[default]
    Ready,
    /// Issued once the Certificate has been read this many times.
    ReadyAfterPolls(u32),
    /// Never issued.
    NeverReady,
    /// Issuance fails with this message.
    Fail(String),
}

type Key = (String, Option<String>, String);

#[derive(Debug)]
struct State {
    objects: BTreeMap<Key, Value>,
    creations: BTreeMap<String, usize>,
    reads: BTreeMap<Key, u32>,
    unreachable: bool,
    failing_kinds: BTreeSet<String>,
    rejected_managers: BTreeSet<String>,
    certificates: CertificateBehavior,
    populate_tokens: bool,
    unpopulated_namespaces: BTreeSet<String>,
    next_version: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            creations: BTreeMap::new(),
            reads: BTreeMap::new(),
            unreachable: false,
            failing_kinds: BTreeSet::new(),
            rejected_managers: BTreeSet::new(),
            certificates: CertificateBehavior::default(),
            populate_tokens: true,
            unpopulated_namespaces: BTreeSet::new(),
            next_version: 1,
        }
    }
}

impl State {
    fn version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check(&self, kind: &str) -> Result<(), ClusterError> {
        if self.unreachable {
            return Err(ClusterError::Unreachable("connection refused".into()));
        }
        if self.failing_kinds.contains(kind) {
            return Err(ClusterError::Conflict {
                kind: kind.to_string(),
                name: String::new(),
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

/// In-memory cluster API.
///
/// Objects are stored as JSON. Creation fills in the fields controllers
/// would: token Secrets get a token and CA, Certificates get a status
/// according to [`CertificateBehavior`].
#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

fn key<K: ClusterObject>(namespace: Option<&str>, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.map(String::from),
        name.to_string(),
    )
}

fn decode<T: DeserializeOwned>(value: Value, kind: &str) -> Result<T, ClusterError> {
    serde_json::from_value(value).map_err(|source| ClusterError::Serialization {
        kind: kind.to_string(),
        source,
    })
}

fn encode<T: Serialize>(object: &T, kind: &str) -> Result<Value, ClusterError> {
    serde_json::to_value(object).map_err(|source| ClusterError::Serialization {
        kind: kind.to_string(),
        source,
    })
}

/// RFC 7386 JSON merge patch.
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                merge(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(|i| i.get("name").is_some_and(Value::is_string))
}

/// Server-side apply merge: lists of named objects merge entry-by-entry by
/// name, everything else as a merge patch.
fn apply(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                apply(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (Value::Array(target), Value::Array(patch)) if is_named_list(patch) => {
            for entry in patch {
                let existing = target.iter_mut().find(|t| t.get("name") == entry.get("name"));
                match existing {
                    Some(existing) => apply(existing, entry),
                    None => target.push(entry.clone()),
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn certificate_status(behavior: &CertificateBehavior) -> Value {
    match behavior {
        CertificateBehavior::Ready => json!({
            "conditions": [{"type": "Ready", "status": "True", "reason": "Ready"}]
        }),
        CertificateBehavior::Fail(message) => json!({
            "lastFailureTime": "2026-01-01T00:00:00Z",
            "conditions": [
                {"type": "Issuing", "status": "False", "reason": "Failed", "message": message},
                {"type": "Ready", "status": "False", "reason": "Failed", "message": message}
            ]
        }),
        CertificateBehavior::ReadyAfterPolls(_) | CertificateBehavior::NeverReady => json!({
            "conditions": [{"type": "Ready", "status": "False", "reason": "DoesNotExist"}]
        }),
    }
}

impl FakeCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster with a shared Gateway carrying one HTTP listener named `http`.
    #[must_use]
    pub fn with_gateway(namespace: &str, name: &str, http_hostname: Option<&str>) -> Self {
        let cluster = Self::new();
        let mut listener = json!({"name": "http", "port": 80, "protocol": "HTTP"});
        if let Some(hostname) = http_hostname {
            listener["hostname"] = json!(hostname);
        }
        let gateway = json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": {"name": name, "namespace": namespace, "resourceVersion": "1"},
            "spec": {"gatewayClassName": "shared", "listeners": [listener]},
        });
        cluster.state().objects.insert(
            ("Gateway".into(), Some(namespace.into()), name.into()),
            gateway,
        );
        cluster
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail as if the API server were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Make every call for `kind` fail.
    pub fn fail_kind(&self, kind: &str) {
        self.state().failing_kinds.insert(kind.to_string());
    }

    pub fn set_certificate_behavior(&self, behavior: CertificateBehavior) {
        self.state().certificates = behavior;
    }

    /// Make server-side apply fail for this field manager.
    pub fn reject_apply_from(&self, field_manager: &str) {
        self.state().rejected_managers.insert(field_manager.to_string());
    }

    /// Whether token Secrets get populated on creation.
    pub fn set_populate_tokens(&self, populate: bool) {
        self.state().populate_tokens = populate;
    }

    /// Leave token Secrets in `namespace` unpopulated.
    pub fn withhold_tokens_in(&self, namespace: &str) {
        self.state().unpopulated_namespaces.insert(namespace.to_string());
    }

    /// Seed an object without going through the API.
    ///
    /// # Panics
    ///
    /// Panics if the object cannot be serialized.
    pub fn insert<K: ClusterObject>(&self, namespace: Option<&str>, object: &K) {
        let name = object.meta().name.clone().unwrap_or_default();
        let value = serde_json::to_value(object).expect("serializable object");
        self.state().objects.insert(key::<K>(namespace, &name), value);
    }

    /// Current state of an object.
    #[must_use]
    pub fn object<K: ClusterObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let value = self.state().objects.get(&key::<K>(namespace, name)).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Number of stored objects of kind `K`.
    #[must_use]
    pub fn count<K: ClusterObject>(&self) -> usize {
        let kind = K::kind(&());
        self.state()
            .objects
            .keys()
            .filter(|(k, _, _)| k.as_str() == kind.as_ref())
            .count()
    }

    /// Number of successful creates of kind `K`.
    #[must_use]
    pub fn creations<K: ClusterObject>(&self) -> usize {
        let kind = K::kind(&()).to_string();
        self.state().creations.get(&kind).copied().unwrap_or(0)
    }

    /// Token the fake controller put in a namespace's deployer token Secret.
    #[must_use]
    pub fn service_account_token(&self, namespace: &str) -> String {
        self.state()
            .objects
            .get(&(
                "Secret".to_string(),
                Some(namespace.to_string()),
                crate::identity::TOKEN_SECRET.to_string(),
            ))
            .and_then(|secret| secret["data"]["token"].as_str())
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .and_then(|raw| String::from_utf8(raw).ok())
            .unwrap_or_default()
    }

    fn on_create(state: &mut State, kind: &str, namespace: Option<&str>, value: &mut Value) {
        match kind {
            "Certificate" => {
                value["status"] = certificate_status(&state.certificates);
            }
            "Secret"
                if state.populate_tokens
                    && !namespace.is_some_and(|ns| state.unpopulated_namespaces.contains(ns))
                    && value["type"] == "kubernetes.io/service-account-token" =>
            {
                let token = format!("token-{}-{}", namespace.unwrap_or_default(), state.next_version);
                value["data"] = json!({
                    "token": STANDARD.encode(token),
                    "ca.crt": STANDARD.encode(FAKE_CA_PEM),
                    "namespace": STANDARD.encode(namespace.unwrap_or_default()),
                });
            }
            _ => {}
        }
    }

    fn on_read(state: &mut State, key: &Key) {
        if key.0 != Certificate::kind(&()) {
            return;
        }
        let CertificateBehavior::ReadyAfterPolls(polls) = state.certificates else {
            return;
        };
        let reads = state.reads.entry(key.clone()).or_insert(0);
        *reads += 1;
        if *reads > polls {
            if let Some(object) = state.objects.get_mut(key) {
                object["status"] = certificate_status(&CertificateBehavior::Ready);
            }
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, ClusterError> {
        let kind = K::kind(&()).to_string();
        let key = key::<K>(namespace, name);
        let value = {
            let mut state = self.state();
            state.check(&kind)?;
            Self::on_read(&mut state, &key);
            state.objects.get(&key).cloned()
        };
        value.map(|v| decode(v, &kind)).transpose()
    }

    async fn create<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        object: &K,
    ) -> Result<K, ClusterError> {
        let kind = K::kind(&()).to_string();
        let name = object.meta().name.clone().unwrap_or_default();
        let key = key::<K>(namespace, &name);
        let mut value = encode(object, &kind)?;

        let stored = {
            let mut state = self.state();
            state.check(&kind)?;
            if state.objects.contains_key(&key) {
                return Err(ClusterError::AlreadyExists { kind, name });
            }
            value["metadata"]["resourceVersion"] = json!(state.version());
            value["metadata"]["uid"] = json!(format!("uid-{}", state.next_version));
            Self::on_create(&mut state, &kind, namespace, &mut value);
            state.objects.insert(key, value.clone());
            *state.creations.entry(kind.clone()).or_insert(0) += 1;
            value
        };
        decode(stored, &kind)
    }

    async fn merge_patch<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClusterError> {
        let kind = K::kind(&()).to_string();
        let key = key::<K>(namespace, name);

        let stored = {
            let mut state = self.state();
            state.check(&kind)?;
            let version = state.version();
            let Some(object) = state.objects.get_mut(&key) else {
                return Err(ClusterError::NotFound {
                    kind,
                    name: name.to_string(),
                });
            };
            merge(object, patch);
            object["metadata"]["resourceVersion"] = json!(version);
            object.clone()
        };
        decode(stored, &kind)
    }

    async fn apply_patch<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        field_manager: &str,
        patch: &Value,
    ) -> Result<K, ClusterError> {
        let kind = K::kind(&()).to_string();
        let key = key::<K>(namespace, name);

        let stored = {
            let mut state = self.state();
            state.check(&kind)?;
            if state.rejected_managers.contains(field_manager) {
                return Err(ClusterError::Conflict {
                    kind,
                    name: name.to_string(),
                    message: format!("apply from {field_manager} rejected"),
                });
            }
            let version = state.version();
            let object = state.objects.entry(key).or_insert_with(|| json!({}));
            apply(object, patch);
            object["metadata"]["resourceVersion"] = json!(version);
            object.clone()
        };
        decode(stored, &kind)
    }

    fn api_endpoint(&self) -> String {
        "https://fake-cluster.test:6443".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::crds::Gateway;

    #[test]
    fn test_merge_patch_semantics() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "list": [1, 2]});
        merge(&mut target, &json!({"a": null, "b": {"c": 5}, "list": [3]}));
        assert_eq!(target, json!({"b": {"c": 5, "d": 3}, "list": [3]}));
    }

    #[test]
    fn test_apply_merges_named_lists() {
        let mut target = json!({"spec": {"listeners": [{"name": "http", "port": 80}]}});
        apply(
            &mut target,
            &json!({"spec": {"listeners": [{"name": "https-a", "port": 443}]}}),
        );
        apply(
            &mut target,
            &json!({"spec": {"listeners": [{"name": "https-a", "port": 443}]}}),
        );
        assert_eq!(
            target["spec"]["listeners"],
            json!([{"name": "http", "port": 80}, {"name": "https-a", "port": 443}])
        );
    }

    #[tokio::test]
    async fn test_gateway_fixture_decodes() {
        let cluster = FakeCluster::with_gateway("gateway-system", "shared-gateway", None);
        let gateway: Option<Gateway> = cluster
            .get(Some("gateway-system"), "shared-gateway")
            .await
            .unwrap();
        assert_eq!(gateway.unwrap().spec.listeners[0].protocol, "HTTP");
    }
}
