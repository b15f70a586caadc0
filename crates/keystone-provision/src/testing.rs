//! In-memory cluster used by unit tests

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keystone_common::kube_utils::ManifestIdentity;
use keystone_common::Error;
use serde_json::Value;

use crate::cluster::{AppliedObject, ClusterApi, JobProgress};

type ObjectKey = (String, String, Option<String>, String);

/// Stores applied manifests keyed by apiVersion, kind, namespace and name.
///
/// Apply merges top-level fields into the stored object, which is close
/// enough to server-side apply for a single field manager. Jobs report
/// success as soon as they exist.
#[derive(Clone, Default)]
pub struct FakeCluster {
    objects: Arc<Mutex<BTreeMap<ObjectKey, Value>>>,
    applies: Arc<Mutex<usize>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored object
    pub fn objects(&self) -> BTreeMap<ObjectKey, Value> {
        self.objects.lock().unwrap().clone()
    }

    pub fn apply_count(&self) -> usize {
        *self.applies.lock().unwrap()
    }

    pub fn get(&self, kind: &str, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|((_, k, _, n), _)| k == kind && n == name)
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn server_version(&self) -> Result<String, Error> {
        Ok("v1.31.0-fake".to_string())
    }

    async fn apply(&self, manifest: &Value) -> Result<AppliedObject, Error> {
        let id = ManifestIdentity::from_manifest(manifest)?;
        let key = (
            id.api_version.clone(),
            id.kind.clone(),
            id.namespace.clone(),
            id.name.clone(),
        );
        *self.applies.lock().unwrap() += 1;

        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .entry(key)
            .or_insert_with(|| Value::Object(Default::default()));
        if let (Value::Object(stored), Value::Object(incoming)) = (stored, manifest) {
            for (field, value) in incoming {
                stored.insert(field.clone(), value.clone());
            }
        }
        Ok(AppliedObject {
            api_version: id.api_version,
            kind: id.kind,
            name: id.name.clone(),
            namespace: id.namespace,
            uid: Some(format!("uid-{}", id.name)),
        })
    }

    async fn job_progress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<JobProgress>, Error> {
        let exists = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .any(|(_, k, ns, n)| k == "Job" && ns.as_deref() == Some(namespace) && n == name);
        Ok(exists.then(|| JobProgress {
            succeeded: 1,
            complete: true,
            ..Default::default()
        }))
    }

    async fn workloads_available(&self, _namespace: &str, _selector: &str) -> Result<bool, Error> {
        Ok(true)
    }
}
