//! StateStore — redb-backed persistence for rekon.
//!
//! Typed CRUD over resource definitions, resources, pipelines and runs.
//! `insert_*` never overwrites, `update_*` never creates, `delete_*` fails
//! on a missing key. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use rekon_core::{Pipeline, PipelineRun, Resource, ResourceDefinition};
use rekon_core::types::{PIPELINES_PREFIX, RESOURCES_PREFIX, RESOURCE_DEFINITIONS_PREFIX, RUNS_PREFIX};

use crate::error::{StateError, StateResult};
use crate::tables::OBJECTS;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Default bound on a single store operation issued through [`StateStore::call`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe resource store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    timeout: Duration,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            timeout: DEFAULT_TIMEOUT,
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            timeout: DEFAULT_TIMEOUT,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Override the bound applied by [`StateStore::call`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The underlying database, shared with the bus journal.
    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run a store operation on the blocking pool, bounded by the timeout.
    ///
    /// A timeout or a panicked operation surfaces as
    /// [`StateError::Unavailable`]; the operation is not retried.
    pub async fn call<T, F>(&self, op: F) -> StateResult<T>
    where
        F: FnOnce(&StateStore) -> StateResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        let task = tokio::task::spawn_blocking(move || op(&store));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StateError::Unavailable(format!("store task failed: {e}"))),
            Err(_) => Err(StateError::Unavailable(format!(
                "store operation timed out after {:?}",
                self.timeout
            ))),
        }
    }

    // ── Raw JSON access ────────────────────────────────────────────

    fn insert_json<T: Serialize>(&self, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key.to_string()));
            }
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "object inserted");
        Ok(())
    }

    fn update_json<T: Serialize>(&self, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            if table.get(key).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(key.to_string()));
            }
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "object updated");
        Ok(())
    }

    /// Insert or replace. Returns true if the key was new.
    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StateResult<bool> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            created = table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?
                .is_none();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(created)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete_json<T: DeserializeOwned>(&self, key: &str) -> StateResult<T> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: T;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            let guard = table
                .remove(key)
                .map_err(map_err!(Write))?
                .ok_or_else(|| StateError::NotFound(key.to_string()))?;
            removed = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "object deleted");
        Ok(removed)
    }

    /// Key-ordered prefix scan.
    fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }

    fn require<T>(found: Option<T>, key: String) -> StateResult<T> {
        found.ok_or(StateError::NotFound(key))
    }

    // ── Resource definitions ───────────────────────────────────────

    /// Create a definition. Fails with `AlreadyExists` if the name is taken.
    pub fn insert_resource_definition(&self, def: &ResourceDefinition) -> StateResult<()> {
        self.insert_json(&def.table_key(), def)
    }

    pub fn get_resource_definition(&self, name: &str) -> StateResult<ResourceDefinition> {
        let key = ResourceDefinition::key_for(name);
        Self::require(self.get_json(&key)?, key)
    }

    pub fn update_resource_definition(&self, def: &ResourceDefinition) -> StateResult<()> {
        self.update_json(&def.table_key(), def)
    }

    /// Create or replace a definition. Returns true if it was created.
    pub fn apply_resource_definition(&self, def: &ResourceDefinition) -> StateResult<bool> {
        self.put_json(&def.table_key(), def)
    }

    pub fn delete_resource_definition(&self, name: &str) -> StateResult<ResourceDefinition> {
        self.delete_json(&ResourceDefinition::key_for(name))
    }

    pub fn list_resource_definitions(&self) -> StateResult<Vec<ResourceDefinition>> {
        self.list_json(RESOURCE_DEFINITIONS_PREFIX)
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Create a resource. Fails with `AlreadyExists` if `(type, name)` is taken.
    pub fn insert_resource(&self, resource: &Resource) -> StateResult<()> {
        self.insert_json(&resource.table_key(), resource)
    }

    pub fn get_resource(&self, resource_type: &str, name: &str) -> StateResult<Resource> {
        let key = Resource::key_for(resource_type, name);
        Self::require(self.get_json(&key)?, key)
    }

    /// Replace a resource in full. Fails with `NotFound` if absent.
    pub fn update_resource(&self, resource: &Resource) -> StateResult<()> {
        self.update_json(&resource.table_key(), resource)
    }

    pub fn delete_resource(&self, resource_type: &str, name: &str) -> StateResult<Resource> {
        self.delete_json(&Resource::key_for(resource_type, name))
    }

    /// List resources, optionally restricted to one type.
    pub fn list_resources(&self, resource_type: Option<&str>) -> StateResult<Vec<Resource>> {
        match resource_type {
            Some(t) => self.list_json(&Resource::type_prefix(t)),
            None => self.list_json(RESOURCES_PREFIX),
        }
    }

    // ── Pipelines ──────────────────────────────────────────────────

    pub fn insert_pipeline(&self, pipeline: &Pipeline) -> StateResult<()> {
        self.insert_json(&pipeline.table_key(), pipeline)
    }

    pub fn get_pipeline(&self, name: &str) -> StateResult<Pipeline> {
        let key = Pipeline::key_for(name);
        Self::require(self.get_json(&key)?, key)
    }

    pub fn update_pipeline(&self, pipeline: &Pipeline) -> StateResult<()> {
        self.update_json(&pipeline.table_key(), pipeline)
    }

    pub fn delete_pipeline(&self, name: &str) -> StateResult<Pipeline> {
        self.delete_json(&Pipeline::key_for(name))
    }

    pub fn list_pipelines(&self) -> StateResult<Vec<Pipeline>> {
        self.list_json(PIPELINES_PREFIX)
    }

    /// Pipelines reacting to `resource_type`.
    pub fn pipelines_for_resource(&self, resource_type: &str) -> StateResult<Vec<Pipeline>> {
        Ok(self
            .list_pipelines()?
            .into_iter()
            .filter(|p| p.resource == resource_type)
            .collect())
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Insert or replace run state.
    pub fn put_run(&self, run: &PipelineRun) -> StateResult<()> {
        self.put_json(&run.table_key(), run)?;
        Ok(())
    }

    pub fn find_run(&self, run_id: &str, pipeline: &str) -> StateResult<Option<PipelineRun>> {
        self.get_json(&PipelineRun::key_for(run_id, pipeline))
    }

    /// Every pipeline run recorded for one run id.
    pub fn list_runs(&self, run_id: &str) -> StateResult<Vec<PipelineRun>> {
        self.list_json(&PipelineRun::run_prefix(run_id))
    }

    pub fn list_all_runs(&self) -> StateResult<Vec<PipelineRun>> {
        self.list_json(RUNS_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::{PipelineStep, RunStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn test_definition(name: &str) -> ResourceDefinition {
        ResourceDefinition {
            id: format!("def-{name}"),
            name: name.to_string(),
            description: "test definition".to_string(),
            version: "1".to_string(),
            schema: json!({"required": ["steps"]}),
        }
    }

    fn test_resource(resource_type: &str, name: &str) -> Resource {
        Resource {
            id: format!("res-{name}"),
            name: name.to_string(),
            resource: resource_type.to_string(),
            spec: json!({"steps": ["a"]}),
        }
    }

    fn test_pipeline(name: &str, resource_type: &str) -> Pipeline {
        Pipeline {
            name: name.to_string(),
            description: String::new(),
            version: "1".to_string(),
            resource: resource_type.to_string(),
            steps: vec![PipelineStep {
                id: "s1".to_string(),
                name: "build".to_string(),
                driver: "builder".to_string(),
            }],
            metadata: BTreeMap::new(),
        }
    }

    // ── Resource definitions ───────────────────────────────────────

    #[test]
    fn definition_insert_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let def = test_definition("pipe");

        store.insert_resource_definition(&def).unwrap();
        assert_eq!(store.get_resource_definition("pipe").unwrap(), def);
    }

    #[test]
    fn definition_get_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.get_resource_definition("nope").unwrap_err();
        assert!(matches!(err, StateError::NotFound(key) if key == "/resource_definitions/nope"));
    }

    #[test]
    fn definition_apply_creates_then_replaces() {
        let store = StateStore::open_in_memory().unwrap();
        let mut def = test_definition("pipe");
        assert!(store.apply_resource_definition(&def).unwrap());

        def.version = "2".to_string();
        assert!(!store.apply_resource_definition(&def).unwrap());
        assert_eq!(store.get_resource_definition("pipe").unwrap().version, "2");
    }

    // ── Resources ──────────────────────────────────────────────────

    #[test]
    fn second_insert_with_same_key_already_exists() {
        let store = StateStore::open_in_memory().unwrap();
        let res = test_resource("pipe", "p1");

        store.insert_resource(&res).unwrap();
        let err = store.insert_resource(&res).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn same_name_different_type_is_distinct() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_resource(&test_resource("pipe", "p1")).unwrap();
        store.insert_resource(&test_resource("app", "p1")).unwrap();
        assert_eq!(store.list_resources(None).unwrap().len(), 2);
    }

    #[test]
    fn update_missing_resource_does_not_upsert() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.update_resource(&test_resource("pipe", "p1")).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        assert!(store.list_resources(None).unwrap().is_empty());
    }

    #[test]
    fn update_replaces_in_full() {
        let store = StateStore::open_in_memory().unwrap();
        let mut res = test_resource("pipe", "p1");
        store.insert_resource(&res).unwrap();

        res.spec = json!({"other": true});
        store.update_resource(&res).unwrap();
        assert_eq!(
            store.get_resource("pipe", "p1").unwrap().spec,
            json!({"other": true})
        );
    }

    #[test]
    fn delete_returns_removed_and_then_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_resource(&test_resource("pipe", "p1")).unwrap();

        let removed = store.delete_resource("pipe", "p1").unwrap();
        assert_eq!(removed.name, "p1");
        assert!(matches!(
            store.delete_resource("pipe", "p1"),
            Err(StateError::NotFound(_))
        ));
        assert!(matches!(
            store.get_resource("pipe", "p1"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn list_is_key_ordered_and_prefix_scoped() {
        let store = StateStore::open_in_memory().unwrap();
        for name in ["c", "a", "b"] {
            store.insert_resource(&test_resource("pipe", name)).unwrap();
        }
        store.insert_resource(&test_resource("pipeline", "z")).unwrap();
        store.insert_resource_definition(&test_definition("pipe")).unwrap();

        let names: Vec<String> = store
            .list_resources(Some("pipe"))
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(store.list_resources(None).unwrap().len(), 4);
    }

    // ── Pipelines and runs ─────────────────────────────────────────

    #[test]
    fn pipelines_filtered_by_resource_type() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_pipeline(&test_pipeline("deploy", "app")).unwrap();
        store.insert_pipeline(&test_pipeline("audit", "app")).unwrap();
        store.insert_pipeline(&test_pipeline("lint", "pipe")).unwrap();

        let bound = store.pipelines_for_resource("app").unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].name, "audit");
    }

    #[test]
    fn runs_are_grouped_by_run_id() {
        let store = StateStore::open_in_memory().unwrap();
        let deploy = test_pipeline("deploy", "app");
        let audit = test_pipeline("audit", "app");

        store.put_run(&PipelineRun::open("run-1", &deploy, "web", 1)).unwrap();
        store.put_run(&PipelineRun::open("run-1", &audit, "web", 1)).unwrap();
        store.put_run(&PipelineRun::open("run-2", &deploy, "web", 1)).unwrap();

        assert_eq!(store.list_runs("run-1").unwrap().len(), 2);
        assert_eq!(store.list_all_runs().unwrap().len(), 3);

        let mut run = store.find_run("run-2", "deploy").unwrap().unwrap();
        run.status = RunStatus::Completed;
        store.put_run(&run).unwrap();
        assert_eq!(
            store.find_run("run-2", "deploy").unwrap().unwrap().status,
            RunStatus::Completed
        );
        assert!(store.find_run("run-3", "deploy").unwrap().is_none());
    }

    // ── Async access ───────────────────────────────────────────────

    #[tokio::test]
    async fn call_runs_operation_off_the_runtime() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .call(|s| s.insert_resource_definition(&test_definition("pipe")))
            .await
            .unwrap();
        let def = store
            .call(|s| s.get_resource_definition("pipe"))
            .await
            .unwrap();
        assert_eq!(def.name, "pipe");
    }

    #[tokio::test]
    async fn call_times_out_as_unavailable() {
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_timeout(Duration::from_millis(20));
        let err = store
            .call(|_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.insert_resource_definition(&test_definition("pipe")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_resource_definition("pipe").unwrap().name, "pipe");
    }
}
