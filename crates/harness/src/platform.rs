use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use metalayer_core::{CoreError, MetaValue, Overlay, OverlayScope, Patch};
use metalayer_engine::{EngineConfig, EngineError, OverlayEngine, OverlayEvent};
use metalayer_storage::SqliteStorage;
use tempfile::TempDir;

/// Document fixture from a JSON literal.
pub fn doc(value: serde_json::Value) -> MetaValue {
    MetaValue::from(value)
}

/// Patch fixture from a JSON object keyed by dot paths.
pub fn patch(value: serde_json::Value) -> Result<Patch, CoreError> {
    Patch::from_json(value)
}

/// An engine over SQLite, in memory or in a temporary directory.
pub struct TestPlatform {
    pub engine: OverlayEngine<SqliteStorage>,
    dir: Option<TempDir>,
}

impl TestPlatform {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        crate::init_tracing();
        let storage = SqliteStorage::open_in_memory()?;
        Ok(Self {
            engine: OverlayEngine::new(config, storage)?,
            dir: None,
        })
    }

    /// File-backed platform; the database lives as long as `self`.
    pub fn on_disk(config: EngineConfig) -> Result<Self, Box<dyn std::error::Error>> {
        crate::init_tracing();
        let dir = tempfile::tempdir()?;
        let storage = SqliteStorage::open(dir.path().join("metalayer.db"))?;
        Ok(Self {
            engine: OverlayEngine::new(config, storage)?,
            dir: Some(dir),
        })
    }

    pub fn db_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().join("metalayer.db"))
    }

    /// Open a second engine on the same database file.
    pub fn reopen(&self, config: EngineConfig) -> Result<OverlayEngine<SqliteStorage>, Box<dyn std::error::Error>> {
        let path = self.db_path().ok_or("platform is not file-backed")?;
        Ok(OverlayEngine::new(config, SqliteStorage::open(Path::new(&path))?)?)
    }

    /// Install a vendor definition from a JSON literal.
    pub fn install(
        &mut self,
        base_type: &str,
        base_name: &str,
        package_version: &str,
        document: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.engine.install_definition(
            base_type,
            base_name,
            Some("test-package"),
            Some(package_version),
            &doc(document),
        )
    }

    pub fn customize(
        &mut self,
        base_type: &str,
        base_name: &str,
        scope: OverlayScope,
        changes: serde_json::Value,
        actor: &str,
    ) -> Result<Overlay, Box<dyn std::error::Error>> {
        let patch = patch(changes)?;
        Ok(self
            .engine
            .customize(base_type, base_name, scope, &patch, actor, None)?)
    }

    /// Subscribe a recorder and return the shared list it appends to.
    pub fn record_events(&mut self) -> Arc<Mutex<Vec<OverlayEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        self.engine.subscribe(move |event| {
            sink.lock()
                .map_err(|_| "event recorder poisoned")?
                .push(event.clone());
            Ok(())
        });
        events
    }
}
