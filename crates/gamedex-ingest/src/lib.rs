//! One-shot batch ingestion: load the source row sets, assemble one
//! canonical document per product, and insert into the games collection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use gamedex_adapters::{load_keyed_table, AdapterError, DocumentAssembler, KeyedTable};
use gamedex_core::{catalog_schema, PRIMARY_KEY};
use gamedex_store::{Schema, SharedCatalog, StoreError};

pub const CRATE_NAME: &str = "gamedex-ingest";

/// Name of the canonical collection in the catalog.
pub const GAMES_COLLECTION: &str = "games";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Primary,
    Descriptions,
    Requirements,
    Media,
    Support,
    TagWeights,
}

impl SourceRole {
    /// Column carrying the product identifier in this source.
    pub fn key_column(self) -> &'static str {
        match self {
            SourceRole::Primary | SourceRole::TagWeights => "appid",
            _ => "steam_appid",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub role: SourceRole,
    pub path: PathBuf,
}

impl SourceRegistry {
    /// Conventional file layout used when no registry file is present.
    pub fn default_layout() -> Self {
        let entry = |source_id: &str, role: SourceRole, path: &str| SourceConfig {
            source_id: source_id.to_string(),
            role,
            path: PathBuf::from(path),
        };
        Self {
            sources: vec![
                entry("steam", SourceRole::Primary, "steam.csv"),
                entry(
                    "steam-descriptions",
                    SourceRole::Descriptions,
                    "steam_description_data.csv",
                ),
                entry(
                    "steam-requirements",
                    SourceRole::Requirements,
                    "steam_requirements_data.csv",
                ),
                entry("steam-media", SourceRole::Media, "steam_media_data.csv"),
                entry("steam-support", SourceRole::Support, "steam_support_info.csv"),
                entry("steamspy-tags", SourceRole::TagWeights, "steamspy_tag_data.csv"),
            ],
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn source(&self, role: SourceRole) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.role == role)
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub registry_path: Option<PathBuf>,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("GAMEDEX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            registry_path: std::env::var("GAMEDEX_SOURCES").ok().map(PathBuf::from),
        }
    }
}

/// Outcome of one batch run; every skip or rejection is counted so no
/// failure is silent.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub products_seen: usize,
    pub inserted: usize,
    pub missing_description: usize,
    pub schema_rejected: usize,
    pub already_initialized: bool,
}

pub struct IngestPipeline {
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    fn load_registry(&self) -> Result<SourceRegistry> {
        if let Some(path) = &self.config.registry_path {
            return SourceRegistry::load(path);
        }
        let conventional = self.config.data_dir.join("sources.yaml");
        if conventional.exists() {
            return SourceRegistry::load(&conventional);
        }
        Ok(SourceRegistry::default_layout())
    }

    fn table_for(&self, registry: &SourceRegistry, role: SourceRole) -> Result<KeyedTable> {
        let source = registry
            .source(role)
            .with_context(|| format!("source registry has no {role:?} entry"))?;
        let path = if source.path.is_absolute() {
            source.path.clone()
        } else {
            self.config.data_dir.join(&source.path)
        };
        Ok(load_keyed_table(&source.source_id, &path, role.key_column())?)
    }

    /// Runs the batch load once. Sources are read fully into memory
    /// before assembly; documents are assembled and inserted one at a
    /// time in primary-source row order. Re-running against an
    /// already-initialized catalog is a benign no-op. The collection is
    /// created only after every source has loaded, so an aborted run
    /// leaves the catalog uninitialized and retryable.
    pub fn run_once(&self, catalog: &SharedCatalog) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let already_initialized = IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            products_seen: 0,
            inserted: 0,
            missing_description: 0,
            schema_rejected: 0,
            already_initialized: true,
        };
        if catalog.read().collection(GAMES_COLLECTION).is_ok() {
            warn!(collection = GAMES_COLLECTION, "catalog already initialized; skipping batch load");
            return Ok(already_initialized);
        }

        let registry = self.load_registry()?;
        let primary = self.table_for(&registry, SourceRole::Primary)?;
        let descriptions = self.table_for(&registry, SourceRole::Descriptions)?;
        let requirements = self.table_for(&registry, SourceRole::Requirements)?;
        let media = self.table_for(&registry, SourceRole::Media)?;
        let support = self.table_for(&registry, SourceRole::Support)?;
        let tag_weights = self.table_for(&registry, SourceRole::TagWeights)?;
        info!(rows = tag_weights.len(), "loaded tag-weight source (not joined)");

        match catalog
            .write()
            .create_collection(GAMES_COLLECTION, Schema::new(PRIMARY_KEY, catalog_schema()))
        {
            Ok(()) => {}
            Err(StoreError::DuplicateCollection(name)) => {
                warn!(collection = %name, "catalog initialized concurrently; skipping batch load");
                return Ok(already_initialized);
            }
            Err(err) => return Err(err.into()),
        }

        let assembler = DocumentAssembler::new(descriptions, requirements, media, support);

        let mut summary = IngestSummary {
            run_id,
            started_at,
            finished_at: started_at,
            products_seen: 0,
            inserted: 0,
            missing_description: 0,
            schema_rejected: 0,
            already_initialized: false,
        };

        let mut guard = catalog.write();
        let games = guard.collection_mut(GAMES_COLLECTION)?;
        for (appid, row) in primary.iter() {
            summary.products_seen += 1;
            let document = match assembler.assemble(appid, row) {
                Ok(doc) => doc,
                Err(AdapterError::MissingJoin { appid, source_id }) => {
                    warn!(appid, source_id = %source_id, "missing mandatory description join; product skipped");
                    summary.missing_description += 1;
                    continue;
                }
                Err(err @ AdapterError::SourceUnavailable { .. }) => return Err(err.into()),
            };
            match games.insert(document.into_document()) {
                Ok(()) => summary.inserted += 1,
                Err(err @ (StoreError::SchemaViolation { .. } | StoreError::DuplicateKey(_))) => {
                    warn!(appid, %err, "document rejected at insert; skipped");
                    summary.schema_rejected += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
        drop(guard);

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            products_seen = summary.products_seen,
            inserted = summary.inserted,
            missing_description = summary.missing_description,
            schema_rejected = summary.schema_rejected,
            "batch ingestion complete"
        );
        Ok(summary)
    }
}

/// Composition-root convenience: config from the environment, one run.
pub fn run_ingest_from_env(catalog: &SharedCatalog) -> Result<IngestSummary> {
    IngestPipeline::new(IngestConfig::from_env()).run_once(catalog)
}
