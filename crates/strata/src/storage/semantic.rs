//! Semantic tier on LanceDB
//!
//! A collection is one or more LanceDB tables (one per shard) sharing an
//! embedding dimension and a metadata schema. Each collection has a JSON
//! manifest next to the tables recording the dimension, provider id, schema
//! version and shard layout, so a provider change is detected on open.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::types::Float32Type;
use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Float64Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use dashmap::DashMap;
use futures::TryStreamExt;
use futures::future::join_all;
use lancedb::Table;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::SemanticConfig;
use crate::embedding::{EmbeddingProvider, check_vector, inner_product};
use crate::error::{Result, StrataError};
use crate::storage::filter::MetadataFilter;
use crate::storage::metadata::{
    CollectionManifest, CollectionSchema, MetadataValue, ScalarKind, ShardPolicy, escape_sql,
    is_identifier,
};

const MANIFEST_DIR: &str = "manifests";
/// Upper bound on rows requested from one table per query
const MAX_SEARCH_LIMIT: usize = 1 << 20;

/// One stored row
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticEntry {
    pub collection: String,
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// A row returned by a similarity query
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticHit {
    pub entry: SemanticEntry,
    /// Inner product with the query vector
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: usize,
    pub provider_id: String,
    pub schema_version: u32,
    pub generation: u32,
    pub shard_policy: ShardPolicy,
    pub shards: usize,
    pub entries: usize,
    pub needs_migration: Option<String>,
    pub needs_sharding: bool,
}

struct CollectionHandle {
    manifest: CollectionManifest,
    tables: HashMap<String, Table>,
    /// Reason the stored vectors cannot serve the active provider
    needs_migration: Option<String>,
}

pub struct SemanticStore {
    dir: PathBuf,
    connection: Connection,
    provider_id: String,
    dimension: usize,
    candidate_multiplier: usize,
    shard_threshold: usize,
    collections: DashMap<String, Arc<RwLock<CollectionHandle>>>,
}

impl SemanticStore {
    /// Connect to the semantic subtree and load every collection manifest
    pub async fn open(
        dir: &Path,
        provider_id: &str,
        dimension: usize,
        config: &SemanticConfig,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(dir.join(MANIFEST_DIR)).await?;
        let uri = dir
            .to_str()
            .ok_or_else(|| StrataError::Storage("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let store = Self {
            dir: dir.to_path_buf(),
            connection,
            provider_id: provider_id.to_string(),
            dimension,
            candidate_multiplier: config.candidate_multiplier.max(1),
            shard_threshold: config.shard_threshold,
            collections: DashMap::new(),
        };
        store.load_manifests().await?;
        Ok(store)
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        self.dir.join(MANIFEST_DIR).join(format!("{name}.json"))
    }

    async fn load_manifests(&self) -> Result<()> {
        let existing: Vec<String> = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to list tables: {e}")))?;

        let mut entries = tokio::fs::read_dir(self.dir.join(MANIFEST_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            let manifest: CollectionManifest = serde_json::from_slice(&raw).map_err(|e| {
                StrataError::Serialization(format!(
                    "Failed to parse manifest {}: {e}",
                    path.display()
                ))
            })?;

            let mut tables = HashMap::new();
            for (shard, table_name) in &manifest.shards {
                if !existing.contains(table_name) {
                    warn!(table = %table_name, "Manifest references a missing table");
                    continue;
                }
                let table = self
                    .connection
                    .open_table(table_name)
                    .execute()
                    .await
                    .map_err(|e| {
                        StrataError::Storage(format!("Failed to open table {table_name}: {e}"))
                    })?;
                tables.insert(shard.clone(), table);
            }

            let needs_migration = manifest.incompatibility(self.dimension, &self.provider_id);
            if let Some(reason) = &needs_migration {
                warn!(collection = %manifest.name, %reason, "Collection requires migration");
            }
            debug!(collection = %manifest.name, shards = tables.len(), "Loaded collection");
            self.collections.insert(
                manifest.name.clone(),
                Arc::new(RwLock::new(CollectionHandle {
                    manifest,
                    tables,
                    needs_migration,
                })),
            );
        }
        Ok(())
    }

    async fn save_manifest(&self, manifest: &CollectionManifest) -> Result<()> {
        let path = self.manifest_path(&manifest.name);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(manifest)
            .map_err(|e| StrataError::Serialization(format!("Failed to encode manifest: {e}")))?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Create the collection if it does not exist yet
    pub async fn ensure_collection(
        &self,
        name: &str,
        schema: CollectionSchema,
        shard_policy: ShardPolicy,
    ) -> Result<()> {
        if !is_identifier(name) {
            return Err(StrataError::Validation(format!(
                "Invalid collection name: {name}"
            )));
        }
        if self.collections.contains_key(name) {
            return Ok(());
        }
        if let Some(field) = shard_policy.field() {
            if schema.field(field).is_none() {
                return Err(StrataError::Validation(format!(
                    "Shard field {field} is not part of the schema"
                )));
            }
        }

        let manifest = CollectionManifest::new(
            name,
            self.dimension,
            &self.provider_id,
            schema,
            shard_policy,
        );
        self.save_manifest(&manifest).await?;
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(CollectionHandle {
                    manifest,
                    tables: HashMap::new(),
                    needs_migration: None,
                }))
            });
        info!(collection = name, "Created collection");
        Ok(())
    }

    fn handle(&self, name: &str) -> Result<Arc<RwLock<CollectionHandle>>> {
        self.collections
            .get(name)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| StrataError::NotFound(format!("collection {name}")))
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub async fn collection_schema(&self, name: &str) -> Result<CollectionSchema> {
        let handle = self.handle(name)?;
        let guard = handle.read().await;
        Ok(guard.manifest.schema.clone())
    }

    fn arrow_schema(manifest: &CollectionManifest) -> SchemaRef {
        let mut fields = vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    manifest.dimension as i32,
                ),
                false,
            ),
        ];
        for spec in &manifest.schema.fields {
            let data_type = match spec.kind {
                ScalarKind::String => DataType::Utf8,
                ScalarKind::Integer => DataType::Int64,
                ScalarKind::Float => DataType::Float64,
            };
            fields.push(Field::new(&spec.name, data_type, true));
        }
        Arc::new(Schema::new(fields))
    }

    fn entries_to_batch(
        manifest: &CollectionManifest,
        schema: SchemaRef,
        entries: &[&SemanticEntry],
    ) -> Result<RecordBatch> {
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let embeddings: Vec<Option<Vec<Option<f32>>>> = entries
            .iter()
            .map(|e| Some(e.embedding.iter().map(|&v| Some(v)).collect()))
            .collect();

        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(FixedSizeListArray::from_iter_primitive::<
                Float32Type,
                _,
                _,
            >(embeddings, manifest.dimension as i32)),
        ];

        for spec in &manifest.schema.fields {
            let column: ArrayRef = match spec.kind {
                ScalarKind::String => Arc::new(StringArray::from(
                    entries
                        .iter()
                        .map(|e| e.metadata.get(&spec.name).and_then(MetadataValue::as_str))
                        .collect::<Vec<Option<&str>>>(),
                )),
                ScalarKind::Integer => Arc::new(Int64Array::from(
                    entries
                        .iter()
                        .map(|e| e.metadata.get(&spec.name).and_then(MetadataValue::as_i64))
                        .collect::<Vec<Option<i64>>>(),
                )),
                ScalarKind::Float => Arc::new(Float64Array::from(
                    entries
                        .iter()
                        .map(|e| e.metadata.get(&spec.name).and_then(MetadataValue::as_f64))
                        .collect::<Vec<Option<f64>>>(),
                )),
            };
            columns.push(column);
        }

        RecordBatch::try_new(schema, columns)
            .map_err(|e| StrataError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    fn batch_to_entries(
        collection: &str,
        schema: &CollectionSchema,
        batch: &RecordBatch,
    ) -> Result<Vec<SemanticEntry>> {
        let ids = batch
            .column_by_name("id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| StrataError::Storage("Failed to get id column".to_string()))?;
        let embeddings = batch
            .column_by_name("embedding")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .ok_or_else(|| StrataError::Storage("Failed to get embedding column".to_string()))?;

        let mut entries = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let values = embeddings.value(row);
            let values = values
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| {
                    StrataError::Storage("Failed to get embedding values".to_string())
                })?;

            let mut metadata = BTreeMap::new();
            for spec in &schema.fields {
                let Some(column) = batch.column_by_name(&spec.name) else {
                    continue;
                };
                if column.is_null(row) {
                    continue;
                }
                let value = match spec.kind {
                    ScalarKind::String => column
                        .as_any()
                        .downcast_ref::<StringArray>()
                        .map(|a| MetadataValue::String(a.value(row).to_string())),
                    ScalarKind::Integer => column
                        .as_any()
                        .downcast_ref::<Int64Array>()
                        .map(|a| MetadataValue::Integer(a.value(row))),
                    ScalarKind::Float => column
                        .as_any()
                        .downcast_ref::<Float64Array>()
                        .map(|a| MetadataValue::Float(a.value(row))),
                };
                let value = value.ok_or_else(|| {
                    StrataError::Storage(format!("Failed to get {} column", spec.name))
                })?;
                metadata.insert(spec.name.clone(), value);
            }

            entries.push(SemanticEntry {
                collection: collection.to_string(),
                id: ids.value(row).to_string(),
                embedding: values.values().to_vec(),
                metadata,
            });
        }
        Ok(entries)
    }

    async fn create_table(&self, manifest: &CollectionManifest, table_name: &str) -> Result<Table> {
        let schema = Self::arrow_schema(manifest);
        let batch = RecordBatch::new_empty(schema.clone());
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.connection
            .create_table(table_name, Box::new(batches))
            .execute()
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to create table {table_name}: {e}")))
    }

    fn check_entry(&self, manifest: &CollectionManifest, entry: &SemanticEntry) -> Result<()> {
        if entry.id.is_empty() {
            return Err(StrataError::Validation("Entry id must not be empty".to_string()));
        }
        check_vector(&entry.embedding, manifest.dimension)?;
        manifest.schema.check(&entry.metadata)
    }

    /// Insert or replace an entry by id
    pub async fn upsert(
        &self,
        collection: &str,
        id: &str,
        embedding: Vec<f32>,
        metadata: BTreeMap<String, MetadataValue>,
    ) -> Result<String> {
        let entry = SemanticEntry {
            collection: collection.to_string(),
            id: id.to_string(),
            embedding,
            metadata,
        };
        self.upsert_batch(collection, std::slice::from_ref(&entry))
            .await?;
        Ok(entry.id)
    }

    /// Insert or replace many entries; all are validated before any is written
    pub async fn upsert_batch(&self, collection: &str, entries: &[SemanticEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let handle = self.handle(collection)?;

        let mut by_shard: BTreeMap<String, Vec<&SemanticEntry>> = BTreeMap::new();
        let missing_shards: Vec<String> = {
            let guard = handle.read().await;
            if let Some(reason) = &guard.needs_migration {
                return Err(StrataError::MigrationRequired {
                    collection: collection.to_string(),
                    reason: reason.clone(),
                });
            }
            for entry in entries {
                self.check_entry(&guard.manifest, entry)?;
                let key = guard.manifest.shard_policy.shard_key(&entry.metadata)?;
                by_shard.entry(key).or_default().push(entry);
            }
            by_shard
                .keys()
                .filter(|k| !guard.tables.contains_key(*k))
                .cloned()
                .collect()
        };

        if !missing_shards.is_empty() {
            let mut guard = handle.write().await;
            let mut changed = false;
            for key in missing_shards {
                if guard.tables.contains_key(&key) {
                    continue;
                }
                let table_name = guard.manifest.table_name(&key);
                let table = self.create_table(&guard.manifest, &table_name).await?;
                guard.tables.insert(key.clone(), table);
                guard.manifest.shards.insert(key, table_name);
                changed = true;
            }
            if changed {
                self.save_manifest(&guard.manifest).await?;
            }
        }

        let guard = handle.read().await;
        let schema = Self::arrow_schema(&guard.manifest);
        for (key, shard_entries) in &by_shard {
            let table = guard.tables.get(key).ok_or_else(|| {
                StrataError::Storage(format!("Shard {key} of {collection} disappeared"))
            })?;
            let batch = Self::entries_to_batch(&guard.manifest, schema.clone(), shard_entries)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema.clone());

            let mut merge = table.merge_insert(&["id"]);
            merge.when_matched_update_all(None).when_not_matched_insert_all();
            merge
                .execute(Box::new(batches))
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to upsert entries: {e}")))?;

            // A changed shard key must not leave a stale copy behind
            if guard.tables.len() > 1 {
                let ids = id_list(shard_entries.iter().map(|e| e.id.as_str()));
                for (other_key, other) in &guard.tables {
                    if other_key != key {
                        other.delete(&format!("id IN ({ids})")).await.map_err(|e| {
                            StrataError::Storage(format!("Failed to move entries: {e}"))
                        })?;
                    }
                }
            }
        }
        debug!(collection, count = entries.len(), "Upserted entries");
        Ok(())
    }

    /// Fetch one entry by id
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<SemanticEntry>> {
        let predicate = format!("id = '{}'", escape_sql(id));
        let mut rows = self.scan_where(collection, Some(predicate)).await?;
        Ok(rows.pop())
    }

    /// Fetch several entries of one collection; missing ids are skipped
    pub async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<SemanticEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let predicate = format!("id IN ({})", id_list(ids.iter().map(String::as_str)));
        self.scan_where(collection, Some(predicate)).await
    }

    /// Look an id up in every collection
    pub async fn find(&self, id: &str) -> Result<Option<SemanticEntry>> {
        for name in self.collection_names() {
            if let Some(entry) = self.get(&name, id).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Every entry of a collection matching `filter`
    pub async fn scan(
        &self,
        collection: &str,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SemanticEntry>> {
        if let Some(filter) = filter {
            filter.validate(&self.collection_schema(collection).await?)?;
        }
        let rows = self
            .scan_where(collection, filter.and_then(MetadataFilter::to_sql_clause))
            .await?;
        Ok(match filter {
            Some(filter) => rows
                .into_iter()
                .filter(|row| filter.matches(&row.metadata))
                .collect(),
            None => rows,
        })
    }

    async fn scan_where(
        &self,
        collection: &str,
        predicate: Option<String>,
    ) -> Result<Vec<SemanticEntry>> {
        let handle = self.handle(collection)?;
        let guard = handle.read().await;
        let mut rows = Vec::new();
        for table in guard.tables.values() {
            let mut query = table.query();
            if let Some(predicate) = &predicate {
                query = query.only_if(predicate.clone());
            }
            let stream = query
                .execute()
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to scan {collection}: {e}")))?;
            let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(|e| {
                StrataError::Storage(format!("Failed to collect scan results: {e}"))
            })?;
            for batch in &batches {
                rows.extend(Self::batch_to_entries(
                    collection,
                    &guard.manifest.schema,
                    batch,
                )?);
            }
        }
        Ok(rows)
    }

    /// Ranked similarity search, fanned out across shards and merged
    pub async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<SemanticHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let handle = self.handle(collection)?;
        let guard = handle.read().await;
        if let Some(reason) = &guard.needs_migration {
            return Err(StrataError::MigrationRequired {
                collection: collection.to_string(),
                reason: reason.clone(),
            });
        }
        check_vector(embedding, guard.manifest.dimension)?;
        if let Some(filter) = filter {
            filter.validate(&guard.manifest.schema)?;
        }
        let sql = filter.and_then(MetadataFilter::to_sql_clause);
        let limit = k
            .saturating_mul(self.candidate_multiplier)
            .min(MAX_SEARCH_LIMIT);

        let searches = guard.tables.values().map(|table| {
            search_table(
                table.clone(),
                collection,
                &guard.manifest.schema,
                embedding,
                sql.clone(),
                limit,
            )
        });
        let mut hits = Vec::new();
        for result in join_all(searches).await {
            for entry in result? {
                if filter.is_some_and(|f| !f.matches(&entry.metadata)) {
                    continue;
                }
                let similarity = inner_product(embedding, &entry.embedding);
                hits.push(SemanticHit { entry, similarity });
            }
        }

        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Apply SQL column updates to one entry (counters, cached scores, links)
    pub async fn update_columns(
        &self,
        collection: &str,
        id: &str,
        columns: &[(&str, String)],
    ) -> Result<bool> {
        let handle = self.handle(collection)?;
        let guard = handle.read().await;
        for (name, _) in columns {
            if guard.manifest.schema.field(name).is_none() {
                return Err(StrataError::Validation(format!(
                    "Unknown metadata field: {name}"
                )));
            }
        }
        let predicate = format!("id = '{}'", escape_sql(id));
        let mut updated = false;
        for table in guard.tables.values() {
            let mut update = table.update().only_if(predicate.clone());
            for (name, expr) in columns {
                update = update.column(*name, expr.clone());
            }
            let result = update
                .execute()
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to update entry: {e}")))?;
            updated |= result.rows_updated > 0;
        }
        Ok(updated)
    }

    /// Physically remove an entry; returns whether it existed
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let existed = self.get(collection, id).await?.is_some();
        if existed {
            let handle = self.handle(collection)?;
            let guard = handle.read().await;
            let predicate = format!("id = '{}'", escape_sql(id));
            for table in guard.tables.values() {
                table
                    .delete(&predicate)
                    .await
                    .map_err(|e| StrataError::Storage(format!("Failed to delete entry: {e}")))?;
            }
        }
        Ok(existed)
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        let handle = self.handle(collection)?;
        let guard = handle.read().await;
        let mut total = 0;
        for table in guard.tables.values() {
            total += table
                .count_rows(None)
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to count rows: {e}")))?;
        }
        Ok(total)
    }

    pub async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        let entries = self.count(name).await?;
        let handle = self.handle(name)?;
        let guard = handle.read().await;
        let manifest = &guard.manifest;
        Ok(CollectionInfo {
            name: manifest.name.clone(),
            dimension: manifest.dimension,
            provider_id: manifest.provider_id.clone(),
            schema_version: manifest.schema_version,
            generation: manifest.generation,
            shard_policy: manifest.shard_policy.clone(),
            shards: guard.tables.len(),
            entries,
            needs_migration: guard.needs_migration.clone(),
            needs_sharding: manifest.shard_policy == ShardPolicy::None
                && entries > self.shard_threshold,
        })
    }

    pub async fn needs_migration(&self, name: &str) -> Result<Option<String>> {
        let handle = self.handle(name)?;
        let guard = handle.read().await;
        Ok(guard.needs_migration.clone())
    }

    /// Re-embed every entry with `provider` into a fresh generation of tables.
    /// `content_field` names the metadata field holding the source text.
    pub async fn migrate_collection(
        &self,
        name: &str,
        provider: &dyn EmbeddingProvider,
        content_field: &str,
    ) -> Result<usize> {
        let handle = self.handle(name)?;
        let mut guard = handle.write().await;
        let rows = self.read_all(name, &guard).await?;

        let mut migrated = Vec::with_capacity(rows.len());
        for mut row in rows {
            let content = row
                .metadata
                .get(content_field)
                .and_then(MetadataValue::as_str)
                .ok_or_else(|| {
                    StrataError::Validation(format!(
                        "Entry {} has no {content_field} to re-embed",
                        row.id
                    ))
                })?;
            row.embedding = provider.embed(content)?;
            migrated.push(row);
        }

        let mut manifest = guard.manifest.clone();
        manifest.dimension = provider.dimension();
        manifest.provider_id = provider.provider_id().to_string();
        manifest.schema_version = crate::storage::metadata::SCHEMA_VERSION;
        let count = self.rewrite(&mut guard, manifest, &migrated).await?;
        info!(collection = name, entries = count, "Migrated collection");
        Ok(count)
    }

    /// Redistribute a collection under a new shard policy
    pub async fn reshard(&self, name: &str, policy: ShardPolicy) -> Result<usize> {
        let handle = self.handle(name)?;
        let mut guard = handle.write().await;
        if let Some(field) = policy.field() {
            if guard.manifest.schema.field(field).is_none() {
                return Err(StrataError::Validation(format!(
                    "Shard field {field} is not part of the schema"
                )));
            }
        }
        if let Some(reason) = &guard.needs_migration {
            return Err(StrataError::MigrationRequired {
                collection: name.to_string(),
                reason: reason.clone(),
            });
        }
        let rows = self.read_all(name, &guard).await?;
        let mut manifest = guard.manifest.clone();
        manifest.shard_policy = policy;
        let count = self.rewrite(&mut guard, manifest, &rows).await?;
        info!(collection = name, entries = count, shards = guard.tables.len(), "Resharded collection");
        Ok(count)
    }

    async fn read_all(&self, name: &str, handle: &CollectionHandle) -> Result<Vec<SemanticEntry>> {
        let mut rows = Vec::new();
        for table in handle.tables.values() {
            let batches: Vec<RecordBatch> = table
                .query()
                .execute()
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to read {name}: {e}")))?
                .try_collect()
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to read {name}: {e}")))?;
            for batch in &batches {
                rows.extend(Self::batch_to_entries(name, &handle.manifest.schema, batch)?);
            }
        }
        Ok(rows)
    }

    /// Write `rows` into a new table generation, swap the manifest, drop old tables
    async fn rewrite(
        &self,
        handle: &mut CollectionHandle,
        mut manifest: CollectionManifest,
        rows: &[SemanticEntry],
    ) -> Result<usize> {
        manifest.generation += 1;
        manifest.shards.clear();

        let mut by_shard: BTreeMap<String, Vec<&SemanticEntry>> = BTreeMap::new();
        for row in rows {
            check_vector(&row.embedding, manifest.dimension)?;
            let key = manifest.shard_policy.shard_key(&row.metadata)?;
            by_shard.entry(key).or_default().push(row);
        }

        let schema = Self::arrow_schema(&manifest);
        let mut tables = HashMap::new();
        for (key, shard_rows) in &by_shard {
            let table_name = manifest.table_name(key);
            let table = self.create_table(&manifest, &table_name).await?;
            let batch = Self::entries_to_batch(&manifest, schema.clone(), shard_rows)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema.clone());
            table
                .add(Box::new(batches))
                .execute()
                .await
                .map_err(|e| StrataError::Storage(format!("Failed to write {table_name}: {e}")))?;
            manifest.shards.insert(key.clone(), table_name);
            tables.insert(key.clone(), table);
        }

        self.save_manifest(&manifest).await?;

        let old_tables: Vec<String> = handle.manifest.shards.values().cloned().collect();
        handle.manifest = manifest;
        handle.tables = tables;
        handle.needs_migration = None;

        for table_name in old_tables {
            let path = self.dir.join(format!("{table_name}.lance"));
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(table = %table_name, error = %e, "Failed to remove old table"),
            }
        }
        Ok(rows.len())
    }
}

async fn search_table(
    table: Table,
    collection: &str,
    schema: &CollectionSchema,
    embedding: &[f32],
    sql: Option<String>,
    limit: usize,
) -> Result<Vec<SemanticEntry>> {
    let rows = table
        .count_rows(None)
        .await
        .map_err(|e| StrataError::Storage(format!("Failed to count rows: {e}")))?;
    if rows == 0 {
        return Ok(Vec::new());
    }

    let mut query = table
        .query()
        .nearest_to(embedding)
        .map_err(|e| StrataError::Storage(format!("Failed to create vector query: {e}")))?
        .limit(limit);
    if let Some(sql) = sql {
        query = query.only_if(sql);
    }

    let stream = query
        .execute()
        .await
        .map_err(|e| StrataError::Storage(format!("Failed to execute search: {e}")))?;
    let batches: Vec<RecordBatch> = stream
        .try_collect()
        .await
        .map_err(|e| StrataError::Storage(format!("Failed to collect search results: {e}")))?;

    let mut entries = Vec::new();
    for batch in &batches {
        entries.extend(SemanticStore::batch_to_entries(collection, schema, batch)?);
    }
    Ok(entries)
}

/// Highest similarity first; ties broken by id for a stable order
pub fn sort_hits(hits: &mut [SemanticHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
}

fn id_list<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    ids.map(|id| format!("'{}'", escape_sql(id)))
        .collect::<Vec<_>>()
        .join(", ")
}
