use std::collections::HashMap;
use std::sync::Mutex;

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};
use crate::pipeline::schema::SchemaDoc;

const SCHEMA_ENV_MAP_SIZE_BYTES: usize = 1 << 26; // 64 MiB

#[derive(Debug, Error)]
pub enum SchemaStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Registry of caller-supplied JSON Schema documents, addressed by id.
pub trait SchemaStore: Send + Sync {
    fn put(&self, doc: &SchemaDoc) -> Result<(), SchemaStoreError>;

    fn get(&self, id: &str) -> Result<Option<SchemaDoc>, SchemaStoreError>;

    fn list(&self) -> Result<Vec<SchemaDoc>, SchemaStoreError>;
}

#[derive(Debug)]
pub struct LmdbSchemaStore {
    env: Env,
    schemas: Database<Str, Bytes>,
}

impl LmdbSchemaStore {
    pub fn open(paths: &AppPaths) -> Result<Self, SchemaStoreError> {
        let path = paths.schemas_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(SCHEMA_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let schemas = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some("schemas"))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("schemas"))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, schemas })
    }
}

impl SchemaStore for LmdbSchemaStore {
    fn put(&self, doc: &SchemaDoc) -> Result<(), SchemaStoreError> {
        debug_assert!(!doc.id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(doc, config::standard())?;
        self.schemas
            .put(&mut wtxn, doc.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<SchemaDoc>, SchemaStoreError> {
        let rtxn = self.env.read_txn()?;
        let value = self.schemas.get(&rtxn, id)?;
        if let Some(raw) = value {
            let (doc, _) = decode_from_slice::<SchemaDoc, _>(raw, config::standard())?;
            Ok(Some(doc))
        } else {
            Ok(None)
        }
    }

    fn list(&self) -> Result<Vec<SchemaDoc>, SchemaStoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.schemas.iter(&rtxn)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (doc, _) = decode_from_slice::<SchemaDoc, _>(raw, config::standard())?;
            out.push(doc);
        }
        Ok(out)
    }
}

/// In-memory registry for tests.
#[derive(Debug, Default)]
pub struct MemorySchemaStore {
    schemas: Mutex<HashMap<String, SchemaDoc>>,
}

impl MemorySchemaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaStore for MemorySchemaStore {
    fn put(&self, doc: &SchemaDoc) -> Result<(), SchemaStoreError> {
        let mut schemas = self.schemas.lock().expect("schema map lock");
        schemas.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<SchemaDoc>, SchemaStoreError> {
        let schemas = self.schemas.lock().expect("schema map lock");
        Ok(schemas.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<SchemaDoc>, SchemaStoreError> {
        let schemas = self.schemas.lock().expect("schema map lock");
        Ok(schemas.values().cloned().collect())
    }
}
