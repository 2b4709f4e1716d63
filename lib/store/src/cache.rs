//! Token-lookup cache on sled.
//!
//! Maps `t:<token>` to the JSON-encoded [`IngestCacheEntry`] so the ingest
//! middleware can skip the relational store on the hot path. Coherence is
//! by explicit invalidation: every admin mutation of an ingest config or
//! token deletes the affected entries before returning.

use std::path::Path;

use anyhow::Result;

use vsentry_common::IngestCacheEntry;

pub struct TokenCache {
    db: sled::Db,
}

impl TokenCache {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory cache backed by a scratch file, for isolated test
    /// pipelines.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn get(&self, token: &str) -> Result<Option<IngestCacheEntry>> {
        match self.db.get(key(token))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, token: &str, entry: &IngestCacheEntry) -> Result<()> {
        self.db.insert(key(token), serde_json::to_vec(entry)?)?;
        Ok(())
    }

    pub fn del(&self, token: &str) -> Result<()> {
        self.db.remove(key(token))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn key(token: &str) -> Vec<u8> {
    format!("t:{token}").into_bytes()
}
