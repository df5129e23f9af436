//! Where sector files live. The scheduler only reads this through
//! [`SectorIndex`]; locality-aware selectors use it to find workers that
//! already hold a sector or can allocate space for a new one.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, SchedError};
use crate::sector::{PathType, SectorFileType, SectorId};

pub type StorageId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub id: StorageId,
    pub weight: u64,
    pub can_seal: bool,
    pub can_store: bool,
    /// Free bytes.
    pub available: u64,
}

/// A storage path that holds (weight > 0) or could fetch (weight 0) a sector file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorStorageInfo {
    pub id: StorageId,
    pub weight: u64,
    pub can_seal: bool,
    pub can_store: bool,
}

#[async_trait]
pub trait SectorIndex: Send + Sync {
    /// Storage paths holding `file_type` of `sector`. With `allow_fetch` the
    /// sealing paths able to receive a copy are listed too, with weight 0.
    async fn storage_find_sector(
        &self,
        sector: SectorId,
        file_type: SectorFileType,
        sector_size: u64,
        allow_fetch: bool,
    ) -> Result<Vec<SectorStorageInfo>>;

    /// Paths a new file could be allocated in, best first.
    async fn storage_best_alloc(
        &self,
        file_type: SectorFileType,
        sector_size: u64,
        path_type: PathType,
    ) -> Result<Vec<StorageInfo>>;
}

/// Index kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    storages: RwLock<HashMap<StorageId, StorageInfo>>,
    sectors: RwLock<HashMap<(SectorId, SectorFileType), Vec<StorageId>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, info: StorageInfo) {
        tracing::debug!(storage = %info.id, "Storage attached to index");
        self.storages.write().await.insert(info.id.clone(), info);
    }

    pub async fn declare_sector(
        &self,
        storage: &str,
        sector: SectorId,
        file_type: SectorFileType,
    ) -> Result<()> {
        if !self.storages.read().await.contains_key(storage) {
            return Err(SchedError::Index(format!("storage {} not attached", storage)));
        }
        let mut sectors = self.sectors.write().await;
        let holders = sectors.entry((sector, file_type)).or_default();
        if !holders.iter().any(|id| id == storage) {
            holders.push(storage.to_string());
        }
        Ok(())
    }

    pub async fn drop_sector(&self, storage: &str, sector: SectorId, file_type: SectorFileType) {
        let mut sectors = self.sectors.write().await;
        if let Some(holders) = sectors.get_mut(&(sector, file_type)) {
            holders.retain(|id| id != storage);
            if holders.is_empty() {
                sectors.remove(&(sector, file_type));
            }
        }
    }
}

#[async_trait]
impl SectorIndex for MemoryIndex {
    async fn storage_find_sector(
        &self,
        sector: SectorId,
        file_type: SectorFileType,
        sector_size: u64,
        allow_fetch: bool,
    ) -> Result<Vec<SectorStorageInfo>> {
        let storages = self.storages.read().await;
        let sectors = self.sectors.read().await;

        let holders = sectors.get(&(sector, file_type)).cloned().unwrap_or_default();
        let mut out: Vec<SectorStorageInfo> = holders
            .iter()
            .filter_map(|id| storages.get(id))
            .map(|info| SectorStorageInfo {
                id: info.id.clone(),
                weight: info.weight.max(1),
                can_seal: info.can_seal,
                can_store: info.can_store,
            })
            .collect();

        if allow_fetch {
            let mut fetch_targets: Vec<&StorageInfo> = storages
                .values()
                .filter(|info| info.can_seal && info.available >= sector_size)
                .filter(|info| !holders.contains(&info.id))
                .collect();
            fetch_targets.sort_by(|a, b| a.id.cmp(&b.id));
            out.extend(fetch_targets.into_iter().map(|info| SectorStorageInfo {
                id: info.id.clone(),
                weight: 0,
                can_seal: info.can_seal,
                can_store: info.can_store,
            }));
        }

        Ok(out)
    }

    async fn storage_best_alloc(
        &self,
        _file_type: SectorFileType,
        sector_size: u64,
        path_type: PathType,
    ) -> Result<Vec<StorageInfo>> {
        let storages = self.storages.read().await;
        let mut candidates: Vec<StorageInfo> = storages
            .values()
            .filter(|info| match path_type {
                PathType::Sealing => info.can_seal,
                PathType::Storage => info.can_store,
            })
            .filter(|info| info.available >= sector_size)
            .cloned()
            .collect();

        candidates.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(id: &str, weight: u64, can_seal: bool, can_store: bool) -> StorageInfo {
        StorageInfo {
            id: id.to_string(),
            weight,
            can_seal,
            can_store,
            available: 1 << 40,
        }
    }

    #[tokio::test]
    async fn find_sector_lists_holders() {
        let index = MemoryIndex::new();
        index.attach(storage("seal-a", 10, true, false)).await;
        index.attach(storage("seal-b", 10, true, false)).await;

        let sector = SectorId::new(1000, 1);
        index
            .declare_sector("seal-a", sector, SectorFileType::Unsealed)
            .await
            .unwrap();

        let found = index
            .storage_find_sector(sector, SectorFileType::Unsealed, 2048, false)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "seal-a");
        assert!(found[0].weight > 0);

        let with_fetch = index
            .storage_find_sector(sector, SectorFileType::Unsealed, 2048, true)
            .await
            .unwrap();
        assert_eq!(with_fetch.len(), 2);
        assert_eq!(with_fetch[1].id, "seal-b");
        assert_eq!(with_fetch[1].weight, 0);
    }

    #[tokio::test]
    async fn declare_on_unknown_storage_fails() {
        let index = MemoryIndex::new();
        let err = index
            .declare_sector("missing", SectorId::new(1, 1), SectorFileType::Sealed)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Index(_)));
    }

    #[tokio::test]
    async fn drop_sector_forgets_holder() {
        let index = MemoryIndex::new();
        index.attach(storage("seal-a", 10, true, false)).await;
        let sector = SectorId::new(1000, 2);
        index
            .declare_sector("seal-a", sector, SectorFileType::Cache)
            .await
            .unwrap();
        index.drop_sector("seal-a", sector, SectorFileType::Cache).await;

        let found = index
            .storage_find_sector(sector, SectorFileType::Cache, 2048, false)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn best_alloc_filters_by_path_type_and_orders_by_weight() {
        let index = MemoryIndex::new();
        index.attach(storage("seal-low", 1, true, false)).await;
        index.attach(storage("seal-high", 5, true, false)).await;
        index.attach(storage("store", 9, false, true)).await;

        let sealing = index
            .storage_best_alloc(SectorFileType::Cache, 2048, PathType::Sealing)
            .await
            .unwrap();
        let ids: Vec<_> = sealing.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["seal-high", "seal-low"]);

        let storing = index
            .storage_best_alloc(SectorFileType::Sealed, 2048, PathType::Storage)
            .await
            .unwrap();
        assert_eq!(storing.len(), 1);
        assert_eq!(storing[0].id, "store");
    }
}
