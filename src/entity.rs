//! Generic entity persistence shared by every entity class: payload rows,
//! soft/force delete, paginated listing, best-effort cascades.

use std::sync::Arc;

use tracing::warn;

use crate::cache::CacheProvider;
use crate::error::{Result, StoreError};
use crate::keys::{EntityClass, KeyBuilder};
use crate::kv::{KeyValueStore, Row, Table};
use crate::marshal::{JsonMarshaler, PayloadMarshaler};
use crate::model::StoredEntity;
use crate::registry::TokenRegistry;

/// Serialized entity payload.
pub const PAYLOAD_COLUMN: &str = "payload";
/// One-byte soft-delete marker; present and 0x01 on deleted rows.
pub const DELETED_COLUMN: &str = "deleted";

#[derive(Debug, Clone, Copy)]
pub struct SearchCriteria {
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
}

impl SearchCriteria {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }

    /// Everything on one page.
    pub fn all() -> Self {
        Self {
            page: 1,
            page_size: usize::MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResults<T> {
    pub results: Vec<T>,
    /// Total matches across all pages, after filtering.
    pub total: usize,
}

/// Accumulates one page out of a filtered stream while counting every match.
pub struct Pager<T> {
    to_skip: usize,
    page_size: usize,
    total: usize,
    results: Vec<T>,
}

impl<T> Pager<T> {
    pub fn new(criteria: SearchCriteria) -> Self {
        let page = criteria.page.max(1);
        Self {
            to_skip: criteria.page_size.saturating_mul(page - 1),
            page_size: criteria.page_size,
            total: 0,
            results: Vec::new(),
        }
    }

    /// Offer one matching item; returns whether it landed on the page.
    pub fn process(&mut self, item: T) -> bool {
        self.total += 1;
        if self.to_skip > 0 {
            self.to_skip -= 1;
            return false;
        }
        if self.results.len() >= self.page_size {
            return false;
        }
        self.results.push(item);
        true
    }

    pub fn into_results(self) -> SearchResults<T> {
        SearchResults {
            results: self.results,
            total: self.total,
        }
    }
}

/// Result of a best-effort cascading delete. The sweep never stops on a
/// per-row failure; callers decide whether a partial cascade is acceptable.
#[derive(Debug, Default)]
pub struct CascadeOutcome {
    pub deleted: usize,
    pub failed: Vec<(Vec<u8>, StoreError)>,
}

impl CascadeOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CascadeOutcome) {
        self.deleted += other.deleted;
        self.failed.extend(other.failed);
    }
}

/// Shared handle the per-entity modules operate through.
pub struct Context<M: PayloadMarshaler = JsonMarshaler> {
    pub store: Arc<dyn KeyValueStore>,
    pub registry: TokenRegistry,
    pub marshaler: M,
    pub cache: Option<Arc<dyn CacheProvider>>,
}

impl<M: PayloadMarshaler> Context<M> {
    /// Serialize and write an entity's payload row, merging any extra
    /// columns. Cache population is best-effort.
    pub fn write_entity<T: StoredEntity>(
        &self,
        class: EntityClass,
        row_key: &[u8],
        entity: &T,
        extra: Row,
    ) -> Result<()> {
        let payload = self.marshaler.serialize(entity)?;
        let mut columns = extra;
        columns.insert(PAYLOAD_COLUMN.to_string(), payload.clone());
        self.store.put(Table::Entities, row_key, columns)?;
        if let Some(cache) = &self.cache {
            cache.put(class, entity.token(), payload);
        }
        Ok(())
    }

    /// Deserialize a row's payload column. Rows without a payload are
    /// skipped (scan bounds can include marker-only rows).
    pub fn read_row<T: serde::de::DeserializeOwned>(&self, row: &Row) -> Result<Option<T>> {
        match row.get(PAYLOAD_COLUMN) {
            Some(bytes) => Ok(Some(self.marshaler.deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Row key of an entity's primary record, resolved through the registry.
    pub fn primary_key(&self, class: EntityClass, token: &str) -> Result<Option<Vec<u8>>> {
        let Some(value) = self.registry.get_value(class, token)? else {
            return Ok(None);
        };
        Ok(Some(KeyBuilder::for_class(class).primary_key(&value)))
    }

    /// Load an entity by token, deleted or not. Cache hit avoids the store
    /// read entirely.
    pub fn load_entity<T: StoredEntity>(
        &self,
        class: EntityClass,
        token: &str,
    ) -> Result<Option<T>> {
        if let Some(cache) = &self.cache {
            if let Some(payload) = cache.get(class, token) {
                return Ok(Some(self.marshaler.deserialize(&payload)?));
            }
        }
        let Some(key) = self.primary_key(class, token)? else {
            return Ok(None);
        };
        let Some(row) = self.store.get(Table::Entities, &key)? else {
            return Ok(None);
        };
        let entity = self.read_row::<T>(&row)?;
        if let (Some(cache), Some(bytes)) = (&self.cache, row.get(PAYLOAD_COLUMN)) {
            if entity.is_some() {
                cache.put(class, token, bytes.clone());
            }
        }
        Ok(entity)
    }

    /// Load an entity, skipping soft-deleted rows.
    pub fn load_active<T: StoredEntity>(
        &self,
        class: EntityClass,
        token: &str,
    ) -> Result<Option<T>> {
        Ok(self
            .load_entity::<T>(class, token)?
            .filter(|entity| !entity.meta().deleted))
    }

    /// Rewrite an entity in place, refreshing its audit metadata.
    pub fn update_entity<T: StoredEntity>(
        &self,
        class: EntityClass,
        row_key: &[u8],
        entity: &mut T,
        updated_by: &str,
        extra: Row,
    ) -> Result<()> {
        entity.meta_mut().touch(updated_by);
        self.write_entity(class, row_key, entity, extra)
    }

    /// Soft delete: mark the `deleted` column and rewrite the payload with
    /// deletion recorded in the audit metadata. Repeating the delete leaves
    /// the entity unchanged apart from a refreshed audit timestamp. Returns
    /// the rewritten entity, or `None` for an unknown token.
    pub fn soft_delete<T: StoredEntity>(
        &self,
        class: EntityClass,
        token: &str,
        deleted_by: &str,
    ) -> Result<Option<T>> {
        let Some(key) = self.primary_key(class, token)? else {
            return Ok(None);
        };
        let Some(row) = self.store.get(Table::Entities, &key)? else {
            return Ok(None);
        };
        let Some(mut entity) = self.read_row::<T>(&row)? else {
            return Ok(None);
        };
        entity.meta_mut().deleted = true;
        entity.meta_mut().touch(deleted_by);
        let marker = Row::from([(DELETED_COLUMN.to_string(), vec![0x01])]);
        self.write_entity(class, &key, &entity, marker)?;
        Ok(Some(entity))
    }

    /// Force delete: remove the primary row and release the token. The
    /// caller is responsible for cascading child rows first.
    pub fn force_delete(&self, class: EntityClass, token: &str) -> Result<()> {
        if let Some(key) = self.primary_key(class, token)? {
            self.store.delete(Table::Entities, &key)?;
        }
        self.registry.delete(class, token)?;
        if let Some(cache) = &self.cache {
            cache.invalidate(class, token);
        }
        Ok(())
    }

    /// Paginated scan over a class's primary rows in key order.
    pub fn list_primary<T, F>(
        &self,
        class: EntityClass,
        criteria: SearchCriteria,
        include_deleted: bool,
        mut filter: F,
    ) -> Result<SearchResults<T>>
    where
        T: StoredEntity,
        F: FnMut(&T) -> bool,
    {
        let builder = KeyBuilder::for_class(class);
        let Some((start, stop)) = builder.class_scan_bounds() else {
            return Ok(SearchResults {
                results: Vec::new(),
                total: 0,
            });
        };
        let mut pager = Pager::new(criteria);
        for (key, row) in self.store.scan(Table::Entities, &start, &stop)? {
            if !builder.is_primary_key(&key) {
                continue;
            }
            if !include_deleted && row.contains_key(DELETED_COLUMN) {
                continue;
            }
            let Some(entity) = self.read_row::<T>(&row)? else {
                continue;
            };
            if filter(&entity) {
                pager.process(entity);
            }
        }
        Ok(pager.into_results())
    }

    /// Delete every row in `[start, stop)`, continuing past failures.
    pub fn cascade_delete_range(&self, start: &[u8], stop: &[u8]) -> Result<CascadeOutcome> {
        let mut outcome = CascadeOutcome::default();
        for (key, _) in self.store.scan(Table::Entities, start, stop)? {
            match self.store.delete(Table::Entities, &key) {
                Ok(()) => outcome.deleted += 1,
                Err(err) => {
                    warn!(error = %err, "cascade delete failed for row, continuing");
                    outcome.failed.push((key, err));
                }
            }
        }
        Ok(outcome)
    }

    /// Invalidate a cached entry after an out-of-band column change.
    pub fn invalidate_cache(&self, class: EntityClass, token: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(class, token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pager_counts_all_matches_but_keeps_one_page() {
        let mut pager = Pager::new(SearchCriteria::new(2, 3));
        for i in 0..10 {
            pager.process(i);
        }
        let results = pager.into_results();
        assert_eq!(results.total, 10);
        assert_eq!(results.results, vec![3, 4, 5]);
    }

    #[test]
    fn pager_page_beyond_end_is_empty_with_total() {
        let mut pager = Pager::new(SearchCriteria::new(5, 4));
        for i in 0..6 {
            pager.process(i);
        }
        let results = pager.into_results();
        assert_eq!(results.total, 6);
        assert!(results.results.is_empty());
    }
}
