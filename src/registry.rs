//! Token ⇄ binary identifier registry over the UID table.
//!
//! Each entity class owns two key ranges distinguished by indicator bytes:
//! `[key indicator][token utf-8] -> value bytes` and
//! `[value indicator][value bytes] -> token utf-8`, plus one allocation counter
//! row at `[0x00][key indicator]`. Top-level classes store the truncated
//! counter bytes as the value; composite-key child classes (zones,
//! assignments, commands) store their full row-key bytes so a token resolves
//! straight to an addressable row.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::keys::{EntityClass, KeyBuilder};
use crate::kv::{KeyValueStore, Row, Table};

const COUNTER_ROW_LEAD: u8 = 0x00;
const VALUE_COLUMN: &str = "value";

/// Registry scoped to one storage handle. All state lives in the store; two
/// registries over the same store see each other's allocations immediately.
pub struct TokenRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn forward_row(builder: &KeyBuilder, token: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(token.len() + 1);
        key.push(builder.key_indicator);
        key.extend_from_slice(token.as_bytes());
        key
    }

    fn reverse_row(builder: &KeyBuilder, value: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(value.len() + 1);
        key.push(builder.value_indicator);
        key.extend_from_slice(value);
        key
    }

    fn counter_row(builder: &KeyBuilder) -> Vec<u8> {
        vec![COUNTER_ROW_LEAD, builder.key_indicator]
    }

    fn single_column(bytes: Vec<u8>) -> Row {
        Row::from([(VALUE_COLUMN.to_string(), bytes)])
    }

    /// Allocate the next counter value for a class. Counters start at 1; zero
    /// is never handed out so an all-zero identifier never denotes an entity.
    pub fn next_counter_value(&self, class: EntityClass) -> Result<u64> {
        let builder = KeyBuilder::for_class(class);
        let next =
            self.store
                .atomic_increment(Table::Uid, &Self::counter_row(builder), VALUE_COLUMN, 1)?;
        Ok(next as u64)
    }

    /// Mint a fresh token bound to a freshly allocated identifier. Returns the
    /// token and the registry value (truncated identifier bytes).
    pub fn create_unique_id(&self, class: EntityClass) -> Result<(String, Vec<u8>)> {
        let token = Uuid::new_v4().to_string();
        let value = self.use_existing_id(class, &token)?;
        Ok((token, value))
    }

    /// Bind a caller-chosen token to a freshly allocated identifier. Fails
    /// with a conflict if the token is already bound for this class.
    pub fn use_existing_id(&self, class: EntityClass, token: &str) -> Result<Vec<u8>> {
        let builder = KeyBuilder::for_class(class);
        let counter = self.next_counter_value(class)?;
        let value = builder.registry_value(counter);
        self.bind(builder, token, value.clone())?;
        Ok(value)
    }

    /// Bind a token to explicit key bytes, minting the token when none is
    /// given. Used by composite-key child classes whose registry value is the
    /// full row key rather than a counter slice.
    pub fn register_key(
        &self,
        class: EntityClass,
        token: Option<&str>,
        key_bytes: Vec<u8>,
    ) -> Result<String> {
        let builder = KeyBuilder::for_class(class);
        let token = match token {
            Some(token) => token.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        self.bind(builder, &token, key_bytes)?;
        Ok(token)
    }

    /// Resolve a token to its registry value.
    pub fn get_value(&self, class: EntityClass, token: &str) -> Result<Option<Vec<u8>>> {
        let builder = KeyBuilder::for_class(class);
        let row = self.store.get(Table::Uid, &Self::forward_row(builder, token))?;
        Ok(row.and_then(|mut row| row.remove(VALUE_COLUMN)))
    }

    /// Resolve a token or surface the class-specific not-found error.
    pub fn require_value(&self, class: EntityClass, token: &str) -> Result<Vec<u8>> {
        self.get_value(class, token)?.ok_or_else(|| class.not_found())
    }

    /// Reverse lookup: registry value back to its token.
    pub fn get_token(&self, class: EntityClass, value: &[u8]) -> Result<Option<String>> {
        let builder = KeyBuilder::for_class(class);
        let row = self.store.get(Table::Uid, &Self::reverse_row(builder, value))?;
        let Some(bytes) = row.and_then(|mut row| row.remove(VALUE_COLUMN)) else {
            return Ok(None);
        };
        let token = String::from_utf8(bytes)
            .map_err(|_| StoreError::Storage("registry token is not utf-8".into()))?;
        Ok(Some(token))
    }

    /// Release a token and its reverse mapping. Releasing an unknown token is
    /// a no-op; the identifier itself is never reissued (counters only move
    /// forward).
    pub fn delete(&self, class: EntityClass, token: &str) -> Result<()> {
        let builder = KeyBuilder::for_class(class);
        if let Some(value) = self.get_value(class, token)? {
            self.store
                .delete(Table::Uid, &Self::reverse_row(builder, &value))?;
        }
        self.store
            .delete(Table::Uid, &Self::forward_row(builder, token))?;
        debug!(class = ?class, token, "released registry token");
        Ok(())
    }

    /// Write the reverse row before the forward row. A crash in between
    /// leaves the token unbound, which create paths treat as free.
    fn bind(&self, builder: &KeyBuilder, token: &str, value: Vec<u8>) -> Result<()> {
        if token.is_empty() {
            return Err(StoreError::Config("token must not be empty".into()));
        }
        let forward = Self::forward_row(builder, token);
        if self.store.get(Table::Uid, &forward)?.is_some() {
            return Err(StoreError::TokenInUse(token.to_string()));
        }
        self.store.put(
            Table::Uid,
            &Self::reverse_row(builder, &value),
            Self::single_column(token.as_bytes().to_vec()),
        )?;
        self.store
            .put(Table::Uid, &forward, Self::single_column(value))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn registry() -> TokenRegistry {
        TokenRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn counters_are_independent_per_class() {
        let registry = registry();
        assert_eq!(registry.next_counter_value(EntityClass::Site).unwrap(), 1);
        assert_eq!(registry.next_counter_value(EntityClass::Site).unwrap(), 2);
        assert_eq!(registry.next_counter_value(EntityClass::Device).unwrap(), 1);
    }

    #[test]
    fn round_trip_token_and_value() {
        let registry = registry();
        let (token, value) = registry.create_unique_id(EntityClass::Site).unwrap();
        assert_eq!(value, vec![0x00, 0x01]);
        assert_eq!(
            registry.get_value(EntityClass::Site, &token).unwrap(),
            Some(value.clone())
        );
        assert_eq!(
            registry.get_token(EntityClass::Site, &value).unwrap(),
            Some(token)
        );
    }

    #[test]
    fn rebinding_a_token_conflicts() {
        let registry = registry();
        registry
            .use_existing_id(EntityClass::Device, "dev-1")
            .unwrap();
        let err = registry
            .use_existing_id(EntityClass::Device, "dev-1")
            .unwrap_err();
        assert!(matches!(err, StoreError::TokenInUse(_)));
    }

    #[test]
    fn same_token_is_free_across_classes() {
        let registry = registry();
        registry.use_existing_id(EntityClass::Site, "shared").unwrap();
        registry
            .use_existing_id(EntityClass::Device, "shared")
            .unwrap();
    }

    #[test]
    fn delete_releases_both_directions_and_recreate_allocates_fresh_id() {
        let registry = registry();
        let first = registry.use_existing_id(EntityClass::Device, "d").unwrap();
        registry.delete(EntityClass::Device, "d").unwrap();
        assert!(registry.get_value(EntityClass::Device, "d").unwrap().is_none());
        assert!(registry.get_token(EntityClass::Device, &first).unwrap().is_none());

        let second = registry.use_existing_id(EntityClass::Device, "d").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn composite_keys_register_verbatim() {
        let registry = registry();
        let key = vec![0x01, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x01];
        let token = registry
            .register_key(EntityClass::Assignment, None, key.clone())
            .unwrap();
        assert_eq!(
            registry.require_value(EntityClass::Assignment, &token).unwrap(),
            key
        );
    }

    #[test]
    fn unknown_token_maps_to_class_error() {
        let registry = registry();
        let err = registry
            .require_value(EntityClass::Zone, "missing")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidZoneToken));
    }
}
