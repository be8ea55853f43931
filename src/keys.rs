//! Row-key codec. Every entity class maps onto the sorted keyspace as
//! `[record type][binary identifier][record subtype][optional sub-identifier]`,
//! where the binary identifier is the truncated low-order slice of a 64-bit
//! counter. Truncation widths trade key size against collision headroom: a
//! class is assumed to stay under 2^(8 * width) live identifiers.

use crate::error::StoreError;

/// Subtype byte for an entity's primary record.
pub const PRIMARY: u8 = 0x00;

/// Record subtypes scoped under a site's identifier prefix. `END` exists only
/// as an exclusive scan bound after the assignment range.
pub mod site_subtype {
    pub const ZONE: u8 = 0x01;
    pub const ASSIGNMENT: u8 = 0x02;
    pub const END: u8 = 0x03;
}

/// Subtype byte for child element rows (group/network elements, commands,
/// batch elements). `ELEMENT + 1` is always a valid exclusive scan bound.
pub const ELEMENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    Site,
    Device,
    Specification,
    Group,
    Network,
    BatchOperation,
    Zone,
    Assignment,
    Command,
}

impl EntityClass {
    /// The per-class "invalid token" condition raised when a token fails to
    /// resolve. Never fatal; callers check before every dependent mutation.
    pub fn not_found(self) -> StoreError {
        match self {
            EntityClass::Site => StoreError::InvalidSiteToken,
            EntityClass::Device => StoreError::InvalidDeviceToken,
            EntityClass::Specification => StoreError::InvalidSpecificationToken,
            EntityClass::Group => StoreError::InvalidGroupToken,
            EntityClass::Network => StoreError::InvalidNetworkToken,
            EntityClass::BatchOperation => StoreError::InvalidBatchToken,
            EntityClass::Zone => StoreError::InvalidZoneToken,
            EntityClass::Assignment => StoreError::InvalidAssignmentToken,
            EntityClass::Command => StoreError::InvalidCommandToken,
        }
    }
}

/// Key layout strategy for one entity class. A flat table selected by
/// [`EntityClass`]; no per-class trait objects.
#[derive(Debug, Clone, Copy)]
pub struct KeyBuilder {
    pub class: EntityClass,
    /// Leading discriminator byte for top-level classes. Composite-key child
    /// classes (zones, assignments, commands) inherit their parent's prefix
    /// and have none of their own.
    pub record_type: Option<u8>,
    pub primary_subtype: u8,
    /// Truncation width of the binary identifier in bytes.
    pub id_width: usize,
    /// Leading byte for token -> value rows in the UID table.
    pub key_indicator: u8,
    /// Leading byte for value -> token rows in the UID table.
    pub value_indicator: u8,
}

const SITE: KeyBuilder = KeyBuilder {
    class: EntityClass::Site,
    record_type: Some(0x01),
    primary_subtype: PRIMARY,
    id_width: 2,
    key_indicator: 0x01,
    value_indicator: 0x02,
};

const DEVICE: KeyBuilder = KeyBuilder {
    class: EntityClass::Device,
    record_type: Some(0x02),
    primary_subtype: PRIMARY,
    id_width: 4,
    key_indicator: 0x03,
    value_indicator: 0x04,
};

const SPECIFICATION: KeyBuilder = KeyBuilder {
    class: EntityClass::Specification,
    record_type: Some(0x03),
    primary_subtype: PRIMARY,
    id_width: 4,
    key_indicator: 0x05,
    value_indicator: 0x06,
};

const GROUP: KeyBuilder = KeyBuilder {
    class: EntityClass::Group,
    record_type: Some(0x04),
    primary_subtype: PRIMARY,
    id_width: 4,
    key_indicator: 0x07,
    value_indicator: 0x08,
};

const NETWORK: KeyBuilder = KeyBuilder {
    class: EntityClass::Network,
    record_type: Some(0x05),
    primary_subtype: PRIMARY,
    id_width: 4,
    key_indicator: 0x09,
    value_indicator: 0x0A,
};

const BATCH_OPERATION: KeyBuilder = KeyBuilder {
    class: EntityClass::BatchOperation,
    record_type: Some(0x06),
    primary_subtype: PRIMARY,
    id_width: 4,
    key_indicator: 0x0B,
    value_indicator: 0x0C,
};

const ZONE: KeyBuilder = KeyBuilder {
    class: EntityClass::Zone,
    record_type: None,
    primary_subtype: PRIMARY,
    id_width: 4,
    key_indicator: 0x0D,
    value_indicator: 0x0E,
};

const ASSIGNMENT: KeyBuilder = KeyBuilder {
    class: EntityClass::Assignment,
    record_type: None,
    primary_subtype: PRIMARY,
    id_width: 4,
    key_indicator: 0x0F,
    value_indicator: 0x10,
};

const COMMAND: KeyBuilder = KeyBuilder {
    class: EntityClass::Command,
    record_type: None,
    primary_subtype: PRIMARY,
    id_width: 4,
    key_indicator: 0x11,
    value_indicator: 0x12,
};

impl KeyBuilder {
    pub const fn for_class(class: EntityClass) -> &'static KeyBuilder {
        match class {
            EntityClass::Site => &SITE,
            EntityClass::Device => &DEVICE,
            EntityClass::Specification => &SPECIFICATION,
            EntityClass::Group => &GROUP,
            EntityClass::Network => &NETWORK,
            EntityClass::BatchOperation => &BATCH_OPERATION,
            EntityClass::Zone => &ZONE,
            EntityClass::Assignment => &ASSIGNMENT,
            EntityClass::Command => &COMMAND,
        }
    }

    /// Low-order `id_width` bytes of the big-endian counter value.
    pub fn truncated_id(&self, value: u64) -> Vec<u8> {
        truncate(value, self.id_width)
    }

    /// Registry value stored for a freshly allocated top-level identifier.
    pub fn registry_value(&self, counter: u64) -> Vec<u8> {
        self.truncated_id(counter)
    }

    /// Primary row key. Top-level classes get `[record type][value][primary
    /// subtype]`; composite-key child classes store their full row key as the
    /// registry value, so it passes through unchanged.
    pub fn primary_key(&self, value: &[u8]) -> Vec<u8> {
        if self.record_type.is_none() {
            return value.to_vec();
        }
        self.subkey(value, self.primary_subtype)
    }

    /// Row key with the subtype byte replaced. With `subtype + 1` this is the
    /// exclusive upper bound bracketing every row of the given subtype.
    pub fn subkey(&self, value: &[u8], subtype: u8) -> Vec<u8> {
        let mut key = Vec::with_capacity(value.len() + 2);
        if let Some(record_type) = self.record_type {
            key.push(record_type);
        }
        key.extend_from_slice(value);
        key.push(subtype);
        key
    }

    /// Key of a child row under a parent subkey: parent prefix, child
    /// subtype, then the truncated child sub-identifier.
    pub fn child_key(&self, value: &[u8], subtype: u8, child_id: u64, child_width: usize) -> Vec<u8> {
        let mut key = self.subkey(value, subtype);
        key.extend_from_slice(&truncate(child_id, child_width));
        key
    }

    /// Inclusive/exclusive bounds covering every row of this class, primary
    /// and child rows alike. Only meaningful for top-level classes.
    pub fn class_scan_bounds(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let record_type = self.record_type?;
        Some((vec![record_type], vec![record_type + 1]))
    }

    /// True if `key` is a primary row of this class (and not a child row
    /// sharing the identifier prefix).
    pub fn is_primary_key(&self, key: &[u8]) -> bool {
        let type_len = usize::from(self.record_type.is_some());
        key.len() == type_len + self.id_width + 1
            && key.last() == Some(&self.primary_subtype)
            && self
                .record_type
                .map_or(true, |record_type| key.first() == Some(&record_type))
    }
}

pub(crate) fn truncate(value: u64, width: usize) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    bytes[bytes.len() - width..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_low_order_bytes() {
        assert_eq!(truncate(0x0102030405060708, 2), vec![0x07, 0x08]);
        assert_eq!(truncate(0x01, 4), vec![0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn primary_key_layout() {
        let site = KeyBuilder::for_class(EntityClass::Site);
        let value = site.registry_value(0x1234);
        assert_eq!(site.primary_key(&value), vec![0x01, 0x12, 0x34, 0x00]);
    }

    #[test]
    fn subkey_brackets_children() {
        let site = KeyBuilder::for_class(EntityClass::Site);
        let value = site.registry_value(7);
        let start = site.subkey(&value, site_subtype::ZONE);
        let stop = site.subkey(&value, site_subtype::ZONE + 1);

        let zone_key = site.child_key(&value, site_subtype::ZONE, 3, 4);
        assert!(zone_key.as_slice() >= start.as_slice());
        assert!(zone_key.as_slice() < stop.as_slice());

        let assignment_key = site.child_key(&value, site_subtype::ASSIGNMENT, 1, 4);
        assert!(assignment_key.as_slice() >= stop.as_slice());
    }

    #[test]
    fn composite_child_keys_pass_through() {
        let assignment = KeyBuilder::for_class(EntityClass::Assignment);
        // Value is the full composite key minted at create time.
        let value = vec![0x01, 0x00, 0x07, 0x02, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(assignment.primary_key(&value), value);
        assert!(assignment.class_scan_bounds().is_none());
    }

    #[test]
    fn primary_rows_are_distinguished_from_child_rows() {
        let group = KeyBuilder::for_class(EntityClass::Group);
        let value = group.registry_value(9);
        assert!(group.is_primary_key(&group.primary_key(&value)));
        assert!(!group.is_primary_key(&group.child_key(&value, ELEMENT, 1, 4)));
    }
}
