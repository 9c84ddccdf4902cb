//! The committed key-value image and its on-disk encoding.

use crate::error::{StorageError, StorageResult};
use ciborium::Value;
use std::collections::BTreeMap;

/// Current image format version.
pub const IMAGE_FORMAT_VERSION: u64 = 1;

/// A complete image of the key-value store.
///
/// Values are grouped by collection, then by key. The image is the unit
/// of persistence: a backend always writes a whole image, so a commit is
/// either fully visible after a restart or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvImage {
    collections: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl KvImage {
    /// Creates an empty image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value stored under `collection`/`key`.
    #[must_use]
    pub fn get(&self, collection: &str, key: &str) -> Option<&[u8]> {
        self.collections
            .get(collection)
            .and_then(|entries| entries.get(key))
            .map(Vec::as_slice)
    }

    /// Stores a value, replacing any previous one.
    pub fn insert(&mut self, collection: &str, key: &str, value: Vec<u8>) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Removes a value. Returns true if a value was present.
    pub fn remove(&mut self, collection: &str, key: &str) -> bool {
        let Some(entries) = self.collections.get_mut(collection) else {
            return false;
        };
        let removed = entries.remove(key).is_some();
        if entries.is_empty() {
            self.collections.remove(collection);
        }
        removed
    }

    /// Returns the keys stored in a collection, in order.
    pub fn keys(&self, collection: &str) -> impl Iterator<Item = &str> {
        self.collections
            .get(collection)
            .into_iter()
            .flat_map(|entries| entries.keys().map(String::as_str))
    }

    /// Returns the names of all non-empty collections.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Returns the total number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    /// Returns true if the image holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Encodes the image to CBOR.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let collections = self
            .collections
            .iter()
            .map(|(name, entries)| {
                let entries = entries
                    .iter()
                    .map(|(key, value)| (Value::Text(key.clone()), Value::Bytes(value.clone())))
                    .collect();
                (Value::Text(name.clone()), Value::Map(entries))
            })
            .collect();

        let root = Value::Map(vec![
            (
                Value::Text("format".into()),
                Value::Integer(IMAGE_FORMAT_VERSION.into()),
            ),
            (Value::Text("collections".into()), Value::Map(collections)),
        ]);

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&root, &mut bytes)
            .map_err(|e| StorageError::corrupted(format!("failed to encode image: {e}")))?;
        Ok(bytes)
    }

    /// Decodes an image from CBOR.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let root: Value = ciborium::de::from_reader(bytes)
            .map_err(|e| StorageError::corrupted(format!("failed to decode image: {e}")))?;

        let Value::Map(fields) = root else {
            return Err(StorageError::corrupted("image root is not a map"));
        };

        let get_field = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k.as_text() == Some(name))
                .map(|(_, v)| v)
        };

        let format = get_field("format")
            .and_then(Value::as_integer)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| StorageError::corrupted("missing image format"))?;
        if format != IMAGE_FORMAT_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported image format {format}"
            )));
        }

        let mut image = Self::new();
        let collections = get_field("collections")
            .and_then(Value::as_map)
            .ok_or_else(|| StorageError::corrupted("missing collections"))?;

        for (name, entries) in collections {
            let name = name
                .as_text()
                .ok_or_else(|| StorageError::corrupted("collection name is not text"))?;
            let entries = entries
                .as_map()
                .ok_or_else(|| StorageError::corrupted("collection is not a map"))?;
            for (key, value) in entries {
                let key = key
                    .as_text()
                    .ok_or_else(|| StorageError::corrupted("key is not text"))?;
                let value = value
                    .as_bytes()
                    .ok_or_else(|| StorageError::corrupted("value is not a byte string"))?;
                image.insert(name, key, value.clone());
            }
        }

        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut image = KvImage::new();
        image.insert("a", "x", vec![1]);
        image.insert("a", "y", vec![2]);
        image.insert("b", "x", vec![3]);

        assert_eq!(image.get("a", "x"), Some(&[1u8][..]));
        assert_eq!(image.len(), 3);
        assert_eq!(image.keys("a").collect::<Vec<_>>(), vec!["x", "y"]);

        assert!(image.remove("b", "x"));
        assert!(!image.remove("b", "x"));
        assert_eq!(image.collections().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn encoding_preserves_contents() {
        let mut image = KvImage::new();
        image.insert("contact_sync", "manifest_version", 7u64.to_le_bytes().to_vec());
        image.insert("contact_sync", "change_map", vec![0xA0]);

        let decoded = KvImage::decode(&image.encode().unwrap()).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            KvImage::decode(&[0xFF, 0x00, 0x13]),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_format() {
        let root = Value::Map(vec![
            (Value::Text("format".into()), Value::Integer(99.into())),
            (Value::Text("collections".into()), Value::Map(vec![])),
        ]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&root, &mut bytes).unwrap();

        let err = KvImage::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported image format"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Insert(String, String, Vec<u8>),
            Remove(String, String),
        }

        fn op() -> impl Strategy<Value = Op> {
            let name = || "[a-c]{1,2}";
            prop_oneof![
                (name(), name(), prop::collection::vec(any::<u8>(), 0..8))
                    .prop_map(|(c, k, v)| Op::Insert(c, k, v)),
                (name(), name()).prop_map(|(c, k)| Op::Remove(c, k)),
            ]
        }

        proptest! {
            #[test]
            fn image_matches_flat_map(ops in prop::collection::vec(op(), 0..40)) {
                let mut image = KvImage::new();
                let mut model = BTreeMap::new();
                for op in ops {
                    match op {
                        Op::Insert(c, k, v) => {
                            image.insert(&c, &k, v.clone());
                            model.insert((c, k), v);
                        }
                        Op::Remove(c, k) => {
                            let existed = model.remove(&(c.clone(), k.clone())).is_some();
                            prop_assert_eq!(image.remove(&c, &k), existed);
                        }
                    }
                }

                prop_assert_eq!(image.len(), model.len());
                for ((c, k), v) in &model {
                    prop_assert_eq!(image.get(c, k), Some(v.as_slice()));
                }

                let decoded = KvImage::decode(&image.encode().unwrap()).unwrap();
                prop_assert_eq!(decoded, image);
            }
        }
    }
}
