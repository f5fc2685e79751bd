//! Input hashing for change detection.
//!
//! A resource is updated when the hash of its resolved inputs differs from
//! the hash recorded in state. Object keys are visited in sorted order and
//! every JSON value is tagged with its type, so the hash does not depend on
//! map ordering and `"1"` never collides with `1`.

use sha2::{Digest, Sha256};

use crate::graph::{Properties, ResourceSpec};

/// Hasher for resource inputs and stack declarations.
#[derive(Debug, Default)]
pub struct InputsHasher;

impl InputsHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hashes the resolved inputs of a resource of `kind`.
    #[must_use]
    pub fn hash_inputs(&self, kind: &str, inputs: &Properties) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        for (key, value) in inputs {
            update_str(&mut hasher, key);
            update_value(&mut hasher, value);
        }
        hex::encode(hasher.finalize())
    }

    /// Hashes a set of declarations, references included.
    ///
    /// Recorded in run history to tell which declarations a run applied.
    #[must_use]
    pub fn hash_declarations<'a>(&self, specs: impl IntoIterator<Item = &'a ResourceSpec>) -> String {
        let mut hasher = Sha256::new();
        for spec in specs {
            update_str(&mut hasher, &spec.name);
            update_str(&mut hasher, &spec.kind);
            match serde_json::to_value(&spec.inputs) {
                Ok(inputs) => update_value(&mut hasher, &inputs),
                Err(_) => hasher.update([0xff]),
            }
            for dep in &spec.depends_on {
                update_str(&mut hasher, dep);
            }
        }
        hex::encode(hasher.finalize())
    }

    /// First 8 characters of a hash, for display.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn update_value(hasher: &mut Sha256, value: &serde_json::Value) {
    match value {
        serde_json::Value::Null => hasher.update([b'n']),
        serde_json::Value::Bool(b) => hasher.update([b'b', u8::from(*b)]),
        serde_json::Value::Number(n) => {
            hasher.update([b'#']);
            update_str(hasher, &n.to_string());
        }
        serde_json::Value::String(s) => {
            hasher.update([b's']);
            update_str(hasher, s);
        }
        serde_json::Value::Array(items) => {
            hasher.update([b'[']);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                update_value(hasher, item);
            }
        }
        serde_json::Value::Object(entries) => {
            hasher.update([b'{']);
            hasher.update((entries.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            for key in keys {
                update_str(hasher, key);
                update_value(hasher, &entries[key]);
            }
        }
    }
}
