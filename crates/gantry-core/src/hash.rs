use std::hash::Hasher;

/// Convenience functions for doing things with a thread-local Xxhash hasher.
pub(crate) mod thread_local_xxhash {
    use std::cell::RefCell;
    use xxhash_rust::xxh64::Xxh64;

    const SEED: u64 = 0;

    thread_local! {
        static HASHER: RefCell<Xxh64> = const { RefCell::new(Xxh64::new(SEED)) };
    }

    /// Hash a single item using a thread-local [xx64 Hasher][Xxh64].
    pub(crate) fn hash<H: std::hash::Hash>(h: &H) -> u64 {
        HASHER.with_borrow_mut(|hasher| {
            hasher.reset(SEED);
            h.hash(hasher);
            hasher.digest()
        })
    }

    /// Hash an iterable of hashable items using a thread-local
    /// [xx64 Hasher][Xxh64].
    ///
    /// *Note*: Tuples implement [std::hash::Hash], so if you need to hash a
    /// sequence of items of different types, try passing a tuple to [hash].
    pub(crate) fn hash_iter<I: IntoIterator<Item = H>, H: std::hash::Hash>(iter: I) -> u64 {
        HASHER.with_borrow_mut(|hasher| {
            hasher.reset(SEED);
            for h in iter {
                h.hash(hasher)
            }
            hasher.digest()
        })
    }
}

/// Compute the version string for a list of xDS resources.
///
/// The version is the hex encoded FNV-1a hash of every resource, taken in the
/// order given. Callers sort resources by name first so that the version only
/// depends on content.
///
/// Protobuf map fields are `HashMap`s and encode in iteration order, so equal
/// messages don't always encode to equal bytes. Resources are hashed through
/// their JSON form instead, with object keys visited in sorted order. A
/// resource that can't be converted falls back to its protobuf encoding.
pub(crate) fn resource_version<M>(resources: &[M]) -> String
where
    M: prost::Message + serde::Serialize,
{
    let mut hasher = fnv::FnvHasher::default();
    for resource in resources {
        match serde_json::to_value(resource) {
            Ok(value) => hash_json(&value, &mut hasher),
            Err(e) => {
                tracing::debug!(err = %e, "hashing resource by its protobuf encoding");
                // length-delimit every message so that [a, b] and [ab] never collide
                hasher.write(&resource.encode_length_delimited_to_vec());
            }
        }
    }
    format!("{:016x}", hasher.finish())
}

fn hash_json<H: Hasher>(value: &serde_json::Value, hasher: &mut H) {
    use serde_json::Value;

    match value {
        Value::Null => hasher.write_u8(0),
        Value::Bool(b) => {
            hasher.write_u8(1);
            hasher.write_u8(*b as u8);
        }
        Value::Number(n) => {
            hasher.write_u8(2);
            hash_str(&n.to_string(), hasher);
        }
        Value::String(s) => {
            hasher.write_u8(3);
            hash_str(s, hasher);
        }
        Value::Array(items) => {
            hasher.write_u8(4);
            hasher.write_usize(items.len());
            for item in items {
                hash_json(item, hasher);
            }
        }
        Value::Object(map) => {
            hasher.write_u8(5);
            hasher.write_usize(map.len());
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            for (k, v) in entries {
                hash_str(k, hasher);
                hash_json(v, hasher);
            }
        }
    }
}

fn hash_str<H: Hasher>(s: &str, hasher: &mut H) {
    hasher.write_usize(s.len());
    hasher.write(s.as_bytes());
}
