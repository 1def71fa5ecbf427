//! Persistence primitives.
//!
//! Every entity type lives in its own collection, keyed by a numeric id.
//! Records are encoded with `pot`. Multi-record writes that must land
//! together go through a [`Changeset`].

#[cfg(feature = "sled")]
mod sled;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

#[cfg(feature = "sled")]
pub use self::sled::SledDb as Database;

/// Record identifier. Ids are allocated by [`Database::generate_id`] and
/// are stored big-endian so collections iterate in id order.
pub type Id = u64;

pub trait Identifiable {
    fn get_id(&self) -> Id;
}

pub trait Collectable {
    fn get_collection_name() -> &'static str;
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let t: T = pot::from_slice(bytes)?;
    Ok(t)
}

pub fn encode<T: Serialize>(item: &T) -> Result<Vec<u8>> {
    let bytes = pot::to_vec(item)?;
    Ok(bytes)
}

pub fn key(id: Id) -> [u8; 8] {
    id.to_be_bytes()
}

#[derive(Clone, Debug)]
pub(crate) enum Operation {
    Set {
        collection: &'static str,
        id: Id,
        value: Vec<u8>,
    },
    Remove {
        collection: &'static str,
        id: Id,
    },
}

/// Batch of writes and removals applied atomically by
/// [`Database::apply`].
///
/// Later operations on the same record win.
#[derive(Clone, Debug, Default)]
pub struct Changeset {
    pub(crate) ops: Vec<Operation>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize + Identifiable + Collectable>(&mut self, value: &T) -> Result<()> {
        self.ops.push(Operation::Set {
            collection: T::get_collection_name(),
            id: value.get_id(),
            value: encode(value)?,
        });
        Ok(())
    }

    pub fn remove<T: Identifiable + Collectable>(&mut self, value: &T) {
        self.remove_id::<T>(value.get_id())
    }

    pub fn remove_id<T: Collectable>(&mut self, id: Id) {
        self.ops.push(Operation::Remove {
            collection: T::get_collection_name(),
            id,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Distinct collections touched, in first-use order.
    pub(crate) fn collections(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = vec![];
        for op in &self.ops {
            let name = match op {
                Operation::Set { collection, .. } => *collection,
                Operation::Remove { collection, .. } => *collection,
            };
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }
}
