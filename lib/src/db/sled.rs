use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;

use crate::{error::ErrorKind, Error, Result};

use super::{decode, encode, key, Changeset, Collectable, Id, Identifiable, Operation};

#[derive(Clone, Debug)]
pub struct SledDb {
    inner: sled::Db,
}

impl SledDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let inner = sled::Config::default().path(path).open()?;
        Ok(Self { inner })
    }

    /// In-memory database, removed when dropped.
    pub fn temporary() -> Result<Self> {
        let inner = sled::Config::default().temporary(true).open()?;
        Ok(Self { inner })
    }

    /// Allocates a fresh id, unique across all collections.
    pub fn generate_id(&self) -> Result<Id> {
        Ok(self.inner.generate_id()? + 1)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Gets all entries of the collection defined for the type, in id order.
    pub fn get_collection<T: DeserializeOwned + Collectable>(&self) -> Result<Vec<T>> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        let mut out = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (_, value_bytes) = entry?;
            out.push(decode(&value_bytes)?);
        }
        Ok(out)
    }

    /// Gets all entries matching the predicate, in id order.
    pub fn filter<T, F>(&self, mut predicate: F) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Collectable,
        F: FnMut(&T) -> bool,
    {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, value_bytes) = entry?;
            let value: T = decode(&value_bytes)?;
            if predicate(&value) {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Gets the first entry matching the predicate.
    pub fn find<T, F>(&self, mut predicate: F) -> Result<Option<T>>
    where
        T: DeserializeOwned + Collectable,
        F: FnMut(&T) -> bool,
    {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        for entry in tree.iter() {
            let (_, value_bytes) = entry?;
            let value: T = decode(&value_bytes)?;
            if predicate(&value) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Returns the length of the collection as defined for the specified type.
    pub fn len<T: Collectable>(&self) -> Result<usize> {
        Ok(self.inner.open_tree(T::get_collection_name())?.len())
    }

    /// Gets an item from the collection defined for the item type.
    pub fn get<T: DeserializeOwned + Collectable>(&self, id: Id) -> Result<T> {
        self.get_opt(id)?.ok_or_else(|| {
            Error::not_found(format!(
                "entity with id '{}' in collection {}",
                id,
                T::get_collection_name()
            ))
        })
    }

    pub fn get_opt<T: DeserializeOwned + Collectable>(&self, id: Id) -> Result<Option<T>> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        match tree.get(key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize + Identifiable + Collectable>(&self, value: &T) -> Result<()> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        tree.insert(key(value.get_id()), encode(value)?)?;
        Ok(())
    }

    pub fn remove<T: Identifiable + Collectable>(&self, value: &T) -> Result<()> {
        self.remove_id::<T>(value.get_id()).map(|_| ())
    }

    /// Removes by id. Returns whether something was removed.
    pub fn remove_id<T: Collectable>(&self, id: Id) -> Result<bool> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        Ok(tree.remove(key(id))?.is_some())
    }

    pub fn clear<T: Collectable>(&self) -> Result<()> {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        tree.clear()?;
        Ok(())
    }

    /// Atomic read-modify-write of a single record.
    ///
    /// The closure gets the current value and returns the replacement, or
    /// `None` to leave the record untouched. It may run more than once when
    /// another writer races us. Returns the written value.
    pub fn update<T, F>(&self, id: Id, mut f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Collectable,
        F: FnMut(T) -> Option<T>,
    {
        let tree = self.inner.open_tree(T::get_collection_name())?;
        loop {
            let current = tree.get(key(id))?.ok_or_else(|| {
                Error::not_found(format!(
                    "entity with id '{}' in collection {}",
                    id,
                    T::get_collection_name()
                ))
            })?;
            let Some(new) = f(decode(&current)?) else {
                return Ok(None);
            };
            let encoded = encode(&new)?;
            if tree
                .compare_and_swap(key(id), Some(current), Some(encoded))?
                .is_ok()
            {
                return Ok(Some(new));
            }
        }
    }

    /// Applies all operations of the changeset in a single transaction
    /// spanning every touched collection.
    pub fn apply(&self, changeset: Changeset) -> Result<()> {
        if changeset.is_empty() {
            return Ok(());
        }
        let names = changeset.collections();
        let trees = names
            .iter()
            .map(|name| self.inner.open_tree(name))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let ops = changeset
            .ops
            .into_iter()
            .map(|op| match op {
                Operation::Set {
                    collection,
                    id,
                    value,
                } => (index_of(&names, collection), key(id), Some(value)),
                Operation::Remove { collection, id } => {
                    (index_of(&names, collection), key(id), None)
                }
            })
            .collect::<Vec<_>>();

        trees
            .as_slice()
            .transaction(|views| -> ConflictableTransactionResult<(), ()> {
                for (idx, key, value) in &ops {
                    match value {
                        Some(value) => {
                            views[*idx].insert(&key[..], value.as_slice())?;
                        }
                        None => {
                            views[*idx].remove(&key[..])?;
                        }
                    }
                }
                Ok(())
            })
            .map_err(|e: TransactionError<()>| {
                ErrorKind::DbError(format!("changeset transaction failed: {e:?}"))
            })?;
        Ok(())
    }
}

fn index_of(names: &[&'static str], name: &'static str) -> usize {
    names.iter().position(|n| *n == name).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
    struct Note {
        id: Id,
        text: String,
    }

    impl Collectable for Note {
        fn get_collection_name() -> &'static str {
            "test_notes"
        }
    }

    impl Identifiable for Note {
        fn get_id(&self) -> Id {
            self.id
        }
    }

    #[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
    struct Tag {
        id: Id,
        note: Id,
    }

    impl Collectable for Tag {
        fn get_collection_name() -> &'static str {
            "test_tags"
        }
    }

    impl Identifiable for Tag {
        fn get_id(&self) -> Id {
            self.id
        }
    }

    fn note(db: &SledDb, text: &str) -> Note {
        Note {
            id: db.generate_id().unwrap(),
            text: text.to_string(),
        }
    }

    #[test]
    fn set_get_remove() {
        let db = SledDb::temporary().unwrap();
        let a = note(&db, "a");
        db.set(&a).unwrap();
        assert_eq!(db.get::<Note>(a.id).unwrap(), a);
        assert!(db.remove_id::<Note>(a.id).unwrap());
        assert!(db.get::<Note>(a.id).unwrap_err().is_not_found());
    }

    #[test]
    fn collections_iterate_in_id_order() {
        let db = SledDb::temporary().unwrap();
        let notes = (0..300).map(|i| note(&db, &i.to_string())).collect::<Vec<_>>();
        for n in notes.iter().rev() {
            db.set(n).unwrap();
        }
        let ids = db
            .get_collection::<Note>()
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect::<Vec<_>>();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn changeset_spans_collections() {
        let db = SledDb::temporary().unwrap();
        let a = note(&db, "a");
        let b = note(&db, "b");
        db.set(&b).unwrap();
        let tag = Tag {
            id: db.generate_id().unwrap(),
            note: a.id,
        };

        let mut changes = Changeset::new();
        changes.set(&a).unwrap();
        changes.set(&tag).unwrap();
        changes.remove(&b);
        db.apply(changes).unwrap();

        assert_eq!(db.get::<Note>(a.id).unwrap(), a);
        assert_eq!(db.get::<Tag>(tag.id).unwrap(), tag);
        assert!(db.get_opt::<Note>(b.id).unwrap().is_none());
    }

    #[test]
    fn update_is_conditional() {
        let db = SledDb::temporary().unwrap();
        let a = note(&db, "idle");
        db.set(&a).unwrap();

        let claimed = db
            .update::<Note, _>(a.id, |mut n| {
                (n.text == "idle").then(|| {
                    n.text = "busy".to_string();
                    n
                })
            })
            .unwrap();
        assert!(claimed.is_some());

        let second = db
            .update::<Note, _>(a.id, |mut n| {
                (n.text == "idle").then(|| {
                    n.text = "busy".to_string();
                    n
                })
            })
            .unwrap();
        assert!(second.is_none());
    }
}
