use dashmap::DashMap;

use crate::error::StoreError;

use super::KeyedRepository;

/// In-memory keyed state backed by a sharded map.
///
/// Writers to one key serialize on that key's shard only.
#[derive(Debug)]
pub struct InMemoryRepository<T> {
    records: DashMap<String, T>,
}

impl<T> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> KeyedRepository<T> for InMemoryRepository<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        Ok(self.records.get(key).map(|record| record.value().clone()))
    }

    fn update(
        &self,
        key: &str,
        create: &mut dyn FnMut() -> T,
        apply: &mut dyn FnMut(&mut T),
    ) -> Result<T, StoreError> {
        let mut record = self.records.entry(key.to_string()).or_insert_with(create);
        apply(record.value_mut());
        Ok(record.value().clone())
    }

    fn update_existing(
        &self,
        key: &str,
        apply: &mut dyn FnMut(&mut T),
    ) -> Result<Option<T>, StoreError> {
        Ok(self.records.get_mut(key).map(|mut record| {
            apply(record.value_mut());
            record.value().clone()
        }))
    }

    fn retain(&self, keep: &mut dyn FnMut(&T) -> bool) -> Result<usize, StoreError> {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let kept = keep(record);
            if !kept {
                removed += 1;
            }
            kept
        });
        Ok(removed)
    }

    fn snapshot(&self) -> Result<Vec<T>, StoreError> {
        Ok(self
            .records
            .iter()
            .map(|record| record.value().clone())
            .collect())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records.len())
    }
}
