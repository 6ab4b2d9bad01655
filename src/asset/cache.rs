use super::Handle;

struct Entry<T> {
    generation: u32,
    item: Option<T>,
}

/// Arena of `T` addressed by generational handles.
pub struct AssetCache<T> {
    entries: Vec<Entry<T>>,
    vacant: Vec<u32>,
    len: usize,
}

impl<T> AssetCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            vacant: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, item: T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.vacant.pop() {
            let entry = &mut self.entries[index as usize];
            entry.item = Some(item);
            return Handle::new(index, entry.generation);
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            item: Some(item),
        });
        Handle::new(index, 0)
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let entry = self.entries.get_mut(handle.index() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        let item = entry.item.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.vacant.push(handle.index());
        self.len -= 1;
        Some(item)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.entries
            .get(handle.index() as usize)
            .filter(|entry| entry.generation == handle.generation())
            .and_then(|entry| entry.item.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.entries
            .get_mut(handle.index() as usize)
            .filter(|entry| entry.generation == handle.generation())
            .and_then(|entry| entry.item.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry
                .item
                .as_ref()
                .map(|item| (Handle::new(index as u32, entry.generation), item))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().filter_map(|entry| entry.item.as_mut())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for AssetCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_handles_go_stale() {
        let mut cache = AssetCache::new();
        let first = cache.insert("a");
        assert_eq!(cache.remove(first), Some("a"));

        let second = cache.insert("b");
        assert_eq!(second.index(), first.index(), "slot is reused");
        assert!(cache.get(first).is_none());
        assert_eq!(cache.get(second), Some(&"b"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn double_remove_is_harmless() {
        let mut cache = AssetCache::new();
        let handle = cache.insert(1u32);
        assert!(cache.remove(handle).is_some());
        assert!(cache.remove(handle).is_none());
        assert!(cache.is_empty());
    }
}
