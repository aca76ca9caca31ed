use serde::{Deserialize, Serialize};

/// Trait for entity references: typed `u32` indices into arenas.
pub trait EntityRef: Copy + Eq + Ord + std::hash::Hash + std::fmt::Debug {
    fn new(index: u32) -> Self;
    fn index(self) -> u32;
}

/// Define a typed entity reference (a newtype over `u32`).
///
/// The second argument is the prefix used by `Display`.
///
/// ```ignore
/// define_entity!(OpId, "op");
/// ```
#[macro_export]
macro_rules! define_entity {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Debug,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(u32);

        impl $crate::entity::EntityRef for $name {
            fn new(index: u32) -> Self {
                Self(index)
            }
            fn index(self) -> u32 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

/// Slot arena keyed by entity references.
///
/// Removing an entry leaves a hole; slots are never reused, so a handle to a
/// destroyed object can only ever miss, never alias a newer one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arena<K: EntityRef, V> {
    elems: Vec<Option<V>>,
    live: usize,
    #[serde(skip)]
    _phantom: std::marker::PhantomData<K>,
}

impl<K: EntityRef, V> Default for Arena<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityRef, V> Arena<K, V> {
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            live: 0,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn push(&mut self, value: V) -> K {
        let key = K::new(self.elems.len() as u32);
        self.elems.push(Some(value));
        self.live += 1;
        key
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let removed = self
            .elems
            .get_mut(key.index() as usize)
            .and_then(|slot| slot.take());
        if removed.is_some() {
            self.live -= 1;
        }
        removed
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.elems
            .get(key.index() as usize)
            .and_then(|v| v.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.elems
            .get_mut(key.index() as usize)
            .and_then(|v| v.as_mut())
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.elems
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (K::new(i as u32), v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut V)> {
        self.elems
            .iter_mut()
            .enumerate()
            .filter_map(|(i, v)| v.as_mut().map(|v| (K::new(i as u32), v)))
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.elems.iter().filter_map(|v| v.as_ref())
    }
}

/// Indexing panics on a key whose slot was freed; use [`Arena::get`] when
/// the key may be stale.
impl<K: EntityRef, V> std::ops::Index<K> for Arena<K, V> {
    type Output = V;
    fn index(&self, key: K) -> &V {
        match self.get(key) {
            Some(v) => v,
            None => panic!("{key:?} used after it was destroyed"),
        }
    }
}

impl<K: EntityRef, V> std::ops::IndexMut<K> for Arena<K, V> {
    fn index_mut(&mut self, key: K) -> &mut V {
        match self.get_mut(key) {
            Some(v) => v,
            None => panic!("{key:?} used after it was destroyed"),
        }
    }
}

/// Sparse secondary storage keyed by entity references.
/// Unlike `Arena`, entries are not owned objects; they annotate keys of some
/// other arena.
#[derive(Debug, Clone)]
pub struct SecondaryMap<K: EntityRef, V> {
    elems: Vec<Option<V>>,
    _phantom: std::marker::PhantomData<K>,
}

impl<K: EntityRef, V> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityRef, V> SecondaryMap<K, V> {
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        let idx = key.index() as usize;
        if idx >= self.elems.len() {
            self.elems.resize_with(idx + 1, || None);
        }
        self.elems[idx] = Some(value);
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.elems
            .get(key.index() as usize)
            .and_then(|v| v.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.elems
            .get_mut(key.index() as usize)
            .and_then(|v| v.as_mut())
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let idx = key.index() as usize;
        if idx < self.elems.len() {
            self.elems[idx].take()
        } else {
            None
        }
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }
}
