//! Caching of symbolization results.
//!
//! Results are keyed by the object path as recorded in the crash log
//! and the normalized offset inside of it. A [`CacheStore`] persists
//! results across runs, tagged by the [`Mode`] they were produced in,
//! while a [`SymbolTable`] holds everything known during a single run.

#[cfg(feature = "sqlite")]
mod sqlite;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::parse::Frame;
use crate::util::normalize_hex;
use crate::Mode;
use crate::Result;
use crate::SymbolInfo;

#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteStore;


/// The key identifying a symbolization result.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// The object path as recorded in the crash log.
    pub object_path: String,
    /// The normalized offset inside the object.
    pub offset: String,
}

impl CacheKey {
    /// Create a new `CacheKey`, normalizing `offset`.
    pub fn new<P>(object_path: P, offset: &str) -> Self
    where
        P: Into<String>,
    {
        Self {
            object_path: object_path.into(),
            offset: normalize_hex(offset).into_owned(),
        }
    }

    /// Create the key for a frame, if it references an object.
    pub fn for_frame(frame: &Frame) -> Option<Self> {
        let object = frame.object.as_ref()?;
        Some(Self {
            object_path: object.path.clone(),
            offset: frame.lookup_offset(),
        })
    }
}


/// A persistent store of symbolization results.
pub trait CacheStore
where
    Self: Debug,
{
    /// Load all results produced in `mode`.
    fn load(&self, mode: Mode) -> Result<HashMap<CacheKey, SymbolInfo>>;

    /// Store `entries` produced in `mode`.
    ///
    /// Entries already present are left untouched.
    fn save(&mut self, mode: Mode, entries: &HashMap<CacheKey, SymbolInfo>) -> Result<()>;
}


/// A [`CacheStore`] keeping results in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<(Mode, CacheKey), SymbolInfo>,
}

impl MemoryStore {
    /// Create a new, empty `MemoryStore`.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored results, across all modes.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the store is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self, mode: Mode) -> Result<HashMap<CacheKey, SymbolInfo>> {
        let entries = self
            .entries
            .iter()
            .filter(|((entry_mode, _key), _info)| *entry_mode == mode)
            .map(|((_mode, key), info)| (key.clone(), info.clone()))
            .collect();
        Ok(entries)
    }

    fn save(&mut self, mode: Mode, entries: &HashMap<CacheKey, SymbolInfo>) -> Result<()> {
        for (key, info) in entries {
            let _info = self
                .entries
                .entry((mode, key.clone()))
                .or_insert_with(|| info.clone());
        }
        Ok(())
    }
}


/// All symbolization results known during a run: the ones loaded from
/// a [`CacheStore`] and the ones freshly produced.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    persisted: HashMap<CacheKey, SymbolInfo>,
    fresh: HashMap<CacheKey, SymbolInfo>,
}

impl SymbolTable {
    /// Create a `SymbolTable` seeded with previously persisted results.
    pub fn new(persisted: HashMap<CacheKey, SymbolInfo>) -> Self {
        Self {
            persisted,
            fresh: HashMap::new(),
        }
    }

    /// Look up the result for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<&SymbolInfo> {
        self.persisted.get(key).or_else(|| self.fresh.get(key))
    }

    /// Look up the result for the object referenced by `frame`.
    pub fn get_frame(&self, frame: &Frame) -> Option<&SymbolInfo> {
        CacheKey::for_frame(frame).and_then(|key| self.get(&key))
    }

    /// Check whether a result for `key` is known.
    #[inline]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Record a freshly produced result.
    ///
    /// Known results are never replaced. Returns `true` if the result
    /// got recorded.
    pub fn insert(&mut self, key: CacheKey, info: SymbolInfo) -> bool {
        if self.persisted.contains_key(&key) {
            return false
        }

        match self.fresh.entry(key) {
            Entry::Occupied(..) => false,
            Entry::Vacant(entry) => {
                let _info = entry.insert(info);
                true
            }
        }
    }

    /// Retrieve the results produced during this run.
    #[inline]
    pub fn fresh(&self) -> &HashMap<CacheKey, SymbolInfo> {
        &self.fresh
    }

    /// The number of known results.
    #[inline]
    pub fn len(&self) -> usize {
        self.persisted.len() + self.fresh.len()
    }

    /// Check whether no results are known.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Extend<(CacheKey, SymbolInfo)> for SymbolTable {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = (CacheKey, SymbolInfo)>,
    {
        for (key, info) in iter {
            let _inserted = self.insert(key, info);
        }
    }
}
