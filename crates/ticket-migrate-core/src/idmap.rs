//! Identifier maps between source and target records.
//!
//! Each migrated space builds one [`IdentifierMap`] as its passes run. The
//! external-link pass merges every batch into a [`GlobalIdMap`] so that
//! references crossing space boundaries can be resolved.
//!
//! | Kind | Key | Value |
//! |------|-----|-------|
//! | `UserId` | source user id | target account id |
//! | `UserName` | target account id | display name |
//! | `UserLogin` | source login | target account id |
//! | `TicketNumber` | source ticket number | target issue key |
//! | `TicketId` | source ticket id | target issue id |
//! | `CommentId` | source comment id | target comment id |
//!
//! Entries are insert-once: a second `put` for a key already present is an
//! invariant violation and is rejected with [`MapError::Duplicate`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use thiserror::Error;

use crate::models::SourceSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapKind {
    UserId,
    UserName,
    UserLogin,
    TicketNumber,
    TicketId,
    CommentId,
}

impl MapKind {
    /// Kinds whose keys are unique across every space. Ticket numbers
    /// restart at 1 in each space and must be looked up per batch.
    pub fn is_global(&self) -> bool {
        !matches!(self, MapKind::TicketNumber)
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MapKind::UserId => "user id",
            MapKind::UserName => "user name",
            MapKind::UserLogin => "user login",
            MapKind::TicketNumber => "ticket number",
            MapKind::TicketId => "ticket id",
            MapKind::CommentId => "comment id",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("duplicate {kind} mapping for '{key}': already '{existing}', attempted '{attempted}'")]
    Duplicate {
        kind: MapKind,
        key: String,
        existing: String,
        attempted: String,
    },
}

/// Insert-once tables for one migration batch.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMap {
    tables: HashMap<MapKind, HashMap<String, String>>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping. Fails if `key` is already mapped for `kind`, even
    /// to the same value; the existing entry is left untouched.
    pub fn put(
        &mut self,
        kind: MapKind,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MapError> {
        let key = key.into();
        let value = value.into();
        let table = self.tables.entry(kind).or_default();
        if let Some(existing) = table.get(&key) {
            return Err(MapError::Duplicate {
                kind,
                key,
                existing: existing.clone(),
                attempted: value,
            });
        }
        table.insert(key, value);
        Ok(())
    }

    pub fn get(&self, kind: MapKind, key: &str) -> Option<&str> {
        self.tables
            .get(&kind)
            .and_then(|t| t.get(key))
            .map(String::as_str)
    }

    pub fn contains(&self, kind: MapKind, key: &str) -> bool {
        self.get(kind, key).is_some()
    }

    pub fn len(&self, kind: MapKind) -> usize {
        self.tables.get(&kind).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(HashMap::is_empty)
    }

    /// Entries of one kind, sorted by key.
    pub fn entries(&self, kind: MapKind) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .tables
            .get(&kind)
            .map(|t| t.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect())
            .unwrap_or_default();
        out.sort();
        out
    }
}

/// Merged view over every batch.
///
/// Global kinds are merged into one shared table; ticket numbers stay per
/// space. Conflicting values for the same global key are collected rather
/// than overwritten.
#[derive(Debug, Default)]
pub struct GlobalIdMap {
    batches: BTreeMap<String, IdentifierMap>,
    global: IdentifierMap,
    conflicts: Vec<MapError>,
}

impl GlobalIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&mut self, space: impl Into<String>, batch: IdentifierMap) {
        for (kind, table) in &batch.tables {
            if !kind.is_global() {
                continue;
            }
            for (key, value) in table {
                match self.global.get(*kind, key) {
                    Some(existing) if existing == value => {}
                    _ => {
                        if let Err(e) = self.global.put(*kind, key.clone(), value.clone()) {
                            self.conflicts.push(e);
                        }
                    }
                }
            }
        }
        self.batches.insert(space.into(), batch);
    }

    pub fn spaces(&self) -> impl Iterator<Item = &str> {
        self.batches.keys().map(String::as_str)
    }

    pub fn batch(&self, space: &str) -> Option<&IdentifierMap> {
        self.batches.get(space)
    }

    /// Look `key` up in the batch of `space`, falling back to the merged
    /// table for kinds that are unique across spaces.
    pub fn get_in(&self, space: &str, kind: MapKind, key: &str) -> Option<&str> {
        self.batches
            .get(space)
            .and_then(|b| b.get(kind, key))
            .or_else(|| {
                if kind.is_global() {
                    self.global.get(kind, key)
                } else {
                    None
                }
            })
    }

    pub fn get(&self, kind: MapKind, key: &str) -> Option<&str> {
        self.global.get(kind, key)
    }

    pub fn conflicts(&self) -> &[MapError] {
        &self.conflicts
    }
}

/// Resolves a space reference found in content to the canonical space name.
///
/// References may carry the display name, the wiki name, or the internal
/// id. Resolution tries the name first, then the alias table, and caches
/// both hits and misses for the rest of the run.
#[derive(Debug, Default)]
pub struct SpaceResolver {
    known: HashSet<String>,
    aliases: HashMap<String, String>,
    cache: HashMap<String, Option<String>>,
}

impl SpaceResolver {
    pub fn new<I, S>(known: I, spaces: &[SourceSpace]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut aliases = HashMap::new();
        for space in spaces {
            if !space.id.is_empty() {
                aliases.insert(space.id.clone(), space.name.clone());
            }
            if !space.wiki_name.is_empty() {
                aliases.insert(space.wiki_name.clone(), space.name.clone());
            }
        }
        Self {
            known: known.into_iter().map(Into::into).collect(),
            aliases,
            cache: HashMap::new(),
        }
    }

    /// Canonical name for `reference`, or `None` when no batch covers it.
    pub fn resolve(&mut self, reference: &str) -> Option<String> {
        if let Some(hit) = self.cache.get(reference) {
            return hit.clone();
        }
        let decoded = urlencoding::decode(reference)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| reference.to_string());
        let resolved = if self.known.contains(&decoded) {
            Some(decoded)
        } else {
            self.aliases
                .get(&decoded)
                .filter(|name| self.known.contains(*name))
                .cloned()
        };
        self.cache.insert(reference.to_string(), resolved.clone());
        resolved
    }

    /// Number of distinct references resolved so far (hits and misses).
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(id: &str, name: &str, wiki: &str) -> SourceSpace {
        SourceSpace {
            id: id.into(),
            name: name.into(),
            wiki_name: wiki.into(),
        }
    }

    #[test]
    fn test_put_then_get() {
        let mut map = IdentifierMap::new();
        map.put(MapKind::TicketNumber, "42", "EA-7").unwrap();
        assert_eq!(map.get(MapKind::TicketNumber, "42"), Some("EA-7"));
        assert_eq!(map.get(MapKind::TicketId, "42"), None);
        assert_eq!(map.len(MapKind::TicketNumber), 1);
    }

    #[test]
    fn test_second_put_is_rejected() {
        let mut map = IdentifierMap::new();
        map.put(MapKind::TicketId, "100", "10001").unwrap();
        let err = map.put(MapKind::TicketId, "100", "10002").unwrap_err();
        assert_eq!(
            err,
            MapError::Duplicate {
                kind: MapKind::TicketId,
                key: "100".into(),
                existing: "10001".into(),
                attempted: "10002".into(),
            }
        );
        assert_eq!(map.get(MapKind::TicketId, "100"), Some("10001"));
    }

    #[test]
    fn test_same_value_put_is_still_flagged() {
        let mut map = IdentifierMap::new();
        map.put(MapKind::CommentId, "5", "9").unwrap();
        assert!(map.put(MapKind::CommentId, "5", "9").is_err());
    }

    #[test]
    fn test_global_merge_keeps_ticket_numbers_per_space() {
        let mut a = IdentifierMap::new();
        a.put(MapKind::TicketNumber, "1", "AA-1").unwrap();
        a.put(MapKind::TicketId, "t-a1", "100").unwrap();
        let mut b = IdentifierMap::new();
        b.put(MapKind::TicketNumber, "1", "BB-1").unwrap();
        b.put(MapKind::TicketId, "t-b1", "200").unwrap();

        let mut global = GlobalIdMap::new();
        global.add_batch("Alpha", a);
        global.add_batch("Beta", b);

        assert_eq!(global.get_in("Alpha", MapKind::TicketNumber, "1"), Some("AA-1"));
        assert_eq!(global.get_in("Beta", MapKind::TicketNumber, "1"), Some("BB-1"));
        assert_eq!(global.get_in("Alpha", MapKind::TicketId, "t-b1"), Some("200"));
        assert_eq!(global.get(MapKind::TicketNumber, "1"), None);
        assert!(global.conflicts().is_empty());
    }

    #[test]
    fn test_global_merge_flags_conflicts() {
        let mut a = IdentifierMap::new();
        a.put(MapKind::UserId, "u1", "acc-1").unwrap();
        let mut b = IdentifierMap::new();
        b.put(MapKind::UserId, "u1", "acc-1").unwrap();
        let mut c = IdentifierMap::new();
        c.put(MapKind::UserId, "u1", "acc-2").unwrap();

        let mut global = GlobalIdMap::new();
        global.add_batch("A", a);
        global.add_batch("B", b);
        assert!(global.conflicts().is_empty());
        global.add_batch("C", c);
        assert_eq!(global.conflicts().len(), 1);
        assert_eq!(global.get(MapKind::UserId, "u1"), Some("acc-1"));
    }

    #[test]
    fn test_space_resolver_falls_back_to_aliases() {
        let spaces = vec![
            space("dXk3", "Europeana APIs", "europeana-apis"),
            space("zz9", "Other", "other"),
        ];
        let mut resolver = SpaceResolver::new(["Europeana APIs"], &spaces);
        assert_eq!(resolver.resolve("Europeana%20APIs").as_deref(), Some("Europeana APIs"));
        assert_eq!(resolver.resolve("europeana-apis").as_deref(), Some("Europeana APIs"));
        assert_eq!(resolver.resolve("dXk3").as_deref(), Some("Europeana APIs"));
        // Known alias but no batch for it.
        assert_eq!(resolver.resolve("other"), None);
        assert_eq!(resolver.resolve("nowhere"), None);
        assert_eq!(resolver.cached(), 5);
        assert_eq!(resolver.resolve("nowhere"), None);
        assert_eq!(resolver.cached(), 5);
    }

    #[test]
    fn test_resolve_keeps_plus_signs() {
        let mut resolver = SpaceResolver::new(["C++ Tools", "100% Done"], &[]);
        assert_eq!(resolver.resolve("C++%20Tools").as_deref(), Some("C++ Tools"));
        assert_eq!(resolver.resolve("C++ Tools").as_deref(), Some("C++ Tools"));
        assert_eq!(resolver.resolve("C%2B%2B%20Tools").as_deref(), Some("C++ Tools"));
        // Not valid percent-encoding: matched as written.
        assert_eq!(resolver.resolve("100% Done").as_deref(), Some("100% Done"));
    }
}
