//! Peer-local view of the other registered peers

use std::collections::BTreeMap;

use punch_core::RosterEntry;

/// Name-keyed roster, rebuilt from `[PLU]` messages
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: BTreeMap<String, RosterEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `entry.name`
    pub fn upsert(&mut self, entry: RosterEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, name: &str) -> Option<&RosterEntry> {
        self.entries.get(name)
    }

    /// Entries ordered by name
    pub fn entries(&self) -> Vec<RosterEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_overwrites_by_name() {
        let mut roster = Roster::new();
        roster.upsert(RosterEntry::new("bob", "10.0.0.2:4000".parse().unwrap()));
        roster.upsert(RosterEntry::new("bob", "10.0.0.2:4100".parse().unwrap()));

        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get("bob").unwrap().port, 4100);
    }

    #[test]
    fn test_clear() {
        let mut roster = Roster::new();
        roster.upsert(RosterEntry::new("bob", "10.0.0.2:4000".parse().unwrap()));
        roster.clear();
        assert!(roster.is_empty());
        assert!(roster.get("bob").is_none());
    }

    #[test]
    fn test_entries_sorted() {
        let mut roster = Roster::new();
        for name in ["carol", "alice", "bob"] {
            roster.upsert(RosterEntry::new(name, "10.0.0.9:1".parse().unwrap()));
        }
        let names: Vec<_> = roster.entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
    }
}
