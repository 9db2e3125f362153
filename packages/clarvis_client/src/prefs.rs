//! Sidebar preferences persisted across runs: collapsed workdirs and how
//! many sessions each workdir group shows.

use std::collections::{BTreeMap, BTreeSet};

use crate::storage::{KeyValueStore, keys, load_json, save_json};
use crate::types::{SessionWithAttention, WorkdirGroup};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewPreferences {
    pub collapsed: BTreeSet<String>,
    pub visible_counts: BTreeMap<String, usize>,
    pub default_visible: usize,
}

impl ViewPreferences {
    pub fn load(store: &dyn KeyValueStore, default_visible: usize) -> Self {
        Self {
            collapsed: load_json(store, keys::COLLAPSED_WORKDIRS, BTreeSet::new()),
            visible_counts: load_json(store, keys::VISIBLE_COUNTS, BTreeMap::new()),
            default_visible: load_json(store, keys::MAX_VISIBLE, default_visible),
        }
    }

    pub fn save(&self, store: &dyn KeyValueStore) {
        save_json(store, keys::COLLAPSED_WORKDIRS, &self.collapsed);
        save_json(store, keys::VISIBLE_COUNTS, &self.visible_counts);
        save_json(store, keys::MAX_VISIBLE, &self.default_visible);
    }

    pub fn is_collapsed(&self, workdir: &str) -> bool {
        self.collapsed.contains(workdir)
    }

    /// Returns the new collapsed state.
    pub fn toggle_collapsed(&mut self, workdir: &str) -> bool {
        if !self.collapsed.remove(workdir) {
            self.collapsed.insert(workdir.to_string());
            return true;
        }
        false
    }

    pub fn visible_count(&self, workdir: &str) -> usize {
        self.visible_counts
            .get(workdir)
            .copied()
            .unwrap_or(self.default_visible)
    }

    pub fn show_more(&mut self, workdir: &str, count: usize) {
        let current = self.visible_count(workdir);
        self.visible_counts
            .insert(workdir.to_string(), current + count);
    }

    /// Sessions of `group` that should be listed, given these preferences.
    pub fn visible_sessions<'a>(&self, group: &'a WorkdirGroup) -> &'a [SessionWithAttention] {
        if self.is_collapsed(&group.workdir) {
            return &[];
        }
        let n = self.visible_count(&group.workdir).min(group.sessions.len());
        &group.sessions[..n]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{PermissionMode, Session};
    use chrono::Utc;

    #[test]
    fn defaults_when_store_empty() {
        let store = MemoryStore::new();
        let prefs = ViewPreferences::load(&store, 5);
        assert_eq!(prefs.visible_count("/w"), 5);
        assert!(!prefs.is_collapsed("/w"));
    }

    #[test]
    fn show_more_and_collapse_persist() {
        let store = MemoryStore::new();
        let mut prefs = ViewPreferences::load(&store, 5);
        prefs.show_more("/w", 10);
        assert!(prefs.toggle_collapsed("/other"));
        prefs.save(&store);

        let reloaded = ViewPreferences::load(&store, 5);
        assert_eq!(reloaded.visible_count("/w"), 15);
        assert!(reloaded.is_collapsed("/other"));

        let mut reloaded = reloaded;
        assert!(!reloaded.toggle_collapsed("/other"));
    }

    fn group_of(n: usize) -> WorkdirGroup {
        let sessions = (0..n)
            .map(|i| SessionWithAttention {
                session: Session::placeholder(
                    format!("s{}", i),
                    "/w",
                    None,
                    PermissionMode::Default,
                    Utc::now(),
                ),
                attention: Vec::new(),
            })
            .collect();
        WorkdirGroup {
            name: "w".into(),
            workdir: "/w".into(),
            sessions,
        }
    }

    fn ids(sessions: &[SessionWithAttention]) -> Vec<&str> {
        sessions.iter().map(|s| s.session.id.as_str()).collect()
    }

    #[test]
    fn visible_sessions_respects_limit_and_collapse() {
        let group = group_of(5);
        let mut prefs = ViewPreferences::load(&MemoryStore::new(), 2);
        assert_eq!(ids(prefs.visible_sessions(&group)), vec!["s0", "s1"]);

        prefs.show_more("/w", 2);
        assert_eq!(ids(prefs.visible_sessions(&group)), vec!["s0", "s1", "s2", "s3"]);

        prefs.show_more("/w", 2);
        assert_eq!(prefs.visible_sessions(&group).len(), 5);

        prefs.toggle_collapsed("/w");
        assert!(prefs.visible_sessions(&group).is_empty());
        prefs.toggle_collapsed("/w");
        assert_eq!(prefs.visible_sessions(&group).len(), 5);

        assert!(prefs.visible_sessions(&group_of(0)).is_empty());
    }
}
