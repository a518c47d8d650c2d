//! URL-synchronized selection.
//!
//! The `sel` query parameter of the current location is the single source
//! of truth for which entity is open in the detail pane. The store keeps a
//! parsed copy of it, and every mutation of the selection goes through the
//! URL first, so reloading or sharing a link restores the same view.
//!
//! ```text
//! https://console.example/projects/7/services?sel=service:42
//!                                   tab ─┘        └─ kind:id
//! ```

use std::fmt;
use url::Url;
use vantage_core::{EntityId, EntityRef, SelectionParseError};

/// Query parameter holding the selection.
pub const SELECTION_PARAM: &str = "sel";

/// The tab dimension of a location.
///
/// A tab decides which entity kinds may be selected while it is active and
/// how to move a URL onto it.
pub trait TabScope: Clone + PartialEq + Default + fmt::Debug {
    fn allows(&self, kind: &str) -> bool;

    /// The tab a URL points at, if any.
    fn from_url(url: &Url) -> Option<Self>;

    /// `url` moved onto this tab. Must not carry a selection.
    fn apply_to_url(&self, url: &Url) -> Url;
}

/// Parse the selection out of `url`, given the active tab.
///
/// Malformed values and kinds the tab does not allow are errors; callers
/// treat every error as "nothing selected".
pub fn parse_selection<T: TabScope>(url: &Url, tab: &T) -> Result<EntityRef, SelectionParseError> {
    let raw = url
        .query_pairs()
        .find(|(name, _)| name == SELECTION_PARAM)
        .map(|(_, value)| value.into_owned())
        .ok_or(SelectionParseError::Missing)?;
    let entity = EntityRef::parse(&raw)?;
    if !tab.allows(&entity.kind) {
        return Err(SelectionParseError::KindNotAllowed(entity.kind));
    }
    Ok(entity)
}

/// `url` with its selection replaced. Other query parameters are kept in
/// order.
pub fn with_selection(url: &Url, selection: Option<&EntityRef>) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != SELECTION_PARAM)
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    let mut next = url.clone();
    if kept.is_empty() && selection.is_none() {
        next.set_query(None);
        return next;
    }
    {
        let mut pairs = next.query_pairs_mut();
        pairs.clear();
        for (name, value) in &kept {
            pairs.append_pair(name, value);
        }
        if let Some(entity) = selection {
            pairs.append_pair(SELECTION_PARAM, &entity.to_string());
        }
    }
    next
}

/// Session history: a list of locations and a cursor.
#[derive(Debug, Clone)]
pub struct History {
    entries: Vec<Url>,
    cursor: usize,
}

impl History {
    pub fn new(initial: Url) -> Self {
        Self {
            entries: vec![initial],
            cursor: 0,
        }
    }

    pub fn current(&self) -> &Url {
        &self.entries[self.cursor]
    }

    /// Add an entry after the current one, dropping any forward entries.
    pub fn push(&mut self, url: Url) {
        self.entries.truncate(self.cursor + 1);
        self.entries.push(url);
        self.cursor = self.entries.len() - 1;
    }

    /// Overwrite the current entry.
    pub fn replace(&mut self, url: Url) {
        self.entries[self.cursor] = url;
    }

    pub fn back(&mut self) -> bool {
        if !self.can_go_back() {
            return false;
        }
        self.cursor -= 1;
        true
    }

    pub fn forward(&mut self) -> bool {
        if !self.can_go_forward() {
            return false;
        }
        self.cursor += 1;
        true
    }

    pub fn can_go_back(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_go_forward(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Url] {
        &self.entries
    }
}

/// Selection state bound to a [`History`].
///
/// Invariant: after every operation, `selection()` equals what
/// [`parse_selection`] reads from `url()` under `tab()`.
#[derive(Debug, Clone)]
pub struct SelectionStore<T: TabScope> {
    history: History,
    tab: T,
    selection: Option<EntityRef>,
}

impl<T: TabScope> SelectionStore<T> {
    /// Bind to `history` and read the initial state from its current entry.
    pub fn mount(history: History) -> Self {
        let (tab, selection) = derive_state::<T>(history.current());
        Self {
            history,
            tab,
            selection,
        }
    }

    pub fn selection(&self) -> Option<&EntityRef> {
        self.selection.as_ref()
    }

    pub fn is_selected(&self, entity: &EntityRef) -> bool {
        self.selection.as_ref() == Some(entity)
    }

    pub fn tab(&self) -> &T {
        &self.tab
    }

    pub fn url(&self) -> &Url {
        self.history.current()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Re-read tab and selection from the current URL. Run after any
    /// navigation that did not go through the store.
    pub fn sync_from_url(&mut self) {
        let (tab, selection) = derive_state::<T>(self.history.current());
        self.tab = tab;
        self.selection = selection;
    }

    /// Follow a link.
    pub fn navigate(&mut self, url: Url) {
        self.history.push(url);
        self.sync_from_url();
    }

    pub fn back(&mut self) -> bool {
        let moved = self.history.back();
        if moved {
            self.sync_from_url();
        }
        moved
    }

    pub fn forward(&mut self) -> bool {
        let moved = self.history.forward();
        if moved {
            self.sync_from_url();
        }
        moved
    }

    /// Open `kind:id` in the detail pane.
    ///
    /// A kind the active tab does not allow clears the selection instead,
    /// so the URL never carries a selection the tab would ignore. The
    /// stored selection is whatever the rewritten URL parses back to, so
    /// `Text("42")` is held as `Number(42)` and an empty id clears.
    pub fn select(&mut self, kind: &str, id: impl Into<EntityId>) -> Option<&EntityRef> {
        if !self.tab.allows(kind) {
            tracing::debug!(kind, tab = ?self.tab, "selection kind not allowed in tab");
            self.clear();
            return None;
        }
        let entity = EntityRef::new(kind, id);
        let next = with_selection(self.history.current(), Some(&entity));
        self.history.replace(next);
        self.sync_from_url();
        if self.selection.is_none() {
            tracing::debug!(%entity, "selection does not survive the url");
            self.clear();
        }
        self.selection.as_ref()
    }

    pub fn clear(&mut self) {
        let next = with_selection(self.history.current(), None);
        if &next != self.history.current() {
            self.history.replace(next);
        }
        self.selection = None;
    }

    /// Clear the selection if it is `entity`.
    pub fn clear_if_selected(&mut self, entity: &EntityRef) -> bool {
        if !self.is_selected(entity) {
            return false;
        }
        self.clear();
        true
    }

    /// Escape closes the detail pane. Returns whether anything was open.
    pub fn on_escape(&mut self) -> bool {
        if self.selection.is_none() {
            return false;
        }
        self.clear();
        true
    }

    /// Switch tabs. The selection never survives a tab change: the
    /// current entry loses its `sel` and the new tab is pushed.
    pub fn on_tab_change(&mut self, tab: T) {
        if tab == self.tab {
            return;
        }
        self.clear();
        let next = tab.apply_to_url(self.history.current());
        self.history.push(next);
        self.sync_from_url();
        if self.tab != tab {
            tracing::warn!(tab = ?tab, url = %self.url(), "tab change did not produce a tab route");
        }
    }
}

fn derive_state<T: TabScope>(url: &Url) -> (T, Option<EntityRef>) {
    let tab = T::from_url(url).unwrap_or_default();
    let selection = match parse_selection(url, &tab) {
        Ok(entity) => Some(entity),
        Err(SelectionParseError::Missing) => None,
        Err(err) => {
            tracing::debug!(error = %err, "ignoring selection in url");
            None
        }
    };
    (tab, selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav::WorkspaceTab;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_selection() {
        let current = url("https://console.test/projects/7/services?sel=service:42");
        let entity = parse_selection(&current, &WorkspaceTab::Services).unwrap();
        assert_eq!(entity, EntityRef::new("service", 42));

        assert_eq!(
            parse_selection(&current, &WorkspaceTab::Tasks),
            Err(SelectionParseError::KindNotAllowed("service".to_string()))
        );
        assert_eq!(
            parse_selection(&url("https://console.test/projects/7/services"), &WorkspaceTab::Services),
            Err(SelectionParseError::Missing)
        );
        assert!(matches!(
            parse_selection(&url("https://console.test/projects/7/services?sel=service"), &WorkspaceTab::Services),
            Err(SelectionParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_with_selection_keeps_other_params() {
        let current = url("https://console.test/projects/7/reviews?view=compact&sel=review:11");
        let next = with_selection(&current, Some(&EntityRef::new("review", 12)));
        let pairs: Vec<(String, String)> = next.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("view".to_string(), "compact".to_string()),
                ("sel".to_string(), "review:12".to_string()),
            ]
        );

        let cleared = with_selection(&next, None);
        assert_eq!(cleared.query(), Some("view=compact"));
        let bare = with_selection(&url("https://console.test/projects/7/reviews?sel=review:11"), None);
        assert_eq!(bare.query(), None);
    }

    #[test]
    fn test_history_push_truncates_forward() {
        let mut history = History::new(url("https://console.test/a"));
        history.push(url("https://console.test/b"));
        history.push(url("https://console.test/c"));
        assert!(history.back());
        assert!(history.back());
        assert!(!history.back());
        history.push(url("https://console.test/d"));
        assert_eq!(history.len(), 2);
        assert!(!history.can_go_forward());
        assert_eq!(history.current().path(), "/d");
    }

    #[test]
    fn test_mount_ignores_disallowed_kind() {
        let history = History::new(url("https://console.test/projects/7/tasks?sel=service:42"));
        let store: SelectionStore<WorkspaceTab> = SelectionStore::mount(history);
        assert_eq!(store.tab(), &WorkspaceTab::Tasks);
        assert_eq!(store.selection(), None);
    }

    #[test]
    fn test_select_disallowed_kind_clears() {
        let history = History::new(url("https://console.test/projects/7/reviews?sel=review:12"));
        let mut store: SelectionStore<WorkspaceTab> = SelectionStore::mount(history);
        assert_eq!(store.selection(), Some(&EntityRef::new("review", 12)));

        assert_eq!(store.select("billing_line", 3), None);
        assert_eq!(store.selection(), None);
        assert_eq!(store.url().query(), None);
    }

    #[test]
    fn test_select_stores_what_the_url_reads_back() {
        let history = History::new(url("https://console.test/projects/7/services"));
        let mut store: SelectionStore<WorkspaceTab> = SelectionStore::mount(history);

        let selected = store.select("service", EntityId::Text("42".to_string())).cloned();
        assert_eq!(selected, Some(EntityRef::new("service", EntityId::Number(42))));
        assert_eq!(
            parse_selection(store.url(), store.tab()).ok().as_ref(),
            store.selection()
        );

        assert_eq!(store.select("service", EntityId::Text(String::new())), None);
        assert_eq!(store.selection(), None);
        assert_eq!(store.url().query(), None);
    }

    #[test]
    fn test_escape() {
        let history = History::new(url("https://console.test/projects/7/services"));
        let mut store: SelectionStore<WorkspaceTab> = SelectionStore::mount(history);
        assert!(!store.on_escape());
        store.select("service", 42);
        assert!(store.on_escape());
        assert_eq!(store.selection(), None);
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn test_same_tab_change_is_noop() {
        let history = History::new(url("https://console.test/projects/7/services?sel=service:42"));
        let mut store: SelectionStore<WorkspaceTab> = SelectionStore::mount(history);
        store.on_tab_change(WorkspaceTab::Services);
        assert_eq!(store.selection(), Some(&EntityRef::new("service", 42)));
        assert_eq!(store.history().len(), 1);
    }
}
