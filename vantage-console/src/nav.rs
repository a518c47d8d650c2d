//! Workspace tabs and project routes.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::selection::TabScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceTab {
    #[default]
    Overview,
    Services,
    Tasks,
    Reviews,
    Quality,
    Billing,
    Bids,
}

impl WorkspaceTab {
    pub fn title(&self) -> &'static str {
        match self {
            WorkspaceTab::Overview => "Overview",
            WorkspaceTab::Services => "Services",
            WorkspaceTab::Tasks => "Tasks",
            WorkspaceTab::Reviews => "Reviews",
            WorkspaceTab::Quality => "Quality",
            WorkspaceTab::Billing => "Billing",
            WorkspaceTab::Bids => "Bids",
        }
    }

    /// Path segment of the tab.
    pub fn slug(&self) -> &'static str {
        match self {
            WorkspaceTab::Overview => "overview",
            WorkspaceTab::Services => "services",
            WorkspaceTab::Tasks => "tasks",
            WorkspaceTab::Reviews => "reviews",
            WorkspaceTab::Quality => "quality",
            WorkspaceTab::Billing => "billing",
            WorkspaceTab::Bids => "bids",
        }
    }

    pub fn from_slug(slug: &str) -> Option<WorkspaceTab> {
        Self::all()
            .iter()
            .copied()
            .find(|tab| tab.slug().eq_ignore_ascii_case(slug))
    }

    /// Entity kinds that may be selected while this tab is active.
    pub fn allowed_kinds(&self) -> &'static [&'static str] {
        match self {
            WorkspaceTab::Overview => &[],
            WorkspaceTab::Services => &["service"],
            WorkspaceTab::Tasks => &["task"],
            WorkspaceTab::Reviews => &["review", "issue"],
            WorkspaceTab::Quality => &["quality_row", "issue"],
            WorkspaceTab::Billing => &["billing_line"],
            WorkspaceTab::Bids => &["bid"],
        }
    }

    pub fn all() -> &'static [WorkspaceTab] {
        &[
            WorkspaceTab::Overview,
            WorkspaceTab::Services,
            WorkspaceTab::Tasks,
            WorkspaceTab::Reviews,
            WorkspaceTab::Quality,
            WorkspaceTab::Billing,
            WorkspaceTab::Bids,
        ]
    }

    pub fn index(&self) -> usize {
        Self::all()
            .iter()
            .position(|tab| tab == self)
            .unwrap_or(0)
    }

    pub fn from_index(index: usize) -> Option<WorkspaceTab> {
        Self::all().get(index).copied()
    }

    pub fn next(&self) -> WorkspaceTab {
        let all = Self::all();
        all[(self.index() + 1) % all.len()]
    }

    pub fn previous(&self) -> WorkspaceTab {
        let all = Self::all();
        let idx = self.index();
        let prev = if idx == 0 { all.len() - 1 } else { idx - 1 };
        all[prev]
    }
}

impl TabScope for WorkspaceTab {
    fn allows(&self, kind: &str) -> bool {
        self.allowed_kinds().contains(&kind)
    }

    fn from_url(url: &Url) -> Option<Self> {
        ProjectRoute::parse(url).map(|route| route.tab)
    }

    fn apply_to_url(&self, url: &Url) -> Url {
        match ProjectRoute::parse(url) {
            Some(route) => ProjectRoute { tab: *self, ..route }.apply_to(url),
            None => url.clone(),
        }
    }
}

/// `/projects/{project_id}/{tab}`; a missing tab segment means Overview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectRoute {
    pub project_id: i64,
    pub tab: WorkspaceTab,
}

impl ProjectRoute {
    pub fn new(project_id: i64, tab: WorkspaceTab) -> Self {
        Self { project_id, tab }
    }

    pub fn parse(url: &Url) -> Option<Self> {
        let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());
        if segments.next()? != "projects" {
            return None;
        }
        let project_id = segments.next()?.parse::<i64>().ok()?;
        let tab = match segments.next() {
            Some(slug) => WorkspaceTab::from_slug(slug)?,
            None => WorkspaceTab::Overview,
        };
        if segments.next().is_some() {
            return None;
        }
        Some(Self { project_id, tab })
    }

    pub fn path(&self) -> String {
        format!("/projects/{}/{}", self.project_id, self.tab.slug())
    }

    /// The route on the same origin as `base`, with no query or fragment.
    pub fn apply_to(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_path(&self.path());
        url.set_query(None);
        url.set_fragment(None);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_tab_cycle() {
        assert_eq!(WorkspaceTab::Bids.next(), WorkspaceTab::Overview);
        assert_eq!(WorkspaceTab::Overview.previous(), WorkspaceTab::Bids);
        for tab in WorkspaceTab::all() {
            assert_eq!(WorkspaceTab::from_index(tab.index()), Some(*tab));
            assert_eq!(WorkspaceTab::from_slug(tab.slug()), Some(*tab));
        }
    }

    #[test]
    fn test_route_parse() {
        let route = ProjectRoute::parse(&url("https://console.test/projects/7/reviews?sel=review:12"));
        assert_eq!(route, Some(ProjectRoute::new(7, WorkspaceTab::Reviews)));
        assert_eq!(
            ProjectRoute::parse(&url("https://console.test/projects/7")),
            Some(ProjectRoute::new(7, WorkspaceTab::Overview))
        );
        assert_eq!(ProjectRoute::parse(&url("https://console.test/projects/x/reviews")), None);
        assert_eq!(ProjectRoute::parse(&url("https://console.test/projects/7/unknown")), None);
        assert_eq!(ProjectRoute::parse(&url("https://console.test/settings")), None);
    }

    #[test]
    fn test_apply_tab_drops_query() {
        let current = url("https://console.test/projects/7/services?sel=service:42&view=compact");
        let next = WorkspaceTab::Tasks.apply_to_url(&current);
        assert_eq!(next.as_str(), "https://console.test/projects/7/tasks");
        assert_eq!(WorkspaceTab::from_url(&next), Some(WorkspaceTab::Tasks));
    }

    #[test]
    fn test_allowed_kinds() {
        assert!(WorkspaceTab::Services.allows("service"));
        assert!(!WorkspaceTab::Tasks.allows("service"));
        assert!(WorkspaceTab::Reviews.allows("issue"));
        assert!(!WorkspaceTab::Overview.allows("service"));
    }
}
