//! Application state: the query cache, the mutation coordinator and the
//! selection store wired to the remote API.

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;
use vantage_cache::{
    CacheConfig, CacheEvent, Mutation, MutationCoordinator, QueryCache, QueryWatch,
};
use vantage_core::{CacheKey, EntityRef, MutationError, MutationId};

use crate::commands::{Command, HELP};
use crate::error::ActionError;
use crate::events::ConsoleEvent;
use crate::mutations::{entity_id, CreateEntity, DeleteEntity, UpdateEntity};
use crate::nav::{ProjectRoute, WorkspaceTab};
use crate::notifications::{Notification, NotificationAction, NotificationLevel, Notifications};
use crate::queries::{entity_query, tab_keys, ApiFetcher, EntityQuery};
use crate::selection::{History, SelectionStore, TabScope};
use crate::traits::RemoteApi;

/// Whether the event loop keeps running after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct App {
    api: Arc<dyn RemoteApi>,
    cache: QueryCache<Value>,
    coordinator: MutationCoordinator<Value>,
    selection: SelectionStore<WorkspaceTab>,
    notifications: Notifications,
    /// Keys rendered by the current location.
    watches: Vec<QueryWatch<Value>>,
    settled_tx: Option<mpsc::Sender<ConsoleEvent>>,
}

impl App {
    /// Mount at `location` and start loading what it shows.
    ///
    /// Must be called inside a tokio runtime: watched keys are fetched in
    /// the background.
    pub fn new(api: Arc<dyn RemoteApi>, cache_config: CacheConfig, location: Url) -> Self {
        let cache = QueryCache::new(cache_config);
        let coordinator = MutationCoordinator::new(cache.clone());
        let mut app = Self {
            api,
            cache,
            coordinator,
            selection: SelectionStore::mount(History::new(location)),
            notifications: Notifications::default(),
            watches: Vec::new(),
            settled_tx: None,
        };
        app.rewatch();
        app
    }

    pub fn cache(&self) -> &QueryCache<Value> {
        &self.cache
    }

    pub fn coordinator(&self) -> &MutationCoordinator<Value> {
        &self.coordinator
    }

    pub fn selection_store(&self) -> &SelectionStore<WorkspaceTab> {
        &self.selection
    }

    pub fn selection(&self) -> Option<&EntityRef> {
        self.selection.selection()
    }

    pub fn active_tab(&self) -> WorkspaceTab {
        *self.selection.tab()
    }

    pub fn location(&self) -> &Url {
        self.selection.url()
    }

    pub fn project_id(&self) -> Option<i64> {
        ProjectRoute::parse(self.location()).map(|route| route.project_id)
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn notify(&mut self, level: NotificationLevel, message: impl Into<String>) {
        self.notifications.push(Notification::new(level, message));
    }

    /// Collection keys of the active tab, then the detail key of the
    /// selection.
    pub fn visible_keys(&self) -> Vec<CacheKey> {
        let Some(project_id) = self.project_id() else {
            return Vec::new();
        };
        let mut keys = tab_keys(self.active_tab(), project_id);
        if let Some(selected) = self.selection() {
            if let Some(query) = entity_query(&selected.kind) {
                keys.push(query.detail_key(&selected.id));
            }
        }
        keys
    }

    /// True if `event` changed something the current location shows.
    pub fn is_visible(&self, event: &CacheEvent) -> bool {
        self.visible_keys().iter().any(|key| event.touches(key))
    }

    fn rewatch(&mut self) {
        let keys = self.visible_keys();
        let unchanged = keys.len() == self.watches.len()
            && keys.iter().zip(&self.watches).all(|(key, watch)| watch.key() == key);
        if unchanged {
            return;
        }
        let fetcher = ApiFetcher::new(Arc::clone(&self.api));
        // Watch the new keys before releasing the old ones so shared keys
        // never drop to zero watchers.
        let watches = keys
            .into_iter()
            .map(|key| self.cache.watch(key, fetcher.clone()))
            .collect();
        self.watches = watches;
    }

    /// Wait for every visible key to load. Failures become notifications
    /// offering a retry.
    pub async fn load_visible(&mut self) {
        let keys = self.visible_keys();
        let fetcher = ApiFetcher::new(Arc::clone(&self.api));
        let results = join_all(
            keys.iter()
                .map(|key| self.cache.ensure(key.clone(), fetcher.clone())),
        )
        .await;
        for (key, result) in keys.into_iter().zip(results) {
            match result {
                Ok(_) => self.notifications.resolve_retry(&key),
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "query failed to load");
                    self.notifications.resolve_retry(&key);
                    self.notifications.push(
                        Notification::new(
                            NotificationLevel::Warning,
                            format!("Could not load {}: {}", key, err.message),
                        )
                        .with_action(NotificationAction::Retry(key)),
                    );
                }
            }
        }
    }

    async fn location_changed(&mut self) {
        self.rewatch();
        self.load_visible().await;
    }

    // ========================================================================
    // NAVIGATION
    // ========================================================================

    pub async fn open_tab(&mut self, tab: WorkspaceTab) {
        self.selection.on_tab_change(tab);
        self.location_changed().await;
    }

    /// Returns false when the active tab does not allow the entity's kind;
    /// the selection is cleared in that case.
    pub async fn select(&mut self, entity: EntityRef) -> bool {
        let selected = self.selection.select(&entity.kind, entity.id).is_some();
        self.location_changed().await;
        selected
    }

    pub fn escape(&mut self) -> bool {
        let closed = self.selection.on_escape();
        if closed {
            self.rewatch();
        }
        closed
    }

    pub async fn navigate(&mut self, url: Url) {
        self.selection.navigate(url);
        self.location_changed().await;
    }

    pub async fn back(&mut self) -> bool {
        let moved = self.selection.back();
        if moved {
            self.location_changed().await;
        }
        moved
    }

    pub async fn forward(&mut self) -> bool {
        let moved = self.selection.forward();
        if moved {
            self.location_changed().await;
        }
        moved
    }

    /// Mark everything visible stale and reload it.
    pub async fn refresh(&mut self) {
        let keys = self.visible_keys();
        self.cache.invalidate(|key| keys.contains(key));
        self.load_visible().await;
    }

    /// Refetch the query named by the latest retry notification.
    pub async fn retry(&mut self) -> bool {
        let Some(key) = self.notifications.retry_target().cloned() else {
            return false;
        };
        self.notifications.resolve_retry(&key);
        match self.cache.refetch(&key).await {
            Some(Ok(_)) => true,
            Some(Err(err)) => {
                self.notifications.push(
                    Notification::new(
                        NotificationLevel::Warning,
                        format!("Could not load {}: {}", key, err.message),
                    )
                    .with_action(NotificationAction::Retry(key)),
                );
                false
            }
            None => false,
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    fn entity_target(&self, kind: &str) -> Result<(i64, &'static EntityQuery), ActionError> {
        let project_id = self.project_id().ok_or(ActionError::NoProject)?;
        let query = entity_query(kind).ok_or_else(|| ActionError::UnknownKind(kind.to_string()))?;
        Ok((project_id, query))
    }

    fn has_value(&self, key: &CacheKey) -> bool {
        self.cache.get(key).map(|entry| entry.has_value()).unwrap_or(false)
    }

    fn report_failure(&mut self, err: &MutationError, fallback: &str) {
        self.notify(NotificationLevel::Error, err.user_message(fallback));
    }

    /// Route settled writes issued by [`App::dispatch`] to `sender` instead
    /// of waiting for them inside `dispatch`.
    pub fn forward_settled_writes(&mut self, sender: mpsc::Sender<ConsoleEvent>) {
        self.settled_tx = Some(sender);
    }

    /// Apply a patch optimistically and send it. The change is visible as
    /// soon as this returns.
    pub fn begin_update(
        &self,
        target: EntityRef,
        patch: Map<String, Value>,
    ) -> Result<PendingWrite, ActionError> {
        let (project_id, query) = self.entity_target(&target.kind)?;
        let collection_key = query.collection_key(project_id);
        let collection = self.has_value(&collection_key).then_some(collection_key);
        let detail_loaded = self.has_value(&query.detail_key(&target.id));
        let mutation = UpdateEntity::new(
            Arc::clone(&self.api),
            query,
            target.clone(),
            patch,
            collection,
            detail_loaded,
        );
        let fallback = mutation.failure_message().to_string();
        let pending = self.coordinator.spawn(mutation);
        Ok(PendingWrite {
            id: pending.id(),
            action: WriteAction::Update(target),
            fallback,
            outcome: pending.join().boxed(),
        })
    }

    pub fn begin_create(
        &self,
        kind: &str,
        body: Map<String, Value>,
    ) -> Result<PendingWrite, ActionError> {
        let (project_id, query) = self.entity_target(kind)?;
        let loaded = self.has_value(&query.collection_key(project_id));
        let mutation = CreateEntity::new(Arc::clone(&self.api), query, project_id, body, loaded);
        let fallback = mutation.failure_message().to_string();
        let pending = self.coordinator.spawn(mutation);
        Ok(PendingWrite {
            id: pending.id(),
            action: WriteAction::Create {
                kind: query.kind,
                project_id,
            },
            fallback,
            outcome: pending.join().boxed(),
        })
    }

    pub fn begin_delete(&self, target: EntityRef) -> Result<PendingWrite, ActionError> {
        let (project_id, query) = self.entity_target(&target.kind)?;
        let loaded = self.has_value(&query.collection_key(project_id));
        let mutation = DeleteEntity::new(
            Arc::clone(&self.api),
            query,
            project_id,
            target.clone(),
            loaded,
        );
        let fallback = mutation.failure_message().to_string();
        let pending = self.coordinator.spawn(mutation);
        Ok(PendingWrite {
            id: pending.id(),
            action: WriteAction::Delete(target),
            fallback,
            outcome: pending.join().map(|result| result.map(|()| Value::Null)).boxed(),
        })
    }

    /// Report a settled write and apply its follow-ups: a created entity is
    /// opened, a deleted one is closed.
    pub async fn finish_write(&mut self, settled: SettledWrite) -> Result<Value, ActionError> {
        let SettledWrite {
            action,
            fallback,
            result,
        } = settled;
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                self.report_failure(&err, &fallback);
                return Err(err.into());
            }
        };
        match action {
            WriteAction::Update(target) => {
                self.notify(NotificationLevel::Success, format!("Saved {}", target));
            }
            WriteAction::Create { kind, project_id } => match entity_id(&value) {
                Some(id) => {
                    let created = EntityRef::new(kind, id);
                    self.notify(NotificationLevel::Success, format!("Created {}", created));
                    // The user may have moved on while the request was out.
                    if self.project_id() == Some(project_id) && self.active_tab().allows(kind) {
                        self.select(created).await;
                    }
                }
                None => self.notify(NotificationLevel::Success, format!("Created {}", kind)),
            },
            WriteAction::Delete(target) => {
                if self.selection.clear_if_selected(&target) {
                    self.rewatch();
                }
                if let Some(query) = entity_query(&target.kind) {
                    self.cache.invalidate_key(&query.detail_key(&target.id));
                }
                self.notify(NotificationLevel::Success, format!("Deleted {}", target));
            }
        }
        Ok(value)
    }

    /// Patch an entity and wait for the server. The change is visible
    /// immediately and undone if the server refuses it.
    pub async fn update_entity(
        &mut self,
        target: EntityRef,
        patch: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let pending = self.begin_update(target, patch)?;
        self.finish_write(pending.settle().await).await
    }

    /// Create an entity and open it when the active tab shows its kind.
    pub async fn create_entity(
        &mut self,
        kind: &str,
        body: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let pending = self.begin_create(kind, body)?;
        self.finish_write(pending.settle().await).await
    }

    /// Delete an entity, closing the detail pane if it showed it.
    pub async fn delete_entity(&mut self, target: EntityRef) -> Result<(), ActionError> {
        let pending = self.begin_delete(target)?;
        self.finish_write(pending.settle().await).await.map(|_| ())
    }

    /// Hand a started write to the event loop, or wait for it here when
    /// no loop is listening.
    async fn issue(&mut self, write: Result<PendingWrite, ActionError>) {
        let pending = match write {
            Ok(pending) => pending,
            Err(err) => {
                self.notify(NotificationLevel::Error, err.to_string());
                return;
            }
        };
        let Some(sender) = self.settled_tx.clone() else {
            let settled = pending.settle().await;
            let _ = self.finish_write(settled).await;
            return;
        };
        tokio::spawn(async move {
            let settled = pending.settle().await;
            if sender.send(ConsoleEvent::WriteSettled(settled)).await.is_err() {
                tracing::debug!("event loop closed before a write settled");
            }
        });
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Run one command. Writes return as soon as their optimistic value is
    /// applied when settled writes are forwarded to an event loop.
    pub async fn dispatch(&mut self, command: Command) -> Flow {
        match command {
            Command::Quit => return Flow::Quit,
            Command::Help => self.notify(NotificationLevel::Info, HELP),
            Command::Show => {}
            Command::NextTab => self.open_tab(self.active_tab().next()).await,
            Command::PrevTab => self.open_tab(self.active_tab().previous()).await,
            Command::SwitchTab(tab) => self.open_tab(tab).await,
            Command::Select(entity) => {
                let label = entity.to_string();
                if !self.select(entity).await {
                    self.notify(
                        NotificationLevel::Info,
                        format!("{} cannot be opened in {}", label, self.active_tab().title()),
                    );
                }
            }
            Command::Escape => {
                self.escape();
            }
            Command::Back => {
                self.back().await;
            }
            Command::Forward => {
                self.forward().await;
            }
            Command::Open(url) => self.navigate(url).await,
            Command::Refresh => self.refresh().await,
            Command::Retry => {
                if !self.retry().await {
                    self.notify(NotificationLevel::Info, "Nothing to retry");
                }
            }
            Command::Update { target, patch } => {
                let write = self.begin_update(target, patch);
                self.issue(write).await;
            }
            Command::Create { kind, body } => {
                let write = self.begin_create(&kind, body);
                self.issue(write).await;
            }
            Command::Delete(target) => {
                let write = self.begin_delete(target);
                self.issue(write).await;
            }
        }
        Flow::Continue
    }
}

/// What a write was for, kept so its outcome can be reported later.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAction {
    Update(EntityRef),
    Create { kind: &'static str, project_id: i64 },
    Delete(EntityRef),
}

/// A write whose optimistic value is already showing.
pub struct PendingWrite {
    id: MutationId,
    action: WriteAction,
    fallback: String,
    outcome: BoxFuture<'static, Result<Value, MutationError>>,
}

impl PendingWrite {
    pub fn id(&self) -> MutationId {
        self.id
    }

    pub fn action(&self) -> &WriteAction {
        &self.action
    }

    /// Wait for the server's answer.
    pub async fn settle(self) -> SettledWrite {
        SettledWrite {
            action: self.action,
            fallback: self.fallback,
            result: self.outcome.await,
        }
    }
}

/// The server's answer to a write, not yet reported to the user.
#[derive(Debug, Clone)]
pub struct SettledWrite {
    pub action: WriteAction,
    /// Shown when the failure carries no server message.
    pub fallback: String,
    /// Deletes succeed with `null`.
    pub result: Result<Value, MutationError>,
}
