//! Keeps one open view's unread flags in step with the change feed.
//!
//! A [`Reconciler`] belongs to exactly one live view and is driven from that
//! view's task only, so it holds plain state and no locks. Its lifecycle is
//! `Idle -> Syncing -> Live -> Idle`; deliveries that arrive while not `Live`
//! are dropped.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::{
    db,
    feed::{ChangeEvent, ChangeFeed, ChangeOp, Delivery, Filter, Subscription, Table},
    tracker::{ContentKind, Tracker},
    viewer::Viewer,
};

const TABLES: [Table; 3] = [Table::Messages, Table::MediaItems, Table::MessageReads];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Syncing,
    Live,
}

/// The surface a view currently has open. Events for it count as seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Focus {
    pub organization_id: Uuid,
    pub kind: ContentKind,
}

/// One-shot alert for content that landed somewhere the viewer isn't looking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub organization_id: Uuid,
    pub organization_name: String,
    pub kind: ContentKind,
    pub title: String,
    pub description: String,
    pub action_label: &'static str,
    pub action_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    Unread {
        organization_id: Uuid,
        kind: ContentKind,
        unread: bool,
    },
    Notification(Notification),
    /// New content in the focused surface, from anyone. Counts as read.
    Seen {
        organization_id: Uuid,
        kind: ContentKind,
        row_id: Option<Uuid>,
    },
}

pub struct Reconciler {
    tracker: Tracker,
    viewer: Viewer,
    organizations: Vec<Uuid>,
    focus: Option<Focus>,
    unread: HashMap<(Uuid, ContentKind), bool>,
    phase: Phase,
    feed: Option<ChangeFeed>,
    subscription: Option<Subscription>,
}

impl Reconciler {
    pub fn new(tracker: Tracker, viewer: Viewer, organizations: Vec<Uuid>) -> Self {
        Self {
            tracker,
            viewer,
            organizations,
            focus: None,
            unread: HashMap::new(),
            phase: Phase::Idle,
            feed: None,
            subscription: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn viewer(&self) -> Viewer {
        self.viewer
    }

    pub fn focus(&self) -> Option<Focus> {
        self.focus
    }

    pub fn is_unread(&self, organization_id: Uuid, kind: ContentKind) -> bool {
        self.unread.get(&(organization_id, kind)).copied().unwrap_or(false)
    }

    pub fn unread_map(&self, kind: ContentKind) -> HashMap<Uuid, bool> {
        self.organizations
            .iter()
            .map(|id| (*id, self.is_unread(*id, kind)))
            .collect()
    }

    /// Opens the subscription, loads the initial flags, and goes live. The
    /// subscription is opened before the fetch so nothing falls between them.
    pub async fn mount(&mut self, feed: &ChangeFeed) -> Vec<Update> {
        self.phase = Phase::Syncing;
        let filter = match self.organizations.as_slice() {
            [only] => Filter::Organization(*only),
            _ => Filter::All,
        };
        self.subscription = Some(feed.subscribe(&TABLES, filter));
        self.feed = Some(feed.clone());

        let mut updates = self.recompute(true).await;
        self.phase = Phase::Live;
        if let Some(focus) = self.focus {
            updates.extend(self.mark_focus_read(focus).await);
        }
        tracing::debug!(user_id = %self.viewer.user_id(), organizations = self.organizations.len(), "reconciler live");
        updates
    }

    /// Releases the subscription. Anything still in flight is ignored from here on.
    pub fn unmount(&mut self) {
        self.phase = Phase::Idle;
        self.subscription = None;
        self.feed = None;
    }

    /// Starts tracking an organization the viewer gained after mount. A
    /// subscription narrowed to one organization is widened to all of them.
    /// Callers check access first.
    pub async fn include(&mut self, organization_id: Uuid) -> Vec<Update> {
        if self.organizations.contains(&organization_id) {
            return Vec::new();
        }
        self.organizations.push(organization_id);
        if self.phase != Phase::Live {
            return Vec::new();
        }

        let mut updates = Vec::new();
        let narrowed = self.subscription.as_ref().is_some_and(|s| s.filter() != Filter::All);
        if narrowed {
            updates.extend(self.drain().await);
            if let Some(feed) = &self.feed {
                self.subscription = Some(feed.subscribe(&TABLES, Filter::All));
            }
        }
        // reports the new organization's flags and repairs anything lost in the swap
        updates.extend(self.recompute(false).await);
        for kind in ContentKind::ALL {
            let unread = self.is_unread(organization_id, kind);
            let update = Update::Unread { organization_id, kind, unread };
            if !updates.contains(&update) {
                updates.push(update);
            }
        }
        tracing::debug!(user_id = %self.viewer.user_id(), %organization_id, "reconciler tracking organization");
        updates
    }

    /// Switches the open surface. The newly focused surface is marked read.
    pub async fn set_focus(&mut self, focus: Focus) -> Vec<Update> {
        self.focus = Some(focus);
        if self.phase != Phase::Live {
            return Vec::new();
        }
        self.mark_focus_read(focus).await
    }

    pub fn blur(&mut self) {
        self.focus = None;
    }

    /// Marks the focused surface read after the viewer's own write.
    pub async fn after_own_write(&mut self) -> Vec<Update> {
        match (self.phase, self.focus) {
            (Phase::Live, Some(focus)) => self.mark_focus_read(focus).await,
            _ => Vec::new(),
        }
    }

    /// Waits for the next relevant change. `None` once unmounted or the feed closes.
    pub async fn next(&mut self) -> Option<Vec<Update>> {
        let delivery = self.recv().await?;
        Some(self.deliver(delivery).await)
    }

    /// Waits for the next raw delivery. Cancel safe, so it can sit in a `select!`.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.subscription.as_mut()?.recv().await
    }

    /// Handles whatever is already buffered without waiting.
    pub async fn drain(&mut self) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Some(delivery) = self.subscription.as_mut().and_then(Subscription::try_recv) {
            updates.extend(self.deliver(delivery).await);
        }
        updates
    }

    pub async fn deliver(&mut self, delivery: Delivery) -> Vec<Update> {
        match delivery {
            Delivery::Event(event) => self.handle(event).await,
            Delivery::Lagged(missed) => {
                tracing::warn!(missed, "reconciler lagged behind the feed; recomputing");
                self.recompute(false).await
            }
        }
    }

    pub async fn handle(&mut self, event: ChangeEvent) -> Vec<Update> {
        if self.phase != Phase::Live {
            return Vec::new();
        }
        if !self.organizations.contains(&event.organization_id) && !self.discover(event.organization_id).await {
            return Vec::new();
        }

        match (ContentKind::of_table(event.table), event.op) {
            (None, _) if event.actor_id == self.viewer.user_id() => self.recompute(false).await,
            (None, _) => Vec::new(),
            (Some(kind), ChangeOp::Insert) => self.handle_insert(event, kind).await,
            (Some(_), _) => Vec::new(),
        }
    }

    async fn handle_insert(&mut self, event: ChangeEvent, kind: ContentKind) -> Vec<Update> {
        let focus = Focus { organization_id: event.organization_id, kind };
        let focused = self.focus == Some(focus);
        let mut updates = Vec::new();
        if focused {
            updates.push(Update::Seen {
                organization_id: event.organization_id,
                kind,
                row_id: event.row_id,
            });
        }

        if event.actor_id == self.viewer.user_id() {
            return updates;
        }
        let role = match self.tracker.author_role(event.actor_id).await {
            Ok(Some(role)) => role,
            Ok(None) => return updates,
            Err(err) => {
                tracing::warn!(%err, "could not resolve author role");
                return updates;
            }
        };
        if role != self.viewer.counterpart() {
            return updates;
        }

        if focused {
            updates.extend(self.mark_focus_read(focus).await);
            return updates;
        }

        if self.set_unread(event.organization_id, kind, true) {
            updates.push(Update::Unread { organization_id: event.organization_id, kind, unread: true });
        }
        match self.notification(&event, kind).await {
            Ok(notification) => updates.push(Update::Notification(notification)),
            Err(err) => tracing::warn!(%err, "could not build notification"),
        }
        updates
    }

    /// An organization created or joined after mount shows up first as an event.
    async fn discover(&mut self, organization_id: Uuid) -> bool {
        match self.viewer.ensure_access(self.tracker.db_pool(), organization_id).await {
            Ok(()) => {
                self.organizations.push(organization_id);
                true
            }
            Err(_) => false,
        }
    }

    async fn mark_focus_read(&mut self, focus: Focus) -> Vec<Update> {
        if let Err(err) = self.tracker.mark_read(focus.organization_id, self.viewer.user_id()).await {
            tracing::warn!(%err, organization_id = %focus.organization_id, "could not mark read");
            return Vec::new();
        }
        let mut updates = Vec::new();
        // one cursor covers both kinds
        for kind in ContentKind::ALL {
            if self.set_unread(focus.organization_id, kind, false) {
                updates.push(Update::Unread { organization_id: focus.organization_id, kind, unread: false });
            }
        }
        updates
    }

    /// Reloads every flag. With `report_all` every flag is emitted, otherwise only changes.
    async fn recompute(&mut self, report_all: bool) -> Vec<Update> {
        let mut updates = Vec::new();
        for kind in ContentKind::ALL {
            let map = match self.tracker.compute_unread_map(&self.organizations, self.viewer, kind).await {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!(%err, ?kind, "unread recompute failed; keeping stale flags");
                    continue;
                }
            };
            for (organization_id, unread) in map {
                if self.set_unread(organization_id, kind, unread) || report_all {
                    updates.push(Update::Unread { organization_id, kind, unread });
                }
            }
        }
        updates
    }

    /// Returns whether the flag changed.
    fn set_unread(&mut self, organization_id: Uuid, kind: ContentKind, unread: bool) -> bool {
        self.unread.insert((organization_id, kind), unread) != Some(unread)
    }

    async fn notification(&self, event: &ChangeEvent, kind: ContentKind) -> sqlx::Result<Notification> {
        let db_pool = self.tracker.db_pool();
        let organization_name = db::organization(db_pool, event.organization_id)
            .await?
            .map(|org| org.name)
            .unwrap_or_default();

        let detail = match (kind, event.row_id) {
            (ContentKind::Messages, Some(id)) => db::message(db_pool, id).await?.map(|m| m.content),
            (ContentKind::Media, Some(id)) => db::media_item(db_pool, id).await?.map(|m| m.file_name),
            (_, None) => None,
        };

        let admin = self.viewer.is_admin();
        let (title, description, action_label, page) = match kind {
            ContentKind::Messages => (
                if admin { format!("New message from {organization_name}") } else { "New message from support".to_owned() },
                detail.unwrap_or_default(),
                if admin { "View Chat" } else { "Read" },
                "messages",
            ),
            ContentKind::Media => (
                if admin { format!("New upload from {organization_name}") } else { "New file available".to_owned() },
                detail
                    .map(|name| if admin { format!("Uploaded: {name}") } else { format!("Support uploaded: {name}") })
                    .unwrap_or_default(),
                "View Media",
                "media",
            ),
        };

        Ok(Notification {
            organization_id: event.organization_id,
            organization_name,
            kind,
            title,
            description,
            action_label,
            action_url: format!("/o/{}/{page}", event.organization_id),
        })
    }
}
