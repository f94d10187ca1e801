//! In-process change feed.
//!
//! Every write that another view may care about is published here as a
//! [`ChangeEvent`]. Views never touch the broadcast channel directly: they ask
//! [`ChangeFeed::subscribe`] for a [`Subscription`] scoped to some tables and an
//! optional organization filter, and drop it when they go away.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::{RecvError, TryRecvError}};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    MediaItems,
    MessageReads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub op: ChangeOp,
    pub organization_id: Uuid,
    /// The changed row. Read receipts are keyed by (organization, actor) and carry none.
    pub row_id: Option<Uuid>,
    /// Author of the row: sender, uploader, or the reader whose cursor moved.
    pub actor_id: Uuid,
}

/// Equality predicate on the organization column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    All,
    Organization(Uuid),
}

impl Filter {
    fn admits(&self, event: &ChangeEvent) -> bool {
        match self {
            Filter::All => true,
            Filter::Organization(id) => event.organization_id == *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Event(ChangeEvent),
    /// The receiver fell behind and this many events were dropped.
    Lagged(u64),
}

#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self { tx: broadcast::channel(capacity.max(1)).0 }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // no subscribers is not an error
        let delivered = self.tx.send(event).unwrap_or(0);
        tracing::trace!(table = ?event.table, op = ?event.op, organization_id = %event.organization_id, delivered, "published change");
    }

    pub fn subscribe(&self, tables: &[Table], filter: Filter) -> Subscription {
        let id = Uuid::now_v7();
        tracing::debug!(%id, ?tables, ?filter, "opened subscription");
        Subscription {
            id,
            rx: self.tx.subscribe(),
            tables: tables.to_vec(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live handle on the feed. Dropping it releases the underlying receiver.
pub struct Subscription {
    id: Uuid,
    rx: broadcast::Receiver<ChangeEvent>,
    tables: Vec<Table>,
    filter: Filter,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.tables.contains(&event.table) && self.filter.admits(event)
    }

    /// Waits for the next matching delivery. `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(Delivery::Event(event)),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Some(Delivery::Lagged(n)),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching delivery already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(Delivery::Event(event)),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => return Some(Delivery::Lagged(n)),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        tracing::debug!(id = %self.id, "released subscription");
    }
}
