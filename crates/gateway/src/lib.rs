//! Contract of the hosted backend the chat core talks to: a relational store with
//! realtime insert feeds, plus ephemeral presence/broadcast channels.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::stream::{self, SelectAll};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    error::GatewayError,
    protocol::{decode_row, decode_rows, encode_row, Table},
    query::{Filter, Query},
};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Cancelable feed of inserted rows matching a filter. Delivery is at-least-once.
#[derive(Debug)]
pub struct Subscription {
    table: Table,
    filter: Filter,
    rx: mpsc::Receiver<Value>,
}

impl Subscription {
    pub fn new(table: Table, filter: Filter, rx: mpsc::Receiver<Value>) -> Self {
        Self { table, filter, rx }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Stops delivery; the store drops its sender on the next fan-out.
    pub fn cancel(mut self) {
        self.rx.close();
    }

    pub fn into_stream(self) -> ReceiverStream<Value> {
        ReceiverStream::new(self.rx)
    }
}

/// Interleaves several subscriptions into one stream so a single consumer applies every event.
pub fn merge_subscriptions(
    subscriptions: impl IntoIterator<Item = Subscription>,
) -> SelectAll<ReceiverStream<Value>> {
    stream::select_all(subscriptions.into_iter().map(Subscription::into_stream))
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Membership changed; read [`PresenceChannel::snapshot`] for the current roster.
    Sync,
    Broadcast { event: String, payload: Value },
}

/// Presence key to the metadata each joined handle tracked under it.
pub type PresenceSnapshot = HashMap<String, Vec<Value>>;

#[async_trait]
pub trait PresenceChannel: Send + Sync {
    fn topic(&self) -> &str;
    async fn track(&self, meta: Value) -> GatewayResult<()>;
    async fn untrack(&self) -> GatewayResult<()>;
    fn snapshot(&self) -> PresenceSnapshot;
    async fn broadcast(&self, event: &str, payload: Value) -> GatewayResult<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent>;
    async fn leave(&self) -> GatewayResult<()>;
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn query(&self, query: Query) -> GatewayResult<Vec<Value>>;
    /// Fails with [`shared::error::ErrorCode::Conflict`] on a unique-constraint violation.
    async fn insert(&self, table: Table, record: Value) -> GatewayResult<Value>;
    async fn upsert(
        &self,
        table: Table,
        record: Value,
        conflict_columns: &[&str],
    ) -> GatewayResult<Value>;
    async fn update(&self, table: Table, patch: Value, filter: Filter) -> GatewayResult<usize>;
    async fn delete(&self, table: Table, filter: Filter) -> GatewayResult<usize>;
    async fn subscribe(&self, table: Table, filter: Filter) -> GatewayResult<Subscription>;
    async fn join_presence(
        &self,
        topic: &str,
        presence_key: &str,
    ) -> GatewayResult<Arc<dyn PresenceChannel>>;
}

/// Typed access so rows are validated where they cross the gateway.
#[async_trait]
pub trait RemoteStoreExt: RemoteStore {
    async fn query_as<T>(&self, query: Query) -> GatewayResult<Vec<T>>
    where
        T: DeserializeOwned + Send,
    {
        decode_rows(self.query(query).await?)
    }

    async fn insert_as<R, T>(&self, table: Table, record: &R) -> GatewayResult<T>
    where
        R: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let confirmed = self.insert(table, encode_row(record)?).await?;
        decode_row(confirmed)
    }
}

impl<S: RemoteStore + ?Sized> RemoteStoreExt for S {}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn merged_subscriptions_deliver_from_every_source() {
        let (tx_a, rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let mut merged = merge_subscriptions([
            Subscription::new(Table::Messages, Filter::eq("channel_id", "general"), rx_a),
            Subscription::new(Table::Messages, Filter::is_null("channel_id"), rx_b),
        ]);

        tx_a.send(json!({ "id": "a" })).await.expect("send a");
        tx_b.send(json!({ "id": "b" })).await.expect("send b");
        drop(tx_a);
        drop(tx_b);

        let mut ids = Vec::new();
        while let Some(row) = merged.next().await {
            ids.push(row["id"].as_str().unwrap_or_default().to_string());
        }
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn cancelled_subscription_closes_sender_side() {
        let (tx, rx) = mpsc::channel(1);
        let subscription = Subscription::new(Table::Messages, Filter::All, rx);
        subscription.cancel();
        assert!(tx.is_closed());
    }
}
