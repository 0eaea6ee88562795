use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use pipeline_common::event::EnrichedRecord;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),
}

/// Durable storage for processed events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist one record, returning the identifier the store assigned to it.
    async fn insert(&self, record: &EnrichedRecord) -> Result<String, StoreError>;
}

pub struct MongoStore {
    collection: Collection<Document>,
}

impl MongoStore {
    /// Connect and ping the server, failing fast if it cannot be reached.
    pub async fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        connect_timeout: Duration,
        server_selection_timeout: Duration,
    ) -> Result<Self, StoreError> {
        info!("connecting to MongoDB...");

        let mut options = ClientOptions::parse(uri).await?;
        options.connect_timeout = Some(connect_timeout);
        options.server_selection_timeout = Some(server_selection_timeout);
        options.app_name = Some("event-consumer".to_string());

        let client = Client::with_options(options)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        info!("connected to MongoDB, writing to {}.{}", database, collection);

        Ok(Self {
            collection: client.database(database).collection(collection),
        })
    }
}

/// The persisted shape: the wire fields, then the processing fields.
fn record_to_document(record: &EnrichedRecord) -> Document {
    doc! {
        "user_id": record.event.user_id.as_str(),
        "event_type": record.event.event_type.as_str(),
        "timestamp": record.event.timestamp,
        "url": record.event.url.as_str(),
        "processing_time": record.processing_time,
        "latency_ms": record.latency_ms,
    }
}

#[async_trait]
impl EventStore for MongoStore {
    async fn insert(&self, record: &EnrichedRecord) -> Result<String, StoreError> {
        let result = self
            .collection
            .insert_one(record_to_document(record))
            .await?;

        Ok(match result.inserted_id.as_object_id() {
            Some(id) => id.to_hex(),
            None => result.inserted_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;
    use pipeline_common::event::{Event, EventType};

    #[test]
    fn document_holds_every_field_with_integer_types() {
        let record = EnrichedRecord::new(
            Event {
                user_id: "user_3".to_string(),
                event_type: EventType::AddToCart,
                timestamp: 1000,
                url: "/home".to_string(),
            },
            1150,
        )
        .unwrap();

        let document = record_to_document(&record);

        assert_eq!(
            document.keys().map(String::as_str).collect::<Vec<_>>(),
            vec![
                "user_id",
                "event_type",
                "timestamp",
                "url",
                "processing_time",
                "latency_ms"
            ]
        );
        assert_eq!(document.get_str("user_id").unwrap(), "user_3");
        assert_eq!(document.get_str("event_type").unwrap(), "add_to_cart");
        assert_eq!(document.get("timestamp"), Some(&Bson::Int64(1000)));
        assert_eq!(document.get_str("url").unwrap(), "/home");
        assert_eq!(document.get("processing_time"), Some(&Bson::Int64(1150)));
        assert_eq!(document.get("latency_ms"), Some(&Bson::Int64(150)));
    }
}
