use crate::db::ReadingStore;
use crate::error::{IngestError, StorageError};
use crate::mapping::{normalize, Reading};
use crate::mqtt::MessageHandler;
use crate::validate::validate;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-message pipeline: normalize, validate, insert.
pub struct Ingestor<S> {
    store: Arc<S>,
}

impl<S: ReadingStore> Ingestor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn handle_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<Reading, IngestError> {
        let reading = normalize(topic, payload)?;
        validate(&reading)?;
        self.store.insert(&reading).await?;
        Ok(reading)
    }
}

#[async_trait]
impl<S: ReadingStore> MessageHandler for Ingestor<S> {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        debug!(topic = %topic, payload = %String::from_utf8_lossy(payload), "received message");
        match self.handle_message(topic, payload).await {
            Ok(r) => info!(
                sensor_id = %r.device_id,
                moisture = r.moisture_level(),
                timestamp = %r.timestamp,
                "stored reading"
            ),
            Err(IngestError::Parse(e)) => {
                error!(topic = %topic, error = %e, "dropping unparseable message")
            }
            Err(IngestError::Validation(e)) => {
                warn!(topic = %topic, violation = %e, "rejecting invalid reading")
            }
            Err(IngestError::Storage(e @ StorageError::Rejected(_))) => error!(
                topic = %topic,
                error = %e,
                "database rejected a validated reading; dropping it"
            ),
            Err(IngestError::Storage(e)) => {
                error!(topic = %topic, error = %e, "could not store reading; dropping it")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::state::ConnectionState;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<Reading>>,
        fail_with: Mutex<Option<fn() -> StorageError>>,
    }

    #[async_trait]
    impl ReadingStore for MemoryStore {
        async fn ensure_schema(&self) -> Result<(), StorageError> {
            Ok(())
        }
        async fn insert(&self, reading: &Reading) -> Result<(), StorageError> {
            if let Some(fail) = *self.fail_with.lock().unwrap() {
                return Err(fail());
            }
            self.rows.lock().unwrap().push(reading.clone());
            Ok(())
        }
        async fn probe(&self) -> bool {
            true
        }
        async fn reconnect(&self) -> Result<(), StorageError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), StorageError> {
            Ok(())
        }
        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
    }

    #[tokio::test]
    async fn test_valid_message_is_stored() {
        let store = Arc::new(MemoryStore::default());
        let ingestor = Ingestor::new(store.clone());
        let r = ingestor
            .handle_message("moisture/sensor_01/data", br#"{"moisture": 45.2, "battery": 80}"#)
            .await
            .unwrap();
        assert_eq!(r.device_id, "sensor_01");
        assert_eq!(store.rows.lock().unwrap().as_slice(), &[r]);
    }

    #[tokio::test]
    async fn test_invalid_reading_is_not_stored() {
        let store = Arc::new(MemoryStore::default());
        let ingestor = Ingestor::new(store.clone());
        let err = ingestor
            .handle_message("moisture/s1/data", br#"{"moisture": 45.2, "humidity": 150}"#)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::Validation(ValidationError::OutOfRange { field: "humidity", .. })
        ));

        let err = ingestor
            .handle_message("moisture/s1/data", b"{not json")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_survives_storage_failure() {
        let store = Arc::new(MemoryStore::default());
        *store.fail_with.lock().unwrap() = Some(|| StorageError::NotConnected);
        let ingestor = Ingestor::new(store.clone());
        ingestor.handle("moisture/s1/data", br#"{"moisture": 10}"#).await;

        *store.fail_with.lock().unwrap() = None;
        ingestor.handle("moisture/s1/data", br#"{"moisture": 11}"#).await;
        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].moisture, Some(11.0));
    }
}
