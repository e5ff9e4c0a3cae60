pub mod crypto;
pub mod epid;
pub mod host;
pub mod kms;
pub mod rpc;
pub mod server;

use crate::model::error::{Error, KmsError, KmsErrorKind, KmsResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One row of per client activation history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_machine_id: Uuid,
    pub application_id: Uuid,
    pub sku_id: Uuid,
    pub license_status: u32,
    /// Filetime of the most recent accepted request
    pub last_activation: u64,
    pub n_count: u32,
    pub machine_name: String,
}

/// ClientStore provides the ability to record (and later
/// list) the clients that requested an activation.
///
/// Implementations are called from concurrent connections and
/// must serialize writes for the same client machine id. A
/// write carrying an older request time than the stored row
/// is dropped.
pub trait ClientStore {
    fn get(&self, client_machine_id: &Uuid) -> Option<ClientRecord>;
    fn upsert(&self, record: &ClientRecord) -> KmsResult<()>;
    fn list(&self) -> Vec<ClientRecord>;
}

impl<S: ClientStore + ?Sized> ClientStore for &S {
    fn get(&self, client_machine_id: &Uuid) -> Option<ClientRecord> {
        (**self).get(client_machine_id)
    }

    fn upsert(&self, record: &ClientRecord) -> KmsResult<()> {
        (**self).upsert(record)
    }

    fn list(&self) -> Vec<ClientRecord> {
        (**self).list()
    }
}

impl<S: ClientStore + ?Sized> ClientStore for Box<S> {
    fn get(&self, client_machine_id: &Uuid) -> Option<ClientRecord> {
        (**self).get(client_machine_id)
    }

    fn upsert(&self, record: &ClientRecord) -> KmsResult<()> {
        (**self).upsert(record)
    }

    fn list(&self) -> Vec<ClientRecord> {
        (**self).list()
    }
}

impl<S: ClientStore + ?Sized> ClientStore for Arc<S> {
    fn get(&self, client_machine_id: &Uuid) -> Option<ClientRecord> {
        (**self).get(client_machine_id)
    }

    fn upsert(&self, record: &ClientRecord) -> KmsResult<()> {
        (**self).upsert(record)
    }

    fn list(&self) -> Vec<ClientRecord> {
        (**self).list()
    }
}

/// In memory client store, the in-crate reference
/// implementation of the persistence interface
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, ClientRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl ClientStore for MemoryStore {
    fn get(&self, client_machine_id: &Uuid) -> Option<ClientRecord> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(client_machine_id).cloned())
    }

    fn upsert(&self, record: &ClientRecord) -> KmsResult<()> {
        let mut records = self.records.lock().map_err(|_| {
            Error::KmsError(KmsError::new(
                KmsErrorKind::PersistenceError,
                "client store lock poisoned",
            ))
        })?;
        match records.get(&record.client_machine_id) {
            // last writer wins on request time
            Some(stored) if stored.last_activation > record.last_activation => Ok(()),
            _ => {
                records.insert(record.client_machine_id, record.clone());
                Ok(())
            }
        }
    }

    fn list(&self) -> Vec<ClientRecord> {
        self.records
            .lock()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(time: u64) -> ClientRecord {
        ClientRecord {
            client_machine_id: Uuid::from_u128(0x1),
            application_id: Uuid::from_u128(0x2),
            sku_id: Uuid::from_u128(0x3),
            license_status: 2,
            last_activation: time,
            n_count: 25,
            machine_name: String::from("TESTPC"),
        }
    }

    #[test]
    fn test_replay_keeps_single_record() {
        let store = MemoryStore::new();
        for _ in 0..5 {
            store.upsert(&record(1000)).unwrap();
        }
        let rows = store.list();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_activation, 1000);
    }

    #[test]
    fn test_stale_write_is_dropped() {
        let store = MemoryStore::new();
        store.upsert(&record(2000)).unwrap();
        store.upsert(&record(1000)).unwrap();
        assert_eq!(
            store.get(&Uuid::from_u128(0x1)).unwrap().last_activation,
            2000
        );
    }

    #[test]
    fn test_newer_write_replaces() {
        let store = MemoryStore::new();
        store.upsert(&record(1000)).unwrap();
        store.upsert(&record(3000)).unwrap();
        assert_eq!(
            store.get(&Uuid::from_u128(0x1)).unwrap().last_activation,
            3000
        );
    }

    #[test]
    fn test_distinct_clients_are_independent() {
        let store = MemoryStore::new();
        let mut other = record(1000);
        other.client_machine_id = Uuid::from_u128(0x42);
        store.upsert(&record(1000)).unwrap();
        store.upsert(&other).unwrap();
        assert_eq!(store.list().len(), 2);
    }
}
