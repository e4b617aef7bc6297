// In-memory bucket used by the pipeline tests.
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::AsyncReadExt;

use super::{ObjectReader, ObjectStore, UploadReceipt};
use crate::errors::StorageError;

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_after: Option<u64>,
    active_puts: AtomicUsize,
    max_concurrent_puts: AtomicUsize,
    puts_started: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every upload once it has consumed `bytes` bytes of the body.
    pub fn failing_after(bytes: u64) -> Self {
        MemoryStore {
            fail_after: Some(bytes),
            ..Self::default()
        }
    }

    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn max_concurrent_puts(&self) -> usize {
        self.max_concurrent_puts.load(Ordering::SeqCst)
    }

    pub fn puts_started(&self) -> usize {
        self.puts_started.load(Ordering::SeqCst)
    }
}

struct ActivePut<'a>(&'a AtomicUsize);

impl Drop for ActivePut<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_stream(&self, key: &str, mut body: ObjectReader) -> Result<UploadReceipt, StorageError> {
        self.puts_started.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_puts.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActivePut(&self.active_puts);

        let mut data = Vec::new();
        let mut chunk = vec![0u8; 8 * 1024];
        loop {
            let read = body.read(&mut chunk).await.map_err(StorageError::Read)?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
            if let Some(limit) = self.fail_after {
                if data.len() as u64 >= limit {
                    return Err(StorageError::Request {
                        operation: "UploadPart",
                        key: key.to_string(),
                        message: "simulated network failure".to_string(),
                    });
                }
            }
        }

        let bytes = data.len() as u64;
        self.insert(key, data);
        Ok(UploadReceipt {
            location: format!("memory://test-bucket/{}", key),
            bytes,
        })
    }

    async fn get_stream(&self, key: &str) -> Result<ObjectReader, StorageError> {
        match self.object(key) {
            Some(data) => Ok(Box::new(Cursor::new(data))),
            None => Err(StorageError::NotFound {
                bucket: "test-bucket".to_string(),
                key: key.to_string(),
            }),
        }
    }

    fn bucket(&self) -> &str {
        "test-bucket"
    }
}
