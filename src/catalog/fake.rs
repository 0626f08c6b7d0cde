//! In-memory catalog for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{AddImage, CatalogClient, CatalogError, Operation, RemoveImage};
use crate::key::ContentKey;

#[derive(Debug, Default)]
pub(crate) struct FakeCatalog {
    /// Keys the catalog currently holds.
    held: Mutex<HashSet<ContentKey>>,
    /// Keys whose calls fail with the given HTTP status; the count is how
    /// many more times (`usize::MAX` for always).
    failures: Mutex<HashMap<ContentKey, (u16, usize)>>,
    /// Every call in arrival order.
    calls: Mutex<Vec<(Operation, ContentKey)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeCatalog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn fail_always(&self, key: &ContentKey, status: u16) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.clone(), (status, usize::MAX));
    }

    pub(crate) fn fail_times(&self, key: &ContentKey, status: u16, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.clone(), (status, times));
    }

    pub(crate) fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub(crate) fn seed(&self, key: &ContentKey) {
        self.held.lock().unwrap().insert(key.clone());
    }

    pub(crate) fn holds(&self, key: &ContentKey) -> bool {
        self.held.lock().unwrap().contains(key)
    }

    pub(crate) fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub(crate) fn calls(&self) -> Vec<(Operation, ContentKey)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn call(&self, operation: Operation, key: &ContentKey) -> Result<(), CatalogError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push((operation, key.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(key) {
                Some((status, remaining)) if *remaining > 0 => {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    Err(CatalogError::HttpStatus {
                        operation,
                        status: *status,
                    })
                }
                _ => Ok(()),
            }
        };

        if result.is_ok() {
            let mut held = self.held.lock().unwrap();
            match operation {
                Operation::Add => {
                    held.insert(key.clone());
                }
                Operation::Remove => {
                    held.remove(key);
                }
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn add_image(&self, request: &AddImage) -> Result<(), CatalogError> {
        self.call(Operation::Add, &request.content_key).await
    }

    async fn remove_image(&self, request: &RemoveImage) -> Result<(), CatalogError> {
        self.call(Operation::Remove, &request.content_key).await
    }
}
