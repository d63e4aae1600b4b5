//! Store doubles for failure-path tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{InMemoryKvStore, KvError, KvStore};

/// A store whose every call fails, as if the backing service were down.
#[derive(Debug, Default)]
pub(crate) struct UnavailableKvStore;

fn down<T>() -> Result<T, KvError> {
    Err(KvError::Connection("connection refused".to_string()))
}

#[async_trait]
impl KvStore for UnavailableKvStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
        down()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), KvError> {
        down()
    }

    async fn set_nx(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool, KvError> {
        down()
    }

    async fn delete(&self, _key: &str) -> Result<bool, KvError> {
        down()
    }

    async fn delete_if_eq(&self, _key: &str, _expected: &str) -> Result<bool, KvError> {
        down()
    }

    async fn incr(&self, _key: &str, _ttl_on_create: Option<Duration>) -> Result<i64, KvError> {
        down()
    }

    async fn compare_and_set(
        &self,
        _guard_key: &str,
        _expected_guard: Option<&str>,
        _key: &str,
        _value: &str,
        _ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        down()
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, KvError> {
        down()
    }
}

/// An in-memory store whose next `incr` and `delete` calls can be made to
/// fail, as if the connection dropped between two commands.
#[derive(Debug, Default)]
pub(crate) struct FlakyKvStore {
    inner: InMemoryKvStore,
    failing_incrs: AtomicUsize,
    failing_deletes: AtomicUsize,
}

impl FlakyKvStore {
    pub(crate) fn fail_next_incrs(&self, n: usize) {
        self.failing_incrs.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KvStore for FlakyKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        self.inner.set_nx(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        if Self::take_failure(&self.failing_deletes) {
            return down();
        }
        self.inner.delete(key).await
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        self.inner.delete_if_eq(key, expected).await
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<i64, KvError> {
        if Self::take_failure(&self.failing_incrs) {
            return down();
        }
        self.inner.incr(key, ttl_on_create).await
    }

    async fn compare_and_set(
        &self,
        guard_key: &str,
        expected_guard: Option<&str>,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        self.inner
            .compare_and_set(guard_key, expected_guard, key, value, ttl)
            .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        self.inner.ttl(key).await
    }
}
