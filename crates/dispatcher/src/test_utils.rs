#[cfg(test)]
pub mod mocks {
    use std::time::Duration;

    use async_trait::async_trait;
    use mockall::mock;

    use taskman_core::{LeaseToken, LockProvider, SchedulerResult};

    mock! {
        pub LockProvider {}

        #[async_trait]
        impl LockProvider for LockProvider {
            async fn acquire(&self, key: &str, ttl: Duration) -> SchedulerResult<Option<LeaseToken>>;
            async fn renew(&self, token: &LeaseToken, ttl: Duration) -> SchedulerResult<bool>;
            async fn release(&self, token: &LeaseToken) -> SchedulerResult<()>;
        }
    }
}
