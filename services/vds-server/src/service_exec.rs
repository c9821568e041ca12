use vds::{InMemoryStorage, LocalService};

/// Run a synchronous service read on the blocking pool.
pub async fn with_service_blocking<R, F>(
    service: LocalService<InMemoryStorage>,
    f: F,
) -> vds::Result<R>
where
    R: Send + 'static,
    F: FnOnce(&LocalService<InMemoryStorage>) -> vds::Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| vds::VdsError::Storage(format!("service task failed: {e}")))?
}
