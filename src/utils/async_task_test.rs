use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::async_task::call_with_timeout;
use crate::utils::async_task::spawn_task;
use crate::Error;
use crate::StoreError;

#[tokio::test]
async fn call_with_timeout_returns_task_result() {
    let result = call_with_timeout(Duration::from_millis(100), async { Ok::<_, StoreError>(7) }).await;

    assert_eq!(result, Ok(7));
}

#[tokio::test]
async fn call_with_timeout_passes_through_store_errors() {
    let result = call_with_timeout(Duration::from_millis(100), async {
        Err::<u32, _>(StoreError::Unavailable("connection refused".to_string()))
    })
    .await;

    assert_eq!(
        result,
        Err(StoreError::Unavailable("connection refused".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn call_with_timeout_maps_elapsed_deadline() {
    let result = call_with_timeout(Duration::from_millis(100), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<u32, StoreError>(42)
    })
    .await;

    assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(100))));
}

#[tokio::test]
async fn spawn_task_runs_to_completion() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let handle = spawn_task("test_task", async move {
        counter_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    handle.await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn spawn_task_logs_errors() {
    let handle = spawn_task("error_task", async move {
        Err(Error::StreamStopped(crate::ObjectKey::new("ns1", "s1")))
    });
    handle.await.unwrap();

    assert!(logs_contain("error_task"));
}
