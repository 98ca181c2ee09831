mod common;

use std::time::Duration;

use anyhow::{anyhow, Result};
use common::{client, config, eventually, FakeBackend, Script};
use querystream_core::{ClientConfig, ClientError, QueryContext};

#[tokio::test(start_paused = true)]
async fn exhausted_user_pool_fails_acquisition_at_deadline() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(1));
    let client = client(
        &backend,
        ClientConfig {
            max_db_connections: 1,
            ..config()
        },
    )
    .await?;

    let held = client.acquire_session(&QueryContext::new()).await?;
    let ctx = QueryContext::new().with_timeout(Duration::from_millis(100));
    let err = client
        .acquire_session(&ctx)
        .await
        .err()
        .ok_or_else(|| anyhow!("expected acquisition failure"))?;
    match err {
        ClientError::SessionAcquisition(inner) => {
            assert!(matches!(*inner, ClientError::DeadlineExceeded))
        }
        other => return Err(anyhow!("unexpected error: {other}")),
    }

    held.close(false).await;
    let again = client.acquire_session(&QueryContext::new()).await?;
    again.close(false).await;
    Ok(())
}

#[tokio::test]
async fn closed_session_connection_is_reused() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(1));
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();

    let first = client.acquire_session(&ctx).await?;
    let first_id = first.id().to_string();
    first.close(false).await;
    let connects = backend.connects();

    let second = client.acquire_session(&ctx).await?;
    assert_ne!(second.id().to_string(), first_id, "ids are per lease");
    assert_eq!(backend.connects(), connects);
    second.close(false).await;
    Ok(())
}

#[tokio::test]
async fn cancelled_close_discards_connection() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(1));
    let client = client(&backend, config()).await?;

    let session = client.acquire_session(&QueryContext::new()).await?;
    let before = client.user_pool_status().open;
    session.close(true).await;
    assert_eq!(client.user_pool_status().open, before - 1);
    Ok(())
}

#[tokio::test]
async fn failed_init_sql_returns_connection() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(1));
    backend.fail_execute("set search_path to missing");
    let client = client(
        &backend,
        ClientConfig {
            session_init_sql: Some("set search_path to missing".to_string()),
            ..config()
        },
    )
    .await?;

    let err = client
        .acquire_session(&QueryContext::new())
        .await
        .err()
        .ok_or_else(|| anyhow!("expected init failure"))?;
    assert!(matches!(err, ClientError::SessionAcquisition(_)));
    assert_eq!(client.user_pool_status().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn init_sql_runs_once_per_session() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(2));
    let client = client(
        &backend,
        ClientConfig {
            session_init_sql: Some("  set timezone = 'UTC'  ".to_string()),
            ..config()
        },
    )
    .await?;

    let sync = client
        .execute_sync(&QueryContext::new(), "select n", &[])
        .await?;
    assert_eq!(sync.rows.len(), 2);
    assert_eq!(
        backend.log(),
        vec!["set timezone = 'UTC'".to_string(), "select n".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn commit_ends_transaction() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(1));
    let client = client(&backend, config()).await?;
    let session = client.acquire_session(&QueryContext::new()).await?;

    session.begin_transaction().await?;
    assert!(session.in_transaction());
    session.commit().await?;
    assert!(!session.in_transaction());
    session.close(false).await;

    assert_eq!(backend.log(), vec!["begin".to_string(), "commit".to_string()]);
    Ok(())
}

#[tokio::test]
async fn closing_mid_transaction_rolls_back() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(1));
    let client = client(&backend, config()).await?;
    let session = client.acquire_session(&QueryContext::new()).await?;

    session.begin_transaction().await?;
    session.close(false).await;
    assert_eq!(
        backend.log(),
        vec!["begin".to_string(), "rollback".to_string()]
    );
    assert_eq!(client.user_pool_status().idle, 1);
    Ok(())
}

#[tokio::test]
async fn owned_execution_releases_session_when_stream_ends() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(4));
    let client = client(&backend, config()).await?;

    let mut result = client
        .execute(&QueryContext::new(), "select n", &[])
        .await?;
    assert_eq!(client.user_pool_status().in_use, 1);
    result.rows.close();
    assert!(eventually(|| client.user_pool_status().in_use == 0).await);
    Ok(())
}

#[tokio::test]
async fn dropped_stream_releases_session() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        row_delay: Duration::from_millis(1),
        ..Script::numbers(100)
    });
    let client = client(&backend, config()).await?;

    let result = client
        .execute(&QueryContext::new(), "select n", &[])
        .await?;
    drop(result);
    assert!(eventually(|| client.user_pool_status().in_use == 0).await);
    assert!(eventually(|| backend.cursor_closes() == 1).await);
    Ok(())
}

#[tokio::test]
async fn closed_client_rejects_new_work() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(1));
    let client = client(&backend, config()).await?;

    client.reset_pools();
    assert_eq!(client.user_pool_status().idle, 0);

    client.close();
    let err = client
        .execute(&QueryContext::new(), "select n", &[])
        .await
        .err()
        .ok_or_else(|| anyhow!("expected closed pool"))?;
    match err {
        ClientError::SessionAcquisition(inner) => {
            assert!(matches!(*inner, ClientError::PoolClosed))
        }
        other => return Err(anyhow!("unexpected error: {other}")),
    }
    Ok(())
}

#[tokio::test]
async fn management_connections_come_from_their_own_pool() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(1));
    let client = client(&backend, config()).await?;

    let lease = client
        .acquire_management_connection(&QueryContext::new())
        .await?;
    assert_eq!(lease.pool_name(), "management");
    assert_eq!(client.user_pool_status().in_use, 0);
    drop(lease);
    Ok(())
}
