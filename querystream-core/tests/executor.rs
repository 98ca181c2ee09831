mod common;

use std::time::Duration;

use anyhow::{anyhow, Result};
use common::{client, config, eventually, FakeBackend, Script};
use querystream_core::backend::Value;
use querystream_core::normalize::display_message;
use querystream_core::{ClientConfig, ClientError, QueryContext};

#[tokio::test]
async fn empty_query_never_reaches_backend() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(3));
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();

    let mut result = client.execute(&ctx, "", &[]).await?;
    assert!(result.columns.is_empty());
    assert!(result.rows.next().await.is_none());
    assert!(result.timing.recv().await.is_none());

    let sync = client.execute_sync(&ctx, "", &[]).await?;
    assert!(sync.rows.is_empty());
    assert!(sync.error.is_none());

    assert!(backend.log().is_empty());
    assert_eq!(client.user_pool_status().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn rows_arrive_in_backend_order() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(50));
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();

    let mut result = client.execute(&ctx, "select n from numbers", &[]).await?;
    assert_eq!(result.columns.len(), 1);
    assert_eq!(result.columns[0].name, "n");

    let mut seen = Vec::new();
    while let Some(row) = result.rows.next().await {
        assert!(row.error.is_none());
        seen.push(row.values[0].clone());
    }
    let expected: Vec<Value> = (0..50).map(Value::Int).collect();
    assert_eq!(seen, expected);

    assert!(eventually(|| client.user_pool_status().in_use == 0).await);
    assert_eq!(backend.cursor_closes(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn columns_are_known_before_first_row() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        row_delay: Duration::from_secs(5),
        ..Script::numbers(2)
    });
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();

    let started = tokio::time::Instant::now();
    let mut result = client.execute(&ctx, "select n", &[]).await?;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.columns.len(), 1);

    let mut count = 0;
    while result.rows.next().await.is_some() {
        count += 1;
    }
    assert_eq!(count, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancel_before_dispatch_completes_returns_promptly() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        dispatch_delay: Duration::from_secs(3600),
        ..Script::numbers(1)
    });
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = client
        .execute(&ctx, "select slow", &[])
        .await
        .err()
        .ok_or_else(|| anyhow!("expected cancellation"))?;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, ClientError::QueryCancelled));
    assert_eq!(display_message(&err), "execution cancelled");

    // The cancelled session's connection is discarded, not pooled.
    assert!(eventually(|| client.user_pool_status().open == 0).await);
    Ok(())
}

#[tokio::test]
async fn cancel_mid_stream_stops_delivery_and_releases() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        row_delay: Duration::from_millis(2),
        ..Script::numbers(1000)
    });
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();

    let mut result = client.execute(&ctx, "select n", &[]).await?;
    for _ in 0..3 {
        result
            .rows
            .next()
            .await
            .ok_or_else(|| anyhow!("expected a row"))?;
    }
    ctx.cancel();

    let mut after_cancel = 0;
    while let Some(row) = result.rows.next().await {
        assert!(row.error.is_none(), "cancellation is not a row error");
        after_cancel += 1;
    }
    assert!(after_cancel <= 1, "at most the buffered row follows cancel");

    assert!(eventually(|| backend.cursor_closes() == 1).await);
    assert!(eventually(|| client.user_pool_status().in_use == 0).await);
    assert!(backend.cancels() >= 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dispatch_past_deadline_is_a_query_timeout() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        dispatch_delay: Duration::from_secs(10),
        ..Script::numbers(1)
    });
    let client = client(
        &backend,
        ClientConfig {
            query_timeout_secs: 2,
            ..config()
        },
    )
    .await?;

    let err = client
        .execute(&QueryContext::new(), "select slow", &[])
        .await
        .err()
        .ok_or_else(|| anyhow!("expected timeout"))?;
    assert!(matches!(err, ClientError::QueryTimeout(2)));
    assert_eq!(err.to_string(), "query timeout exceeded (2s)");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deadline_mid_stream_ends_with_timeout_row() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        row_delay: Duration::from_millis(400),
        ..Script::numbers(100)
    });
    let client = client(
        &backend,
        ClientConfig {
            query_timeout_secs: 1,
            ..config()
        },
    )
    .await?;

    let sync = client
        .execute_sync(&QueryContext::new(), "select n", &[])
        .await?;
    assert!(sync.rows.len() < 100);
    let err = sync.error.ok_or_else(|| anyhow!("expected trailing error"))?;
    assert!(matches!(*err, ClientError::QueryTimeout(1)));
    Ok(())
}

#[tokio::test]
async fn row_error_stops_stream_and_keeps_partial_rows() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        row_error_at: Some(2),
        ..Script::numbers(10)
    });
    let client = client(&backend, config()).await?;

    let sync = client
        .execute_sync(&QueryContext::new(), "select n", &[])
        .await?;
    assert_eq!(sync.rows.len(), 3);
    assert_eq!(sync.rows[1].values, vec![Value::Int(1)]);
    assert!(sync.rows[2].is_error());
    let err = sync.error.ok_or_else(|| anyhow!("expected row error"))?;
    assert_eq!(display_message(&err), "row read failed");
    assert_eq!(client.user_pool_status().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn cursor_close_error_is_surfaced_after_rows() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        close_error: Some("ERROR: stream reset".to_string()),
        ..Script::numbers(2)
    });
    let client = client(&backend, config()).await?;

    let mut result = client.execute(&QueryContext::new(), "select n", &[]).await?;
    let mut values = Vec::new();
    let mut errors = Vec::new();
    while let Some(row) = result.rows.next().await {
        match row.error {
            Some(err) => errors.push(display_message(&err)),
            None => values.push(row.values),
        }
    }
    assert_eq!(values.len(), 2);
    assert_eq!(errors, vec!["stream reset".to_string()]);
    Ok(())
}

#[tokio::test]
async fn dispatch_error_is_returned_without_result() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        dispatch_error: Some("ERROR: syntax error at or near \"selec\"".to_string()),
        ..Script::default()
    });
    let client = client(&backend, config()).await?;

    let err = client
        .execute(&QueryContext::new(), "selec 1", &[])
        .await
        .err()
        .ok_or_else(|| anyhow!("expected dispatch error"))?;
    assert_eq!(display_message(&err), "syntax error at or near \"selec\"");
    assert!(eventually(|| client.user_pool_status().in_use == 0).await);
    // A plain failure returns the connection for reuse.
    assert_eq!(client.user_pool_status().open, 1);
    Ok(())
}

#[tokio::test]
async fn failed_dispatch_rolls_back_open_transaction() -> Result<()> {
    let backend = FakeBackend::with_script(Script {
        dispatch_error: Some("boom".to_string()),
        ..Script::default()
    });
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();

    let session = client.acquire_session(&ctx).await?;
    session.begin_transaction().await?;
    assert!(client
        .execute_in_session(&ctx, &session, "insert into t values (1)", &[])
        .await
        .is_err());
    assert!(!session.in_transaction());
    session.close(false).await;

    let log = backend.log();
    assert_eq!(
        log,
        vec![
            "begin".to_string(),
            "insert into t values (1)".to_string(),
            "rollback".to_string()
        ]
    );
    Ok(())
}

#[tokio::test]
async fn execute_in_session_leaves_session_open() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(3));
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();
    let session = client.acquire_session(&ctx).await?;

    for _ in 0..2 {
        let sync = client
            .execute_sync_in_session(&ctx, &session, "select n", &[])
            .await?;
        assert_eq!(sync.rows.len(), 3);
        assert!(eventually(|| !session.is_busy()).await);
    }
    assert_eq!(client.user_pool_status().in_use, 1);

    session.close(false).await;
    assert_eq!(client.user_pool_status().in_use, 0);
    assert_eq!(client.user_pool_status().idle, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_use_of_one_session_is_rejected() -> Result<()> {
    let backend = FakeBackend::with_script(Script::numbers(5));
    let client = client(&backend, config()).await?;
    let ctx = QueryContext::new();
    let session = client.acquire_session(&ctx).await?;

    let mut first = client.execute_in_session(&ctx, &session, "select n", &[]).await?;
    let second = client
        .execute_in_session(&ctx, &session, "select n", &[])
        .await;
    assert!(matches!(second, Err(ClientError::SessionBusy)));

    while first.rows.next().await.is_some() {}
    session.close(false).await;
    Ok(())
}
