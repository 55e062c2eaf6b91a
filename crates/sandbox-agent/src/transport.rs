//! JSON-lines transport: one request per inbound line, one response per outbound line.
//!
//! Actions run on their own tasks so queries stay answerable while a command
//! holds the dispatcher lock. Responses carry the request id and may arrive
//! out of order.

use crate::dispatcher::ActionDispatcher;
use agent_api_types::{ApiError, Query, Request, Response};
use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Serve until the reader is exhausted or the session turns fatal, then wait
/// for in-flight actions and hand the writer back.
pub async fn serve<R, W>(
    dispatcher: Arc<ActionDispatcher>,
    reader: R,
    writer: W,
) -> anyhow::Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let fatal = CancellationToken::new();
    let mut actions: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            _ = fatal.cancelled() => {
                warn!("session ended; no longer reading requests");
                break;
            }
            Some(res) = actions.join_next(), if !actions.is_empty() => {
                log_task_result(res);
                continue;
            }
            res = lines.next_line() => match res.context("failed to read request")? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        match ApiError::decode_request(&line) {
            Ok(Request::Action { id, action }) => {
                let dispatcher = Arc::clone(&dispatcher);
                let writer = Arc::clone(&writer);
                let fatal = fatal.clone();
                actions.spawn(async move {
                    let observation = dispatcher.run_request(Some(id), action).await;
                    let fatal_now = observation.is_session_fatal();
                    write_response(
                        &writer,
                        &Response::Observation {
                            id: Some(id),
                            observation,
                        },
                    )
                    .await?;
                    if fatal_now {
                        fatal.cancel();
                    }
                    Ok(())
                });
            }
            Ok(Request::Query { id, query }) => {
                debug!(id, ?query, "query");
                let info = match query {
                    Query::Alive => dispatcher.alive(),
                    Query::ServerInfo => dispatcher.server_info(),
                };
                write_response(&writer, &Response::Info { id, info }).await?;
            }
            Err((id, err)) => {
                warn!(id, error = %err, "undecodable request");
                let observation = err.into_observation();
                write_response(&writer, &Response::Observation { id, observation }).await?;
            }
        }
    }

    while let Some(res) = actions.join_next().await {
        log_task_result(res);
    }

    let writer = Arc::try_unwrap(writer)
        .map_err(|_| anyhow::anyhow!("response writer still shared after shutdown"))?
        .into_inner();
    Ok(writer)
}

async fn write_response<W>(writer: &Mutex<W>, response: &Response) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(response).context("failed to encode response")?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer
        .write_all(line.as_bytes())
        .await
        .context("failed to write response")?;
    writer.flush().await.context("failed to flush response")?;
    Ok(())
}

fn log_task_result(res: Result<anyhow::Result<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "action response failed"),
        Err(join_err) => warn!("action task panicked: {join_err}"),
    }
}
