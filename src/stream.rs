//! SSE plumbing shared by the streaming handlers, plus the rate-limit retry
//! loop that every upstream call goes through.
//!
//! The writer side reports client disconnects through plain `bool` returns:
//! once the response body is dropped, every send fails, and the handler's
//! pump loop uses that to tear down the upstream read and the heartbeat
//! together.

use axum::body::Body;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{error::GatewayError, pool::TokenPool};

/// Writer half of an SSE response body.
pub struct StreamWriter {
    tx: mpsc::Sender<anyhow::Result<Bytes>>,
}

/// Create a paired SSE writer and response body.
pub fn sse_channel() -> (StreamWriter, Body) {
    let (tx, mut rx) = mpsc::channel::<anyhow::Result<Bytes>>(32);
    let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
    (StreamWriter { tx }, Body::from_stream(stream))
}

fn frame_data(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

impl StreamWriter {
    /// Send one `data:` frame. Returns false once the client is gone.
    pub async fn data(&self, value: &Value) -> bool {
        self.tx.send(Ok(frame_data(value))).await.is_ok()
    }

    /// SSE comment frame used as a keep-alive.
    pub async fn heartbeat(&self) -> bool {
        self.tx.send(Ok(Bytes::from_static(b": heartbeat\n\n"))).await.is_ok()
    }

    /// OpenAI-style stream terminator.
    pub async fn done(&self) -> bool {
        self.tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await.is_ok()
    }
}

/// Run `attempt` against pool-supplied accounts, retrying on upstream 429.
///
/// Every attempt re-acquires a token, so rotation can move past an exhausted
/// account between attempts; each 429 is also reported back to the pool to
/// drive the `quota_exhausted` strategy. `max_retries` counts additional
/// attempts after the first. Non-rate-limit errors are returned immediately,
/// and exhausting all attempts surfaces the last rate-limit error unchanged.
pub async fn with_rate_limit_retry<T, F>(
    pool: &TokenPool,
    max_retries: u32,
    mut attempt: F,
) -> Result<T, GatewayError>
where
    F: FnMut(crate::account::Account) -> BoxFuture<'static, Result<T, GatewayError>>,
{
    let mut last_err = GatewayError::NoTokenAvailable;
    for try_no in 0..=max_retries {
        let account = pool.acquire().await?;
        match attempt(account.clone()).await {
            Ok(value) => return Ok(value),
            Err(GatewayError::RateLimited { message }) => {
                warn!(attempt = try_no + 1, "upstream rate limited, rotating to next account");
                pool.report_exhausted(&account.refresh_token).await;
                last_err = GatewayError::RateLimited { message };
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}
