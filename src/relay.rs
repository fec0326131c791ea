use crate::accounting::UsageAccountant;
use crate::auth::Identity;
use crate::pricing::UsageRecord;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const RELAY_CHANNEL_CAPACITY: usize = 64;

/// Decodes one SSE line into its JSON payload. Anything that is not a JSON
/// `data:` payload (comments, blank lines, `[DONE]`) yields `None`.
pub fn parse_frame(line: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(line).ok()?.trim();
    let payload = text.strip_prefix("data:").unwrap_or(text).trim();
    if payload.is_empty() {
        return None;
    }
    serde_json::from_str(payload).ok()
}

#[derive(Debug, Default)]
struct LineSplitter {
    buf: BytesMut,
}

impl LineSplitter {
    /// Complete lines, each with its trailing `\n`.
    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            lines.push(self.buf.split_to(pos + 1).freeze());
        }
        lines
    }

    fn finish(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }
}

/// Usage signal gathered from the frames seen so far.
#[derive(Debug, Default)]
pub struct UsageTally {
    content_frames: u64,
    reported: Option<Value>,
    model: Option<String>,
}

impl UsageTally {
    pub fn observe(&mut self, frame: &Value) {
        let has_content = frame
            .pointer("/choices/0/delta/content")
            .is_some_and(|c| !c.is_null());
        if has_content {
            self.content_frames += 1;
        }
        if self.reported.is_none() {
            if let Some(usage) = frame.get("usage").filter(|u| u.is_object()) {
                self.reported = Some(usage.clone());
            }
        }
        if self.model.is_none() {
            self.model = frame
                .get("model")
                .and_then(|m| m.as_str())
                .map(str::to_string);
        }
    }

    pub fn observe_line(&mut self, line: &[u8]) {
        if let Some(frame) = parse_frame(line) {
            self.observe(&frame);
        }
    }

    /// Upstream-reported usage when present, otherwise the frame count with
    /// the prompt estimate.
    pub fn finish(self, default_model: &str, prompt_estimate: u64) -> UsageRecord {
        let model = self.model.unwrap_or_else(|| default_model.to_string());
        self.reported
            .as_ref()
            .and_then(|usage| UsageRecord::from_usage_value(model.clone(), usage))
            .unwrap_or_else(|| UsageRecord::new(model, prompt_estimate, self.content_frames))
    }
}

/// Per-request inputs for accounting a streamed call.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub identity: Identity,
    pub provider: String,
    pub model: String,
    pub prompt_estimate: u64,
}

/// Client side of a relay. Signals the producer once it has yielded its last
/// line or has been dropped.
pub struct RelayStream {
    inner: ReceiverStream<Result<Bytes, Infallible>>,
    drained: Option<oneshot::Sender<()>>,
}

impl Stream for RelayStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(None) = polled {
            if let Some(drained) = self.drained.take() {
                let _ = drained.send(());
            }
        }
        polled
    }
}

/// Relays `upstream` line by line through a bounded channel. The returned
/// handle resolves to the accounted usage once the producer is done, whether
/// upstream finished, failed, or the client went away. Accounting waits until
/// the client stream is exhausted or dropped.
pub fn relay<S, E>(
    upstream: S,
    ctx: RelayContext,
    accountant: UsageAccountant,
) -> (RelayStream, JoinHandle<UsageRecord>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(RELAY_CHANNEL_CAPACITY);
    let (drained_tx, drained_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let mut upstream = std::pin::pin!(upstream);
        let mut splitter = LineSplitter::default();
        let mut tally = UsageTally::default();

        'relay: loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    tracing::info!(uid = %ctx.identity.uid, "client disconnected mid-stream");
                    break 'relay;
                }
                next = upstream.next() => next,
            };
            let lines = match next {
                Some(Ok(chunk)) => splitter.push(&chunk),
                Some(Err(err)) => {
                    tracing::warn!(provider = %ctx.provider, "upstream stream failed: {err}");
                    break 'relay;
                }
                None => {
                    if let Some(rest) = splitter.finish() {
                        tally.observe_line(&rest);
                        let _ = tx.send(Ok(rest)).await;
                    }
                    break 'relay;
                }
            };
            for line in lines {
                tally.observe_line(&line);
                if tx.send(Ok(line)).await.is_err() {
                    tracing::info!(uid = %ctx.identity.uid, "client disconnected mid-stream");
                    break 'relay;
                }
            }
        }
        drop(tx);
        // Err means the client stream was dropped, which is also final.
        let _ = drained_rx.await;

        let usage = tally.finish(&ctx.model, ctx.prompt_estimate);
        accountant.account(&ctx.identity, &ctx.provider, &usage).await;
        usage
    });

    let lines = RelayStream {
        inner: ReceiverStream::new(rx),
        drained: Some(drained_tx),
    };
    (lines, handle)
}
