//! Bus subscription → paced NDJSON stream.
//!
//! A [`StreamBridge`] owns one subscription and serves one client. Each
//! matching record becomes one JSON line, written and flushed on its own,
//! followed by a fixed pause before the next record is taken off the bus.
//!
//! The bridge ends when the client goes away (a write fails or the response
//! body is dropped), when its cancellation token fires, or when the bus is
//! gone. Ending drops the subscription, which unregisters it from the bus.

use std::convert::Infallible;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::domain::{HARVEST_TOPIC, HarvestEvent, RecordKind};
use crate::events::{HarvestBus, Subscription, SubscriptionId};

/// Pause between two lines sent to the same client.
pub const DEFAULT_PACE: Duration = Duration::from_secs(1);

/// Errors that end a bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The client could not be written to.
    #[error("Stream write failed: {0}")]
    StreamWriteFailure(#[source] std::io::Error),

    /// A record could not be encoded.
    #[error("Failed to encode record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which records a client wants.
///
/// Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    pub kinds: Vec<RecordKind>,
    pub territory: Option<String>,
    pub network: Option<String>,
}

impl StreamFilter {
    /// Parse a comma separated kind list such as `message,hashtag`.
    pub fn parse_kinds(list: &str) -> Result<Vec<RecordKind>, String> {
        list.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::parse)
            .collect()
    }

    #[must_use]
    pub fn matches(&self, event: &HarvestEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind()))
            && self
                .territory
                .as_deref()
                .is_none_or(|territory| event.territory() == territory)
            && self
                .network
                .as_deref()
                .is_none_or(|network| event.network().eq_ignore_ascii_case(network))
    }
}

/// One client's view of the harvest stream.
pub struct StreamBridge {
    subscription: Subscription<HarvestEvent>,
    filter: StreamFilter,
    pace: Duration,
    cancel: CancellationToken,
    lines_sent: u64,
}

impl std::fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBridge")
            .field("subscription", &self.subscription.id())
            .field("filter", &self.filter)
            .field("pace", &self.pace)
            .field("lines_sent", &self.lines_sent)
            .finish()
    }
}

impl StreamBridge {
    /// Subscribe to the harvest topic on behalf of a new client.
    ///
    /// Records published from this point on are candidates for the stream.
    pub fn new(
        bus: &HarvestBus,
        filter: StreamFilter,
        pace: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let subscription = bus.subscribe(HARVEST_TOPIC);
        tracing::info!(
            subscription_id = %subscription.id(),
            filter = ?filter,
            "Stream client connected"
        );
        Self {
            subscription,
            filter,
            pace,
            cancel,
            lines_sent: 0,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    /// Wait for the next matching record and encode it as one line.
    ///
    /// `Ok(None)` means the bridge should stop.
    async fn next_line(&mut self) -> Result<Option<Bytes>, BridgeError> {
        loop {
            let envelope = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(None),
                next = self.subscription.recv() => match next {
                    Some(envelope) => envelope,
                    None => return Ok(None),
                },
            };

            if !self.filter.matches(&envelope.event) {
                continue;
            }

            let mut line = serde_json::to_vec(&*envelope.event)?;
            line.push(b'\n');
            return Ok(Some(Bytes::from(line)));
        }
    }

    /// Pause between lines. Returns `false` if cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(self.pace) => true,
        }
    }

    /// Drive the bridge into `writer` until it ends.
    ///
    /// Returns the number of lines written. A failed write or flush ends the
    /// stream with [`BridgeError::StreamWriteFailure`]; it is not retried.
    pub async fn run<W>(mut self, writer: &mut W) -> Result<u64, BridgeError>
    where
        W: AsyncWrite + Unpin,
    {
        let result = self.pump(writer).await;
        match &result {
            Ok(lines) => {
                tracing::info!(subscription_id = %self.id(), lines, "Stream closed");
            }
            Err(e) => {
                tracing::info!(
                    subscription_id = %self.id(),
                    lines = self.lines_sent,
                    error = %e,
                    "Stream client disconnected"
                );
            }
        }
        result
    }

    async fn pump<W>(&mut self, writer: &mut W) -> Result<u64, BridgeError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(line) = self.next_line().await? {
            writer
                .write_all(&line)
                .await
                .map_err(BridgeError::StreamWriteFailure)?;
            writer.flush().await.map_err(BridgeError::StreamWriteFailure)?;
            self.lines_sent += 1;

            if !self.pause().await {
                break;
            }
        }
        Ok(self.lines_sent)
    }

    /// Turn the bridge into a chunked response body, one chunk per line.
    ///
    /// Dropping the stream (the HTTP layer does so when the client
    /// disconnects) drops the subscription.
    pub fn into_body_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        let mut bridge = self;
        async_stream::stream! {
            loop {
                match bridge.next_line().await {
                    Ok(Some(line)) => {
                        yield Ok(line);
                        bridge.lines_sent += 1;
                        if !bridge.pause().await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(subscription_id = %bridge.id(), error = %e, "Stream aborted");
                        break;
                    }
                }
            }
            tracing::info!(subscription_id = %bridge.id(), lines = bridge.lines_sent, "Stream closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HarvestHashtag, HarvestMessage};
    use crate::events::EventBus;
    use futures::StreamExt;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::time::Instant;

    fn message(n: u32) -> HarvestEvent {
        HarvestEvent::Message(HarvestMessage {
            territory: "north".to_string(),
            network: "twitter".to_string(),
            message_id: n.to_string(),
            message: format!("message {n}"),
            ..Default::default()
        })
    }

    fn hashtag(territory: &str, tag: &str) -> HarvestEvent {
        HarvestEvent::Hashtag(HarvestHashtag {
            territory: territory.to_string(),
            network: "facebook".to_string(),
            tag: tag.to_string(),
            ..Default::default()
        })
    }

    async fn read_lines(reader: DuplexStream, count: usize) -> Vec<(Instant, serde_json::Value)> {
        let mut lines = BufReader::new(reader).lines();
        let mut out = Vec::new();
        while out.len() < count {
            let line = lines.next_line().await.unwrap().unwrap();
            out.push((Instant::now(), serde_json::from_str(&line).unwrap()));
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_clients_receive_every_event_in_order() {
        let bus = EventBus::new();
        let cancel = CancellationToken::new();

        let mut clients = Vec::new();
        for _ in 0..2 {
            let (mut server_side, client_side) = tokio::io::duplex(4096);
            let bridge =
                StreamBridge::new(&bus, StreamFilter::default(), DEFAULT_PACE, cancel.child_token());
            tokio::spawn(async move { bridge.run(&mut server_side).await });
            clients.push(tokio::spawn(read_lines(client_side, 3)));
        }

        for n in 0..3 {
            bus.publish(HARVEST_TOPIC, message(n));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        for client in clients {
            let lines = client.await.unwrap();
            assert_eq!(lines.len(), 3);
            for (n, (_, json)) in lines.iter().enumerate() {
                assert_eq!(json["type"], "message");
                assert_eq!(json["message_id"], n.to_string());
            }
            for pair in lines.windows(2) {
                assert!(pair[1].0 - pair[0].0 >= Duration::from_secs(1));
            }
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_paced() {
        let bus = EventBus::new();
        let (mut server_side, client_side) = tokio::io::duplex(4096);
        let bridge = StreamBridge::new(
            &bus,
            StreamFilter::default(),
            DEFAULT_PACE,
            CancellationToken::new(),
        );
        tokio::spawn(async move { bridge.run(&mut server_side).await });

        let start = Instant::now();
        for n in 0..3 {
            bus.publish(HARVEST_TOPIC, message(n));
        }
        let lines = read_lines(client_side, 3).await;

        assert!(lines[0].0 - start < Duration::from_secs(1));
        assert!(lines[2].0 - start >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_write_failure_ends_stream_and_unsubscribes() {
        let bus = EventBus::new();
        let (mut server_side, client_side) = tokio::io::duplex(64);
        drop(client_side);

        let bridge = StreamBridge::new(
            &bus,
            StreamFilter::default(),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        let mut other = bus.subscribe(HARVEST_TOPIC);
        assert_eq!(bus.subscriber_count(HARVEST_TOPIC), 2);

        let run = tokio::spawn(async move { bridge.run(&mut server_side).await });
        bus.publish(HARVEST_TOPIC, message(1));

        let result = run.await.unwrap();
        assert!(matches!(result, Err(BridgeError::StreamWriteFailure(_))));
        assert_eq!(bus.subscriber_count(HARVEST_TOPIC), 1);

        // Other subscribers are unaffected.
        bus.publish(HARVEST_TOPIC, message(2));
        assert_eq!(other.recv().await.unwrap().event.kind(), RecordKind::Message);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_unsubscribes() {
        let bus = EventBus::<HarvestEvent>::new();
        let cancel = CancellationToken::new();
        let (mut server_side, _client_side) = tokio::io::duplex(64);
        let bridge = StreamBridge::new(&bus, StreamFilter::default(), DEFAULT_PACE, cancel.clone());

        let run = tokio::spawn(async move { bridge.run(&mut server_side).await });
        cancel.cancel();

        assert_eq!(run.await.unwrap().unwrap(), 0);
        assert_eq!(bus.subscriber_count(HARVEST_TOPIC), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_skips_without_pacing() {
        let bus = EventBus::new();
        let filter = StreamFilter {
            kinds: vec![RecordKind::Hashtag],
            territory: Some("north".to_string()),
            network: None,
        };
        let bridge = StreamBridge::new(&bus, filter, DEFAULT_PACE, CancellationToken::new());
        let mut body = Box::pin(bridge.into_body_stream());

        bus.publish(HARVEST_TOPIC, message(1));
        bus.publish(HARVEST_TOPIC, hashtag("south", "skip"));
        bus.publish(HARVEST_TOPIC, hashtag("north", "keep"));

        let start = Instant::now();
        let chunk = body.next().await.unwrap().unwrap();
        assert!(Instant::now() - start < DEFAULT_PACE);

        let json: serde_json::Value = serde_json::from_slice(&chunk).unwrap();
        assert_eq!(json["tag"], "keep");
        assert!(chunk.ends_with(b"\n"));
    }

    #[tokio::test]
    async fn test_dropping_body_stream_unsubscribes() {
        let bus = EventBus::<HarvestEvent>::new();
        let bridge = StreamBridge::new(
            &bus,
            StreamFilter::default(),
            DEFAULT_PACE,
            CancellationToken::new(),
        );
        let body = bridge.into_body_stream();
        assert_eq!(bus.subscriber_count(HARVEST_TOPIC), 1);

        drop(body);
        assert_eq!(bus.subscriber_count(HARVEST_TOPIC), 0);
    }

    #[test]
    fn test_parse_kinds() {
        assert_eq!(
            StreamFilter::parse_kinds("message, hashtag,,"),
            Ok(vec![RecordKind::Message, RecordKind::Hashtag])
        );
        assert!(StreamFilter::parse_kinds("message,retweet").is_err());
        assert_eq!(StreamFilter::parse_kinds(""), Ok(vec![]));
    }

    #[test]
    fn test_network_filter_ignores_case() {
        let filter = StreamFilter {
            network: Some("Twitter".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&message(1)));
        assert!(!filter.matches(&hashtag("north", "x")));
    }
}
