//! WebSocket client that feeds [`OrderBookReplica`]s from delta updates and
//! derives `MARKET_STATE` signals for the bus (spec section 4.3, section 6.3).
use crate::gateway::GatewayError;
use crate::orderbook::{BookSide, Level, OrderBookReplica};
use crate::signal::bus::{now_signal, SignalBus};
use crate::signal::{DepthSample as SignalDepthSample, Priority, SignalPayload};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

/// Lifecycle states from spec section 4.3:
/// `IDLE -> CONNECTING -> SUBSCRIBED -> {STREAMING <-> RESYNCING} -> CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Subscribed,
    Streaming,
    Resyncing,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
struct SubscribeMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    assets_ids: &'a [String],
}

#[derive(Debug, Clone, Serialize)]
struct PingMessage {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingEvent {
    Book {
        asset_id: String,
        bids: Vec<WireLevel>,
        asks: Vec<WireLevel>,
    },
    PriceChange {
        asset_id: String,
        side: WireSide,
        price: Decimal,
        size: Decimal,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireSide {
    Bid,
    Ask,
}

impl From<WireSide> for BookSide {
    fn from(value: WireSide) -> Self {
        match value {
            WireSide::Bid => BookSide::Bid,
            WireSide::Ask => BookSide::Ask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct WireLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl From<WireLevel> for Level {
    fn from(value: WireLevel) -> Self {
        Level {
            price: value.price,
            size: value.size,
        }
    }
}

/// The server may send either a single event object or a JSON array of events;
/// the client accepts both shapes (spec section 6.3).
pub fn parse_ws_text(text: &str) -> Result<Vec<IncomingEvent>, serde_json::Error> {
    if let Ok(batch) = serde_json::from_str::<Vec<IncomingEvent>>(text) {
        return Ok(batch);
    }
    serde_json::from_str::<IncomingEvent>(text).map(|event| vec![event])
}

/// Maintains replicas for the assets it is subscribed to, driving them from
/// `book`/`price_change` events, and deriving `MARKET_STATE` signals.
pub struct MarketDataStream {
    state: ConnectionState,
    replicas: HashMap<String, OrderBookReplica>,
    /// Assets awaiting a fresh snapshot after a reconnect; deltas for these
    /// assets are discarded until their snapshot arrives (spec section 4.3).
    awaiting_snapshot: HashSet<String>,
    bus: SignalBus,
    source: String,
}

impl MarketDataStream {
    pub fn new(bus: SignalBus, source: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Idle,
            replicas: HashMap::new(),
            awaiting_snapshot: HashSet::new(),
            bus,
            source: source.into(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Called once the subscribe message has been sent successfully.
    pub fn mark_subscribed(&mut self, assets: &[String]) {
        self.state = ConnectionState::Subscribed;
        self.awaiting_snapshot = assets.iter().cloned().collect();
    }

    /// Called when the socket drops; every subscribed asset's replica must be
    /// re-initialised from a fresh snapshot before further deltas apply.
    pub fn begin_resync(&mut self, assets: &[String]) {
        self.state = ConnectionState::Resyncing;
        self.awaiting_snapshot = assets.iter().cloned().collect();
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Apply one decoded event in received order (spec section 4.3/5: ordering
    /// is guaranteed per-asset, not across assets).
    pub fn apply_event(&mut self, event: IncomingEvent) {
        match event {
            IncomingEvent::Book { asset_id, bids, asks } => self.apply_book(asset_id, bids, asks),
            IncomingEvent::PriceChange {
                asset_id,
                side,
                price,
                size,
            } => self.apply_price_change(asset_id, side.into(), price, size),
        }
    }

    fn apply_book(&mut self, asset_id: String, bids: Vec<WireLevel>, asks: Vec<WireLevel>) {
        let bids: Vec<Level> = bids.into_iter().map(Into::into).collect();
        let asks: Vec<Level> = asks.into_iter().map(Into::into).collect();

        let replica = self.replicas.entry(asset_id.clone()).or_default();
        replica.apply_snapshot(&bids, &asks);

        self.awaiting_snapshot.remove(&asset_id);
        if self.awaiting_snapshot.is_empty() && self.state == ConnectionState::Resyncing {
            self.state = ConnectionState::Streaming;
        } else if self.state == ConnectionState::Subscribed {
            self.state = ConnectionState::Streaming;
        }

        self.publish_market_state(&asset_id);
    }

    fn apply_price_change(&mut self, asset_id: String, side: BookSide, price: Decimal, size: Decimal) {
        if self.state == ConnectionState::Resyncing {
            warn!(asset_id = %asset_id, "discarding delta received while RESYNCING");
            return;
        }

        let Some(replica) = self.replicas.get_mut(&asset_id) else {
            warn!(asset_id = %asset_id, "delta for asset with no snapshot yet; ignoring");
            return;
        };
        replica.apply_delta(side, price, size);
        self.publish_market_state(&asset_id);
    }

    fn publish_market_state(&self, asset_id: &str) {
        let Some(replica) = self.replicas.get(asset_id) else {
            return;
        };
        let (bid_levels, ask_levels) = replica.depth(10);

        self.bus.publish(now_signal(
            Priority::Low,
            self.source.clone(),
            Some(Duration::from_secs(30)),
            SignalPayload::MarketState {
                token_id: asset_id.to_string(),
                best_bid: replica.best_bid().map(|l| l.price),
                best_ask: replica.best_ask().map(|l| l.price),
                mid: replica.mid(),
                depth_sample: SignalDepthSample {
                    bids: bid_levels.iter().map(|l| (l.price, l.size)).collect(),
                    asks: ask_levels.iter().map(|l| (l.price, l.size)).collect(),
                },
            },
        ));
    }

    pub fn replica(&self, asset_id: &str) -> Option<&OrderBookReplica> {
        self.replicas.get(asset_id)
    }

    /// Drive the real WebSocket connection for `assets`, reconnecting with
    /// exponential backoff (base 1s, max 30s) until `shutdown` resolves.
    ///
    /// This is the network-facing half of the component; the pure state
    /// transitions above are exercised directly by unit tests.
    pub async fn run(
        &mut self,
        ws_url: &str,
        assets: Vec<String>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), GatewayError> {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(30);

        loop {
            if *shutdown.borrow() {
                self.close();
                return Ok(());
            }

            self.begin_connect();
            match self.connect_and_stream(ws_url, &assets, &mut shutdown).await {
                Ok(()) => {
                    self.close();
                    return Ok(());
                }
                Err(err) => {
                    warn!(error = %err, backoff_secs = backoff.as_secs(), "market data connection lost, reconnecting");
                    self.begin_resync(&assets);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                self.close();
                                return Ok(());
                            }
                        }
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_and_stream(
        &mut self,
        ws_url: &str,
        assets: &[String],
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), GatewayError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| GatewayError::Feed(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let subscribe = SubscribeMessage {
            kind: "market",
            assets_ids: assets,
        };
        let text = serde_json::to_string(&subscribe).map_err(|e| GatewayError::Feed(e.to_string()))?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::Feed(e.to_string()))?;
        self.mark_subscribed(assets);
        info!(assets = assets.len(), "market data subscribed");

        let mut ping_interval = tokio::time::interval(Duration::from_secs(20));
        let mut missed_pongs: u32 = 0;

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    missed_pongs += 1;
                    if missed_pongs > 2 {
                        return Err(GatewayError::Feed("missed pong within 2 ping intervals".to_string()));
                    }
                    let ping = PingMessage { kind: "ping" };
                    let text = serde_json::to_string(&ping).map_err(|e| GatewayError::Feed(e.to_string()))?;
                    sink.send(Message::Text(text.into())).await.map_err(|e| GatewayError::Feed(e.to_string()))?;
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match parse_ws_text(&text) {
                                Ok(events) => {
                                    for event in events {
                                        self.apply_event(event);
                                    }
                                }
                                Err(error) => warn!(%error, "protocol violation: malformed market data message"),
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            missed_pongs = 0;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(GatewayError::Feed("connection closed by peer".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => return Err(GatewayError::Feed(error.to_string())),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;
    use rust_decimal_macros::dec;

    fn bus() -> SignalBus {
        SignalBus::new(100, Duration::from_millis(50))
    }

    #[test]
    fn parses_both_single_and_batch_shapes() {
        let single = r#"{"type":"book","asset_id":"t1","bids":[],"asks":[]}"#;
        assert_eq!(parse_ws_text(single).unwrap().len(), 1);

        let batch = r#"[{"type":"book","asset_id":"t1","bids":[],"asks":[]},{"type":"book","asset_id":"t2","bids":[],"asks":[]}]"#;
        assert_eq!(parse_ws_text(batch).unwrap().len(), 2);
    }

    #[test]
    fn reconnect_discards_deltas_until_fresh_snapshot_s6() {
        let mut stream = MarketDataStream::new(bus(), "feed");
        let assets = vec!["t1".to_string()];

        stream.begin_connect();
        stream.mark_subscribed(&assets);
        stream.apply_event(IncomingEvent::Book {
            asset_id: "t1".to_string(),
            bids: vec![WireLevel { price: dec!(0.48), size: dec!(100) }],
            asks: vec![WireLevel { price: dec!(0.49), size: dec!(100) }],
        });
        assert_eq!(stream.state(), ConnectionState::Streaming);

        // Connection lost; resync begins.
        stream.begin_resync(&assets);
        assert_eq!(stream.state(), ConnectionState::Resyncing);

        // Two deltas arrive during RESYNCING: both must be discarded.
        stream.apply_event(IncomingEvent::PriceChange {
            asset_id: "t1".to_string(),
            side: WireSide::Bid,
            price: dec!(0.40),
            size: dec!(5),
        });
        stream.apply_event(IncomingEvent::PriceChange {
            asset_id: "t1".to_string(),
            side: WireSide::Ask,
            price: dec!(0.60),
            size: dec!(5),
        });
        assert_eq!(stream.replica("t1").unwrap().best_bid().unwrap().price, dec!(0.48));
        assert_eq!(stream.replica("t1").unwrap().best_ask().unwrap().price, dec!(0.49));

        // Fresh snapshot restores the replica to exactly the snapshot.
        stream.apply_event(IncomingEvent::Book {
            asset_id: "t1".to_string(),
            bids: vec![WireLevel { price: dec!(0.50), size: dec!(10) }],
            asks: vec![WireLevel { price: dec!(0.51), size: dec!(10) }],
        });
        assert_eq!(stream.state(), ConnectionState::Streaming);
        assert_eq!(stream.replica("t1").unwrap().best_bid().unwrap().price, dec!(0.50));
        assert_eq!(stream.replica("t1").unwrap().best_ask().unwrap().price, dec!(0.51));
    }

    #[test]
    fn publishes_market_state_on_update() {
        let bus = bus();
        let mut stream = MarketDataStream::new(bus.clone(), "feed");
        stream.apply_event(IncomingEvent::Book {
            asset_id: "t1".to_string(),
            bids: vec![WireLevel { price: dec!(0.48), size: dec!(100) }],
            asks: vec![WireLevel { price: dec!(0.49), size: dec!(100) }],
        });

        let recent = bus.recent(SignalKind::MarketState, Duration::from_secs(60));
        assert_eq!(recent.len(), 1);
    }
}
