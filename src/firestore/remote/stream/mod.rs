use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, invalid_argument, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::remote::credentials::Token;
use crate::firestore::remote::datastore::{Connection, StreamHandle};
use crate::platform::runtime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Opens a stream for the named RPC.
    Open { rpc: String, token: Option<String> },
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn new(stream_id: StreamId, kind: FrameKind) -> Self {
        Self { stream_id, kind }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Ordered, reliable frame pipe between two connection endpoints.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

fn registry(streams: &StreamRegistry) -> MutexGuard<'_, HashMap<StreamId, Sender<FrameKind>>> {
    streams.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// A stream the peer opened on an accepting connection.
pub struct AcceptedStream {
    pub rpc: String,
    pub token: Option<String>,
    pub stream: MultiplexedStream,
}

/// Runs many logical streams over one [`StreamTransport`].
///
/// The initiating side allocates odd stream ids and the accepting side even
/// ones, so both ends may open streams without colliding.
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    accepted: Option<Receiver<AcceptedStream>>,
}

impl MultiplexedConnection {
    /// Client side of a connection.
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self::start(transport, 1, false)
    }

    /// Server side of a connection: streams the peer opens are delivered
    /// through [`MultiplexedConnection::accept_stream`].
    pub fn new_acceptor(transport: Arc<dyn StreamTransport>) -> Self {
        Self::start(transport, 2, true)
    }

    fn start(transport: Arc<dyn StreamTransport>, first_id: u32, accepting: bool) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (accept_tx, accept_rx) = if accepting {
            let (tx, rx) = async_channel::unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Self::start_outbound_loop(Arc::clone(&transport), outbound_rx);
        Self::start_inbound_loop(transport, Arc::clone(&streams), outbound_tx.clone(), accept_tx);

        Self {
            next_stream_id: AtomicU32::new(first_id),
            outbound_tx,
            streams,
            accepted: accept_rx,
        }
    }

    fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(
        transport: Arc<dyn StreamTransport>,
        streams: StreamRegistry,
        outbound_tx: Sender<TransportFrame>,
        accept_tx: Option<Sender<AcceptedStream>>,
    ) {
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::debug!("multiplexed inbound loop terminated: {err}");
                        break;
                    }
                };
                let stream_id = frame.stream_id();
                let sender = registry(&streams).get(&stream_id).cloned();
                match (sender, frame.kind) {
                    (None, FrameKind::Open { rpc, token }) => {
                        let Some(accept_tx) = &accept_tx else {
                            log::debug!("rejecting stream {} opened by peer", stream_id.value());
                            let _ = outbound_tx.try_send(TransportFrame::new(
                                stream_id,
                                FrameKind::Error(invalid_argument("Connection does not accept streams")),
                            ));
                            continue;
                        };
                        let (inbound_tx, inbound_rx) = async_channel::unbounded();
                        registry(&streams).insert(stream_id, inbound_tx);
                        let stream = MultiplexedStream {
                            id: stream_id,
                            outbound: outbound_tx.clone(),
                            inbound: inbound_rx,
                            streams: Arc::clone(&streams),
                        };
                        let _ = accept_tx.send(AcceptedStream { rpc, token, stream }).await;
                    }
                    (None, _) => {
                        log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    }
                    (Some(sender), event @ (FrameKind::Close | FrameKind::Error(_))) => {
                        registry(&streams).remove(&stream_id);
                        let _ = sender.send(event).await;
                    }
                    (Some(sender), event) => {
                        if sender.send(event).await.is_err() {
                            log::debug!("dropping frame for closed stream {}", stream_id.value());
                        }
                    }
                }
            }

            // Every stream still open loses its peer.
            let orphaned: Vec<Sender<FrameKind>> = registry(&streams).drain().map(|(_, tx)| tx).collect();
            for sender in orphaned {
                let _ = sender
                    .send(FrameKind::Error(unavailable("Connection to the backend was lost")))
                    .await;
            }
        });
    }

    pub async fn open_stream(&self, rpc: &str, token: Option<String>) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId(self.next_stream_id.fetch_add(2, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        registry(&self.streams).insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::new(
                stream_id,
                FrameKind::Open {
                    rpc: rpc.to_string(),
                    token,
                },
            ))
            .await
            .map_err(|err| unavailable(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            streams: Arc::clone(&self.streams),
        })
    }

    /// Waits for the peer to open a stream. Only valid on acceptors.
    pub async fn accept_stream(&self) -> FirestoreResult<AcceptedStream> {
        let accepted = self
            .accepted
            .as_ref()
            .ok_or_else(|| internal_error("Connection was not created as an acceptor"))?;
        accepted
            .recv()
            .await
            .map_err(|_| unavailable("Connection closed"))
    }
}

#[async_trait]
impl Connection for MultiplexedConnection {
    async fn open_stream(&self, rpc: &str, token: Option<&Token>) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let stream = MultiplexedConnection::open_stream(self, rpc, token.map(|token| token.value.clone())).await?;
        Ok(Arc::new(stream))
    }

    async fn invoke_rpc(&self, rpc: &str, token: Option<&Token>, request: JsonValue) -> FirestoreResult<JsonValue> {
        let stream = MultiplexedConnection::open_stream(self, rpc, token.map(|token| token.value.clone())).await?;
        stream.send(request).await?;
        let response = match stream.next().await {
            Some(result) => result,
            None => Err(unavailable(format!("{rpc} closed without a response"))),
        };
        stream.close().await;
        response
    }
}

/// One logical stream of a [`MultiplexedConnection`].
pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    streams: StreamRegistry,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send_bytes(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::new(self.id, FrameKind::Data(payload)))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue stream frame: {err}")))
    }

    /// Next payload. `None` once the peer closed the stream.
    pub async fn next_bytes(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open { .. } => continue,
            }
        }
        None
    }

    /// Terminates the stream with `error` on the peer's side.
    pub async fn fail(&self, error: FirestoreError) {
        registry(&self.streams).remove(&self.id);
        let _ = self
            .outbound
            .send(TransportFrame::new(self.id, FrameKind::Error(error)))
            .await;
    }

    fn close_now(&self) -> bool {
        let registered = registry(&self.streams).remove(&self.id).is_some();
        self.inbound.close();
        registered
    }
}

#[async_trait]
impl StreamHandle for MultiplexedStream {
    async fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        let payload = serde_json::to_vec(&message)
            .map_err(|err| internal_error(format!("failed to encode stream message: {err}")))?;
        self.send_bytes(payload).await
    }

    async fn next(&self) -> Option<FirestoreResult<JsonValue>> {
        let payload = match self.next_bytes().await? {
            Ok(payload) => payload,
            Err(err) => return Some(Err(err)),
        };
        Some(
            serde_json::from_slice(&payload)
                .map_err(|err| internal_error(format!("failed to decode stream message: {err}"))),
        )
    }

    async fn close(&self) {
        if self.close_now() {
            let _ = self
                .outbound
                .send(TransportFrame::new(self.id, FrameKind::Close))
                .await;
        }
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        if self.close_now() {
            let _ = self
                .outbound
                .try_send(TransportFrame::new(self.id, FrameKind::Close));
        }
    }
}

/// Loopback transport: frames sent on one end arrive on the other.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }

    /// Severs the link in both directions.
    pub fn disconnect(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}
