use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{ArborError, Result};
use crate::protocol::codec::{read_message, write_message};
use crate::protocol::TreeMessage;
use crate::types::NodeId;

type CallReceiverMap = HashMap<u64, Arc<Mutex<mpsc::Receiver<TreeMessage>>>>;

/// Shared state between the recv loop and the link.
///
/// When a collective payload arrives before anyone has called `recv` for
/// that call id, it is buffered in `pending`. When a receiver registers,
/// pending data is flushed into the new channel. Calls that have been
/// released are remembered in `closed` so late arrivals are dropped
/// instead of accumulating.
struct RecvState {
    senders: HashMap<u64, mpsc::Sender<TreeMessage>>,
    pending: HashMap<u64, Vec<TreeMessage>>,
    closed: HashSet<u64>,
    /// Set when the recv loop exits; new receivers observe a closed
    /// channel instead of waiting on an edge that will never deliver.
    dead: bool,
}

/// One tree edge: a framed TCP connection to a single peer.
///
/// The send side lives behind a mutex; all receiving is done by a
/// background loop that decodes frames and routes `Partial`/`Bcast`
/// messages into per-call channels. Early arrivals for a call nobody is
/// waiting on yet are buffered, which is what lets the engine combine
/// children in their fixed order regardless of network interleaving.
///
/// Established once during `connect` and reused for every collective
/// call; never reconnected per call.
pub(crate) struct Link {
    peer: NodeId,
    writer: Mutex<OwnedWriteHalf>,
    state: Arc<Mutex<RecvState>>,
    /// Per-call receivers, each independently lockable so concurrent
    /// calls on different ids never block each other.
    call_rx: Mutex<CallReceiverMap>,
    _recv_handle: tokio::task::JoinHandle<()>,
}

impl Link {
    /// Wrap an already-handshaken TCP stream and start its recv loop.
    pub(crate) fn spawn(peer: NodeId, stream: TcpStream, max_frame_bytes: usize) -> Arc<Self> {
        let (reader, writer) = stream.into_split();

        let state = Arc::new(Mutex::new(RecvState {
            senders: HashMap::new(),
            pending: HashMap::new(),
            closed: HashSet::new(),
            dead: false,
        }));

        let recv_state = Arc::clone(&state);
        let recv_handle = tokio::spawn(async move {
            recv_loop(peer, reader, recv_state, max_frame_bytes).await;
        });

        Arc::new(Self {
            peer,
            writer: Mutex::new(writer),
            state,
            call_rx: Mutex::new(HashMap::new()),
            _recv_handle: recv_handle,
        })
    }

    /// Peer on the far side of this edge.
    pub(crate) fn peer(&self) -> NodeId {
        self.peer
    }

    /// Send one framed message over this edge.
    pub(crate) async fn send(&self, msg: &TreeMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, msg).await
    }

    /// Receive the next collective payload for a call id.
    ///
    /// Blocks until a message routed to that call arrives, or errors if
    /// the edge closed.
    pub(crate) async fn recv(&self, call: u64) -> Result<TreeMessage> {
        let rx_arc = self.get_call_receiver(call).await;
        let msg = rx_arc
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ArborError::connection(self.peer, "edge link closed".to_string()));
        msg
    }

    /// Drop routing state for a finished or failed call.
    ///
    /// Late messages for a released call are discarded by the recv loop,
    /// so a timed-out call cannot poison a later one.
    pub(crate) async fn release_call(&self, call: u64) {
        self.call_rx.lock().await.remove(&call);
        let mut st = self.state.lock().await;
        st.senders.remove(&call);
        st.pending.remove(&call);
        st.closed.insert(call);
    }

    /// Get or create a per-call receiver. Returns an `Arc<Mutex<Receiver>>`
    /// that can be locked independently of other calls.
    async fn get_call_receiver(&self, call: u64) -> Arc<Mutex<mpsc::Receiver<TreeMessage>>> {
        // Fast path: already registered.
        {
            let map = self.call_rx.lock().await;
            if let Some(rx) = map.get(&call) {
                return Arc::clone(rx);
            }
        }
        // Slow path: create channel, register sender, flush pending
        // outside the state lock.
        let (tx, rx) = mpsc::channel(64);
        let flush_tx = tx.clone();
        let pending_data = {
            let mut st = self.state.lock().await;
            st.closed.remove(&call);
            let pending = st.pending.remove(&call);
            if !st.dead {
                st.senders.insert(call, tx);
            }
            pending
        };
        if let Some(msgs) = pending_data {
            for msg in msgs {
                let _ = flush_tx.send(msg).await;
            }
        }
        let rx_arc = Arc::new(Mutex::new(rx));
        self.call_rx.lock().await.insert(call, Arc::clone(&rx_arc));
        rx_arc
    }
}

/// Background loop: read frames and route collective payloads by call id.
async fn recv_loop(
    peer: NodeId,
    mut reader: OwnedReadHalf,
    state: Arc<Mutex<RecvState>>,
    max_frame_bytes: usize,
) {
    loop {
        let msg = match read_message(&mut reader, max_frame_bytes).await {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(peer, "edge recv loop ended: {e}");
                // Close every per-call channel so waiting receivers see
                // the edge failure instead of blocking forever.
                let mut st = state.lock().await;
                st.dead = true;
                st.senders.clear();
                return;
            }
        };

        let Some(call) = msg.call() else {
            tracing::warn!(peer, kind = msg.kind_name(), "unexpected message on edge link");
            continue;
        };

        // Clone the sender outside the lock so it is not held across the
        // channel send await.
        let tx = {
            let mut st = state.lock().await;
            if st.closed.contains(&call) {
                tracing::debug!(peer, call, "dropping message for released call");
                continue;
            }
            match st.senders.get(&call) {
                Some(tx) => Some(tx.clone()),
                None => {
                    st.pending.entry(call).or_default().push(msg);
                    continue;
                }
            }
        };
        if let Some(tx) = tx {
            if tx.send(msg).await.is_err() {
                // Receiver side went away; stop routing this call.
                state.lock().await.senders.remove(&call);
            }
        }
    }
}
