//! The per-node communicator: edge fabric setup and the collective API.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::collective::{broadcast_down, chunk_counts, combine_up, AbortTable, CallCtx};
use crate::config::ArborConfig;
use crate::error::{ArborError, Result};
use crate::op::{decode_slice, encode_slice, Element, ElementOp};
use crate::protocol::codec::{read_message, write_message};
use crate::protocol::TreeMessage;
use crate::topology::{Tree, TreeNode};
use crate::transport::{accept_edge, dial_edge, Link};
use crate::types::{NodeId, PROTOCOL_VERSION};

/// Address card for one node, exchanged during overlay formation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub node: NodeId,
    /// Edge listener address, `host:port`.
    pub addr: String,
}

/// The live connection fabric built by `connect`.
struct Fabric {
    node: TreeNode,
    world: usize,
    parent: Option<Arc<Link>>,
    /// In the node's fixed child order.
    children: Vec<Arc<Link>>,
    /// Root only: write halves of every subscriber's publish connection.
    subscribers: Mutex<Vec<(NodeId, OwnedWriteHalf)>>,
    /// Non-root only: the task draining the publish subscription.
    sub_task: Option<JoinHandle<()>>,
}

impl Fabric {
    async fn release_call(&self, call: u64) {
        if let Some(parent) = &self.parent {
            parent.release_call(call).await;
        }
        for child in &self.children {
            child.release_call(call).await;
        }
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        if let Some(task) = &self.sub_task {
            task.abort();
        }
    }
}

/// One participant in the tree overlay.
///
/// A communicator binds its listeners at construction so peers can dial
/// as soon as its address is shared, is wired into the tree once via
/// [`Communicator::connect`], and then serves any number of sequential
/// collective calls. One collective at a time per communicator.
pub struct Communicator {
    id: NodeId,
    is_root: bool,
    config: ArborConfig,
    addr: SocketAddr,
    pub_addr: Option<SocketAddr>,
    listener: StdMutex<Option<TcpListener>>,
    pub_listener: StdMutex<Option<TcpListener>>,
    fabric: RwLock<Option<Arc<Fabric>>>,
    /// Id the next collective call will use. Advanced locally on each
    /// call and realigned by root resets, so nodes that sat out a failed
    /// call agree with everyone else on the next id.
    next_call: Arc<AtomicU64>,
    busy: Mutex<()>,
    abort: Arc<AbortTable>,
    setup: Mutex<()>,
}

impl Communicator {
    /// Create a communicator and bind its listeners.
    ///
    /// The edge listener accepts child connections; the root additionally
    /// binds the publish listener used for out-of-band resets.
    pub async fn new(id: NodeId, is_root: bool, config: ArborConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_host.as_str(), 0)).await?;
        let addr = listener.local_addr()?;

        let (pub_listener, pub_addr) = if is_root {
            let l = TcpListener::bind((config.bind_host.as_str(), 0)).await?;
            let a = l.local_addr()?;
            (Some(l), Some(a))
        } else {
            (None, None)
        };

        tracing::debug!(node = id, %addr, is_root, "communicator listening");

        Ok(Self {
            id,
            is_root,
            config,
            addr,
            pub_addr,
            listener: StdMutex::new(Some(listener)),
            pub_listener: StdMutex::new(pub_listener),
            fabric: RwLock::new(None),
            next_call: Arc::new(AtomicU64::new(0)),
            busy: Mutex::new(()),
            abort: Arc::new(AbortTable::new()),
            setup: Mutex::new(()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// This node's address card for the peer table.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            node: self.id,
            addr: self.addr.to_string(),
        }
    }

    /// Publish endpoint address; `Some` only at the root.
    pub fn pub_addr(&self) -> Option<String> {
        self.pub_addr.map(|a| a.to_string())
    }

    /// Number of participants, once connected.
    pub fn world_size(&self) -> Option<usize> {
        self.fabric_opt().map(|f| f.world)
    }

    /// Id the next collective call will use.
    pub fn next_call_id(&self) -> u64 {
        self.next_call.load(Ordering::SeqCst)
    }

    /// Establish the tree fabric: dial the parent, accept the children,
    /// and hook up the root's publish endpoint.
    ///
    /// All edges are established concurrently; the dial side of every
    /// edge is the child, so there are no dial cycles to deadlock on.
    /// Setup is all-or-nothing: any failed edge fails the whole call.
    /// Calling `connect` again after success is a no-op.
    pub async fn connect(
        &self,
        peers: &BTreeMap<NodeId, PeerInfo>,
        tree: &Tree,
        root_pub_addr: &str,
        root: NodeId,
    ) -> Result<()> {
        let _setup = self.setup.lock().await;
        if self.fabric_opt().is_some() {
            return Ok(());
        }

        let node = tree
            .node(self.id)
            .ok_or_else(|| ArborError::config(format!("node {} is not in the tree", self.id)))?
            .clone();
        if tree.root().id != root {
            return Err(ArborError::config(format!(
                "tree root {} does not match declared root {root}",
                tree.root().id
            )));
        }
        if (self.id == root) != self.is_root {
            return Err(ArborError::config(format!(
                "node {} root flag disagrees with tree root {root}",
                self.id
            )));
        }
        if peers.len() != tree.len() {
            return Err(ArborError::config(format!(
                "peer table has {} entries for a tree of {}",
                peers.len(),
                tree.len()
            )));
        }
        for n in tree.iter() {
            if !peers.contains_key(&n.id) {
                return Err(ArborError::config(format!("no address for node {}", n.id)));
            }
        }

        let world = tree.len();
        let sub_ids: Vec<NodeId> = tree.iter().map(|n| n.id).filter(|&id| id != root).collect();

        let parent_fut = self.dial_parent(&node, peers);
        let children_fut = self.accept_children(&node);
        let pub_fut = self.setup_publish(&sub_ids, root_pub_addr, root);

        let (parent, children, pub_side) = tokio::join!(parent_fut, children_fut, pub_fut);
        let (parent, children, pub_side) = (parent?, children?, pub_side?);

        let (subscribers, sub_task) = match pub_side {
            PubSide::Root(subs) => (subs, None),
            PubSide::Subscriber(task) => (Vec::new(), Some(task)),
        };

        let fabric = Arc::new(Fabric {
            node,
            world,
            parent,
            children,
            subscribers: Mutex::new(subscribers),
            sub_task,
        });
        *self.fabric.write().expect("fabric lock poisoned") = Some(fabric);

        tracing::debug!(node = self.id, world, "tree fabric established");
        Ok(())
    }

    /// Combine every node's value at the root.
    ///
    /// Returns `Ok(Some(result))` at the root and `Ok(None)` everywhere
    /// else. A non-root node does hold its subtree's combined partial
    /// when its part of the call finishes, but that partial is not the
    /// reduction of anything meaningful on its own, so it is deliberately
    /// not exposed; use [`Communicator::allreduce`] when every node needs
    /// the result. All participants must call with the same op, element
    /// type, length, and `flat` choice.
    pub async fn reduce<T: Element>(
        &self,
        op: &dyn ElementOp,
        value: &[T],
        flat: bool,
    ) -> Result<Option<Vec<T>>> {
        let _busy = self.busy_guard()?;
        let fabric = self.fabric()?;
        if value.is_empty() {
            return Err(ArborError::config("collective value must not be empty"));
        }
        if fabric.world == 1 {
            return Ok(Some(value.to_vec()));
        }

        let call = self.next_call.fetch_add(1, Ordering::SeqCst);
        let ctx = self.call_ctx(call, T::DTYPE, value.len(), flat);
        let own = encode_slice(value);

        tracing::debug!(node = self.id, call, elems = value.len(), flat, "reduce");
        let res = combine_up(
            &ctx,
            op,
            &own,
            fabric.parent.as_ref(),
            &fabric.children,
            &self.abort,
            "reduce",
        )
        .await;
        fabric.release_call(call).await;

        let chunks = res?;
        if fabric.node.is_root {
            Ok(Some(decode_slice(&chunks.concat())?))
        } else {
            Ok(None)
        }
    }

    /// Combine every node's value and deliver the result everywhere.
    pub async fn allreduce<T: Element>(
        &self,
        op: &dyn ElementOp,
        value: &[T],
        flat: bool,
    ) -> Result<Vec<T>> {
        let _busy = self.busy_guard()?;
        let fabric = self.fabric()?;
        if value.is_empty() {
            return Err(ArborError::config("collective value must not be empty"));
        }
        if fabric.world == 1 {
            return Ok(value.to_vec());
        }

        let call = self.next_call.fetch_add(1, Ordering::SeqCst);
        let ctx = self.call_ctx(call, T::DTYPE, value.len(), flat);
        let own = encode_slice(value);

        tracing::debug!(node = self.id, call, elems = value.len(), flat, "allreduce");
        let res = async {
            let combined = combine_up(
                &ctx,
                op,
                &own,
                fabric.parent.as_ref(),
                &fabric.children,
                &self.abort,
                "allreduce",
            )
            .await?;
            broadcast_down(
                &ctx,
                combined,
                fabric.parent.as_ref(),
                &fabric.children,
                &self.abort,
            )
            .await
        }
        .await;
        fabric.release_call(call).await;

        decode_slice(&res?)
    }

    /// Root only: abandon a failed call, releasing every node still
    /// blocked on it and realigning call ids across the tree.
    ///
    /// The reset is published best-effort over the out-of-band publish
    /// connections; a subscriber whose connection already died is logged
    /// and skipped.
    pub async fn abandon(&self, call: u64) -> Result<()> {
        if !self.is_root {
            return Err(ArborError::NotRoot { node: self.id });
        }
        let fabric = self.fabric()?;

        self.next_call.fetch_max(call + 1, Ordering::SeqCst);
        self.abort.insert(call);

        tracing::debug!(node = self.id, call, "publishing reset");
        let msg = TreeMessage::Reset { call };
        let mut subs = fabric.subscribers.lock().await;
        for (node, writer) in subs.iter_mut() {
            if let Err(e) = write_message(writer, &msg).await {
                tracing::warn!(node = *node, call, "failed to publish reset: {e}");
            }
        }
        Ok(())
    }

    fn busy_guard(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.busy
            .try_lock()
            .map_err(|_| ArborError::protocol("another collective call is in progress"))
    }

    fn call_ctx(&self, call: u64, dtype: crate::types::DataType, count: usize, flat: bool) -> CallCtx {
        let chunks = if flat {
            vec![count]
        } else {
            chunk_counts(count, self.config.chunk_elems)
        };
        CallCtx {
            call,
            dtype,
            chunks,
            timeout: self.config.collective_timeout,
        }
    }

    fn fabric_opt(&self) -> Option<Arc<Fabric>> {
        self.fabric.read().expect("fabric lock poisoned").clone()
    }

    fn fabric(&self) -> Result<Arc<Fabric>> {
        self.fabric_opt()
            .ok_or_else(|| ArborError::config("communicator is not connected"))
    }

    async fn dial_parent(
        &self,
        node: &TreeNode,
        peers: &BTreeMap<NodeId, PeerInfo>,
    ) -> Result<Option<Arc<Link>>> {
        let Some(pid) = node.parent else {
            return Ok(None);
        };
        let addr = &peers[&pid].addr;
        let link = dial_edge(
            addr,
            self.id,
            pid,
            self.config.connect_timeout,
            self.config.max_frame_bytes,
        )
        .await?;
        Ok(Some(link))
    }

    async fn accept_children(&self, node: &TreeNode) -> Result<Vec<Arc<Link>>> {
        if node.children.is_empty() {
            return Ok(Vec::new());
        }
        let listener = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take()
            .ok_or_else(|| ArborError::config("connect already attempted"))?;

        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        let mut links: BTreeMap<NodeId, Arc<Link>> = BTreeMap::new();
        while links.len() < node.children.len() {
            let accepted = tokio::time::timeout_at(
                deadline,
                accept_edge(&listener, self.config.max_frame_bytes),
            )
            .await;
            let (peer, stream) = match accepted {
                Ok(res) => res?,
                Err(_) => {
                    let missing = node
                        .children
                        .iter()
                        .find(|c| !links.contains_key(c))
                        .copied()
                        .unwrap_or(node.id);
                    return Err(ArborError::connection(
                        missing,
                        "timed out waiting for child edge",
                    ));
                }
            };
            if !node.children.contains(&peer) || links.contains_key(&peer) {
                return Err(ArborError::protocol(format!(
                    "unexpected edge connection from node {peer}"
                )));
            }
            links.insert(peer, Link::spawn(peer, stream, self.config.max_frame_bytes));
        }

        // Fixed child order drives the canonical combination order.
        Ok(node.children.iter().map(|c| Arc::clone(&links[c])).collect())
    }

    async fn setup_publish(
        &self,
        sub_ids: &[NodeId],
        root_pub_addr: &str,
        root: NodeId,
    ) -> Result<PubSide> {
        if self.is_root {
            if sub_ids.is_empty() {
                return Ok(PubSide::Root(Vec::new()));
            }
            let listener = self
                .pub_listener
                .lock()
                .expect("pub listener lock poisoned")
                .take()
                .ok_or_else(|| ArborError::config("connect already attempted"))?;

            let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
            let mut subs: Vec<(NodeId, OwnedWriteHalf)> = Vec::with_capacity(sub_ids.len());
            while subs.len() < sub_ids.len() {
                let accepted = tokio::time::timeout_at(
                    deadline,
                    accept_edge(&listener, self.config.max_frame_bytes),
                )
                .await;
                let accepted = match accepted {
                    Ok(res) => res,
                    Err(_) => {
                        let missing = sub_ids
                            .iter()
                            .find(|id| !subs.iter().any(|(n, _)| n == *id))
                            .copied()
                            .unwrap_or(root);
                        return Err(ArborError::connection(
                            missing,
                            "timed out waiting for publish subscription",
                        ));
                    }
                };
                let (peer, stream) = accepted?;
                if !sub_ids.contains(&peer) || subs.iter().any(|(n, _)| *n == peer) {
                    return Err(ArborError::protocol(format!(
                        "unexpected subscription from node {peer}"
                    )));
                }
                // Only the write half is kept; the root never reads from
                // subscribers after the hello.
                let (_read, write) = stream.into_split();
                subs.push((peer, write));
            }
            Ok(PubSide::Root(subs))
        } else {
            let connect = TcpStream::connect(root_pub_addr);
            let mut stream = match tokio::time::timeout(self.config.connect_timeout, connect).await
            {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    return Err(ArborError::connection(
                        root,
                        format!("subscribe {root_pub_addr}: {e}"),
                    ));
                }
                Err(_) => {
                    return Err(ArborError::connection(
                        root,
                        format!("subscribe {root_pub_addr}: timed out"),
                    ));
                }
            };
            stream.set_nodelay(true).map_err(ArborError::Io)?;
            write_message(
                &mut stream,
                &TreeMessage::Hello {
                    protocol_version: PROTOCOL_VERSION,
                    node: self.id,
                },
            )
            .await?;

            let abort = Arc::clone(&self.abort);
            let next_call = Arc::clone(&self.next_call);
            let max_frame = self.config.max_frame_bytes;
            let node = self.id;
            let task = tokio::spawn(async move {
                subscribe_loop(node, stream, abort, next_call, max_frame).await;
            });
            Ok(PubSide::Subscriber(task))
        }
    }
}

enum PubSide {
    Root(Vec<(NodeId, OwnedWriteHalf)>),
    Subscriber(JoinHandle<()>),
}

/// Drain the publish subscription, applying resets as they arrive.
async fn subscribe_loop(
    node: NodeId,
    mut stream: TcpStream,
    abort: Arc<AbortTable>,
    next_call: Arc<AtomicU64>,
    max_frame_bytes: usize,
) {
    loop {
        match read_message(&mut stream, max_frame_bytes).await {
            Ok(TreeMessage::Reset { call }) => {
                tracing::debug!(node, call, "reset received");
                // Realign before waking waiters so a retry after the
                // abandon sees the agreed next id.
                next_call.fetch_max(call + 1, Ordering::SeqCst);
                abort.insert(call);
            }
            Ok(other) => {
                tracing::warn!(node, kind = other.kind_name(), "unexpected publish message");
            }
            Err(e) => {
                tracing::debug!(node, "publish link closed: {e}");
                return;
            }
        }
    }
}
