//! Overlay formation.
//!
//! A lightweight coordinator assigns node ids in join order, gathers each
//! node's listener addresses, and hands every participant the same
//! ordered id list and peer table. Nodes rebuild the identical tree
//! locally and wire themselves up; the coordinator is not involved in any
//! collective traffic afterwards.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::comm::{Communicator, PeerInfo};
use crate::config::ArborConfig;
use crate::error::{ArborError, Result};
use crate::protocol::codec::{read_message, write_message};
use crate::protocol::TreeMessage;
use crate::topology::{build_tree, Tree};
use crate::types::{NodeId, PROTOCOL_VERSION};

/// The formation rendezvous point.
///
/// Nodes dial it, get an id assigned in join order, register their
/// addresses, and receive the overlay. Consumed by [`Coordinator::form_overlay`].
#[derive(Debug)]
pub struct Coordinator {
    listener: TcpListener,
    world_size: u32,
    config: ArborConfig,
}

impl Coordinator {
    pub async fn bind(addr: &str, world_size: u32, config: ArborConfig) -> Result<Self> {
        if world_size == 0 {
            return Err(ArborError::config("world size must be at least 1"));
        }
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(addr = %listener.local_addr()?, world_size, "coordinator listening");
        Ok(Self {
            listener,
            world_size,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run both formation rounds and publish the overlay.
    ///
    /// Round 1 assigns ids `0..world_size` in join order; the node
    /// assigned id 0 becomes the root. Round 2 collects every node's
    /// listener addresses, then sends each node the identical overlay.
    /// Fails with a formation timeout if the world does not fill up in
    /// time.
    pub async fn form_overlay(self) -> Result<Tree> {
        let expected = self.world_size;
        let deadline = tokio::time::Instant::now() + self.config.formation_timeout;

        // Round 1: assign ids in join order.
        let mut streams: Vec<TcpStream> = Vec::with_capacity(expected as usize);
        for node in 0..expected {
            let (mut stream, remote) =
                tokio::time::timeout_at(deadline, self.listener.accept())
                    .await
                    .map_err(|_| ArborError::FormationTimeout {
                        joined: node,
                        expected,
                    })??;
            stream.set_nodelay(true)?;

            match timed_read(deadline, &mut stream, &self.config, node, expected).await? {
                TreeMessage::Join { protocol_version } => {
                    if protocol_version != PROTOCOL_VERSION {
                        return Err(ArborError::VersionMismatch {
                            local: PROTOCOL_VERSION,
                            remote: protocol_version,
                        });
                    }
                }
                other => {
                    return Err(ArborError::protocol(format!(
                        "expected join from {remote}, got {}",
                        other.kind_name()
                    )));
                }
            }

            write_message(
                &mut stream,
                &TreeMessage::Assign {
                    node,
                    world_size: expected,
                },
            )
            .await?;
            tracing::debug!(node, %remote, "assigned id");
            streams.push(stream);
        }

        // Round 2: gather addresses.
        let mut peers: Vec<(NodeId, String)> = Vec::with_capacity(expected as usize);
        let mut root_pub_addr: Option<String> = None;
        for (i, stream) in streams.iter_mut().enumerate() {
            match timed_read(deadline, stream, &self.config, i as u32, expected).await? {
                TreeMessage::Register {
                    node,
                    addr,
                    pub_addr,
                } => {
                    if node != i as u32 {
                        return Err(ArborError::protocol(format!(
                            "register from node {node} on node {i}'s connection"
                        )));
                    }
                    if node == 0 {
                        root_pub_addr = pub_addr;
                    }
                    peers.push((node, addr));
                }
                other => {
                    return Err(ArborError::protocol(format!(
                        "expected register, got {}",
                        other.kind_name()
                    )));
                }
            }
        }
        let root_pub_addr = root_pub_addr
            .ok_or_else(|| ArborError::protocol("root registered without a publish address"))?;

        let ids: Vec<NodeId> = (0..expected).collect();
        let tree = build_tree(&ids)?;
        let overlay = TreeMessage::Overlay {
            ids,
            peers,
            root: 0,
            root_pub_addr,
        };
        for stream in streams.iter_mut() {
            write_message(stream, &overlay).await?;
        }

        tracing::debug!(world = expected, "overlay published");
        Ok(tree)
    }
}

async fn timed_read(
    deadline: tokio::time::Instant,
    stream: &mut TcpStream,
    config: &ArborConfig,
    joined: u32,
    expected: u32,
) -> Result<TreeMessage> {
    tokio::time::timeout_at(deadline, read_message(stream, config.max_frame_bytes))
        .await
        .map_err(|_| ArborError::FormationTimeout { joined, expected })?
}

/// Join an overlay through its coordinator and return a fully connected
/// communicator.
pub async fn join(coordinator_addr: &str, config: ArborConfig) -> Result<Communicator> {
    let connect = TcpStream::connect(coordinator_addr);
    let mut stream = match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(ArborError::config(format!(
                "cannot reach coordinator at {coordinator_addr}: {e}"
            )));
        }
        Err(_) => {
            return Err(ArborError::config(format!(
                "coordinator at {coordinator_addr} did not answer in time"
            )));
        }
    };
    stream.set_nodelay(true)?;

    write_message(
        &mut stream,
        &TreeMessage::Join {
            protocol_version: PROTOCOL_VERSION,
        },
    )
    .await?;

    let (node, world_size) = match read_message(&mut stream, config.max_frame_bytes).await? {
        TreeMessage::Assign { node, world_size } => (node, world_size),
        other => {
            return Err(ArborError::protocol(format!(
                "expected assign, got {}",
                other.kind_name()
            )));
        }
    };
    tracing::debug!(node, world_size, "joined overlay");

    // Id 0 is the root by construction.
    let comm = Communicator::new(node, node == 0, config.clone()).await?;
    let info = comm.info();
    write_message(
        &mut stream,
        &TreeMessage::Register {
            node,
            addr: info.addr,
            pub_addr: comm.pub_addr(),
        },
    )
    .await?;

    let (ids, peers, root, root_pub_addr) =
        match read_message(&mut stream, config.max_frame_bytes).await? {
            TreeMessage::Overlay {
                ids,
                peers,
                root,
                root_pub_addr,
            } => (ids, peers, root, root_pub_addr),
            other => {
                return Err(ArborError::protocol(format!(
                    "expected overlay, got {}",
                    other.kind_name()
                )));
            }
        };

    let tree = build_tree(&ids)?;
    let peer_map: BTreeMap<NodeId, PeerInfo> = peers
        .into_iter()
        .map(|(node, addr)| (node, PeerInfo { node, addr }))
        .collect();
    comm.connect(&peer_map, &tree, &root_pub_addr, root).await?;
    Ok(comm)
}

/// Form a world of communicators inside one process, for examples and
/// tests. Returned in id order.
pub async fn bootstrap_local(world_size: u32, config: ArborConfig) -> Result<Vec<Communicator>> {
    let coordinator = Coordinator::bind("127.0.0.1:0", world_size, config.clone()).await?;
    let addr = coordinator.local_addr()?.to_string();

    let form = tokio::spawn(coordinator.form_overlay());
    let joins: Vec<_> = (0..world_size)
        .map(|_| {
            let addr = addr.clone();
            let config = config.clone();
            tokio::spawn(async move { join(&addr, config).await })
        })
        .collect();

    form.await
        .map_err(|e| ArborError::protocol(format!("coordinator task panicked: {e}")))??;

    let mut comms = Vec::with_capacity(world_size as usize);
    for task in joins {
        let comm = task
            .await
            .map_err(|e| ArborError::protocol(format!("join task panicked: {e}")))??;
        comms.push(comm);
    }
    comms.sort_by_key(|c| c.id());
    Ok(comms)
}
