mod link;

pub(crate) use link::Link;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::error::{ArborError, Result};
use crate::protocol::codec::{read_message, write_message};
use crate::protocol::TreeMessage;
use crate::types::{NodeId, PROTOCOL_VERSION};

/// Dial a peer's edge listener and complete the `Hello` handshake.
///
/// The dialer always speaks first, so the acceptor can identify which
/// expected peer the connection belongs to.
pub(crate) async fn dial_edge(
    addr: &str,
    self_id: NodeId,
    peer: NodeId,
    connect_timeout: Duration,
    max_frame_bytes: usize,
) -> Result<Arc<Link>> {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(ArborError::connection(peer, format!("dial {addr}: {e}")));
        }
        Err(_) => {
            return Err(ArborError::connection(
                peer,
                format!("dial {addr}: timed out after {}s", connect_timeout.as_secs()),
            ));
        }
    };
    stream
        .set_nodelay(true)
        .map_err(|e| ArborError::connection(peer, format!("set_nodelay: {e}")))?;

    let mut stream = stream;
    let hello = TreeMessage::Hello {
        protocol_version: PROTOCOL_VERSION,
        node: self_id,
    };
    write_message(&mut stream, &hello)
        .await
        .map_err(|e| ArborError::connection(peer, format!("send hello: {e}")))?;

    Ok(Link::spawn(peer, stream, max_frame_bytes))
}

/// Accept one inbound edge connection and read its `Hello`.
///
/// Returns the dialing peer's id together with the live link. The caller
/// validates the peer against its expected set.
pub(crate) async fn accept_edge(
    listener: &TcpListener,
    max_frame_bytes: usize,
) -> Result<(NodeId, TcpStream)> {
    let (stream, remote) = listener.accept().await?;
    stream.set_nodelay(true)?;

    let mut stream = stream;
    match read_message(&mut stream, max_frame_bytes).await? {
        TreeMessage::Hello {
            protocol_version,
            node,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ArborError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: protocol_version,
                });
            }
            tracing::debug!(node, %remote, "accepted edge connection");
            Ok((node, stream))
        }
        other => Err(ArborError::protocol(format!(
            "expected hello on new edge connection, got {}",
            other.kind_name()
        ))),
    }
}
