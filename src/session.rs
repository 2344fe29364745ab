//! Per-connection state machine and bidirectional pipe.
//!
//! One `tokio::spawn`ed task per accepted connection runs [`run_session`]
//! start to finish; there is no separate state-machine object, just a single
//! linear function per connection.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;

use crate::chat::ChatMessage;
use crate::codec::{
    Disconnect, Handshake, Initial, LoginStart, NextState, PlayersInfo, StatusRequest,
    StatusResponse, VersionInfo,
};
use crate::conn::{Conn, DisconnectGuard, IO_TIMEOUT};
use crate::events::{
    EventBus, LoginRequestEvent, NetworkEvent, PingRequestEvent, PostAcceptEvent,
    PreRoutingEvent, PreStatusResponseEvent, StartProxyEvent, default_reject_message,
};
use crate::upstream::UpstreamRegistry;

/// Runs one client connection end to end: `PostAccept`, handshake, routing,
/// the ping or login branch, and (on a successful login) the bidirectional
/// pipe. Always leaves `conn` closed on return.
pub async fn run_session(
    mut conn: Conn,
    events: Arc<EventBus>,
    registry: Arc<RwLock<UpstreamRegistry>>,
) {
    let base = NetworkEvent {
        remote_addr: conn.peer_addr(),
        conn_id: conn.id(),
    };

    let mut post_accept = PostAcceptEvent {
        base: base.clone(),
        reject: Default::default(),
    };
    events.post_accept.dispatch(&mut post_accept);
    if post_accept.reject.rejected() {
        conn.log_debug("rejected at post-accept");
        conn.close().await;
        return;
    }

    let initial = match conn.read_initial().await {
        Ok(initial) => initial,
        Err(e) => {
            conn.log_debug(&format!("closed before a framed packet arrived: {e}"));
            conn.close().await;
            return;
        }
    };
    let raw = match initial {
        Initial::OldClient(first_byte) => {
            // Pre-1.7 clients are detected and refused; no reply is sent back.
            conn.log_debug(&format!("legacy client byte {first_byte:#x}, closing"));
            conn.close().await;
            return;
        }
        Initial::Packet(raw) => raw,
    };

    let handshake = match Handshake::decode(&raw) {
        Ok(h) => h,
        Err(e) => {
            conn.log_warn(&format!("malformed handshake: {e}"));
            conn.close().await;
            return;
        }
    };

    let mut pre_routing = PreRoutingEvent {
        base: base.clone(),
        packet: handshake.clone(),
        reject: Default::default(),
    };
    events.pre_routing.dispatch(&mut pre_routing);
    if pre_routing.reject.rejected() {
        let message = default_reject_message(pre_routing.reject.reason());
        reject_session(&mut conn, handshake.next_state, message, false).await;
        return;
    }

    let upstream = {
        let reg = registry.read().await;
        match reg.get(&handshake.server_addr) {
            Ok(entry) => Arc::new(entry.clone()),
            Err(message) => {
                let message = message.clone();
                drop(reg);
                reject_session(&mut conn, handshake.next_state, message, false).await;
                return;
            }
        }
    };

    match handshake.next_state {
        NextState::Status => run_ping(conn, &events, &base, handshake, upstream).await,
        NextState::Login => run_login(conn, &events, &base, handshake, upstream).await,
    }
}

/// Sends the reject response appropriate to `next_state` and closes `conn`.
/// For a ping, the status-request is read off first unless
/// `status_request_consumed` says the caller already did so; the subsequent
/// status-ping is still read and echoed back.
async fn reject_session(
    conn: &mut Conn,
    next_state: NextState,
    message: ChatMessage,
    status_request_consumed: bool,
) {
    match next_state {
        NextState::Status => {
            if !status_request_consumed {
                if let Err(e) = conn.read_packet_raw().await {
                    conn.log_debug(&format!("closed before status-request: {e}"));
                    conn.close().await;
                    return;
                }
            }
            let response = StatusResponse {
                version: VersionInfo {
                    name: "MineGate".to_owned(),
                    protocol: 0,
                },
                players: PlayersInfo {
                    max: 0,
                    online: 0,
                    sample: Vec::new(),
                },
                description: message,
                favicon: None,
            };
            match response.encode() {
                Ok(packet) => {
                    if let Err(e) = conn.write_packet(&packet).await {
                        conn.log_debug(&format!("failed to send reject status-response: {e}"));
                        conn.close().await;
                        return;
                    }
                }
                Err(e) => conn.log_warn(&format!("failed to encode reject status-response: {e}")),
            }
            match conn.read_packet_raw().await {
                Ok(raw) => {
                    let _ = conn.write_packet(&raw).await;
                }
                Err(e) => conn.log_debug(&format!("closed before status-ping: {e}")),
            }
            conn.close().await;
        }
        NextState::Login => {
            match Disconnect(message).encode() {
                Ok(packet) => {
                    let _ = conn.write_packet(&packet).await;
                }
                Err(e) => conn.log_warn(&format!("failed to encode reject disconnect: {e}")),
            }
            conn.close().await;
        }
    }
}

async fn run_ping(
    mut conn: Conn,
    events: &Arc<EventBus>,
    base: &NetworkEvent,
    handshake: Handshake,
    upstream: Arc<crate::upstream::UpstreamEntry>,
) {
    let status_request_raw = match conn.read_packet_raw().await {
        Ok(raw) => raw,
        Err(e) => {
            conn.log_debug(&format!("closed before status-request: {e}"));
            conn.close().await;
            return;
        }
    };
    if let Err(e) = StatusRequest::decode(&status_request_raw) {
        conn.log_warn(&format!("malformed status-request: {e}"));
        conn.close().await;
        return;
    }

    let mut ping_event = PingRequestEvent {
        base: base.clone(),
        packet: handshake.clone(),
        upstream: Arc::clone(&upstream),
        reject: Default::default(),
    };
    events.ping_request.dispatch(&mut ping_event);
    if ping_event.reject.rejected() {
        let message = default_reject_message(ping_event.reject.reason());
        reject_session(&mut conn, NextState::Status, message, true).await;
        return;
    }

    let upstream_stream = match connect_upstream(&conn, &upstream.server).await {
        Some(stream) => stream,
        None => {
            let message = upstream.error_msg.clone();
            reject_session(&mut conn, NextState::Status, message, true).await;
            return;
        }
    };
    let mut upstream_conn = Conn::new_upstream(upstream_stream, conn.id(), conn.peer_addr());

    // Replay the handshake and status-request the client already sent us,
    // verbatim, to the upstream server.
    if upstream_conn.write_packet(&handshake.encode()).await.is_err()
        || upstream_conn
            .write_packet(&status_request_raw)
            .await
            .is_err()
    {
        conn.log_debug("upstream closed before accepting the status-request");
        conn.close().await;
        upstream_conn.close().await;
        return;
    }

    let status_raw = match upstream_conn.read_packet_raw().await {
        Ok(raw) => raw,
        Err(e) => {
            conn.log_warn(&format!("upstream status-response read failed: {e}"));
            conn.close().await;
            upstream_conn.close().await;
            return;
        }
    };
    let mut status_response = match StatusResponse::decode(&status_raw) {
        Ok(resp) => resp,
        Err(e) => {
            conn.log_warn(&format!("malformed upstream status-response: {e}"));
            conn.close().await;
            upstream_conn.close().await;
            return;
        }
    };
    if status_response.favicon.is_none() {
        status_response.favicon = upstream.favicon.clone();
    }

    let mut pre_status = PreStatusResponseEvent {
        base: base.clone(),
        packet: status_response,
        upstream: Arc::clone(&upstream),
    };
    events.pre_status_response.dispatch(&mut pre_status);

    upstream_conn.close().await;

    let response_packet = match pre_status.packet.encode() {
        Ok(packet) => packet,
        Err(e) => {
            conn.log_warn(&format!("failed to re-encode status-response: {e}"));
            conn.close().await;
            return;
        }
    };
    if conn.write_packet(&response_packet).await.is_err() {
        conn.close().await;
        return;
    }

    match conn.read_packet_raw().await {
        Ok(ping_raw) => {
            let _ = conn.write_packet(&ping_raw).await;
        }
        Err(e) => conn.log_debug(&format!("client closed before status-ping: {e}")),
    }
    conn.close().await;
}

async fn run_login(
    mut conn: Conn,
    events: &Arc<EventBus>,
    base: &NetworkEvent,
    handshake: Handshake,
    upstream: Arc<crate::upstream::UpstreamEntry>,
) {
    let login_raw = match conn.read_packet_raw().await {
        Ok(raw) => raw,
        Err(e) => {
            conn.log_debug(&format!("closed before login-start: {e}"));
            conn.close().await;
            return;
        }
    };
    let login_start = match LoginStart::decode(&login_raw) {
        Ok(packet) => packet,
        Err(e) => {
            conn.log_warn(&format!("malformed login-start: {e}"));
            conn.close().await;
            return;
        }
    };

    let mut login_event = LoginRequestEvent {
        base: base.clone(),
        init_packet: handshake.clone(),
        login_packet: login_start.clone(),
        upstream: Arc::clone(&upstream),
        reject: Default::default(),
    };
    events.login_request.dispatch(&mut login_event);
    if login_event.reject.rejected() {
        let message = default_reject_message(login_event.reject.reason());
        reject_session(&mut conn, NextState::Login, message, false).await;
        return;
    }

    let upstream_stream = match connect_upstream(&conn, &upstream.server).await {
        Some(stream) => stream,
        None => {
            let message = upstream.error_msg.clone();
            reject_session(&mut conn, NextState::Login, message, false).await;
            return;
        }
    };
    let mut upstream_conn = Conn::new_upstream(upstream_stream, conn.id(), conn.peer_addr());

    if upstream_conn.write_packet(&handshake.encode()).await.is_err()
        || upstream_conn
            .write_packet(&login_start.encode())
            .await
            .is_err()
    {
        conn.log_warn("upstream closed before accepting login-start");
        conn.close().await;
        upstream_conn.close().await;
        return;
    }

    let mut start_event = StartProxyEvent {
        base: base.clone(),
        init_packet: handshake,
        login_packet: login_start,
        upstream: Arc::clone(&upstream),
    };
    events.start_proxy.dispatch(&mut start_event);

    conn.log_info(&format!("piping to {}", upstream.server));
    pipe(conn, upstream_conn).await;
}

async fn connect_upstream(conn: &Conn, server: &str) -> Option<TcpStream> {
    let connect = TcpStream::connect(server);
    let stream = match tokio::time::timeout(IO_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            conn.log_warn(&format!("failed to dial upstream {server}: {e}"));
            return None;
        }
        Err(_) => {
            conn.log_warn(&format!("timed out dialing upstream {server}"));
            return None;
        }
    };
    if let Err(e) = stream.set_nodelay(false) {
        conn.log_warn(&format!("failed to set upstream nodelay: {e}"));
    }
    if let Err(e) = conn.set_nodelay(false) {
        conn.log_warn(&format!("failed to set client nodelay: {e}"));
    }
    Some(stream)
}

/// Splits both sockets and runs two independent copy loops until either
/// side closes, then fires the client's `DisconnectEvent` exactly once.
async fn pipe(client: Conn, upstream: Conn) {
    let (client_read, client_write, guard) = client.into_split();
    let (upstream_read, upstream_write, _upstream_guard) = upstream.into_split();

    let to_upstream = tokio::spawn(pipe_loop(client_read, upstream_write, guard.clone()));
    let to_client = tokio::spawn(pipe_loop(upstream_read, client_write, guard));

    let _ = tokio::join!(to_upstream, to_client);
}

/// One direction of the bidirectional pipe: read with a refreshed 15s
/// deadline, write what was read with its own deadline, repeat until EOF,
/// timeout, or I/O error.
async fn pipe_loop<R, W>(mut reader: R, mut writer: W, guard: DisconnectGuard)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        let read = match tokio::time::timeout(IO_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break,
        };
        if tokio::time::timeout(IO_TIMEOUT, writer.write_all(&buf[..read]))
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
    guard.fire();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::write_raw;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pipe_loop_forwards_bytes_until_eof() {
        let (mut source, reader_end) = duplex(64);
        let (output_writer, mut output_reader) = duplex(64);

        source.write_all(b"hello").await.unwrap();
        drop(source);

        let guard = DisconnectGuard::for_test();
        pipe_loop(reader_end, output_writer, guard).await;

        let mut out = Vec::new();
        output_reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn reject_response_carries_reason_as_description() {
        let msg = default_reject_message("no thanks");
        assert_eq!(msg.text, "no thanks");
        let response = StatusResponse {
            version: VersionInfo {
                name: "MineGate".into(),
                protocol: 0,
            },
            players: PlayersInfo {
                max: 0,
                online: 0,
                sample: Vec::new(),
            },
            description: msg,
            favicon: None,
        };
        let packet = response.encode().unwrap();
        let bytes = write_raw(&packet);
        assert!(!bytes.is_empty());
    }
}
