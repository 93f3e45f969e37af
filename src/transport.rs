//! Upstream query transport.
//!
//! Sends a single DNS query to a single upstream server over UDP and waits,
//! bounded by a timeout, for a matching reply. Retry policy lives in the
//! resolution engine, not here.

use std::net::SocketAddr;
use std::time::Duration;

use log::trace;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use crate::config::MAX_PACKET_SIZE;
use crate::dns::{encode_query, parse_reply, ParsedReply, Question};

/// Outcome of one upstream query attempt.
#[derive(Debug)]
pub enum QueryOutcome {
    /// A reply with a matching transaction ID arrived in time.
    Reply(ParsedReply),

    /// No matching reply before the deadline.
    TimedOut,

    /// The datagram could not be sent or received at the socket level.
    Unreachable,

    /// A datagram arrived from the server but did not parse as a DNS reply.
    Malformed,
}

/// Send one query to `server` and wait up to `wait` for the reply.
///
/// Replies are matched by transaction ID; datagrams from other sources or
/// with a different ID are ignored until the deadline passes.
pub async fn query(question: &Question, server: SocketAddr, wait: Duration) -> QueryOutcome {
    let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(_) => return QueryOutcome::Unreachable,
    };

    let id: u16 = rand::random();
    let packet = encode_query(id, question);
    if socket.send_to(&packet, server).await.is_err() {
        return QueryOutcome::Unreachable;
    }

    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return QueryOutcome::TimedOut;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => return QueryOutcome::TimedOut,
            Ok(Err(_)) => return QueryOutcome::Unreachable,
            Ok(Ok((len, from))) => {
                if from != server {
                    trace!("Ignoring datagram from unexpected source {}", from);
                    continue;
                }
                match parse_reply(&buf[..len], server) {
                    Ok(reply) if reply.id == id => return QueryOutcome::Reply(reply),
                    Ok(reply) => {
                        trace!("Ignoring reply with mismatched id {:#06x}", reply.id);
                        continue;
                    }
                    Err(_) => return QueryOutcome::Malformed,
                }
            }
        }
    }
}
