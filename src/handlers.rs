//! Request handling for the resolver front end.
//!
//! This module provides the UDP listener: one concurrent task per incoming
//! datagram, so a slow resolution never delays other clients.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::{net::UdpSocket, task};

use crate::config::ResolverConfig;
use crate::dns::{build_notimp_response, build_reply, parse_query, HEADER_LEN, RCODE_NOERROR, RCODE_SERVFAIL};
use crate::errors::DnsError;
use crate::qlog::{QueryLog, QueryRecord};
use crate::resolver::{ResolutionResult, Resolver};

/// Run the UDP front end.
///
/// # Arguments
/// * `config` - The resolver configuration.
/// * `resolver` - The shared resolution engine.
/// * `qlog` - The durable per-query log.
///
/// # Returns
/// A `Result` that only resolves on a fatal socket error.
pub async fn run_udp_server(
    config: ResolverConfig,
    resolver: Arc<Resolver>,
    qlog: QueryLog,
) -> Result<(), DnsError> {
    let socket = UdpSocket::bind(config.bind_addr).await?;
    info!("UDP resolver listening on {}", config.bind_addr);
    serve(socket, config, resolver, qlog).await
}

/// Accept loop over an already-bound socket.
pub async fn serve(
    socket: UdpSocket,
    config: ResolverConfig,
    resolver: Arc<Resolver>,
    qlog: QueryLog,
) -> Result<(), DnsError> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; config.max_packet_size];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let packet = buf[..len].to_vec();
                let socket = Arc::clone(&socket);
                let resolver = Arc::clone(&resolver);
                let qlog = qlog.clone();
                task::spawn(async move {
                    if let Err(e) = handle_query(packet, src, socket, resolver, qlog).await {
                        warn!("Query handling error from {}: {}", src, e);
                    }
                });
            }
            Err(e) => error!("UDP receive error: {}", e),
        }
    }
}

/// Handle one client datagram.
///
/// Malformed input is dropped without a reply; a valid question is resolved
/// and always answered, with an answer section on success or SERVFAIL on
/// failure. Exactly one query-log record is emitted per valid question.
pub async fn handle_query(
    packet: Vec<u8>,
    src: SocketAddr,
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    qlog: QueryLog,
) -> Result<(), DnsError> {
    if packet.len() < HEADER_LEN {
        debug!("Dropping short datagram from {}", src);
        return Ok(());
    }

    let opcode = (packet[2] & 0x78) >> 3;
    if opcode != 0 {
        if let Some(response) = build_notimp_response(&packet) {
            socket.send_to(&response, src).await?;
        }
        return Ok(());
    }

    let query = match parse_query(&packet) {
        Ok(query) => query,
        Err(e) => {
            debug!("Dropping malformed query from {}: {}", src, e);
            return Ok(());
        }
    };

    info!("Query {} {} from {}", query.question.name, query.question.qtype, src);
    let resolution = resolver.resolve(query.question.clone()).await;

    let response = match &resolution.result {
        ResolutionResult::Answered(records) => {
            build_reply(query.id, &query.question, RCODE_NOERROR, true, records, &[], &[])
        }
        ResolutionResult::Failed(reason) => {
            info!("Resolution of {} failed: {}", query.question.name, reason);
            build_reply(query.id, &query.question, RCODE_SERVFAIL, false, &[], &[], &[])
        }
    };

    qlog.record(QueryRecord::from_resolution(src, &query.question, &resolution));
    socket.send_to(&response, src).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DnsCache;
    use crate::dns::{encode_query, parse_reply, parse_query as parse, Question, RecordData, RecordType, ResourceRecord};
    use crate::hints::RootHints;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    static LOG_SEQ: AtomicUsize = AtomicUsize::new(0);

    async fn spawn_answering_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                if let Ok(query) = parse(&buf[..len]) {
                    let answer = ResourceRecord {
                        name: query.question.name.clone(),
                        rtype: RecordType::A,
                        data: RecordData::A("192.0.2.33".parse().unwrap()),
                        ttl: 60,
                        origin: "0.0.0.0:0".parse().unwrap(),
                    };
                    let reply = build_reply(
                        query.id,
                        &query.question,
                        RCODE_NOERROR,
                        true,
                        &[answer],
                        &[],
                        &[],
                    );
                    let _ = socket.send_to(&reply, src).await;
                }
            }
        });
        addr
    }

    async fn start_front_end() -> (SocketAddr, String) {
        let upstream = spawn_answering_upstream().await;

        let config = ResolverConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            hop_limit: 8,
            retry_budget: 1,
            query_timeout: Duration::from_millis(500),
            upstream_port: upstream.port(),
            max_packet_size: 4096,
            query_log_path: String::new(),
            root_hints: vec![upstream],
        };

        let cache = Arc::new(DnsCache::new());
        let hints = Arc::new(RootHints::new(config.root_hints.clone()));
        let resolver = Arc::new(Resolver::new(&config, cache, hints));

        let log_path = std::env::temp_dir()
            .join(format!(
                "rootwalk-handlers-{}-{}.log",
                std::process::id(),
                LOG_SEQ.fetch_add(1, Ordering::SeqCst)
            ))
            .to_str()
            .unwrap()
            .to_string();
        let _ = tokio::fs::remove_file(&log_path).await;
        let qlog = QueryLog::open(&log_path).await.unwrap();

        let socket = UdpSocket::bind(config.bind_addr).await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(serve(socket, config, resolver, qlog));

        (addr, log_path)
    }

    #[tokio::test]
    async fn answers_a_client_query_and_logs_it() {
        let (server, log_path) = start_front_end().await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let question = Question { name: "frontend.example".into(), qtype: RecordType::A };
        client.send_to(&encode_query(0x4242, &question), server).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let reply = parse_reply(&buf[..len], server).unwrap();
        assert_eq!(reply.id, 0x4242);
        assert_eq!(reply.rcode, RCODE_NOERROR);
        assert!(reply.authoritative);
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].data, RecordData::A("192.0.2.33".parse().unwrap()));

        // One query-log record for the query.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["qname"], "frontend.example");
        assert_eq!(parsed["outcome"], "answered");

        let _ = tokio::fs::remove_file(&log_path).await;
    }

    #[tokio::test]
    async fn malformed_datagrams_get_no_reply() {
        let (server, log_path) = start_front_end().await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0xAB, 0xCD, 0xEF], server).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let got = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(got.is_err(), "expected silence for a malformed datagram");

        let _ = tokio::fs::remove_file(&log_path).await;
    }

    #[tokio::test]
    async fn unsupported_opcode_gets_notimp() {
        let (server, log_path) = start_front_end().await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let question = Question { name: "frontend.example".into(), qtype: RecordType::A };
        let mut packet = encode_query(0x7777, &question);
        packet[2] |= 0x10; // opcode 2 (status)
        client.send_to(&packet, server).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..2], &[0x77, 0x77]);
        assert_eq!(buf[3] & 0x0F, crate::dns::RCODE_NOTIMP);
        assert!(len >= HEADER_LEN);

        let _ = tokio::fs::remove_file(&log_path).await;
    }
}
