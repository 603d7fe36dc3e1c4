use rawtcp::packet::{self, PseudoHeader};
use rawtcp::{BlackHole, Config, Counter, Datagram, Error, Flags, Loopback, Segment, SeqNum, Stack, State};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn client_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
}

fn server_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
}

fn config() -> Config {
    Config {
        initial_rto: Duration::from_millis(200),
        min_rto: Duration::from_millis(200),
        linger: Duration::from_millis(100),
        ..Config::default()
    }
}

fn stacks(
    client_config: Config,
    server_config: Config,
) -> (Stack, Stack, Arc<Loopback>, Arc<Loopback>) {
    init();
    let (client_link, server_link) = Loopback::pair(client_addr(), server_addr());
    let client = Stack::new(client_addr(), client_link.clone(), client_config).unwrap();
    let server = Stack::new(server_addr(), server_link.clone(), server_config).unwrap();
    client_link.attach(&client).unwrap();
    server_link.attach(&server).unwrap();

    (client, server, client_link, server_link)
}

fn decode(datagram: &Datagram) -> Segment {
    packet::decode(
        &datagram.payload,
        &PseudoHeader::new(datagram.src, datagram.dst),
    )
    .unwrap()
}

#[tokio::test]
async fn stack_handshake() {
    let (client, server, _, _) = stacks(config(), config());
    let listener = server.listen(80, 0).unwrap();
    assert_eq!(listener.state(), State::Listen);
    assert_eq!(listener.local_addr(), SocketAddr::new(server_addr(), 80));

    let connection = client
        .connect(SocketAddr::new(server_addr(), 80))
        .await
        .unwrap();
    let accepted = listener.accept().await.unwrap();

    assert_eq!(connection.state(), State::Established);
    assert_eq!(accepted.state(), State::Established);
    assert!(connection.local_addr().port() >= 49152);
    assert_eq!(connection.peer_addr(), SocketAddr::new(server_addr(), 80));
    assert_eq!(accepted.peer_addr(), connection.local_addr());

    let (client_iss, client_irs) = connection.inspect(|tcb| (tcb.iss(), tcb.irs()));
    let (server_iss, server_irs) = accepted.inspect(|tcb| (tcb.iss(), tcb.irs()));
    assert_eq!(client_irs, Some(server_iss));
    assert_eq!(server_irs, Some(client_iss));
    assert_eq!(connection.inspect(|tcb| tcb.snd_una()), client_iss + 1);

    assert_eq!(client.stats().get(Counter::Established), 1);
    assert_eq!(server.stats().get(Counter::Established), 1);
    assert_eq!(server.stats().get(Counter::Accepted), 1);
    assert_eq!(client.connections(), 1);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn stack_transfer_and_graceful_close() {
    let (client, server, _, _) = stacks(config(), config());
    let listener = server.listen(80, 0).unwrap();
    let connection = client
        .connect(SocketAddr::new(server_addr(), 80))
        .await
        .unwrap();
    let accepted = listener.accept().await.unwrap();

    let data = (0..100_000).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    connection.send_all(&data).await.unwrap();

    let reader = async {
        let mut received = Vec::new();
        while let Some(chunk) = accepted.receive(4096).await.unwrap() {
            received.extend_from_slice(&chunk);
        }
        accepted.close().await.unwrap();
        received
    };
    let (closed, received) = tokio::join!(connection.close(), reader);
    closed.unwrap();
    assert_eq!(received, data);

    assert_eq!(connection.state(), State::TimeWait);
    assert_eq!(accepted.state(), State::Closed);
    assert_eq!(server.connections(), 0);

    time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connection.state(), State::Closed);
    assert_eq!(client.connections(), 0);
}

#[tokio::test]
async fn stack_dropped_connection_fin_timeout() {
    let client_config = Config {
        fin_timeout: Duration::from_millis(300),
        ..config()
    };
    let (client, server, _, _) = stacks(client_config, config());
    let listener = server.listen(80, 0).unwrap();
    let connection = client
        .connect(SocketAddr::new(server_addr(), 80))
        .await
        .unwrap();
    let accepted = listener.accept().await.unwrap();

    // The peer sees the end of stream but never closes
    drop(connection);
    let received = accepted
        .receive_timeout(16, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(received, None);

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.connections(), 1);

    time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.connections(), 0);
    assert_eq!(accepted.state(), State::CloseWait);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn stack_connection_refused() {
    let (client, server, _, _) = stacks(config(), config());

    let r = client.connect(SocketAddr::new(server_addr(), 81)).await;
    assert_eq!(r.err(), Some(Error::ConnectionRefused));
    assert_eq!(server.stats().get(Counter::ResetsSent), 1);
    assert_eq!(client.connections(), 0);
}

#[tokio::test]
async fn stack_unreachable() {
    let (client, _, _, _) = stacks(config(), config());

    let r = client
        .connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 80))
        .await;
    assert_eq!(r.err(), Some(Error::Unreachable));
    assert_eq!(client.connections(), 0);
}

#[tokio::test]
async fn stack_connect_timeout() {
    let client_config = Config {
        max_retransmits: 2,
        ..config()
    };
    let (client, _, client_link, _) = stacks(client_config, config());
    client_link.set_filter(|_| true);

    let start = Instant::now();
    let r = client.connect(SocketAddr::new(server_addr(), 80)).await;
    assert_eq!(r.err(), Some(Error::Timeout));
    // 200 ms + 400 ms + 800 ms
    assert!(start.elapsed() >= Duration::from_millis(1400));
}

#[tokio::test]
async fn stack_retransmission() {
    let (client, server, client_link, _) = stacks(config(), config());
    let listener = server.listen(80, 0).unwrap();
    let connection = client
        .connect(SocketAddr::new(server_addr(), 80))
        .await
        .unwrap();
    let accepted = listener.accept().await.unwrap();

    let sent = Arc::new(Mutex::new(Vec::new()));
    let sent_cloned = Arc::clone(&sent);
    client_link.set_filter(move |datagram| {
        let segment = decode(datagram);
        if segment.payload.is_empty() {
            return false;
        }
        let mut sent = sent_cloned.lock().unwrap();
        sent.push((Instant::now(), segment.payload.clone()));
        sent.len() == 1
    });

    connection.send(b"hello").await.unwrap();
    let received = accepted
        .receive_timeout(16, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(received, Some(b"hello".to_vec()));

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, sent[1].1);
    let elapsed = sent[1].0 - sent[0].0;
    assert!(elapsed >= Duration::from_millis(190), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "{:?}", elapsed);
    assert!(client.stats().get(Counter::Retransmissions) >= 1);
}

#[tokio::test]
async fn stack_fast_open() {
    let fast_open = Config {
        fast_open: true,
        ..config()
    };
    let (client, server, client_link, _) = stacks(fast_open.clone(), fast_open);
    let listener = server.listen(80, 0).unwrap();

    let syn_data = Arc::new(Mutex::new(Vec::new()));
    let syn_data_cloned = Arc::clone(&syn_data);
    client_link.set_filter(move |datagram| {
        let segment = decode(datagram);
        if segment.flags.contains(Flags::SYN) {
            syn_data_cloned
                .lock()
                .unwrap()
                .push((segment.cookie().map(|c| c.len()), segment.payload.clone()));
        }
        false
    });

    // Without a cookie the data follows the handshake
    let first = client
        .connect_with(SocketAddr::new(server_addr(), 80), b"first")
        .await
        .unwrap();
    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.receive(16).await.unwrap(), Some(b"first".to_vec()));

    // With the cached cookie the data rides on the SYN
    let second = client
        .connect_with(SocketAddr::new(server_addr(), 80), b"second")
        .await
        .unwrap();
    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.receive(16).await.unwrap(), Some(b"second".to_vec()));

    let syn_data = syn_data.lock().unwrap();
    assert_eq!(syn_data.len(), 2);
    assert_eq!(syn_data[0], (Some(0), Vec::new()));
    assert_eq!(syn_data[1], (Some(8), b"second".to_vec()));

    drop(first);
    drop(second);
}

#[tokio::test]
async fn stack_backpressure() {
    let client_config = Config {
        send_buffer: 4096,
        ..config()
    };
    let server_config = Config {
        recv_buffer: 4096,
        ..config()
    };
    let (client, server, _, _) = stacks(client_config, server_config);
    let listener = server.listen(80, 0).unwrap();
    let connection = client
        .connect(SocketAddr::new(server_addr(), 80))
        .await
        .unwrap();
    let accepted = listener.accept().await.unwrap();

    let chunk = vec![7u8; 1024];
    let mut sent = 0;
    let mut is_exhausted = false;
    for _ in 0..100 {
        match connection.try_send(&chunk) {
            Ok(size) => sent += size,
            Err(Error::BufferExhausted) => {
                is_exhausted = true;
                break;
            }
            Err(e) => panic!("{}", e),
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert!(is_exhausted);
    assert!(sent >= 4096 && sent <= 8192, "{}", sent);

    // Draining the receiver reopens the window
    let mut received = 0;
    while received < sent {
        let data = accepted
            .receive_timeout(4096, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        received += data.len();
    }
    assert_eq!(received, sent);
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connection.try_send(&chunk), Ok(1024));
}

#[tokio::test]
async fn stack_connection_reset() {
    let (client, server, _, _) = stacks(config(), config());
    let listener = server.listen(80, 0).unwrap();
    let connection = client
        .connect(SocketAddr::new(server_addr(), 80))
        .await
        .unwrap();
    let accepted = listener.accept().await.unwrap();

    accepted.abort();
    assert_eq!(accepted.state(), State::Closed);
    assert_eq!(
        connection
            .receive_timeout(16, Duration::from_secs(5))
            .await,
        Err(Error::ConnectionReset)
    );
    assert_eq!(connection.state(), State::Closed);
    assert_eq!(connection.send(b"late").await, Err(Error::ConnectionReset));
}

#[tokio::test]
async fn stack_receive_deadline_and_cancellation() {
    let (client, server, _, _) = stacks(config(), config());
    let listener = server.listen(80, 0).unwrap();
    let connection = client
        .connect(SocketAddr::new(server_addr(), 80))
        .await
        .unwrap();
    let _accepted = listener.accept().await.unwrap();

    let r = connection
        .receive_timeout(16, Duration::from_millis(50))
        .await;
    assert_eq!(r, Err(Error::DeadlineElapsed));

    let connection = Arc::new(connection);
    let connection_cloned = Arc::clone(&connection);
    let waiter = tokio::spawn(async move { connection_cloned.receive(16).await });
    time::sleep(Duration::from_millis(50)).await;
    connection.abort();

    let r = time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r, Err(Error::ConnectionClosing));
}

#[tokio::test]
async fn stack_backlog_full() {
    let (client, server, _, _) = stacks(config(), config());
    let listener = server.listen(80, 1).unwrap();

    let _first = client
        .connect(SocketAddr::new(server_addr(), 80))
        .await
        .unwrap();
    let r = client.connect(SocketAddr::new(server_addr(), 80)).await;
    assert_eq!(r.err(), Some(Error::ConnectionRefused));
    assert_eq!(server.stats().get(Counter::BacklogRefused), 1);

    let accepted = listener.accept().await.unwrap();
    assert_eq!(accepted.state(), State::Established);
}

#[tokio::test]
async fn stack_half_open_backlog() {
    init();
    let server = Stack::new(server_addr(), Arc::new(BlackHole::new()), config()).unwrap();
    let _listener = server.listen(80, 2).unwrap();

    for port in 40000..40003 {
        let syn = Segment::new(
            port,
            80,
            SeqNum::new(1000),
            SeqNum::new(0),
            Flags::SYN,
            65535,
        );
        let bytes =
            packet::encode(&syn, &PseudoHeader::new(client_addr(), server_addr())).unwrap();
        server.deliver(client_addr(), server_addr(), 6, &bytes);
    }

    assert_eq!(server.connections(), 2);
    assert_eq!(server.stats().get(Counter::BacklogRefused), 1);
    // 2 SYN/ACKs and 1 RST
    assert_eq!(server.stats().get(Counter::SegmentsSent), 3);
    assert_eq!(server.stats().get(Counter::ResetsSent), 1);
}

#[tokio::test]
async fn stack_listen_addr_in_use() {
    let (_, server, _, _) = stacks(config(), config());
    let listener = server.listen(80, 0).unwrap();
    assert!(matches!(server.listen(80, 0), Err(Error::AddrInUse)));

    drop(listener);
    assert!(server.listen(80, 0).is_ok());
}

#[tokio::test]
async fn stack_drop_malformed() {
    let (_, server, _, _) = stacks(config(), config());
    let _listener = server.listen(80, 0).unwrap();

    server.deliver(client_addr(), server_addr(), 6, &[0; 10]);
    assert_eq!(server.stats().get(Counter::Malformed), 1);

    let syn = Segment::new(
        40000,
        80,
        SeqNum::new(1000),
        SeqNum::new(0),
        Flags::SYN,
        65535,
    );
    let mut bytes = packet::encode(&syn, &PseudoHeader::new(client_addr(), server_addr())).unwrap();
    bytes[4] ^= 0x01;
    server.deliver(client_addr(), server_addr(), 6, &bytes);
    assert_eq!(server.stats().get(Counter::Checksum), 1);

    // Other protocols are not for the stack
    server.deliver(client_addr(), server_addr(), 17, &bytes);
    assert_eq!(server.stats().get(Counter::SegmentsReceived), 0);
    assert_eq!(server.connections(), 0);
}

#[tokio::test]
async fn stack_invalid_config() {
    init();
    let (link, _) = Loopback::pair(client_addr(), server_addr());
    let r = Stack::new(
        client_addr(),
        link,
        Config {
            mss: 100,
            ..Config::default()
        },
    );
    assert!(matches!(r, Err(Error::InvalidConfig(_))));
}
