//! 回环地址上的端到端场景：真实套接字、真实时钟。
//!
//! 连接层由测试线程以驱动循环的方式反复 `poll_all`，对端使用标准库阻塞套接字。

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spark_sockets::{
    FatalKind, InboundNotifier, PushHint, SlotHandle, SlotState, SocketServer,
    SocketServerConfig, Transport, TransportStatus,
};
use spark_transport_tcp::{TcpTransportConfig, TokioTransport};
use tracing_test::traced_test;

fn loopback_transport() -> Arc<TokioTransport> {
    TokioTransport::with_config(
        TcpTransportConfig::new()
            .with_bind_ip(Ipv4Addr::LOCALHOST.into())
            .with_worker_threads(1),
    )
    .expect("transport")
}

fn server(transport: &Arc<TokioTransport>, slots: usize) -> SocketServer {
    SocketServer::new(
        SocketServerConfig::default()
            .with_slot_count(slots)
            .with_backlog_capacity(2),
        transport.clone(),
    )
    .expect("server")
}

fn wait_for<T>(mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(value) = attempt() {
            return Some(value);
        }
        thread::sleep(Duration::from_millis(2));
    }
    None
}

fn accept_client(server: &SocketServer, transport: &TokioTransport) -> (SlotHandle, TcpStream) {
    let listener = server.listen(0).expect("listen");
    let addr = transport.local_addr(0).expect("bound address");
    let client = TcpStream::connect(addr).expect("client connect");
    let slot = wait_for(|| listener.next_accepted()).expect("入站连接应绑定到槽位");
    (slot, client)
}

#[test]
#[traced_test]
fn inbound_echo_and_graceful_close() {
    let transport = loopback_transport();
    let server = server(&transport, 2);
    let (slot, mut client) = accept_client(&server, &transport);
    assert_eq!(server.pool().state(slot).expect("state"), SlotState::Connected);

    client.write_all(b"hello").expect("client write");
    let mut received = Vec::new();
    wait_for(|| {
        server.poll_all();
        let mut buf = [0u8; 16];
        let report = server.pool().read(slot, &mut buf).expect("read");
        received.extend_from_slice(&buf[..report.read]);
        (received.len() >= 5).then_some(())
    })
    .expect("服务端应收到数据");
    assert_eq!(received, b"hello");

    let report = server
        .pool()
        .write(slot, b"world", PushHint::Flush)
        .expect("write");
    assert_eq!(report.written, 5);
    let mut echo = [0u8; 5];
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    client.read_exact(&mut echo).expect("client read");
    assert_eq!(&echo, b"world");

    let started = Instant::now();
    server.pool().close(slot).expect("close");
    assert!(started.elapsed() < Duration::from_millis(50), "close 不得阻塞");
    wait_for(|| {
        server.poll_all();
        (server.pool().state(slot).ok() == Some(SlotState::Free)).then_some(())
    })
    .expect("排空后槽位回到 Free");

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).expect("对端应看到 FIN");
    assert!(rest.is_empty());
    assert!(logs_contain("tcp listener bound"));
}

#[test]
fn peer_close_moves_slot_to_other_end_closed() {
    let transport = loopback_transport();
    let server = server(&transport, 1);
    let (slot, client) = accept_client(&server, &transport);
    drop(client);

    wait_for(|| {
        server.poll_all();
        (server.pool().state(slot).ok() == Some(SlotState::OtherEndClosed)).then_some(())
    })
    .expect("对端关闭后进入 OtherEndClosed");

    server.pool().close(slot).expect("close");
    wait_for(|| {
        server.poll_all();
        (server.pool().free_count() == 1).then_some(())
    })
    .expect("OtherEndClosed 的关闭同样可以排空");
}

#[test]
fn outbound_connect_is_established_through_poll() {
    let transport = loopback_transport();
    let server = server(&transport, 1);
    let peer = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("peer bind");
    let target = peer.local_addr().expect("peer addr");

    let slot = server.connect(target).expect("connect");
    let (mut accepted, _) = peer.accept().expect("peer accept");
    wait_for(|| {
        server.poll_all();
        (server.pool().state(slot).ok() == Some(SlotState::Connected)).then_some(())
    })
    .expect("握手完成后进入 Connected");

    server
        .pool()
        .write(slot, b"ping", PushHint::MoreComing)
        .expect("write");
    let mut buf = [0u8; 4];
    accepted
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    accepted.read_exact(&mut buf).expect("合并窗口过后数据应被推送");
    assert_eq!(&buf, b"ping");
}

#[test]
fn refused_connect_returns_slot_to_pool() {
    let transport = loopback_transport();
    let server = server(&transport, 1);
    let target = {
        let placeholder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("placeholder bind");
        placeholder.local_addr().expect("placeholder addr")
    };

    let slot = server.connect(target).expect("发起连接只做参数校验");
    wait_for(|| {
        server.poll_all();
        (server.pool().free_count() == 1).then_some(())
    })
    .expect("连接失败后槽位回收");
    assert_eq!(server.pool().state(slot).expect("state"), SlotState::Free);
}

#[test]
fn close_resets_a_flush_stuck_on_a_peer_that_never_reads() {
    let transport = loopback_transport();
    let server = SocketServer::new(
        SocketServerConfig::default()
            .with_slot_count(1)
            .with_max_send_wait(Duration::from_millis(200)),
        transport.clone(),
    )
    .expect("server");
    let (slot, mut client) = accept_client(&server, &transport);

    // 对端从不读取：持续写入直到发送路径连续一段时间没有任何进展，说明内核缓冲已满。
    let payload = [0x5au8; 8 * 1024];
    let fill_deadline = Instant::now() + Duration::from_secs(20);
    let mut stalled_since: Option<Instant> = None;
    loop {
        assert!(Instant::now() < fill_deadline, "对端不读取时发送路径应停滞");
        server.poll_all();
        let report = server
            .pool()
            .write(slot, &payload, PushHint::Flush)
            .expect("write");
        if report.written > 0 {
            stalled_since = None;
            thread::yield_now();
            continue;
        }
        assert_eq!(report.status, TransportStatus::WouldBlock, "停滞只能来自背压");
        let since = *stalled_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= Duration::from_millis(100) {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    server.pool().close(slot).expect("close");
    wait_for(|| {
        server.poll_all();
        (server.pool().state(slot).ok() == Some(SlotState::Free)).then_some(())
    })
    .expect("排空截止后槽位回到 Free");

    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    let mut buf = vec![0u8; 64 * 1024];
    let deadline = Instant::now() + Duration::from_secs(10);
    let end = loop {
        assert!(Instant::now() < deadline, "对端不应无休止地收到数据");
        match client.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(_) => continue,
            Err(err) => break Err(err.kind()),
        }
    };
    assert_eq!(end, Err(io::ErrorKind::ConnectionReset), "卡住的推送应以 RST 结束");
}

struct Silent;

impl InboundNotifier for Silent {
    fn inbound_ready(&self) {}
}

#[test]
fn transport_rejects_duplicate_listen_and_invalid_targets() {
    let transport = loopback_transport();
    transport.listen(0, Arc::new(Silent)).expect("first listen");
    assert_eq!(
        transport.listen(0, Arc::new(Silent)),
        Err(TransportStatus::Fatal(FatalKind::AddressInUse))
    );
    let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80));
    assert_eq!(
        transport.connect(unspecified),
        Err(TransportStatus::Fatal(FatalKind::InvalidInput))
    );

    transport.unlisten(0);
    assert!(transport.local_addr(0).is_none());
    assert!(transport.listen(0, Arc::new(Silent)).is_ok(), "停止后可重新监听");
}

#[test]
fn released_endpoint_answers_none() {
    let transport = loopback_transport();
    transport.listen(0, Arc::new(Silent)).expect("listen");
    let addr = transport.local_addr(0).expect("addr");
    let _client = TcpStream::connect(addr).expect("client");

    let endpoint = wait_for(|| transport.accept_pending(0)).expect("pending endpoint");
    assert_eq!(transport.query_unsent(endpoint), Some(0));
    assert!(transport.is_alive(endpoint));

    transport.set_close_timeout(endpoint, Duration::ZERO);
    transport.initiate_close(endpoint, Duration::ZERO);
    transport.release_endpoint(endpoint);
    transport.release_endpoint(endpoint);
    assert_eq!(transport.query_unsent(endpoint), None);
    assert_eq!(transport.bytes_available(endpoint), None);
    assert_eq!(transport.live_endpoints(), 0);
}
