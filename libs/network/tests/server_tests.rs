//! End-to-end socket tests
//!
//! Real loopback TCP and WebSocket clients against a running [`Server`].

use async_trait::async_trait;
use bytes::BytesMut;
use codec::{
    pack, unpack, FrameDecoder, LengthFieldConfig, LengthFieldFrameDecoder, Message,
    MessageFrameDecoder, MessageType, Metadata, SerializeType,
};
use dispatch::{Router, Task, TaskHandler, TaskHandlerConfig};
use futures::{SinkExt, StreamExt};
use network::{ConnManager, HeartbeatChecker, NetworkError, Server, ServerConfig, ServerKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const ECHO: u16 = 1;
const HEARTBEAT: u16 = 99;

struct Echo;

#[async_trait]
impl Router for Echo {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        let resp = Message::response_to(task.message(), 0, task.message().data.clone());
        task.reply(&resp).await?;
        Ok(())
    }
}

struct Count(Arc<AtomicUsize>);

#[async_trait]
impl Router for Count {
    async fn handle(&self, _task: &Task) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn handler_with(routes: Vec<(u16, Arc<dyn Router>)>) -> Arc<TaskHandler> {
    let mut builder = TaskHandler::builder(TaskHandlerConfig {
        worker_pool_size: 4,
        max_task_queue_len: 64,
        task_pool_capacity: 64,
    });
    for (msg_id, router) in routes {
        builder.add_router(msg_id, router).unwrap();
    }
    builder.start().unwrap()
}

fn request(cmd: u16, seq: u64, data: &str) -> Message {
    Message::new(cmd, 0, SerializeType::None, Metadata::new(), data.to_string()).with_seq(seq)
}

async fn read_frames(
    stream: &mut TcpStream,
    decoder: &mut dyn FrameDecoder,
    want: usize,
) -> Vec<Message> {
    let mut frames = Vec::new();
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while frames.len() < want {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            decoder.decode(&buf[..n], &mut frames).unwrap();
        }
    })
    .await
    .expect("timed out waiting for frames");
    frames.iter().map(|f| unpack(f).unwrap()).collect()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_tcp_echo_with_split_and_merged_frames() {
    let handler = handler_with(vec![(ECHO, Arc::new(Echo) as Arc<dyn Router>)]);
    let server = Arc::new(
        Server::new(ServerConfig::default(), handler.clone())
            .with_frame_decoder(|| Box::new(MessageFrameDecoder::default())),
    );
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut wire = BytesMut::new();
    for seq in 1..=3 {
        wire.extend_from_slice(&pack(&request(ECHO, seq, &format!("m{seq}"))).unwrap());
    }
    // two and a half frames, then the rest
    let cut = wire.len() - 7;
    client.write_all(&wire[..cut]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(&wire[cut..]).await.unwrap();

    let mut replies = read_frames(&mut client, &mut MessageFrameDecoder::default(), 3).await;
    replies.sort_by_key(|m| m.seq);
    for (i, reply) in replies.iter().enumerate() {
        let seq = i as u64 + 1;
        assert_eq!(reply.seq, seq);
        assert_eq!(reply.message_type, MessageType::Response);
        assert_eq!(reply.data, format!("m{seq}").as_bytes());
    }

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_heartbeat_is_answered_and_never_routed() {
    let routed = Arc::new(AtomicUsize::new(0));
    let handler = handler_with(vec![(HEARTBEAT, Arc::new(Count(routed.clone())) as Arc<dyn Router>)]);
    let server = Arc::new(
        Server::new(ServerConfig::default(), handler.clone())
            .with_frame_decoder(|| Box::new(MessageFrameDecoder::default()))
            .with_heartbeat(HeartbeatChecker::new(Duration::from_secs(10), HEARTBEAT).unwrap()),
    );
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&pack(&request(HEARTBEAT, 8, "ping")).unwrap())
        .await
        .unwrap();

    let acks = read_frames(&mut client, &mut MessageFrameDecoder::default(), 1).await;
    assert_eq!(acks[0].cmd, HEARTBEAT);
    assert_eq!(acks[0].seq, 8);
    assert_eq!(acks[0].message_type, MessageType::Response);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(routed.load(Ordering::SeqCst), 0);

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_idle_connection_is_stopped_by_heartbeat() {
    let handler = handler_with(vec![]);
    let server = Arc::new(
        Server::new(ServerConfig::default(), handler.clone()).with_heartbeat(
            HeartbeatChecker::new(Duration::from_millis(20), HEARTBEAT)
                .unwrap()
                .with_max_idle(Duration::from_millis(200)),
        ),
    );
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let manager = server.manager().clone();
    wait_until(|| manager.count() == 1).await;
    wait_until(|| manager.count() == 0).await;

    // server closed its side
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_zero_heartbeat_interval_is_refused() {
    let err = HeartbeatChecker::new(Duration::ZERO, HEARTBEAT).unwrap_err();
    assert!(matches!(err, NetworkError::Configuration { .. }));

    // the shortest accepted interval still enforces liveness
    let handler = handler_with(vec![]);
    let server = Arc::new(
        Server::new(ServerConfig::default(), handler.clone()).with_heartbeat(
            HeartbeatChecker::new(Duration::from_millis(1), HEARTBEAT)
                .unwrap()
                .with_max_idle(Duration::from_millis(100)),
        ),
    );
    let addr = server.start().await.unwrap();

    let _client = TcpStream::connect(addr).await.unwrap();
    let manager = server.manager().clone();
    wait_until(|| manager.count() == 1).await;
    wait_until(|| manager.count() == 0).await;

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_stop_hook_runs_before_close_and_removal() {
    let handler = handler_with(vec![]);
    let observed = Arc::new(Mutex::new(None));
    let seen = observed.clone();

    let manager = Arc::new(ConnManager::new());
    let tracker = manager.clone();
    let server = Arc::new(
        Server::new(ServerConfig::default(), handler.clone())
            .with_manager(manager.clone())
            .with_on_conn_start(|conn| conn.set_property("user", "alice"))
            .with_on_conn_stop(move |conn| {
                let tracked = tracker.get(conn.conn_id()).is_some();
                *seen.lock() = Some((
                    conn.is_closed(),
                    tracked,
                    conn.get_property("user").ok(),
                ));
            }),
    );
    let addr = server.start().await.unwrap();

    let client = TcpStream::connect(addr).await.unwrap();
    wait_until(|| manager.count() == 1).await;
    let conn = manager.get(manager.all_conn_ids()[0]).unwrap();
    assert!(conn.is_alive());

    drop(client);
    wait_until(|| manager.count() == 0).await;

    assert_eq!(
        observed.lock().clone(),
        Some((false, true, Some("alice".to_string())))
    );
    assert!(conn.is_closed());
    assert!(!conn.is_alive());

    let err = conn.send_msg(&request(ECHO, 1, "late")).await.unwrap_err();
    assert!(matches!(err, NetworkError::ConnectionClosed { .. }));

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_properties_are_independent_of_traffic() {
    let handler = handler_with(vec![]);
    let server = Arc::new(Server::new(ServerConfig::default(), handler.clone()));
    let addr = server.start().await.unwrap();

    let _client = TcpStream::connect(addr).await.unwrap();
    let manager = server.manager().clone();
    wait_until(|| manager.count() == 1).await;
    let conn = manager.get(manager.all_conn_ids()[0]).unwrap();

    assert!(matches!(
        conn.get_property("missing"),
        Err(NetworkError::PropertyNotFound { .. })
    ));

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let conn = conn.clone();
            tokio::spawn(async move {
                for j in 0..50 {
                    conn.set_property(format!("k{i}"), format!("v{j}"));
                    let _ = conn.get_property(&format!("k{i}"));
                }
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap();
    }
    assert_eq!(conn.get_property("k3").unwrap(), "v49");
    conn.remove_property("k3");
    assert!(conn.get_property("k3").is_err());

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_concurrent_sends_never_interleave() {
    let handler = handler_with(vec![]);
    let server = Arc::new(
        Server::new(ServerConfig::default(), handler.clone())
            .with_frame_decoder(|| Box::new(MessageFrameDecoder::default())),
    );
    let addr = server.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let manager = server.manager().clone();
    wait_until(|| manager.count() == 1).await;
    let conn = manager.get(manager.all_conn_ids()[0]).unwrap();

    let body = "x".repeat(4096);
    let senders: Vec<_> = (0..10)
        .map(|seq| {
            let conn = conn.clone();
            let body = body.clone();
            tokio::spawn(async move { conn.send_msg(&request(ECHO, seq, &body)).await })
        })
        .collect();
    for s in senders {
        s.await.unwrap().unwrap();
    }

    let msgs = read_frames(&mut client, &mut MessageFrameDecoder::default(), 10).await;
    let mut seqs: Vec<_> = msgs.iter().map(|m| m.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    assert!(msgs.iter().all(|m| m.data.len() == 4096));

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_length_prefixed_framing_both_directions() {
    let handler = handler_with(vec![(ECHO, Arc::new(Echo) as Arc<dyn Router>)]);
    let config = LengthFieldConfig::u32_prefixed(1 << 20);
    let server_config = config.clone();
    let server = Arc::new(
        Server::new(ServerConfig::default(), handler.clone()).with_frame_decoder(move || {
            Box::new(LengthFieldFrameDecoder::new(server_config.clone()).unwrap())
        }),
    );
    let addr = server.start().await.unwrap();

    let mut client_codec = LengthFieldFrameDecoder::new(config).unwrap();
    let mut wire = BytesMut::new();
    client_codec
        .encode(&pack(&request(ECHO, 5, "framed")).unwrap(), &mut wire)
        .unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&wire).await.unwrap();

    let replies = read_frames(&mut client, &mut client_codec, 1).await;
    assert_eq!(replies[0].seq, 5);
    assert_eq!(&replies[0].data[..], b"framed");

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_max_conn_rejects_extra_connections() {
    let handler = handler_with(vec![]);
    let server = Arc::new(Server::new(
        ServerConfig {
            max_conn: 1,
            ..ServerConfig::default()
        },
        handler.clone(),
    ));
    let addr = server.start().await.unwrap();

    let _first = TcpStream::connect(addr).await.unwrap();
    let manager = server.manager().clone();
    wait_until(|| manager.count() == 1).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(manager.count(), 1);

    server.stop().await;
    handler.stop().await;
}

#[tokio::test]
async fn test_server_stop_closes_everything() {
    let handler = handler_with(vec![]);
    let server = Arc::new(Server::new(ServerConfig::default(), handler.clone()));
    let addr = server.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    let manager = server.manager().clone();
    wait_until(|| manager.count() == 5).await;

    server.stop().await;
    wait_until(|| manager.count() == 0).await;

    // every client sees its socket closed
    for client in &mut clients {
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
    handler.stop().await;
}

#[tokio::test]
async fn test_websocket_echo() {
    let handler = handler_with(vec![(ECHO, Arc::new(Echo) as Arc<dyn Router>)]);
    let server = Arc::new(Server::new(
        ServerConfig {
            kind: ServerKind::WebSocket,
            ..ServerConfig::default()
        },
        handler.clone(),
    ));
    let addr = server.start().await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    ws.send(WsMessage::Binary(pack(&request(ECHO, 11, "over ws")).unwrap().to_vec()))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => return unpack(&data).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reply.seq, 11);
    assert_eq!(&reply.data[..], b"over ws");

    ws.close(None).await.unwrap();
    let manager = server.manager().clone();
    wait_until(|| manager.count() == 0).await;

    server.stop().await;
    handler.stop().await;
}
