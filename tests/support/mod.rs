//! A minimal in-process RESP server the integration tests run against.
//!
//! It speaks just enough of the protocol for the client under test: string get/set/delete,
//! counters, and channel/pattern pub/sub with fan-out between connections.  Each `TestServer`
//! binds an ephemeral port on localhost and serves until dropped.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use futures::{SinkExt, StreamExt};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::codec::Decoder;

use redis_engine::protocol::{RespCodec, RespValue};

#[derive(Default)]
struct Peer {
    outbound: Option<UnboundedSender<RespValue>>,
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

#[derive(Default)]
struct State {
    kv: HashMap<Vec<u8>, Vec<u8>>,
    peers: HashMap<u64, Peer>,
}

pub struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> TestServer {
        let _ = env_logger::builder().is_test(true).try_init();
        let (addr_tx, addr_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("cannot build test server runtime");
            runtime.block_on(serve(addr_tx, shutdown_rx));
        });
        let addr = addr_rx.recv().expect("test server failed to start");
        TestServer {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn serve(addr_tx: mpsc::Sender<SocketAddr>, mut shutdown_rx: oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("cannot bind test server");
    addr_tx
        .send(listener.local_addr().expect("no local addr"))
        .expect("cannot report test server addr");

    let state = Arc::new(Mutex::new(State::default()));
    let mut next_conn_id = 0u64;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    next_conn_id += 1;
                    tokio::spawn(serve_connection(stream, state.clone(), next_conn_id));
                }
                Err(_) => break,
            },
            _ = &mut shutdown_rx => break,
        }
    }
    // Dropping the runtime tears down the connection tasks
}

async fn serve_connection(stream: TcpStream, state: Arc<Mutex<State>>, conn_id: u64) {
    let mut framed = RespCodec.framed(stream);
    let (tx, mut rx) = unbounded_channel::<RespValue>();
    state
        .lock()
        .unwrap()
        .peers
        .entry(conn_id)
        .or_default()
        .outbound = Some(tx.clone());

    loop {
        tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(frame)) => {
                    for reply in handle_command(&state, conn_id, frame) {
                        let _ = tx.send(reply);
                    }
                }
                Some(Err(_)) | None => break,
            },
            Some(outbound) = rx.recv() => {
                if framed.send(outbound).await.is_err() {
                    break;
                }
            }
        }
    }

    state.lock().unwrap().peers.remove(&conn_id);
}

fn handle_command(state: &Mutex<State>, conn_id: u64, frame: RespValue) -> Vec<RespValue> {
    let argv = match as_argv(frame) {
        Some(argv) if !argv.is_empty() => argv,
        _ => return vec![RespValue::Error("ERR malformed command".to_owned())],
    };
    let verb = String::from_utf8_lossy(&argv[0]).to_uppercase();
    let mut state = state.lock().unwrap();
    match verb.as_str() {
        "PING" => vec![RespValue::SimpleString("PONG".to_owned())],
        "SET" if argv.len() == 3 => {
            state.kv.insert(argv[1].clone(), argv[2].clone());
            vec![RespValue::SimpleString("OK".to_owned())]
        }
        "GET" if argv.len() == 2 => match state.kv.get(&argv[1]) {
            Some(value) => vec![RespValue::BulkString(value.clone())],
            None => vec![RespValue::Nil],
        },
        "DEL" if argv.len() >= 2 => {
            let removed = argv[1..]
                .iter()
                .filter(|key| state.kv.remove(*key).is_some())
                .count();
            vec![RespValue::Integer(removed as i64)]
        }
        "KEYS" if argv.len() == 2 => {
            let mut keys: Vec<Vec<u8>> = state
                .kv
                .keys()
                .filter(|key| glob_match(&argv[1], key))
                .cloned()
                .collect();
            keys.sort();
            vec![RespValue::Array(
                keys.into_iter().map(RespValue::BulkString).collect(),
            )]
        }
        "INCR" if argv.len() == 2 => {
            let current = match state.kv.get(&argv[1]) {
                Some(value) => match std::str::from_utf8(value).ok().and_then(|s| s.parse().ok()) {
                    Some(n) => n,
                    None => {
                        return vec![RespValue::Error(
                            "ERR value is not an integer or out of range".to_owned(),
                        )]
                    }
                },
                None => 0i64,
            };
            let next = current + 1;
            state.kv.insert(argv[1].clone(), next.to_string().into_bytes());
            vec![RespValue::Integer(next)]
        }
        "SUBSCRIBE" if argv.len() >= 2 => {
            let peer = state.peers.entry(conn_id).or_default();
            let mut replies = Vec::new();
            for topic in &argv[1..] {
                let topic = String::from_utf8_lossy(topic).into_owned();
                peer.channels.insert(topic.clone());
                let count = (peer.channels.len() + peer.patterns.len()) as i64;
                replies.push(confirmation("subscribe", &topic, count));
            }
            replies
        }
        "UNSUBSCRIBE" if argv.len() >= 2 => {
            let peer = state.peers.entry(conn_id).or_default();
            let mut replies = Vec::new();
            for topic in &argv[1..] {
                let topic = String::from_utf8_lossy(topic).into_owned();
                peer.channels.remove(&topic);
                let count = (peer.channels.len() + peer.patterns.len()) as i64;
                replies.push(confirmation("unsubscribe", &topic, count));
            }
            replies
        }
        "PSUBSCRIBE" if argv.len() >= 2 => {
            let peer = state.peers.entry(conn_id).or_default();
            let mut replies = Vec::new();
            for pattern in &argv[1..] {
                let pattern = String::from_utf8_lossy(pattern).into_owned();
                peer.patterns.insert(pattern.clone());
                let count = (peer.channels.len() + peer.patterns.len()) as i64;
                replies.push(confirmation("psubscribe", &pattern, count));
            }
            replies
        }
        "PUNSUBSCRIBE" if argv.len() >= 2 => {
            let peer = state.peers.entry(conn_id).or_default();
            let mut replies = Vec::new();
            for pattern in &argv[1..] {
                let pattern = String::from_utf8_lossy(pattern).into_owned();
                peer.patterns.remove(&pattern);
                let count = (peer.channels.len() + peer.patterns.len()) as i64;
                replies.push(confirmation("punsubscribe", &pattern, count));
            }
            replies
        }
        "PUBLISH" if argv.len() == 3 => {
            let topic = String::from_utf8_lossy(&argv[1]).into_owned();
            let payload = argv[2].clone();
            let mut receivers = 0i64;
            for peer in state.peers.values() {
                let outbound = match &peer.outbound {
                    Some(outbound) => outbound,
                    None => continue,
                };
                if peer.channels.contains(&topic) {
                    let _ = outbound.send(RespValue::Array(vec![
                        RespValue::BulkString(b"message".to_vec()),
                        RespValue::BulkString(topic.as_bytes().to_vec()),
                        RespValue::BulkString(payload.clone()),
                    ]));
                    receivers += 1;
                }
                for pattern in &peer.patterns {
                    if glob_match(pattern.as_bytes(), topic.as_bytes()) {
                        let _ = outbound.send(RespValue::Array(vec![
                            RespValue::BulkString(b"pmessage".to_vec()),
                            RespValue::BulkString(pattern.as_bytes().to_vec()),
                            RespValue::BulkString(topic.as_bytes().to_vec()),
                            RespValue::BulkString(payload.clone()),
                        ]));
                        receivers += 1;
                    }
                }
            }
            vec![RespValue::Integer(receivers)]
        }
        _ => vec![RespValue::Error(format!("ERR unknown command '{}'", verb))],
    }
}

fn confirmation(kind: &str, topic: &str, count: i64) -> RespValue {
    RespValue::Array(vec![
        RespValue::BulkString(kind.as_bytes().to_vec()),
        RespValue::BulkString(topic.as_bytes().to_vec()),
        RespValue::Integer(count),
    ])
}

fn as_argv(frame: RespValue) -> Option<Vec<Vec<u8>>> {
    let items = match frame {
        RespValue::Array(items) => items,
        _ => return None,
    };
    items
        .into_iter()
        .map(|item| match item {
            RespValue::BulkString(bytes) => Some(bytes),
            RespValue::SimpleString(text) => Some(text.into_bytes()),
            _ => None,
        })
        .collect()
}

/// Redis-style glob matching, just enough for the patterns the tests use.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((&byte, rest)) => text.first() == Some(&byte) && glob_match(rest, &text[1..]),
    }
}
