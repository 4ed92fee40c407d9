use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use gkv_common::frame::{read_frame, write_frame};
use gkv_common::{GkvError, KvPair, Request, Response, TableData};
use gkv_peer::{PeerClient, PeerConfig};

fn spawn_server(expected: usize, handler: fn(usize, Request, &mut TcpStream)) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        let mut writer = stream;
        for idx in 0..expected {
            let request: Request = read_frame(&mut reader).expect("read request");
            handler(idx, request, &mut writer);
        }
    });

    addr
}

fn client_with_addr(addr: String) -> PeerClient {
    let mut config = PeerConfig::new(addr);
    config.max_idle = 1;
    config.max_total = 1;
    config.read_timeout = Some(Duration::from_secs(1));
    config.write_timeout = Some(Duration::from_secs(1));
    config.connect_timeout = Some(Duration::from_secs(1));
    PeerClient::with_config(config)
}

#[test]
fn get_roundtrip_reuses_one_connection() {
    let addr = spawn_server(2, |idx, request, stream| {
        match request {
            Request::Get { table, shard, key } => {
                assert_eq!(table, 1);
                let response = if idx == 0 {
                    Response::TableData(TableData::hit(
                        1,
                        table,
                        shard,
                        KvPair::new(key, b"value".to_vec()),
                    ))
                } else {
                    Response::TableData(TableData::miss(1, table, shard))
                };
                write_frame(stream, &response).expect("write");
            }
            other => panic!("unexpected request: {other:?}"),
        };
    });

    let client = client_with_addr(addr);
    let hit = client
        .call(&Request::Get {
            table: 1,
            shard: 0,
            key: b"k".to_vec(),
        })
        .expect("hit");
    match hit {
        Response::TableData(data) => {
            assert!(!data.missing_key);
            assert_eq!(data.kv[0].value, b"value");
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // Bounded to one live socket; a second exchange proves reuse.
    let miss = client
        .call(&Request::Get {
            table: 1,
            shard: 0,
            key: b"absent".to_vec(),
        })
        .expect("miss");
    match miss {
        Response::TableData(data) => assert!(data.missing_key),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[test]
fn error_frames_become_remote_errors() {
    let addr = spawn_server(1, |_, request, stream| {
        match request {
            Request::DestroyTable { table } => {
                let response = Response::Error {
                    message: format!("unknown table {table}"),
                };
                write_frame(stream, &response).expect("write");
            }
            other => panic!("unexpected request: {other:?}"),
        };
    });

    let client = client_with_addr(addr);
    let err = client
        .call(&Request::DestroyTable { table: 42 })
        .unwrap_err();
    match err {
        GkvError::Remote(message) => assert!(message.contains("unknown table 42")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn register_sends_worker_address() {
    let addr = spawn_server(1, |_, request, stream| {
        match request {
            Request::Register { host, port } => {
                assert_eq!(host, "10.1.2.3");
                assert_eq!(port, 7199);
                write_frame(stream, &Response::Ack).expect("write");
            }
            other => panic!("unexpected request: {other:?}"),
        };
    });

    let client = client_with_addr(addr);
    client.register("10.1.2.3", 7199).expect("register");
}
