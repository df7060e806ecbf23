//! Runs the controller over TCP against a minimal memcached and view server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pace_workload::{
    decode_document, Controller, DriverConfig, DriverError, KeyPolicy, MemcacheConnector, Outcome,
    SizeDistribution, WorkloadMode, EXIT_SETUP,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type Data = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Serves `set` and `get`. With `bad_length`, every hit advertises an
/// impossible value length.
async fn handle_memcache(
    stream: TcpStream,
    data: Data,
    bad_length: bool,
) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        match parts.as_slice() {
            ["set", key, _flags, _exptime, len] => {
                let len: usize = len.parse().expect("length");
                let mut value = vec![0u8; len + 2];
                stream.read_exact(&mut value).await?;
                value.truncate(len);
                data.lock().expect("lock poisoned").insert((*key).to_string(), value);
                stream.write_all(b"STORED\r\n").await?;
            }
            ["get", key] => {
                let value = data.lock().expect("lock poisoned").get(*key).cloned();
                if value.is_some() && bad_length {
                    let header = format!("VALUE {key} 0 {}\r\n", u64::MAX);
                    stream.write_all(header.as_bytes()).await?;
                } else if let Some(value) = value {
                    let header = format!("VALUE {key} 0 {}\r\n", value.len());
                    stream.write_all(header.as_bytes()).await?;
                    stream.write_all(&value).await?;
                    stream.write_all(b"\r\n").await?;
                }
                stream.write_all(b"END\r\n").await?;
            }
            _ => stream.write_all(b"ERROR\r\n").await?,
        }
        stream.flush().await?;
    }
}

async fn spawn_memcache() -> (SocketAddr, Data) {
    spawn_memcache_with(false).await
}

async fn spawn_memcache_with(bad_length: bool) -> (SocketAddr, Data) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let data = Data::default();
    let shared = data.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_memcache(stream, shared.clone(), bad_length));
        }
    });
    (addr, data)
}

/// Answers every view query with a fixed row count and records the paths.
async fn spawn_view(total_rows: u64) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let paths = Arc::new(Mutex::new(Vec::new()));
    let seen = paths.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let mut stream = BufReader::new(stream);
            let mut request_line = String::new();
            if stream.read_line(&mut request_line).await.is_err() {
                continue;
            }
            loop {
                let mut header = String::new();
                match stream.read_line(&mut header).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) if header == "\r\n" => break,
                    Ok(_) => {}
                }
            }
            if let Some(path) = request_line.split(' ').nth(1) {
                seen.lock().expect("lock poisoned").push(path.to_string());
            }
            let body = format!(r#"{{"total_rows":{total_rows},"rows":[]}}"#);
            let response = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.get_mut().write_all(response.as_bytes()).await;
        }
    });
    (addr, paths)
}

#[tokio::test]
async fn test_readback_over_memcache() {
    let (addr, data) = spawn_memcache().await;
    let config = DriverConfig::builder()
        .endpoint(addr.to_string())
        .mode(WorkloadMode::Readback)
        .keys(KeyPolicy::Cyclic { pool_size: 20 })
        .batch_size(20)
        .document_size(SizeDistribution::Uniform { min: 16, max: 2048 })
        .cycles(2)
        .capture_dir(None)
        .reconnect_delay_ms(0)
        .build();
    let mut controller =
        Controller::new(config.clone(), MemcacheConnector::from_config(&config)).unwrap();

    assert_eq!(controller.run().await.unwrap(), Outcome::Completed);
    assert_eq!(controller.stats().cycles, 2);

    let data = data.lock().expect("lock poisoned");
    assert_eq!(data.len(), 20);
    let doc = decode_document(&data["key:5"]).unwrap();
    assert!(doc.verify().is_ok());
}

#[tokio::test]
async fn test_consistency_over_memcache() {
    let (addr, data) = spawn_memcache().await;
    let (view_addr, paths) = spawn_view(0).await;
    let config = DriverConfig::builder()
        .endpoint(addr.to_string())
        .view_endpoint(view_addr.to_string())
        .keys(KeyPolicy::Cyclic { pool_size: 10 })
        .batch_size(10)
        .cycles(2)
        .reconnect_delay_ms(0)
        .build();
    let mut controller =
        Controller::new(config.clone(), MemcacheConnector::from_config(&config)).unwrap();

    assert_eq!(controller.run().await.unwrap(), Outcome::Completed);
    assert_eq!(data.lock().expect("lock poisoned").len(), 10);

    let paths = paths.lock().expect("lock poisoned");
    assert_eq!(paths.len(), 2);
    assert_eq!(
        paths[0],
        "/default/_design/check/_view/check?stale=false&connection_timeout=60000"
    );
}

#[tokio::test]
async fn test_view_mismatch_over_http() {
    let (addr, _data) = spawn_memcache().await;
    let (view_addr, _paths) = spawn_view(3).await;
    let config = DriverConfig::builder()
        .endpoint(addr.to_string())
        .view_endpoint(view_addr.to_string())
        .keys(KeyPolicy::Cyclic { pool_size: 10 })
        .batch_size(10)
        .reconnect_delay_ms(0)
        .build();
    let mut controller =
        Controller::new(config.clone(), MemcacheConnector::from_config(&config)).unwrap();

    let err = controller.run().await.unwrap_err();
    assert!(err.violation().is_some());
}

#[tokio::test]
async fn test_unreachable_server_without_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = DriverConfig::builder()
        .endpoint(addr.to_string())
        .mode(WorkloadMode::Readback)
        .keys(KeyPolicy::Unique)
        .reconnect(false)
        .build();
    let mut controller =
        Controller::new(config.clone(), MemcacheConnector::from_config(&config)).unwrap();

    let err = controller.run().await.unwrap_err();
    assert!(matches!(err, DriverError::ConnectionLost { .. }));
    assert_eq!(err.exit_code(), EXIT_SETUP);
}

#[tokio::test]
async fn test_impossible_value_length_fails_transport() {
    let (addr, _data) = spawn_memcache_with(true).await;
    let config = DriverConfig::builder()
        .endpoint(addr.to_string())
        .mode(WorkloadMode::Readback)
        .keys(KeyPolicy::Cyclic { pool_size: 4 })
        .batch_size(4)
        .capture_dir(None)
        .reconnect(false)
        .build();
    let mut controller =
        Controller::new(config.clone(), MemcacheConnector::from_config(&config)).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(10), controller.run())
        .await
        .expect("run must settle")
        .unwrap_err();
    assert!(matches!(err, DriverError::ConnectionLost { .. }));
    assert!(controller.context().counters().all_zero());
    assert_eq!(controller.context().in_flight(), 0);
}

#[tokio::test]
async fn test_consistency_without_view_endpoint_rejected() {
    let (addr, _data) = spawn_memcache().await;
    let config = DriverConfig::builder()
        .endpoint(addr.to_string())
        .keys(KeyPolicy::Cyclic { pool_size: 10 })
        .batch_size(10)
        .build();

    let err = Controller::new(config.clone(), MemcacheConnector::from_config(&config))
        .err()
        .unwrap();
    assert!(matches!(err, DriverError::Config(_)));
    assert_eq!(err.exit_code(), EXIT_SETUP);
}
