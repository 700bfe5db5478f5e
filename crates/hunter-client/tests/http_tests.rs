use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hunter_client::{AddressResolver, FetchError, HttpAddressResolver, HttpTaskSource, TaskSource};
use hunter_core::{
    encode_records, HuntingTask, IpVersion, PublicIpNotification, Record, TaskId, HASH_LEN,
};
use reqwest::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves exactly one HTTP response on a fresh local port.
async fn serve_once(status: &'static str, body: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = sock.read(&mut buf).await;
        let head = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        sock.write_all(head.as_bytes()).await.unwrap();
        sock.write_all(&body).await.unwrap();
        let _ = sock.shutdown().await;
    });
    addr
}

fn source(addr: SocketAddr) -> HttpTaskSource {
    let client = Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .unwrap();
    HttpTaskSource::with_client(client, format!("http://{addr}/getHuntingTaskList.jsp"))
}

fn notification(addr: &str) -> PublicIpNotification {
    PublicIpNotification {
        public_ip: addr.parse().unwrap(),
        hmac: [3; HASH_LEN],
    }
}

#[tokio::test]
async fn decodes_task_list_reply() {
    let records = vec![
        Record::CurrentServerTime(1_700_000_000),
        Record::Task(HuntingTask {
            id: TaskId(12),
            target: "203.0.113.12".parse().unwrap(),
            port: 443,
            hostname: "bank.example".into(),
            known_cert_hashes: vec![[7; HASH_LEN]],
        }),
    ];
    let addr = serve_once("200 OK", encode_records(&records).unwrap()).await;

    assert_eq!(source(addr).fetch().await.unwrap(), records);
}

#[tokio::test]
async fn error_status_is_reported_as_status() {
    let addr = serve_once("503 Service Unavailable", b"busy".to_vec()).await;
    match source(addr).fetch().await {
        Err(FetchError::Status(503)) => {}
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_body_is_empty_reply() {
    let addr = serve_once("200 OK", vec![]).await;
    assert!(matches!(source(addr).fetch().await, Err(FetchError::EmptyReply)));
}

#[tokio::test]
async fn garbage_body_is_decode_error() {
    // Declares 200 bytes, carries 2.
    let addr = serve_once("200 OK", vec![5, 0, 200, 1, 2]).await;
    assert!(matches!(source(addr).fetch().await, Err(FetchError::Decode(_))));
}

#[tokio::test]
async fn closed_port_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = source(addr).fetch().await.unwrap_err();
    assert!(err.is_transport(), "{err:?}");
}

#[tokio::test]
async fn public_ip_picks_requested_family() {
    let body = encode_records(&[
        Record::PublicIpNotification(notification("2001:db8:ffff::4")),
        Record::PublicIpNotification(notification("198.51.100.4")),
    ])
    .unwrap();
    let addr = serve_once("200 OK", body).await;
    let resolver = HttpAddressResolver::new("http", "coordinator.test", addr.port(), Duration::from_secs(5))
        .without_proxy();

    let found = resolver
        .public_ip(addr.ip(), IpVersion::V4)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found, notification("198.51.100.4"));
}

#[tokio::test]
async fn public_ip_without_matching_family_is_none() {
    let body = encode_records(&[Record::PublicIpNotification(notification("198.51.100.4"))]).unwrap();
    let addr = serve_once("200 OK", body).await;
    let resolver = HttpAddressResolver::new("http", "coordinator.test", addr.port(), Duration::from_secs(5))
        .without_proxy();

    assert!(resolver
        .public_ip(addr.ip(), IpVersion::V6)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn coordinator_literal_address_resolves_to_one_family() {
    let resolver = HttpAddressResolver::new("http", "127.0.0.1", 80, Duration::from_secs(5));
    let identity = resolver.coordinator_addresses("127.0.0.1").await.unwrap();

    assert_eq!(
        identity.address(IpVersion::V4),
        Some(IpAddr::from([127, 0, 0, 1]))
    );
    assert_eq!(identity.address(IpVersion::V6), None);
}
