use moss::config::Config;
use moss::k8s::types::{
    parse_ipv4, IpOwnership, Precedence, ResourceKey, ResourceKind, ResourceState, WorkloadEvent,
};
use moss::k8s::Workload;
use moss::lifecycle::Moss;
use moss::model::ConnectionRecord;
use moss::source::{ChannelSource, SocketSource};
use moss::MossError;
use moss_common::{role, ConnectionIdentifier, ConnectionThroughputStats, ConnectionTuple};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

fn test_config() -> Config {
    Config {
        metrics_address: "127.0.0.1".parse().unwrap(),
        metrics_port: 0,
        shutdown_grace_secs: 5,
        ..Config::default()
    }
}

fn pod(namespace: &str, name: &str, addr: &str) -> WorkloadEvent {
    WorkloadEvent::Applied(ResourceState::new(
        ResourceKey::new(ResourceKind::Pod, namespace, name),
        vec![IpOwnership {
            ip: parse_ipv4(addr).unwrap(),
            workload: Workload::pod(namespace, name),
            precedence: Precedence::PodIp,
        }],
    ))
}

fn record(src: (&str, u16), dst: (&str, u16), sent: u64, received: u64) -> ConnectionRecord {
    ConnectionRecord {
        identifier: ConnectionIdentifier {
            id: 42,
            pid: 3100,
            tuple: ConnectionTuple {
                src_ip: parse_ipv4(src.0).unwrap().0,
                dst_ip: parse_ipv4(dst.0).unwrap().0,
                src_port: src.1,
                dst_port: dst.1,
            },
            role: role::CLIENT,
        },
        stats: ConnectionThroughputStats {
            bytes_sent: sent,
            bytes_received: received,
            is_active: 1,
        },
    }
}

async fn sync_directory(events: &mpsc::Sender<WorkloadEvent>, objects: Vec<WorkloadEvent>) {
    for kind in ResourceKind::ALL {
        events.send(WorkloadEvent::RelistStarted(kind)).await.unwrap();
    }
    for object in objects {
        events.send(object).await.unwrap();
    }
    for kind in ResourceKind::ALL {
        events
            .send(WorkloadEvent::RelistCompleted(kind))
            .await
            .unwrap();
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn test_records_over_tcp_become_metrics() {
    let mut moss = Moss::new(test_config()).unwrap();
    let (events, events_rx) = mpsc::channel(64);
    moss.start_directory_writer(events_rx).unwrap();
    let metrics = moss.start_metrics().await.unwrap();

    let source = SocketSource::bind("127.0.0.1:0".parse().unwrap(), moss.correlator().stats())
        .await
        .unwrap();
    let ingest = source.local_addr().unwrap();
    moss.start_pipeline(Box::new(source));

    assert!(http_get(metrics, "/readyz").await.starts_with("HTTP/1.1 503"));

    sync_directory(
        &events,
        vec![
            pod("shop", "frontend", "10.244.0.5"),
            pod("shop", "db-0", "10.244.0.7"),
        ],
    )
    .await;
    moss.wait_ready(Duration::from_secs(5)).await.unwrap();
    assert!(http_get(metrics, "/readyz").await.starts_with("HTTP/1.1 200"));

    let mut stream = TcpStream::connect(ingest).await.unwrap();
    let mut payload = String::from("{\"truncated\":\n");
    for sent in [100, 250] {
        let r = record(("10.244.0.5", 45000), ("10.244.0.7", 5432), sent, 7);
        payload.push_str(&serde_json::to_string(&r).unwrap());
        payload.push('\n');
    }
    stream.write_all(payload.as_bytes()).await.unwrap();

    let aggregator = moss.aggregator();
    wait_for(|| {
        aggregator
            .snapshot()
            .first()
            .is_some_and(|s| s.bytes_sent == 250)
    })
    .await;

    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].link.client, Workload::pod("shop", "frontend"));
    assert_eq!(snapshot[0].link.server, Workload::pod("shop", "db-0"));
    assert_eq!(snapshot[0].link.server_port, 5432);
    assert_eq!(snapshot[0].bytes_received, 7);

    let body = http_get(metrics, "/metrics").await;
    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body.contains("moss_directory_ready 1"));
    assert!(body.contains("moss_records_total 2"));
    assert!(body.contains("moss_records_rejected_total{reason=\"undecodable\"} 1"));
    assert!(body
        .lines()
        .any(|l| l.starts_with("moss_link_bytes_sent_total{")
            && l.contains("server_name=\"db-0\"")
            && l.ends_with(" 250")));

    moss.stop().await;
}

#[tokio::test]
async fn test_unresolved_edge_upgrades_when_directory_catches_up() {
    let mut moss = Moss::new(test_config()).unwrap();
    let (events, events_rx) = mpsc::channel(64);
    moss.start_directory_writer(events_rx).unwrap();

    let (records, source) = ChannelSource::channel(16);
    moss.start_pipeline(Box::new(source));

    sync_directory(&events, vec![pod("shop", "frontend", "10.244.0.5")]).await;
    moss.wait_ready(Duration::from_secs(5)).await.unwrap();

    let aggregator = moss.aggregator();
    let server_ip = parse_ipv4("10.244.3.3").unwrap();

    records
        .send(record(("10.244.0.5", 45000), ("10.244.3.3", 80), 100, 0))
        .await
        .unwrap();
    wait_for(|| aggregator.link_count() == 1).await;
    assert_eq!(
        aggregator.snapshot()[0].link.server,
        Workload::Unknown { ip: server_ip }
    );

    events.send(pod("shop", "api-0", "10.244.3.3")).await.unwrap();
    let directory = moss.directory();
    wait_for(|| directory.resolve(server_ip) == Workload::pod("shop", "api-0")).await;

    records
        .send(record(("10.244.0.5", 45000), ("10.244.3.3", 80), 160, 0))
        .await
        .unwrap();
    wait_for(|| {
        aggregator
            .snapshot()
            .iter()
            .any(|s| s.link.server == Workload::pod("shop", "api-0"))
    })
    .await;

    // The unknown-keyed edge stays until the sweep finds it idle
    aggregator.sweep();
    let snapshot = aggregator.snapshot();
    assert_eq!(snapshot.len(), 2);

    let stale = snapshot
        .iter()
        .find(|s| s.link.server == Workload::Unknown { ip: server_ip })
        .unwrap();
    assert!(!stale.active);
    assert_eq!(stale.bytes_sent, 100);

    let resolved = snapshot
        .iter()
        .find(|s| s.link.server == Workload::pod("shop", "api-0"))
        .unwrap();
    assert!(resolved.active);
    assert_eq!(resolved.bytes_sent, 60);

    moss.stop().await;
}

#[test]
fn test_error_messages() {
    let err = MossError::WatchFailed {
        kind: "Endpoints",
        failures: 10,
        last_error: "connection refused".to_string(),
    };
    assert!(err.to_string().contains("Endpoints"));
    assert!(err.to_string().contains("10 times"));
}

#[test]
fn test_version_const() {
    assert!(!moss::VERSION.is_empty());
}
