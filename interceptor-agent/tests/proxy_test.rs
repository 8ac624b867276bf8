use interceptor_agent::ca::CertificateAuthority;
use interceptor_agent::proxy::ProxyServer;
use interceptor_core::{
    InterceptService, InterceptorConfig, ProxyMode, SessionRecorder, TrafficEvent, TrafficMonitor,
};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;

fn test_ca() -> CertificateAuthority {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Interceptor Test CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let cert = Certificate::from_params(params).unwrap();
    CertificateAuthority::from_pem(&cert.serialize_pem().unwrap(), &cert.serialize_private_key_pem())
        .unwrap()
}

fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn send_through_proxy(addr: SocketAddr, raw_request: &str) -> String {
    let mut stream = None;
    for _ in 0..50 {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    let mut stream = stream.expect("proxy did not start");
    stream.write_all(raw_request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("proxy response timed out")
        .unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn test_proxy_serves_mock_and_publishes_event() {
    let dir = tempfile::tempdir().unwrap();
    let config = InterceptorConfig {
        rules_path: dir.path().join("interceptor.config.yaml"),
        blacklist_path: dir.path().join("domain_blacklist.txt"),
        transcript_path: None,
        ..InterceptorConfig::default()
    };
    std::fs::write(
        &config.rules_path,
        "example.com:\n  content: intercepted\n  headers:\n    X-Intercepted: true\n",
    )
    .unwrap();

    let (trace_tx, trace_rx) = mpsc::channel(16);
    let service = Arc::new(InterceptService::new(
        &config,
        SessionRecorder::new(ProxyMode::Minimal).with_trace(trace_tx),
    ));
    let mut sub = service.bus().subscribe();

    let stop_monitor = CancellationToken::new();
    let stop_proxy = CancellationToken::new();
    let monitor = TrafficMonitor::new(service.bus().clone(), stop_monitor.clone())
        .spawn(ReceiverStream::new(trace_rx).map(Ok::<_, std::io::Error>));
    service.start_session();

    let addr = free_addr();
    let server = ProxyServer::new(addr, test_ca(), service.clone()).with_cache_size(10);

    let client = async {
        let response = send_through_proxy(
            addr,
            "GET http://example.com/hello HTTP/1.1\r\nHost: example.com\r\nUser-Agent: Mozilla/5.0 Firefox/121.0\r\nConnection: close\r\n\r\n",
        )
        .await;
        stop_proxy.cancel();
        response
    };

    let (served, response) = tokio::join!(server.run(stop_proxy.clone().cancelled_owned()), client);
    served.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.to_ascii_lowercase().contains("x-intercepted: true"), "{}", response);
    assert!(response.ends_with("intercepted"), "{}", response);

    let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        TrafficEvent::Request(req) => {
            assert_eq!(req.method, "GET");
            assert_eq!(req.url, "http://example.com/hello");
            assert_eq!(req.client_label.as_deref(), Some("Firefox"));
            assert_eq!(req.matched_rule.as_deref(), Some("example.com"));
        }
        other => panic!("unexpected {:?}", other),
    }

    stop_monitor.cancel();
    monitor.await.unwrap();
    let metrics = service.metrics().snapshot();
    assert_eq!(metrics.intercepted, 1);
    assert!(!service.bus().current_state().running);
}
