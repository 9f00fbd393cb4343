use std::sync::{Arc, Mutex};
use std::time::Duration;

use tonic::transport::Endpoint;
use tonic_health::pb::health_check_response::ServingStatus as PbServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use super::*;
use crate::broker::{BrokerController, MockBroker};
use crate::resource::Resources;

fn context() -> BootContext {
    BootContext::new("transport-test", None, Resources::default())
}

fn loopback() -> TransportOptions {
    TransportOptions::new().listen("127.0.0.1:0")
}

fn recording_installer(name: &'static str, calls: &Arc<Mutex<Vec<&'static str>>>) -> HandlerInstaller {
    let calls = calls.clone();
    HandlerInstaller::new(name, move |_router, _ctx| {
        calls.lock().unwrap().push(name);
        Ok(())
    })
}

async fn check_health(addr: SocketAddr) -> i32 {
    let channel = Endpoint::from_shared(format!("http://{}", addr))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = HealthClient::new(channel);
    client
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap()
        .into_inner()
        .status
}

#[test]
fn test_transport_config_defaults() {
    let config = TransportConfig::default();
    assert_eq!(config.addr(), "0.0.0.0:3000");
    assert!(config.health);
    assert_eq!(config.listener_addresses("development"), vec!["0.0.0.0:3000"]);
}

#[test]
fn test_secondary_listener_only_in_matching_environment() {
    let config = TransportConfig {
        port: 8081,
        secondary: Some(SecondaryListenerConfig {
            address: "[::]:8080".to_string(),
            environments: default_secondary_environments(),
        }),
        ..Default::default()
    };

    assert_eq!(config.listener_addresses("staging"), vec!["0.0.0.0:8081"]);
    assert_eq!(
        config.listener_addresses("production"),
        vec!["0.0.0.0:8081", "[::]:8080"]
    );
    assert_eq!(config.listener_addresses("PROD").len(), 2);
}

#[tokio::test]
async fn test_no_installers_binds_nothing() {
    let mut running = TransportBootstrap::start(ServiceRouter::new(), &loopback(), &context())
        .await
        .unwrap();

    assert!(running.is_idle());
    assert!(running.local_addrs().is_empty());

    let failure = tokio::time::timeout(Duration::from_millis(50), running.next_failure()).await;
    assert!(failure.is_err(), "idle transport must never report a failure");
}

#[tokio::test]
async fn test_installers_run_in_order() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let options = loopback()
        .installer(recording_installer("first", &calls))
        .installer(recording_installer("second", &calls))
        .installer(recording_installer("third", &calls));

    let mut running = TransportBootstrap::start(ServiceRouter::new(), &options, &context())
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    assert_eq!(running.local_addrs().len(), 1);
    running.shutdown();
}

#[tokio::test]
async fn test_installer_failure_aborts_remaining() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let options = loopback()
        .installer(recording_installer("first", &calls))
        .installer(HandlerInstaller::new("broken", |_router, _ctx| {
            Err("route table unavailable".into())
        }))
        .installer(recording_installer("third", &calls));

    let result = TransportBootstrap::start(ServiceRouter::new(), &options, &context()).await;

    match result {
        Err(TransportError::Installer { name, .. }) => assert_eq!(name, "broken"),
        other => panic!("expected installer failure, got {:?}", other.map(|_| ())),
    }
    assert_eq!(*calls.lock().unwrap(), vec!["first"]);
}

#[tokio::test]
async fn test_broker_gated_installer_fails_without_broker() {
    let broker = Arc::new(MockBroker::new());
    broker.sever();
    let ctx = BootContext::new(
        "transport-test",
        Some(BrokerController::new(broker)),
        Resources::default(),
    );
    let options = loopback().installer(HandlerInstaller::new("events", |_router, ctx| {
        ctx.require_broker()?;
        Ok(())
    }));

    let result = TransportBootstrap::start(ServiceRouter::new(), &options, &ctx).await;

    assert!(matches!(result, Err(TransportError::Installer { .. })));
}

#[test]
fn test_duplicate_prefix_rejected() {
    let (_, first) = tonic_health::server::health_reporter();
    let (_, second) = tonic_health::server::health_reporter();
    let mut router = ServiceRouter::new();

    router.add_service(first).unwrap();
    let result = router.add_service(second);

    assert!(matches!(
        result,
        Err(TransportError::DuplicateRoute(prefix)) if prefix == "/grpc.health.v1.Health/"
    ));
    assert_eq!(router.prefixes().len(), 1);
}

#[tokio::test]
async fn test_health_service_answers() {
    let (installer, _reporter) = health_installer();
    let options = loopback().installer(installer);

    let mut running = TransportBootstrap::start(ServiceRouter::new(), &options, &context())
        .await
        .unwrap();
    let addr = running.local_addrs()[0];

    assert_eq!(check_health(addr).await, PbServingStatus::Serving as i32);
    running.shutdown();
}

#[tokio::test]
async fn test_health_status_follows_reporter() {
    let (installer, reporter) = health_installer();
    let options = loopback().installer(installer);

    let mut running = TransportBootstrap::start(ServiceRouter::new(), &options, &context())
        .await
        .unwrap();
    let addr = running.local_addrs()[0];

    health::set_status(&reporter, tonic_health::ServingStatus::NotServing).await;

    assert_eq!(check_health(addr).await, PbServingStatus::NotServing as i32);
    running.shutdown();
}

#[tokio::test]
async fn test_two_listeners_share_router() {
    let (installer, _reporter) = health_installer();
    let options = TransportOptions::new()
        .listen("127.0.0.1:0")
        .listen("127.0.0.1:0")
        .installer(installer);

    let mut running = TransportBootstrap::start(ServiceRouter::new(), &options, &context())
        .await
        .unwrap();
    let addrs = running.local_addrs().to_vec();

    assert_eq!(addrs.len(), 2);
    assert_ne!(addrs[0], addrs[1]);
    for addr in addrs {
        assert_eq!(check_health(addr).await, PbServingStatus::Serving as i32);
    }
    running.shutdown();
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = taken.local_addr().unwrap().to_string();
    let (installer, _reporter) = health_installer();
    let options = TransportOptions::new()
        .listen("127.0.0.1:0")
        .listen(address.clone())
        .installer(installer);

    let result = TransportBootstrap::start(ServiceRouter::new(), &options, &context()).await;

    match result {
        Err(TransportError::Bind { address: failed, .. }) => assert_eq!(failed, address),
        other => panic!("expected bind failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_installers_without_listeners() {
    let (installer, _reporter) = health_installer();
    let options = TransportOptions::new().installer(installer);

    let result = TransportBootstrap::start(ServiceRouter::new(), &options, &context()).await;

    assert!(matches!(result, Err(TransportError::NoListeners)));
}

#[cfg(feature = "metrics")]
async fn scrape(addr: SocketAddr) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        super::metrics::METRICS_PATH,
        addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[cfg(feature = "metrics")]
#[test]
fn test_duplicate_metrics_route_rejected() {
    let handle = super::metrics::prometheus_handle().unwrap();
    let mut router = ServiceRouter::new();
    router.add_metrics(handle.clone()).unwrap();

    let result = router.add_metrics(handle);

    assert!(matches!(result, Err(TransportError::DuplicateRoute(p)) if p == "/metrics"));
    assert!(router.serves_http1());
}

#[cfg(feature = "metrics")]
#[tokio::test]
async fn test_metrics_scraped_beside_grpc() {
    let (health, _reporter) = health_installer();
    let options = loopback().installer(health).installer(metrics_installer());

    let mut running = TransportBootstrap::start(ServiceRouter::new(), &options, &context())
        .await
        .unwrap();
    let addr = running.local_addrs()[0];
    super::metrics::record_publish("scrapeExchange", false);

    let response = scrape(addr).await;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(super::metrics::BROKER_PUBLISH_TOTAL));
    assert!(response.contains(r#"exchange="scrapeExchange""#));
    assert_eq!(check_health(addr).await, PbServingStatus::Serving as i32);
    running.shutdown();
}
