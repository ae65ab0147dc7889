//! In-process proxy harness for the integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bifrost::config::{ListenerConfig, ServiceConfig};
use bifrost::router::capabilities_for;
use bifrost::server::{Endpoint, Server, ServerStatus};
use bifrost::service::{Listener, Registry, Service, ServiceTargets};
use bifrost::session::{Session, SessionRegistry};
use tokio::net::TcpListener;

use super::MysqlTestConfig;

static SESSION_IDS: AtomicU64 = AtomicU64::new(1000);

/// Spawn a proxy with one backend acting as both master and (fallback)
/// read target; returns the port it listens on.
pub async fn spawn_proxy(mysql: &MysqlTestConfig, router: &str) -> u16 {
    let registry = Arc::new(Registry::new());
    let sessions = Arc::new(SessionRegistry::new());

    let server = Server::new(
        "test-backend",
        Endpoint::tcp(mysql.host.clone(), mysql.port),
    );
    server.set_status(ServerStatus::RUNNING | ServerStatus::MASTER);
    registry.add_server(server.clone());

    let params: ServiceConfig = toml::from_str(&format!(
        r#"
        router = "{}"
        user = "{}"
        password = "{}"
        transaction_replay = true
    "#,
        router, mysql.user, mysql.password
    ))
    .expect("service config");

    let service = Service::new(
        "test-service",
        params,
        ServiceTargets::Servers(vec![server]),
        capabilities_for(router),
    );
    registry.add_service(service.clone());

    let listener_config: ListenerConfig = toml::from_str(
        r#"
        service = "test-service"
        address = "127.0.0.1"
        port = 0
    "#,
    )
    .expect("listener config");
    let listener = Listener::new("test-listener", listener_config, service);
    registry.add_listener(listener.clone());

    let tcp = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = tcp.local_addr().expect("local addr").port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = tcp.accept().await else {
                break;
            };
            let id = SESSION_IDS.fetch_add(1, Ordering::SeqCst);
            let session = Session::new(
                id,
                listener.clone(),
                registry.clone(),
                sessions.clone(),
                peer.ip().to_string(),
            );
            tokio::spawn(async move {
                let _ = session.run(stream).await;
            });
        }
    });

    port
}
