use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use bifrost::config::{self, Config};
use bifrost::filter::{build_filter, FilterDef};
use bifrost::metrics::metrics;
use bifrost::monitor::spawn_monitor;
use bifrost::router::capabilities_for;
use bifrost::server::{Endpoint, Server};
use bifrost::service::{Listener, ListenerState, Registry, Service, ServiceTargets};
use bifrost::session::{Session, SessionRegistry};

/// Global counter for session (thread) ids
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Grace period for open sessions on shutdown
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config();
    let registry = Arc::new(Registry::new());
    let sessions_registry = Arc::new(SessionRegistry::new());

    bootstrap(&config, &registry)?;

    info!(
        servers = registry.servers().len(),
        services = registry.services().len(),
        listeners = registry.listeners().len(),
        "Object graph bootstrapped"
    );

    let mut sessions: JoinSet<()> = JoinSet::new();
    let (accept_tx, mut accept_rx) =
        tokio::sync::mpsc::channel::<(tokio::net::TcpStream, std::net::SocketAddr, Arc<Listener>)>(64);

    // One accept task per listener
    for listener in registry.listeners() {
        let addr = listener.bind_address();
        let tcp = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(listener = %listener.name, addr = %addr, error = %e, "Failed to bind");
                continue;
            }
        };
        listener.set_state(ListenerState::Listening);
        info!(listener = %listener.name, addr = %addr, service = %listener.service.name, "Listening");

        let tx = accept_tx.clone();
        let listener = listener.clone();
        tokio::spawn(async move {
            loop {
                match tcp.accept().await {
                    Ok((stream, peer)) => {
                        if tx.send((stream, peer, listener.clone())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(listener = %listener.name, error = %e, "Accept failed");
                    }
                }
            }
        });
    }
    drop(accept_tx);

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }

            accepted = accept_rx.recv() => {
                let Some((stream, peer, listener)) = accepted else { break };
                let session_id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let registry = registry.clone();
                let sessions_registry = sessions_registry.clone();

                info!(session_id, peer = %peer, listener = %listener.name, "New connection");
                metrics().sessions_active.inc();

                sessions.spawn(async move {
                    stream.set_nodelay(true).ok();
                    let session = Session::new(
                        session_id,
                        listener,
                        registry,
                        sessions_registry,
                        peer.ip().to_string(),
                    );
                    if let Err(e) = session.run(stream).await {
                        warn!(session_id, error = %e, "Session ended with error");
                    }
                    metrics().sessions_active.dec();
                });
            }
        }
    }

    // Stop monitors before draining sessions
    for monitor in registry.monitors() {
        monitor.stop();
    }

    let active = sessions.len();
    if active > 0 {
        info!(
            active_sessions = active,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "Waiting for active sessions"
        );

        let deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
        loop {
            if sessions.is_empty() {
                info!("All sessions completed gracefully");
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(remaining = sessions.len(), "Graceful shutdown timeout, aborting sessions");
                    sessions.abort_all();
                    break;
                }
                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
            }
        }
    }

    info!("Bifrost shutdown complete");
    Ok(())
}

/// Build the object graph from the bootstrap config
fn bootstrap(config: &Config, registry: &Arc<Registry>) -> anyhow::Result<()> {
    for (name, sc) in &config.servers {
        let endpoint = match &sc.socket {
            Some(socket) => Endpoint::Unix {
                socket: socket.clone(),
            },
            None => Endpoint::tcp(sc.host.clone(), sc.port),
        };
        let server = Server::new(name.clone(), endpoint);
        server.set_rank(sc.rank);
        server.set_weight(sc.weight);
        registry.add_server(server);
    }

    for (name, mc) in &config.monitors {
        let mut servers = Vec::new();
        for sname in &mc.servers {
            match registry.server(sname) {
                Some(s) => {
                    if let Some(other) = registry.monitor_of_server(sname) {
                        anyhow::bail!(
                            "Server '{}' appears in monitors '{}' and '{}'",
                            sname,
                            other,
                            name
                        );
                    }
                    servers.push(s);
                }
                None => anyhow::bail!("Monitor '{}' references unknown server '{}'", name, sname),
            }
        }
        let handle = spawn_monitor(name.clone(), mc.clone(), servers);
        registry.add_monitor(handle);
    }

    for (name, fc) in &config.filters {
        let def = FilterDef {
            name: name.clone(),
            module: fc.module.clone(),
            parameters: fc.parameters.clone(),
        };
        build_filter(&def).map_err(|e| anyhow::anyhow!(e))?;
        registry.add_filter(def);
    }

    for (name, sc) in &config.services {
        if !sc.servers.is_empty() && sc.cluster.is_some() {
            anyhow::bail!(
                "Service '{}' declares both explicit servers and a cluster",
                name
            );
        }
        let targets = match &sc.cluster {
            Some(monitor) => {
                if registry.monitor(monitor).is_none() {
                    anyhow::bail!("Service '{}' references unknown monitor '{}'", name, monitor);
                }
                ServiceTargets::Cluster(monitor.clone())
            }
            None => {
                let mut servers = Vec::new();
                for sname in &sc.servers {
                    match registry.server(sname) {
                        Some(s) => servers.push(s),
                        None => {
                            anyhow::bail!("Service '{}' references unknown server '{}'", name, sname)
                        }
                    }
                }
                ServiceTargets::Servers(servers)
            }
        };

        let service = Service::new(name.clone(), sc.clone(), targets, capabilities_for(&sc.router));

        let mut chain = Vec::new();
        for fname in &sc.filters {
            let def = registry
                .filter(fname)
                .ok_or_else(|| anyhow::anyhow!("Service '{}' references unknown filter '{}'", name, fname))?;
            let filter = build_filter(&def).map_err(|e| anyhow::anyhow!(e))?;
            chain.push((def, filter));
        }
        service.set_filters(chain);
        registry.add_service(service);
    }

    for (name, lc) in &config.listeners {
        let service = registry.service(&lc.service).ok_or_else(|| {
            anyhow::anyhow!("Listener '{}' references unknown service '{}'", name, lc.service)
        })?;
        registry.add_listener(Listener::new(name.clone(), lc.clone(), service));
    }

    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/bifrost.toml", "bifrost.toml", "/etc/bifrost/bifrost.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
