//! UpCloud CSI plugin server.
//!
//! Serves the CSI identity service together with the controller, the node
//! or both over a Unix domain socket, and a health endpoint over TCP.

#[macro_use]
extern crate tracing;

use std::{
    fs,
    io::ErrorKind,
    net::SocketAddr,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use snafu::ResultExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UnixListener,
};
use tonic::transport::{server::Connected, Server};
use tracing_subscriber::EnvFilter;
use upcloud::Api;

use csi::{
    config::{
        self,
        Account,
        ApiClient,
        Config,
        ConfigError,
        HealthListen,
        Listen,
        Serve,
        ServerLookup,
        Signal,
    },
    controller::Controller,
    csi::{
        controller_server::ControllerServer,
        identity_server::IdentityServer,
        node_server::NodeServer,
    },
    filesystem::LinuxFilesystem,
    health,
    identity::{Identity, Readiness},
    node::Node,
    service::{Service, UpCloudService},
    shutdown,
};

#[derive(Debug)]
struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

fn remove_socket(endpoint: &Path) {
    match fs::remove_file(endpoint) {
        Ok(()) => debug!("Removed socket {}", endpoint.display()),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => {
            warn!("Failed to remove socket {}: {}", endpoint.display(), error)
        }
    }
}

fn bind_socket(endpoint: &Path) -> Result<UnixListener, ConfigError> {
    remove_socket(endpoint);
    let name = endpoint.display().to_string();
    if let Some(parent) = endpoint.parent() {
        fs::create_dir_all(parent).context(Listen {
            endpoint: name.clone(),
        })?;
    }
    let listener = UnixListener::bind(endpoint).context(Listen {
        endpoint: name.clone(),
    })?;
    info!("CSI plugin bound to {}", name);
    Ok(listener)
}

fn probe_filesystems(fs_types: &[String]) {
    for fs_type in fs_types {
        let program = format!("mkfs.{}", fs_type);
        match which::which(&program) {
            Ok(path) => debug!("Found {} at {}", program, path.display()),
            Err(_) => warn!(
                "{} is not installed, volumes with {} filesystem can not be staged",
                program, fs_type
            ),
        }
    }
}

async fn resolve_zone(
    config: &Config,
    service: Option<&Arc<dyn Service>>,
) -> Result<String, ConfigError> {
    if let Some(zone) = &config.zone {
        return Ok(zone.clone());
    }
    let service = match service {
        Some(service) => service,
        None => {
            return Err(ConfigError::ZoneUnresolved {
                hostname: config.node_host.clone(),
                reason: "API credentials are not configured".into(),
            })
        }
    };
    let server = service
        .get_server_by_hostname(&config.node_host)
        .await
        .context(ServerLookup {
            hostname: config.node_host.clone(),
        })?;
    if server.zone.is_empty() {
        return Err(ConfigError::ZoneUnresolved {
            hostname: config.node_host.clone(),
            reason: "server reports no zone".into(),
        });
    }
    info!("Node {} is in zone {}", config.node_host, server.zone);
    Ok(server.zone.clone())
}

async fn run(config: Config) -> Result<(), ConfigError> {
    let service: Option<Arc<dyn Service>> = match config.credentials() {
        Some((username, password)) => {
            let client =
                upcloud::Client::new(&config.api_url, username, password)
                    .context(ApiClient)?;
            if config.mode.has_controller() {
                let account = client.get_account().await.context(Account)?;
                info!("Using API account {}", account.username);
            }
            let service: Arc<dyn Service> =
                Arc::new(UpCloudService::new(Arc::new(client)));
            Some(service)
        }
        None if config.mode.has_controller() => {
            return Err(ConfigError::MissingCredentials {
                mode: config.mode,
            })
        }
        None => None,
    };

    let zone = resolve_zone(&config, service.as_ref()).await?;

    let readiness = Readiness::default();
    let identity = Identity::new(&config.driver_name, readiness.clone());
    let controller = match &service {
        Some(service) if config.mode.has_controller() => Some(Controller::new(
            service.clone(),
            &zone,
            config.labels.clone(),
            config.max_volumes_per_node,
        )),
        _ => None,
    };
    let node = if config.mode.has_node() {
        probe_filesystems(&config.fs_types);
        let fs = LinuxFilesystem::new(config.fs_types.clone());
        Some(Node::new(
            &config.node_host,
            &zone,
            config.max_volumes_per_node,
            Arc::new(fs),
        ))
    } else {
        None
    };

    let listener = bind_socket(&config.endpoint)?;
    let incoming = async_stream::stream! {
        loop {
            let item = listener
                .accept()
                .await
                .map(|(stream, _)| UnixStream(stream));
            yield item;
        }
    };
    let health_server = hyper::Server::try_bind(&config.address).context(
        HealthListen {
            address: config.address,
        },
    )?;

    let (trigger, stopped) = shutdown::channel();
    let health = tokio::spawn(health::serve(
        health_server,
        readiness.clone(),
        stopped.clone(),
    ));

    let builder = Server::builder().add_service(IdentityServer::new(identity));
    let signal = stopped.wait();
    let grpc = async move {
        match (controller, node) {
            (Some(controller), Some(node)) => {
                builder
                    .add_service(ControllerServer::new(controller))
                    .add_service(NodeServer::new(node))
                    .serve_with_incoming_shutdown(incoming, signal)
                    .await
            }
            (Some(controller), None) => {
                builder
                    .add_service(ControllerServer::new(controller))
                    .serve_with_incoming_shutdown(incoming, signal)
                    .await
            }
            (None, Some(node)) => {
                builder
                    .add_service(NodeServer::new(node))
                    .serve_with_incoming_shutdown(incoming, signal)
                    .await
            }
            (None, None) => {
                builder.serve_with_incoming_shutdown(incoming, signal).await
            }
        }
    };
    tokio::pin!(grpc);

    readiness.set_ready(true);
    info!(
        "{} {} ready in {} mode (zone {}, node {})",
        config.driver_name,
        env!("CARGO_PKG_VERSION"),
        config.mode,
        zone,
        config.node_host
    );

    let result = tokio::select! {
        result = &mut grpc => result,
        signal = shutdown::signalled() => {
            let name = signal.context(Signal)?;
            info!("Received {}, shutting down", name);
            readiness.set_ready(false);
            trigger.fire();
            grpc.await
        }
    };

    readiness.set_ready(false);
    trigger.fire();
    match health.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!("Health endpoint failed: {}", error),
        Err(error) => error!("Health endpoint task failed: {}", error),
    }
    remove_socket(&config.endpoint);
    result.context(Serve)
}

#[tokio::main]
async fn main() {
    let matches = config::app().get_matches();
    let config = match Config::from_matches(&matches) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Invalid configuration: {}", error);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(error) = run(config).await {
        error!("{}", error);
        std::process::exit(1);
    }
}
