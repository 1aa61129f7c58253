pub mod dispatcher;
pub mod operator;
pub mod wireguard;

use std::io::BufReader;
use std::sync::Arc;

use axum::routing::{any, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::agents::registry::AgentRegistry;
use crate::commands::CommandTable;
use crate::config::{RuntimeConfig, Workspace};
use crate::crypto::ca::{verify_leaf, CaVerifier};
use crate::kcp::{kcp_tun_server, KcpTunConfig};
use crate::net::portfwd::PortFwdTable;
use crate::net::sshd::SshdTable;
use crate::net::StreamTable;
use self::operator::OperatorTable;

use crate::{C2Error, Result};

/// Process-wide shared state. Initialized before the first listener starts;
/// lives for the process lifetime.
pub struct SharedState {
    pub config: RuntimeConfig,
    pub workspace: Workspace,
    pub registry: AgentRegistry,
    pub commands: Arc<CommandTable>,
    pub streams: StreamTable,
    pub portfwds: PortFwdTable,
    pub sshd: SshdTable,
    pub operators: OperatorTable,
    pub ca: CaVerifier,
    /// Process-wide shutdown
    pub cancel: CancellationToken,
}

pub type Cc = Arc<SharedState>;

pub struct C2Server {
    cc: Cc,
}

impl C2Server {
    pub fn new(workspace: Workspace, config: RuntimeConfig) -> Result<Self> {
        let ca = CaVerifier::from_pem_file(&workspace.ca_cert)?;

        // the server leaf must be ours
        let ca_pem = std::fs::read(&workspace.ca_cert)?;
        let leaf_pem = std::fs::read(&workspace.server_cert)?;
        verify_leaf(&ca_pem, &leaf_pem)?;

        let cc = Arc::new(SharedState {
            config,
            workspace,
            registry: AgentRegistry::new(),
            commands: Arc::new(CommandTable::new()),
            streams: StreamTable::new(),
            portfwds: PortFwdTable::new(),
            sshd: SshdTable::new(),
            operators: OperatorTable::new(),
            ca,
            cancel: CancellationToken::new(),
        });
        Ok(Self { cc })
    }

    pub fn state(&self) -> Cc {
        self.cc.clone()
    }

    /// TLS with mandatory client-certificate verification against our CA,
    /// ALPN pinned to HTTP/2.
    fn tls_config(&self) -> Result<RustlsConfig> {
        let ws = &self.cc.workspace;

        let mut ca_reader = BufReader::new(std::fs::File::open(&ws.ca_cert)?);
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca_reader) {
            roots
                .add(cert?)
                .map_err(|e| C2Error::Tls(format!("CA root: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| C2Error::Tls(format!("client verifier: {e}")))?;

        let mut cert_reader = BufReader::new(std::fs::File::open(&ws.server_cert)?);
        let certs = rustls_pemfile::certs(&mut cert_reader).collect::<std::result::Result<Vec<_>, _>>()?;
        let mut key_reader = BufReader::new(std::fs::File::open(&ws.server_key)?);
        let key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or_else(|| C2Error::Tls("no private key found".to_string()))?;

        let mut tls = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| C2Error::Tls(e.to_string()))?;
        tls.alpn_protocols = vec![b"h2".to_vec()];
        Ok(RustlsConfig::from_config(Arc::new(tls)))
    }

    fn router(&self) -> Router {
        let root = &self.cc.config.web_root;
        Router::new()
            .route(
                &format!("/{root}/op/{{api}}/{{token}}"),
                post(operator::operation_dispatcher),
            )
            .route(
                &format!("/{root}/{{api}}/{{token}}"),
                any(dispatcher::api_dispatcher),
            )
            .with_state(self.cc.clone())
    }

    pub async fn run(self) -> Result<()> {
        let cc = self.cc.clone();
        cc.commands.spawn_sweeper(cc.cancel.child_token());

        // KCP fallback transport tunnels agents to the HTTP/2 listener
        {
            let mut kcp = KcpTunConfig::new(
                "",
                &format!("127.0.0.1:{}", cc.config.cc_port),
                "0",
                &cc.config.password,
            );
            kcp.listen = cc.config.kcp_listen.clone();
            let magic = cc.config.magic_string.clone();
            let cancel = cc.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = kcp_tun_server(kcp, &magic, cancel).await {
                    tracing::error!("KCP transport: {e}");
                }
            });
        }

        let tls = self.tls_config()?;
        let addr: std::net::SocketAddr = ([0, 0, 0, 0], cc.config.cc_port).into();
        let app = self.router();
        let handle = Handle::new();

        tracing::info!(
            "C2 listening on {addr} (web root /{}, KCP on {})",
            cc.config.web_root,
            cc.config.kcp_listen
        );

        let server = axum_server::bind_rustls(addr, tls)
            .handle(handle.clone())
            .serve(app.into_make_service());

        let result = tokio::select! {
            served = server => served.map_err(C2Error::Io),
            _ = signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                Ok(())
            }
            _ = cc.cancel.cancelled() => Ok(()),
        };

        cc.cancel.cancel();
        handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        if let Err(e) = cc.registry.save_labels(&cc.workspace.agents_json) {
            tracing::warn!("labels: {e}");
        }
        tracing::info!("server shutdown complete");
        result
    }
}
