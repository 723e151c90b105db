//! The HTTP server and its startup errors.

use std::io;
use std::net::{SocketAddr, TcpListener};

use axum::http::{HeaderValue, header};
use tandem_config::{Config, ConfigError};
use tandem_system::ShutdownHandle;
use tower::ServiceBuilder;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::endpoints;
use crate::service::ServiceState;

/// The value of the `Server` header on all responses.
const SERVER: &str = concat!("tandem/", env!("CARGO_PKG_VERSION"));

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failed.
    #[error("bind to interface failed")]
    BindFailed(#[from] io::Error),

    /// The HTTP client for the collector could not be created.
    #[error("could not create the upstream http client")]
    HttpClient(#[source] reqwest::Error),

    /// The configuration is incomplete or invalid.
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
}

/// Builds the axum application with all routes and middleware.
fn make_app(state: ServiceState) -> axum::Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER),
        ));

    endpoints::routes(state.config())
        .layer(middleware)
        .with_state(state)
}

fn listen(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// The HTTP server accepting message halves.
///
/// The listener is bound on construction, so that bind failures surface during startup. The
/// server stops accepting connections on shutdown and finishes open requests.
#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    state: ServiceState,
}

impl HttpServer {
    /// Binds the listener configured in `server.host` and `server.port`.
    pub fn new(config: &Config, state: ServiceState) -> Result<Self, ServerError> {
        let listener = listen(config.listen_addr())?;
        Ok(Self { listener, state })
    }

    /// Returns the address the server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves requests until a shutdown is requested.
    pub async fn serve(self, mut shutdown_handle: ShutdownHandle) -> io::Result<()> {
        let listener = tokio::net::TcpListener::from_std(self.listener)?;
        let addr = listener.local_addr()?;

        tandem_log::info!("spawning http server");
        tandem_log::info!("  listening on http://{addr}/");

        let app = make_app(self.state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_handle.notified().await;
                tandem_log::info!("shutting down http server");
            })
            .await
    }
}
