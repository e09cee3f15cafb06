use crate::{
    connection::{Connection, ConnectionConfig},
    pool::Pool,
    request::Request,
    response::Response,
    types::ClientError,
};
use log::trace;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tokio_rustls::rustls::{self, OwnedTrustAnchor, RootCertStore};
use url::Url;

/// HTTP/2 client: one connection pool per `scheme://authority`, TLS with
/// the webpki roots, ALPN pinned to `h2`.
pub struct Client {
    rustls_config: Arc<rustls::ClientConfig>,
    config: ConnectionConfig,
    pools: Mutex<HashMap<String, Pool>>,
}

impl Client {
    #[must_use]
    pub fn with_config(config: ConnectionConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub async fn get(&self, url: Url) -> Result<Response, ClientError> {
        trace!("GET {url}");
        self.request(Request::get(&url)).await
    }

    /// Sends a request over a pooled connection. Refused streams and
    /// connections lost to graceful shutdown get one retry on a fresh
    /// connection.
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        match self.send_once(&request).await {
            Err(err) if err.is_retryable() => {
                trace!("retrying once after: {err}");
                self.send_once(&request).await
            }
            result => result,
        }
    }

    async fn send_once(&self, request: &Request) -> Result<Response, ClientError> {
        let connection = self.checkout(request).await?;
        connection.request(request.clone()).await
    }

    async fn checkout(&self, request: &Request) -> Result<Connection, ClientError> {
        let key = format!("{}://{}", request.scheme, request.authority);
        {
            let mut pools = self.pools.lock().await;
            if let Some(connection) = pools.entry(key.clone()).or_default().acquire() {
                return Ok(connection);
            }
        }
        // dial outside the lock; a slow handshake must not stall other hosts
        let url = Url::parse(&key).map_err(|err| ClientError::Url(err.to_string()))?;
        let connection =
            Connection::connect(&url, self.rustls_config.clone(), self.config.clone()).await?;
        self.pools
            .lock()
            .await
            .entry(key)
            .or_default()
            .insert(connection.clone());
        Ok(connection)
    }
}

impl Default for Client {
    fn default() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            rustls_config: Arc::new(config),
            config: ConnectionConfig::default(),
            pools: Mutex::new(HashMap::new()),
        }
    }
}
