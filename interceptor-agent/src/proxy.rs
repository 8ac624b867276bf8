use crate::ca::CertificateAuthority;
use crate::error::Result;
use crate::handlers::InterceptHandler;
use hudsucker::ProxyBuilder;
use interceptor_core::{InterceptorError, TrafficHook};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// MITM proxy whose exchanges all go through one [`TrafficHook`]
pub struct ProxyServer {
    addr: SocketAddr,
    ca: CertificateAuthority,
    cache_size: u64,
    hook: Arc<dyn TrafficHook>,
}

impl ProxyServer {
    pub fn new(addr: SocketAddr, ca: CertificateAuthority, hook: Arc<dyn TrafficHook>) -> Self {
        Self {
            addr,
            ca,
            cache_size: 1000,
            hook,
        }
    }

    /// Leaf certificates kept by the signing cache
    pub fn with_cache_size(mut self, cache_size: u64) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let authority = self.ca.authority(self.cache_size)?;

        let proxy = ProxyBuilder::new()
            .with_addr(self.addr)
            .with_rustls_client()
            .with_ca(authority)
            .with_http_handler(InterceptHandler::new(self.hook))
            .build();

        info!("Starting proxy server on {}", self.addr);
        proxy
            .start(shutdown)
            .await
            .map_err(|e| InterceptorError::Network(format!("Proxy failed: {}", e)))?;

        info!("Proxy server stopped");
        Ok(())
    }
}
