use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hunter_core::{CoordinatorIdentity, IpVersion, PublicIpNotification, Record};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::fetcher::{fetch_records, FetchError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("DNS lookup of {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("public IP request via {via} failed: {source}")]
    Request {
        via: IpAddr,
        #[source]
        source: FetchError,
    },
    #[error("could not build HTTP client: {0}")]
    Client(String),
}

/// Determines which addresses the coordinator and this client have.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn coordinator_addresses(&self, host: &str) -> Result<CoordinatorIdentity, ResolveError>;

    /// Asks the coordinator, reached at `via`, which public address of family
    /// `version` this client has. `Ok(None)` means the family is unusable.
    async fn public_ip(
        &self,
        via: IpAddr,
        version: IpVersion,
    ) -> Result<Option<PublicIpNotification>, ResolveError>;
}

/// Resolves through DNS and the coordinator's public IP endpoint.
#[derive(Clone, Debug)]
pub struct HttpAddressResolver {
    scheme: String,
    host: String,
    port: u16,
    timeout: Duration,
    system_proxy: bool,
}

impl HttpAddressResolver {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            timeout,
            system_proxy: true,
        }
    }

    /// Connects directly even if proxy environment variables are set.
    pub fn without_proxy(mut self) -> Self {
        self.system_proxy = false;
        self
    }
}

#[async_trait]
impl AddressResolver for HttpAddressResolver {
    async fn coordinator_addresses(&self, host: &str) -> Result<CoordinatorIdentity, ResolveError> {
        let addrs = tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|source| ResolveError::Dns {
                host: host.to_string(),
                source,
            })?;
        let identity = CoordinatorIdentity::from_addrs(addrs.map(|a| a.ip()));
        debug!("coordinator {host} resolves to {identity:?}");
        Ok(identity)
    }

    async fn public_ip(
        &self,
        via: IpAddr,
        version: IpVersion,
    ) -> Result<Option<PublicIpNotification>, ResolveError> {
        // Pin the connection to `via` while keeping the hostname for TLS.
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .resolve(&self.host, SocketAddr::new(via, self.port));
        if !self.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| ResolveError::Client(e.to_string()))?;
        let url = format!("{}://{}:{}/getPublicIP.jsp", self.scheme, self.host, self.port);

        let records = fetch_records(&client, &url)
            .await
            .map_err(|source| ResolveError::Request { via, source })?;
        Ok(records.into_iter().find_map(|r| match r {
            Record::PublicIpNotification(n) if n.ip_version() == version => Some(n),
            _ => None,
        }))
    }
}

/// Remembers successful lookups of an inner resolver for a while.
pub struct CachingResolver<R> {
    inner: R,
    coordinator_validity: Duration,
    public_ip_validity: Duration,
    coordinators: Mutex<HashMap<String, (Instant, CoordinatorIdentity)>>,
    public_ips: Mutex<HashMap<(IpAddr, IpVersion), (Instant, PublicIpNotification)>>,
}

impl<R: AddressResolver> CachingResolver<R> {
    pub fn new(inner: R, coordinator_validity: Duration, public_ip_validity: Duration) -> Self {
        Self {
            inner,
            coordinator_validity,
            public_ip_validity,
            coordinators: Mutex::new(HashMap::new()),
            public_ips: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: AddressResolver> AddressResolver for CachingResolver<R> {
    async fn coordinator_addresses(&self, host: &str) -> Result<CoordinatorIdentity, ResolveError> {
        if let Some((at, identity)) = self.coordinators.lock().await.get(host) {
            if at.elapsed() < self.coordinator_validity {
                return Ok(*identity);
            }
        }
        let identity = self.inner.coordinator_addresses(host).await?;
        if !identity.is_empty() {
            self.coordinators
                .lock()
                .await
                .insert(host.to_string(), (Instant::now(), identity));
        }
        Ok(identity)
    }

    async fn public_ip(
        &self,
        via: IpAddr,
        version: IpVersion,
    ) -> Result<Option<PublicIpNotification>, ResolveError> {
        if let Some((at, notification)) = self.public_ips.lock().await.get(&(via, version)) {
            if at.elapsed() < self.public_ip_validity {
                return Ok(Some(notification.clone()));
            }
        }
        let found = self.inner.public_ip(via, version).await?;
        if let Some(n) = &found {
            self.public_ips
                .lock()
                .await
                .insert((via, version), (Instant::now(), n.clone()));
        }
        Ok(found)
    }
}
