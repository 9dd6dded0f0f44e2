//! Production provider for Outlook.com / Microsoft 365 mailboxes

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use super::{graph, imap, oauth, Credentials, MailProvider};
use crate::config::ProviderConfig;
use crate::error::{Result, SyncError};
use crate::models::{FetchedMessage, Folder, Protocol, TokenGrant};
use crate::rate_limiter::{RequestCost, RequestRateLimiter};

/// Rate-limited provider speaking OAuth, Graph and IMAP
///
/// One `reqwest::Client` is kept per outbound proxy so connection pools are
/// never shared between proxies.
pub struct OutlookProvider {
    config: ProviderConfig,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
    limiter: RequestRateLimiter,
    imap_pool: imap::ImapWorkerPool,
}

impl OutlookProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let limiter = RequestRateLimiter::new(&config.rate_limit);
        let imap_pool = imap::ImapWorkerPool::new(config.imap_workers);
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
            limiter,
            imap_pool,
        }
    }

    pub fn rate_limiter(&self) -> &RequestRateLimiter {
        &self.limiter
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    fn http_client(&self, proxy: Option<&str>) -> Result<reqwest::Client> {
        let key = proxy.map(str::to_string);
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout())
            .connect_timeout(self.timeout());
        if let Some(url) = proxy {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| SyncError::ProxyTransport(format!("invalid proxy {}: {}", url, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        debug!("Created HTTP client for proxy {:?}", proxy);
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn imap_target(&self, credentials: &Credentials) -> Result<imap::ImapTarget> {
        let endpoint = self.config.imap_endpoint(credentials.protocol).ok_or_else(|| {
            SyncError::Protocol(format!("{} is not an IMAP protocol", credentials.protocol))
        })?;
        Ok(imap::ImapTarget {
            host: endpoint.host.clone(),
            port: endpoint.port,
            email: credentials.email.clone(),
            access_token: credentials.access_token.clone(),
            proxy: credentials.proxy.clone(),
            timeout: self.timeout(),
        })
    }

    #[cfg(test)]
    fn cached_clients(&self) -> usize {
        self.clients.lock().map(|clients| clients.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MailProvider for OutlookProvider {
    async fn refresh_token(
        &self,
        protocol: Protocol,
        client_id: &str,
        refresh_token: &str,
        proxy: Option<String>,
    ) -> Result<TokenGrant> {
        let client = self.http_client(proxy.as_deref())?;
        let (token_url, scope) = self.config.token_endpoint(protocol);

        self.limiter.acquire(RequestCost::TokenExchange).await;
        oauth::exchange_refresh_token(
            &client,
            token_url,
            scope,
            client_id,
            refresh_token,
            proxy.is_some(),
        )
        .await
    }

    async fn fetch_messages(
        &self,
        credentials: &Credentials,
        folder: Folder,
        limit: usize,
    ) -> Result<Vec<FetchedMessage>> {
        match credentials.protocol {
            Protocol::Graph => {
                let client = self.http_client(credentials.proxy.as_deref())?;
                self.limiter.acquire(RequestCost::RestCall).await;
                graph::list_messages(
                    &client,
                    &self.config.graph_base,
                    &credentials.access_token,
                    folder,
                    limit,
                    credentials.proxy.is_some(),
                )
                .await
            }
            Protocol::ImapNew | Protocol::ImapOld => {
                let target = self.imap_target(credentials)?;
                self.limiter.acquire(RequestCost::ImapSession).await;
                self.imap_pool
                    .run(move || imap::fetch_messages(&target, folder, limit))
                    .await
            }
        }
    }

    async fn get_unread_count(&self, credentials: &Credentials) -> Result<u32> {
        match credentials.protocol {
            Protocol::Graph => {
                let client = self.http_client(credentials.proxy.as_deref())?;
                self.limiter.acquire(RequestCost::RestCall).await;
                graph::unread_count(
                    &client,
                    &self.config.graph_base,
                    &credentials.access_token,
                    credentials.proxy.is_some(),
                )
                .await
            }
            Protocol::ImapNew | Protocol::ImapOld => {
                let target = self.imap_target(credentials)?;
                self.limiter.acquire(RequestCost::ImapSession).await;
                self.imap_pool.run(move || imap::unread_count(&target)).await
            }
        }
    }
}
