//! IMAP over XOAUTH2
//!
//! The `imap` crate is blocking, so everything in this module runs on a
//! dedicated thread via [`ImapWorkerPool`]. Nothing here may be called from
//! an async context directly.
//!
//! Messages are fetched with `BODY.PEEK[]` only: the server's `\Seen` flag is
//! never requested, so every message is reported read and the separate
//! `SEARCH UNSEEN` count is the only unread signal.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::DateTime;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::error::{truncate_chars, Result, SyncError};
use crate::models::{FetchedMessage, Folder};
use crate::provider::normalize_message_id;

type TlsStream = StreamOwned<ClientConnection, TcpStream>;
type ImapSession = imap::Session<TlsStream>;

const PREVIEW_CHARS: usize = 500;
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Where and as whom to log in
#[derive(Clone)]
pub struct ImapTarget {
    pub host: String,
    pub port: u16,
    pub email: String,
    pub access_token: String,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ImapTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("email", &self.email)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

struct XOAuth2 {
    user: String,
    access_token: String,
}

impl imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Bounded pool of blocking IMAP workers
#[derive(Debug, Clone)]
pub struct ImapWorkerPool {
    permits: Arc<Semaphore>,
}

impl ImapWorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `job` on a blocking thread once a worker slot is free
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Protocol("IMAP worker pool is closed".to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| SyncError::Protocol(format!("IMAP worker failed: {}", e)))?
    }

    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Newest `limit` messages of `folder`, newest first
pub fn fetch_messages(target: &ImapTarget, folder: Folder, limit: usize) -> Result<Vec<FetchedMessage>> {
    let mut session = open_session(target)?;
    let result = fetch_with_session(&mut session, folder, limit);
    // A failed LOGOUT does not invalidate what was already fetched
    let _ = session.logout();
    result
}

/// `SEARCH UNSEEN` hit count in the inbox
pub fn unread_count(target: &ImapTarget) -> Result<u32> {
    let mut session = open_session(target)?;
    let result = count_unseen(&mut session);
    let _ = session.logout();
    result
}

fn count_unseen(session: &mut ImapSession) -> Result<u32> {
    session
        .examine(Folder::Inbox.imap_name())
        .map_err(|e| imap_failure("EXAMINE", e))?;
    let hits = session
        .search("UNSEEN")
        .map_err(|e| imap_failure("SEARCH", e))?;
    Ok(hits.len() as u32)
}

fn fetch_with_session(
    session: &mut ImapSession,
    folder: Folder,
    limit: usize,
) -> Result<Vec<FetchedMessage>> {
    let mailbox = session
        .examine(folder.imap_name())
        .map_err(|e| imap_failure("EXAMINE", e))?;

    let exists = mailbox.exists as usize;
    if exists == 0 || limit == 0 {
        return Ok(Vec::new());
    }
    let first = exists.saturating_sub(limit) + 1;
    let sequence = format!("{}:{}", first, exists);
    trace!("Fetching {} from {}", sequence, folder.imap_name());

    let fetches = session
        .fetch(&sequence, "(UID BODY.PEEK[])")
        .map_err(|e| imap_failure("FETCH", e))?;

    let mut messages: Vec<FetchedMessage> = fetches
        .iter()
        .filter_map(|fetch| {
            let body = fetch.body()?;
            Some(parse_message(body, fetch.uid, folder))
        })
        .collect();
    // FETCH answers in ascending sequence order
    messages.reverse();
    Ok(messages)
}

fn open_session(target: &ImapTarget) -> Result<ImapSession> {
    let socket = match target.proxy.as_deref() {
        Some(proxy) => connect_via_proxy(proxy, &target.host, target.port, target.timeout)?,
        None => connect_tcp(&target.host, target.port, target.timeout)
            .map_err(|e| SyncError::Protocol(format!("connect {}:{}: {}", target.host, target.port, e)))?,
    };
    socket.set_read_timeout(Some(target.timeout))?;
    socket.set_write_timeout(Some(target.timeout))?;

    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|e| SyncError::Protocol(format!("invalid IMAP host {}: {}", target.host, e)))?;
    let connection = ClientConnection::new(tls_config()?, server_name)
        .map_err(|e| SyncError::Protocol(format!("TLS setup failed: {}", e)))?;

    let mut client = imap::Client::new(StreamOwned::new(connection, socket));
    client
        .read_greeting()
        .map_err(|e| imap_failure("greeting", e))?;

    let auth = XOAuth2 {
        user: target.email.clone(),
        access_token: target.access_token.clone(),
    };
    let session = client
        .authenticate("XOAUTH2", &auth)
        .map_err(|(e, _client)| imap_failure("AUTHENTICATE", e))?;

    debug!("IMAP session open for {} on {}", target.email, target.host);
    Ok(session)
}

fn imap_failure(stage: &str, error: imap::Error) -> SyncError {
    SyncError::Protocol(format!("IMAP {} failed: {}", stage, error))
}

fn tls_config() -> Result<Arc<ClientConfig>> {
    let provider = match rustls::crypto::CryptoProvider::get_default() {
        Some(provider) => Arc::clone(provider),
        None => Arc::new(platform_crypto_provider()),
    };

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SyncError::Protocol(format!("TLS configuration failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(not(windows))]
fn platform_crypto_provider() -> rustls::crypto::CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

#[cfg(windows)]
fn platform_crypto_provider() -> rustls::crypto::CryptoProvider {
    rustls::crypto::ring::default_provider()
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for address in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {}", host))
    }))
}

/// Open a raw tunnel to `host:port` through an HTTP proxy with `CONNECT`
///
/// Every failure here is the proxy's, never the mail server's.
fn connect_via_proxy(proxy: &str, host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let url = reqwest::Url::parse(proxy)
        .map_err(|e| SyncError::ProxyTransport(format!("invalid proxy URL: {}", e)))?;
    if url.scheme() != "http" {
        return Err(SyncError::ProxyTransport(format!(
            "{} proxies cannot tunnel IMAP, use an http:// proxy",
            url.scheme()
        )));
    }
    let proxy_host = url
        .host_str()
        .ok_or_else(|| SyncError::ProxyTransport("proxy URL has no host".to_string()))?;
    let proxy_port = url.port_or_known_default().unwrap_or(80);

    let tunnel_error = |e: std::io::Error| {
        SyncError::ProxyTransport(format!("proxy {}:{}: {}", proxy_host, proxy_port, e))
    };

    let mut stream = connect_tcp(proxy_host, proxy_port, timeout).map_err(tunnel_error)?;
    stream.set_read_timeout(Some(timeout)).map_err(tunnel_error)?;
    stream.set_write_timeout(Some(timeout)).map_err(tunnel_error)?;

    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if !url.username().is_empty() {
        let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).map_err(tunnel_error)?;

    let status_line = read_connect_response(&mut stream).map_err(tunnel_error)?;
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if !status.starts_with('2') {
        return Err(SyncError::ProxyTransport(format!(
            "proxy refused tunnel: {}",
            truncate_chars(status_line.trim(), 200)
        )));
    }

    trace!("CONNECT tunnel to {}:{} established", host, port);
    Ok(stream)
}

/// Read the proxy's response headers byte by byte so no TLS bytes are consumed
fn read_connect_response(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            ));
        }
        response.push(byte[0]);
        if response.len() > MAX_CONNECT_RESPONSE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized CONNECT response",
            ));
        }
    }
    let text = String::from_utf8_lossy(&response);
    Ok(text.lines().next().unwrap_or_default().to_string())
}

/// Normalize one raw RFC 822 message
pub fn parse_message(raw: &[u8], uid: Option<u32>, folder: Folder) -> FetchedMessage {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Unparseable message uid={:?}: {}", uid, e);
            return FetchedMessage {
                id: uid.map(|uid| uid_message_id(folder, uid)),
                is_read: true,
                folder,
                ..Default::default()
            };
        }
    };

    let headers = parsed.get_headers();
    let id = headers
        .get_first_value("Message-ID")
        .and_then(|value| normalize_message_id(&value))
        .or_else(|| uid.map(|uid| uid_message_id(folder, uid)));

    let (sender_name, sender_address) = headers
        .get_first_value("From")
        .map(|from| parse_sender(&from))
        .unwrap_or((None, None));

    let received_at = headers
        .get_first_value("Date")
        .and_then(|date| mailparse::dateparse(&date).ok())
        .and_then(|timestamp| DateTime::from_timestamp(timestamp, 0))
        .map(|date| date.to_rfc3339());

    FetchedMessage {
        id,
        subject: headers.get_first_value("Subject"),
        sender_name,
        sender_address,
        received_at,
        is_read: true,
        preview: extract_preview(&parsed),
        folder,
    }
}

fn uid_message_id(folder: Folder, uid: u32) -> String {
    format!("imap:{}:{}", folder.as_str(), uid)
}

fn parse_sender(from: &str) -> (Option<String>, Option<String>) {
    let Ok(list) = mailparse::addrparse(from) else {
        return (None, Some(from.trim().to_string()));
    };
    match list.iter().next() {
        Some(MailAddr::Single(info)) => (info.display_name.clone(), Some(info.addr.clone())),
        Some(MailAddr::Group(group)) => match group.addrs.first() {
            Some(info) => (info.display_name.clone(), Some(info.addr.clone())),
            None => (Some(group.group_name.clone()), None),
        },
        None => (None, None),
    }
}

fn extract_preview(mail: &ParsedMail) -> Option<String> {
    let text = find_part(mail, "text/plain")
        .and_then(|part| part.get_body().ok())
        .or_else(|| {
            find_part(mail, "text/html")
                .and_then(|part| part.get_body().ok())
                .and_then(|html| html2text::from_read(html.as_bytes(), 80).ok())
        })?;

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(truncate_chars(&collapsed, PREVIEW_CHARS))
    }
}

fn find_part<'m, 'a>(mail: &'m ParsedMail<'a>, mimetype: &str) -> Option<&'m ParsedMail<'a>> {
    if mail.subparts.is_empty() {
        return (mail.ctype.mimetype == mimetype).then_some(mail);
    }
    mail.subparts.iter().find_map(|part| find_part(part, mimetype))
}
