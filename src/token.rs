//! Token freshness gate
//!
//! Decides whether an account's Graph access token can be used as-is or has to
//! be renewed first. Refreshing on every tick would double the request volume
//! against the token endpoint, so a token that is comfortably within its
//! lifetime is trusted without any network call.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::models::{Account, Protocol, TokenGrant};
use crate::provider::MailProvider;

/// Safety margin before expiry inside which a token is renewed
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 300;

pub struct TokenGate {
    provider: Arc<dyn MailProvider>,
    default_client_id: Option<String>,
    margin: Duration,
}

impl TokenGate {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        default_client_id: Option<String>,
        margin_secs: u64,
    ) -> Self {
        Self {
            provider,
            default_client_id: default_client_id.filter(|id| !id.trim().is_empty()),
            margin: Duration::seconds(margin_secs as i64),
        }
    }

    /// True when the stored access token outlives `now + margin`
    pub fn is_fresh(&self, account: &Account, now: DateTime<Utc>) -> bool {
        match (&account.access_token, account.token_expires_at) {
            (Some(token), Some(expires_at)) => !token.is_empty() && expires_at > now + self.margin,
            _ => false,
        }
    }

    /// Make sure `account` carries a usable Graph access token
    ///
    /// Returns `false` when renewal failed; the caller skips the account for
    /// this round. The previous token is left untouched in that case.
    pub async fn ensure_fresh(&self, account: &mut Account, proxy: Option<&str>) -> bool {
        match self.try_ensure_fresh(account, proxy).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Token refresh failed for {}: {}", account.email, e);
                false
            }
        }
    }

    /// Like [`ensure_fresh`](Self::ensure_fresh) but keeps the error
    ///
    /// `Ok(true)` means a refresh happened, `Ok(false)` that the stored token
    /// was still good.
    pub async fn try_ensure_fresh(&self, account: &mut Account, proxy: Option<&str>) -> Result<bool> {
        if self.is_fresh(account, Utc::now()) {
            debug!("Access token for {} still fresh, skipping refresh", account.email);
            return Ok(false);
        }
        self.force_refresh(account, proxy).await?;
        Ok(true)
    }

    /// Renew the Graph token regardless of its remaining lifetime
    pub async fn force_refresh(&self, account: &mut Account, proxy: Option<&str>) -> Result<()> {
        let grant = self.exchange(Protocol::Graph, account, proxy).await?;
        apply_grant(account, grant, Utc::now())?;
        debug!("Refreshed access token for {}", account.email);
        Ok(())
    }

    /// Exchange the account's refresh token at the endpoint for `protocol`
    ///
    /// Does not modify the account; IMAP transports use this to obtain a
    /// token their server accepts.
    pub async fn exchange(
        &self,
        protocol: Protocol,
        account: &Account,
        proxy: Option<&str>,
    ) -> Result<TokenGrant> {
        let refresh_token = account
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| SyncError::TokenRefresh("account has no refresh token".to_string()))?;
        let client_id = self.client_id_for(account)?;

        self.provider
            .refresh_token(protocol, client_id, refresh_token, proxy.map(str::to_string))
            .await
    }

    /// The account's own client id, else the configured default
    pub fn client_id_for<'a>(&'a self, account: &'a Account) -> Result<&'a str> {
        account
            .client_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .or(self.default_client_id.as_deref())
            .ok_or_else(|| SyncError::TokenRefresh("no client id configured".to_string()))
    }
}

/// Store a successful grant on the account
///
/// A lifetime that does not fit a timestamp is rejected and leaves the
/// account as it was.
pub fn apply_grant(account: &mut Account, grant: TokenGrant, now: DateTime<Utc>) -> Result<()> {
    let expires_at = Duration::try_seconds(grant.expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            SyncError::TokenRefresh(format!("token lifetime out of range: {}s", grant.expires_in))
        })?;

    account.access_token = Some(grant.access_token);
    account.refresh_token = Some(grant.refresh_token);
    account.token_expires_at = Some(expires_at);
    Ok(())
}
