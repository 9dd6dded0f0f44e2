//! Microsoft Graph REST calls

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{truncate_chars, Result, SyncError};
use crate::models::{FetchedMessage, Folder};
use crate::provider::normalize_message_id;

const MESSAGE_SELECT_FIELDS: &str =
    "id,internetMessageId,subject,from,receivedDateTime,isRead,bodyPreview";

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    internet_message_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<Recipient>,
    #[serde(default)]
    received_date_time: Option<String>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    body_preview: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    #[serde(default)]
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailFolder {
    #[serde(default)]
    unread_item_count: u32,
}

impl GraphMessage {
    fn normalize(self, folder: Folder) -> FetchedMessage {
        let address = self.from.and_then(|from| from.email_address);
        let (sender_name, sender_address) = match address {
            Some(address) => (address.name, address.address),
            None => (None, None),
        };

        // keyed like IMAP so a protocol switch does not store a message twice
        let id = self
            .internet_message_id
            .as_deref()
            .and_then(normalize_message_id)
            .or(self.id);

        FetchedMessage {
            id,
            subject: self.subject,
            sender_name,
            sender_address,
            received_at: self.received_date_time,
            is_read: self.is_read,
            preview: self.body_preview,
            folder,
        }
    }
}

/// Newest `limit` messages of a well-known folder
pub async fn list_messages(
    client: &reqwest::Client,
    graph_base: &str,
    access_token: &str,
    folder: Folder,
    limit: usize,
    proxied: bool,
) -> Result<Vec<FetchedMessage>> {
    let url = format!(
        "{}/me/mailFolders/{}/messages",
        graph_base.trim_end_matches('/'),
        folder.graph_name()
    );
    let top = limit.to_string();
    let request = client.get(&url).query(&[
        ("$top", top.as_str()),
        ("$select", MESSAGE_SELECT_FIELDS),
        ("$orderby", "receivedDateTime desc"),
    ]);

    let page: MessagePage = send_json(request, access_token, proxied).await?;
    Ok(page
        .value
        .into_iter()
        .map(|message| message.normalize(folder))
        .collect())
}

/// `unreadItemCount` of the inbox
pub async fn unread_count(
    client: &reqwest::Client,
    graph_base: &str,
    access_token: &str,
    proxied: bool,
) -> Result<u32> {
    let url = format!(
        "{}/me/mailFolders/{}",
        graph_base.trim_end_matches('/'),
        Folder::Inbox.graph_name()
    );
    let folder: MailFolder = send_json(client.get(&url), access_token, proxied).await?;
    Ok(folder.unread_item_count)
}

async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    access_token: &str,
    proxied: bool,
) -> Result<T> {
    let response = request
        .bearer_auth(access_token)
        .header("accept", "application/json")
        .send()
        .await
        .map_err(|e| SyncError::from_transport(e, proxied))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SyncError::Protocol(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_chars(body.trim(), 200)
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| SyncError::Protocol(format!("malformed Graph response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_list_messages_normalizes_fields() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders/junkemail/messages"))
            .and(header("Authorization", "Bearer access-1"))
            .and(query_param("$top", "5"))
            .and(query_param("$select", MESSAGE_SELECT_FIELDS))
            .and(query_param("$orderby", "receivedDateTime desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {
                        "id": "AAMk-1",
                        "internetMessageId": "<invoice-1@billing.example.com>",
                        "subject": "Your invoice",
                        "from": {"emailAddress": {"name": "Billing", "address": "billing@example.com"}},
                        "receivedDateTime": "2024-05-01T08:30:00Z",
                        "isRead": false,
                        "bodyPreview": "Amount due"
                    },
                    {
                        "id": "AAMk-2",
                        "isRead": true
                    }
                ]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let base = format!("{}/v1.0", mock_server.uri());
        let messages = list_messages(&client, &base, "access-1", Folder::Junk, 5, false)
            .await
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id.as_deref(), Some("invoice-1@billing.example.com"));
        assert_eq!(messages[0].sender_name.as_deref(), Some("Billing"));
        assert_eq!(messages[0].sender_address.as_deref(), Some("billing@example.com"));
        assert_eq!(messages[0].received_at.as_deref(), Some("2024-05-01T08:30:00Z"));
        assert!(!messages[0].is_read);
        assert_eq!(messages[0].folder, Folder::Junk);

        // no internetMessageId: the Graph id is used
        assert_eq!(messages[1].id.as_deref(), Some("AAMk-2"));
        assert!(messages[1].is_read);
        assert_eq!(messages[1].subject, None);
        assert_eq!(messages[1].sender_address, None);
    }

    #[tokio::test]
    async fn test_unread_count() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/me/mailFolders/inbox"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "inbox-id",
                "displayName": "Inbox",
                "unreadItemCount": 7,
                "totalItemCount": 120
            })))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let count = unread_count(&client, &mock_server.uri(), "t", false).await.unwrap();
        assert_eq!(count, 7);
    }

    #[tokio::test]
    async fn test_http_error_is_protocol_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/me/mailFolders/inbox"))
            .respond_with(ResponseTemplate::new(401).set_body_string("InvalidAuthenticationToken"))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let error = unread_count(&client, &mock_server.uri(), "stale", false)
            .await
            .unwrap_err();

        match error {
            SyncError::Protocol(message) => {
                assert!(message.starts_with("HTTP 401"));
                assert!(message.contains("InvalidAuthenticationToken"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_proxy_failure() {
        // Nothing listens on port 9 of localhost
        let proxy = reqwest::Proxy::all("http://127.0.0.1:9").unwrap();
        let client = reqwest::Client::builder().proxy(proxy).build().unwrap();

        let error = unread_count(&client, "http://graph.invalid/v1.0", "t", true)
            .await
            .unwrap_err();
        assert!(error.is_proxy_failure(), "got {:?}", error);
    }
}
