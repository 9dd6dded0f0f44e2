//! Message dedup and ingest
//!
//! Known provider ids for an account are loaded with a single query and
//! only unseen messages are staged, so the query count stays at one no
//! matter how many messages a protocol returned.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use crate::error::{truncate_chars, Result};
use crate::models::{AccountId, FetchedMessage, StoredMessage};
use crate::store::{Store, UnitOfWork};

pub const MAX_SUBJECT_LEN: usize = 500;
pub const MAX_SENDER_LEN: usize = 255;
pub const MAX_PREVIEW_LEN: usize = 500;

/// Stage the messages of `messages` not yet stored for the work's account
///
/// Returns the number of newly staged messages.
pub async fn ingest(
    store: &dyn Store,
    work: &mut UnitOfWork,
    messages: Vec<FetchedMessage>,
) -> Result<usize> {
    if messages.is_empty() {
        return Ok(0);
    }

    let mut known = store.known_message_ids(work.account.id).await?;
    // ids already staged in this unit of work count as known too
    known.extend(work.new_messages.iter().map(|message| message.message_id.clone()));

    let fresh = select_new(work.account.id, &known, messages);
    let count = fresh.len();
    work.new_messages.extend(fresh);

    debug!("{} new message(s) for account {}", count, work.account.id);
    Ok(count)
}

/// Convert the messages whose id is not in `known` into store records
///
/// Messages without an id are dropped, and a repeated id within the batch is
/// kept only once.
pub fn select_new(
    account_id: AccountId,
    known: &HashSet<String>,
    messages: Vec<FetchedMessage>,
) -> Vec<StoredMessage> {
    let mut seen = HashSet::new();
    let mut fresh = Vec::new();

    for message in messages {
        let Some(id) = message.id.filter(|id| !id.is_empty()) else {
            continue;
        };
        if known.contains(&id) || !seen.insert(id.clone()) {
            continue;
        }

        fresh.push(StoredMessage {
            account_id,
            message_id: id,
            subject: bounded(message.subject, MAX_SUBJECT_LEN),
            sender_name: bounded(message.sender_name, MAX_SENDER_LEN),
            sender_address: bounded(message.sender_address, MAX_SENDER_LEN),
            received_at: message.received_at.as_deref().and_then(parse_timestamp),
            is_read: message.is_read,
            body_preview: bounded(message.preview, MAX_PREVIEW_LEN),
            folder: message.folder,
        });
    }

    fresh
}

fn bounded(value: Option<String>, max_chars: usize) -> String {
    value
        .map(|text| truncate_chars(&text, max_chars))
        .unwrap_or_default()
}

/// Parse a provider timestamp; naive values are taken as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, Folder};
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn fetched(id: Option<&str>, subject: &str) -> FetchedMessage {
        FetchedMessage {
            id: id.map(str::to_string),
            subject: Some(subject.to_string()),
            received_at: Some("2024-05-01T08:30:00Z".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_new_skips_known_missing_and_repeated_ids() {
        let known: HashSet<String> = ["m1".to_string()].into_iter().collect();
        let batch = vec![
            fetched(Some("m1"), "already stored"),
            fetched(None, "no id"),
            fetched(Some(""), "empty id"),
            fetched(Some("m2"), "first"),
            fetched(Some("m2"), "duplicate"),
            fetched(Some("m3"), "third"),
        ];

        let fresh = select_new(1, &known, batch);
        let ids: Vec<&str> = fresh.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert_eq!(fresh[0].subject, "first");
    }

    #[test]
    fn test_fields_are_truncated() {
        let message = FetchedMessage {
            id: Some("m1".to_string()),
            subject: Some("s".repeat(800)),
            sender_name: Some("n".repeat(300)),
            sender_address: Some(format!("{}@example.com", "a".repeat(300))),
            preview: Some("p".repeat(900)),
            folder: Folder::Junk,
            ..Default::default()
        };

        let fresh = select_new(1, &HashSet::new(), vec![message]);
        assert_eq!(fresh[0].subject.chars().count(), MAX_SUBJECT_LEN);
        assert_eq!(fresh[0].sender_name.chars().count(), MAX_SENDER_LEN);
        assert_eq!(fresh[0].sender_address.chars().count(), MAX_SENDER_LEN);
        assert_eq!(fresh[0].body_preview.chars().count(), MAX_PREVIEW_LEN);
        assert_eq!(fresh[0].folder, Folder::Junk);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let utc = parse_timestamp("2024-05-01T08:30:00Z").unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-05-01T08:30:00+00:00");

        let offset = parse_timestamp("2024-05-01T10:30:00+02:00").unwrap();
        assert_eq!(offset, utc);

        let naive = parse_timestamp("2024-05-01T08:30:00.1234567").unwrap();
        assert_eq!(naive.timestamp(), utc.timestamp());

        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_bad_timestamp_keeps_message() {
        let mut message = fetched(Some("m1"), "hello");
        message.received_at = Some("not a date".to_string());

        let fresh = select_new(1, &HashSet::new(), vec![message]);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].received_at, None);
    }

    #[tokio::test]
    async fn test_refetch_with_changed_subject_is_not_stored() {
        let store = MemoryStore::new();
        let account = Account::new(1, "a@outlook.com");

        let mut work = UnitOfWork::new(account.clone());
        assert_eq!(ingest(&store, &mut work, vec![fetched(Some("m1"), "original")]).await.unwrap(), 1);
        store.commit(work).await.unwrap();

        let mut work = UnitOfWork::new(account);
        assert_eq!(ingest(&store, &mut work, vec![fetched(Some("m1"), "edited")]).await.unwrap(), 0);
        store.commit(work).await.unwrap();

        let messages = store.messages(1).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "original");
    }

    fn message_strategy() -> impl Strategy<Value = FetchedMessage> {
        (proptest::option::weighted(0.9, "m[0-9]{1,2}"), ".{0,20}").prop_map(|(id, subject)| {
            FetchedMessage {
                id,
                subject: Some(subject),
                ..Default::default()
            }
        })
    }

    proptest! {
        #[test]
        fn prop_reingesting_a_batch_stores_nothing(batch in proptest::collection::vec(message_strategy(), 0..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = MemoryStore::new();
                let account = Account::new(1, "a@outlook.com");

                let mut first = UnitOfWork::new(account.clone());
                let staged = ingest(&store, &mut first, batch.clone()).await.unwrap();
                let inserted = store.commit(first).await.unwrap();
                assert_eq!(staged, inserted);

                let mut second = UnitOfWork::new(account);
                let again = ingest(&store, &mut second, batch).await.unwrap();
                assert_eq!(again, 0);
                assert_eq!(store.commit(second).await.unwrap(), 0);
            });
        }
    }
}
