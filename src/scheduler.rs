//! Round-robin batch scheduler
//!
//! Every auto-sync group runs on its own timer and syncs a small batch of its
//! accounts per firing, rotating a cursor through the group so each mailbox is
//! visited within `ceil(total / batch_size)` firings. Groups with
//! `auto_refresh_token` get a second timer that renews Graph tokens.
//!
//! Rotation state (cursor, round, cooldown) lives in memory on the scheduler
//! instance and is reset by a restart.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SchedulerConfig};
use crate::error::{truncate_chars, Result, SyncError};
use crate::events::{EventSink, LogEntry, Severity, NO_ACCOUNT};
use crate::fallback::FallbackEngine;
use crate::ingest::ingest;
use crate::models::{
    Account, AccountId, AccountStatus, Group, GroupId, RefreshKind, RefreshRecord, RefreshStatus,
};
use crate::provider::MailProvider;
use crate::rotation::plan_batch;
use crate::store::{Store, UnitOfWork};
use crate::token::TokenGate;
use crate::transport::{standard_transports, FetchPlan};

/// Refresh cadence for groups whose `refresh_interval_hours` is 0
pub const DEFAULT_REFRESH_INTERVAL_HOURS: u32 = 24;

/// Log-sink messages quote at most this much of an error
const MAX_LOG_ERROR_LEN: usize = 200;

/// Rotation bookkeeping for one group
#[derive(Debug, Clone, PartialEq)]
struct GroupCursor {
    offset: usize,
    round: u32,
    cooldown_until: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
}

impl Default for GroupCursor {
    fn default() -> Self {
        Self {
            offset: 0,
            round: 1,
            cooldown_until: None,
            last_run: None,
        }
    }
}

enum CooldownCheck {
    Ready,
    Cooling { round: u32, until: DateTime<Utc> },
    Resumed { round: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Refresh,
}

impl JobKind {
    pub fn job_id(&self, group_id: GroupId) -> String {
        match self {
            JobKind::Sync => format!("sync-group-{}", group_id),
            JobKind::Refresh => format!("refresh-group-{}", group_id),
        }
    }
}

struct Job {
    kind: JobKind,
    group_id: GroupId,
    interval: Duration,
    next_run: Arc<Mutex<DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Outcome of one group firing
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub group_id: GroupId,
    pub round: u32,
    pub selected: Vec<AccountId>,
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_messages: usize,
    pub round_completed: bool,
    pub in_cooldown: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl RefreshSummary {
    fn tally(&mut self, success: bool) {
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub group_id: GroupId,
    pub current_round: u32,
    pub in_cooldown: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub next_offset: usize,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub kind: JobKind,
    pub group_id: GroupId,
    pub interval_secs: u64,
    pub next_run: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub default_interval_minutes: u32,
    pub cooldown_minutes: u32,
    pub groups: Vec<GroupStatus>,
    pub jobs: Vec<JobStatus>,
}

enum AccountOutcome {
    Synced { new_messages: usize },
    Skipped,
    Failed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    gate: Arc<TokenGate>,
    engine: FallbackEngine,
    sink: Arc<EventSink>,
    cursors: Mutex<BTreeMap<GroupId, GroupCursor>>,
    group_locks: Mutex<HashMap<GroupId, Arc<tokio::sync::Mutex<()>>>>,
    jobs: Mutex<BTreeMap<String, Job>>,
    running: Mutex<bool>,
}

impl Scheduler {
    /// Wire the standard Graph / IMAP transports over `provider`
    pub fn new(config: &Config, store: Arc<dyn Store>, provider: Arc<dyn MailProvider>) -> Self {
        let gate = Arc::new(TokenGate::new(
            Arc::clone(&provider),
            config.provider.default_client_id.clone(),
            config.scheduler.token_refresh_margin_secs,
        ));
        let plan = FetchPlan {
            folders: config.provider.folders.clone(),
            limit: config.provider.fetch_limit,
        };
        let engine = FallbackEngine::new(standard_transports(provider, Arc::clone(&gate), plan));

        Self::with_parts(config.scheduler.clone(), store, gate, engine)
    }

    pub fn with_parts(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        gate: Arc<TokenGate>,
        engine: FallbackEngine,
    ) -> Self {
        let sink = Arc::new(EventSink::new(config.log_capacity));
        Self {
            config,
            store,
            gate,
            engine,
            sink,
            cursors: Mutex::new(BTreeMap::new()),
            group_locks: Mutex::new(HashMap::new()),
            jobs: Mutex::new(BTreeMap::new()),
            running: Mutex::new(false),
        }
    }

    pub fn sink(&self) -> &Arc<EventSink> {
        &self.sink
    }

    /// Operator log, newest first
    pub fn recent_log(&self) -> Vec<LogEntry> {
        self.sink.recent()
    }

    pub fn drain_new_mail_events(&self) -> HashMap<AccountId, u32> {
        self.sink.drain_events()
    }

    fn group_lock(&self, group_id: GroupId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock(&self.group_locks).entry(group_id).or_default())
    }

    fn batch_size_for(&self, group: &Group) -> usize {
        let size = if group.sync_batch_size > 0 {
            group.sync_batch_size
        } else {
            self.config.default_batch_size
        };
        size.max(1) as usize
    }

    fn sync_interval_for(&self, group: &Group) -> Duration {
        let minutes = if group.sync_interval_minutes > 0 {
            group.sync_interval_minutes
        } else {
            self.config.default_interval_minutes
        };
        Duration::from_secs(u64::from(minutes.max(1)) * 60)
    }

    fn refresh_interval_for(group: &Group) -> Duration {
        let hours = if group.refresh_interval_hours > 0 {
            group.refresh_interval_hours
        } else {
            DEFAULT_REFRESH_INTERVAL_HOURS
        };
        Duration::from_secs(u64::from(hours) * 3600)
    }

    fn check_cooldown(&self, group_id: GroupId, now: DateTime<Utc>) -> CooldownCheck {
        let mut cursors = lock(&self.cursors);
        let cursor = cursors.entry(group_id).or_default();
        match cursor.cooldown_until {
            Some(until) if now < until => CooldownCheck::Cooling {
                round: cursor.round,
                until,
            },
            Some(_) => {
                cursor.cooldown_until = None;
                CooldownCheck::Resumed {
                    round: cursor.round,
                }
            }
            None => CooldownCheck::Ready,
        }
    }

    /// Sync the next batch of one group
    ///
    /// Never fails: every per-account error is recorded on the account and in
    /// the log, and the rotation advances regardless.
    pub async fn run_group_batch(&self, group_id: GroupId) -> BatchReport {
        let group_lock = self.group_lock(group_id);
        let _guard = group_lock.lock().await;

        let mut report = BatchReport {
            group_id,
            ..Default::default()
        };

        let group = match self.store.group(group_id).await {
            Ok(Some(group)) => group,
            Ok(None) => {
                warn!("Group {} no longer exists, skipping batch", group_id);
                return report;
            }
            Err(e) => {
                error!("Failed to load group {}: {}", group_id, e);
                self.sink.record(
                    Severity::Error,
                    NO_ACCOUNT,
                    format!("failed to load group {}: {}", group_id, truncate_chars(&e.to_string(), MAX_LOG_ERROR_LEN)),
                );
                return report;
            }
        };

        match self.check_cooldown(group_id, Utc::now()) {
            CooldownCheck::Cooling { round, until } => {
                let remaining = (until - Utc::now()).num_minutes().max(0);
                info!("Group {} cooling down, round {} starts in {} min", group.name, round, remaining);
                self.sink.record(
                    Severity::Info,
                    NO_ACCOUNT,
                    format!("group {}: cooling down, round {} starts in {} min", group.name, round, remaining),
                );
                report.round = round;
                report.in_cooldown = true;
                return report;
            }
            CooldownCheck::Resumed { round } => {
                info!("Cooldown over for group {}, starting round {}", group.name, round);
                self.sink.record(
                    Severity::Info,
                    NO_ACCOUNT,
                    format!("group {}: round {} started", group.name, round),
                );
            }
            CooldownCheck::Ready => {}
        }

        let accounts = match self.store.sync_candidates(group_id).await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Failed to load accounts of group {}: {}", group.name, e);
                self.sink.record(
                    Severity::Error,
                    NO_ACCOUNT,
                    format!("group {}: failed to load accounts: {}", group.name, truncate_chars(&e.to_string(), MAX_LOG_ERROR_LEN)),
                );
                return report;
            }
        };

        let (offset, round) = {
            let cursors = lock(&self.cursors);
            let cursor = cursors.get(&group_id).cloned().unwrap_or_default();
            (cursor.offset, cursor.round)
        };
        report.round = round;

        let total = accounts.len();
        let Some(plan) = plan_batch(offset, self.batch_size_for(&group), total) else {
            info!("Group {} has no accounts to sync", group.name);
            self.sink.record(
                Severity::Info,
                NO_ACCOUNT,
                format!("group {}: no accounts to sync", group.name),
            );
            return report;
        };

        info!(
            "Round {} for group {}: syncing {} of {} account(s) from position {}",
            round,
            group.name,
            plan.indices.len(),
            total,
            offset % total + 1
        );

        let proxy = group.proxy();
        for index in &plan.indices {
            let account = accounts[*index].clone();
            report.selected.push(account.id);

            match self.sync_account(account, proxy, (*index + 1, total)).await {
                AccountOutcome::Synced { new_messages } => {
                    report.synced += 1;
                    report.new_messages += new_messages;
                }
                AccountOutcome::Skipped => report.skipped += 1,
                AccountOutcome::Failed => report.failed += 1,
            }
        }

        let now = Utc::now();
        {
            let mut cursors = lock(&self.cursors);
            let cursor = cursors.entry(group_id).or_default();
            cursor.offset = plan.next_cursor;
            cursor.last_run = Some(now);
            if plan.completes_round {
                cursor.round += 1;
                if self.config.round_cooldown_minutes > 0 {
                    cursor.cooldown_until =
                        Some(now + ChronoDuration::minutes(i64::from(self.config.round_cooldown_minutes)));
                }
            }
        }

        if plan.completes_round {
            report.round_completed = true;
            let message = if self.config.round_cooldown_minutes > 0 {
                format!(
                    "group {}: round {} complete ({} accounts), cooling down {} min before round {}",
                    group.name,
                    round,
                    total,
                    self.config.round_cooldown_minutes,
                    round + 1
                )
            } else {
                format!("group {}: round {} complete ({} accounts)", group.name, round, total)
            };
            info!("{}", message);
            self.sink.record(Severity::Info, NO_ACCOUNT, message);
        }

        report
    }

    /// One account attempt: token gate, protocol fallback, ingest, commit
    async fn sync_account(
        &self,
        mut account: Account,
        proxy: Option<&str>,
        position: (usize, usize),
    ) -> AccountOutcome {
        if let Err(e) = self.gate.try_ensure_fresh(&mut account, proxy).await {
            warn!("Skipping {} this round, token refresh failed: {}", account.email, e);
            self.sink.record(
                Severity::Warning,
                &account.email,
                format!("token refresh failed, skipped: {}", truncate_chars(&e.to_string(), MAX_LOG_ERROR_LEN)),
            );
            account.last_error = Some(truncate_chars(&e.to_string(), self.config.max_error_len));
            self.commit_or_log(UnitOfWork::new(account)).await;
            return AccountOutcome::Skipped;
        }

        match self.try_sync(&mut account, proxy, position).await {
            Ok(new_messages) => AccountOutcome::Synced { new_messages },
            Err(e) => {
                error!("Sync of {} failed: {}", account.email, e);
                account.status = AccountStatus::Error;
                account.last_error = Some(truncate_chars(&e.to_string(), self.config.max_error_len));
                self.sink.record(
                    Severity::Error,
                    &account.email,
                    format!("sync failed: {}", truncate_chars(&e.to_string(), MAX_LOG_ERROR_LEN)),
                );
                self.commit_or_log(UnitOfWork::new(account)).await;
                AccountOutcome::Failed
            }
        }
    }

    async fn try_sync(
        &self,
        account: &mut Account,
        proxy: Option<&str>,
        (position, total): (usize, usize),
    ) -> Result<usize> {
        let previous_unread = account.unread_count;
        let result = self.engine.sync_account(account, proxy).await?;

        if result.unread_count > previous_unread {
            let delta = result.unread_count - previous_unread;
            self.sink.note_new_mail(account.id, delta);
            self.sink
                .record(Severity::Info, &account.email, format!("{} new message(s)", delta));
            info!("{}: {} new message(s)", account.email, delta);
        }

        account.unread_count = result.unread_count;
        account.status = AccountStatus::Active;
        account.last_synced = Some(Utc::now());
        account.last_error = None;

        let mut work = UnitOfWork::new(account.clone());
        ingest(self.store.as_ref(), &mut work, result.messages).await?;
        let saved = self.store.commit(work).await?;

        if saved > 0 {
            self.sink.record(
                Severity::Info,
                &account.email,
                format!("saved {} new message(s)", saved),
            );
        }
        self.sink.record(
            Severity::Success,
            &account.email,
            format!(
                "synced via {} ({}/{}), unread: {}",
                result.method, position, total, result.unread_count
            ),
        );
        debug!("Synced {} via {}, {} saved", account.email, result.method, saved);

        Ok(saved)
    }

    async fn commit_or_log(&self, work: UnitOfWork) {
        let email = work.account.email.clone();
        if let Err(e) = self.store.commit(work).await {
            error!("Failed to persist state of {}: {}", email, e);
            self.sink.record(
                Severity::Error,
                &email,
                format!("failed to save account state: {}", truncate_chars(&e.to_string(), MAX_LOG_ERROR_LEN)),
            );
        }
    }

    /// Run one batch for every auto-sync group
    pub async fn run_one_sync_cycle(&self) -> Vec<BatchReport> {
        let groups = match self.store.auto_sync_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                error!("Failed to load auto-sync groups: {}", e);
                return Vec::new();
            }
        };

        if groups.is_empty() {
            info!("No auto-sync groups, nothing to do");
            self.sink
                .record(Severity::Info, NO_ACCOUNT, "no auto-sync groups, skipping");
            return Vec::new();
        }

        let mut reports = Vec::with_capacity(groups.len());
        for group in groups {
            reports.push(self.run_group_batch(group.id).await);
        }
        reports
    }

    async fn proxy_for(&self, account: &Account) -> Option<String> {
        let group_id = account.group_id?;
        match self.store.group(group_id).await {
            Ok(group) => group.and_then(|group| group.proxy().map(str::to_string)),
            Err(e) => {
                warn!("Could not load group {} for proxy lookup: {}", group_id, e);
                None
            }
        }
    }

    /// Force-renew one account's Graph token and record the attempt
    async fn refresh_one(&self, mut account: Account, kind: RefreshKind) -> bool {
        let proxy = self.proxy_for(&account).await;
        let outcome = self.gate.force_refresh(&mut account, proxy.as_deref()).await;
        let now = Utc::now();

        let (success, error) = match outcome {
            Ok(()) => {
                account.refresh_status = RefreshStatus::Success;
                account.last_refresh_at = Some(now);
                account.last_error = None;
                if account.status != AccountStatus::Disabled {
                    account.status = AccountStatus::Active;
                }
                self.sink
                    .record(Severity::Success, &account.email, format!("{} token refresh succeeded", kind.as_str()));
                (true, None)
            }
            Err(e) => {
                let message = truncate_chars(&e.to_string(), self.config.max_error_len);
                warn!("{} token refresh for {} failed: {}", kind.as_str(), account.email, e);
                account.refresh_status = RefreshStatus::Failed;
                account.last_error = Some(message.clone());
                self.sink.record(
                    Severity::Error,
                    &account.email,
                    format!(
                        "{} token refresh failed: {}",
                        kind.as_str(),
                        truncate_chars(&message, MAX_LOG_ERROR_LEN)
                    ),
                );
                (false, Some(message))
            }
        };

        let record = RefreshRecord {
            account_id: account.id,
            email: account.email.clone(),
            kind,
            success,
            error,
            at: now,
        };
        let mut work = UnitOfWork::new(account);
        work.stage_refresh(record);
        self.commit_or_log(work).await;

        success
    }

    async fn refresh_locked(&self, account: Account, kind: RefreshKind) -> bool {
        match account.group_id {
            Some(group_id) => {
                let group_lock = self.group_lock(group_id);
                let _guard = group_lock.lock().await;
                // re-read under the lock, a batch may have just rewritten it
                let current = match self.store.account(account.id).await {
                    Ok(Some(current)) => current,
                    _ => account,
                };
                self.refresh_one(current, kind).await
            }
            None => self.refresh_one(account, kind).await,
        }
    }

    /// Scheduled token renewal for every candidate of a group
    pub async fn refresh_group_tokens(&self, group_id: GroupId) -> RefreshSummary {
        let mut summary = RefreshSummary::default();

        let accounts = match self.store.sync_candidates(group_id).await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Failed to load accounts of group {} for refresh: {}", group_id, e);
                return summary;
            }
        };

        let group_lock = self.group_lock(group_id);
        let _guard = group_lock.lock().await;
        for account in accounts {
            summary.tally(self.refresh_one(account, RefreshKind::Auto).await);
        }

        info!(
            "Token refresh for group {}: {} succeeded, {} failed",
            group_id, summary.succeeded, summary.failed
        );
        self.sink.record(
            Severity::Info,
            NO_ACCOUNT,
            format!(
                "group {}: token refresh done, {} succeeded, {} failed",
                group_id, summary.succeeded, summary.failed
            ),
        );
        summary
    }

    /// Manually renew one account's token
    pub async fn refresh_account(&self, account_id: AccountId) -> Result<RefreshSummary> {
        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or_else(|| SyncError::Store(format!("account {} not found", account_id)))?;

        let mut summary = RefreshSummary::default();
        summary.tally(self.refresh_locked(account, RefreshKind::Manual).await);
        Ok(summary)
    }

    /// Retry every account whose last refresh failed
    pub async fn retry_failed_refreshes(&self) -> Result<RefreshSummary> {
        let accounts = self.store.failed_refresh_accounts().await?;
        info!("Retrying token refresh for {} account(s)", accounts.len());

        let mut summary = RefreshSummary::default();
        for account in accounts {
            summary.tally(self.refresh_locked(account, RefreshKind::Retry).await);
        }
        Ok(summary)
    }

    /// Reconcile timer jobs with the groups currently in the store
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let sync_groups = self.store.auto_sync_groups().await?;
        let refresh_groups = self.store.auto_refresh_groups().await?;

        let mut wanted: BTreeMap<String, (JobKind, GroupId, Duration)> = BTreeMap::new();
        for group in &sync_groups {
            wanted.insert(
                JobKind::Sync.job_id(group.id),
                (JobKind::Sync, group.id, self.sync_interval_for(group)),
            );
        }
        for group in &refresh_groups {
            wanted.insert(
                JobKind::Refresh.job_id(group.id),
                (JobKind::Refresh, group.id, Self::refresh_interval_for(group)),
            );
        }

        {
            let mut cursors = lock(&self.cursors);
            for group in &sync_groups {
                cursors.entry(group.id).or_default();
            }
        }

        let mut jobs = lock(&self.jobs);
        jobs.retain(|id, job| {
            let keep = matches!(wanted.get(id), Some((_, _, interval)) if *interval == job.interval);
            if !keep {
                debug!("Removing job {}", id);
                // a firing in progress finishes, the group lock keeps it apart from the replacement
                let _ = job.shutdown.send(true);
            }
            keep
        });
        for (id, (kind, group_id, interval)) in wanted {
            if !jobs.contains_key(&id) {
                debug!("Scheduling job {} every {:?}", id, interval);
                jobs.insert(id, self.spawn_job(kind, group_id, interval));
            }
        }
        let sync_jobs = jobs.values().filter(|job| job.kind == JobKind::Sync).count();
        let refresh_jobs = jobs.len() - sync_jobs;
        drop(jobs);

        *lock(&self.running) = true;

        let message = format!(
            "scheduler started: {} sync job(s), {} refresh job(s), default batch {} every {} min",
            sync_jobs, refresh_jobs, self.config.default_batch_size, self.config.default_interval_minutes
        );
        info!("{}", message);
        self.sink.record(Severity::Info, NO_ACCOUNT, message);
        Ok(())
    }

    fn spawn_job(self: &Arc<Self>, kind: JobKind, group_id: GroupId, interval: Duration) -> Job {
        let scheduler: Weak<Self> = Arc::downgrade(self);
        let step = ChronoDuration::seconds(interval.as_secs() as i64);
        let next_run = Arc::new(Mutex::new(Utc::now() + step));
        let shared_next_run = Arc::clone(&next_run);
        let (shutdown, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // shutdown is only observed between firings
                tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                *lock(&shared_next_run) = Utc::now() + step;
                match kind {
                    JobKind::Sync => {
                        scheduler.run_group_batch(group_id).await;
                    }
                    JobKind::Refresh => {
                        scheduler.refresh_group_tokens(group_id).await;
                    }
                }
            }
        });

        Job {
            kind,
            group_id,
            interval,
            next_run,
            shutdown,
            handle,
        }
    }

    /// Stop every job
    ///
    /// No new firing starts once this is called. A batch that is already
    /// running completes and commits, and this waits for it.
    pub async fn stop(&self) {
        let jobs = std::mem::take(&mut *lock(&self.jobs));
        for job in jobs.values() {
            let _ = job.shutdown.send(true);
        }
        for (id, job) in jobs {
            if let Err(e) = job.handle.await {
                warn!("Job {} ended abnormally: {}", id, e);
            }
        }

        let was_running = std::mem::replace(&mut *lock(&self.running), false);
        if was_running {
            info!("Scheduler stopped");
            self.sink.record(Severity::Info, NO_ACCOUNT, "scheduler stopped");
        }
    }

    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.running)
    }

    pub fn status(&self) -> SchedulerStatus {
        let now = Utc::now();
        let groups = lock(&self.cursors)
            .iter()
            .map(|(group_id, cursor)| GroupStatus {
                group_id: *group_id,
                current_round: cursor.round,
                in_cooldown: cursor.cooldown_until.is_some_and(|until| until > now),
                cooldown_until: cursor.cooldown_until,
                next_offset: cursor.offset,
                last_run: cursor.last_run,
            })
            .collect();

        let jobs = lock(&self.jobs)
            .iter()
            .map(|(id, job)| JobStatus {
                id: id.clone(),
                kind: job.kind,
                group_id: job.group_id,
                interval_secs: job.interval.as_secs(),
                next_run: *lock(&job.next_run),
            })
            .collect();

        SchedulerStatus {
            running: self.is_running(),
            default_interval_minutes: self.config.default_interval_minutes,
            cooldown_minutes: self.config.round_cooldown_minutes,
            groups,
            jobs,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for job in lock(&self.jobs).values() {
            job.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;
    use crate::provider::{Credentials, MailProvider};
    use crate::models::{FetchedMessage, Folder, TokenGrant};
    use crate::store::MemoryStore;
    use crate::transport::{FetchResult, Transport};
    use async_trait::async_trait;

    mockall::mock! {
        pub TestProvider {}

        #[async_trait]
        impl MailProvider for TestProvider {
            async fn refresh_token(
                &self,
                protocol: Protocol,
                client_id: &str,
                refresh_token: &str,
                proxy: Option<String>,
            ) -> Result<TokenGrant>;
            async fn fetch_messages(
                &self,
                credentials: &Credentials,
                folder: Folder,
                limit: usize,
            ) -> Result<Vec<FetchedMessage>>;
            async fn get_unread_count(&self, credentials: &Credentials) -> Result<u32>;
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl Transport for AlwaysOk {
        fn protocol(&self) -> Protocol {
            Protocol::Graph
        }

        async fn fetch(&self, _account: &Account, _proxy: Option<&str>) -> Result<FetchResult> {
            Ok(FetchResult::default())
        }
    }

    /// Rotates the refresh token after a long fetch
    #[derive(Default)]
    struct SlowRotating {
        started: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Transport for SlowRotating {
        fn protocol(&self) -> Protocol {
            Protocol::Graph
        }

        async fn fetch(&self, account: &Account, _proxy: Option<&str>) -> Result<FetchResult> {
            self.started.store(true, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(FetchResult {
                rotated_refresh_token: Some(format!("rotated-{}", account.id)),
                ..Default::default()
            })
        }
    }

    fn scheduler(cooldown_minutes: u32) -> (Arc<Scheduler>, Arc<MemoryStore>) {
        scheduler_with(cooldown_minutes, Arc::new(AlwaysOk))
    }

    fn scheduler_with(
        cooldown_minutes: u32,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Scheduler>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut group = Group::new(1, "fleet");
        group.auto_sync = true;
        group.sync_batch_size = 2;
        store.add_group(group).unwrap();
        for id in 1..=3 {
            let mut account = Account::new(id, format!("user{}@outlook.com", id));
            account.group_id = Some(1);
            account.access_token = Some("access".to_string());
            account.token_expires_at = Some(Utc::now() + ChronoDuration::hours(1));
            store.add_account(account).unwrap();
        }

        let gate = Arc::new(TokenGate::new(Arc::new(MockTestProvider::new()), None, 300));
        let config = SchedulerConfig {
            round_cooldown_minutes: cooldown_minutes,
            ..Default::default()
        };
        let scheduler = Scheduler::with_parts(
            config,
            Arc::clone(&store) as Arc<dyn Store>,
            gate,
            FallbackEngine::new(vec![transport]),
        );
        (Arc::new(scheduler), store)
    }

    #[test]
    fn test_job_ids() {
        assert_eq!(JobKind::Sync.job_id(7), "sync-group-7");
        assert_eq!(JobKind::Refresh.job_id(7), "refresh-group-7");
    }

    #[tokio::test]
    async fn test_round_resumes_after_cooldown_expires() {
        let (scheduler, _store) = scheduler(30);

        scheduler.run_group_batch(1).await;
        let second = scheduler.run_group_batch(1).await;
        assert!(second.round_completed);
        assert_eq!(second.round, 1);

        let skipped = scheduler.run_group_batch(1).await;
        assert!(skipped.in_cooldown);
        assert!(skipped.selected.is_empty());
        assert_eq!(skipped.round, 2);

        // pretend the cooldown ran out
        lock(&scheduler.cursors).get_mut(&1).unwrap().cooldown_until =
            Some(Utc::now() - ChronoDuration::seconds(1));

        let resumed = scheduler.run_group_batch(1).await;
        assert!(!resumed.in_cooldown);
        assert_eq!(resumed.round, 2);
        assert_eq!(resumed.selected.len(), 2);
        assert!(scheduler
            .recent_log()
            .iter()
            .any(|entry| entry.message == "group fleet: round 2 started"));
    }

    #[tokio::test]
    async fn test_no_cooldown_means_continuous_rotation() {
        let (scheduler, _store) = scheduler(0);

        let mut visited = Vec::new();
        for _ in 0..3 {
            let report = scheduler.run_group_batch(1).await;
            assert!(!report.in_cooldown);
            visited.extend(report.selected);
        }
        // 3 accounts, batch of 2: [1,2] [3,1] [2,3]
        assert_eq!(visited, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(scheduler.status().groups[0].current_round, 3);
    }

    #[tokio::test]
    async fn test_start_and_stop_manage_jobs() {
        let (scheduler, store) = scheduler(0);
        let mut refreshing = Group::new(2, "refresh");
        refreshing.auto_refresh_token = true;
        refreshing.refresh_interval_hours = 6;
        store.add_group(refreshing).unwrap();

        scheduler.start().await.unwrap();
        let status = scheduler.status();
        assert!(status.running);
        let ids: Vec<&str> = status.jobs.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec!["refresh-group-2", "sync-group-1"]);
        assert_eq!(status.jobs[0].interval_secs, 6 * 3600);
        assert_eq!(status.jobs[1].interval_secs, 4 * 60);

        // starting again keeps the existing jobs
        scheduler.start().await.unwrap();
        assert_eq!(scheduler.status().jobs.len(), 2);

        scheduler.stop().await;
        let status = scheduler.status();
        assert!(!status.running);
        assert!(status.jobs.is_empty());

        let messages: Vec<String> = scheduler.recent_log().into_iter().map(|e| e.message).collect();
        assert_eq!(messages[0], "scheduler stopped");
        assert!(messages[1].starts_with("scheduler started"));
    }

    async fn settle<F: Fn() -> bool>(done: F) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_job_fires_on_its_interval() {
        let (scheduler, _store) = scheduler(0);
        scheduler.start().await.unwrap();

        let before = scheduler.status();
        assert_eq!(before.groups[0].next_offset, 0);
        assert_eq!(before.groups[0].last_run, None);
        let first_run = before.jobs[0].next_run;

        // nothing happens before the interval elapses
        tokio::time::advance(Duration::from_secs(3 * 60)).await;
        settle(|| false).await;
        assert_eq!(scheduler.status().groups[0].next_offset, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        settle(|| scheduler.status().groups[0].next_offset != 0).await;

        let after = scheduler.status();
        assert_eq!(after.groups[0].next_offset, 2);
        assert!(after.groups[0].last_run.is_some());
        assert!(after.jobs[0].next_run > first_run);

        tokio::time::advance(Duration::from_secs(4 * 60)).await;
        settle(|| scheduler.status().groups[0].current_round == 2).await;
        assert_eq!(scheduler.status().groups[0].current_round, 2);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_jobs_do_not_fire() {
        let (scheduler, _store) = scheduler(0);
        scheduler.start().await.unwrap();
        scheduler.stop().await;

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        settle(|| false).await;

        let status = scheduler.status();
        assert_eq!(status.groups[0].next_offset, 0);
        assert_eq!(status.groups[0].last_run, None);
        assert!(status.jobs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_running_batch_commit() {
        let transport = Arc::new(SlowRotating::default());
        let (scheduler, store) = scheduler_with(0, Arc::clone(&transport) as Arc<dyn Transport>);
        scheduler.start().await.unwrap();

        tokio::time::advance(Duration::from_secs(4 * 60 + 1)).await;
        settle(|| transport.started.load(std::sync::atomic::Ordering::SeqCst)).await;
        assert!(transport.started.load(std::sync::atomic::Ordering::SeqCst));

        // the batch is parked inside the fetch when the stop arrives
        scheduler.stop().await;

        let status = scheduler.status();
        assert_eq!(status.groups[0].next_offset, 2);
        for id in [1, 2] {
            let account = store.account(id).await.unwrap().unwrap();
            assert!(account.last_synced.is_some());
            assert_eq!(account.refresh_token, Some(format!("rotated-{}", id)));
        }
        let untouched = store.account(3).await.unwrap().unwrap();
        assert_eq!(untouched.last_synced, None);
    }
}
