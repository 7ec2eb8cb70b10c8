/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - Dormant Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::api_metrics::ApiMetrics;
use crate::backoff::{pacing_delay, Backoff};
use crate::error::ApiError;
use crate::partner::{Metered, QuotaHeaders};
use dormant_protocol::RateLimitStatus;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    /// Spacing between dispatches while quota is healthy.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of quota below which pacing starts to stretch.
    pub backoff_threshold: f64,
    pub max_quota: u32,
    /// Wait applied on 429 when the server gives no reset hint.
    pub default_reset: Duration,
    pub max_retries: u32,
    pub max_quota_retries: u32,
    pub retry: Backoff,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_threshold: 0.2,
            max_quota: 3000,
            default_reset: Duration::from_secs(60),
            max_retries: 5,
            max_quota_retries: 3,
            retry: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitState {
    pub remaining_quota: u32,
    pub max_quota: u32,
    pub quota_reset_at: Option<Instant>,
    pub in_flight_count: usize,
    pub queued_count: usize,
}

impl RateLimitState {
    pub fn new(max_quota: u32) -> Self {
        Self {
            remaining_quota: max_quota,
            max_quota,
            quota_reset_at: None,
            in_flight_count: 0,
            queued_count: 0,
        }
    }

    fn roll_over(&mut self, now: Instant) -> bool {
        match self.quota_reset_at {
            Some(at) if now >= at => {
                self.remaining_quota = self.max_quota;
                self.quota_reset_at = None;
                true
            }
            _ => false,
        }
    }

    /// How long dispatch must wait for the quota window to reset.
    pub fn blocked_for(&self, now: Instant) -> Option<Duration> {
        if self.remaining_quota > 0 {
            return None;
        }
        match self.quota_reset_at {
            Some(at) if at > now => Some(at - now),
            _ => None,
        }
    }

    pub fn quota_ratio(&self) -> f64 {
        if self.max_quota == 0 {
            return 1.0;
        }
        f64::from(self.remaining_quota) / f64::from(self.max_quota)
    }
}

/// Per-run cancellation flag. Queued work whose signal has fired is never
/// dispatched.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx: Some(rx) })
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    pub async fn cancelled(&mut self) {
        match self.rx.as_mut() {
            Some(rx) => {
                while !*rx.borrow_and_update() {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

type AttemptFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<QuotaHeaders>, ApiError>> + Send + Sync>;

struct Job {
    id: u64,
    label: &'static str,
    attempt: AttemptFn,
    reject: Box<dyn FnOnce(ApiError) + Send>,
    cancel: CancelSignal,
    quota_retries: u32,
}

/// Process-wide gate in front of the partner API.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SchedulerSettings,
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
    state: watch::Sender<RateLimitState>,
    metrics: ApiMetrics,
    seq: AtomicU64,
}

impl RequestScheduler {
    pub fn start(settings: SchedulerSettings, shutdown: watch::Receiver<bool>) -> Self {
        Self::start_with_state(settings, RateLimitState::new(settings.max_quota), shutdown)
    }

    pub fn start_with_state(
        settings: SchedulerSettings,
        initial: RateLimitState,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let settings = SchedulerSettings {
            max_concurrent: settings.max_concurrent.max(1),
            ..settings
        };
        let (state, _) = watch::channel(initial);
        let inner = Arc::new(Inner {
            settings,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            state,
            metrics: ApiMetrics::new(),
            seq: AtomicU64::new(1),
        });
        let worker = inner.clone();
        tokio::spawn(async move {
            worker.run_loop(shutdown).await;
        });
        Self { inner }
    }

    pub fn metrics(&self) -> &ApiMetrics {
        &self.inner.metrics
    }

    pub fn snapshot(&self) -> RateLimitState {
        let mut s = self.inner.state.borrow().clone();
        s.roll_over(Instant::now());
        s
    }

    pub fn status(&self) -> RateLimitStatus {
        let now = Instant::now();
        let s = self.snapshot();
        RateLimitStatus {
            remaining_requests: s.remaining_quota,
            max_requests: s.max_quota,
            queue_length: s.queued_count as u64,
            in_flight: s.in_flight_count as u64,
            is_limited: s.blocked_for(now).is_some(),
            is_healthy: s.quota_ratio() > self.inner.settings.backoff_threshold,
            resets_in_ms: s
                .quota_reset_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }

    /// Queue `request` and wait for its outcome. The closure may be invoked
    /// several times when the call is retried.
    pub async fn submit<T, F, Fut>(
        &self,
        cancel: &CancelSignal,
        label: &'static str,
        request: F,
    ) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Metered<T>, ApiError>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let (tx, rx) = oneshot::channel::<Result<T, ApiError>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let request = Arc::new(request);

        let ok_tx = tx.clone();
        let attempt: AttemptFn = Arc::new(move || {
            let request = request.clone();
            let tx = ok_tx.clone();
            async move {
                match (request.as_ref())().await {
                    Ok(Metered { value, quota }) => {
                        if let Some(tx) = take(&tx) {
                            let _ = tx.send(Ok(value));
                        }
                        Ok(quota)
                    }
                    Err(e) => Err(e),
                }
            }
            .boxed()
        });
        let reject = Box::new(move |e: ApiError| {
            if let Some(tx) = take(&tx) {
                let _ = tx.send(Err(e));
            }
        });

        let job = Job {
            id: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            label,
            attempt,
            reject,
            cancel: cancel.clone(),
            quota_retries: 0,
        };
        self.inner.push(job, false);

        let mut cancel = cancel.clone();
        tokio::select! {
            biased;
            res = rx => res.unwrap_or(Err(ApiError::Cancelled)),
            _ = cancel.cancelled() => Err(ApiError::Cancelled),
        }
    }
}

impl Inner {
    fn push(&self, job: Job, front: bool) {
        let queued = {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if front {
                q.push_front(job);
            } else {
                q.push_back(job);
            }
            q.len()
        };
        self.state.send_modify(|s| s.queued_count = queued);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        let (job, queued) = {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let job = q.pop_front();
            (job, q.len())
        };
        self.state.send_modify(|s| s.queued_count = queued);
        job
    }

    fn has_work(&self) -> bool {
        !self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut last_dispatch: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            self.state.send_if_modified(|s| s.roll_over(now));
            let (in_flight, blocked, pace) = {
                let s = self.state.borrow();
                let pace = pacing_delay(
                    s.remaining_quota,
                    s.max_quota,
                    self.settings.backoff_threshold,
                    self.settings.base_delay,
                    self.settings.max_delay,
                );
                (s.in_flight_count, s.blocked_for(now), pace)
            };

            if !self.has_work() || in_flight >= self.settings.max_concurrent {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = wait_shutdown(&mut shutdown) => {}
                }
                continue;
            }

            if let Some(wait) = blocked {
                info!("quota exhausted, holding dispatch for {}ms", wait.as_millis());
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = wait_shutdown(&mut shutdown) => {}
                }
                continue;
            }

            if let Some(last) = last_dispatch {
                let due = last + pace;
                if due > now {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = wait_shutdown(&mut shutdown) => {}
                    }
                    continue;
                }
            }

            let Some(job) = self.pop() else { continue };
            if job.cancel.is_cancelled() {
                debug!("dropping cancelled job {} ({})", job.id, job.label);
                self.metrics.cancelled();
                (job.reject)(ApiError::Cancelled);
                continue;
            }

            self.state.send_modify(|s| s.in_flight_count += 1);
            last_dispatch = Some(Instant::now());
            debug!("dispatch job {} ({}) pace={}ms", job.id, job.label, pace.as_millis());
            tokio::spawn(self.clone().execute(job));
            tokio::task::yield_now().await;
        }

        let pending = {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.drain(..).collect::<Vec<_>>()
        };
        for job in pending {
            (job.reject)(ApiError::Cancelled);
        }
        self.state.send_modify(|s| s.queued_count = 0);
        info!("request scheduler stopped");
    }

    async fn execute(self: Arc<Self>, mut job: Job) {
        let mut retries = 0u32;
        let mut last_delay = Duration::ZERO;
        loop {
            self.metrics.request();
            let started = Instant::now();
            let attempt = job.attempt.clone();
            let outcome = attempt().await;
            match outcome {
                Ok(quota) => {
                    self.metrics.success(started.elapsed().as_millis() as u64);
                    self.record_response(quota);
                    break;
                }
                Err(ApiError::QuotaExceeded { retry_after }) => {
                    let wait = retry_after.unwrap_or(self.settings.default_reset);
                    self.record_quota_exceeded(wait);
                    self.metrics.rate_limit_hit();
                    if job.quota_retries >= self.settings.max_quota_retries || job.cancel.is_cancelled() {
                        warn!("{} rate limited {} times, giving up", job.label, job.quota_retries + 1);
                        (job.reject)(ApiError::QuotaExceeded {
                            retry_after: Some(wait),
                        });
                        break;
                    }
                    job.quota_retries += 1;
                    warn!("{} rate limited, retrying in {}s", job.label, wait.as_secs());
                    self.push(job, true);
                    self.release_slot();
                    return;
                }
                Err(e) if e.is_transient() && retries < self.settings.max_retries => {
                    let delay = self.settings.retry.next_delay(retries, last_delay);
                    last_delay = delay;
                    retries += 1;
                    self.metrics.retry();
                    warn!(
                        "{} failed ({e}), retry {retries}/{} in {}ms",
                        job.label,
                        self.settings.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    if job.cancel.is_cancelled() {
                        self.metrics.cancelled();
                        (job.reject)(ApiError::Cancelled);
                        break;
                    }
                }
                Err(e) => {
                    self.metrics.failure(&e);
                    (job.reject)(e);
                    break;
                }
            }
        }
        self.release_slot();
    }

    fn release_slot(&self) {
        self.state
            .send_modify(|s| s.in_flight_count = s.in_flight_count.saturating_sub(1));
        self.notify.notify_one();
    }

    fn record_response(&self, quota: Option<QuotaHeaders>) {
        let Some(q) = quota else { return };
        let now = Instant::now();
        let wall = SystemTime::now();
        self.state.send_modify(|s| {
            s.roll_over(now);
            if let Some(limit) = q.limit.filter(|l| *l > 0) {
                s.max_quota = limit;
            }
            if let Some(remaining) = q.remaining {
                s.remaining_quota = remaining.min(s.max_quota);
            }
            if let Some(reset) = q.reset_epoch_secs {
                s.quota_reset_at = Some(now + until_epoch(reset, wall));
            }
        });
    }

    fn record_quota_exceeded(&self, wait: Duration) {
        let until = Instant::now() + wait;
        self.state.send_modify(|s| {
            s.remaining_quota = 0;
            s.quota_reset_at = Some(s.quota_reset_at.map_or(until, |at| at.max(until)));
        });
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn until_epoch(epoch_secs: u64, now: SystemTime) -> Duration {
    let target = UNIX_EPOCH + Duration::from_secs(epoch_secs);
    target.duration_since(now).unwrap_or_default()
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};

    fn fast_settings() -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(1),
            max_quota: 100,
            default_reset: Duration::from_secs(60),
            retry: Backoff {
                base: Duration::from_millis(100),
                max: Duration::from_secs(2),
                jitter: 0.15,
            },
            ..SchedulerSettings::default()
        }
    }

    fn scheduler(settings: SchedulerSettings) -> (watch::Sender<bool>, RequestScheduler) {
        let (tx, rx) = watch::channel(false);
        (tx, RequestScheduler::start(settings, rx))
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_holds_dispatch_until_reset() {
        let start = Instant::now();
        let reset_at = start + Duration::from_secs(30);
        let (_stop, sched) = {
            let (tx, rx) = watch::channel(false);
            let initial = RateLimitState {
                remaining_quota: 0,
                quota_reset_at: Some(reset_at),
                ..RateLimitState::new(100)
            };
            (tx, RequestScheduler::start_with_state(fast_settings(), initial, rx))
        };
        assert!(sched.status().is_limited);

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        sched
            .submit(&CancelSignal::never(), "after-reset", move || {
                let seen = seen2.clone();
                async move {
                    *seen.lock().unwrap() = Some(Instant::now());
                    Ok(Metered::new(()))
                }
            })
            .await
            .unwrap();

        let dispatched = seen.lock().unwrap().unwrap();
        assert!(dispatched >= reset_at);
        assert_eq!(sched.snapshot().remaining_quota, 100);
        assert!(!sched.status().is_limited);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrent() {
        let (_stop, sched) = scheduler(fast_settings());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..10).map(|i| {
            let current = current.clone();
            let peak = peak.clone();
            let sched = sched.clone();
            async move {
                sched
                    .submit(&CancelSignal::never(), "slow", move || {
                        let current = current.clone();
                        let peak = peak.clone();
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(Metered::new(i))
                        }
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(calls).await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(sched.snapshot().in_flight_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_job_is_retried_ahead_of_later_work() {
        let settings = SchedulerSettings {
            max_concurrent: 1,
            ..fast_settings()
        };
        let (_stop, sched) = scheduler(settings);
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let limited_once = Arc::new(AtomicBool::new(false));
        let start = Instant::now();

        let first = {
            let log = log.clone();
            let limited_once = limited_once.clone();
            let sched = sched.clone();
            async move {
                sched
                    .submit(&CancelSignal::never(), "first", move || {
                        let log = log.clone();
                        let limited_once = limited_once.clone();
                        async move {
                            log.lock().unwrap().push("first");
                            if !limited_once.swap(true, Ordering::SeqCst) {
                                return Err(ApiError::QuotaExceeded {
                                    retry_after: Some(Duration::from_secs(5)),
                                });
                            }
                            Ok(Metered::new(()))
                        }
                    })
                    .await
            }
        };
        let second = {
            let log = log.clone();
            let sched = sched.clone();
            async move {
                tokio::task::yield_now().await;
                sched
                    .submit(&CancelSignal::never(), "second", move || {
                        let log = log.clone();
                        async move {
                            log.lock().unwrap().push("second");
                            Ok(Metered::new(()))
                        }
                    })
                    .await
            }
        };
        let (a, b) = tokio::join!(first, second);
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(*log.lock().unwrap(), vec!["first", "first", "second"]);
        assert!(Instant::now() >= start + Duration::from_secs(5));
        assert_eq!(
            sched.metrics().rate_limit_hits.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quota_errors_surface_after_retry_budget() {
        let settings = SchedulerSettings {
            max_quota_retries: 2,
            ..fast_settings()
        };
        let (_stop, sched) = scheduler(settings);
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let res: Result<(), ApiError> = sched
            .submit(&CancelSignal::never(), "limited", move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::QuotaExceeded { retry_after: None })
                }
            })
            .await;
        assert!(matches!(res, Err(ApiError::QuotaExceeded { retry_after: Some(d) }) if d == Duration::from_secs(60)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_give_up() {
        let (_stop, sched) = scheduler(fast_settings());
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let res: Result<(), ApiError> = sched
            .submit(&CancelSignal::never(), "flaky", move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::Transient("operation timed out".into()))
                }
            })
            .await;
        assert!(matches!(res, Err(ApiError::Transient(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(sched.metrics().retries.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers() {
        let (_stop, sched) = scheduler(fast_settings());
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let res = sched
            .submit(&CancelSignal::never(), "flaky", move || {
                let a = a.clone();
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(ApiError::Transient("connection reset".into()));
                    }
                    Ok(Metered::new("ok"))
                }
            })
            .await;
        assert_eq!(res.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let (_stop, sched) = scheduler(fast_settings());
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let res: Result<(), ApiError> = sched
            .submit(&CancelSignal::never(), "bad", move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::Client {
                        status: 400,
                        message: "Profile not found".into(),
                    })
                }
            })
            .await;
        assert!(matches!(res, Err(ApiError::Client { status: 400, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_work_is_never_dispatched() {
        let (_stop, sched) = {
            let (tx, rx) = watch::channel(false);
            let initial = RateLimitState {
                remaining_quota: 0,
                quota_reset_at: Some(Instant::now() + Duration::from_secs(60)),
                ..RateLimitState::new(100)
            };
            (tx, RequestScheduler::start_with_state(fast_settings(), initial, rx))
        };
        let (cancel_tx, cancel) = CancelSignal::channel();
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let pending = {
            let sched = sched.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sched
                    .submit(&cancel, "doomed", move || {
                        let a = a.clone();
                        async move {
                            a.fetch_add(1, Ordering::SeqCst);
                            Ok(Metered::new(()))
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel_tx.send(true).unwrap();
        assert!(matches!(pending.await.unwrap(), Err(ApiError::Cancelled)));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(sched.snapshot().queued_count, 0);

        let res: Result<(), ApiError> = sched
            .submit(&cancel, "late", || async { Ok(Metered::new(())) })
            .await;
        assert!(matches!(res, Err(ApiError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn response_headers_update_shared_state() {
        let (_stop, sched) = scheduler(fast_settings());
        let reset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 300;
        sched
            .submit(&CancelSignal::never(), "metered", move || async move {
                Ok(Metered::with_quota(
                    (),
                    QuotaHeaders {
                        remaining: Some(10),
                        limit: Some(3000),
                        reset_epoch_secs: Some(reset),
                    },
                ))
            })
            .await
            .unwrap();
        let snap = sched.snapshot();
        assert_eq!(snap.remaining_quota, 10);
        assert_eq!(snap.max_quota, 3000);
        assert!(snap.quota_reset_at.is_some());
        let status = sched.status();
        assert!(!status.is_healthy);
        assert!(!status.is_limited);
    }

    async fn dispatch_offsets(settings: SchedulerSettings, initial: RateLimitState, n: usize) -> Vec<u128> {
        let (_stop, rx) = watch::channel(false);
        let sched = RequestScheduler::start_with_state(settings, initial, rx);
        let start = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let never = CancelSignal::never();
        let calls = (0..n).map(|_| {
            let seen = seen.clone();
            sched.submit(&never, "paced", move || {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(start.elapsed().as_millis());
                    Ok(Metered::new(()))
                }
            })
        });
        for res in futures_util::future::join_all(calls).await {
            res.unwrap();
        }
        let out = seen.lock().unwrap().clone();
        out
    }

    fn paced_settings() -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_threshold: 0.2,
            ..fast_settings()
        }
    }

    fn near(actual: &[u128], expected: &[u128]) -> bool {
        actual.len() == expected.len()
            && actual
                .iter()
                .zip(expected)
                .all(|(a, e)| *a >= *e && *a <= *e + 20)
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_quota_spaces_dispatches_by_base_delay() {
        let offsets = dispatch_offsets(paced_settings(), RateLimitState::new(1000), 3).await;
        assert!(near(&offsets, &[0, 100, 200]), "{offsets:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn draining_quota_stretches_dispatch_spacing() {
        let low = RateLimitState {
            remaining_quota: 10,
            ..RateLimitState::new(1000)
        };
        let offsets = dispatch_offsets(paced_settings(), low, 3).await;
        assert!(near(&offsets, &[0, 10_000, 20_000]), "{offsets:?}");

        let mid = RateLimitState {
            remaining_quota: 150,
            ..RateLimitState::new(1000)
        };
        let offsets = dispatch_offsets(paced_settings(), mid, 2).await;
        assert!(offsets[1] > 100 && offsets[1] < 10_000, "{offsets:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_queued_work() {
        let (tx, rx) = watch::channel(false);
        let initial = RateLimitState {
            remaining_quota: 0,
            quota_reset_at: Some(Instant::now() + Duration::from_secs(600)),
            ..RateLimitState::new(100)
        };
        let sched = RequestScheduler::start_with_state(fast_settings(), initial, rx);
        let pending = {
            let sched = sched.clone();
            tokio::spawn(async move {
                sched
                    .submit(&CancelSignal::never(), "queued", || async { Ok(Metered::new(())) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        assert!(matches!(pending.await.unwrap(), Err(ApiError::Cancelled)));
    }
}
