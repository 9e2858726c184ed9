use futures_util::future::{BoxFuture, FutureExt};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use voxlink_runtime::{lock, Clock, RetryPolicy, Scheduler, TimerHandle};
use voxlink_types::Credential;

use crate::config::CredentialSettings;
use crate::error::CredentialError;
use crate::source::{CredentialOptions, CredentialSource};

/// Fetches, caches, and proactively renews the session credential.
#[derive(Clone)]
pub struct CredentialProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    source: Arc<dyn CredentialSource>,
    options: CredentialOptions,
    policy: RetryPolicy,
    refresh_buffer: Duration,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    state: Mutex<ProviderState>,
}

#[derive(Default)]
struct ProviderState {
    cached: Option<CachedCredential>,
    refresh_timer: Option<TimerHandle>,
    /// Bumped by `clear`; results of requests started before a clear are
    /// returned to their caller but never cached.
    generation: u64,
}

struct CachedCredential {
    user_id: String,
    credential: Credential,
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("CredentialProvider")
            .field("cached", &state.cached.as_ref().map(|c| &c.credential))
            .field("refresh_scheduled", &state.refresh_timer.is_some())
            .finish()
    }
}

impl CredentialProvider {
    pub fn new(
        source: Arc<dyn CredentialSource>,
        settings: &CredentialSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_policy(
            source,
            CredentialOptions::from_settings(settings),
            settings.retry_policy(),
            settings.refresh_buffer(),
            clock,
        )
    }

    pub fn with_policy(
        source: Arc<dyn CredentialSource>,
        options: CredentialOptions,
        policy: RetryPolicy,
        refresh_buffer: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                source,
                options,
                policy,
                refresh_buffer,
                clock,
                scheduler: Scheduler::new(),
                state: Mutex::new(ProviderState::default()),
            }),
        }
    }

    /// Fetches a fresh credential, retrying transient failures.
    ///
    /// 401/403 abort immediately. When every attempt fails transiently the
    /// result is [`CredentialError::Exhausted`].
    pub async fn request_credential(
        &self,
        user_id: &str,
        options: &CredentialOptions,
    ) -> Result<Credential, CredentialError> {
        self.inner.request(user_id, options).await
    }

    /// Returns the cached credential while it is outside the refresh buffer,
    /// otherwise fetches a new one.
    pub async fn get_valid_credential(&self, user_id: &str) -> Result<Credential, CredentialError> {
        if let Some(credential) = self.cached_for(user_id) {
            return Ok(credential);
        }
        let options = self.inner.options.clone();
        self.inner.request(user_id, &options).await
    }

    /// The cached credential if it is still fresh for `user_id`.
    fn cached_for(&self, user_id: &str) -> Option<Credential> {
        let now = self.inner.clock.now_ms();
        let buffer = self.inner.refresh_buffer.as_millis() as i64;
        let state = lock(&self.inner.state);
        state
            .cached
            .as_ref()
            .filter(|c| c.user_id == user_id && c.credential.is_fresh(now, buffer))
            .map(|c| c.credential.clone())
    }

    /// The cached credential regardless of freshness.
    pub fn cached(&self) -> Option<Credential> {
        lock(&self.inner.state)
            .cached
            .as_ref()
            .map(|c| c.credential.clone())
    }

    pub fn refresh_scheduled(&self) -> bool {
        lock(&self.inner.state)
            .refresh_timer
            .as_ref()
            .is_some_and(TimerHandle::is_pending)
    }

    /// Cancels the refresh timer and drops the cached credential. Idempotent.
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        if let Some(timer) = state.refresh_timer.take() {
            timer.cancel();
        }
        state.cached = None;
        state.generation += 1;
    }
}

impl ProviderInner {
    async fn request(
        self: &Arc<Self>,
        user_id: &str,
        options: &CredentialOptions,
    ) -> Result<Credential, CredentialError> {
        let generation = lock(&self.state).generation;
        let max_attempts = self.policy.max_attempts();
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match self.source.fetch(user_id, options).await {
                Ok(credential) => {
                    self.install(user_id, options, &credential, generation);
                    return Ok(credential);
                }
                Err(e) if e.is_fatal() => {
                    tracing::warn!(user_id, "credential request rejected: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    let remaining = max_attempts - attempt - 1;
                    tracing::warn!(user_id, attempt = attempt + 1, remaining, "credential request failed: {}", e);
                    last_error = Some(e);
                    if remaining > 0 {
                        tokio::time::sleep(self.policy.next_delay(attempt)).await;
                    }
                }
            }
        }

        Err(CredentialError::Exhausted {
            attempts: max_attempts,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn install(
        self: &Arc<Self>,
        user_id: &str,
        options: &CredentialOptions,
        credential: &Credential,
        generation: u64,
    ) {
        let mut state = lock(&self.state);
        if state.generation != generation {
            tracing::debug!("credential arrived after clear, not caching");
            return;
        }
        if let Some(previous) = state.refresh_timer.take() {
            previous.cancel();
        }
        state.cached = Some(CachedCredential {
            user_id: user_id.to_string(),
            credential: credential.clone(),
        });

        let Some(expires_at) = credential.expires_at_ms else {
            return;
        };
        let refresh_at = expires_at - self.refresh_buffer.as_millis() as i64;
        let delay = Duration::from_millis((refresh_at - self.clock.now_ms()).max(0) as u64);

        let weak = Arc::downgrade(self);
        let user_id = user_id.to_string();
        let options = options.clone();
        state.refresh_timer = Some(self.scheduler.schedule(delay, move || {
            background_refresh(weak, user_id, options)
        }));
        tracing::debug!(delay_ms = delay.as_millis() as u64, "scheduled credential refresh");
    }
}

/// Renews the credential from a timer. Failures are only logged: the next
/// `get_valid_credential` call retries synchronously.
fn background_refresh(
    inner: Weak<ProviderInner>,
    user_id: String,
    options: CredentialOptions,
) -> BoxFuture<'static, ()> {
    async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.request(&user_id, &options).await {
            Ok(_) => tracing::info!(user_id = %user_id, "refreshed participant credential"),
            Err(e) => tracing::warn!(user_id = %user_id, "background credential refresh failed: {}", e),
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use voxlink_runtime::ManualClock;

    const EXPIRES_AT: i64 = 10_000_000;

    type Script = Box<dyn Fn(usize) -> Result<Credential, CredentialError> + Send + Sync>;

    struct ScriptedSource {
        calls: AtomicUsize,
        script: Script,
    }

    impl ScriptedSource {
        fn new(script: impl Fn(usize) -> Result<Credential, CredentialError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Box::new(script),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialSource for ScriptedSource {
        async fn fetch(
            &self,
            _user_id: &str,
            _options: &CredentialOptions,
        ) -> Result<Credential, CredentialError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(call)
        }
    }

    fn credential(token: &str, expires_at_ms: Option<i64>) -> Credential {
        Credential {
            value: token.to_string(),
            expires_at_ms,
            server_url: "wss://rtc.example.org".to_string(),
            room_name: "room".to_string(),
            participant_name: "alice".to_string(),
        }
    }

    fn provider(source: Arc<ScriptedSource>, clock: Arc<ManualClock>) -> CredentialProvider {
        let policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(8))
            .with_max_attempts(5);
        CredentialProvider::with_policy(
            source,
            CredentialOptions::default(),
            policy,
            Duration::from_secs(60),
            clock,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn serves_cache_until_refresh_buffer() {
        let source = ScriptedSource::new(|n| Ok(credential(&format!("t{n}"), Some(EXPIRES_AT))));
        let clock = Arc::new(ManualClock::new(0));
        let provider = provider(source.clone(), clock.clone());

        let first = provider.get_valid_credential("alice").await.unwrap();
        assert_eq!(first.value, "t0");

        clock.set(EXPIRES_AT - 61_000);
        let cached = provider.get_valid_credential("alice").await.unwrap();
        assert_eq!(cached.value, "t0");
        assert_eq!(source.calls(), 1);

        clock.set(EXPIRES_AT - 59_000);
        let refreshed = provider.get_valid_credential("alice").await.unwrap();
        assert_eq!(refreshed.value, "t1");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_scoped_to_user() {
        let source = ScriptedSource::new(|n| Ok(credential(&format!("t{n}"), None)));
        let provider = provider(source.clone(), Arc::new(ManualClock::new(0)));

        provider.get_valid_credential("alice").await.unwrap();
        provider.get_valid_credential("alice").await.unwrap();
        assert_eq!(source.calls(), 1);

        let bob = provider.get_valid_credential("bob").await.unwrap();
        assert_eq!(bob.value, "t1");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_is_not_retried() {
        let source = ScriptedSource::new(|_| Err(CredentialError::Unauthorized { status: 401 }));
        let provider = provider(source.clone(), Arc::new(ManualClock::new(0)));

        let err = provider.get_valid_credential("alice").await.unwrap_err();
        assert_eq!(err, CredentialError::Unauthorized { status: 401 });
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_exhausted() {
        let source = ScriptedSource::new(|_| Err(CredentialError::Http { status: 503 }));
        let provider = provider(source.clone(), Arc::new(ManualClock::new(0)));

        let started = tokio::time::Instant::now();
        let err = provider.get_valid_credential("alice").await.unwrap_err();
        assert!(matches!(err, CredentialError::Exhausted { attempts: 5, .. }));
        assert_eq!(source.calls(), 5);
        // 500 + 1000 + 2000 + 4000 ms between the five attempts.
        assert_eq!(started.elapsed(), Duration::from_millis(7_500));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let source = ScriptedSource::new(|n| {
            if n < 2 {
                Err(CredentialError::Request("connection refused".into()))
            } else {
                Ok(credential("ok", None))
            }
        });
        let provider = provider(source.clone(), Arc::new(ManualClock::new(0)));

        let cred = provider.get_valid_credential("alice").await.unwrap();
        assert_eq!(cred.value, "ok");
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn renews_in_background_before_expiry() {
        let source = ScriptedSource::new(|n| Ok(credential(&format!("t{n}"), Some(120_000))));
        let provider = provider(source.clone(), Arc::new(ManualClock::new(0)));

        provider.get_valid_credential("alice").await.unwrap();
        assert!(provider.refresh_scheduled());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.calls(), 2);
        assert_eq!(provider.cached().unwrap().value, "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_failure_keeps_previous_credential() {
        let source = ScriptedSource::new(|n| {
            if n == 0 {
                Ok(credential("first", Some(120_000)))
            } else {
                Err(CredentialError::Unauthorized { status: 403 })
            }
        });
        let provider = provider(source.clone(), Arc::new(ManualClock::new(0)));

        provider.get_valid_credential("alice").await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(source.calls(), 2);
        assert_eq!(provider.cached().unwrap().value, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_refresh_and_is_idempotent() {
        let source = ScriptedSource::new(|_| Ok(credential("t", Some(120_000))));
        let provider = provider(source.clone(), Arc::new(ManualClock::new(0)));

        provider.get_valid_credential("alice").await.unwrap();
        provider.clear();
        provider.clear();

        assert!(provider.cached().is_none());
        assert!(!provider.refresh_scheduled());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.calls(), 1);
    }
}
