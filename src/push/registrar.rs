//! Best-effort push handle registration with bounded retry.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::client::RegistrationClient;
use super::provider::PushHandleProvider;
use crate::backoff::BackoffPolicy;

/// Where a registration sequence stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationPhase {
    #[default]
    Idle,
    /// Attempt `n` (1-based) is in flight or backing off
    Attempting(u32),
    Registered,
    /// Every attempt failed
    Exhausted,
    /// No push handle was available, nothing was sent
    Skipped,
}

/// Registration state for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PushRegistrationState {
    pub device_handle: Option<String>,
    pub session_token: Option<String>,
    pub phase: RegistrationPhase,
    /// Attempts made so far in this session
    pub attempt: u32,
}

impl PushRegistrationState {
    pub fn registered(&self) -> bool {
        self.phase == RegistrationPhase::Registered
    }
}

/// How a registration sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    Exhausted,
    Skipped,
    /// A newer session or a reset took over
    Superseded,
}

struct Inner {
    state: PushRegistrationState,
    /// Bumped whenever a sequence is started or torn down
    generation: u64,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    provider: Arc<dyn PushHandleProvider>,
    client: Arc<dyn RegistrationClient>,
    policy: Arc<dyn BackoffPolicy>,
    max_attempts: u32,
    inner: Mutex<Inner>,
}

impl Shared {
    /// Apply `f` to the state if `generation` is still current.
    fn update(&self, generation: u64, f: impl FnOnce(&mut PushRegistrationState)) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        f(&mut inner.state);
        true
    }

    async fn run(self: Arc<Self>, generation: u64, token: String) -> RegistrationOutcome {
        let handle = match self.provider.device_handle().await {
            Ok(handle) => handle,
            Err(reason) => {
                info!(%reason, "No push handle available, skipping registration");
                if !self.update(generation, |s| s.phase = RegistrationPhase::Skipped) {
                    return RegistrationOutcome::Superseded;
                }
                return RegistrationOutcome::Skipped;
            }
        };

        if !self.update(generation, |s| s.device_handle = Some(handle.clone())) {
            return RegistrationOutcome::Superseded;
        }

        for attempt in 1..=self.max_attempts {
            let current = self.update(generation, |s| {
                s.attempt = attempt;
                s.phase = RegistrationPhase::Attempting(attempt);
            });
            if !current {
                return RegistrationOutcome::Superseded;
            }

            match self.client.register(&token, &handle).await {
                Ok(()) => {
                    if !self.update(generation, |s| s.phase = RegistrationPhase::Registered) {
                        return RegistrationOutcome::Superseded;
                    }
                    info!(attempt, "Push handle registered");
                    return RegistrationOutcome::Registered;
                }
                Err(error) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        %error,
                        "Push registration attempt failed"
                    );
                }
            }

            if attempt < self.max_attempts {
                let delay = self.policy.next_delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                tokio::time::sleep(delay).await;
            }
        }

        if !self.update(generation, |s| s.phase = RegistrationPhase::Exhausted) {
            return RegistrationOutcome::Superseded;
        }
        warn!(
            max_attempts = self.max_attempts,
            "Giving up on push registration"
        );
        RegistrationOutcome::Exhausted
    }
}

/// Registers this device's push handle with the backend, once per session.
///
/// Failures are retried with backoff up to `max_attempts` times and are
/// only ever logged. A call with a new session token supersedes whatever
/// sequence is still running.
pub struct PushRegistrar {
    shared: Arc<Shared>,
}

impl PushRegistrar {
    pub fn new(
        provider: Arc<dyn PushHandleProvider>,
        client: Arc<dyn RegistrationClient>,
        policy: Arc<dyn BackoffPolicy>,
        max_attempts: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                client,
                policy,
                max_attempts: max_attempts.max(1),
                inner: Mutex::new(Inner {
                    state: PushRegistrationState::default(),
                    generation: 0,
                    task: None,
                }),
            }),
        }
    }

    /// Start registering in the background. Must be called inside a tokio runtime.
    ///
    /// Repeating the call for a session that is already registering or
    /// registered does nothing.
    pub fn register(&self, session_token: &str) {
        let mut inner = self.shared.inner.lock();
        let same_session = inner.state.session_token.as_deref() == Some(session_token);
        let running = inner.task.as_ref().is_some_and(|task| !task.is_finished());
        let active = running
            || matches!(
                inner.state.phase,
                RegistrationPhase::Attempting(_) | RegistrationPhase::Registered
            );
        if same_session && active {
            debug!("Push registration already active for this session");
            return;
        }

        let generation = Self::restart(&mut inner, session_token);
        let run = self
            .shared
            .clone()
            .run(generation, session_token.to_string())
            .instrument(info_span!("push_registration", session_id = %Uuid::new_v4()));
        inner.task = Some(tokio::spawn(async move {
            run.await;
        }));
    }

    /// Run a full registration sequence on the current task and report how it ended.
    pub async fn register_now(&self, session_token: &str) -> RegistrationOutcome {
        let generation = {
            let mut inner = self.shared.inner.lock();
            Self::restart(&mut inner, session_token)
        };
        self.shared
            .clone()
            .run(generation, session_token.to_string())
            .instrument(info_span!("push_registration", session_id = %Uuid::new_v4()))
            .await
    }

    /// Tear down on logout: cancel any running sequence and forget the session.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock();
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        inner.state = PushRegistrationState::default();
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> PushRegistrationState {
        self.shared.inner.lock().state.clone()
    }

    fn restart(inner: &mut Inner, session_token: &str) -> u64 {
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.generation += 1;
        inner.state = PushRegistrationState {
            session_token: Some(session_token.to_string()),
            ..Default::default()
        };
        inner.generation
    }
}

impl Drop for PushRegistrar {
    fn drop(&mut self) {
        if let Some(task) = self.shared.inner.lock().task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::push::client::RegistrationError;
    use crate::push::provider::{HandleUnavailable, StaticHandle};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<(), RegistrationError>>>,
        calls: Mutex<Vec<(String, String, Instant)>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<(), RegistrationError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn tokens(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(t, _, _)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl RegistrationClient for ScriptedClient {
        async fn register(&self, auth_token: &str, push_token: &str) -> Result<(), RegistrationError> {
            self.calls
                .lock()
                .push((auth_token.to_string(), push_token.to_string(), Instant::now()));
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Err(RegistrationError::Status(503)))
        }
    }

    fn assert_near(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff <= Duration::from_millis(5),
            "expected ~{:?}, got {:?}",
            expected,
            actual
        );
    }

    fn registrar(client: Arc<ScriptedClient>, provider: StaticHandle) -> PushRegistrar {
        PushRegistrar::new(
            Arc::new(provider),
            client,
            Arc::new(ExponentialBackoff::default()),
            3,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let client = ScriptedClient::new(vec![
            Err(RegistrationError::Status(500)),
            Err(RegistrationError::Transport("reset".into())),
            Ok(()),
        ]);
        let registrar = registrar(client.clone(), StaticHandle::new("device-1"));

        let outcome = registrar.register_now("token-a").await;

        assert_eq!(outcome, RegistrationOutcome::Registered);
        let calls = client.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert_near(calls[1].2 - calls[0].2, Duration::from_secs(1));
        assert_near(calls[2].2 - calls[1].2, Duration::from_secs(2));
        assert!(calls.iter().all(|(t, h, _)| t == "token-a" && h == "device-1"));

        let state = registrar.state();
        assert!(state.registered());
        assert_eq!(state.attempt, 3);
        assert_eq!(state.device_handle.as_deref(), Some("device-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let client = ScriptedClient::new(vec![]);
        let registrar = registrar(client.clone(), StaticHandle::new("device-1"));

        let outcome = registrar.register_now("token-a").await;

        assert_eq!(outcome, RegistrationOutcome::Exhausted);
        assert_eq!(client.call_count(), 3);
        assert_eq!(registrar.state().phase, RegistrationPhase::Exhausted);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_handle_skips_network() {
        let client = ScriptedClient::new(vec![Ok(())]);
        let registrar = registrar(
            client.clone(),
            StaticHandle::unavailable(HandleUnavailable::PermissionDenied),
        );

        let outcome = registrar.register_now("token-a").await;

        assert_eq!(outcome, RegistrationOutcome::Skipped);
        assert_eq!(client.call_count(), 0);
        assert_eq!(registrar.state().phase, RegistrationPhase::Skipped);
        assert_eq!(registrar.state().attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_register_reaches_registered() {
        let client = ScriptedClient::new(vec![Err(RegistrationError::Status(500)), Ok(())]);
        let registrar = registrar(client.clone(), StaticHandle::new("device-1"));

        registrar.register("token-a");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(registrar.state().registered());
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_session_register_is_noop() {
        let client = ScriptedClient::new(vec![]);
        let registrar = registrar(client.clone(), StaticHandle::new("device-1"));

        registrar.register("token-a");
        tokio::time::sleep(Duration::from_millis(500)).await;
        registrar.register("token-a");
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(client.call_count(), 3);
    }

    /// Hands out a device handle only after a delay, counting requests.
    struct SlowHandle {
        delay: Duration,
        requests: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl PushHandleProvider for SlowHandle {
        async fn device_handle(&self) -> Result<String, HandleUnavailable> {
            self.requests.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok("device-1".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_session_register_while_fetching_handle_is_noop() {
        let client = ScriptedClient::new(vec![Ok(())]);
        let provider = Arc::new(SlowHandle {
            delay: Duration::from_secs(2),
            requests: Default::default(),
        });
        let registrar = PushRegistrar::new(
            provider.clone(),
            client.clone(),
            Arc::new(ExponentialBackoff::default()),
            3,
        );

        registrar.register("token-a");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registrar.state().phase, RegistrationPhase::Idle);
        registrar.register("token-a");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(provider.requests.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(client.call_count(), 1);
        assert!(registrar.state().registered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_supersedes_running_sequence() {
        let client = ScriptedClient::new(vec![]);
        let registrar = registrar(client.clone(), StaticHandle::new("device-1"));

        registrar.register("token-a");
        tokio::time::sleep(Duration::from_millis(500)).await;
        registrar.register("token-b");
        assert_eq!(registrar.state().attempt, 0);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(
            client.tokens(),
            vec!["token-a", "token-b", "token-b", "token-b"]
        );
        let state = registrar.state();
        assert_eq!(state.session_token.as_deref(), Some("token-b"));
        assert_eq!(state.phase, RegistrationPhase::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_retry() {
        let client = ScriptedClient::new(vec![]);
        let registrar = registrar(client.clone(), StaticHandle::new("device-1"));

        registrar.register("token-a");
        tokio::time::sleep(Duration::from_millis(500)).await;
        registrar.reset();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(client.call_count(), 1);
        assert_eq!(registrar.state(), PushRegistrationState::default());
    }
}
