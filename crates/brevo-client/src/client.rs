//! Brevo client with rate limiting, circuit breaking and retries.

use crate::circuit::{CircuitBreaker, CircuitSnapshot};
use crate::rate_limit::RateWindow;
use crate::{
    BrevoClientConfig, BrevoContact, Clock, ContactTransport, DeliveryError, HttpTransport,
    SystemClock, TransportError, TransportResponse,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Error bodies longer than this are cut and suffixed with `...`.
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Cap for a single backoff sleep.
const MAX_BACKOFF_SECS: f64 = 3600.0;

/// Successful delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResponse {
    /// Brevo accepted the request. Empty or non-JSON bodies become `{}`.
    Delivered { status: u16, body: Value },
    /// Dry-run mode: nothing was sent.
    DryRun,
}

struct ClientState {
    rate: RateWindow,
    circuit: CircuitBreaker,
}

enum Outcome {
    Success(DeliveryResponse),
    Transient(String),
    Fatal(String),
}

/// Brevo contacts client.
///
/// One instance sends one request at a time: the rate window and circuit
/// breaker are locked for the whole of `deliver`, including backoff sleeps.
pub struct BrevoClient {
    config: BrevoClientConfig,
    transport: Arc<dyn ContactTransport>,
    clock: Arc<dyn Clock>,
    state: Mutex<ClientState>,
}

impl BrevoClient {
    /// Create a client that talks HTTP on the wall clock.
    pub fn new(config: BrevoClientConfig) -> Result<Self, TransportError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_parts(
            config,
            Arc::new(transport),
            Arc::new(SystemClock),
        ))
    }

    /// Create a client over an explicit transport and clock.
    pub fn with_parts(
        config: BrevoClientConfig,
        transport: Arc<dyn ContactTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = ClientState {
            rate: RateWindow::new(config.max_requests_per_minute),
            circuit: CircuitBreaker::new(
                config.circuit_error_threshold,
                config.circuit_open_duration(),
            ),
        };

        Self {
            config,
            transport,
            clock,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &BrevoClientConfig {
        &self.config
    }

    pub async fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.state.lock().await.circuit.snapshot()
    }

    /// Alias for [`BrevoClient::deliver`].
    pub async fn create_or_update_contact(
        &self,
        contact: &BrevoContact,
    ) -> Result<DeliveryResponse, DeliveryError> {
        self.deliver(contact).await
    }

    /// Create or update one contact.
    ///
    /// Transient failures are retried up to `max_retries` times with
    /// exponential backoff. Fatal failures return after one request. An open
    /// circuit fails fast without a request.
    pub async fn deliver(&self, contact: &BrevoContact) -> Result<DeliveryResponse, DeliveryError> {
        let payload = contact.to_payload();

        info!(
            email = %contact.email,
            lists = ?contact.list_ids,
            dry_run = self.config.dry_run,
            "Sending contact to Brevo"
        );

        if self.config.dry_run {
            info!(email = %contact.email, payload = %payload, "Brevo dry run, request not sent");
            return Ok(DeliveryResponse::DryRun);
        }

        if !self.config.has_api_key() {
            return Err(DeliveryError::Validation(
                "Brevo API key is not configured".to_string(),
            ));
        }
        if contact.email.trim().is_empty() {
            return Err(DeliveryError::Validation("Contact email is empty".to_string()));
        }

        let mut state = self.state.lock().await;
        // A deadline past the end of `Instant` can never be reached.
        let deadline = self
            .config
            .overall_deadline()
            .and_then(|d| self.clock.now().checked_add(d));
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            self.wait_for_rate_slot(&mut state).await;

            if let Err(remaining) = state.circuit.check(self.clock.now()) {
                warn!(
                    email = %contact.email,
                    remaining_secs = remaining.as_secs_f64(),
                    "Brevo circuit breaker is open, failing fast"
                );
                return Err(DeliveryError::Transient(format!(
                    "Circuit breaker is open, retry in {:.1}s",
                    remaining.as_secs_f64()
                )));
            }

            let sent_at = self.clock.now();
            let result = self.transport.post_contact(&payload).await;
            state.rate.record(sent_at);

            match classify(result) {
                Outcome::Success(response) => {
                    state.circuit.record_success();
                    debug!(email = %contact.email, attempt, "Brevo request succeeded");
                    return Ok(response);
                }
                Outcome::Fatal(message) => {
                    error!(email = %contact.email, attempt, error = %message, "Brevo request rejected");
                    return Err(DeliveryError::Fatal(message));
                }
                Outcome::Transient(message) => {
                    state.circuit.record_transient(self.clock.now());

                    if attempt > self.config.max_retries {
                        error!(
                            email = %contact.email,
                            attempt,
                            error = %message,
                            "Brevo request failed, retries exhausted"
                        );
                        return Err(DeliveryError::Transient(message));
                    }

                    let delay = backoff_delay(self.config.base_backoff_seconds, attempt);
                    if let Some(deadline) = deadline {
                        let wake = self.clock.now().checked_add(delay);
                        if wake.map_or(true, |wake| wake > deadline) {
                            warn!(
                                email = %contact.email,
                                attempt,
                                error = %message,
                                "Brevo retry would pass the overall deadline, giving up"
                            );
                            return Err(DeliveryError::Transient(message));
                        }
                    }

                    warn!(
                        email = %contact.email,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %message,
                        "Brevo request failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    async fn wait_for_rate_slot(&self, state: &mut ClientState) {
        while let Some(wait) = state.rate.delay(self.clock.now()) {
            if wait.is_zero() {
                break;
            }
            info!(
                wait_secs = wait.as_secs_f64(),
                limit = self.config.max_requests_per_minute,
                "Brevo rate limit reached, waiting"
            );
            self.clock.sleep(wait).await;
        }
    }
}

fn classify(result: Result<TransportResponse, TransportError>) -> Outcome {
    let response = match result {
        Ok(response) => response,
        Err(e) => return Outcome::Transient(format!("Brevo request failed: {e}")),
    };

    match response.status {
        status if status < 400 => Outcome::Success(DeliveryResponse::Delivered {
            status,
            body: parse_body(&response.body),
        }),
        429 => Outcome::Transient(format!(
            "Brevo rate limited (429): {}",
            truncate_body(&response.body)
        )),
        status if status >= 500 => Outcome::Transient(format!(
            "Brevo server error {status}: {}",
            truncate_body(&response.body)
        )),
        status => Outcome::Fatal(format!(
            "Brevo API error {status}: {}",
            truncate_body(&response.body)
        )),
    }
}

fn parse_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::Object(Map::new()))
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let head: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    format!("{head}...")
}

/// `base * 2^(attempt - 1)`: 1s, 2s, 4s... for a 1s base.
fn backoff_delay(base_secs: f64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16) as i32;
    let secs = (base_secs.max(0.0) * 2f64.powi(exp)).min(MAX_BACKOFF_SECS);
    Duration::try_from_secs_f64(secs).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Returns scripted responses in order, then 200 `{}`.
    #[derive(Default)]
    struct ScriptedTransport {
        script: SyncMutex<VecDeque<Result<TransportResponse, TransportError>>>,
        payloads: SyncMutex<Vec<Value>>,
    }

    impl ScriptedTransport {
        fn new(statuses: &[u16]) -> Arc<Self> {
            let transport = Self::default();
            for status in statuses {
                transport.push(Ok(response(*status, "{}")));
            }
            Arc::new(transport)
        }

        fn push(&self, result: Result<TransportResponse, TransportError>) {
            self.script.lock().push_back(result);
        }

        fn calls(&self) -> usize {
            self.payloads.lock().len()
        }
    }

    #[async_trait]
    impl ContactTransport for ScriptedTransport {
        async fn post_contact(
            &self,
            payload: &Value,
        ) -> Result<TransportResponse, TransportError> {
            self.payloads.lock().push(payload.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(response(200, "{}")))
        }
    }

    fn response(status: u16, body: &str) -> TransportResponse {
        TransportResponse {
            status,
            body: body.to_string(),
        }
    }

    fn config() -> BrevoClientConfig {
        BrevoClientConfig {
            api_key: "test-key".to_string(),
            circuit_error_threshold: 100,
            ..Default::default()
        }
    }

    fn client(
        config: BrevoClientConfig,
        transport: &Arc<ScriptedTransport>,
        clock: &Arc<ManualClock>,
    ) -> BrevoClient {
        BrevoClient::with_parts(config, transport.clone(), clock.clone())
    }

    fn contact() -> BrevoContact {
        BrevoContact::new("a@x.com").with_list(7)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let transport = ScriptedTransport::new(&[500, 503, 200]);
        let clock = Arc::new(ManualClock::new());
        let client = client(config(), &transport, &clock);

        let result = client.deliver(&contact()).await.unwrap();

        assert!(matches!(result, DeliveryResponse::Delivered { status: 200, .. }));
        assert_eq!(transport.calls(), 3);
        assert_eq!(clock.sleeps(), vec![secs(1), secs(2)]);
    }

    #[tokio::test]
    async fn test_persistent_transient_stops_after_max_retries() {
        let transport = ScriptedTransport::new(&[500; 10]);
        let clock = Arc::new(ManualClock::new());
        let client = client(config(), &transport, &clock);

        let err = client.deliver(&contact()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Transient(_)));
        assert!(err.message().contains("500"));
        assert_eq!(transport.calls(), 4);
        assert_eq!(clock.sleeps(), vec![secs(1), secs(2), secs(4)]);
    }

    #[tokio::test]
    async fn test_fatal_is_never_retried() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(response(400, r#"{"code":"invalid_parameter"}"#)));
        let clock = Arc::new(ManualClock::new());
        let client = client(config(), &transport, &clock);

        let err = client.deliver(&contact()).await.unwrap_err();

        assert_eq!(
            err,
            DeliveryError::Fatal(r#"Brevo API error 400: {"code":"invalid_parameter"}"#.to_string())
        );
        assert_eq!(transport.calls(), 1);
        assert!(clock.sleeps().is_empty());
        assert_eq!(client.circuit_snapshot().await.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_and_network_errors_are_transient() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(response(429, "slow down")));
        transport.push(Err(TransportError::Timeout(secs(10))));
        transport.push(Err(TransportError::Connect("refused".to_string())));
        let clock = Arc::new(ManualClock::new());
        let client = client(config(), &transport, &clock);

        assert!(client.deliver(&contact()).await.is_ok());
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_circuit_opens_at_threshold_and_fails_fast() {
        let transport = ScriptedTransport::new(&[500, 500, 500]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                max_retries: 0,
                circuit_error_threshold: 3,
                circuit_open_seconds: 60,
                ..config()
            },
            &transport,
            &clock,
        );

        for expected in 1..=2 {
            assert!(client.deliver(&contact()).await.is_err());
            let snapshot = client.circuit_snapshot().await;
            assert_eq!(snapshot.consecutive_errors, expected);
            assert!(snapshot.open_until.is_none());
        }
        assert!(client.deliver(&contact()).await.is_err());
        assert!(client.circuit_snapshot().await.open_until.is_some());
        assert_eq!(transport.calls(), 3);

        clock.advance(secs(30));
        let err = client.deliver(&contact()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transient(_)));
        assert!(err.message().contains("Circuit breaker is open"));
        assert_eq!(transport.calls(), 3);

        clock.advance(secs(30));
        transport.push(Ok(response(500, "still down")));
        assert!(client.deliver(&contact()).await.is_err());
        assert_eq!(transport.calls(), 4);
        let snapshot = client.circuit_snapshot().await;
        assert_eq!(snapshot.consecutive_errors, 1);
        assert!(snapshot.open_until.is_none());
    }

    #[tokio::test]
    async fn test_circuit_opened_mid_sequence_ends_retries() {
        let transport = ScriptedTransport::new(&[500; 10]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                max_retries: 5,
                circuit_error_threshold: 2,
                ..config()
            },
            &transport,
            &clock,
        );

        let err = client.deliver(&contact()).await.unwrap_err();
        assert!(err.message().contains("Circuit breaker is open"));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_errors() {
        let transport = ScriptedTransport::new(&[500, 500, 200]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                max_retries: 0,
                circuit_error_threshold: 5,
                ..config()
            },
            &transport,
            &clock,
        );

        assert!(client.deliver(&contact()).await.is_err());
        assert!(client.deliver(&contact()).await.is_err());
        assert_eq!(client.circuit_snapshot().await.consecutive_errors, 2);

        assert!(client.deliver(&contact()).await.is_ok());
        let snapshot = client.circuit_snapshot().await;
        assert_eq!(snapshot.consecutive_errors, 0);
        assert!(snapshot.open_until.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_only_above_limit() {
        let transport = ScriptedTransport::new(&[]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                max_requests_per_minute: 3,
                ..config()
            },
            &transport,
            &clock,
        );

        for _ in 0..3 {
            client.deliver(&contact()).await.unwrap();
            clock.advance(secs(20));
        }
        assert!(clock.sleeps().is_empty());

        // Calls went out at 0s, 20s and 40s; now is 60s so the first aged out.
        client.deliver(&contact()).await.unwrap();
        assert!(clock.sleeps().is_empty());

        // Window holds 20s, 40s, 60s at 60s: wait until 20s turns 60s old.
        client.deliver(&contact()).await.unwrap();
        assert_eq!(clock.sleeps(), vec![secs(20)]);
        assert_eq!(clock.elapsed(), secs(80));
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test]
    async fn test_burst_waits_full_window() {
        let transport = ScriptedTransport::new(&[]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                max_requests_per_minute: 2,
                ..config()
            },
            &transport,
            &clock,
        );

        client.deliver(&contact()).await.unwrap();
        client.deliver(&contact()).await.unwrap();
        client.deliver(&contact()).await.unwrap();

        assert_eq!(clock.sleeps(), vec![secs(60)]);
    }

    #[tokio::test]
    async fn test_failed_attempts_count_against_rate_window() {
        let transport = ScriptedTransport::new(&[500, 500, 200]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                max_requests_per_minute: 2,
                ..config()
            },
            &transport,
            &clock,
        );

        client.deliver(&contact()).await.unwrap();

        // Backoff 1s and 2s, then wait for the 0s attempt to age out at 60s.
        assert_eq!(clock.sleeps(), vec![secs(1), secs(2), secs(57)]);
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let transport = ScriptedTransport::new(&[500]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                dry_run: true,
                api_key: String::new(),
                ..config()
            },
            &transport,
            &clock,
        );

        let result = client.create_or_update_contact(&contact()).await.unwrap();
        assert_eq!(result, DeliveryResponse::DryRun);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_validation_error() {
        let transport = ScriptedTransport::new(&[]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                api_key: "  ".to_string(),
                ..config()
            },
            &transport,
            &clock,
        );

        let err = client.deliver(&contact()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_long_error_body_is_truncated() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(response(422, &"x".repeat(500))));
        let clock = Arc::new(ManualClock::new());
        let client = client(config(), &transport, &clock);

        let err = client.deliver(&contact()).await.unwrap_err();
        let expected = format!("Brevo API error 422: {}...", "x".repeat(200));
        assert_eq!(err, DeliveryError::Fatal(expected));
    }

    #[tokio::test]
    async fn test_empty_or_invalid_success_body_is_tolerated() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(Ok(response(204, "")));
        transport.push(Ok(response(201, r#"{"id": 42}"#)));
        transport.push(Ok(response(200, "<html>ok</html>")));
        let clock = Arc::new(ManualClock::new());
        let client = client(config(), &transport, &clock);

        assert_eq!(
            client.deliver(&contact()).await.unwrap(),
            DeliveryResponse::Delivered {
                status: 204,
                body: json!({})
            }
        );
        assert_eq!(
            client.deliver(&contact()).await.unwrap(),
            DeliveryResponse::Delivered {
                status: 201,
                body: json!({"id": 42})
            }
        );
        assert_eq!(
            client.deliver(&contact()).await.unwrap(),
            DeliveryResponse::Delivered {
                status: 200,
                body: json!({})
            }
        );
    }

    #[tokio::test]
    async fn test_overall_deadline_bounds_retries() {
        let transport = ScriptedTransport::new(&[500; 10]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                overall_deadline_secs: Some(2),
                ..config()
            },
            &transport,
            &clock,
        );

        let err = client.deliver(&contact()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transient(_)));
        assert_eq!(transport.calls(), 2);
        assert_eq!(clock.sleeps(), vec![secs(1)]);
    }

    #[tokio::test]
    async fn test_out_of_range_durations_do_not_panic() {
        let transport = ScriptedTransport::new(&[500]);
        let clock = Arc::new(ManualClock::new());
        let client = client(
            BrevoClientConfig {
                max_retries: 1,
                circuit_error_threshold: 1,
                circuit_open_seconds: u64::MAX,
                overall_deadline_secs: Some(u64::MAX),
                ..config()
            },
            &transport,
            &clock,
        );

        let err = client.deliver(&contact()).await.unwrap_err();
        assert!(err.message().contains("Circuit breaker is open"));
        assert_eq!(transport.calls(), 1);

        // The cool-down is capped, so the circuit closes again.
        clock.advance(crate::circuit::MAX_OPEN_DURATION);
        assert!(client.deliver(&contact()).await.is_ok());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_sends_wire_payload() {
        let transport = ScriptedTransport::new(&[]);
        let clock = Arc::new(ManualClock::new());
        let client = client(config(), &transport, &clock);

        client
            .deliver(&contact().with_attribute("FUNNEL_TYPE", "language"))
            .await
            .unwrap();

        assert_eq!(
            transport.payloads.lock()[0],
            json!({
                "email": "a@x.com",
                "updateEnabled": true,
                "listIds": [7],
                "attributes": {"FUNNEL_TYPE": "language"}
            })
        );
    }

    #[test]
    fn test_backoff_delay_doubles() {
        assert_eq!(backoff_delay(1.0, 1), secs(1));
        assert_eq!(backoff_delay(1.0, 2), secs(2));
        assert_eq!(backoff_delay(1.0, 3), secs(4));
        assert_eq!(backoff_delay(0.5, 2), secs(1));
        assert_eq!(backoff_delay(-1.0, 3), Duration::ZERO);
        assert_eq!(backoff_delay(1.0, 40), secs(3600));
    }
}
