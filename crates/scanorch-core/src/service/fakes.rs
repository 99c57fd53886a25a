//! In-memory test doubles for [`super::Service`], used by executor and
//! orchestrator tests. Mirrors the grounding codebase's `FakeHarness` /
//! `NoopHarness` convention for its adapter trait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::trait_def::{ErrorKind, Service, ServiceConfig, ServiceError, ServiceOutcome};

/// A service that always succeeds (or always fails, if constructed via
/// [`FakeService::failing`]) immediately.
pub struct FakeService {
    name: String,
    outcome: FakeOutcome,
}

enum FakeOutcome {
    Success(serde_json::Value),
    Failure(ErrorKind, String),
}

impl FakeService {
    pub fn succeeding(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: FakeOutcome::Success(serde_json::json!({"ok": true})),
        }
    }

    pub fn succeeding_with(name: &str, result: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            outcome: FakeOutcome::Success(result),
        }
    }

    pub fn failing(name: &str, kind: ErrorKind, message: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: FakeOutcome::Failure(kind, message.to_string()),
        }
    }
}

#[async_trait]
impl Service for FakeService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        _normalized_url: &str,
        _config: &ServiceConfig,
    ) -> Result<ServiceOutcome, ServiceError> {
        match &self.outcome {
            FakeOutcome::Success(v) => Ok(ServiceOutcome { result: v.clone() }),
            FakeOutcome::Failure(kind, msg) => Err(ServiceError::new(*kind, msg.clone())),
        }
    }
}

/// A service that fails its first `fail_times` invocations, then succeeds.
/// Useful for exercising the retry subsystem end to end.
pub struct FlakyService {
    name: String,
    fail_times: u32,
    calls: AtomicU32,
    kind: ErrorKind,
}

impl FlakyService {
    pub fn new(name: &str, fail_times: u32, kind: ErrorKind) -> Self {
        Self {
            name: name.to_string(),
            fail_times,
            calls: AtomicU32::new(0),
            kind,
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Service for FlakyService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        _normalized_url: &str,
        _config: &ServiceConfig,
    ) -> Result<ServiceOutcome, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_times {
            Err(ServiceError::new(self.kind, "flaky failure"))
        } else {
            Ok(ServiceOutcome {
                result: serde_json::json!({"ok": true, "attempt": call}),
            })
        }
    }
}

/// A service that sleeps for `delay` before succeeding, used to exercise
/// executor/orchestrator timeout handling.
pub struct SlowService {
    name: String,
    delay: Duration,
}

impl SlowService {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl Service for SlowService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        _normalized_url: &str,
        _config: &ServiceConfig,
    ) -> Result<ServiceOutcome, ServiceError> {
        tokio::time::sleep(self.delay).await;
        Ok(ServiceOutcome {
            result: serde_json::json!({"ok": true}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_service_succeeds() {
        let svc = FakeService::succeeding("accessibility");
        let out = svc
            .run("https://example.com", &ServiceConfig::default())
            .await
            .unwrap();
        assert_eq!(out.result["ok"], true);
    }

    #[tokio::test]
    async fn fake_service_fails_with_kind() {
        let svc = FakeService::failing("backlinks", ErrorKind::Network, "refused");
        let err = svc
            .run("https://example.com", &ServiceConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
    }

    #[tokio::test]
    async fn flaky_service_succeeds_after_failures() {
        let svc = FlakyService::new("accessibility", 2, ErrorKind::Network);
        assert!(svc
            .run("https://example.com", &ServiceConfig::default())
            .await
            .is_err());
        assert!(svc
            .run("https://example.com", &ServiceConfig::default())
            .await
            .is_err());
        let ok = svc
            .run("https://example.com", &ServiceConfig::default())
            .await;
        assert!(ok.is_ok());
        assert_eq!(svc.call_count(), 3);
    }

    #[tokio::test]
    async fn slow_service_respects_delay() {
        let svc = SlowService::new("schema", Duration::from_millis(10));
        let start = tokio::time::Instant::now();
        svc.run("https://example.com", &ServiceConfig::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
