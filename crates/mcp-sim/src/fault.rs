//! Fault policies for the simulated server.
//!
//! A [`FaultPolicy`] decides, per operation, whether the simulator fails and
//! how long it takes. [`RandomFaults`] reproduces a flaky production link
//! from configured rates, [`NoFaults`] is instant and reliable, and
//! [`ScriptedFaults`] replays a queue of faults for deterministic tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use mcp_protocol::ErrorCode;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Operations the simulator can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Disconnect,
    CallTool,
    RequestResource,
    ServerInfo,
    HandleInput,
    StartSpeech,
    AudioChunk,
    EndSpeech,
    /// Opening a session's event stream.
    OpenStream,
}

/// An injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Link dropped mid-request.
    Network,
    /// No answer; the simulator waits twice its usual latency first.
    Timeout,
    /// The server reports itself overloaded (status 503).
    ServerOverload,
    /// A coded failure such as `authentication_error`.
    Coded(ErrorCode),
    /// The server answers, but declines (`connect` returns `false`).
    Decline,
}

/// What happens to one word of a streamed transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordFate {
    Deliver,
    /// Replaced by a similar-sounding word.
    Misrecognize,
    /// Lost in transit; later words still arrive.
    Drop,
    /// The stream fails with this code and ends.
    Fail(ErrorCode),
}

pub trait FaultPolicy: Send + Sync + 'static {
    /// Fault to inject into `op`, if any.
    fn fault(&self, op: Operation) -> Option<Fault>;

    /// Simulated latency of `op`.
    fn latency(&self, op: Operation) -> Duration;

    /// Fate of the word at `index` in a streamed transcription.
    fn word(&self, index: usize) -> WordFate;

    /// Whether a filler word is inserted after the current word.
    fn noise(&self) -> bool {
        false
    }

    /// Whether a processed request fails after its transport succeeded
    /// (final transcription failure, text processing error).
    fn processing_fails(&self) -> bool;

    /// Confidence reported for a partial (`final_result = false`) or
    /// completed transcription.
    fn confidence(&self, final_result: bool) -> f32;
}

// ─────────────────────────────────────────────────────────────────────────────
// Random faults
// ─────────────────────────────────────────────────────────────────────────────

/// Rates and delays of [`RandomFaults`]. Rates are probabilities in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// General processing failure rate
    pub error_rate: f64,
    pub network_error_rate: f64,
    pub server_overload_rate: f64,
    pub timeout_rate: f64,
    /// Chance of a filler word after each streamed word
    pub transcription_variability: f64,
    /// Chance of a misrecognised word
    pub transcription_error_rate: f64,
    /// Latency jitter as a fraction of `min_delay_ms`
    pub jitter_factor: f64,
    pub packet_loss_rate: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 200,
            max_delay_ms: 2000,
            error_rate: 0.05,
            network_error_rate: 0.02,
            server_overload_rate: 0.01,
            timeout_rate: 0.02,
            transcription_variability: 0.1,
            transcription_error_rate: 0.05,
            jitter_factor: 0.2,
            packet_loss_rate: 0.01,
        }
    }
}

/// Faults drawn at random from a [`SimConfig`].
#[derive(Debug, Clone, Default)]
pub struct RandomFaults {
    config: SimConfig,
}

impl RandomFaults {
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }
}

fn chance(rate: f64) -> bool {
    rand::rng().random_bool(rate.clamp(0.0, 1.0))
}

impl FaultPolicy for RandomFaults {
    fn fault(&self, _op: Operation) -> Option<Fault> {
        if chance(self.config.network_error_rate) {
            Some(Fault::Network)
        } else if chance(self.config.timeout_rate) {
            Some(Fault::Timeout)
        } else if chance(self.config.server_overload_rate) {
            Some(Fault::ServerOverload)
        } else {
            None
        }
    }

    fn latency(&self, _op: Operation) -> Duration {
        let min = self.config.min_delay_ms as f64;
        let max = (self.config.max_delay_ms as f64).max(min);
        let mut rng = rand::rng();
        let mut wait = if max > min { rng.random_range(min..max) } else { min };
        if self.config.jitter_factor > 0.0 {
            wait += rng.random_range(-1.0..1.0) * self.config.jitter_factor * min;
        }
        Duration::from_millis(wait.max(10.0) as u64)
    }

    fn word(&self, _index: usize) -> WordFate {
        if chance(self.config.packet_loss_rate) {
            WordFate::Drop
        } else if chance(self.config.network_error_rate) {
            WordFate::Fail(ErrorCode::NetworkError)
        } else if chance(self.config.timeout_rate) {
            WordFate::Fail(ErrorCode::TimeoutError)
        } else if chance(self.config.transcription_error_rate) {
            WordFate::Misrecognize
        } else {
            WordFate::Deliver
        }
    }

    fn noise(&self) -> bool {
        chance(self.config.transcription_variability)
    }

    fn processing_fails(&self) -> bool {
        chance(self.config.error_rate)
    }

    fn confidence(&self, final_result: bool) -> f32 {
        let mut rng = rand::rng();
        if final_result {
            rng.random_range(0.8..1.0)
        } else {
            rng.random_range(0.5..1.0)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// No faults
// ─────────────────────────────────────────────────────────────────────────────

/// A perfect server: no latency, no failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultPolicy for NoFaults {
    fn fault(&self, _op: Operation) -> Option<Fault> {
        None
    }

    fn latency(&self, _op: Operation) -> Duration {
        Duration::ZERO
    }

    fn word(&self, _index: usize) -> WordFate {
        WordFate::Deliver
    }

    fn processing_fails(&self) -> bool {
        false
    }

    fn confidence(&self, _final_result: bool) -> f32 {
        0.9
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted faults
// ─────────────────────────────────────────────────────────────────────────────

/// Replays queued faults in order; once a queue is empty the operation
/// succeeds. Latency is fixed.
#[derive(Debug, Default)]
pub struct ScriptedFaults {
    queues: Mutex<HashMap<Operation, VecDeque<Fault>>>,
    words: Mutex<HashMap<usize, WordFate>>,
    latencies: Mutex<HashMap<Operation, Duration>>,
    processing_failures: Mutex<usize>,
}

impl ScriptedFaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `fault` for the next unfaulted call of `op`.
    pub fn fail(self, op: Operation, fault: Fault) -> Self {
        self.push(op, fault);
        self
    }

    /// Queue `fault` `times` times in a row.
    pub fn fail_times(self, op: Operation, fault: Fault, times: usize) -> Self {
        for _ in 0..times {
            self.push(op, fault.clone());
        }
        self
    }

    pub fn word_fate(self, index: usize, fate: WordFate) -> Self {
        self.words.lock().insert(index, fate);
        self
    }

    pub fn latency_of(self, op: Operation, latency: Duration) -> Self {
        self.latencies.lock().insert(op, latency);
        self
    }

    /// Make the next `times` processed requests fail.
    pub fn fail_processing(self, times: usize) -> Self {
        *self.processing_failures.lock() += times;
        self
    }

    pub fn push(&self, op: Operation, fault: Fault) {
        self.queues.lock().entry(op).or_default().push_back(fault);
    }

    /// Faults still queued for `op`.
    pub fn remaining(&self, op: Operation) -> usize {
        self.queues.lock().get(&op).map_or(0, VecDeque::len)
    }
}

impl FaultPolicy for ScriptedFaults {
    fn fault(&self, op: Operation) -> Option<Fault> {
        self.queues.lock().get_mut(&op)?.pop_front()
    }

    fn latency(&self, op: Operation) -> Duration {
        self.latencies.lock().get(&op).copied().unwrap_or(Duration::ZERO)
    }

    fn word(&self, index: usize) -> WordFate {
        self.words.lock().remove(&index).unwrap_or(WordFate::Deliver)
    }

    fn processing_fails(&self) -> bool {
        let mut remaining = self.processing_failures.lock();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    fn confidence(&self, _final_result: bool) -> f32 {
        0.9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_faults_replay_in_order() {
        let faults = ScriptedFaults::new()
            .fail(Operation::Connect, Fault::Network)
            .fail(Operation::Connect, Fault::Coded(ErrorCode::AuthenticationError));

        assert_eq!(faults.fault(Operation::Connect), Some(Fault::Network));
        assert_eq!(faults.remaining(Operation::Connect), 1);
        assert_eq!(
            faults.fault(Operation::Connect),
            Some(Fault::Coded(ErrorCode::AuthenticationError))
        );
        assert_eq!(faults.fault(Operation::Connect), None);
        assert_eq!(faults.fault(Operation::CallTool), None);
    }

    #[test]
    fn scripted_processing_failures_are_counted() {
        let faults = ScriptedFaults::new().fail_processing(1);
        assert!(faults.processing_fails());
        assert!(!faults.processing_fails());
    }

    #[test]
    fn zero_rates_never_fault() {
        let faults = RandomFaults::new(SimConfig {
            error_rate: 0.0,
            network_error_rate: 0.0,
            server_overload_rate: 0.0,
            timeout_rate: 0.0,
            packet_loss_rate: 0.0,
            transcription_error_rate: 0.0,
            transcription_variability: 0.0,
            ..SimConfig::default()
        });
        for i in 0..100 {
            assert_eq!(faults.fault(Operation::CallTool), None);
            assert_eq!(faults.word(i), WordFate::Deliver);
            assert!(!faults.processing_fails());
        }
    }

    #[test]
    fn random_latency_stays_in_range() {
        let faults = RandomFaults::new(SimConfig {
            min_delay_ms: 100,
            max_delay_ms: 200,
            jitter_factor: 0.0,
            ..SimConfig::default()
        });
        for _ in 0..50 {
            let latency = faults.latency(Operation::Connect);
            assert!(latency >= Duration::from_millis(100) && latency < Duration::from_millis(200));
        }
    }

    #[test]
    fn sim_config_partial_json_keeps_defaults() {
        let config: SimConfig = serde_json::from_str(r#"{"errorRate": 0.5}"#).unwrap();
        assert_eq!(config.error_rate, 0.5);
        assert_eq!(config.min_delay_ms, 200);
        assert_eq!(config.packet_loss_rate, 0.01);
    }
}
