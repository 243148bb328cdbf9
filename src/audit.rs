use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;

/// Events pushed to the external audit collaborator. Fire-and-forget: the
/// engine never waits on a sink and never fails because one did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    PopulationInitialized {
        size: usize,
    },
    GenerationCompleted {
        generation: usize,
        population_size: usize,
        best_fitness: f64,
        mean_fitness: f64,
        evaluations: usize,
    },
    FactorDiscovered {
        id: u64,
        expression: String,
        fitness: f64,
        ic: f64,
        ir: f64,
        sharpe: f64,
        generation: usize,
    },
}

/// Sink for audit events. Implementations must return quickly; a failure is
/// reported through the Result and logged by the engine, never propagated.
pub trait AuditSink {
    fn notify(&self, event: AuditEvent) -> Result<(), String>;
}

/// Discards every event
pub struct NullSink;

impl AuditSink for NullSink {
    fn notify(&self, _event: AuditEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Forwards events over an mpsc channel; a closed receiver is a sink
/// failure, not an engine failure.
pub struct ChannelSink {
    sender: Sender<AuditEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<AuditEvent>) -> ChannelSink {
        ChannelSink { sender }
    }
}

impl AuditSink for ChannelSink {
    fn notify(&self, event: AuditEvent) -> Result<(), String> {
        self.sender
            .send(event)
            .map_err(|e| format!("audit channel closed: {}", e))
    }
}

/// Asynchronous certification verdict, correlated back by individual id
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub approved: bool,
    /// Collaborator confidence in [0, 1]
    pub confidence: f64,
}

impl AuditVerdict {
    /// Multiplicative fitness adjustment carried by this verdict
    pub fn fitness_factor(&self) -> f64 {
        let confidence = self.confidence.clamp(0.0, 1.0);
        if self.approved {
            1.0 + 0.1 * confidence
        } else {
            1.0 - 0.5 * confidence
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_sink_delivers_events() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        sink.notify(AuditEvent::PopulationInitialized { size: 10 })
            .unwrap();
        assert_eq!(
            rx.recv().unwrap(),
            AuditEvent::PopulationInitialized { size: 10 }
        );
    }

    #[test]
    fn test_channel_sink_failure_is_a_result_not_a_panic() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let sink = ChannelSink::new(tx);
        assert!(sink
            .notify(AuditEvent::PopulationInitialized { size: 10 })
            .is_err());
    }

    #[test]
    fn test_verdict_factor_direction() {
        let approved = AuditVerdict {
            approved: true,
            confidence: 1.0,
        };
        let rejected = AuditVerdict {
            approved: false,
            confidence: 1.0,
        };
        assert!(approved.fitness_factor() > 1.0);
        assert!(rejected.fitness_factor() < 1.0);

        // out-of-range confidence is clamped, never amplified
        let wild = AuditVerdict {
            approved: false,
            confidence: 7.0,
        };
        assert_eq!(wild.fitness_factor(), 0.5);
    }
}
