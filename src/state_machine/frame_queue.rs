use std::collections::VecDeque;

use super::StateMachine;

/// Where the delivery buffer is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// Taking frames from the transport.
    Accepting,
    /// Shutdown requested; frames already buffered are still handed out, new ones are refused.
    Draining,
    /// Everything accepted has been handed out after shutdown.
    Drained,
}

/// Raw inbound frames between the transport's receive path and the dispatch worker.
///
/// Frames come out in exactly the order they arrived. Shutdown is an input like any other: the
/// machine refuses further arrivals, hands out what it already holds, and then reports
/// [`FrameOutput::Drained`] exactly once.
#[derive(Debug)]
pub struct FrameQueueMachine {
    buffer: VecDeque<String>,
    phase: DeliveryPhase,
    delivered: u64,
    refused: u64,
}

impl FrameQueueMachine {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            phase: DeliveryPhase::Accepting,
            delivered: 0,
            refused: 0,
        }
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.phase
    }

    /// Frames accepted but not yet handed out.
    pub fn pending_count(&self) -> usize {
        self.buffer.len()
    }

    fn arrived(&mut self, frame: String) {
        match self.phase {
            DeliveryPhase::Accepting => self.buffer.push_back(frame),
            DeliveryPhase::Draining | DeliveryPhase::Drained => self.refused += 1,
        }
    }

    fn shutdown(&mut self) {
        if self.phase == DeliveryPhase::Accepting {
            self.phase = DeliveryPhase::Draining;
        }
    }
}

impl Default for FrameQueueMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameInput {
    /// A frame arrived from the transport.
    Arrived(String),
    /// Stop accepting and finish what is buffered.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutput {
    /// The next frame to decode and dispatch.
    Deliver(String),
    /// Shutdown completed with nothing left to hand out.
    Drained { delivered: u64, refused: u64 },
}

impl StateMachine for FrameQueueMachine {
    type Input = FrameInput;
    type Output = FrameOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            FrameInput::Arrived(frame) => self.arrived(frame),
            FrameInput::Shutdown => self.shutdown(),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        if let Some(frame) = self.buffer.pop_front() {
            self.delivered += 1;
            return Some(FrameOutput::Deliver(frame));
        }

        if self.phase == DeliveryPhase::Draining {
            self.phase = DeliveryPhase::Drained;
            return Some(FrameOutput::Drained {
                delivered: self.delivered,
                refused: self.refused,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrive(machine: &mut FrameQueueMachine, frames: &[&str]) {
        for frame in frames {
            machine.process_input(FrameInput::Arrived(frame.to_string()));
        }
    }

    fn drain(machine: &mut FrameQueueMachine) -> Vec<FrameOutput> {
        std::iter::from_fn(|| machine.poll_output()).collect()
    }

    #[test]
    fn test_frames_leave_in_arrival_order() {
        let mut machine = FrameQueueMachine::new();
        arrive(&mut machine, &["A", "B", "C"]);
        assert_eq!(machine.pending_count(), 3);

        assert_eq!(
            drain(&mut machine),
            vec![
                FrameOutput::Deliver("A".to_string()),
                FrameOutput::Deliver("B".to_string()),
                FrameOutput::Deliver("C".to_string()),
            ]
        );
        assert_eq!(machine.phase(), DeliveryPhase::Accepting);
    }

    #[test]
    fn test_idle_queue_has_no_output() {
        let mut machine = FrameQueueMachine::new();
        assert!(machine.poll_output().is_none());
    }

    #[test]
    fn test_shutdown_drains_buffer_then_reports_once() {
        let mut machine = FrameQueueMachine::new();
        arrive(&mut machine, &["1", "2"]);

        machine.process_input(FrameInput::Shutdown);
        arrive(&mut machine, &["late"]);
        machine.process_input(FrameInput::Shutdown);
        assert_eq!(machine.phase(), DeliveryPhase::Draining);

        assert_eq!(
            drain(&mut machine),
            vec![
                FrameOutput::Deliver("1".to_string()),
                FrameOutput::Deliver("2".to_string()),
                FrameOutput::Drained {
                    delivered: 2,
                    refused: 1
                },
            ]
        );
        assert_eq!(machine.phase(), DeliveryPhase::Drained);

        arrive(&mut machine, &["later"]);
        assert!(machine.poll_output().is_none());
        assert_eq!(machine.pending_count(), 0);
    }
}
