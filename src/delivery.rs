use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::state_machine::StateMachine;
use crate::state_machine::frame_queue::{
    DeliveryPhase, FrameInput, FrameOutput, FrameQueueMachine,
};

/// Frames handled back to back before the worker yields to the runtime.
const FRAMES_PER_YIELD: usize = 64;

type FrameHandler = Box<dyn FnMut(String) + Send>;

/// Ordered, unbounded hand-off between the transport's receive path and frame processing.
///
/// [`enqueue`](Self::enqueue) only appends and wakes the worker. A single worker task drains
/// the buffer strictly in arrival order and sleeps on a [`Notify`] when it is empty. A panic in
/// the handler is contained to the frame that caused it; the worker keeps draining.
///
/// [`shutdown`](Self::shutdown) is fed to the [`FrameQueueMachine`] like a frame: later frames
/// are refused, buffered ones are still handled, and the worker exits on
/// [`FrameOutput::Drained`].
pub struct DeliveryQueue {
    shared: Arc<QueueShared>,
    handler: Mutex<Option<FrameHandler>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct QueueShared {
    machine: Mutex<FrameQueueMachine>,
    notify: Notify,
}

impl DeliveryQueue {
    /// Create a queue whose worker will pass every frame to `handler`.
    ///
    /// Nothing is spawned until [`start`](Self::start); frames enqueued before then are kept.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        Self {
            shared: Arc::new(QueueShared {
                machine: Mutex::new(FrameQueueMachine::new()),
                notify: Notify::new(),
            }),
            handler: Mutex::new(Some(Box::new(handler))),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker on the current tokio runtime. Later calls do nothing.
    pub fn start(&self) {
        let Some(handler) = self
            .handler
            .lock()
            .expect("delivery handler lock poisoned")
            .take()
        else {
            return;
        };

        let handle = tokio::spawn(run_worker(Arc::clone(&self.shared), handler));
        *self.worker.lock().expect("delivery worker lock poisoned") = Some(handle);
    }

    /// Append `frame` and wake the worker. Never waits. Frames arriving after
    /// [`shutdown`](Self::shutdown) are dropped.
    pub fn enqueue(&self, frame: String) {
        self.apply(FrameInput::Arrived(frame));
    }

    /// Frames waiting to be processed.
    pub fn pending_count(&self) -> usize {
        self.shared
            .machine
            .lock()
            .expect("frame queue lock poisoned")
            .pending_count()
    }

    /// Stop accepting frames and let the worker exit once the buffer is drained.
    pub fn shutdown(&self) {
        self.apply(FrameInput::Shutdown);
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.shared
            .machine
            .lock()
            .expect("frame queue lock poisoned")
            .phase()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .expect("delivery worker lock poisoned")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl DeliveryQueue {
    fn apply(&self, input: FrameInput) {
        self.shared
            .machine
            .lock()
            .expect("frame queue lock poisoned")
            .process_input(input);
        self.shared.notify.notify_one();
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(shared: Arc<QueueShared>, mut handler: FrameHandler) {
    debug!("Delivery worker started");
    let mut handled = 0usize;

    loop {
        let next = shared
            .machine
            .lock()
            .expect("frame queue lock poisoned")
            .poll_output();

        match next {
            Some(FrameOutput::Deliver(frame)) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                    error!(
                        panic = %panic_message(panic.as_ref()),
                        "Frame handler panicked, continuing with next frame"
                    );
                }

                handled += 1;
                if handled % FRAMES_PER_YIELD == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Some(FrameOutput::Drained { delivered, refused }) => {
                debug!(delivered, refused, "Delivery worker drained");
                break;
            }
            None => {
                trace!("Delivery worker idle");
                shared.notify.notified().await;
            }
        }
    }

    debug!(handled, "Delivery worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn collect(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("worker stalled")
                .expect("worker gone");
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn test_frames_processed_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DeliveryQueue::new(move |frame| {
            let _ = tx.send(frame);
        });
        queue.start();

        queue.enqueue("A".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("B".to_string());
        queue.enqueue("C".to_string());

        assert_eq!(collect(&mut rx, 3).await, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_frames_buffered_before_start() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DeliveryQueue::new(move |frame| {
            let _ = tx.send(frame);
        });

        for frame in ["1", "2", "3"] {
            queue.enqueue(frame.to_string());
        }
        assert_eq!(queue.pending_count(), 3);

        queue.start();
        queue.start();
        assert_eq!(collect(&mut rx, 3).await, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_burst_is_drained() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DeliveryQueue::new(move |frame| {
            let _ = tx.send(frame);
        });
        queue.start();

        let frames: Vec<String> = (0..1000).map(|n| n.to_string()).collect();
        for frame in &frames {
            queue.enqueue(frame.clone());
        }

        assert_eq!(collect(&mut rx, 1000).await, frames);
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DeliveryQueue::new(move |frame: String| {
            if frame == "boom" {
                panic!("bad frame");
            }
            let _ = tx.send(frame);
        });
        queue.start();

        queue.enqueue("before".to_string());
        queue.enqueue("boom".to_string());
        queue.enqueue("after".to_string());

        assert_eq!(collect(&mut rx, 2).await, vec!["before", "after"]);
        assert!(queue.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let queue = DeliveryQueue::new(|_| {});
        queue.start();
        assert!(queue.is_running());

        queue.shutdown();
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker did not stop");
    }

    #[tokio::test]
    async fn test_shutdown_handles_buffered_frames_and_refuses_late_ones() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = DeliveryQueue::new(move |frame| {
            let _ = tx.send(frame);
        });

        queue.enqueue("first".to_string());
        queue.enqueue("second".to_string());
        queue.shutdown();
        queue.enqueue("late".to_string());
        assert_eq!(queue.phase(), DeliveryPhase::Draining);
        assert_eq!(queue.pending_count(), 2);

        queue.start();
        assert_eq!(collect(&mut rx, 2).await, vec!["first", "second"]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker did not stop");

        assert_eq!(queue.phase(), DeliveryPhase::Drained);
        assert!(rx.try_recv().is_err());
    }
}
