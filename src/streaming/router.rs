//! Fragment fan-out from the engine to the registered sinks.
//!
//! The producer thread drives the engine and pushes fragments into a
//! channel; the delivery thread forwards each fragment to every sink in
//! emission order, exactly once per sink, then finishes the sinks exactly
//! once. Cancellation is a shared flag observed at both ends: the engine
//! stops emitting at the next fragment boundary, and nothing is delivered
//! past the cancellation point.

use std::sync::mpsc;
use std::thread;

use super::{FinishReason, FragmentSink};
use crate::infer::session::SessionControl;
use crate::infer::{InferenceSession, TokenFragment};

pub struct StreamRouter;

impl StreamRouter {
    /// Starts the producer and delivery threads for one session. Both are
    /// detached; `StreamHandle` is the only way to reach them afterwards.
    pub fn spawn(session: InferenceSession, mut sinks: Vec<Box<dyn FragmentSink>>) -> StreamHandle {
        let control = session.control();
        let (tx, rx) = mpsc::channel::<TokenFragment>();

        let producer = thread::spawn(move || session.run(tx));

        let delivery_control = control.clone();
        let delivery = thread::spawn(move || {
            let mut completed = false;

            while let Ok(fragment) = rx.recv() {
                if delivery_control.is_retired() {
                    break;
                }
                let is_final = fragment.is_final;
                for sink in sinks.iter_mut() {
                    sink.fragment(&fragment);
                }
                if is_final {
                    completed = true;
                    break;
                }
            }

            let reason = if !completed && delivery_control.is_retired() {
                FinishReason::Cancelled
            } else {
                FinishReason::Complete
            };
            for sink in sinks.iter_mut() {
                sink.finish(reason);
            }
            log::debug!("Fragment delivery finished: {reason:?}");
        });

        StreamHandle {
            control,
            producer: Some(producer),
            delivery: Some(delivery),
        }
    }
}

/// Caller-facing handle for one generation stream.
pub struct StreamHandle {
    control: SessionControl,
    producer: Option<thread::JoinHandle<()>>,
    delivery: Option<thread::JoinHandle<()>>,
}

impl StreamHandle {
    /// Stops the stream: the session is retired, the engine stops emitting,
    /// and no further fragments are delivered. Idempotent, non-blocking,
    /// safe from any thread.
    pub fn cancel(&self) {
        self.control.retire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_retired()
    }

    /// Waits for both worker threads to finish. After `join` returns the
    /// session latch is released and a new `generate` can claim a session.
    pub fn join(mut self) {
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.delivery.take() {
            let _ = handle.join();
        }
    }
}
