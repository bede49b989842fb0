//-
// Copyright (c) 2015, Lavaboom Ltd
//
// This file is part of Lavamail.
//
// Lavamail is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU  General Public License  as published by  the Free
// Software Foundation, either version 3  of the License, or (at your option)
// any later version.
//
// Lavamail is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Lavamail. If not, see <http://www.gnu.org/licenses/>.

//! The outbound work queue.
//!
//! The mailer consumes the `send_email` topic on channel `receive`; each
//! delivery body is a JSON-encoded email row ID. Retry policy belongs to
//! the queue, not to us: a handler `Ok` acknowledges the delivery, an `Err`
//! is a nack and the delivery is requeued.
//!
//! The bus transport itself is an external collaborator behind `Source`;
//! `LocalQueue` is the in-process implementation used by the binary and the
//! tests.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{error, info};

use crate::support::error::Error;

pub const TOPIC_SEND_EMAIL: &str = "send_email";
pub const CHANNEL_RECEIVE: &str = "receive";

/// One delivery pulled off the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub attempts: u32,
}

/// Processes deliveries. Shared across the worker pool.
pub trait Handler: Send + Sync {
    fn handle(&self, delivery: &Delivery) -> Result<(), Error>;
}

/// A source of deliveries for one (topic, channel) subscription.
pub trait Source: Send + Sync {
    /// Blocks for the next delivery; `None` means the source has shut down.
    fn pull(&self) -> Option<Delivery>;

    /// Acknowledges (`ok`) or requeues (`!ok`) a delivery.
    fn finish(&self, delivery: Delivery, ok: bool);
}

/// Spawns `concurrency` worker threads draining `source` into `handler`.
///
/// Each delivery is processed by exactly one worker. The threads exit when
/// the source shuts down; join the handles to wait for drain.
pub fn consume(
    source: Arc<dyn Source>,
    handler: Arc<dyn Handler>,
    concurrency: usize,
) -> Vec<thread::JoinHandle<()>> {
    info!(
        "consuming {}/{} with concurrency {}",
        TOPIC_SEND_EMAIL, CHANNEL_RECEIVE, concurrency,
    );

    (0..concurrency.max(1))
        .map(|worker_ix| {
            let source = Arc::clone(&source);
            let handler = Arc::clone(&handler);
            thread::Builder::new()
                .name(format!("send-email-{}", worker_ix))
                .spawn(move || {
                    while let Some(delivery) = source.pull() {
                        match handler.handle(&delivery) {
                            Ok(()) => source.finish(delivery, true),
                            Err(e) => {
                                error!(
                                    "delivery failed (attempt {}): {}",
                                    delivery.attempts, e,
                                );
                                source.finish(delivery, false);
                            },
                        }
                    }
                })
                .expect("failed to spawn queue worker")
        })
        .collect()
}

/// In-process queue: a bounded-unfairness FIFO with condvar wakeups.
pub struct LocalQueue {
    state: Mutex<LocalQueueState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct LocalQueueState {
    deliveries: VecDeque<Delivery>,
    closed: bool,
}

impl LocalQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LocalQueueState::default()),
            wakeup: Condvar::new(),
        })
    }

    /// Publishes a message body to the queue.
    pub fn publish(&self, body: Vec<u8>) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.deliveries.push_back(Delivery { body, attempts: 1 });
        drop(state);
        self.wakeup.notify_one();
    }

    /// Shuts the queue down; workers drain what is left, then exit.
    pub fn close(&self) {
        self.state.lock().expect("queue mutex poisoned").closed = true;
        self.wakeup.notify_all();
    }
}

impl Source for LocalQueue {
    fn pull(&self) -> Option<Delivery> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        loop {
            if let Some(delivery) = state.deliveries.pop_front() {
                return Some(delivery);
            }
            if state.closed {
                return None;
            }
            state = self
                .wakeup
                .wait(state)
                .expect("queue mutex poisoned");
        }
    }

    fn finish(&self, mut delivery: Delivery, ok: bool) {
        if ok {
            return;
        }

        delivery.attempts += 1;
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if state.closed {
            // Nowhere to retry; the delivery is dropped with the queue.
            return;
        }
        state.deliveries.push_back(delivery);
        drop(state);
        self.wakeup.notify_one();
    }
}
