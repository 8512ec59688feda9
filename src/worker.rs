// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Ordered single-thread task queue for hardware events.
//!
//! Each device context owns one [`EventWorker`]. Events submitted from any
//! thread run one at a time, in submission order, on the worker thread.

use crate::{
    error::{FastpathError, Result},
    hw::{HwEvent, HwEventSink},
};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, warn};

enum Job<T> {
    Event(T),
    Barrier(kanal::Sender<()>),
    Shutdown,
}

/// Cloneable submit side of an [`EventWorker`].
pub struct EventSender<T> {
    tx: kanal::Sender<Job<T>>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        EventSender {
            tx: self.tx.clone(),
        }
    }
}

impl<T> EventSender<T> {
    pub fn submit(&self, event: T) -> Result<()> {
        self.tx
            .send(Job::Event(event))
            .map_err(|_| FastpathError::hardware("event worker stopped"))
    }
}

impl HwEventSink for EventSender<HwEvent> {
    fn on_event(&self, event: HwEvent) -> Result<()> {
        self.submit(event)
    }
}

pub struct EventWorker<T> {
    name: String,
    tx: kanal::Sender<Job<T>>,
    thread_id: ThreadId,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> EventWorker<T> {
    /// Spawns the worker thread running `handler` for every event.
    pub fn spawn<F>(name: impl Into<String>, mut handler: F) -> Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = kanal::unbounded::<Job<T>>();
        let thread_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(job) = rx.recv() {
                match job {
                    Job::Event(event) => handler(event),
                    Job::Barrier(done) => {
                        let _ = done.send(());
                    }
                    Job::Shutdown => break,
                }
            }
            debug!("{thread_name} exited");
        })?;
        Ok(EventWorker {
            name,
            tx,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }
}

impl<T> EventWorker<T> {
    pub fn sender(&self) -> EventSender<T> {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn submit(&self, event: T) -> Result<()> {
        self.sender().submit(event)
    }

    fn on_worker(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Blocks until every event submitted before this call has been handled.
    /// Returns immediately when called from the worker itself.
    pub fn drain(&self) -> Result<()> {
        if self.on_worker() {
            return Ok(());
        }
        let (done_tx, done_rx) = kanal::bounded(1);
        self.tx
            .send(Job::Barrier(done_tx))
            .map_err(|_| FastpathError::hardware("event worker stopped"))?;
        done_rx
            .recv()
            .map_err(|_| FastpathError::hardware("event worker stopped"))
    }
}

impl<T> Drop for EventWorker<T> {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Shutdown);
        if let Some(thread) = self.thread.take() {
            if self.on_worker() {
                return;
            }
            if thread.join().is_err() {
                warn!("{} panicked", self.name);
            }
        }
    }
}
