//! Consumption of adapter events.
//!
//! Events are consumed in two modes. While a configuration call is in
//! flight its owner drives the receiver itself ([`drive`]), so every event
//! the call produced is handled once the call returns. In between calls an
//! [`EventPump`] task consumes live updates. The pump hands its receiver
//! back on [`EventPump::stop`] so that no event is lost between the modes.

use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::lifecycle::AdapterEvent;

pub type EventReceiver = mpsc::UnboundedReceiver<AdapterEvent>;

/// Runs `work` to completion while handing events to `on_event`, then
/// handles whatever is still queued.
pub async fn drive<F: Future>(
    receiver: &mut EventReceiver,
    work: F,
    mut on_event: impl FnMut(AdapterEvent),
) -> F::Output {
    tokio::pin!(work);
    let output = loop {
        tokio::select! {
            output = &mut work => break output,
            Some(event) = receiver.recv() => on_event(event),
        }
    };

    while let Ok(event) = receiver.try_recv() {
        on_event(event);
    }
    output
}

/// Background consumer of live adapter events.
pub struct EventPump {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<EventReceiver>,
}

impl EventPump {
    /// Spawns a task feeding events to `on_event` until stopped, until all
    /// producers are gone, or until `on_event` returns `false`.
    pub fn spawn<H>(mut receiver: EventReceiver, mut on_event: H) -> Self
    where
        H: FnMut(AdapterEvent) -> bool + Send + 'static,
    {
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    event = receiver.recv() => match event {
                        Some(event) => {
                            if !on_event(event) {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            receiver
        });

        Self { stop, handle }
    }

    /// Stops the task and returns the receiver with pending events intact.
    pub async fn stop(self) -> Option<EventReceiver> {
        let _ = self.stop.send(());
        self.handle.await.ok()
    }

    pub fn abort(self) {
        self.handle.abort();
    }
}
