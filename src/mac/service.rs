//! Async front-end of the MAC
//!
//! Upper layers, the radio driver and the ticker all talk to the MAC through one
//! bounded event channel. [`Mac::run`] drains it and applies every event to
//! completion before taking the next one.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::{Destination, Error, MacConfig, NetState, Result};
use crate::radio::Radio;
use crate::time::Ticker;

use super::{Mac, MacEvent, MacState};

/// Creates the MAC event channel
pub fn channel(size: usize) -> (MacHandle, mpsc::Receiver<MacEvent>) {
    let (tx, rx) = mpsc::channel(size);
    (MacHandle { events: tx }, rx)
}

/// Creates the event channel with the capacity `config` asks for
pub fn channel_for(config: &MacConfig) -> (MacHandle, mpsc::Receiver<MacEvent>) {
    channel(config.event_queue_size)
}

/// Sending side of the MAC event channel
#[derive(Debug, Clone)]
pub struct MacHandle {
    events: mpsc::Sender<MacEvent>,
}

impl MacHandle {
    /// Queues a payload for transmission
    pub async fn send(&self, dst: Destination, payload: Bytes) -> Result<()> {
        self.events
            .send(MacEvent::Send { dst, payload })
            .await
            .map_err(|e| Error::channel(format!("Failed to queue send request: {}", e)))
    }

    /// Requests an interface state change
    pub async fn set_state(&self, state: NetState) -> Result<()> {
        self.events
            .send(MacEvent::SetState(state))
            .await
            .map_err(|e| Error::channel(format!("Failed to queue state request: {}", e)))
    }

    /// Posts an event without waiting, for radio and ticker callbacks
    pub fn notify(&self, event: MacEvent) -> Result<()> {
        self.events
            .try_send(event)
            .map_err(|e| Error::channel(format!("Failed to post event: {}", e)))
    }
}

impl<R: Radio, T: Ticker> Mac<R, T> {
    /// Runs the MAC until every [`MacHandle`] is dropped
    pub async fn run(&mut self, mut events: mpsc::Receiver<MacEvent>) -> Result<()> {
        if self.state() != MacState::Stopped {
            return Err(Error::invalid_state(format!(
                "mac already running in {:?}",
                self.state()
            )));
        }

        info!(addr = %self.addr(), "mac service started");
        self.start();

        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }

        debug!("event channel closed");
        self.handle_event(MacEvent::SetState(NetState::Off));
        info!(addr = %self.addr(), "mac service stopped");
        Ok(())
    }
}
