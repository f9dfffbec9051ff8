//! Engine event queue
//!
//! Background work (screenshot encoding, texture pre-loading) runs on
//! fire-and-forget threads that report back through an mpsc channel. The
//! host drains the queue once per frame; nothing blocks on delivery.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

use image::RgbaImage;

/// Completion notice posted by a background thread.
#[derive(Debug)]
pub enum EngineEvent {
    /// A screenshot finished writing (or failed to).
    ScreenshotWritten { path: PathBuf, ok: bool },
    /// A pre-loaded texture finished decoding off-thread.
    TexturePreloaded { name: String, image: Box<RgbaImage> },
    /// A pre-load request could not be decoded.
    TexturePreloadFailed { name: String },
}

/// Single-consumer event queue with cloneable producers.
pub struct EventQueue {
    sender: Sender<EngineEvent>,
    receiver: Receiver<EngineEvent>,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = channel();
        Self { sender, receiver }
    }

    /// A producer handle to move into a worker thread.
    #[must_use]
    pub fn sender(&self) -> Sender<EngineEvent> {
        self.sender.clone()
    }

    /// Pop one pending event, if any.
    #[must_use]
    pub fn poll(&self) -> Option<EngineEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything currently queued.
    #[must_use]
    pub fn drain(&self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.poll() {
            events.push(event);
        }
        events
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_cross_threads() {
        let queue = EventQueue::new();
        let sender = queue.sender();

        std::thread::spawn(move || {
            sender
                .send(EngineEvent::TexturePreloadFailed {
                    name: "x.png".to_string(),
                })
                .ok();
        })
        .join()
        .unwrap();

        let events = queue.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            EngineEvent::TexturePreloadFailed { .. }
        ));
        assert!(queue.poll().is_none());
    }
}
