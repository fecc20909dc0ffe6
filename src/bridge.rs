//! Client bridge: update notifications from the caching context to pages.
//!
//! Delivery is best effort. A page that is not subscribed when a transition
//! happens misses it; its next load observes the new current generation.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Messages sent to foreground contexts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
  /// A new generation became current; reload to apply
  #[serde(rename = "update-ready")]
  UpdateReady {
    #[serde(rename = "versionId")]
    version_id: String,
  },
}

/// Outcome of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
  /// Number of foreground contexts the message was handed to
  Delivered(usize),
  NoForegroundListener,
}

/// Sending half, owned by the background caching context
#[derive(Clone)]
pub struct ClientBridge {
  tx: broadcast::Sender<BridgeMessage>,
}

impl ClientBridge {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  /// Register a foreground context.
  pub fn subscribe(&self) -> ClientHandle {
    ClientHandle {
      rx: self.tx.subscribe(),
    }
  }

  /// Announce that `version_id` is now current.
  pub fn notify(&self, version_id: &str) -> Delivery {
    let message = BridgeMessage::UpdateReady {
      version_id: version_id.to_string(),
    };

    match self.tx.send(message) {
      Ok(listeners) => Delivery::Delivered(listeners),
      Err(_) => {
        debug!(version_id, "no foreground listener for update");
        Delivery::NoForegroundListener
      }
    }
  }
}

impl Default for ClientBridge {
  fn default() -> Self {
    Self::new(16)
  }
}

/// Receiving half held by one foreground context
pub struct ClientHandle {
  rx: broadcast::Receiver<BridgeMessage>,
}

impl ClientHandle {
  /// Wait for the next message. Returns `None` once the bridge is gone.
  ///
  /// Messages that were overwritten while this handle lagged are skipped.
  pub async fn recv(&mut self) -> Option<BridgeMessage> {
    loop {
      match self.rx.recv().await {
        Ok(message) => return Some(message),
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          debug!(missed, "foreground context lagged behind updates");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Non-blocking variant of `recv`
  #[cfg(test)]
  pub fn try_recv(&mut self) -> Option<BridgeMessage> {
    loop {
      match self.rx.try_recv() {
        Ok(message) => return Some(message),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }
}
