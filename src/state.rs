use crate::stream::subscription::SubscriptionToken;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTaskKind {
    /// Connect attempts with backoff; ends once a handshake is under way.
    Connect,
    /// Post-close loop; runs until the transport is alive again.
    Reconnect,
}

/// A background connect or reconnect loop, tagged with the lifecycle
/// generation that started it.
pub struct RetryTaskHandle {
    pub generation: u64,
    pub kind: RetryTaskKind,
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

impl RetryTaskHandle {
    pub fn is_active(&self) -> bool {
        !self.join_handle.is_finished()
    }

    /// Signals the loop to stop at its next suspension point.
    pub fn cancel(self) {
        self.cancellation_token.cancel();
    }
}

/// Mutable lifecycle state, only touched while the controller's machine lock
/// is held.
#[derive(Default)]
pub struct LinkState {
    pub endpoint: Option<Url>,
    /// Present exactly while the link is resumed.
    pub subscription: Option<SubscriptionToken>,
    pub generation: u64,
    pub retry_task: Option<RetryTaskHandle>,
}

impl LinkState {
    pub fn is_resumed(&self) -> bool {
        self.subscription.is_some()
    }

    /// True while a post-close loop for `generation` is still watching the
    /// transport.
    pub fn is_reconnecting(&self, generation: u64) -> bool {
        self.retry_task.as_ref().is_some_and(|task| {
            task.generation == generation
                && task.kind == RetryTaskKind::Reconnect
                && task.is_active()
        })
    }

    pub fn cancel_retry_task(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.cancel();
        }
    }
}
