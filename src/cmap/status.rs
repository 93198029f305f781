//! Publishes the pool's generation so waiters that were handed a connection from a *stale*
//! generation (one cleared out from under them, §4.C) know to discard it instead of checking it
//! back in.

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PoolStatus {
    generation: u32,
    ready: bool,
}

pub(super) fn channel() -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = watch::channel(PoolStatus::default());
    (
        PoolGenerationPublisher { sender },
        PoolGenerationSubscriber { receiver },
    )
}

#[derive(Debug)]
pub(super) struct PoolGenerationPublisher {
    sender: watch::Sender<PoolStatus>,
}

impl PoolGenerationPublisher {
    pub(super) fn publish_generation(&self, generation: u32) {
        self.sender.send_modify(|status| status.generation = generation);
    }

    pub(super) fn publish_ready(&self, ready: bool) {
        self.sender.send_modify(|status| status.ready = ready);
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PoolGenerationSubscriber {
    receiver: watch::Receiver<PoolStatus>,
}

impl PoolGenerationSubscriber {
    pub(crate) fn generation(&self) -> u32 {
        self.receiver.borrow().generation
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.receiver.borrow().ready
    }
}
