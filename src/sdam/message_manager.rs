//! Message passing between server selection and the SDAM background tasks (§4.D, §4.F): a
//! selection attempt that fails to find a suitable server wakes every monitor up immediately
//! instead of waiting out its heartbeat interval, and a monitor that observes a change wakes up
//! any selection attempt that's waiting on the latency window to shift.

use std::time::Duration;

use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::RUNTIME;

#[derive(Clone, Debug)]
pub(crate) struct TopologyMessageManager {
    check_requester: Sender<()>,
    change_notifier: Sender<()>,
}

impl TopologyMessageManager {
    pub(crate) fn new() -> Self {
        let (check_requester, _) = broadcast::channel(1);
        let (change_notifier, _) = broadcast::channel(1);
        Self {
            check_requester,
            change_notifier,
        }
    }

    /// Asks every monitor to check its server immediately (§4.D: "an on-demand 'immediate check'
    /// path lets the executor request an out-of-band probe").
    pub(crate) fn request_topology_check(&self) {
        let _: Result<_, _> = self.check_requester.send(());
    }

    pub(crate) fn notify_topology_changed(&self) {
        let _: Result<_, _> = self.change_notifier.send(());
    }

    pub(crate) fn subscribe_to_check_requests(&self) -> TopologyMessageSubscriber {
        TopologyMessageSubscriber::new(self.check_requester.subscribe())
    }

    pub(crate) fn subscribe_to_changes(&self) -> TopologyMessageSubscriber {
        TopologyMessageSubscriber::new(self.change_notifier.subscribe())
    }

    /// Number of live subscribers waiting on a topology change (§4.D: a monitor keeps running as
    /// long as something is watching it, even after the topology's last external owner is gone).
    pub(crate) fn change_subscriber_count(&self) -> usize {
        self.change_notifier.receiver_count()
    }
}

pub(crate) struct TopologyMessageSubscriber {
    receiver: Receiver<()>,
}

impl TopologyMessageSubscriber {
    fn new(receiver: Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Waits for either `timeout` to elapse or a message, returning `true` if a message arrived.
    pub(crate) async fn wait(&mut self, timeout: Duration) -> bool {
        RUNTIME.timeout(timeout, async { Ok(self.receiver.recv().await) }).await.is_ok()
    }
}
