//! Correlates blocking sends with the responses that release them.
//!
//! Each blocking send registers the set of connection addresses it still
//! expects to hear from. A response from one of them, or that connection
//! closing, removes it from the set; when the set is empty the sender is
//! released with a [`DeliveryReport`] and the entry is dropped.
//!
//! Registration must happen before the message is queued on any
//! connection: a fast peer can otherwise answer before the entry exists and
//! the answer is lost.
//!
//! The same message may be sent blocking more than once (a broadcast, then a
//! targeted resend). Each send gets its own entry under the message id, and
//! an entry's target set only ever shrinks:
//!
//! ```text
//! id ─┬─ entry #1 { pending: [a, b] } ── ticket #1
//!     └─ entry #2 { pending: [b] }    ── ticket #2
//! ```
//!
//! An answer from `b` settles the oldest entry still waiting on `b`; the
//! next answer from `b` settles the one after it. A closed connection
//! settles every entry waiting on it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use lanbus_protocol::MessageId;
use tokio::sync::oneshot;

use crate::Origin;

// ---------------------------------------------------------------------------
// DeliveryReport
// ---------------------------------------------------------------------------

/// What happened to a blocking send at each target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Targets that answered with `RequestSuccess`.
    pub acknowledged: Vec<Origin>,
    /// Targets that answered with `RequestFail`, and the error they sent.
    pub failed: Vec<(Origin, String)>,
    /// Targets whose connection closed (or whose bus stopped) first.
    pub disconnected: Vec<Origin>,
}

impl DeliveryReport {
    /// `true` when every target acknowledged. Also `true` for an empty
    /// report.
    pub fn all_acknowledged(&self) -> bool {
        self.failed.is_empty() && self.disconnected.is_empty()
    }

    pub fn target_count(&self) -> usize {
        self.acknowledged.len() + self.failed.len() + self.disconnected.len()
    }

    pub(crate) fn record(&mut self, origin: Origin, outcome: Outcome) {
        match outcome {
            Outcome::Acknowledged => self.acknowledged.push(origin),
            Outcome::Failed(error) => self.failed.push((origin, error)),
            Outcome::Disconnected => self.disconnected.push(origin),
        }
    }
}

/// How one target settled a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acknowledged,
    Failed(String),
    Disconnected,
}

// ---------------------------------------------------------------------------
// RequestManager
// ---------------------------------------------------------------------------

struct BlockingRequest {
    pending: HashSet<SocketAddr>,
    report: DeliveryReport,
    waiter: oneshot::Sender<DeliveryReport>,
}

impl BlockingRequest {
    fn settle(&mut self, from: SocketAddr, outcome: Outcome) -> bool {
        if self.pending.remove(&from) {
            self.report.record(Origin::Peer(from), outcome);
            true
        } else {
            false
        }
    }

    fn finish(self) {
        let _ = self.waiter.send(self.report);
    }
}

struct Table {
    /// In registration order per id.
    entries: HashMap<MessageId, Vec<BlockingRequest>>,
    /// Cleared by `release_all`; while cleared, new registrations settle
    /// immediately as disconnected.
    open: bool,
}

/// Table of outstanding blocking requests, behind a single lock.
pub struct RequestManager {
    table: Mutex<Table>,
}

/// Handed to a blocking sender; resolves once every target has answered or
/// gone away.
#[must_use = "a ticket does nothing unless waited on"]
pub struct RequestTicket {
    id: MessageId,
    rx: oneshot::Receiver<DeliveryReport>,
}

impl RequestTicket {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub async fn wait(self) -> DeliveryReport {
        // The sender half only disappears with the manager itself.
        self.rx.await.unwrap_or_default()
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                open: true,
            }),
        }
    }

    /// Registers `id` as waiting on `targets`.
    ///
    /// An empty target set completes at once. Registering an id that is
    /// already pending adds a separate entry; the earlier ticket keeps its
    /// own targets and is released by them alone.
    pub fn register(
        &self,
        id: MessageId,
        targets: impl IntoIterator<Item = SocketAddr>,
    ) -> RequestTicket {
        let (tx, rx) = oneshot::channel();
        let targets: HashSet<SocketAddr> = targets.into_iter().collect();
        let ticket = RequestTicket { id, rx };

        let mut table = self.lock();
        if !table.open {
            drop(table);
            let mut report = DeliveryReport::default();
            for target in targets {
                report.record(Origin::Peer(target), Outcome::Disconnected);
            }
            let _ = tx.send(report);
            return ticket;
        }
        if targets.is_empty() {
            drop(table);
            let _ = tx.send(DeliveryReport::default());
            return ticket;
        }

        tracing::trace!(%id, pending = targets.len(), "blocking request registered");
        table.entries.entry(id).or_default().push(BlockingRequest {
            pending: targets,
            report: DeliveryReport::default(),
            waiter: tx,
        });
        ticket
    }

    /// Records `from`'s answer to request `id`. Answers for unknown ids, or
    /// from connections the request isn't waiting on, are ignored.
    pub(crate) fn resolve(&self, id: MessageId, from: SocketAddr, outcome: Outcome) {
        let finished = {
            let mut table = self.lock();
            let Some(requests) = table.entries.get_mut(&id) else {
                tracing::trace!(%id, %from, "response for no pending request");
                return;
            };
            let Some(index) = requests.iter_mut().position(|r| r.settle(from, outcome.clone()))
            else {
                tracing::trace!(%id, %from, "duplicate or unexpected response");
                return;
            };
            let finished = requests[index]
                .pending
                .is_empty()
                .then(|| requests.remove(index));
            if requests.is_empty() {
                table.entries.remove(&id);
            }
            finished
        };
        if let Some(request) = finished {
            tracing::trace!(%id, "blocking request complete");
            request.finish();
        }
    }

    /// Settles every request still waiting on `addr` as disconnected.
    pub fn connection_closed(&self, addr: SocketAddr) {
        let finished: Vec<BlockingRequest> = {
            let mut table = self.lock();
            let mut done = Vec::new();
            table.entries.retain(|_, requests| {
                let mut kept = Vec::with_capacity(requests.len());
                for mut request in requests.drain(..) {
                    if request.settle(addr, Outcome::Disconnected) && request.pending.is_empty() {
                        done.push(request);
                    } else {
                        kept.push(request);
                    }
                }
                *requests = kept;
                !requests.is_empty()
            });
            done
        };
        if !finished.is_empty() {
            tracing::debug!(%addr, released = finished.len(), "requests released by closed connection");
        }
        for request in finished {
            request.finish();
        }
    }

    /// Releases every pending request, marking whoever hadn't answered as
    /// disconnected, and settles later registrations the same way until
    /// [`reopen`](Self::reopen).
    pub fn release_all(&self) {
        let drained: Vec<BlockingRequest> = {
            let mut table = self.lock();
            table.open = false;
            table.entries.drain().flat_map(|(_, requests)| requests).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(released = drained.len(), "releasing all blocking requests");
        }
        for mut request in drained {
            for addr in std::mem::take(&mut request.pending) {
                request.report.record(Origin::Peer(addr), Outcome::Disconnected);
            }
            request.finish();
        }
    }

    /// Accepts registrations again after [`release_all`](Self::release_all).
    pub fn reopen(&self) {
        self.lock().open = true;
    }

    /// Blocking sends still waiting on at least one target.
    pub fn pending_count(&self) -> usize {
        self.lock().entries.values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn settled(ticket: RequestTicket) -> DeliveryReport {
        tokio::time::timeout(Duration::from_secs(1), ticket.wait())
            .await
            .expect("ticket should be released")
    }

    #[tokio::test]
    async fn test_register_with_no_targets_completes_immediately() {
        let manager = RequestManager::new();
        let report = settled(manager.register(MessageId::random(), Vec::<SocketAddr>::new())).await;
        assert_eq!(report, DeliveryReport::default());
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_releases_after_every_target_answers() {
        let manager = RequestManager::new();
        let id = MessageId::random();
        let mut ticket = manager.register(id, [addr(1), addr(2)]);

        manager.resolve(id, addr(1), Outcome::Acknowledged);
        assert!(ticket.rx.try_recv().is_err(), "one target still pending");
        assert_eq!(manager.pending_count(), 1);

        manager.resolve(id, addr(2), Outcome::Failed("nope".into()));
        let report = settled(ticket).await;
        assert_eq!(report.acknowledged, vec![Origin::Peer(addr(1))]);
        assert_eq!(report.failed, vec![(Origin::Peer(addr(2)), "nope".to_string())]);
        assert!(!report.all_acknowledged());
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let manager = RequestManager::new();
        let id = MessageId::random();
        let ticket = manager.register(id, [addr(1), addr(2)]);

        manager.resolve(id, addr(1), Outcome::Acknowledged);
        manager.resolve(id, addr(1), Outcome::Acknowledged);
        manager.resolve(id, addr(3), Outcome::Acknowledged);
        assert_eq!(manager.pending_count(), 1);

        manager.resolve(id, addr(2), Outcome::Acknowledged);
        let report = settled(ticket).await;
        assert_eq!(report.target_count(), 2);
        assert!(report.all_acknowledged());
    }

    #[tokio::test]
    async fn test_connection_closed_settles_only_matching_requests() {
        let manager = RequestManager::new();
        let (a, b) = (MessageId::random(), MessageId::random());
        let ticket_a = manager.register(a, [addr(1)]);
        let _ticket_b = manager.register(b, [addr(2)]);

        manager.connection_closed(addr(1));
        let report = settled(ticket_a).await;
        assert_eq!(report.disconnected, vec![Origin::Peer(addr(1))]);
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_release_all_frees_every_waiter() {
        let manager = RequestManager::new();
        let tickets: Vec<_> = (0..3)
            .map(|i| manager.register(MessageId::random(), [addr(i), addr(100 + i)]))
            .collect();
        manager.resolve(tickets[0].id(), addr(0), Outcome::Acknowledged);

        manager.release_all();
        assert_eq!(manager.pending_count(), 0);

        let reports: Vec<_> = wait_all(tickets).await;
        assert_eq!(reports[0].acknowledged.len(), 1);
        assert_eq!(reports[0].disconnected.len(), 1);
        assert_eq!(reports[1].disconnected.len(), 2);
    }

    #[tokio::test]
    async fn test_register_after_release_all_settles_as_disconnected() {
        let manager = RequestManager::new();
        manager.release_all();

        let report = settled(manager.register(MessageId::random(), [addr(5)])).await;
        assert_eq!(report.disconnected, vec![Origin::Peer(addr(5))]);

        manager.reopen();
        let _pending = manager.register(MessageId::random(), [addr(5)]);
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_same_id_registered_twice_keeps_separate_targets() {
        let manager = RequestManager::new();
        let id = MessageId::random();
        let first = manager.register(id, [addr(1)]);
        let mut second = manager.register(id, [addr(2)]);

        manager.resolve(id, addr(1), Outcome::Acknowledged);
        let report = settled(first).await;
        assert_eq!(report.acknowledged, vec![Origin::Peer(addr(1))]);
        assert_eq!(report.target_count(), 1);
        assert!(second.rx.try_recv().is_err(), "second send still waits on its own target");
        assert_eq!(manager.pending_count(), 1);

        manager.resolve(id, addr(2), Outcome::Acknowledged);
        let report = settled(second).await;
        assert_eq!(report.acknowledged, vec![Origin::Peer(addr(2))]);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_send_to_one_target_settles_in_order() {
        let manager = RequestManager::new();
        let id = MessageId::random();
        let first = manager.register(id, [addr(1), addr(2)]);
        let mut second = manager.register(id, [addr(2)]);

        // The first answer from addr(2) belongs to the first send.
        manager.resolve(id, addr(2), Outcome::Failed("busy".into()));
        assert!(second.rx.try_recv().is_err());
        manager.resolve(id, addr(2), Outcome::Acknowledged);
        assert!(settled(second).await.all_acknowledged());

        manager.connection_closed(addr(1));
        let report = settled(first).await;
        assert_eq!(report.failed, vec![(Origin::Peer(addr(2)), "busy".to_string())]);
        assert_eq!(report.disconnected, vec![Origin::Peer(addr(1))]);
        assert_eq!(manager.pending_count(), 0);
    }

    async fn wait_all(tickets: Vec<RequestTicket>) -> Vec<DeliveryReport> {
        let mut reports = Vec::new();
        for ticket in tickets {
            reports.push(settled(ticket).await);
        }
        reports
    }
}
