// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Broadcast fan-out: one publisher's framed byte stream replicated to many
//! subscribers.
//!
//! A [`Broadcast`] owns the stream parser, the retained initialization
//! segment, the currently open cluster prefix and the subscriber slots.
//! [`Broadcast::send`] is synchronous: it parses the chunk and completes
//! every per-subscriber enqueue before returning, so all mutations are
//! serialized and subscribers attached between two `send` calls observe
//! identical streams from that point on.
//!
//! Each subscriber drains a depth-1 queue. Deliveries produced by one `send`
//! call are merged into a single queue element; when a subscriber has not
//! drained the previous element, droppable media is skipped (the subscriber
//! re-syncs at the next cluster) while an element carrying header bytes or a
//! cluster prefix disconnects the laggard instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::ebml::{ClusterStart, StreamEvent, StreamParser};
use crate::error::{RelayError, Result};

/// At most one undelivered element per subscriber.
const SUBSCRIBER_QUEUE_DEPTH: usize = 1;

/// Tuning knobs for a broadcast session.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Cap on the retained initialization segment (and on any single cluster
    /// prefix). The protocol keeps these small; the cap only guards against
    /// hostile publishers.
    pub max_header_bytes: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { max_header_bytes: 1024 * 1024 }
    }
}

/// One subscriber slot.
#[derive(Debug)]
struct Slot {
    tx: mpsc::Sender<Bytes>,
    /// False for the adaptive-switching hook: the subscriber already holds an
    /// initialization segment and must not receive another.
    wants_header: bool,
    /// Subtracted from every cluster timecode this subscriber receives.
    ts_offset: u64,
    /// A mid-broadcast joiner without a cluster yet: the offset is fixed at
    /// the next cluster start so its first cluster reads zero. Subscribers
    /// present since stream start keep offset zero (identity relay).
    needs_ts_base: bool,
    /// Dropped media puts the slot here until the next cluster start.
    lagging: bool,
    /// Scratch for the current dispatch batch.
    outgoing: BytesMut,
    forced: bool,
}

#[derive(Debug)]
struct Shared {
    parser: StreamParser,
    /// Initialization bytes while they are still arriving.
    header: BytesMut,
    /// Frozen once `Tracks` has been fully seen; read-only and shareable.
    header_frozen: Option<Bytes>,
    /// Prefix of the cluster currently being streamed, if any.
    cluster: Option<ClusterStart>,
    slots: HashMap<u64, Slot>,
    next_slot: u64,
    stopped: bool,
}

/// A named live stream session: parser state, retained header, current
/// cluster prefix and the set of subscriber slots.
#[derive(Debug)]
pub struct Broadcast {
    shared: Mutex<Shared>,
    stopped: CancellationToken,
}

impl Broadcast {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self {
            shared: Mutex::new(Shared {
                parser: StreamParser::new(config.max_header_bytes),
                header: BytesMut::new(),
                header_frozen: None,
                cluster: None,
                slots: HashMap::new(),
                next_slot: 0,
                stopped: false,
            }),
            stopped: CancellationToken::new(),
        }
    }

    // Mutex poisoning is a fatal error - allows expect() for this common pattern
    #[allow(clippy::expect_used)]
    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("broadcast state mutex poisoned")
    }

    /// Pushes publisher bytes into the session.
    ///
    /// Parses the chunk and fans the resulting framing out to every
    /// connected subscriber before returning.
    ///
    /// # Errors
    ///
    /// [`RelayError::BadContainer`] when the bytes are not well-formed WebM;
    /// [`RelayError::SessionClosed`] when the broadcast was already stopped.
    pub fn send(&self, chunk: &[u8]) -> Result<()> {
        let mut shared = self.lock_shared();
        if shared.stopped {
            return Err(RelayError::SessionClosed);
        }
        let events = shared.parser.feed(chunk)?;
        for event in events {
            shared.dispatch(event);
        }
        shared.flush_slots();
        Ok(())
    }

    /// Registers a subscriber and primes it synchronously: the frozen header
    /// (unless skipped) and the current cluster prefix, rewritten so its
    /// first cluster reads timecode zero, are merged into one delivery.
    ///
    /// Connecting to a stopped broadcast yields a subscription that reports
    /// end-of-stream immediately.
    pub fn connect(self: Arc<Self>, skip_header: bool) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let slot_id = {
            let mut shared = self.lock_shared();
            let slot_id = shared.next_slot;
            shared.next_slot += 1;

            if shared.stopped {
                // Dropping the sender reports end-of-stream right away.
                drop(tx);
            } else {
                let mut primer = BytesMut::new();
                if !skip_header {
                    if let Some(header) = &shared.header_frozen {
                        primer.extend_from_slice(header);
                    } else {
                        // Header still arriving: catch up on what is already
                        // buffered, the remainder follows as it lands.
                        primer.extend_from_slice(&shared.header);
                    }
                }
                let mut ts_offset = 0;
                let mut needs_ts_base = false;
                if let Some(cluster) = &shared.cluster {
                    // Joining mid-cluster: the subscriber's copy of this
                    // cluster is truncated, so its size becomes unknown-length
                    // and its timecode becomes the subscriber's zero.
                    ts_offset = cluster.timecode();
                    primer.extend_from_slice(&cluster.rebased(ts_offset, true));
                } else {
                    // With no cluster open, a joiner after header close is
                    // rebased at the next cluster start; one present since
                    // stream start is not.
                    needs_ts_base = shared.header_frozen.is_some();
                }
                if !primer.is_empty() {
                    // The queue is freshly created; the primer always fits.
                    let _ = tx.try_send(primer.freeze());
                }

                let lagging = skip_header && shared.cluster.is_none();
                shared.slots.insert(
                    slot_id,
                    Slot {
                        tx,
                        wants_header: !skip_header,
                        ts_offset,
                        needs_ts_base,
                        lagging,
                        outgoing: BytesMut::new(),
                        forced: false,
                    },
                );
                tracing::debug!(slot = slot_id, skip_header, "subscriber connected");
            }
            slot_id
        };
        Subscription { broadcast: self, slot: slot_id, rx }
    }

    /// Removes a subscriber slot. Idempotent.
    pub fn disconnect(&self, slot: u64) {
        let mut shared = self.lock_shared();
        if shared.slots.remove(&slot).is_some() {
            tracing::debug!(slot, "subscriber disconnected");
        }
    }

    /// Marks the session over and wakes every subscriber so their writers
    /// drain what is queued and terminate.
    pub fn stop(&self) {
        {
            let mut shared = self.lock_shared();
            if shared.stopped {
                return;
            }
            shared.stopped = true;
            // Dropping the senders ends every subscription after it drains.
            shared.slots.clear();
        }
        self.stopped.cancel();
        tracing::debug!("broadcast stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once [`Broadcast::stop`] has been called.
    pub async fn wait_stopped(&self) {
        self.stopped.cancelled().await;
    }

    /// The frozen initialization segment, once `Tracks` has been seen.
    pub fn header(&self) -> Option<Bytes> {
        self.lock_shared().header_frozen.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_shared().slots.len()
    }
}

impl Shared {
    fn dispatch(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Header(bytes) => {
                self.header.extend_from_slice(&bytes);
                for slot in self.slots.values_mut() {
                    if slot.wants_header {
                        slot.outgoing.extend_from_slice(&bytes);
                        slot.forced = true;
                    }
                }
            }
            StreamEvent::HeaderComplete => {
                self.header_frozen = Some(self.header.split().freeze());
            }
            StreamEvent::ClusterStart(cluster) => {
                for slot in self.slots.values_mut() {
                    if slot.needs_ts_base {
                        // Joined at this boundary: its first cluster is zero.
                        slot.ts_offset = cluster.timecode();
                        slot.needs_ts_base = false;
                    }
                    slot.lagging = false;
                    slot.outgoing.extend_from_slice(&cluster.rebased(slot.ts_offset, false));
                    slot.forced = true;
                }
                self.cluster = Some(cluster);
            }
            StreamEvent::Media(bytes) => {
                for slot in self.slots.values_mut() {
                    if !slot.lagging {
                        slot.outgoing.extend_from_slice(&bytes);
                    }
                }
            }
            StreamEvent::ClusterEnd => {
                self.cluster = None;
            }
        }
    }

    /// Delivers each slot's batch. A full queue drops droppable media and
    /// marks the slot lagging; a full queue on a forced batch disconnects
    /// the subscriber.
    fn flush_slots(&mut self) {
        self.slots.retain(|slot_id, slot| {
            if slot.outgoing.is_empty() {
                slot.forced = false;
                return true;
            }
            let payload = slot.outgoing.split().freeze();
            let forced = std::mem::take(&mut slot.forced);
            match slot.tx.try_send(payload) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    if forced {
                        tracing::debug!(
                            slot = *slot_id,
                            error = %RelayError::SubscriberOverflow,
                            "dropping slow subscriber"
                        );
                        false
                    } else {
                        slot.lagging = true;
                        true
                    }
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// A connected subscriber's receiving half.
///
/// Yields the subscriber's WebM byte stream and releases its slot on drop,
/// so every exit path of a response writer disconnects cleanly.
#[derive(Debug)]
pub struct Subscription {
    broadcast: Arc<Broadcast>,
    slot: u64,
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    /// Receives the next delivery; `None` once the broadcast has stopped (or
    /// this subscriber was dropped for falling behind) and the queue has
    /// drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl futures::Stream for Subscription {
    type Item = Bytes;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcast.disconnect(self.slot);
    }
}
