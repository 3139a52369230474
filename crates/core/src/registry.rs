// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Process-wide mapping from stream name to live [`Broadcast`], with the
//! delayed-reap lifecycle around publisher disconnects.
//!
//! A name is claimed first-writer-wins. When the publisher goes away its
//! [`Publication`] guard schedules a reap after a grace window; a reconnect
//! inside the window cancels the reap and resumes the same session, so
//! already-connected subscribers never notice. Reap tasks carry an epoch that
//! is re-checked under the lock, which makes a racing reconnect win over a
//! timer that already fired.
//!
//! Ownership: the registry entry keeps the broadcast alive while it is
//! publishing or inside the grace window; subscribers hold their own
//! references, so a reaped broadcast lives on until the last of them
//! detaches. [`Registry`] itself is a cheap clonable handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::broadcast::{Broadcast, BroadcastConfig, Subscription};
use crate::error::{RelayError, Result};

/// Lifecycle tuning for a relay instance.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a disconnected publisher may take to come back before the
    /// session is stopped and its name released.
    pub grace: Duration,
    pub broadcast: BroadcastConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { grace: Duration::from_secs(10), broadcast: BroadcastConfig::default() }
    }
}

struct Entry {
    broadcast: Arc<Broadcast>,
    publishing: bool,
    /// Bumped on every publisher attach/detach; a reap task only acts if the
    /// epoch it captured is still current.
    epoch: u64,
    reaper: Option<JoinHandle<()>>,
}

struct RegistryInner {
    streams: Mutex<HashMap<String, Entry>>,
    config: RegistryConfig,
}

/// Process-wide stream name table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { inner: Arc::new(RegistryInner { streams: Mutex::new(HashMap::new()), config }) }
    }

    // Mutex poisoning is a fatal error - allows expect() for this common pattern
    #[allow(clippy::expect_used)]
    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.streams.lock().expect("registry mutex poisoned")
    }

    /// Claims `name` for a publisher.
    ///
    /// Resumes the existing session when a reap is pending for the name;
    /// refuses with [`RelayError::NameInUse`] when another publisher is
    /// attached. The returned [`Publication`] schedules the reap when
    /// dropped, whichever way the publisher session ends.
    ///
    /// # Errors
    ///
    /// [`RelayError::NameInUse`] when the name has a live publisher.
    pub fn publish(&self, name: &str) -> Result<Publication> {
        let mut streams = self.lock_streams();
        if let Some(entry) = streams.get_mut(name) {
            if entry.publishing {
                return Err(RelayError::NameInUse);
            }
            if let Some(reaper) = entry.reaper.take() {
                reaper.abort();
            }
            entry.epoch += 1;
            entry.publishing = true;
            tracing::info!(stream = %name, "publisher reconnected within the grace window");
            return Ok(Publication {
                registry: self.clone(),
                name: name.to_string(),
                broadcast: Arc::clone(&entry.broadcast),
                discarded: false,
            });
        }

        let broadcast = Arc::new(Broadcast::new(&self.inner.config.broadcast));
        streams.insert(
            name.to_string(),
            Entry { broadcast: Arc::clone(&broadcast), publishing: true, epoch: 0, reaper: None },
        );
        tracing::info!(stream = %name, "stream created");
        Ok(Publication { registry: self.clone(), name: name.to_string(), broadcast, discarded: false })
    }

    /// Attaches a subscriber to a live stream, or `None` when the name is
    /// offline.
    pub fn subscribe(&self, name: &str, skip_header: bool) -> Option<Subscription> {
        let streams = self.lock_streams();
        streams.get(name).map(|entry| Arc::clone(&entry.broadcast).connect(skip_header))
    }

    /// Whether `name` currently maps to a session (live or in its grace
    /// window).
    pub fn contains(&self, name: &str) -> bool {
        self.lock_streams().contains_key(name)
    }

    pub fn stream_count(&self) -> usize {
        self.lock_streams().len()
    }

    /// Stops every broadcast and cancels every pending reap. Subscriber
    /// writers observe end-of-stream and close.
    pub fn shutdown(&self) {
        let entries: Vec<(String, Entry)> = self.lock_streams().drain().collect();
        for (name, entry) in entries {
            if let Some(reaper) = entry.reaper {
                reaper.abort();
            }
            entry.broadcast.stop();
            tracing::info!(stream = %name, "stream stopped at shutdown");
        }
    }

    /// Drops a session on the spot: stopped, removed, name released.
    ///
    /// Used when the publisher's very first bytes were rejected, so a junk
    /// POST leaves nothing behind for subsequent subscribers to find.
    fn remove_now(&self, name: &str) {
        let entry = self.lock_streams().remove(name);
        if let Some(entry) = entry {
            if let Some(reaper) = entry.reaper {
                reaper.abort();
            }
            entry.broadcast.stop();
            tracing::info!(stream = %name, "stream discarded");
        }
    }

    /// Publisher went away: start the grace window.
    fn release(&self, name: &str) {
        let mut streams = self.lock_streams();
        let Some(entry) = streams.get_mut(name) else {
            return;
        };
        entry.publishing = false;
        entry.epoch += 1;
        let epoch = entry.epoch;
        let registry = self.clone();
        let stream = name.to_string();
        let grace = self.inner.config.grace;
        entry.reaper = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.reap(&stream, epoch);
        }));
        tracing::debug!(stream = %name, grace_secs = grace.as_secs(), "publisher detached, reap scheduled");
    }

    fn reap(&self, name: &str, epoch: u64) {
        let broadcast = {
            let mut streams = self.lock_streams();
            match streams.get(name) {
                Some(entry) if entry.epoch == epoch && !entry.publishing => {
                    streams.remove(name).map(|entry| entry.broadcast)
                }
                _ => None,
            }
        };
        if let Some(broadcast) = broadcast {
            broadcast.stop();
            tracing::info!(stream = %name, "stream reaped");
        }
    }
}

/// A publisher's claim on a stream name.
///
/// Feeds bytes into the underlying broadcast. Dropping it (clean EOF, parse
/// failure or client abort alike) detaches the publisher and schedules the
/// reap.
pub struct Publication {
    registry: Registry,
    name: String,
    broadcast: Arc<Broadcast>,
    discarded: bool,
}

impl Publication {
    /// Pushes one chunk of the publisher's request body.
    ///
    /// # Errors
    ///
    /// See [`Broadcast::send`].
    pub fn send(&self, chunk: &[u8]) -> Result<()> {
        self.broadcast.send(chunk)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn broadcast(&self) -> &Arc<Broadcast> {
        &self.broadcast
    }

    /// Tears the session down immediately instead of granting the grace
    /// window, for publishers whose bytes were rejected outright.
    pub fn discard(mut self) {
        self.discarded = true;
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        if self.discarded {
            self.registry.remove_now(&self.name);
        } else {
            self.registry.release(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(RegistryConfig::default())
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let registry = registry();
        let first = registry.publish("x").expect("fresh name");
        assert!(matches!(registry.publish("x"), Err(RelayError::NameInUse)));
        drop(first);
        // Publisher detached: the name can be reclaimed inside the window.
        let second = registry.publish("x").expect("reconnect resumes the session");
        assert_eq!(registry.stream_count(), 1);
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_after_grace_window() {
        let registry = registry();
        let publication = registry.publish("x").expect("fresh name");
        let mut sub = registry.subscribe("x", false).expect("stream is live");
        drop(publication);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!registry.contains("x"));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_reap_and_keeps_subscribers() {
        let registry = registry();
        let first = registry.publish("x").expect("fresh name");
        let broadcast = Arc::clone(first.broadcast());
        let sub = registry.subscribe("x", false).expect("stream is live");
        drop(first);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = registry.publish("x").expect("inside the grace window");
        assert!(Arc::ptr_eq(second.broadcast(), &broadcast));

        // The original deadline passes without the stream being reaped.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.contains("x"));
        assert!(!broadcast.is_stopped());
        drop(sub);
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_reap_is_a_new_session() {
        let registry = registry();
        let first = registry.publish("x").expect("fresh name");
        let old_broadcast = Arc::clone(first.broadcast());
        drop(first);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!registry.contains("x"));

        let second = registry.publish("x").expect("name was released");
        assert!(!Arc::ptr_eq(second.broadcast(), &old_broadcast));
        assert!(old_broadcast.is_stopped());
        drop(second);
    }

    #[tokio::test]
    async fn test_discard_releases_name_immediately() {
        let registry = registry();
        let publication = registry.publish("x").expect("fresh name");
        assert!(publication.send(&[0x00]).is_err());
        publication.discard();

        // No grace window: the name is free and invisible right away.
        assert!(!registry.contains("x"));
        assert!(registry.subscribe("x", false).is_none());
        let again = registry.publish("x").expect("name was released");
        drop(again);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_name_is_offline() {
        let registry = registry();
        assert!(registry.subscribe("nope", false).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let registry = registry();
        let publication = registry.publish("x").expect("fresh name");
        let mut sub = registry.subscribe("x", false).expect("stream is live");

        registry.shutdown();
        assert_eq!(registry.stream_count(), 0);
        assert!(sub.recv().await.is_none());
        assert!(matches!(publication.send(&[0x1A]), Err(RelayError::SessionClosed)));
        drop(publication);
    }
}
