//! Snapshot and update fan-out from published machines to consumers.
//!
//! Lock order is always machine mutex, then a `subscribers` shard. The
//! block listener runs under the machine mutex, so taking a snapshot and
//! registering a subscriber under that same mutex keeps every consumer's
//! `provide` ahead of the updates that follow it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use popcorn_core::ids::{ClientId, ListenerId};
use popcorn_core::{is_valid_machine_name, join_ops, Machine, SharedMachine};
use popcorn_telemetry::MetricsRecorder;
use serde::Serialize;

use crate::client::ClientRegistry;
use crate::config::SubscribePolicy;
use crate::error::BrokerError;

struct Published {
    tree: SharedMachine,
    listener: ListenerId,
    abandoned: bool,
    provided_at: DateTime<Utc>,
}

/// Public view of one published machine.
#[derive(Clone, Debug, Serialize)]
pub struct MachineInfo {
    pub name: String,
    pub abandoned: bool,
    pub subscribers: usize,
    pub paths: usize,
    pub provided_at: DateTime<Utc>,
}

/// Shared between the broker and every listener it attaches.
#[derive(Clone)]
struct Delivery {
    subscribers: Arc<DashMap<String, HashSet<ClientId>>>,
    clients: Arc<ClientRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Delivery {
    /// Queue `frame` for one consumer. A consumer whose queue is full or
    /// gone is dropped.
    fn send(&self, id: &ClientId, frame: String) -> bool {
        match self.clients.send_to(id, frame) {
            Ok(()) => {
                if let Some(m) = &self.metrics {
                    m.counter_inc("frames.sent", &[], 1);
                }
                true
            }
            Err(e) => {
                tracing::warn!(client_id = %id, error = %e, "delivery failed, dropping consumer");
                if let Some(m) = &self.metrics {
                    m.counter_inc("deliveries.failed", &[], 1);
                }
                false
            }
        }
    }

    /// Send `frame` to every subscriber of `machine`.
    fn broadcast(&self, machine: &str, frame: &str) {
        let failed: Vec<ClientId> = match self.subscribers.get(machine) {
            Some(set) => set
                .iter()
                .filter(|id| !self.send(id, frame.to_string()))
                .cloned()
                .collect(),
            None => return,
        };
        for id in failed {
            self.drop_client(&id);
        }
    }

    fn drop_client(&self, id: &ClientId) {
        self.clients.unregister(id);
        for mut set in self.subscribers.iter_mut() {
            set.remove(id);
        }
        self.subscribers.retain(|_, set| !set.is_empty());
    }
}

fn provide_frame(name: &str, tree: &Machine) -> String {
    format!("provide {name}\n{}", tree.serialization_text())
}

/// Distributes machine snapshots and committed blocks to subscribers.
pub struct Broker {
    machines: DashMap<String, Published>,
    delivery: Delivery,
    policy: SubscribePolicy,
}

impl Broker {
    pub fn new(
        clients: Arc<ClientRegistry>,
        policy: SubscribePolicy,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            machines: DashMap::new(),
            delivery: Delivery {
                subscribers: Arc::new(DashMap::new()),
                clients,
                metrics,
            },
            policy,
        }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.delivery.clients
    }

    /// Publish `tree` under `name`.
    ///
    /// A name that is already published and not abandoned is left alone.
    /// An abandoned entry is replaced. Current subscribers get the new
    /// snapshot before any update from the new tree.
    pub fn provide(&self, name: &str, tree: SharedMachine) {
        let previous = match self.machines.get(name) {
            Some(p) if !p.abandoned => {
                tracing::info!(machine = %name, "machine already published, ignoring provide");
                return;
            }
            Some(p) => Some((p.tree.clone(), p.listener.clone())),
            None => None,
        };

        {
            let mut guard = tree.lock();
            let delivery = self.delivery.clone();
            let machine = name.to_string();
            let listener = guard.add_block_listener(Box::new(move |ops| {
                delivery.broadcast(&machine, &format!("update {machine}\n{}", join_ops(ops)));
            }));
            self.machines.insert(
                name.to_string(),
                Published {
                    tree: tree.clone(),
                    listener,
                    abandoned: false,
                    provided_at: Utc::now(),
                },
            );
            self.delivery.broadcast(name, &provide_frame(name, &guard));
        }

        if let Some((old, listener)) = previous {
            if !Arc::ptr_eq(&old, &tree) {
                old.lock().remove_block_listener(&listener).ok();
            }
        }
        if let Some(m) = &self.delivery.metrics {
            m.gauge_set("machines.published", &[], self.machines.len() as i64);
        }
        tracing::info!(machine = %name, "machine published");
    }

    /// Mark `name` abandoned if it is still publishing `tree`. Its last
    /// state stays visible to subscribers.
    pub fn abandon(&self, name: &str, tree: &SharedMachine) -> bool {
        match self.machines.get_mut(name) {
            Some(mut p) if Arc::ptr_eq(&p.tree, tree) => {
                p.abandoned = true;
                tracing::info!(machine = %name, "machine abandoned");
                true
            }
            Some(_) => {
                tracing::debug!(machine = %name, "stale abandon ignored");
                false
            }
            None => false,
        }
    }

    /// Subscribe a consumer and send it the current snapshot.
    ///
    /// Subscribing twice is a no-op. Unknown machines fail unless the
    /// policy is [`SubscribePolicy::Pending`], in which case the snapshot
    /// arrives when the machine is provided.
    pub fn subscribe(&self, id: &ClientId, name: &str) -> Result<(), BrokerError> {
        if !is_valid_machine_name(name) {
            return Err(BrokerError::BadMachineName(name.to_string()));
        }
        if !self.delivery.clients.contains(id) {
            return Err(BrokerError::NoSuchClient(id.clone()));
        }

        loop {
            let tree = self.machines.get(name).map(|p| p.tree.clone());
            let Some(tree) = tree else {
                if self.policy == SubscribePolicy::FailFast {
                    return Err(BrokerError::NoSuchMachine(name.to_string()));
                }
                let mut set = self.delivery.subscribers.entry(name.to_string()).or_default();
                if self.machines.contains_key(name) {
                    continue;
                }
                set.insert(id.clone());
                tracing::debug!(client_id = %id, machine = %name, "subscription pending");
                return Ok(());
            };

            let guard = tree.lock();
            let replaced = self
                .machines
                .get(name)
                .map_or(true, |p| !Arc::ptr_eq(&p.tree, &tree));
            if replaced {
                continue;
            }
            let added = self
                .delivery
                .subscribers
                .entry(name.to_string())
                .or_default()
                .insert(id.clone());
            if added {
                tracing::debug!(client_id = %id, machine = %name, "subscribed");
                if !self.delivery.send(id, provide_frame(name, &guard)) {
                    drop(guard);
                    self.delivery.drop_client(id);
                }
            }
            return Ok(());
        }
    }

    /// Forget a consumer and all its subscriptions.
    pub fn remove_client(&self, id: &ClientId) {
        self.delivery.drop_client(id);
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.delivery.subscribers.get(name).map_or(0, |s| s.len())
    }

    pub fn is_subscribed(&self, id: &ClientId, name: &str) -> bool {
        self.delivery
            .subscribers
            .get(name)
            .is_some_and(|s| s.contains(id))
    }

    pub fn tree(&self, name: &str) -> Option<SharedMachine> {
        self.machines.get(name).map(|p| p.tree.clone())
    }

    /// Current serialization of a published machine, one op per line.
    pub fn snapshot(&self, name: &str) -> Option<Vec<String>> {
        let tree = self.tree(name)?;
        let lines = tree.lock().serialization().iter().map(ToString::to_string).collect();
        Some(lines)
    }

    pub fn machines(&self) -> Vec<MachineInfo> {
        let entries: Vec<(String, SharedMachine, bool, DateTime<Utc>)> = self
            .machines
            .iter()
            .map(|e| (e.key().clone(), e.tree.clone(), e.abandoned, e.provided_at))
            .collect();
        let mut out: Vec<MachineInfo> = entries
            .into_iter()
            .map(|(name, tree, abandoned, provided_at)| MachineInfo {
                subscribers: self.subscriber_count(&name),
                paths: tree.lock().all_paths().len(),
                name,
                abandoned,
                provided_at,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }
}
