//! Registry of producer apps and the machines they provide.
//!
//! Every transaction arrives as `<verb> <machine>\n<ops...>` with verb one
//! of `provide`, `update` or `abandon`. Provides and abandons are reported
//! on an [`AppEvent`] channel so the broker can follow along.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use popcorn_core::ids::{ClientId, ConnectionId};
use popcorn_core::{is_valid_machine_name, Machine, SharedMachine};
use popcorn_protocol::Event;
use popcorn_telemetry::MetricsRecorder;
use tokio::sync::mpsc;

use crate::error::RegistryError;

/// Event type used to forward consumer commands to a producer.
pub const COMMAND_EVENT: &str = "command";

/// Notifications raised by the app server.
#[derive(Debug)]
pub enum AppEvent {
    Provide {
        app: Option<String>,
        machine: String,
        tree: SharedMachine,
    },
    Update {
        machine: String,
        ops: usize,
    },
    Abandon {
        app: Option<String>,
        machine: String,
        tree: SharedMachine,
    },
}

/// Who is running a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requester {
    App { conn: ConnectionId, name: String },
    OneShot,
}

impl Requester {
    fn app_name(&self) -> Option<String> {
        match self {
            Self::App { name, .. } => Some(name.clone()),
            Self::OneShot => None,
        }
    }

    fn owns(&self, owner: Option<&ConnectionId>) -> bool {
        match self {
            Self::App { conn, .. } => owner == Some(conn),
            Self::OneShot => owner.is_none(),
        }
    }
}

impl std::fmt::Display for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::App { name, .. } => f.write_str(name),
            Self::OneShot => f.write_str("one-shot sender"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verb {
    Provide,
    Update,
    Abandon,
}

/// First line of a transaction: verb and machine name.
fn parse_header(line: &str) -> Result<(Verb, &str), RegistryError> {
    let mut tokens = line.split_whitespace();
    let (Some(verb), Some(machine), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(RegistryError::BadTransaction(line.trim().to_string()));
    };
    let verb = match verb {
        "provide" => Verb::Provide,
        "update" => Verb::Update,
        "abandon" => Verb::Abandon,
        _ => return Err(RegistryError::BadTransaction(line.trim().to_string())),
    };
    if !is_valid_machine_name(machine) {
        return Err(RegistryError::BadMachineName(machine.to_string()));
    }
    Ok((verb, machine))
}

struct LiveMachine {
    tree: SharedMachine,
    owner: Option<ConnectionId>,
}

struct AppConn {
    name: String,
    commands: mpsc::UnboundedSender<Event>,
}

pub struct AppServer {
    live: DashMap<String, LiveMachine>,
    apps: DashMap<ConnectionId, AppConn>,
    events: mpsc::UnboundedSender<AppEvent>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl AppServer {
    pub fn new(
        events: mpsc::UnboundedSender<AppEvent>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            live: DashMap::new(),
            apps: DashMap::new(),
            events,
            metrics,
        }
    }

    fn emit(&self, event: AppEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("app event receiver dropped");
        }
    }

    fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.gauge_set("producers.connected", &[], self.apps.len() as i64);
        }
    }

    /// Register an app connection. The receiver yields commands forwarded
    /// from consumers.
    pub fn connect_app(&self, name: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Event>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.apps.insert(
            conn.clone(),
            AppConn {
                name: name.to_string(),
                commands: tx,
            },
        );
        self.update_gauge();
        tracing::info!(app = %name, conn_id = %conn, "app connected");
        (conn, rx)
    }

    /// Drop an app connection and abandon everything it provided.
    pub fn disconnect(&self, conn: &ConnectionId) {
        let Some((_, app)) = self.apps.remove(conn) else {
            return;
        };
        let owned: Vec<String> = self
            .live
            .iter()
            .filter(|e| e.owner.as_ref() == Some(conn))
            .map(|e| e.key().clone())
            .collect();
        for machine in owned {
            let Entry::Occupied(entry) = self.live.entry(machine) else {
                continue;
            };
            if entry.get().owner.as_ref() != Some(conn) {
                continue;
            }
            tracing::info!(app = %app.name, machine = %entry.key(), "abandoned on disconnect");
            self.emit(AppEvent::Abandon {
                app: Some(app.name.clone()),
                machine: entry.key().clone(),
                tree: entry.get().tree.clone(),
            });
            entry.remove();
        }
        self.update_gauge();
        tracing::info!(app = %app.name, conn_id = %conn, "app disconnected");
    }

    /// Run one transaction.
    pub fn execute(&self, requester: &Requester, payload: &str) -> Result<(), RegistryError> {
        let (header, body) = payload.split_once('\n').unwrap_or((payload, ""));
        let (verb, machine) = parse_header(header)?;
        let result = match verb {
            Verb::Provide => self.provide(requester, machine, body),
            Verb::Update => self.update(requester, machine, body),
            Verb::Abandon => self.abandon(requester, machine),
        };
        if let Err(e) = &result {
            tracing::warn!(
                requester = %requester,
                machine = %machine,
                error = %e,
                kind = e.error_kind(),
                "transaction rejected"
            );
            if let Some(m) = &self.metrics {
                m.counter_inc("transactions.rejected", &[("machine", machine)], 1);
            }
        }
        result
    }

    // Provide and abandon notifications are sent while the `live` entry is
    // held, so the bridge sees them in the same order as the registry.
    fn provide(&self, requester: &Requester, machine: &str, body: &str) -> Result<(), RegistryError> {
        let Entry::Vacant(slot) = self.live.entry(machine.to_string()) else {
            return Err(RegistryError::AlreadyProvided(machine.to_string()));
        };
        let mut tree = Machine::new();
        tree.interpret(body.lines())?;
        let tree = tree.into_shared();
        let _entry = slot.insert(LiveMachine {
            tree: tree.clone(),
            owner: match requester {
                Requester::App { conn, .. } => Some(conn.clone()),
                Requester::OneShot => None,
            },
        });
        tracing::info!(requester = %requester, machine = %machine, "machine provided");
        self.emit(AppEvent::Provide {
            app: requester.app_name(),
            machine: machine.to_string(),
            tree,
        });
        Ok(())
    }

    fn update(&self, requester: &Requester, machine: &str, body: &str) -> Result<(), RegistryError> {
        let tree = {
            let live = self
                .live
                .get(machine)
                .ok_or_else(|| RegistryError::UnknownMachine(machine.to_string()))?;
            if let Requester::App { conn, name } = requester {
                if live.owner.as_ref() != Some(conn) {
                    return Err(RegistryError::NotOwner {
                        machine: machine.to_string(),
                        app: name.clone(),
                    });
                }
            }
            live.tree.clone()
        };
        let ops = tree.lock().interpret(body.lines())?;
        tracing::debug!(requester = %requester, machine = %machine, ops = ops.len(), "update committed");
        self.emit(AppEvent::Update {
            machine: machine.to_string(),
            ops: ops.len(),
        });
        Ok(())
    }

    fn abandon(&self, requester: &Requester, machine: &str) -> Result<(), RegistryError> {
        let entry = match self.live.entry(machine.to_string()) {
            Entry::Occupied(entry) if requester.owns(entry.get().owner.as_ref()) => entry,
            _ => {
                return Err(RegistryError::NotOwner {
                    machine: machine.to_string(),
                    app: requester.to_string(),
                })
            }
        };
        tracing::info!(requester = %requester, machine = %machine, "machine abandoned");
        self.emit(AppEvent::Abandon {
            app: requester.app_name(),
            machine: machine.to_string(),
            tree: entry.get().tree.clone(),
        });
        entry.remove();
        Ok(())
    }

    /// Forward a consumer command to the app providing `machine`.
    pub fn send_command(
        &self,
        machine: &str,
        text: &str,
        client: &ClientId,
    ) -> Result<(), RegistryError> {
        if !is_valid_machine_name(machine) {
            return Err(RegistryError::BadMachineName(machine.to_string()));
        }
        let owner = self
            .live
            .get(machine)
            .ok_or_else(|| RegistryError::UnknownMachine(machine.to_string()))?
            .owner
            .clone()
            .ok_or_else(|| RegistryError::NoCommandTarget(machine.to_string()))?;
        let app = self
            .apps
            .get(&owner)
            .ok_or_else(|| RegistryError::NoCommandTarget(machine.to_string()))?;
        app.commands
            .send(Event::new(COMMAND_EVENT, text).with_id(client.as_str()))
            .map_err(|_| RegistryError::NoCommandTarget(machine.to_string()))?;
        tracing::debug!(machine = %machine, app = %app.name, client_id = %client, "command forwarded");
        Ok(())
    }

    /// Name of the app currently providing `machine`.
    pub fn owner_name(&self, machine: &str) -> Option<String> {
        let owner = self.live.get(machine)?.owner.clone()?;
        self.apps.get(&owner).map(|a| a.name.clone())
    }

    pub fn is_live(&self, machine: &str) -> bool {
        self.live.contains_key(machine)
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> (AppServer, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AppServer::new(tx, Some(Arc::new(MetricsRecorder::new()))), rx)
    }

    fn app(server: &AppServer, name: &str) -> (Requester, mpsc::UnboundedReceiver<Event>) {
        let (conn, rx) = server.connect_app(name);
        (
            Requester::App {
                conn,
                name: name.to_string(),
            },
            rx,
        )
    }

    const DOOR: &str = "provide demo\nP .hinge/open\nP .hinge/closed\nP .bolt/unlocked\nP .bolt/locked";

    #[test]
    fn provide_raises_notification() {
        let (server, mut events) = server();
        let (demoapp, _cmds) = app(&server, "demoapp");
        server.execute(&demoapp, DOOR).unwrap();

        match events.try_recv().unwrap() {
            AppEvent::Provide { app, machine, tree } => {
                assert_eq!(app.as_deref(), Some("demoapp"));
                assert_eq!(machine, "demo");
                assert_eq!(tree.lock().current_child_name(".hinge"), Some("open"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.owner_name("demo").as_deref(), Some("demoapp"));
    }

    #[test]
    fn duplicate_provide_fails() {
        let (server, _events) = server();
        let (a, _ca) = app(&server, "a");
        let (b, _cb) = app(&server, "b");
        server.execute(&a, DOOR).unwrap();
        assert_eq!(
            server.execute(&a, DOOR),
            Err(RegistryError::AlreadyProvided("demo".into()))
        );
        assert!(server.execute(&b, DOOR).is_err());
    }

    #[test]
    fn provide_with_bad_ops_registers_nothing() {
        let (server, mut events) = server();
        let (a, _c) = app(&server, "a");
        let err = server.execute(&a, "provide demo\nP .a\nD .a/b x").unwrap_err();
        assert!(matches!(err, RegistryError::Machine(_)));
        assert!(!server.is_live("demo"));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn update_requires_known_machine_and_owner() {
        let (server, mut events) = server();
        let (a, _ca) = app(&server, "a");
        let (b, _cb) = app(&server, "b");
        assert_eq!(
            server.execute(&a, "update demo\nC .hinge closed"),
            Err(RegistryError::UnknownMachine("demo".into()))
        );
        server.execute(&a, DOOR).unwrap();
        events.try_recv().unwrap();

        assert!(matches!(
            server.execute(&b, "update demo\nC .hinge closed"),
            Err(RegistryError::NotOwner { .. })
        ));
        server.execute(&a, "update demo\nC .hinge closed").unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            AppEvent::Update { ops: 1, .. }
        ));
        // One-shot senders may update any live machine.
        server
            .execute(&Requester::OneShot, "update demo\nC .bolt locked")
            .unwrap();
    }

    #[test]
    fn abandon_only_by_owner_keeps_tree_alive() {
        let (server, mut events) = server();
        let (a, _ca) = app(&server, "a");
        let (b, _cb) = app(&server, "b");
        server.execute(&a, DOOR).unwrap();
        let AppEvent::Provide { tree, .. } = events.try_recv().unwrap() else {
            panic!("expected provide");
        };

        assert!(server.execute(&b, "abandon demo").is_err());
        server.execute(&a, "abandon demo").unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            AppEvent::Abandon { machine, tree: abandoned, .. }
                if machine == "demo" && Arc::ptr_eq(&abandoned, &tree)
        ));
        assert!(!server.is_live("demo"));
        assert!(tree.lock().exists(".hinge/open"));

        // The name is free again.
        server.execute(&b, DOOR).unwrap();
    }

    #[test]
    fn bad_headers() {
        let (server, _events) = server();
        let (a, _c) = app(&server, "a");
        assert!(matches!(
            server.execute(&a, "launch demo"),
            Err(RegistryError::BadTransaction(_))
        ));
        assert!(matches!(
            server.execute(&a, "provide"),
            Err(RegistryError::BadTransaction(_))
        ));
        assert!(matches!(
            server.execute(&a, "provide Demo"),
            Err(RegistryError::BadMachineName(_))
        ));
    }

    #[test]
    fn disconnect_abandons_owned_machines() {
        let (server, mut events) = server();
        let (a, _c) = app(&server, "a");
        server.execute(&a, DOOR).unwrap();
        server
            .execute(&Requester::OneShot, "provide other\nP .x")
            .unwrap();
        events.try_recv().unwrap();
        events.try_recv().unwrap();

        let Requester::App { conn, .. } = &a else { unreachable!() };
        server.disconnect(conn);
        assert!(matches!(
            events.try_recv().unwrap(),
            AppEvent::Abandon { machine, .. } if machine == "demo"
        ));
        assert!(events.try_recv().is_err());
        assert!(server.is_live("other"));
        assert_eq!(server.app_count(), 0);
    }

    #[test]
    fn commands_reach_the_owning_app() {
        let (server, _events) = server();
        let (a, mut cmds) = app(&server, "a");
        server.execute(&a, DOOR).unwrap();
        server
            .execute(&Requester::OneShot, "provide anon\nP .x")
            .unwrap();

        let client = ClientId::from_raw("c1");
        server
            .send_command("demo", "command demo\nopen", &client)
            .unwrap();
        let ev = cmds.try_recv().unwrap();
        assert_eq!(ev.event_type, COMMAND_EVENT);
        assert_eq!(ev.data, "command demo\nopen");
        assert_eq!(ev.id.as_deref(), Some("c1"));

        assert_eq!(
            server.send_command("anon", "command anon", &client),
            Err(RegistryError::NoCommandTarget("anon".into()))
        );
        assert_eq!(
            server.send_command("nope", "command nope", &client),
            Err(RegistryError::UnknownMachine("nope".into()))
        );
    }
}
