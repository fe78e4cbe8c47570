//! Demo producer: app `demoapp` providing a door machine `demo` that
//! cycles through its states and obeys consumer commands.

use std::time::Duration;

use popcorn_protocol::Event;
use popcorn_server::sender::AppConnection;
use tokio_util::sync::CancellationToken;

pub const DEMO_APP: &str = "demoapp";
pub const DEMO_MACHINE: &str = "demo";

const DOOR: [&str; 4] = ["P .hinge/open", "P .hinge/closed", "P .bolt/unlocked", "P .bolt/locked"];

/// Close, lock, unlock, open, repeat.
const CYCLE: [&str; 4] = [
    "C .hinge closed",
    "C .bolt locked",
    "C .bolt unlocked",
    "C .hinge open",
];

pub fn provide_payload() -> String {
    format!("provide {DEMO_MACHINE}\n{}", DOOR.join("\n"))
}

fn update_payload(op: &str) -> String {
    format!("update {DEMO_MACHINE}\n{op}")
}

/// Op for one command word from a consumer.
fn command_op(word: &str) -> Option<&'static str> {
    match word {
        "open" => Some("C .hinge open"),
        "close" => Some("C .hinge closed"),
        "lock" => Some("C .bolt locked"),
        "unlock" => Some("C .bolt unlocked"),
        _ => None,
    }
}

/// Ops requested by a forwarded `command demo\n...` event.
fn command_ops(event: &Event) -> Vec<&'static str> {
    event
        .data
        .lines()
        .skip(1)
        .filter_map(|line| {
            let op = command_op(line.trim());
            if op.is_none() {
                tracing::debug!(command = %line, "ignoring unknown demo command");
            }
            op
        })
        .collect()
}

pub async fn run(addr: &str, interval: Duration, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut conn = AppConnection::connect(addr, DEMO_APP).await?;
    conn.transact(&provide_payload()).await?;
    tracing::info!(addr = %addr, machine = DEMO_MACHINE, "demo machine provided");

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut step = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let op = CYCLE[step % CYCLE.len()];
                step += 1;
                if let Err(e) = conn.transact(&update_payload(op)).await {
                    tracing::warn!(error = %e, op, "demo update rejected");
                }
            }
            command = conn.next_command() => {
                let Some(event) = command? else { break };
                tracing::info!(client_id = ?event.id, "demo command");
                for op in command_ops(&event) {
                    if let Err(e) = conn.transact(&update_payload(op)).await {
                        tracing::warn!(error = %e, op, "demo command rejected");
                    }
                }
            }
        }
    }
    conn.transact(&format!("abandon {DEMO_MACHINE}")).await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use popcorn_core::Machine;

    use super::*;

    #[test]
    fn payloads_are_valid_transactions() {
        let provide = provide_payload();
        let (header, body) = provide.split_once('\n').unwrap();
        assert_eq!(header, "provide demo");

        let mut door = Machine::new();
        door.interpret(body.lines()).unwrap();
        for op in CYCLE {
            let update = update_payload(op);
            door.interpret(update.lines().skip(1)).unwrap();
        }
        // A full cycle returns to the starting state.
        assert_eq!(door.current_child_name(".hinge"), Some("open"));
        assert_eq!(door.current_child_name(".bolt"), Some("unlocked"));
    }

    #[test]
    fn commands_map_to_ops() {
        let event = Event::new("command", "command demo\nclose\nlock\ndance");
        assert_eq!(command_ops(&event), vec!["C .hinge closed", "C .bolt locked"]);
    }
}
