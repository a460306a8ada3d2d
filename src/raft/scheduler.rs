use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::handle::NodeHandle;
use super::node::Node;
use crate::util::errors::{RaftError, Result};

/// Who drives `Node::tick`.
///
/// With `auto_tick` the node moves onto its own thread and ticks every
/// `auto_tick_period` or as soon as a message arrives; otherwise the caller
/// ticks it by hand.
pub enum Scheduler {
    Manual(Node),
    Timer(TimerScheduler),
}

pub struct TimerScheduler {
    handle: NodeHandle,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Node>,
}

impl Scheduler {
    pub fn start(node: Node) -> Result<Self> {
        if !node.config().auto_tick {
            return Ok(Scheduler::Manual(node));
        }

        let handle = node.handle();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("syncraft-tick-{}", node.self_id()))
            .spawn(move || run_ticks(node, stop_flag))?;

        Ok(Scheduler::Timer(TimerScheduler {
            handle,
            stop,
            thread,
        }))
    }

    pub fn handle(&self) -> NodeHandle {
        match self {
            Scheduler::Manual(node) => node.handle(),
            Scheduler::Timer(timer) => timer.handle.clone(),
        }
    }

    /// Tick a manually driven node
    pub fn tick(&mut self) -> Result<()> {
        match self {
            Scheduler::Manual(node) => node.tick(),
            Scheduler::Timer(_) => Err(RaftError::InvalidState(
                "node is ticked by its own thread".to_string(),
            )),
        }
    }

    /// Stop ticking and hand the node back, shut down
    pub fn stop(self) -> Result<Node> {
        let mut node = match self {
            Scheduler::Manual(node) => node,
            Scheduler::Timer(timer) => {
                timer.stop.store(true, Ordering::SeqCst);
                timer.thread.join().map_err(|_| {
                    RaftError::InvalidState("tick thread panicked".to_string())
                })?
            }
        };
        node.shutdown();
        Ok(node)
    }
}

fn run_ticks(mut node: Node, stop: Arc<AtomicBool>) -> Node {
    let period = node.config().auto_tick_period();
    tracing::info!(
        "Tick thread for {} started (period {:?})",
        node.self_id(),
        period
    );

    while !stop.load(Ordering::SeqCst) {
        if let Err(e) = node.tick_wait(period) {
            tracing::error!("Tick failed on {}: {}", node.self_id(), e);
            thread::sleep(period);
        }
    }
    node
}
