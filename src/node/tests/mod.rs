//! Node test harness: a simulated mesh.
//!
//! The mesh stands in for the inter-node layer. Forwarded messages land in
//! a shared task queue addressed by node name; pumping the queue delivers
//! them, either in FIFO order or shuffled to exercise reordering tolerance.
//! Each node gets a [`TestDelegate`] that can drop traffic (simulating a
//! dead node), save delivered messages for inspection, or auto-read them
//! the moment a port signals.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::delegate::NodeDelegate;
use crate::message::Message;
use crate::name::{NodeName, PortName};
use crate::port::PortRef;

use super::Node;

mod lost_node;

/// Shared state behind every delegate of one simulated mesh.
struct MeshState {
    tasks: Mutex<VecDeque<(NodeName, Message)>>,
    nodes: Mutex<HashMap<NodeName, Arc<Node>>>,
    next_port_name: AtomicU64,
}

pub(super) struct Mesh {
    state: Arc<MeshState>,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MeshState {
                tasks: Mutex::new(VecDeque::new()),
                nodes: Mutex::new(HashMap::new()),
                next_port_name: AtomicU64::new(1),
            }),
        }
    }

    /// Create a node whose delegate routes through this mesh.
    pub fn add_node(&self, name: NodeName) -> (Arc<Node>, Arc<TestDelegate>) {
        let delegate = Arc::new(TestDelegate {
            state: Arc::clone(&self.state),
            node_name: name,
            drop_messages: AtomicBool::new(false),
            read_messages: AtomicBool::new(true),
            save_messages: AtomicBool::new(false),
            saved: Mutex::new(VecDeque::new()),
        });
        let node = Arc::new(Node::new(name, Arc::clone(&delegate) as Arc<dyn NodeDelegate>));
        self.state
            .nodes
            .lock()
            .unwrap()
            .insert(name, Arc::clone(&node));
        (node, delegate)
    }

    /// Deliver queued messages in arrival order until quiescent.
    pub fn pump_tasks(&self) {
        loop {
            let task = self.state.tasks.lock().unwrap().pop_front();
            let Some((node_name, message)) = task else { return };
            self.deliver(node_name, message);
        }
    }

    /// Deliver queued messages in random order until quiescent. The
    /// protocol must tolerate arbitrary interleaving of deliveries from
    /// different sources.
    pub fn pump_tasks_shuffled(&self) {
        let mut rng = rand::thread_rng();
        loop {
            let task = {
                let mut tasks = self.state.tasks.lock().unwrap();
                if tasks.is_empty() {
                    return;
                }
                let index = rng.gen_range(0..tasks.len());
                tasks.remove(index)
            };
            let Some((node_name, message)) = task else { return };
            self.deliver(node_name, message);
        }
    }

    fn deliver(&self, node_name: NodeName, message: Message) {
        let node = self.state.nodes.lock().unwrap().get(&node_name).cloned();
        if let Some(node) = node {
            let _ = node.accept_message(message);
        }
    }

    pub fn pending_task_count(&self) -> usize {
        self.state.tasks.lock().unwrap().len()
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        // Nodes hold their delegates, delegates hold the mesh state, and
        // the state holds the nodes; break the cycle.
        self.state.nodes.lock().unwrap().clear();
        self.state.tasks.lock().unwrap().clear();
    }
}

pub(super) struct TestDelegate {
    state: Arc<MeshState>,
    node_name: NodeName,
    drop_messages: AtomicBool,
    read_messages: AtomicBool,
    save_messages: AtomicBool,
    saved: Mutex<VecDeque<Message>>,
}

impl TestDelegate {
    /// Drop all forwarded traffic, simulating a lost connection.
    pub fn set_drop_messages(&self, value: bool) {
        self.drop_messages.store(value, Ordering::Relaxed);
    }

    /// Stop auto-reading on status changes.
    pub fn set_read_messages(&self, value: bool) {
        self.read_messages.store(value, Ordering::Relaxed);
    }

    /// Save auto-read messages for inspection instead of consuming them.
    pub fn set_save_messages(&self, value: bool) {
        self.save_messages.store(value, Ordering::Relaxed);
    }

    /// Pop the oldest saved message, if any.
    pub fn saved_message(&self) -> Option<Message> {
        self.saved.lock().unwrap().pop_front()
    }

    fn node(&self) -> Option<Arc<Node>> {
        self.state.nodes.lock().unwrap().get(&self.node_name).cloned()
    }
}

impl NodeDelegate for TestDelegate {
    fn generate_random_port_name(&self) -> PortName {
        // Sequential names keep failures readable; uniqueness is what the
        // fabric actually needs.
        port_name_from_u64(self.state.next_port_name.fetch_add(1, Ordering::Relaxed))
    }

    fn forward_message(&self, node: NodeName, message: Message) {
        if self.drop_messages.load(Ordering::Relaxed) {
            return;
        }
        self.state.tasks.lock().unwrap().push_back((node, message));
    }

    fn port_status_changed(&self, port: &PortRef) {
        if !self.read_messages.load(Ordering::Relaxed) {
            return;
        }
        let Some(node) = self.node() else { return };

        loop {
            match node.get_message(port) {
                Ok(Some(message)) => {
                    if self.save_messages.load(Ordering::Relaxed) {
                        self.saved.lock().unwrap().push_back(message);
                    } else {
                        // Greet and close received ports so nothing leaks.
                        for i in 0..message.num_ports() {
                            let name = message.port(i);
                            if let Ok(received) = node.get_port(name) {
                                let reply =
                                    new_string_message(&node, &format!("got port: {:?}", name));
                                let _ = node.send_message(&received, reply);
                                let _ = node.close_port(&received);
                            }
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }
}

// === Helpers ===

pub(super) fn node_name(value: u8) -> NodeName {
    let mut bytes = [0u8; 16];
    bytes[0] = value;
    bytes[15] = 1;
    NodeName::from_bytes(bytes)
}

pub(super) fn port_name_from_u64(value: u64) -> PortName {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&value.to_le_bytes());
    PortName::from_bytes(bytes)
}

pub(super) fn new_string_message(node: &Node, text: &str) -> Message {
    let mut message = node.alloc_message(text.len(), 0);
    message.payload_mut().copy_from_slice(text.as_bytes());
    message
}

pub(super) fn new_string_message_with_port(node: &Node, text: &str, port: PortName) -> Message {
    let mut message = node.alloc_message(text.len(), 1);
    message.payload_mut().copy_from_slice(text.as_bytes());
    message.set_port(0, port);
    message
}

pub(super) fn message_text(message: &Message) -> &str {
    std::str::from_utf8(message.payload()).expect("payload is not utf-8")
}

/// Build a cross-node pipe the way an embedder bootstraps one.
pub(super) fn connect(node0: &Node, node1: &Node) -> (PortRef, PortRef) {
    let x0 = node0.create_uninitialized_port().unwrap();
    let x1 = node1.create_uninitialized_port().unwrap();
    node0.initialize_port(&x0, node1.name(), x1.name()).unwrap();
    node1.initialize_port(&x1, node0.name(), x0.name()).unwrap();
    (x0, x1)
}

/// Opt-in diagnostics: `RUST_LOG=portmesh=debug cargo test -- --nocapture`.
pub(super) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
