//! Losing a node: surviving peers observe closure, stranded records go away.

use super::*;
use crate::error::PortError;

#[test]
fn lost_node_closes_surviving_peers() {
    let mesh = Mesh::new();
    let (node0, delegate0) = mesh.add_node(node_name(0));
    let (node1, delegate1) = mesh.add_node(node_name(1));
    delegate0.set_save_messages(true);
    delegate1.set_read_messages(false);

    let (x0, _x1) = connect(&node0, &node1);

    // Move one end of a local pair over to node1, then lose node1.
    let (a0, a1) = node0.create_port_pair().unwrap();
    node0
        .send_message(&x0, new_string_message_with_port(&node0, "take a1", a1.name()))
        .unwrap();
    mesh.pump_tasks();

    delegate1.set_drop_messages(true);
    node0.lost_connection_to_node(node1.name()).unwrap();
    mesh.pump_tasks();

    // a0's peer now lives on the dead node; reading reports closure.
    assert_eq!(node0.get_message(&a0).err(), Some(PortError::PeerClosed));
    let status = node0.get_status(&x0).unwrap();
    assert!(status.peer_closed);

    node0.close_port(&a0).unwrap();
    node0.close_port(&x0).unwrap();
}

#[test]
fn lost_node_erases_records_in_transit() {
    let mesh = Mesh::new();
    let (node0, delegate0) = mesh.add_node(node_name(0));
    let (node1, delegate1) = mesh.add_node(node_name(1));
    delegate0.set_read_messages(false);

    // Node1 never answers; the transfer stays half-done.
    delegate1.set_drop_messages(true);
    let (x0, _x1) = connect(&node0, &node1);

    let (c, d) = node0.create_port_pair().unwrap();
    node0
        .send_message(&x0, new_string_message_with_port(&node0, "take d", d.name()))
        .unwrap();
    mesh.pump_tasks();

    // The buffering record for D is parked waiting for a PortAccepted that
    // will never come.
    assert_eq!(node0.port_count(), 3); // x0, c, d

    node0.lost_connection_to_node(node1.name()).unwrap();

    // D's record pointed into the lost node and had no local reader; only
    // the receiving ports survive, marked peer-closed where they peered
    // with the lost node.
    assert_eq!(node0.port_count(), 2); // x0 and c
    assert!(node0.get_status(&x0).unwrap().peer_closed);
    assert!(!node0.get_status(&c).unwrap().peer_closed);

    // Traffic toward the vanished record is dropped without surfacing
    // anywhere.
    node0
        .send_message(&c, new_string_message(&node0, "into the void"))
        .unwrap();

    node0.close_port(&c).unwrap();
    node0.close_port(&x0).unwrap();
    mesh.pump_tasks();
    assert_eq!(node0.port_count(), 0);
}

#[test]
fn lost_node_is_idempotent() {
    let mesh = Mesh::new();
    let (node0, delegate0) = mesh.add_node(node_name(0));
    let (node1, delegate1) = mesh.add_node(node_name(1));
    delegate0.set_read_messages(false);
    delegate1.set_drop_messages(true);

    let (x0, _x1) = connect(&node0, &node1);

    node0.lost_connection_to_node(node1.name()).unwrap();
    node0.lost_connection_to_node(node1.name()).unwrap();

    assert!(node0.get_status(&x0).unwrap().peer_closed);
    node0.close_port(&x0).unwrap();
}
