//! End-to-end tests over loopback sockets
//!
//! Plain std sockets play the vehicle (or another ground station) on the
//! far side of each link.

use crossbeam_channel::{Receiver, unbounded};
use mavlink::MavHeader;
use mavlink::common::{
    COMMAND_LONG_DATA, HEARTBEAT_DATA, MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavState,
    MavType,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vayu_link::connection::encode_message;
use vayu_link::{DecodedMessage, ForwardingOption, Vayu};

const TIMEOUT: Duration = Duration::from_secs(3);

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode: MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

fn vehicle_frame(message: &MavMessage) -> Vec<u8> {
    let header = MavHeader {
        system_id: 1,
        component_id: 1,
        sequence: 0,
    };
    encode_message(header, message).unwrap()
}

fn subscribe(vayu: &Vayu) -> Receiver<Arc<DecodedMessage>> {
    let (tx, rx) = unbounded();
    vayu.subscribe_messages(move |msg| {
        let _ = tx.send(msg);
    });
    rx
}

/// Retry while the link has nobody to send to yet
fn send_when_ready(vayu: &Vayu, message: &MavMessage) {
    let deadline = Instant::now() + TIMEOUT;
    while let Err(e) = vayu.send_message(message) {
        assert!(Instant::now() < deadline, "send never succeeded: {}", e);
        thread::sleep(Duration::from_millis(20));
    }
}

fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 512];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    buf[..len].to_vec()
}

#[test]
fn test_udpin_learns_remote_and_replies() {
    let port = free_udp_port();
    let vayu = Vayu::new().unwrap();
    vayu.add_any_connection(&format!("udpin://127.0.0.1:{}", port), ForwardingOption::ForwardingOff)
        .unwrap();
    let messages = subscribe(&vayu);

    let vehicle = UdpSocket::bind("127.0.0.1:0").unwrap();
    vehicle.set_read_timeout(Some(TIMEOUT)).unwrap();
    vehicle
        .send_to(&vehicle_frame(&heartbeat()), ("127.0.0.1", port))
        .unwrap();

    let received = messages.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(received.typed(), Some(&heartbeat()));
    assert_eq!(received.system_id, 1);

    send_when_ready(&vayu, &heartbeat());
    let reply = recv_datagram(&vehicle);
    assert_eq!(reply[0], 0xFD);
    assert_eq!(reply[5], 245);
}

#[test]
fn test_udpout_reaches_fixed_remote() {
    let vehicle = UdpSocket::bind("127.0.0.1:0").unwrap();
    vehicle.set_read_timeout(Some(TIMEOUT)).unwrap();
    let port = vehicle.local_addr().unwrap().port();

    let vayu = Vayu::new().unwrap();
    vayu.add_any_connection(&format!("udpout://127.0.0.1:{}", port), ForwardingOption::ForwardingOff)
        .unwrap();
    let messages = subscribe(&vayu);

    vayu.send_message(&heartbeat()).unwrap();
    let mut buf = [0u8; 512];
    let (len, from) = vehicle.recv_from(&mut buf).unwrap();
    assert_eq!(buf[..len][7], 0);

    vehicle.send_to(&vehicle_frame(&heartbeat()), from).unwrap();
    let received = messages.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(received.message_name, "HEARTBEAT");
}

#[test]
fn test_tcp_server_serves_client() {
    let port = free_tcp_port();
    let vayu = Vayu::new().unwrap();
    vayu.add_any_connection(&format!("tcpin://127.0.0.1:{}", port), ForwardingOption::ForwardingOff)
        .unwrap();
    let messages = subscribe(&vayu);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    // Split across two writes to exercise accumulation
    let frame = vehicle_frame(&heartbeat());
    client.write_all(&frame[..5]).unwrap();
    client.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    client.write_all(&frame[5..]).unwrap();

    let received = messages.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(received.typed(), Some(&heartbeat()));

    send_when_ready(&vayu, &heartbeat());
    let mut header = [0u8; 10];
    client.read_exact(&mut header).unwrap();
    assert_eq!(header[0], 0xFD);
    assert_eq!(header[5], 245);
}

#[test]
fn test_tcp_client_connects_and_exchanges() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let vayu = Vayu::new().unwrap();
    vayu.add_any_connection(&format!("tcpout://127.0.0.1:{}", port), ForwardingOption::ForwardingOff)
        .unwrap();
    let messages = subscribe(&vayu);

    let (mut server_side, _) = listener.accept().unwrap();
    server_side.set_read_timeout(Some(TIMEOUT)).unwrap();
    server_side.write_all(&vehicle_frame(&heartbeat())).unwrap();
    assert_eq!(messages.recv_timeout(TIMEOUT).unwrap().message_name, "HEARTBEAT");

    vayu.send_message(&heartbeat()).unwrap();
    let mut header = [0u8; 10];
    server_side.read_exact(&mut header).unwrap();
    assert_eq!(header[6], 190);
}

#[test]
fn test_tcp_client_start_fails_without_server() {
    let port = free_tcp_port();
    let vayu = Vayu::new().unwrap();
    let result = vayu.add_any_connection(&format!("tcpout://127.0.0.1:{}", port), ForwardingOption::ForwardingOff);
    assert!(matches!(result, Err(vayu_link::Error::Connection(_))));
    assert!(vayu.connections().is_empty());
}

#[test]
fn test_forwarding_relays_byte_exact_except_to_us() {
    let vehicle_port = free_udp_port();
    let gcs = UdpSocket::bind("127.0.0.1:0").unwrap();
    gcs.set_read_timeout(Some(TIMEOUT)).unwrap();
    let gcs_port = gcs.local_addr().unwrap().port();

    let vayu = Vayu::new().unwrap();
    vayu.add_any_connection(&format!("udpin://127.0.0.1:{}", vehicle_port), ForwardingOption::ForwardingOn)
        .unwrap();
    vayu.add_any_connection(&format!("udpout://127.0.0.1:{}", gcs_port), ForwardingOption::ForwardingOn)
        .unwrap();
    let messages = subscribe(&vayu);

    let vehicle = UdpSocket::bind("127.0.0.1:0").unwrap();
    let to_us = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        target_system: 245,
        target_component: 190,
        command: MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
        confirmation: 0,
        param1: 0.0,
        param2: 0.0,
        param3: 0.0,
        param4: 0.0,
        param5: 0.0,
        param6: 0.0,
        param7: 0.0,
    });
    vehicle
        .send_to(&vehicle_frame(&to_us), ("127.0.0.1", vehicle_port))
        .unwrap();
    assert_eq!(messages.recv_timeout(TIMEOUT).unwrap().message_name, "COMMAND_LONG");

    let heartbeat_frame = vehicle_frame(&heartbeat());
    vehicle
        .send_to(&heartbeat_frame, ("127.0.0.1", vehicle_port))
        .unwrap();

    // The command addressed to us is never relayed, so the heartbeat comes first.
    assert_eq!(recv_datagram(&gcs), heartbeat_frame);
}

#[test]
fn test_raw_bytes_fan_out_and_decode() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    let vayu = Vayu::new().unwrap();
    vayu.add_any_connection("raw://", ForwardingOption::ForwardingOff)
        .unwrap();
    vayu.add_any_connection(&format!("udpout://127.0.0.1:{}", peer_port), ForwardingOption::ForwardingOff)
        .unwrap();
    let messages = subscribe(&vayu);

    let frame = vehicle_frame(&heartbeat());
    vayu.pass_received_raw_bytes(&frame).unwrap();

    assert_eq!(messages.recv_timeout(TIMEOUT).unwrap().typed(), Some(&heartbeat()));
    assert_eq!(recv_datagram(&peer), frame);
}
