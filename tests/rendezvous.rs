use bytes::Bytes;
use duty_mac::protocol::{Frame, Packet};
use duty_mac::sim::{sim_config, AirRecord, SimNetwork};
use duty_mac::time::phase_offset;
use duty_mac::util::init_test_logging;
use duty_mac::{Destination, Indication, L2Addr, MacConfig, MacState};

fn addr(id: u16) -> L2Addr {
    L2Addr::from_short(id)
}

fn frames_from<'a>(
    net: &'a SimNetwork,
    node: usize,
) -> impl Iterator<Item = &'a Packet> + 'a {
    net.air_log()
        .iter()
        .filter(move |record: &&AirRecord| record.from == node)
        .map(|record| &record.packet)
}

fn wake_requests(net: &SimNetwork, node: usize) -> usize {
    frames_from(net, node)
        .filter(|p| matches!(p.frame, Frame::WakeRequest { .. }))
        .count()
}

/// `P` for a data frame announcing more, `D` for the last one
fn data_tags(net: &SimNetwork, node: usize) -> String {
    frames_from(net, node)
        .filter_map(|p| match p.frame {
            Frame::DataPending { .. } => Some('P'),
            Frame::Data { .. } => Some('D'),
            _ => None,
        })
        .collect()
}

fn received_payloads(indications: &[Indication]) -> Vec<Bytes> {
    indications
        .iter()
        .filter_map(|i| match i {
            Indication::Received { payload, .. } => Some(payload.clone()),
            Indication::SendFailed { .. } => None,
        })
        .collect()
}

#[test]
fn test_unicast_reaches_sleeping_neighbor() {
    init_test_logging();
    let mut net = SimNetwork::new(11);
    let x = net.add_node(addr(1), sim_config(1)).unwrap();
    let y = net.add_node(addr(2), sim_config(2)).unwrap();

    net.start_node_at(y, 0);
    net.start_node_at(x, 37_000);
    net.send_at(x, 50_000, Destination::Unicast(addr(2)), Bytes::from_static(b"ping"));
    net.run_until(180_000);

    assert_eq!(
        net.take_indications(y),
        vec![Indication::Received {
            src: addr(1),
            payload: Bytes::from_static(b"ping"),
            broadcast: false,
        }]
    );
    assert!(net.take_indications(x).is_empty());

    // y wakes at multiples of 100 ms; the learned wake-up lands right after one
    let wake = match net.mac(x).neighbor_wake(addr(2)) {
        Some(wake) => wake,
        None => panic!("Expected a learned wake-up"),
    };
    let phase = phase_offset(0, wake, 100_000);
    assert!(phase <= 3_000, "phase {}", phase);

    let wrs = wake_requests(&net, x);
    assert!((1..=25).contains(&wrs), "{} wake requests", wrs);
    assert_eq!(data_tags(&net, x), "D");
    assert_eq!(net.mac(x).state(), MacState::Sleeping);
}

#[test]
fn test_second_packet_uses_learned_phase() {
    let mut net = SimNetwork::new(12);
    let x = net.add_node(addr(1), sim_config(1)).unwrap();
    let y = net.add_node(addr(2), sim_config(2)).unwrap();

    net.start_node_at(y, 0);
    net.start_node_at(x, 37_000);
    net.send_at(x, 50_000, Destination::Unicast(addr(2)), Bytes::from_static(b"one"));
    net.run_until(180_000);
    let hunting = wake_requests(&net, x);

    net.send_at(x, 230_000, Destination::Unicast(addr(2)), Bytes::from_static(b"two"));
    net.run_until(400_000);

    let payloads = received_payloads(&net.take_indications(y));
    assert_eq!(payloads, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

    // the second rendezvous starts just ahead of y's wake-up at 300 ms
    let second: Vec<u64> = net
        .air_log()
        .iter()
        .filter(|r| r.from == x && r.at_us >= 230_000)
        .map(|r| r.at_us)
        .collect();
    assert!(second[0] >= 290_000, "first frame at {}", second[0]);
    assert!(wake_requests(&net, x) - hunting <= 3);
}

#[test]
fn test_rendezvous_across_counter_wrap() {
    let mut net = SimNetwork::new(18);
    let x = net.add_node(addr(1), sim_config(1)).unwrap();
    let y = net.add_node(addr(2), sim_config(2)).unwrap();

    // the 32-bit tick counter wraps 100 ms after y starts
    let base = (1u64 << 32) - 100_000;
    net.start_node_at(y, base);
    net.start_node_at(x, base + 37_000);
    net.send_at(x, base + 50_000, Destination::Unicast(addr(2)), Bytes::from_static(b"one"));
    net.run_until(base + 180_000);
    let hunting = wake_requests(&net, x);

    net.send_at(x, base + 230_000, Destination::Unicast(addr(2)), Bytes::from_static(b"two"));
    net.run_until(base + 400_000);

    let payloads = received_payloads(&net.take_indications(y));
    assert_eq!(payloads, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

    // y's wake-up at base + 300 ms is found without a new hunt
    let second: Vec<u64> = net
        .air_log()
        .iter()
        .filter(|r| r.from == x && r.at_us >= base + 230_000)
        .map(|r| r.at_us)
        .collect();
    assert!(second[0] >= base + 290_000, "first frame at {}", second[0] - base);
    assert!(wake_requests(&net, x) - hunting <= 3);
}

#[test]
fn test_unreachable_destination_gives_up() {
    let mut net = SimNetwork::new(13);
    let x = net.add_node(addr(1), sim_config(1)).unwrap();
    let y = net.add_node(addr(2), sim_config(2)).unwrap();

    net.start_node_at(x, 0);
    net.start_node_at(y, 0);
    net.send_at(x, 50_000, Destination::Unicast(addr(9)), Bytes::from_static(b"lost"));
    net.run_until(2_000_000);

    assert_eq!(
        net.take_indications(x),
        vec![Indication::SendFailed {
            dst: Destination::Unicast(addr(9)),
            payload: Bytes::from_static(b"lost"),
        }]
    );
    assert!(net.take_indications(y).is_empty());
    assert!(!net.mac(x).neighbors().has_pending());

    // four hunts of at most one preamble each, then silence
    let last = net
        .air_log()
        .iter()
        .filter(|r| r.from == x)
        .map(|r| r.at_us)
        .max()
        .unwrap();
    assert!(last < 1_000_000, "still hunting at {}", last);
    assert!(wake_requests(&net, x) > 4 * 10);
}

#[test]
fn test_burst_tags_pending_frames() {
    let mut net = SimNetwork::new(14);
    let x = net.add_node(addr(1), sim_config(1)).unwrap();
    let y = net.add_node(addr(2), sim_config(2)).unwrap();

    net.start_node_at(y, 0);
    net.start_node_at(x, 37_000);
    let payloads: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i; 4])).collect();
    for payload in &payloads {
        net.send_at(x, 50_000, Destination::Unicast(addr(2)), payload.clone());
    }
    net.run_until(180_000);

    assert_eq!(data_tags(&net, x), "PPPPD");
    assert_eq!(received_payloads(&net.take_indications(y)), payloads);
}

#[test]
fn test_burst_cap_splits_across_cycles() {
    let mut net = SimNetwork::new(15);
    let config = MacConfig {
        max_burst: 3,
        ..sim_config(1)
    };
    let x = net.add_node(addr(1), config).unwrap();
    let y = net.add_node(addr(2), sim_config(2)).unwrap();

    net.start_node_at(y, 0);
    net.start_node_at(x, 37_000);
    let payloads: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i; 4])).collect();
    for payload in &payloads {
        net.send_at(x, 50_000, Destination::Unicast(addr(2)), payload.clone());
    }

    // the frame reaching the cap still announces more, the rest waits a cycle
    net.run_until(180_000);
    assert_eq!(data_tags(&net, x), "PPP");
    assert_eq!(received_payloads(&net.take_indications(y)), payloads[..3].to_vec());

    net.run_until(400_000);
    assert_eq!(data_tags(&net, x), "PPPPD");
    assert_eq!(received_payloads(&net.take_indications(y)), payloads[3..].to_vec());
}

#[test]
fn test_colliding_phase_is_moved() {
    let mut net = SimNetwork::new(16);
    let x = net.add_node(addr(1), sim_config(1)).unwrap();
    let y = net.add_node(addr(2), sim_config(2)).unwrap();

    net.start_node_at(y, 0);
    net.start_node_at(x, 5_000);
    assert_eq!(net.mac(x).last_wakeup(), 0);
    net.send_at(x, 50_000, Destination::Unicast(addr(2)), Bytes::from_static(b"close"));
    net.run_until(150_000);

    assert_eq!(received_payloads(&net.take_indications(y)).len(), 1);
    let interval = net.mac(x).timing().interval;
    let shift = phase_offset(5_000, net.mac(x).last_wakeup(), interval);
    assert!((15_000..=85_000).contains(&shift), "shift {}", shift);
}

#[test]
fn test_far_phase_is_kept() {
    let mut net = SimNetwork::new(17);
    let x = net.add_node(addr(1), sim_config(1)).unwrap();
    let y = net.add_node(addr(2), sim_config(2)).unwrap();

    net.start_node_at(y, 0);
    net.start_node_at(x, 50_000);
    net.send_at(x, 70_000, Destination::Unicast(addr(2)), Bytes::from_static(b"far"));
    net.run_until(150_000);

    assert_eq!(received_payloads(&net.take_indications(y)).len(), 1);
    let interval = net.mac(x).timing().interval;
    assert_eq!(phase_offset(50_000, net.mac(x).last_wakeup(), interval), 0);
}
