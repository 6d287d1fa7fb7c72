use bytes::Bytes;
use duty_mac::sim::{sim_config, SimNetwork};
use duty_mac::time::phase_offset;
use duty_mac::util::init_logging;
use duty_mac::{Destination, Indication, L2Addr};

fn main() {
    init_logging(tracing::Level::INFO);

    let config = sim_config(1);
    println!("MAC configuration:");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Cannot print configuration: {}", e),
    }

    let mut net = SimNetwork::new(42);
    let sensor = net.add_node(L2Addr::from_short(1), config).unwrap();
    let sink = net.add_node(L2Addr::from_short(2), sim_config(2)).unwrap();

    // the sink wakes at 0, the sensor at 37 ms into every interval
    net.start_node_at(sink, 0);
    net.start_node_at(sensor, 37_000);

    println!("\nSensor reports every 250 ms for 3 seconds, one broadcast at 1 s");
    for (i, at) in (50_000..3_000_000).step_by(250_000).enumerate() {
        let payload = Bytes::from(format!("reading {}", i));
        net.send_at(sensor, at, Destination::Unicast(L2Addr::from_short(2)), payload);
    }
    net.send_at(sensor, 1_000_000, Destination::Broadcast, Bytes::from_static(b"hello all"));
    net.run_until(3_500_000);

    println!("\nSink received:");
    for indication in net.take_indications(sink) {
        if let Indication::Received { src, payload, broadcast } = indication {
            println!(
                "- from {} ({}): {}",
                src,
                if broadcast { "broadcast" } else { "unicast" },
                String::from_utf8_lossy(&payload)
            );
        }
    }
    for indication in net.take_indications(sensor) {
        println!("Sensor: {:?}", indication);
    }

    println!("\nFrames on air: {}", net.air_log().len());
    for (name, node) in [("sensor", sensor), ("sink", sink)] {
        let mac = net.mac(node);
        println!(
            "{}: wakes {} ticks into each interval, radio on {:.2}% of the time",
            name,
            phase_offset(0, mac.last_wakeup(), mac.timing().interval),
            mac.duty_cycle().percent()
        );
    }
    let interval = net.mac(sensor).timing().interval;
    if let Some(wake) = net.mac(sensor).neighbor_wake(L2Addr::from_short(2)) {
        println!(
            "Sensor learned the sink wakes {} ticks into each interval",
            phase_offset(0, wake, interval)
        );
    }
}
