use clap::{value_parser, Arg, ArgMatches, Command};
use log::{debug, info, warn};
use neuron::{
    buffers::{AllocFlags, SegmentAllocator},
    error::NeuronError,
    protocol::{ApplicationDriver, ProtocolDriver, ProtocolState, Signal, SignalDriver},
    topology::{Loopback, Peer},
    transport::{Transport, TransportError},
    Application, Bus, ChannelKind, Direction, Result, SegmentConfig, Topology,
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

fn main() -> Result<()> {
    env_logger::init();

    let file_arg = Arg::new("file")
        .short('f')
        .long("file")
        .value_name("FILE")
        .help("Topology file (TOML)")
        .required(true)
        .value_parser(value_parser!(PathBuf));

    let matches = Command::new("neuron-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Neuron channel/protocol binding engine CLI Tool")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("topology")
                .about("Apply a topology and print the binding table")
                .arg(file_arg.clone())
                .arg(
                    Arg::new("no-drivers")
                        .long("no-drivers")
                        .help("Do not attach signal drivers to bound protocols")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("exchange")
                .about("Push messages through every active queue protocol")
                .arg(file_arg)
                .arg(
                    Arg::new("messages")
                        .short('m')
                        .long("messages")
                        .value_name("COUNT")
                        .help("Messages per receiving queue channel")
                        .default_value("1000")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("size")
                        .short('s')
                        .long("size")
                        .value_name("BYTES")
                        .help("Message size")
                        .default_value("256")
                        .value_parser(value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("alloc")
                .about("Show how a buffer is split into segments")
                .arg(
                    Arg::new("size")
                        .short('s')
                        .long("size")
                        .value_name("BYTES")
                        .help("Buffer size")
                        .required(true)
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("segment")
                        .long("segment")
                        .value_name("BYTES")
                        .help("Largest segment")
                        .value_parser(value_parser!(usize)),
                ),
        )
        .subcommand(Command::new("info").about("Show version information"))
        .get_matches();

    match matches.subcommand() {
        Some(("topology", sub)) => handle_topology(sub),
        Some(("exchange", sub)) => handle_exchange(sub),
        Some(("alloc", sub)) => handle_alloc(sub),
        Some(("info", _)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn required<'a, T>(matches: &'a ArgMatches, name: &str) -> Result<&'a T>
where
    T: Clone + Send + Sync + 'static,
{
    matches
        .get_one::<T>(name)
        .ok_or_else(|| NeuronError::invalid_parameter(name, "missing value"))
}

/// Logs "protocol ready" for every application kind in the topology
#[derive(Debug)]
struct ReadyLogger {
    name: String,
    kind: String,
    ready: AtomicU64,
}

impl ApplicationDriver for ReadyLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind_tag(&self) -> &str {
        &self.kind
    }

    fn protocol_ready(&self, application: &Arc<Application>) {
        self.ready.fetch_add(1, Ordering::Relaxed);
        info!(
            "application {} ({}) ready on protocol {}",
            application.id(),
            self.kind,
            application.protocol()
        );
    }
}

/// Load a topology, apply it and attach one signal driver per protocol shape
fn bring_up(path: &Path, attach: bool) -> Result<(Bus, Loopback, Vec<Arc<SignalDriver>>)> {
    let topology = Topology::load(path)?;
    let (bus, loopback) = topology.instantiate()?;

    let mut kinds: Vec<&str> = topology.applications.iter().map(|a| a.kind.as_str()).collect();
    kinds.sort_unstable();
    kinds.dedup();
    for kind in kinds {
        bus.register_app_driver(Arc::new(ReadyLogger {
            name: format!("ready-{}", kind),
            kind: kind.to_string(),
            ready: AtomicU64::new(0),
        }))?;
    }

    let mut drivers: Vec<Arc<SignalDriver>> = Vec::new();
    if attach {
        for spec in &topology.protocols {
            let served = drivers.iter().any(|d| {
                d.channels() == spec.channels.as_slice()
                    && d.processes() == spec.processes.as_slice()
            });
            if served {
                continue;
            }
            let driver = Arc::new(
                SignalDriver::new(format!("signal-{}", drivers.len()), spec.channels.clone())?
                    .with_processes(spec.processes.clone()),
            );
            bus.register_protocol_driver(driver.clone())?;
            drivers.push(driver);
        }
    }

    let handshakes = loopback.complete_handshakes();
    if handshakes > 0 {
        debug!("completed {} queue handshakes", handshakes);
    }
    Ok((bus, loopback, drivers))
}

fn handle_topology(matches: &ArgMatches) -> Result<()> {
    let path = required::<PathBuf>(matches, "file")?;
    let (bus, _loopback, _drivers) = bring_up(path, !matches.get_flag("no-drivers"))?;

    println!("Channels:");
    for channel in bus.channels() {
        let binding = match channel.binding() {
            Some(b) => format!("protocol {} slot {}", b.protocol, b.identity),
            None => "unbound".to_string(),
        };
        println!(
            "  #{:<4} {:<14} {:<13} {:<16} {}",
            channel.id(),
            channel.kind(),
            channel.direction(),
            channel.name().unwrap_or("-"),
            binding
        );
    }

    println!("\nProtocols:");
    for protocol in bus.protocols() {
        let driver = protocol
            .driver()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  #{:<4} {:<16} {:<8} {}/{} slots  driver: {}",
            protocol.id(),
            protocol.name(),
            protocol.state(),
            protocol.filled_slots(),
            protocol.shape().len(),
            driver
        );
    }

    println!("\nApplications:");
    for application in bus.applications() {
        println!(
            "  #{:<4} {:<16} protocol {}  driver: {}",
            application.id(),
            application.kind_tag(),
            application.protocol(),
            if application.has_driver() { "attached" } else { "-" }
        );
    }

    println!("\n{}", bus.stats().summary());
    Ok(())
}

/// Drain every queue a signal points at until the driver is told to stop
fn run_worker(
    driver: Arc<SignalDriver>,
    size: usize,
    stop: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
) {
    let allocator = match SegmentAllocator::heap(SegmentConfig::default()) {
        Ok(allocator) => allocator,
        Err(err) => {
            warn!("{}: cannot create allocator: {}", driver.name(), err);
            return;
        }
    };
    let mut inbox = match allocator.allocate(size, AllocFlags::Atomic) {
        Ok(buffer) => buffer,
        Err(err) => {
            warn!("cannot allocate inbox: {}", err);
            return;
        }
    };

    while !stop.load(Ordering::Acquire) {
        match driver.wait(Some(Duration::from_millis(20))) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                warn!("signal wait failed: {}", err);
                return;
            }
        }

        let protocols = driver.protocols();
        for signal in driver.drain() {
            let Signal::Channel { protocol, channel } = signal else {
                continue;
            };
            let Some(channel) = protocols
                .iter()
                .find(|p| p.id() == protocol)
                .and_then(|p| p.channel(channel))
            else {
                continue;
            };
            if channel.kind() != ChannelKind::MessageQueue || !channel.direction().can_receive() {
                continue;
            }

            loop {
                match channel.receive(&mut inbox) {
                    Ok(_) => {
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(NeuronError::TransportFailure(TransportError::WouldBlock)) => break,
                    Err(err) => {
                        warn!("receive on channel {} failed: {}", channel.id(), err);
                        break;
                    }
                }
            }
        }
    }
}

fn handle_exchange(matches: &ArgMatches) -> Result<()> {
    let path = required::<PathBuf>(matches, "file")?;
    let messages = *required::<usize>(matches, "messages")?;
    let size = *required::<usize>(matches, "size")?;

    let (bus, loopback, drivers) = bring_up(path, true)?;

    let active: Vec<_> = loopback
        .endpoints
        .iter()
        .filter(|e| e.channel.kind() == ChannelKind::MessageQueue && e.channel.has_driver())
        .collect();
    let inbound: Vec<_> = active
        .iter()
        .filter(|e| e.channel.direction() == Direction::Receive)
        .collect();
    let outbound: Vec<_> = active
        .iter()
        .filter(|e| e.channel.direction() == Direction::Send)
        .collect();

    println!(
        "Exchanging {} messages of {} bytes over {} inbound and {} outbound queue channels",
        messages,
        size,
        inbound.len(),
        outbound.len()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let received = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = drivers
        .iter()
        .map(|driver| {
            let (driver, stop, received) = (driver.clone(), stop.clone(), received.clone());
            thread::spawn(move || run_worker(driver, size, stop, received))
        })
        .collect();

    let start = Instant::now();
    let mut message = bus.allocate(size, AllocFlags::Atomic)?;
    let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
    message.fill_from(&payload)?;

    for endpoint in &inbound {
        let Peer::Queue(peer) = &endpoint.peer else {
            continue;
        };
        let mut sent = 0;
        while sent < messages {
            match peer.send(&message) {
                Ok(()) => sent += 1,
                Err(TransportError::WouldBlock) => thread::yield_now(),
                Err(err) => return Err(err.into()),
            }
        }
    }

    let mut delivered = 0u64;
    let mut drain = bus.allocate(size, AllocFlags::Atomic)?;
    for endpoint in &outbound {
        let Peer::Queue(peer) = &endpoint.peer else {
            continue;
        };
        let mut sent = 0;
        while sent < messages {
            match endpoint.channel.send(&message) {
                Ok(()) => sent += 1,
                Err(NeuronError::TransportFailure(TransportError::WouldBlock)) => {
                    drain.set_len(drain.capacity());
                    while peer.receive(&mut drain).is_ok() {
                        delivered += 1;
                        drain.set_len(drain.capacity());
                    }
                }
                Err(err) => return Err(err),
            }
        }
        drain.set_len(drain.capacity());
        while peer.receive(&mut drain).is_ok() {
            delivered += 1;
            drain.set_len(drain.capacity());
        }
    }

    let expected = (inbound.len() * messages) as u64;
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.load(Ordering::Relaxed) < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    stop.store(true, Ordering::Release);
    for worker in workers {
        if worker.join().is_err() {
            warn!("worker thread panicked");
        }
    }
    let elapsed = start.elapsed();

    println!("\nResults:");
    println!("  Received by workers: {}/{}", received.load(Ordering::Relaxed), expected);
    println!("  Delivered to peers: {}", delivered);
    println!("  Total time: {:.2}ms", elapsed.as_secs_f64() * 1000.0);

    let mut by_driver: BTreeMap<String, _> = BTreeMap::new();
    for driver in &drivers {
        by_driver.insert(driver.name().to_string(), driver.stats());
    }
    for (name, stats) in by_driver {
        println!(
            "  {}: {} channel wakeups, {} app events, {} dropped",
            name, stats.channel_wakeups, stats.app_events, stats.dropped
        );
    }

    let stats = bus.stats();
    println!(
        "  Channel wakeups: {} delivered, {} not bound",
        stats.channel_wakeups.delivered, stats.channel_wakeups.not_bound
    );
    let active_protocols = bus
        .protocols()
        .iter()
        .filter(|p| p.state() == ProtocolState::Active)
        .count();
    println!("  Active protocols: {}", active_protocols);
    Ok(())
}

fn handle_alloc(matches: &ArgMatches) -> Result<()> {
    let size = *required::<usize>(matches, "size")?;
    let mut config = SegmentConfig::default();
    if let Some(segment) = matches.get_one::<usize>("segment") {
        config = config.with_max_segment_capacity(*segment);
    }
    config.validate()?;

    let allocator = SegmentAllocator::heap(config)?;
    let start = Instant::now();
    let buffer = allocator.allocate(size, AllocFlags::Atomic)?;
    let elapsed = start.elapsed();

    println!(
        "Buffer of {} bytes in {} segments (max {} bytes each)",
        buffer.len(),
        buffer.segment_count(),
        allocator.max_segment_capacity()
    );
    for (index, segment) in buffer.segments().enumerate() {
        println!(
            "  [{}] len {} capacity {}",
            index,
            segment.len(),
            segment.capacity()
        );
    }
    println!("  Accounted size: {}", buffer.accounted_size());
    println!("  Allocation time: {}μs", elapsed.as_micros());
    println!("  {}", allocator.stats().summary());
    Ok(())
}

fn show_info() -> Result<()> {
    println!("Neuron channel/protocol binding engine");
    println!("Version: {}", neuron::VERSION);

    println!("\nChannel kinds:");
    for kind in [
        ChannelKind::MessageQueue,
        ChannelKind::Notification,
        ChannelKind::SharedMemory,
    ] {
        println!("  - {}", kind);
    }

    println!("\nCapabilities:");
    println!("  - Order-independent channel/protocol/application binding");
    println!("  - Lock-free wakeup dispatch with RCU driver slots");
    println!("  - Segmented message buffers");
    println!("  - TOML topology files");

    Ok(())
}
