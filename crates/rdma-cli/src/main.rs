#![forbid(unsafe_code)]

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use rdma_mem::CacheMode;
use rdma_qp::{
    program_mac_pair, BramEndpointTable, BringUp, Clock, CounterClock, Endpoint, MacAddress,
    QueuePairConfig, QueuePairController, StdClock, Throughput, TransferSession,
};
use rdma_sim::{EngineFault, EngineTiming, LinkBehaviour, SimBoard, SimBram, SimLink};
use tracing_subscriber::EnvFilter;

const BOARD_MAC: &str = "00:0a:35:01:02:03";
const PEER_MAC: &str = "00:0c:29:15:37:2c";
const FIRST_ID: u32 = 0x0001_0001;

#[derive(Parser, Debug)]
#[command(
    name = "rdma-loopback",
    about = "Drive the data mover's SQ/CQ rings against the board model."
)]
struct Args {
    /// Queue pair configuration (JSON). Defaults to $RDMA_QP_CONFIG, then the reference layout
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Override both ring capacities (power of two)
    #[arg(long, value_name = "ENTRIES", global = true)]
    capacity: Option<u32>,

    /// CPU data cache behaviour in front of DDR
    #[arg(long, value_enum, default_value_t = CacheArg::WriteBack, global = true)]
    cache_mode: CacheArg,

    /// Register reads the engine waits before draining and before completing each descriptor
    #[arg(long, value_name = "READS", default_value_t = 0, global = true)]
    latency_polls: u32,

    /// Misbehaviour injected into the engine model
    #[arg(long, value_enum, default_value_t = FaultArg::None, global = true)]
    fault: FaultArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage a pattern, WRITE it to the remote window and verify it, `count` times
    Loopback {
        #[arg(long, default_value_t = 8)]
        count: u32,
        /// Bytes per transfer
        #[arg(long, value_name = "BYTES", default_value_t = 4096)]
        len: u64,
    },
    /// Reuse the rings for back-to-back transfers without verification and report MB/s
    Bench {
        #[arg(long, default_value_t = 64)]
        count: u32,
        #[arg(long, value_name = "BYTES", default_value_t = 65536)]
        len: u64,
    },
    /// Bring the link up, program the endpoint table and MAC pair, and dump what was written
    Endpoints {
        /// Destination IPs to program (repeatable)
        #[arg(long = "ip", value_name = "IPV4", default_value = "192.168.1.2")]
        ips: Vec<Ipv4Addr>,
        #[arg(long, default_value = PEER_MAC)]
        dst_mac: MacAddress,
        #[arg(long, default_value = BOARD_MAC)]
        local_mac: MacAddress,
        /// Link polls before carrier comes up
        #[arg(long, default_value_t = 3)]
        link_polls: u32,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CacheArg {
    WriteBack,
    Disabled,
}

impl From<CacheArg> for CacheMode {
    fn from(value: CacheArg) -> Self {
        match value {
            CacheArg::WriteBack => CacheMode::WriteBack,
            CacheArg::Disabled => CacheMode::Disabled,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FaultArg {
    None,
    Hang,
    DropCompletions,
    Corrupt,
    WrongId,
}

impl From<FaultArg> for EngineFault {
    fn from(value: FaultArg) -> Self {
        match value {
            FaultArg::None => EngineFault::None,
            FaultArg::Hang => EngineFault::Hang,
            FaultArg::DropCompletions => EngineFault::DropCompletions,
            FaultArg::Corrupt => EngineFault::CorruptCopy,
            FaultArg::WrongId => EngineFault::WrongId,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    match args.command {
        Command::Loopback { count, len } => loopback(&args, config, count, len),
        Command::Bench { count, len } => bench(&args, config, count, len),
        Command::Endpoints {
            ref ips,
            dst_mac,
            local_mac,
            link_polls,
        } => endpoints(&args, config, ips, dst_mac, local_mac, link_polls),
        Command::Config => {
            println!("{}", config.to_json_pretty());
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<QueuePairConfig> {
    let mut config = match &args.config {
        Some(path) => QueuePairConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => QueuePairConfig::from_env().context("load config from environment")?,
    };
    if let Some(capacity) = args.capacity {
        config.sq.capacity = capacity;
        config.cq.capacity = capacity;
    }
    config.validate().context("invalid queue pair configuration")?;
    Ok(config)
}

fn build_controller<C: Clock>(
    args: &Args,
    config: QueuePairConfig,
    clock: C,
) -> anyhow::Result<QueuePairController<SimBoard, C>> {
    let mut board =
        SimBoard::for_config(&config, args.cache_mode.into()).context("build board model")?;
    board.engine_mut().set_timing(EngineTiming {
        polls_before_drain: args.latency_polls,
        polls_before_complete: args.latency_polls,
    });
    board.engine_mut().set_fault(args.fault.into());
    QueuePairController::new(board, clock, config).context("create queue pair controller")
}

fn check_len(config: &QueuePairConfig, len: u64) -> anyhow::Result<()> {
    let window = config.payload.len.min(config.remote.len);
    if len == 0 || len > window {
        bail!("--len must be between 1 and {window} bytes");
    }
    Ok(())
}

fn loopback(args: &Args, config: QueuePairConfig, count: u32, len: u64) -> anyhow::Result<()> {
    check_len(&config, len)?;
    let qp = build_controller(args, config, StdClock::new())?;
    let mut session = TransferSession::start(qp).context("start transfer session")?;

    let mut pattern = vec![0u8; len as usize];
    let mut moved = 0u64;
    for i in 0..count {
        for (j, b) in pattern.iter_mut().enumerate() {
            *b = (j as u32).wrapping_add(i) as u8;
        }
        session.stage_payload(0, &pattern)?;
        session.clear_destination(0, len)?;
        let id = FIRST_ID.wrapping_add(i);
        let report = session
            .write(id, 0, 0, len)
            .with_context(|| format!("transfer {id:#x}"))?;
        moved += report.bytes;
        println!(
            "id={:#010x} slot={} bytes={} retries={} elapsed={:?}",
            report.id, report.slot, report.bytes, report.retries, report.elapsed
        );
    }
    println!("loopback ok: {count} transfers, {moved} bytes verified");
    Ok(())
}

fn bench(args: &Args, config: QueuePairConfig, count: u32, len: u64) -> anyhow::Result<()> {
    check_len(&config, len)?;
    let origin = Instant::now();
    let clock = CounterClock::new(1_000_000_000, move || {
        origin.elapsed().as_nanos().min(u64::MAX as u128) as u64
    });
    let qp = build_controller(args, config, clock)?;
    let mut session = TransferSession::start(qp).context("start transfer session")?;
    session.set_verify(false);

    let pattern: Vec<u8> = (0..len).map(|i| i as u8).collect();
    session.stage_payload(0, &pattern)?;

    let start = session.controller_mut().clock_mut().ticks();
    let mut moved = 0u64;
    for i in 0..count {
        let report = session.write(FIRST_ID.wrapping_add(i), 0, 0, len)?;
        moved += report.bytes;
    }
    let clock = session.controller_mut().clock_mut();
    let ticks = clock.ticks().wrapping_sub(start);
    let throughput = Throughput::from_ticks(moved, ticks, clock.counts_per_second());

    let engine = session.controller().hardware().engine().stats();
    tracing::info!(
        descriptors = engine.descriptors,
        completions = engine.completions,
        backpressure_ticks = engine.backpressure_ticks,
        "bench finished"
    );
    println!(
        "{count} x {len} bytes in {} us: {throughput}",
        throughput.micros()
    );
    Ok(())
}

fn endpoints(
    args: &Args,
    config: QueuePairConfig,
    ips: &[Ipv4Addr],
    dst_mac: MacAddress,
    local_mac: MacAddress,
    link_polls: u32,
) -> anyhow::Result<()> {
    let qp = build_controller(args, config, StdClock::new())?;
    let mut link = SimLink::new(LinkBehaviour::UpAfterPolls(link_polls));
    let mut table = BramEndpointTable::new(SimBram::new());
    let plan = BringUp {
        local_mac,
        endpoints: ips.iter().map(|&ip| Endpoint { ip, mac: dst_mac }).collect(),
    };
    let _session = TransferSession::establish(qp, &mut link, &mut table, &plan)
        .context("bring-up")?;

    let mut mac_bram = SimBram::new();
    program_mac_pair(&mut mac_bram, local_mac, dst_mac).context("program MAC pair")?;

    for &ip in ips {
        let index = rdma_qp::endpoint_index(ip);
        let entry = table.read_entry(index);
        let words: Vec<String> = entry
            .to_words()
            .iter()
            .map(|w| format!("{w:08x}"))
            .collect();
        println!("{ip} -> slot {index:3}: [{}]", words.join(" "));
    }
    println!("MAC pair: src={local_mac} dst={dst_mac}");
    Ok(())
}
