#![allow(dead_code)]

use rdma_mem::CacheMode;
use rdma_qp::{PollPolicy, QueuePairConfig, QueuePairController, TransferSession};
use rdma_sim::{SimBoard, SimClock};

pub type SimController = QueuePairController<SimBoard, SimClock>;
pub type SimSession = TransferSession<SimBoard, SimClock>;

/// Reference layout with deadlines short enough for virtual time (1 µs per clock read).
pub fn config() -> QueuePairConfig {
    let mut cfg = QueuePairConfig::reference();
    cfg.poll = PollPolicy {
        drain_timeout_us: 500,
        completion_timeout_us: 500,
        poll_interval_us: 0,
        max_retries: 2,
        backoff_initial_us: 10,
        backoff_max_us: 40,
        link_timeout_ms: 1_000,
    };
    cfg
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn board(cfg: &QueuePairConfig) -> SimBoard {
    SimBoard::for_config(cfg, CacheMode::WriteBack).unwrap()
}

/// Configured and enabled.
pub fn controller(cfg: QueuePairConfig) -> SimController {
    init_tracing();
    let mut qp = QueuePairController::new(board(&cfg), SimClock::new(), cfg).unwrap();
    qp.configure_from_config().unwrap();
    qp.global_enable().unwrap();
    qp
}

pub fn session(cfg: QueuePairConfig) -> SimSession {
    init_tracing();
    let qp = QueuePairController::new(board(&cfg), SimClock::new(), cfg).unwrap();
    TransferSession::start(qp).unwrap()
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
