//! Worker pool
//!
//! One OS thread per queue, each owning a [`Worker`]. Plans are spawned on
//! the tokio runtime the pool was started with, which also runs the task
//! that sweeps the engine's shared tables.

use crate::error::{PlatformError, Result};
use crate::traits::PacketQueue;
use dpishift_core::{Engine, Worker, WorkerStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Sleep when a queue has nothing pending
const IDLE_BACKOFF: Duration = Duration::from_millis(1);
/// How long shutdown waits for the sweep task
const SWEEP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Running workers and the sweep task
pub struct WorkerPool {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<(u16, WorkerStats)>>,
    shutdown: watch::Sender<bool>,
    /// Disconnects once the sweep task and its engine handle are gone
    sweep_done: mpsc::Receiver<()>,
}

impl WorkerPool {
    /// Bind every queue of the engine's range and start serving them.
    ///
    /// # Errors
    /// Fails if any queue cannot be bound; nothing is left running.
    #[cfg(target_os = "linux")]
    pub fn start(engine: &Engine, runtime: &Handle) -> Result<Self> {
        let queues = engine
            .config()
            .queues()
            .map(crate::linux::NfQueue::open)
            .collect::<Result<Vec<_>>>()?;
        Self::with_queues(engine, runtime, queues)
    }

    /// Serve already-opened queues
    pub fn with_queues<Q>(engine: &Engine, runtime: &Handle, queues: Vec<Q>) -> Result<Self>
    where
        Q: PacketQueue + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::with_capacity(queues.len());

        for mut queue in queues {
            let number = queue.number();
            let mut worker = engine.worker(number);
            let flag = Arc::clone(&running);
            let runtime = runtime.clone();
            let spawned = thread::Builder::new()
                .name(format!("dpishift-q{number}"))
                .spawn(move || {
                    serve(&mut queue, &mut worker, &runtime, &flag);
                    (number, worker.stats().clone())
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    running.store(false, Ordering::Relaxed);
                    return Err(PlatformError::Thread(e.to_string()));
                }
            }
        }

        let (shutdown, signal) = watch::channel(false);
        let (done, sweep_done) = mpsc::channel();
        runtime.spawn(sweep_loop(engine.clone(), signal, done));
        info!(workers = threads.len(), "worker pool started");

        Ok(Self {
            running,
            threads,
            shutdown,
            sweep_done,
        })
    }

    /// Number of worker threads
    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    /// True until [`shutdown`](Self::shutdown) is called
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the sweep task and the workers, waiting for both.
    ///
    /// Queues and sockets close as their owners drop, so once this returns
    /// only the caller's own handles keep them open. Returns each worker's
    /// counters.
    ///
    /// Blocks the calling thread; call it outside the runtime's workers.
    pub fn shutdown(self) -> Vec<(u16, WorkerStats)> {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.shutdown.send(true);
        match self.sweep_done.recv_timeout(SWEEP_STOP_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => warn!("sweep task did not stop in time"),
            _ => debug!("sweep task joined"),
        }

        let mut stats = Vec::with_capacity(self.threads.len());
        for handle in self.threads {
            match handle.join() {
                Ok((queue, worker)) => {
                    info!(
                        queue,
                        packets = worker.packets,
                        rewritten = worker.rewritten,
                        dropped = worker.dropped,
                        incoming = worker.incoming,
                        dns = worker.dns_rewritten,
                        malformed = worker.malformed,
                        "worker stopped"
                    );
                    stats.push((queue, worker));
                }
                Err(_) => warn!("worker thread panicked"),
            }
        }
        stats
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.threads.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Receive, classify and settle packets until `running` clears
pub fn serve<Q: PacketQueue>(queue: &mut Q, worker: &mut Worker, runtime: &Handle, running: &AtomicBool) {
    debug!(queue = queue.number(), "worker started");
    while running.load(Ordering::Relaxed) {
        match queue.recv() {
            Ok(Some(packet)) => {
                let verdict = worker.handle(packet.as_ref(), runtime);
                if let Err(e) = queue.verdict(packet, verdict) {
                    warn!(error = %e, "verdict failed");
                }
            }
            Ok(None) => {
                worker.maybe_sweep(Instant::now());
                thread::sleep(IDLE_BACKOFF);
            }
            Err(e) => {
                warn!(error = %e, "receive failed");
                thread::sleep(IDLE_BACKOFF);
            }
        }
    }
}

async fn sweep_loop(engine: Engine, mut shutdown: watch::Receiver<bool>, done: mpsc::Sender<()>) {
    let mut ticker = tokio::time::interval(engine.config().sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.sweep(Instant::now());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    drop(engine);
    drop(done);
    debug!("sweep task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpishift_core::packet::{PacketBuilder, TcpFlags};
    use dpishift_core::sni::ClientHelloBuilder;
    use dpishift_core::{Config, PacketSender, RuleSet, Verdict};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::net::IpAddr;

    #[derive(Default)]
    struct Shared {
        inbox: Mutex<VecDeque<Vec<u8>>>,
        verdicts: Mutex<Vec<Verdict>>,
    }

    struct MemoryQueue {
        number: u16,
        shared: Arc<Shared>,
    }

    impl PacketQueue for MemoryQueue {
        type Packet = Vec<u8>;

        fn number(&self) -> u16 {
            self.number
        }

        fn recv(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.shared.inbox.lock().pop_front())
        }

        fn verdict(&mut self, _packet: Vec<u8>, verdict: Verdict) -> Result<()> {
            self.shared.verdicts.lock().push(verdict);
            Ok(())
        }
    }

    struct NullSender;

    impl PacketSender for NullSender {
        fn send(&self, _packet: &[u8], _dst: IpAddr) -> dpishift_core::Result<()> {
            Ok(())
        }
    }

    fn hello(host: &str) -> Vec<u8> {
        PacketBuilder::tcp(
            "192.168.1.10:51000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        )
        .seq(1)
        .ack(1)
        .flags(TcpFlags::ACK | TcpFlags::PSH)
        .payload(&ClientHelloBuilder::new(host).build())
        .build()
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_settles_every_packet() {
        let config = Config {
            sets: vec![RuleSet::for_domains("blocked", &["max.ru"])],
            ..Config::default()
        };
        let sender = Arc::new(NullSender);
        let engine = Engine::new(&config, sender.clone()).unwrap();
        let shared = Arc::new(Shared::default());
        shared.inbox.lock().extend([hello("max.ru"), vec![0xde, 0xad], hello("open.example")]);

        let queue = MemoryQueue {
            number: 7,
            shared: Arc::clone(&shared),
        };
        let pool = WorkerPool::with_queues(&engine, &Handle::current(), vec![queue]).unwrap();
        assert_eq!(pool.workers(), 1);
        assert!(pool.is_running());

        for _ in 0..400 {
            if shared.verdicts.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *shared.verdicts.lock(),
            vec![Verdict::Drop, Verdict::Accept, Verdict::Accept]
        );

        let stats = tokio::task::spawn_blocking(move || pool.shutdown()).await.unwrap();
        assert_eq!(stats.len(), 1);
        let (queue, worker) = &stats[0];
        assert_eq!(*queue, 7);
        assert_eq!(worker.packets, 3);
        assert_eq!(worker.rewritten, 1);
        assert_eq!(worker.malformed, 1);

        // Workers and the sweep task released their engine handles
        drop(engine);
        for _ in 0..100 {
            if Arc::strong_count(&sender) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(Arc::strong_count(&sender), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_waits_for_sweep_task() {
        let sender = Arc::new(NullSender);
        let engine = Engine::new(&Config::default(), sender.clone()).unwrap();
        let queues: Vec<MemoryQueue> = Vec::new();
        let pool = WorkerPool::with_queues(&engine, &Handle::current(), queues).unwrap();
        drop(engine);
        assert_eq!(Arc::strong_count(&sender), 2);

        let stats = tokio::task::spawn_blocking(move || pool.shutdown()).await.unwrap();
        assert!(stats.is_empty());
        assert_eq!(Arc::strong_count(&sender), 1);
    }
}
