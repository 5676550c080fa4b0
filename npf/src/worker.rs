// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Background connection collector.
//!
//! One thread serves every registered instance: it runs an incremental GC pass on each of them
//! every `gc.interval_ms` (the shortest of the instances) or when kicked, and a full pass when it
//! is stopped.

use crate::conn::GcMode;
use crate::instance::Npf;
use crate::params::{Param, Params};
use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn the worker thread: {0}")]
    Spawn(std::io::Error),
    #[error("the worker thread is gone")]
    Gone,
    #[error("the worker thread panicked")]
    Join,
}

enum WorkerMsg {
    Register(Weak<Npf>),
    Kick,
    Stop,
}

#[derive(Debug)]
pub struct Worker {
    ctl: Sender<WorkerMsg>,
    handle: Option<JoinHandle<()>>,
}

fn collect(instances: &[Weak<Npf>], mode: GcMode) {
    for npf in instances.iter().filter_map(Weak::upgrade) {
        npf.gc(mode);
    }
}

fn interval(instances: &[Weak<Npf>]) -> Duration {
    let ms = instances
        .iter()
        .filter_map(Weak::upgrade)
        .map(|npf| npf.config().params.get(Param::GcIntervalMs))
        .min()
        .unwrap_or_else(|| Params::default().get(Param::GcIntervalMs));
    Duration::from_millis(u64::from(ms))
}

impl Worker {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn start() -> Result<Worker, WorkerError> {
        let (ctl, rx) = unbounded();
        let worker_loop = move || {
            let mut instances: Vec<Weak<Npf>> = Vec::new();
            info!("gc worker started");
            loop {
                match rx.recv_timeout(interval(&instances)) {
                    Ok(WorkerMsg::Register(npf)) => instances.push(npf),
                    Ok(WorkerMsg::Kick) | Err(RecvTimeoutError::Timeout) => {
                        collect(&instances, GcMode::Incremental);
                    }
                    Ok(WorkerMsg::Stop) | Err(RecvTimeoutError::Disconnected) => {
                        collect(&instances, GcMode::Full);
                        break;
                    }
                }
                instances.retain(|npf| npf.strong_count() > 0);
            }
            info!("gc worker stopped");
        };
        let handle = thread::Builder::new()
            .name("npf-worker".to_string())
            .spawn(worker_loop)
            .map_err(WorkerError::Spawn)?;
        Ok(Worker {
            ctl,
            handle: Some(handle),
        })
    }

    /// Have the worker collect the connections of `npf`, for as long as it lives.
    ///
    /// # Errors
    ///
    /// Fails if the worker has stopped.
    pub fn register(&self, npf: &Arc<Npf>) -> Result<(), WorkerError> {
        self.ctl
            .send(WorkerMsg::Register(Arc::downgrade(npf)))
            .map_err(|_| WorkerError::Gone)
    }

    /// Run a GC pass now.
    ///
    /// # Errors
    ///
    /// Fails if the worker has stopped.
    pub fn kick(&self) -> Result<(), WorkerError> {
        self.ctl.send(WorkerMsg::Kick).map_err(|_| WorkerError::Gone)
    }

    /// Run a last, full GC pass and wait for the thread to end.
    ///
    /// # Errors
    ///
    /// Fails if the worker is already stopped, or its thread panicked.
    pub fn stop(&mut self) -> Result<(), WorkerError> {
        let handle = self.handle.take().ok_or(WorkerError::Gone)?;
        debug!("stopping the gc worker");
        self.ctl.send(WorkerMsg::Stop).map_err(|_| WorkerError::Gone)?;
        handle.join().map_err(|_| WorkerError::Join)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net::cache::Direction;
    use net::test_utils::udp;
    use std::time::Instant;

    fn npf_with_conns(count: u16) -> Arc<Npf> {
        let npf = Arc::new(Npf::new());
        npf.load_yaml("rules: [{name: all, attr: [pass, stateful]}]")
            .unwrap();
        let eth0 = npf.ifmap().register("eth0");
        for port in 0..count {
            let mut pkt = udp(
                std::net::SocketAddr::new("10.0.0.1".parse().unwrap(), 1000 + port),
                "192.0.2.1:53".parse().unwrap(),
                b"",
            )
            .with_ifid(eth0);
            npf.handle(&mut pkt, Direction::Out).unwrap();
        }
        npf
    }

    #[test]
    fn kicked_worker_collects_expired_connections() {
        let npf = npf_with_conns(8);
        assert_eq!(npf.conndb().len(), 8);
        for conn in npf.conndb().conns() {
            conn.expire();
        }
        let mut worker = Worker::start().unwrap();
        worker.register(&npf).unwrap();
        worker.kick().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !npf.conndb().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(npf.conndb().is_empty());
        worker.stop().unwrap();
        assert!(matches!(worker.stop(), Err(WorkerError::Gone)));
        assert!(matches!(worker.kick(), Err(WorkerError::Gone)));
    }

    #[test]
    fn stopping_runs_a_full_pass() {
        let npf = npf_with_conns(4);
        let mut worker = Worker::start().unwrap();
        worker.register(&npf).unwrap();
        npf.conndb().clock().advance(3600);
        worker.stop().unwrap();
        assert!(npf.conndb().is_empty());
    }

    #[test]
    fn dropped_instances_are_forgotten() {
        let worker = Worker::start().unwrap();
        let npf = npf_with_conns(1);
        worker.register(&npf).unwrap();
        drop(npf);
        worker.kick().unwrap();
        drop(worker);
    }
}
