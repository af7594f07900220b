// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Periodic `nsqlookupd` polling to discover the set of `nsqd` producers
//! hosting a topic, grounded on this crate's cloud service-discovery
//! backends (e.g. the Consul catalog poller) -- same shape, HTTP GET a
//! directory endpoint and deserialize a producer list, but over `nsqlookupd`'s
//! `/lookup` endpoint instead of a service catalog.

mod seen;

pub use seen::SeenProducers;

use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;
use crate::warn;

/// One polling round's result from a single `nsqlookupd` address.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub lookupd_addr: String,
    pub producers: Vec<SocketAddr>,
}

/// A pollable source of producer addresses for a topic. Abstracted so tests
/// can substitute a fixed or scripted source without a network dependency.
pub trait LookupdSource: Send {
    fn lookup(&self, lookupd_addr: &str, topic: &str) -> Result<Vec<SocketAddr>>;
}

#[cfg(feature = "lookupd")]
mod http {
    use std::net::SocketAddr;
    use std::time::Duration;

    use serde::Deserialize;

    use crate::error::{ConnectionError, Result};

    use super::LookupdSource;

    #[derive(Debug, Deserialize)]
    struct Producer {
        broadcast_address: String,
        tcp_port: u16,
    }

    #[derive(Debug, Deserialize)]
    struct ProducersBody {
        #[serde(default)]
        producers: Vec<Producer>,
    }

    /// `nsqlookupd`'s `/lookup` response, tolerant of both the legacy
    /// `{"data": {"producers": [...]}}` wrapper and the flat
    /// `{"producers": [...]}` form used since nsqd 1.0.0-compat.
    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum LookupResponse {
        Wrapped { data: ProducersBody },
        Flat(ProducersBody),
    }

    impl LookupResponse {
        fn into_producers(self) -> Vec<Producer> {
            match self {
                LookupResponse::Wrapped { data } => data.producers,
                LookupResponse::Flat(body) => body.producers,
            }
        }
    }

    /// A real `nsqlookupd` HTTP client, via `reqwest`'s blocking API -- this
    /// runs on its own background thread (see [`super::LookupdPoller`]), never
    /// on the Reader's event loop, so blocking I/O here is fine.
    pub struct HttpLookupdSource {
        client: reqwest::blocking::Client,
    }

    impl HttpLookupdSource {
        pub fn new() -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            Ok(Self { client })
        }
    }

    impl LookupdSource for HttpLookupdSource {
        fn lookup(&self, lookupd_addr: &str, topic: &str) -> Result<Vec<SocketAddr>> {
            let url = format!("{}/lookup?topic={}", lookupd_addr.trim_end_matches('/'), topic);
            let body: LookupResponse = self
                .client
                .get(&url)
                .send()
                .map_err(|e| ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
                .json()
                .map_err(|e| ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

            Ok(body
                .into_producers()
                .into_iter()
                .filter_map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port).parse().ok())
                .collect())
        }
    }
}

#[cfg(feature = "lookupd")]
pub use http::HttpLookupdSource;

/// Drives one or more `nsqlookupd` addresses on a background thread,
/// fanning requests out across `poll_interval` (rather than firing them all
/// at once) and sending a [`DiscoveryEvent`] per address per round back to
/// the Reader's event loop.
pub struct LookupdPoller {
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LookupdPoller {
    pub fn spawn(
        source: Box<dyn LookupdSource>,
        addresses: Vec<String>,
        topic: String,
        poll_interval: Duration,
        poll_jitter: f32,
        tx: crossbeam_channel::Sender<DiscoveryEvent>,
    ) -> Self {
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_loop = stop.clone();

        let handle = std::thread::spawn(move || {
            if addresses.is_empty() {
                return;
            }
            let step = poll_interval / addresses.len() as u32;
            // A fixed per-address phase offset, computed once: re-rolling it
            // every tick would let addresses drift past each other instead of
            // holding a stable, evenly-spread polling phase.
            let jitters: Vec<f32> = addresses
                .iter()
                .map(|_| (1.0 + (fastrand::f32() - 0.5) * 2.0 * poll_jitter).max(0.0))
                .collect();
            loop {
                for (idx, addr) in addresses.iter().enumerate() {
                    if stop_loop.load(std::sync::atomic::Ordering::Relaxed) {
                        return;
                    }
                    match source.lookup(addr, &topic) {
                        Ok(producers) => {
                            if tx
                                .send(DiscoveryEvent {
                                    lookupd_addr: addr.clone(),
                                    producers,
                                })
                                .is_err()
                            {
                                return; // Reader side gone
                            }
                        }
                        Err(e) => warn!("lookupd {addr}: {e}"),
                    }
                    let sleep_for = step.mul_f32(jitters[idx]);
                    std::thread::sleep(sleep_for);
                }
            }
        });

        LookupdPoller { stop, handle: Some(handle) }
    }

    /// Stop the background thread. Idempotent; joins on first call.
    pub fn stop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LookupdPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct ScriptedSource {
        calls: Arc<Mutex<Vec<String>>>,
        producers: Vec<SocketAddr>,
    }

    impl LookupdSource for ScriptedSource {
        fn lookup(&self, lookupd_addr: &str, _topic: &str) -> Result<Vec<SocketAddr>> {
            self.calls.lock().unwrap().push(lookupd_addr.to_string());
            Ok(self.producers.clone())
        }
    }

    #[test]
    fn poller_reports_producers_for_each_address() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let producers = vec!["127.0.0.1:4150".parse().unwrap()];
        let source = Box::new(ScriptedSource {
            calls: calls.clone(),
            producers: producers.clone(),
        });
        let mut poller = LookupdPoller::spawn(
            source,
            vec!["http://lookupd-a:4161".into(), "http://lookupd-b:4161".into()],
            "topic".into(),
            Duration::from_millis(20),
            0.0,
            tx,
        );

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.producers, producers);
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_ne!(first.lookupd_addr, second.lookupd_addr);

        poller.stop();
    }
}
