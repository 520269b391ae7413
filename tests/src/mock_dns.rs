//! mock_dns - a resolver whose answers are held back until the test releases them

use anyhow::{Result, anyhow};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use pipelined::Resolver;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

pub struct GatedResolver {
    answers: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
    gate: Receiver<()>,
    opener: Sender<()>,
}

impl GatedResolver {
    pub fn new() -> Self {
        let (opener, gate) = async_channel::bounded(1);
        GatedResolver {
            answers: Mutex::new(HashMap::new()),
            gate,
            opener,
        }
    }

    pub fn add_answer(&self, host: &str, ips: Vec<Ipv4Addr>) {
        self.answers.lock().unwrap().insert(host.to_string(), ips);
    }

    /// Let every pending and future lookup complete.
    pub fn open(&self) {
        self.opener.close();
    }
}

impl Default for GatedResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for GatedResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        // Returns once the sender side is closed.
        let _ = self.gate.recv().await;
        self.answers
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .ok_or_else(|| anyhow!("NXDOMAIN {host}"))
    }
}
