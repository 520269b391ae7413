//! actor - the task that owns the switch connection

use anyhow::{Result, anyhow};
use async_channel::{Receiver, Sender};
use atomic_counter::{AtomicCounter, RelaxedCounter};
use futures::StreamExt;
use openflow::{MultipartBody, OfpMessage, Switch, SwitchEvent, Xid};
use slog::{Logger, debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use stop_token::StopToken;
use stop_token::prelude::*;

pub type MultipartPart = Result<(MultipartBody, bool)>;

enum Request {
    /// Messages followed by a barrier.  A bare barrier is an empty batch.
    Batch {
        messages: Vec<OfpMessage>,
        reply: Sender<Result<()>>,
    },
    Multipart {
        message: OfpMessage,
        parts: Sender<MultipartPart>,
    },
}

enum Input {
    Request(Request),
    Event(SwitchEvent),
}

enum Pending {
    Batch {
        xids: Vec<Xid>,
        error: Option<String>,
        reply: Sender<Result<()>>,
    },
    Multipart {
        parts: Sender<MultipartPart>,
    },
}

impl Pending {
    // The requester gave up, for example after its timeout.
    fn is_abandoned(&self) -> bool {
        match self {
            Pending::Batch { reply, .. } => reply.is_closed(),
            Pending::Multipart { parts } => parts.is_closed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(u64),
    Disconnected,
}

/// Handle on the datapath task.  Requests are queued to the task, which assigns transaction
/// ids and matches the switch's replies back to them.
#[derive(Clone)]
pub struct Datapath {
    requests: Sender<Request>,
    connected: Arc<AtomicBool>,
}

struct DatapathTask<S: Switch> {
    switch: S,
    xid_counter: RelaxedCounter,
    pending: HashMap<Xid, Pending>,
    // Transaction id of each batched message -> barrier that closes its batch.
    batch_of: HashMap<Xid, Xid>,
    connected: Arc<AtomicBool>,
    connection_events: Sender<ConnectionEvent>,
    logger: Logger,
}

impl Datapath {
    pub fn spawn<S: Switch>(
        switch: S,
        events: Receiver<SwitchEvent>,
        stop_token: StopToken,
        logger: Logger,
    ) -> (Self, Receiver<ConnectionEvent>) {
        let (requests, request_receiver) = async_channel::unbounded();
        let (connection_events, connection_receiver) = async_channel::unbounded();
        let connected = Arc::new(AtomicBool::new(false));
        let task = DatapathTask {
            switch,
            xid_counter: RelaxedCounter::new(1),
            pending: HashMap::new(),
            batch_of: HashMap::new(),
            connected: connected.clone(),
            connection_events,
            logger,
        };
        async_std::task::spawn(task.run(request_receiver, events, stop_token));
        (
            Datapath {
                requests,
                connected,
            },
            connection_receiver,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a batch.  The receiver yields once the closing barrier is answered.
    pub async fn batch(&self, messages: Vec<OfpMessage>) -> Result<Receiver<Result<()>>> {
        let (reply, receiver) = async_channel::bounded(1);
        self.requests
            .send(Request::Batch { messages, reply })
            .await
            .map_err(|_| anyhow!("Datapath task has stopped"))?;
        Ok(receiver)
    }

    pub async fn barrier(&self) -> Result<Receiver<Result<()>>> {
        self.batch(vec![]).await
    }

    /// Issue a multipart request.  Each reply part arrives on the receiver together with
    /// its "more" flag.
    pub async fn multipart(&self, message: OfpMessage) -> Result<Receiver<MultipartPart>> {
        let (parts, receiver) = async_channel::unbounded();
        self.requests
            .send(Request::Multipart { message, parts })
            .await
            .map_err(|_| anyhow!("Datapath task has stopped"))?;
        Ok(receiver)
    }
}

impl<S: Switch> DatapathTask<S> {
    async fn run(
        mut self,
        requests: Receiver<Request>,
        events: Receiver<SwitchEvent>,
        stop_token: StopToken,
    ) {
        let inputs = futures::stream::select(requests.map(Input::Request), events.map(Input::Event))
            .timeout_at(stop_token);
        let mut inputs = Box::pin(inputs);
        while let Some(Ok(input)) = inputs.next().await {
            self.drop_abandoned();
            match input {
                Input::Request(r) => self.handle_request(r).await,
                Input::Event(e) => self.handle_event(e).await,
            }
        }
        self.fail_all_pending("Datapath task stopped");
        debug!(self.logger, "Datapath task exiting");
    }

    fn next_xid(&self) -> Xid {
        self.xid_counter.inc() as Xid
    }

    async fn handle_request(&mut self, request: Request) {
        if !self.connected.load(Ordering::SeqCst) {
            match request {
                Request::Batch { reply, .. } => {
                    let _ = reply.try_send(Err(anyhow!("Datapath not connected")));
                }
                Request::Multipart { parts, .. } => {
                    let _ = parts.try_send(Err(anyhow!("Datapath not connected")));
                }
            }
            return;
        }

        match request {
            Request::Batch { messages, reply } => {
                let mut xids = Vec::with_capacity(messages.len());
                for message in messages {
                    let xid = self.next_xid();
                    if let Err(e) = self.switch.send(xid, message).await {
                        let _ = reply.try_send(Err(e));
                        return;
                    }
                    xids.push(xid);
                }
                let barrier_xid = self.next_xid();
                if let Err(e) = self.switch.send(barrier_xid, OfpMessage::Barrier).await {
                    let _ = reply.try_send(Err(e));
                    return;
                }
                for xid in xids.iter() {
                    self.batch_of.insert(*xid, barrier_xid);
                }
                self.pending.insert(
                    barrier_xid,
                    Pending::Batch {
                        xids,
                        error: None,
                        reply,
                    },
                );
            }
            Request::Multipart { message, parts } => {
                let xid = self.next_xid();
                if let Err(e) = self.switch.send(xid, message).await {
                    let _ = parts.try_send(Err(e));
                    return;
                }
                self.pending.insert(xid, Pending::Multipart { parts });
            }
        }
    }

    async fn handle_event(&mut self, event: SwitchEvent) {
        match event {
            SwitchEvent::Connected { datapath_id } => {
                info!(self.logger, "Datapath {datapath_id:#x} connected");
                self.connected.store(true, Ordering::SeqCst);
                let _ = self
                    .connection_events
                    .send(ConnectionEvent::Connected(datapath_id))
                    .await;
            }
            SwitchEvent::Disconnected => {
                warn!(self.logger, "Datapath disconnected");
                self.connected.store(false, Ordering::SeqCst);
                self.fail_all_pending("Datapath disconnected");
                let _ = self
                    .connection_events
                    .send(ConnectionEvent::Disconnected)
                    .await;
            }
            SwitchEvent::BarrierReply { xid } => match self.pending.remove(&xid) {
                Some(Pending::Batch { xids, error, reply }) => {
                    for x in xids.iter() {
                        self.batch_of.remove(x);
                    }
                    let result = match error {
                        None => Ok(()),
                        Some(reason) => Err(anyhow!(reason)),
                    };
                    let _ = reply.try_send(result);
                }
                Some(other) => {
                    warn!(self.logger, "Barrier reply for non-barrier xid {xid}");
                    self.pending.insert(xid, other);
                }
                None => debug!(self.logger, "Unsolicited barrier reply xid {xid}"),
            },
            SwitchEvent::Error { xid, reason } => {
                warn!(self.logger, "Switch error for xid {xid}: {reason}");
                if let Some(barrier_xid) = self.batch_of.get(&xid) {
                    if let Some(Pending::Batch { error, .. }) = self.pending.get_mut(barrier_xid) {
                        error.get_or_insert(reason);
                    }
                } else if let Some(Pending::Multipart { parts }) = self.pending.remove(&xid) {
                    let _ = parts.try_send(Err(anyhow!(reason)));
                }
            }
            SwitchEvent::MultipartReply { xid, body, more } => {
                let Some(Pending::Multipart { parts }) = self.pending.get(&xid) else {
                    debug!(self.logger, "Unsolicited multipart reply xid {xid}");
                    return;
                };
                let _ = parts.try_send(Ok((body, more)));
                if !more {
                    self.pending.remove(&xid);
                }
            }
        }
    }

    /// Forget requests that nobody is waiting for, so that replies the switch never sends
    /// do not pin them until the next disconnect.
    fn drop_abandoned(&mut self) {
        let abandoned: Vec<Xid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.is_abandoned())
            .map(|(xid, _)| *xid)
            .collect();
        for xid in abandoned.into_iter() {
            debug!(self.logger, "Dropping abandoned request xid {xid}");
            if let Some(Pending::Batch { xids, .. }) = self.pending.remove(&xid) {
                for x in xids.iter() {
                    self.batch_of.remove(x);
                }
            }
        }
    }

    fn fail_all_pending(&mut self, reason: &str) {
        self.batch_of.clear();
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Batch { reply, .. } => {
                    let _ = reply.try_send(Err(anyhow!(reason.to_string())));
                }
                Pending::Multipart { parts } => {
                    let _ = parts.try_send(Err(anyhow!(reason.to_string())));
                }
            }
        }
    }
}
