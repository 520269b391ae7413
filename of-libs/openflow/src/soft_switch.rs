use crate::{
    Action, FieldKind, FieldValue, FlowMatch, FlowMod, FlowModCommand, FlowStats,
    FlowStatsRequest, LearnAction, LearnSpec, LearnSrc, MeterCommand, MeterConfig, MeterMod,
    MultipartBody, OfpMessage, Packet, Switch, SwitchEvent, TableId, Xid,
};
use anyhow::{Result, bail};
use async_channel::{Receiver, Sender};
use async_std::sync::Mutex;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

const MAX_HOPS: usize = 64;
const NUM_REGS: u8 = 16;

/// What happened to an injected packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Output(u32),
    /// Dropped by an explicit drop flow or a table miss in `table`.
    Dropped { table: TableId },
}

#[derive(Clone, Debug)]
struct FlowEntry {
    priority: u16,
    cookie: u64,
    flow_match: FlowMatch,
    actions: Vec<Action>,
    idle_timeout: u16,
    hard_timeout: u16,
    packet_count: u64,
    byte_count: u64,
}

struct State {
    connected: bool,
    datapath_id: u64,
    tables: BTreeMap<TableId, Vec<FlowEntry>>,
    meters: BTreeMap<u32, MeterConfig>,
    failing_tables: HashSet<TableId>,
    failing_delete_cookies: HashSet<u64>,
    answer_barriers: bool,
    max_flows_per_reply: usize,
}

/// An in-process OpenFlow switch.  It keeps flow tables with counters, answers barriers
/// and stats requests, and can walk a packet through the pipeline.  Used by the tests and
/// by the standalone binary.
#[derive(Clone)]
pub struct SoftSwitch {
    state: Arc<Mutex<State>>,
    events: Sender<SwitchEvent>,
}

impl SoftSwitch {
    pub fn new(datapath_id: u64) -> (Self, Receiver<SwitchEvent>) {
        let (events, receiver) = async_channel::unbounded();
        let state = State {
            connected: false,
            datapath_id,
            tables: BTreeMap::new(),
            meters: BTreeMap::new(),
            failing_tables: HashSet::new(),
            failing_delete_cookies: HashSet::new(),
            answer_barriers: true,
            max_flows_per_reply: 64,
        };
        (
            SoftSwitch {
                state: Arc::new(Mutex::new(state)),
                events,
            },
            receiver,
        )
    }

    pub async fn connect(&self) -> Result<()> {
        let datapath_id = {
            let mut state = self.state.lock().await;
            state.connected = true;
            state.datapath_id
        };
        self.events
            .send(SwitchEvent::Connected { datapath_id })
            .await?;
        Ok(())
    }

    /// Flows survive a disconnect, as with a real switch in fail-secure mode.
    pub async fn disconnect(&self) -> Result<()> {
        self.state.lock().await.connected = false;
        self.events.send(SwitchEvent::Disconnected).await?;
        Ok(())
    }

    /// Reject every flow mod that targets `table` with an error reply.
    pub async fn fail_flow_mods_in_table(&self, table: TableId, fail: bool) {
        let mut state = self.state.lock().await;
        if fail {
            state.failing_tables.insert(table);
        } else {
            state.failing_tables.remove(&table);
        }
    }

    /// Reject deletes aimed at flows with exactly this cookie.
    pub async fn fail_deletes_with_cookie(&self, cookie: u64, fail: bool) {
        let mut state = self.state.lock().await;
        if fail {
            state.failing_delete_cookies.insert(cookie);
        } else {
            state.failing_delete_cookies.remove(&cookie);
        }
    }

    /// Zero every flow counter, as a datapath restart that keeps its flows would.
    pub async fn reset_counters(&self) {
        let mut state = self.state.lock().await;
        for entry in state.tables.values_mut().flat_map(|entries| entries.iter_mut()) {
            entry.packet_count = 0;
            entry.byte_count = 0;
        }
    }

    /// When disabled, barriers are silently swallowed.
    pub async fn set_answer_barriers(&self, answer: bool) {
        self.state.lock().await.answer_barriers = answer;
    }

    pub async fn set_max_flows_per_reply(&self, max: usize) {
        self.state.lock().await.max_flows_per_reply = max.max(1);
    }

    pub async fn flows(&self, table: TableId) -> Vec<FlowStats> {
        let state = self.state.lock().await;
        state
            .tables
            .get(&table)
            .map(|entries| entries.iter().map(|e| e.to_stats(table)).collect())
            .unwrap_or_default()
    }

    pub async fn flow_count(&self) -> usize {
        self.state
            .lock()
            .await
            .tables
            .values()
            .map(|entries| entries.len())
            .sum()
    }

    pub async fn meters(&self) -> Vec<MeterConfig> {
        self.state.lock().await.meters.values().cloned().collect()
    }

    /// Walk `count` identical packets through the pipeline starting at table 0, updating
    /// the counters of every flow they hit.
    pub async fn inject(&self, packet: Packet, count: u64) -> Verdict {
        let mut state = self.state.lock().await;
        let mut packet = packet;
        packet.fields.entry(FieldKind::Metadata).or_insert(FieldValue::Int(0));
        packet.fields.entry(FieldKind::PktMark).or_insert(FieldValue::Int(0));
        for reg in 0..NUM_REGS {
            packet
                .fields
                .entry(FieldKind::Reg(reg))
                .or_insert(FieldValue::Int(0));
        }

        let mut table = 0;
        for _ in 0..MAX_HOPS {
            let Some(entry) = state.lookup(table, &packet) else {
                return Verdict::Dropped { table };
            };
            entry.packet_count += count;
            entry.byte_count += packet.len * count;
            let actions = entry.actions.clone();

            let mut next = None;
            for action in actions.iter() {
                match action {
                    Action::Output(port) => return Verdict::Output(*port),
                    Action::GotoTable(t) => next = Some(*t),
                    Action::SetField(kind, value) => {
                        packet.fields.insert(*kind, *value);
                    }
                    Action::Meter(_) => (),
                    Action::Learn(spec) => {
                        let (t, learned) = learn(spec, &packet);
                        state.add(t, learned);
                    }
                }
            }
            match next {
                Some(t) => table = t,
                None => return Verdict::Dropped { table },
            }
        }
        Verdict::Dropped { table }
    }

    async fn emit(&self, event: SwitchEvent) -> Result<()> {
        self.events.send(event).await?;
        Ok(())
    }
}

#[async_trait]
impl Switch for SoftSwitch {
    async fn send(&self, xid: Xid, message: OfpMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            bail!("Switch not connected");
        }
        match message {
            OfpMessage::FlowMod(flow_mod) => {
                if let Err(reason) = state.apply_flow_mod(flow_mod) {
                    drop(state);
                    self.emit(SwitchEvent::Error { xid, reason }).await?;
                }
            }
            OfpMessage::MeterMod(meter_mod) => state.apply_meter_mod(meter_mod),
            OfpMessage::Barrier => {
                if state.answer_barriers {
                    drop(state);
                    self.emit(SwitchEvent::BarrierReply { xid }).await?;
                }
            }
            OfpMessage::FlowStatsRequest(request) => {
                let stats = state.flow_stats(&request);
                let chunk_size = state.max_flows_per_reply;
                drop(state);
                let chunks: Vec<Vec<FlowStats>> = if stats.is_empty() {
                    vec![vec![]]
                } else {
                    stats.chunks(chunk_size).map(|c| c.to_vec()).collect()
                };
                let last = chunks.len() - 1;
                for (i, chunk) in chunks.into_iter().enumerate() {
                    self.emit(SwitchEvent::MultipartReply {
                        xid,
                        body: MultipartBody::Flow(chunk),
                        more: i != last,
                    })
                    .await?;
                }
            }
            OfpMessage::MeterConfigRequest => {
                let meters = state.meters.values().cloned().collect();
                drop(state);
                self.emit(SwitchEvent::MultipartReply {
                    xid,
                    body: MultipartBody::MeterConfig(meters),
                    more: false,
                })
                .await?;
            }
        }
        Ok(())
    }
}

impl State {
    fn lookup(&mut self, table: TableId, packet: &Packet) -> Option<&mut FlowEntry> {
        // Entries are kept sorted by descending priority, so the first hit wins.
        self.tables
            .get_mut(&table)?
            .iter_mut()
            .find(|e| e.flow_match.matches_packet(packet))
    }

    fn add(&mut self, table: TableId, entry: FlowEntry) {
        let entries = self.tables.entry(table).or_default();
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.priority == entry.priority && e.flow_match == entry.flow_match)
        {
            // Same priority and match replaces the entry.  Counters carry over.
            existing.cookie = entry.cookie;
            existing.actions = entry.actions;
            existing.idle_timeout = entry.idle_timeout;
            existing.hard_timeout = entry.hard_timeout;
            return;
        }
        let pos = entries
            .iter()
            .position(|e| e.priority < entry.priority)
            .unwrap_or(entries.len());
        entries.insert(pos, entry);
    }

    fn apply_flow_mod(&mut self, flow_mod: FlowMod) -> Result<(), String> {
        if let Some(table) = flow_mod.table {
            if self.failing_tables.contains(&table) {
                return Err(format!("table {table} rejected flow mod"));
            }
        }
        match flow_mod.command {
            FlowModCommand::Add => {
                let Some(table) = flow_mod.table else {
                    return Err("flow add without table".to_string());
                };
                self.add(
                    table,
                    FlowEntry {
                        priority: flow_mod.priority,
                        cookie: flow_mod.cookie,
                        flow_match: flow_mod.flow_match,
                        actions: flow_mod.actions,
                        idle_timeout: flow_mod.idle_timeout,
                        hard_timeout: flow_mod.hard_timeout,
                        packet_count: 0,
                        byte_count: 0,
                    },
                );
            }
            FlowModCommand::Delete | FlowModCommand::DeleteStrict => {
                if flow_mod.cookie_mask == u64::MAX
                    && self.failing_delete_cookies.contains(&flow_mod.cookie)
                {
                    return Err(format!("delete of cookie {:#x} rejected", flow_mod.cookie));
                }
                let strict = flow_mod.command == FlowModCommand::DeleteStrict;
                for (table, entries) in self.tables.iter_mut() {
                    if flow_mod.table.is_some_and(|t| t != *table) {
                        continue;
                    }
                    entries.retain(|e| {
                        let cookie_hit = (e.cookie & flow_mod.cookie_mask)
                            == (flow_mod.cookie & flow_mod.cookie_mask);
                        let match_hit = if strict {
                            e.priority == flow_mod.priority && e.flow_match == flow_mod.flow_match
                        } else {
                            flow_mod.flow_match.is_subset_of(&e.flow_match)
                        };
                        !(cookie_hit && match_hit)
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_meter_mod(&mut self, meter_mod: MeterMod) {
        match meter_mod.command {
            MeterCommand::Add => {
                self.meters.insert(
                    meter_mod.meter_id,
                    MeterConfig {
                        meter_id: meter_mod.meter_id,
                        rate_kbps: meter_mod.rate_kbps,
                        burst_size: meter_mod.burst_size,
                    },
                );
            }
            MeterCommand::Delete => {
                self.meters.remove(&meter_mod.meter_id);
            }
        }
    }

    fn flow_stats(&self, request: &FlowStatsRequest) -> Vec<FlowStats> {
        let mut stats = vec![];
        for (table, entries) in self.tables.iter() {
            if request.table.is_some_and(|t| t != *table) {
                continue;
            }
            for e in entries.iter() {
                if (e.cookie & request.cookie_mask) != (request.cookie & request.cookie_mask) {
                    continue;
                }
                if !request.flow_match.is_subset_of(&e.flow_match) {
                    continue;
                }
                stats.push(e.to_stats(*table));
            }
        }
        stats
    }
}

impl FlowEntry {
    fn to_stats(&self, table: TableId) -> FlowStats {
        FlowStats {
            table,
            priority: self.priority,
            cookie: self.cookie,
            flow_match: self.flow_match.clone(),
            actions: self.actions.clone(),
            packet_count: self.packet_count,
            byte_count: self.byte_count,
        }
    }
}

fn resolve(src: &LearnSrc, packet: &Packet) -> Option<FieldValue> {
    match src {
        LearnSrc::Field(kind) => packet.get(*kind).copied(),
        LearnSrc::Value(value) => Some(*value),
    }
}

fn learn(spec: &LearnSpec, packet: &Packet) -> (TableId, FlowEntry) {
    let mut flow_match = FlowMatch::new();
    for (kind, src) in spec.matches.iter() {
        if let Some(value) = resolve(src, packet) {
            flow_match.set(*kind, value);
        }
    }
    let actions = spec
        .actions
        .iter()
        .filter_map(|a| match a {
            LearnAction::SetField(kind, src) => {
                resolve(src, packet).map(|v| Action::SetField(*kind, v))
            }
            LearnAction::GotoTable(t) => Some(Action::GotoTable(*t)),
            LearnAction::Output(p) => Some(Action::Output(*p)),
        })
        .collect();
    (
        spec.table,
        FlowEntry {
            priority: spec.priority,
            cookie: spec.cookie,
            flow_match,
            actions,
            idle_timeout: spec.idle_timeout,
            hard_timeout: spec.hard_timeout,
            packet_count: 0,
            byte_count: 0,
        },
    )
}
