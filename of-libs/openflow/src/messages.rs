use crate::{Action, FlowMatch, TableId, Xid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowModCommand {
    Add,
    /// Non-strict delete: removes every flow whose match is at least as specific.
    Delete,
    DeleteStrict,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowModCommand,
    /// `None` addresses all tables (deletes only).
    pub table: Option<TableId>,
    pub priority: u16,
    pub cookie: u64,
    pub cookie_mask: u64,
    pub flow_match: FlowMatch,
    pub actions: Vec<Action>,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
}

impl FlowMod {
    pub fn add(
        table: TableId,
        priority: u16,
        cookie: u64,
        flow_match: FlowMatch,
        actions: Vec<Action>,
    ) -> Self {
        FlowMod {
            command: FlowModCommand::Add,
            table: Some(table),
            priority,
            cookie,
            cookie_mask: 0,
            flow_match,
            actions,
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    /// Delete flows in `table` matching at least `flow_match`, optionally restricted to an
    /// exact cookie.
    pub fn delete(table: TableId, flow_match: FlowMatch, cookie: Option<u64>) -> Self {
        FlowMod {
            command: FlowModCommand::Delete,
            table: Some(table),
            priority: 0,
            cookie: cookie.unwrap_or(0),
            cookie_mask: if cookie.is_some() { u64::MAX } else { 0 },
            flow_match,
            actions: vec![],
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    pub fn delete_strict(
        table: TableId,
        priority: u16,
        cookie: u64,
        flow_match: FlowMatch,
    ) -> Self {
        FlowMod {
            command: FlowModCommand::DeleteStrict,
            table: Some(table),
            priority,
            cookie,
            cookie_mask: u64::MAX,
            flow_match,
            actions: vec![],
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    pub fn with_hard_timeout(mut self, hard_timeout: u16) -> Self {
        self.hard_timeout = hard_timeout;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeterCommand {
    Add,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeterMod {
    pub command: MeterCommand,
    pub meter_id: u32,
    pub rate_kbps: u64,
    pub burst_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeterConfig {
    pub meter_id: u32,
    pub rate_kbps: u64,
    pub burst_size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowStatsRequest {
    pub table: Option<TableId>,
    pub cookie: u64,
    pub cookie_mask: u64,
    pub flow_match: FlowMatch,
}

impl FlowStatsRequest {
    pub fn table(table: TableId) -> Self {
        FlowStatsRequest {
            table: Some(table),
            ..Default::default()
        }
    }
}

/// One flow entry as reported by a flow-stats reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowStats {
    pub table: TableId,
    pub priority: u16,
    pub cookie: u64,
    pub flow_match: FlowMatch,
    pub actions: Vec<Action>,
    pub packet_count: u64,
    pub byte_count: u64,
}

impl FlowStats {
    pub fn is_drop(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultipartBody {
    Flow(Vec<FlowStats>),
    MeterConfig(Vec<MeterConfig>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OfpMessage {
    FlowMod(FlowMod),
    MeterMod(MeterMod),
    Barrier,
    FlowStatsRequest(FlowStatsRequest),
    MeterConfigRequest,
}

/// Asynchronous messages and replies from the switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchEvent {
    Connected { datapath_id: u64 },
    Disconnected,
    BarrierReply { xid: Xid },
    Error { xid: Xid, reason: String },
    /// One part of a multipart reply.  `more` is set on every part but the last.
    MultipartReply { xid: Xid, body: MultipartBody, more: bool },
}
