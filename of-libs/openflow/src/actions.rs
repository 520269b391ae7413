use crate::{FieldKind, FieldValue, TableId};

/// An instruction applied to a matching packet.  An empty action list means drop.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Output(u32),
    GotoTable(TableId),
    SetField(FieldKind, FieldValue),
    Meter(u32),
    Learn(LearnSpec),
}

impl Action {
    pub fn load_reg(reg: u8, value: u32) -> Self {
        Action::SetField(FieldKind::Reg(reg), FieldValue::Int(value as u64))
    }

    pub fn set_int(kind: FieldKind, value: u64) -> Self {
        Action::SetField(kind, FieldValue::Int(value))
    }
}

/// Where a learned flow takes a value from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LearnSrc {
    /// The value the triggering packet carries in this field.
    Field(FieldKind),
    Value(FieldValue),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LearnAction {
    SetField(FieldKind, LearnSrc),
    GotoTable(TableId),
    Output(u32),
}

/// The "learn" action: when a packet hits the flow carrying it, a new flow is
/// synthesised from the packet's fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LearnSpec {
    pub table: TableId,
    pub priority: u16,
    pub cookie: u64,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub matches: Vec<(FieldKind, LearnSrc)>,
    pub actions: Vec<LearnAction>,
}
