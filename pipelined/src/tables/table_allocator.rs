//! table_allocator - assigns OpenFlow table numbers to the apps of the pipeline

use super::app_names::*;
use crate::data::{TableAssignment, TableError};
use openflow::TableId;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Ingress classification.
    Special,
    Physical,
    Logical,
}

impl Stage {
    fn range(&self) -> Range<TableId> {
        match self {
            Stage::Special => 0..2,
            Stage::Physical => 2..10,
            Stage::Logical => 10..EGRESS_TABLE,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Stage::Special => "special",
            Stage::Physical => "physical",
            Stage::Logical => "logical",
        }
    }
}

/// Terminal table that every pipeline ends in.
pub const EGRESS_TABLE: TableId = 20;

const SCRATCH_TABLES: Range<u16> = 200..256;

/// Stage of each app this build knows how to run.
pub fn app_stage(app_name: &str) -> Result<Stage, TableError> {
    match app_name {
        CLASSIFIER => Ok(Stage::Special),
        UE_MAC | CHECK_QUOTA | HE => Ok(Stage::Physical),
        GY | ENFORCEMENT | ENFORCEMENT_STATS => Ok(Stage::Logical),
        _ => Err(TableError::UnknownApp(app_name.to_string())),
    }
}

#[derive(Debug)]
struct AppTables {
    app_name: String,
    main_table: TableId,
    scratch_tables: Vec<TableId>,
}

#[derive(Debug)]
pub struct TableAllocator {
    // In registration order.
    apps: Vec<AppTables>,
    next_scratch: u16,
}

impl TableAllocator {
    pub fn new() -> Self {
        TableAllocator {
            apps: vec![],
            next_scratch: SCRATCH_TABLES.start,
        }
    }

    /// Register the classifier followed by the configured apps in order, and hand out the
    /// scratch tables that the enforcement apps use for redirection.
    pub fn build(static_apps: &[String], dynamic_apps: &[String]) -> Result<Self, TableError> {
        let mut allocator = Self::new();
        allocator.register(CLASSIFIER, Stage::Special)?;
        for app_name in static_apps.iter().chain(dynamic_apps.iter()) {
            let stage = app_stage(app_name)?;
            allocator.register(app_name, stage)?;
        }
        for app_name in [GY, ENFORCEMENT] {
            if allocator.find(app_name).is_some() {
                allocator.allocate_scratch(app_name, 1)?;
            }
        }
        Ok(allocator)
    }

    fn find(&self, app_name: &str) -> Option<&AppTables> {
        self.apps.iter().find(|a| a.app_name == app_name)
    }

    pub fn register(&mut self, app_name: &str, stage: Stage) -> Result<TableId, TableError> {
        if self.find(app_name).is_some() {
            return Err(TableError::AlreadyRegistered(app_name.to_string()));
        }
        let range = stage.range();
        let main_table = self
            .apps
            .iter()
            .map(|a| a.main_table)
            .filter(|t| range.contains(t))
            .max()
            .map(|t| t + 1)
            .unwrap_or(range.start);
        if main_table >= range.end {
            return Err(TableError::TableExhausted(stage.name()));
        }
        self.apps.push(AppTables {
            app_name: app_name.to_string(),
            main_table,
            scratch_tables: vec![],
        });
        Ok(main_table)
    }

    pub fn allocate_scratch(
        &mut self,
        app_name: &str,
        count: usize,
    ) -> Result<Vec<TableId>, TableError> {
        let start = self.next_scratch;
        let end = start + count as u16;
        if end > SCRATCH_TABLES.end {
            return Err(TableError::ScratchExhausted);
        }
        let app = self
            .apps
            .iter_mut()
            .find(|a| a.app_name == app_name)
            .ok_or_else(|| TableError::NotRegistered(app_name.to_string()))?;
        let tables: Vec<TableId> = (start..end).map(|t| t as TableId).collect();
        app.scratch_tables.extend(tables.iter());
        self.next_scratch = end;
        Ok(tables)
    }

    pub fn is_registered(&self, app_name: &str) -> bool {
        self.find(app_name).is_some()
    }

    pub fn main_table(&self, app_name: &str) -> Result<TableId, TableError> {
        self.find(app_name)
            .map(|a| a.main_table)
            .ok_or_else(|| TableError::NotRegistered(app_name.to_string()))
    }

    pub fn scratch_tables(&self, app_name: &str) -> Result<Vec<TableId>, TableError> {
        self.find(app_name)
            .map(|a| a.scratch_tables.clone())
            .ok_or_else(|| TableError::NotRegistered(app_name.to_string()))
    }

    /// The main table of the app that follows `app_name` in the pipeline, or egress.
    pub fn next_table(&self, app_name: &str) -> Result<TableId, TableError> {
        let main_table = self.main_table(app_name)?;
        Ok(self
            .apps
            .iter()
            .map(|a| a.main_table)
            .filter(|t| *t > main_table)
            .min()
            .unwrap_or(EGRESS_TABLE))
    }

    pub fn assignments(&self) -> Vec<TableAssignment> {
        self.apps
            .iter()
            .map(|a| TableAssignment {
                app_name: a.app_name.clone(),
                main_table: a.main_table,
                scratch_tables: a.scratch_tables.clone(),
            })
            .collect()
    }
}
