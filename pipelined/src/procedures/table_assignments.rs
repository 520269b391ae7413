//! table_assignments - report which tables each app owns

use crate::data::{RpcError, TableAssignment};
use crate::{HandlerApi, Procedure};
use derive_deref::{Deref, DerefMut};
use slog::Logger;

#[derive(Deref, DerefMut)]
pub struct TableAssignmentsProcedure<'a, A: HandlerApi>(Procedure<'a, A>);

impl<'a, A: HandlerApi> TableAssignmentsProcedure<'a, A> {
    pub fn new(api: &'a A, logger: &'a Logger) -> Self {
        TableAssignmentsProcedure(Procedure::new(api, logger))
    }

    pub fn run(&self) -> Result<Vec<TableAssignment>, RpcError> {
        self.log_message(">> GetAllTableAssignments");
        let assignments = self.tables().assignments();
        self.log_message("<< AllTableAssignments");
        Ok(assignments)
    }
}
