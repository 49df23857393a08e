use marlinsql_common::error::{Error, Result};

use crate::options::PlanOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlKind {
    Update,
    Delete,
    Merge,
}

impl DmlKind {
    fn verb(&self) -> &'static str {
        match self {
            DmlKind::Update => "UPDATE",
            DmlKind::Delete => "DELETE",
            DmlKind::Merge => "MERGE",
        }
    }
}

/// The DML safety guard, run at plan time. An UPDATE/DELETE/MERGE whose
/// effective scan scope has no WHERE clause is blocked outright when the
/// matching `block_unrestricted_*` option is set, and otherwise requires the
/// caller's explicit confirmation.
pub fn check_unrestricted_dml(
    kind: DmlKind,
    entity: &str,
    has_where: bool,
    options: &PlanOptions,
) -> Result<()> {
    if has_where {
        return Ok(());
    }
    let blocked = match kind {
        DmlKind::Delete => options.block_unrestricted_delete,
        DmlKind::Update | DmlKind::Merge => options.block_unrestricted_update,
    };
    if blocked {
        return Err(Error::dml_blocked(format!(
            "{} on {} has no WHERE clause and unrestricted {0} is blocked",
            kind.verb(),
            entity
        )));
    }
    if !options.confirm_unrestricted_dml {
        return Err(Error::dml_blocked(format!(
            "{} on {} has no WHERE clause; set confirm_unrestricted_dml to run it",
            kind.verb(),
            entity
        )));
    }
    Ok(())
}
