//! The MarlinSQL execution engine: plan builder, expression compiler,
//! streaming operators, adaptive aggregate partitioner and the remote-store
//! capability contract.

pub mod context;
pub mod eval;
pub mod exec;
pub mod explain;
pub mod guard;
pub mod options;
pub mod plan;
pub mod remote;
pub mod session;

pub use context::ExecutionContext;
pub use exec::{PlanNodeRef, QueryPlanNode, RowStream};
pub use options::PlanOptions;
pub use plan::PlanBuilder;
pub use remote::{DmlOperation, DmlOutcome, DmlRequest, FetchPage, FetchRequest, RemoteStore};
pub use session::{Session, SessionHandle};
