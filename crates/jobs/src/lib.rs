pub mod admission;
pub mod executor;
pub mod history;
pub mod input;
pub mod pool;
pub mod result;

pub use admission::{AdmissionController, AdmissionSnapshot, KindUsage, Ticket};
pub use executor::{ExecutorStats, JobExecutor, JobOutcome};
pub use history::{JobHistory, JobTotals, DEFAULT_HISTORY};
pub use input::{JobInput, MemoryInput, StagingContext};
pub use pool::{WorkerPool, WorkerSlot, WorkerUsage};
pub use result::{FileLink, ResponseEnvelope, ResultBuilder};
