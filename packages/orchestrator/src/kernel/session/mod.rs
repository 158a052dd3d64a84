// Worker session layer: wire protocol, per-robot session registry and
// ingress routing. The socket transport itself lives with the server
// routes; everything here is transport-agnostic.

pub mod ingress;
pub mod manager;
pub mod protocol;

pub use ingress::IngressRouter;
pub use manager::{AckOutcome, SessionManager, SessionReceiver};
pub use protocol::{
    JobAssignment, LogLevel, OrchestratorFrame, OrchestratorMessage, SeqTracker, WorkerFrame,
    WorkerMessage,
};
