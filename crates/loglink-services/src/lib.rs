//! loglink-services: both ends of the notify profile, the acknowledged
//! serial profile, the bridge relay, storage adapters, and trigger admission.

pub mod bridge;
pub mod events;
pub mod loopback;
pub mod requester;
pub mod responder;
pub mod retry;
pub mod serial;
pub mod session;
pub mod store;
pub mod trigger;

pub use bridge::{
    BridgeCollector, BridgeForwarder, BridgeReader, BridgeSinkFactory, RelayEnd, RelayedLog,
};
pub use events::{EventBus, LinkEvent};
pub use loopback::{Loopback, LoopbackBuilder};
pub use requester::{
    RequestError, Requester, RequesterActor, RequesterHandle, TransferFailure, TransferOutcome,
    TransferReport,
};
pub use responder::{Outbound, Responder, ResponderActor, ResponderHandle, ResponderInput};
pub use retry::{RetryBudget, RetryPolicy};
pub use serial::{ReceivedLog, SendReport, SerialError, SerialLink, SerialReceiver, SerialSender};
pub use session::{SessionState, TransferSession};
pub use store::{
    DirStore, FileSinkFactory, LogSink, MemorySinkFactory, MemoryStore, OpenedResource,
    ResourceStore, SinkFactory, StoreError,
};
pub use trigger::{trigger_channel, TriggerGate, TriggerRequest, TriggerSource, TriggerWorker};
