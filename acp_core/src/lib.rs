pub mod channel;
pub mod codec;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fault;
pub mod monitor;
pub mod publisher;
pub mod session;

pub use channel::{ChannelState, InputState, PublisherSession};
pub use codec::Reply;
pub use command::{Command, Request, Route};
pub use config::AgentConfig;
pub use dispatcher::Dispatcher;
pub use error::{AgentError, PublisherError};
pub use fault::{FaultRecord, FaultType, MonitorData};
pub use monitor::{Monitor, MonitorCatalog, NullMonitor, RandoFaulter};
pub use publisher::{IterationContext, Publisher, PublisherCatalog};
pub use session::{AgentSession, AgentState, MustStopHandle};
