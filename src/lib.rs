pub mod error;
pub mod types;
pub mod config;
pub mod utils;
pub mod command;
pub mod connector;
pub mod host;
pub mod inventory;
pub mod facts;
pub mod operation;
pub mod graph;
pub mod state;
pub mod executor;


pub use error::{ConnectErrorKind, InfraError};
pub use types::{
    ArgOverrides, CommandOutput, ConnectorArguments, ExecutionArgs, FileSource, HostMeta,
    HostResults, OpResultKind, OperationArgs, OutputLine, OutputStream, Secret,
};
pub use config::{Config, OpOrdering};
pub use command::{Command, CommandPart, OpItem, StringCommand, make_formatted_string_command};
pub use connector::{
    Connector, ConnectorKind, ConnectorRegistry, HostEntry, LocalConnector, LocalConnectorKind,
    SshConnector, SshConnectorKind,
};
pub use host::{Host, HostData, SharedHost, lock_host};
pub use inventory::{Inventory, InventoryBuilder};
pub use facts::{Fact, FileExists, Hostname, Which};
pub use operation::{HostContext, OpCall, OperationMeta};
pub use state::{ExecutionState, OpMeta, State, StateCallback};
pub use executor::{RunStrategy, RunSummary, run};

// 便捷的重新导出
pub type Result<T> = std::result::Result<T, InfraError>;
