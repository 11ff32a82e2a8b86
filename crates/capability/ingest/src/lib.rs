//! OPC UA 接入能力
//!
//! - `session`：外部 OPC UA 客户端需实现的连接/会话 Trait
//! - `client`：基于 async-opcua 的连接器实现
//! - `backoff`：指数退避 + 随机扰动
//! - `state`：连接阶段与健康度
//! - `manager`：单端点连接状态机，将数据变化转换为采集点

pub mod backoff;
pub mod client;
pub mod error;
pub mod manager;
pub mod session;
pub mod state;

pub use backoff::BackoffPolicy;
pub use client::{UaClientSettings, UaConnector, UaSession};
pub use error::{ConnectError, SessionError};
pub use manager::{ConnectionManager, ConnectionSettings, wait_for_shutdown};
pub use session::{
    DataChange, NoopConnector, OpcUaConnector, OpcUaSession, SecurityPolicy, SessionEvent,
};
pub use state::{ConnectionHealth, ConnectionPhase, ConnectionState};
