/// 建立会话失败。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// 服务端拒绝当前安全策略，可回退到下一策略。
    #[error("security policy rejected: {0}")]
    SecurityRejected(String),
    /// 网络拒绝、会话故障等瞬时错误，进入退避重连。
    #[error("transient connect error: {0}")]
    Transient(String),
    #[error("connect timed out after {0} ms")]
    Timeout(u64),
}

/// 已建立会话上的操作失败。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("session closed")]
    Closed,
}
