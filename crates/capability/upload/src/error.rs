/// 云端发送失败。任何错误都意味着整批未被确认，下个周期整体重发。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected by sink: {0}")]
    Rejected(String),
    #[error("send timed out after {0} ms")]
    Timeout(u64),
    #[error("encoding error: {0}")]
    Encoding(String),
}
