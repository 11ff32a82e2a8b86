//! 云端上传能力
//!
//! - `record`：缓冲记录 → 云端记录（measurement / tags / fields）与 line protocol
//! - `sink`：[`CloudSink`] Trait 及 MQTT、空实现
//! - `coordinator`：[`UploadCoordinator`] 周期性取批、发送、确认、删除

pub mod coordinator;
pub mod error;
pub mod record;
pub mod sink;

pub use coordinator::{CycleReport, UploadConfig, UploadCoordinator, UploadStats};
pub use error::SinkError;
pub use record::{CloudRecord, FieldValue, UploadBatch};
pub use sink::{CloudSink, MqttCloudSink, MqttSinkConfig, NoopSink};
