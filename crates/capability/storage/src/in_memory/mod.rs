//! 内存缓冲实现模块
//!
//! 不落盘，仅用于测试和 `memory` 后端演示。

pub mod buffer;

pub use buffer::*;
