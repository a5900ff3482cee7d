//! 协议常量定义

use std::time::Duration;

/// 帧头大小: 4 字节小端长度
pub const FRAME_HEADER_SIZE: usize = 4;

/// 单帧负载最大大小 (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// 调试模式下记录帧内容的长度上限（不含）
pub const DEBUG_FRAME_LIMIT: usize = 1024;

/// 读帧调试输出的长度下限（不含）
pub const DEBUG_READ_MIN: usize = 1;

/// 写帧调试输出的长度下限（不含）
pub const DEBUG_SEND_MIN: usize = 2;

/// Beacon 首帧（元数据）长度，前 4 字节为 beacon 数字 ID
pub const BEACON_METADATA_LEN: usize = 132;

/// Stager 请求默认阻塞时间（毫秒）
pub const DEFAULT_BLOCK_TIME_MS: u32 = 100;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 关闭时等待中继任务退出的时间（秒）
pub const STOP_GRACE_SECS: u64 = 5;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// 关闭等待 Duration
pub const STOP_GRACE: Duration = Duration::from_secs(STOP_GRACE_SECS);
