//! 错误类型定义

use thiserror::Error;

/// 帧通道错误类型
#[derive(Error, Debug)]
pub enum ChannelError {
    /// 无法建立底层传输
    #[error("Failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// 连接超时
    #[error("Connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    /// 读帧失败，附带已读取的字节数
    #[error("Read failed after {read} of {expected} bytes: {source}")]
    Read {
        read: usize,
        expected: usize,
        #[source]
        source: std::io::Error,
    },

    /// 写帧失败
    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),

    /// 通道已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 通道尚未连接
    #[error("Channel not connected")]
    NotConnected,

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 会话不存在
    #[error("Session not found: {0}")]
    NotFound(String),

    /// 标识字符串格式错误
    #[error("Invalid beacon id: {0}")]
    InvalidBeaconId(String),

    /// 随机源不可用
    #[error("Randomness unavailable: {0}")]
    Randomness(String),

    /// 连接器未初始化
    #[error("Connector not initialized")]
    NotInitialized,

    /// 其他 IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 通道操作结果类型
pub type Result<T> = std::result::Result<T, ChannelError>;
