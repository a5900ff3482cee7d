//! 测试用内存传输与日志收集

use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use crate::channel::StreamChannel;
use crate::error::{ChannelError, Result};
use crate::transport::{ChannelConfig, Transport};

/// 单个内存通道的缓冲区大小
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// 基于 `tokio::io::duplex` 的传输，不支持主动拨号
pub struct MemoryTransport(DuplexStream);

impl Transport for MemoryTransport {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    async fn connect(addr: &str, _config: &ChannelConfig) -> Result<Self> {
        Err(ChannelError::Connection {
            addr: addr.to_string(),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        })
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.0)
    }
}

pub type MemoryChannel = StreamChannel<MemoryTransport>;

/// 创建已连接的内存通道，返回通道和对端原始字节流
pub fn memory_channel(config: ChannelConfig) -> (MemoryChannel, DuplexStream) {
    let (local, peer) = tokio::io::duplex(DUPLEX_CAPACITY);
    (
        StreamChannel::from_transport("memory", MemoryTransport(local), config),
        peer,
    )
}

/// 收集日志输出的共享缓冲区
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<StdMutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut inner) = self.0.lock() {
            inner.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// 在当前线程安装 debug 级别的日志订阅者，返回守卫和日志缓冲区
pub fn capture_logs() -> (tracing::subscriber::DefaultGuard, LogBuffer) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (tracing::subscriber::set_default(subscriber), buffer)
}
