//! 帧编解码
//!
//! 帧格式:
//! ```text
//! ┌────────────────┬────────────────────────────────┐
//! │  Length (4B)   │         Payload (opaque)       │
//! │    u32 LE      │         Length bytes           │
//! └────────────────┴────────────────────────────────┘
//! ```
//!
//! 负载对本层是不透明字节，没有校验和与类型标记。

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::{ChannelError, Result};
use crate::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

/// 声明长度超过上限时的处理策略
///
/// 两种策略都会把声明长度的负载从流中读出丢弃，保证后续帧边界不错位。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OversizePolicy {
    /// 丢弃整帧并返回 `FrameTooLarge`
    #[default]
    Reject,
    /// 保留前 `max_frame_size` 字节，丢弃剩余部分
    Truncate,
}

/// 帧读取器
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: usize,
    policy: OversizePolicy,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// 创建新的帧读取器（默认上限 1 MiB，超限拒绝）
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_FRAME_SIZE, OversizePolicy::Reject)
    }

    /// 指定帧上限与超限策略
    pub fn with_limit(reader: R, max_frame_size: usize, policy: OversizePolicy) -> Self {
        Self {
            reader,
            max_frame_size,
            policy,
        }
    }

    /// 读取一帧
    ///
    /// 阻塞直到整帧到达；底层的短读会被循环累积，不会交付半帧。
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match read_full(&mut self.reader, &mut header).await {
            // 帧边界上的 EOF 视为对端正常关闭
            Err(ChannelError::Read { read: 0, source, .. })
                if source.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Err(ChannelError::ConnectionClosed);
            }
            other => other?,
        }

        let length = u32::from_le_bytes(header) as usize;

        if length > self.max_frame_size {
            return self.read_oversized(length).await;
        }

        let mut payload = BytesMut::zeroed(length);
        read_full(&mut self.reader, &mut payload).await?;
        Ok(payload.freeze())
    }

    /// 接收一帧（read_frame 的别名）
    pub async fn recv(&mut self) -> Result<Bytes> {
        self.read_frame().await
    }

    async fn read_oversized(&mut self, length: usize) -> Result<Bytes> {
        let max = self.max_frame_size;
        match self.policy {
            OversizePolicy::Reject => {
                warn!("Discarding oversized frame: {} bytes (max: {})", length, max);
                self.discard(length).await?;
                Err(ChannelError::FrameTooLarge { size: length, max })
            }
            OversizePolicy::Truncate => {
                warn!("Truncating oversized frame: {} bytes to {}", length, max);
                let mut payload = BytesMut::zeroed(max);
                read_full(&mut self.reader, &mut payload).await?;
                self.discard(length - max).await?;
                Ok(payload.freeze())
            }
        }
    }

    /// 从流中读出并丢弃 `count` 字节
    async fn discard(&mut self, count: usize) -> Result<()> {
        let mut limited = (&mut self.reader).take(count as u64);
        let drained = tokio::io::copy(&mut limited, &mut tokio::io::sink())
            .await
            .map_err(|source| ChannelError::Read {
                read: 0,
                expected: count,
                source,
            })? as usize;

        if drained < count {
            return Err(ChannelError::Read {
                read: drained,
                expected: count,
                source: std::io::ErrorKind::UnexpectedEof.into(),
            });
        }
        Ok(())
    }
}

/// 循环读取直到填满 `buf`，失败时报告已读字节数
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let expected = buf.len();
    let mut read = 0;
    while read < expected {
        match reader.read(&mut buf[read..]).await {
            Ok(0) => {
                return Err(ChannelError::Read {
                    read,
                    expected,
                    source: std::io::ErrorKind::UnexpectedEof.into(),
                })
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(ChannelError::Read {
                    read,
                    expected,
                    source,
                })
            }
        }
    }
    Ok(())
}

/// 帧写入器
pub struct FrameWriter<W> {
    writer: W,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// 创建新的帧写入器
    pub fn new(writer: W) -> Self {
        Self::with_limit(writer, MAX_FRAME_SIZE)
    }

    /// 指定帧上限
    pub fn with_limit(writer: W, max_frame_size: usize) -> Self {
        Self {
            writer,
            max_frame_size,
        }
    }

    /// 写入一帧，返回包含 4 字节帧头在内的总字节数
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<usize> {
        // 超限帧不写出任何字节，避免对端丢弃时流错位
        if payload.len() > self.max_frame_size {
            return Err(ChannelError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        let header = (payload.len() as u32).to_le_bytes();

        self.writer
            .write_all(&header)
            .await
            .map_err(ChannelError::Write)?;
        self.writer
            .write_all(payload)
            .await
            .map_err(ChannelError::Write)?;
        self.writer.flush().await.map_err(ChannelError::Write)?;

        Ok(FRAME_HEADER_SIZE + payload.len())
    }

    /// 发送一帧（write_frame 的别名）
    pub async fn send(&mut self, payload: &[u8]) -> Result<usize> {
        self.write_frame(payload).await
    }

    /// 关闭写入端
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.writer.shutdown().await
    }
}
