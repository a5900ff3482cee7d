//! 字节流传输
//!
//! 帧通道只关心"拨号 + 拆分读写端"。beacon 侧通常是命名管道（unix 上用
//! Unix 域套接字代替），C2 侧是 TCP；守护进程用 TCP 监听器接受 beacon。

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::codec::OversizePolicy;
use crate::error::{ChannelError, Result};
use crate::{CONNECT_TIMEOUT, MAX_FRAME_SIZE};

/// 管道尚未就绪时的重试间隔
const PIPE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// 通道配置
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// 拨号（含管道重试）的总时限
    pub connect_timeout: Duration,
    /// TCP 拨出的连接是否设置 nodelay
    pub nodelay: bool,
    /// 单帧负载上限
    pub max_frame_size: usize,
    /// 超限帧的处理策略
    pub oversize_policy: OversizePolicy,
    /// 是否以 base64 记录小帧内容
    pub debug: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true,
            max_frame_size: MAX_FRAME_SIZE,
            oversize_policy: OversizePolicy::Reject,
            debug: false,
        }
    }
}

/// 可主动拨号、可拆分读写端的字节流传输
pub trait Transport: Send + Sync + Sized {
    type Reader: AsyncRead + Unpin + Send;
    type Writer: AsyncWrite + Unpin + Send;

    /// 拨号 `addr`（TCP 为 "host:port"，管道为路径或管道名），
    /// 超过 `config.connect_timeout` 返回 `ConnectTimeout`
    fn connect(
        addr: &str,
        config: &ChannelConfig,
    ) -> impl std::future::Future<Output = Result<Self>> + Send;

    /// 拆成独立的读取端和写入端，两个中继方向各用一端
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// 守护进程接受 beacon 连接用的监听器
pub trait TransportListener: Send + Sync + Sized {
    type Transport: Transport;
    /// 对端标识，用于日志和通道地址
    type Peer: fmt::Display + Send;

    fn bind(addr: &str) -> impl std::future::Future<Output = Result<Self>> + Send;

    /// 等待下一个连接，返回传输与对端标识
    fn accept(
        &self,
    ) -> impl std::future::Future<Output = Result<(Self::Transport, Self::Peer)>> + Send;
}

fn connect_error(addr: &str, source: std::io::Error) -> ChannelError {
    ChannelError::Connection {
        addr: addr.to_string(),
        source,
    }
}

// ============================================================================
// TCP
// ============================================================================

/// TCP 传输：拨号 C2 监听器，或承载守护进程接受的 beacon 连接
#[derive(Debug)]
pub struct TcpTransport(TcpStream);

impl TcpTransport {
    fn configured(stream: TcpStream, nodelay: bool) -> Result<Self> {
        stream.set_nodelay(nodelay)?;
        Ok(Self(stream))
    }
}

impl Transport for TcpTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    async fn connect(addr: &str, config: &ChannelConfig) -> Result<Self> {
        let stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_error(addr, e)),
            Err(_) => {
                return Err(ChannelError::ConnectTimeout {
                    addr: addr.to_string(),
                })
            }
        };
        Self::configured(stream, config.nodelay)
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        self.0.into_split()
    }
}

/// beacon 连接监听器
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    nodelay: bool,
}

impl TcpListener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// 接受的连接是否禁用 Nagle 算法（默认禁用）
    pub fn set_nodelay(&mut self, nodelay: bool) {
        self.nodelay = nodelay;
    }
}

impl TransportListener for TcpListener {
    type Transport = TcpTransport;
    type Peer = SocketAddr;

    async fn bind(addr: &str) -> Result<Self> {
        Ok(Self {
            inner: tokio::net::TcpListener::bind(addr).await?,
            nodelay: true,
        })
    }

    async fn accept(&self) -> Result<(TcpTransport, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        Ok((TcpTransport::configured(stream, self.nodelay)?, peer))
    }
}

// ============================================================================
// 管道实现（unix 上为 Unix 域套接字，Windows 上为命名管道）
// ============================================================================

/// 管道传输实现
///
/// beacon 创建管道的时机不确定，连接时在超时范围内重试。
#[derive(Debug)]
pub struct PipeTransport {
    #[cfg(unix)]
    stream: tokio::net::UnixStream,
    #[cfg(windows)]
    client: tokio::net::windows::named_pipe::NamedPipeClient,
}

#[cfg(unix)]
impl Transport for PipeTransport {
    type Reader = tokio::net::unix::OwnedReadHalf;
    type Writer = tokio::net::unix::OwnedWriteHalf;

    async fn connect(addr: &str, config: &ChannelConfig) -> Result<Self> {
        let attempt = async {
            loop {
                match tokio::net::UnixStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        tokio::time::sleep(PIPE_RETRY_INTERVAL).await;
                    }
                    Err(e) => return Err(connect_error(addr, e)),
                }
            }
        };

        let stream = timeout(config.connect_timeout, attempt)
            .await
            .map_err(|_| ChannelError::ConnectTimeout {
                addr: addr.to_string(),
            })??;

        Ok(Self { stream })
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        self.stream.into_split()
    }
}

#[cfg(windows)]
impl Transport for PipeTransport {
    type Reader = tokio::io::ReadHalf<tokio::net::windows::named_pipe::NamedPipeClient>;
    type Writer = tokio::io::WriteHalf<tokio::net::windows::named_pipe::NamedPipeClient>;

    async fn connect(addr: &str, config: &ChannelConfig) -> Result<Self> {
        use tokio::net::windows::named_pipe::ClientOptions;

        const ERROR_PIPE_BUSY: i32 = 231;

        let attempt = async {
            loop {
                match ClientOptions::new().open(addr) {
                    Ok(client) => return Ok(client),
                    Err(e)
                        if e.raw_os_error() == Some(ERROR_PIPE_BUSY)
                            || e.kind() == std::io::ErrorKind::NotFound =>
                    {
                        tokio::time::sleep(PIPE_RETRY_INTERVAL).await;
                    }
                    Err(e) => return Err(connect_error(addr, e)),
                }
            }
        };

        let client = timeout(config.connect_timeout, attempt)
            .await
            .map_err(|_| ChannelError::ConnectTimeout {
                addr: addr.to_string(),
            })??;

        Ok(Self { client })
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accept_reports_peer_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = TcpStream::connect(addr).await.unwrap();
        let (_transport, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_dialed_transport_splits_into_halves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dial = tokio::spawn(async move {
            TcpTransport::connect(&addr, &ChannelConfig::default()).await
        });
        let (accepted, _) = listener.accept().await.unwrap();
        let dialed = dial.await.unwrap().unwrap();

        let (_dialed_rx, mut dialed_tx) = dialed.split();
        let (mut accepted_rx, _accepted_tx) = accepted.split();
        dialed_tx.write_all(b"\x05\x00\x00\x00ready").await.unwrap();

        let mut buf = [0u8; 9];
        accepted_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[4..], b"ready");
    }

    #[tokio::test]
    async fn test_dial_without_listener_is_connection_error() {
        // 绑定后立即释放，拿到一个无人监听的端口
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        match TcpTransport::connect(&addr, &ChannelConfig::default()).await {
            Err(ChannelError::Connection { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_connect_times_out_when_missing() {
        let config = ChannelConfig {
            connect_timeout: Duration::from_millis(300),
            ..ChannelConfig::default()
        };
        let result = PipeTransport::connect("/nonexistent/bridge-test.sock", &config).await;
        assert!(matches!(result, Err(ChannelError::ConnectTimeout { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_connect_unix_socket() {
        let path = std::env::temp_dir().join(format!("bridge-pipe-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let addr = path.to_string_lossy().to_string();
        let client = tokio::spawn(async move {
            PipeTransport::connect(&addr, &ChannelConfig::default()).await
        });

        let (_server, _) = listener.accept().await.unwrap();
        assert!(client.await.unwrap().is_ok());
        let _ = std::fs::remove_file(&path);
    }
}
