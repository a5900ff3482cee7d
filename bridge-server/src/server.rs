//! 中继服务器核心实现

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bridge_protocol::{
    ChannelConfig, Connector, FrameChannel, SessionRegistry, TcpChannel, TcpListener,
    TcpTransport, TransportListener, STOP_GRACE,
};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// 共享状态
#[derive(Default)]
struct SharedState {
    /// C2 侧通道注册表: beacon ID -> 会话
    registry: SessionRegistry,
    /// 正在运行的连接器: beacon ID -> Connector
    relays: RwLock<HashMap<String, Arc<Connector>>>,
}

/// 中继服务器
pub struct BridgeServer {
    c2_addr: String,
    config: ChannelConfig,
    state: Arc<SharedState>,
}

impl BridgeServer {
    pub fn new(c2_addr: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            c2_addr: c2_addr.into(),
            config,
            state: Arc::new(SharedState::default()),
        }
    }

    /// 运行服务器，Ctrl+C 时优雅关闭
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let mut listener = TcpListener::bind(addr).await?;
        listener.set_nodelay(self.config.nodelay);
        info!("Server listening on {}", listener.local_addr()?);

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// 在已绑定的监听器上接受连接，直到 `shutdown` 完成
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // 接受新的 beacon 连接
                result = listener.accept() => {
                    match result {
                        Ok((transport, peer)) => {
                            let state = Arc::clone(&self.state);
                            let c2_addr = self.c2_addr.clone();
                            let config = self.config.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_beacon(transport, peer, c2_addr, config, state).await {
                                    warn!("Beacon session from {} ended with error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                _ = &mut shutdown => {
                    info!("Received shutdown signal, initiating graceful shutdown...");
                    self.shutdown().await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// 当前中继中的会话数
    pub async fn active_relays(&self) -> usize {
        self.state.relays.read().await.len()
    }

    /// 停止所有连接器，最多等待 `STOP_GRACE`
    async fn shutdown(&self) {
        let relays: Vec<Arc<Connector>> =
            self.state.relays.read().await.values().cloned().collect();

        for connector in &relays {
            connector.stop().await;
        }

        let wait_all = async {
            for connector in &relays {
                connector.wait().await;
            }
        };
        if timeout(STOP_GRACE, wait_all).await.is_err() {
            warn!(
                "Shutdown timeout, {} relays still active",
                self.active_relays().await
            );
        }

        self.state.registry.close_all().await;
        info!("Server shutdown complete");
    }
}

/// 处理单个 beacon 连接：拨号 C2 监听器、注册会话、运行连接器直到结束
async fn handle_beacon(
    transport: TcpTransport,
    peer: SocketAddr,
    c2_addr: String,
    config: ChannelConfig,
    state: Arc<SharedState>,
) -> anyhow::Result<()> {
    let beacon: Arc<dyn FrameChannel> =
        Arc::new(TcpChannel::from_transport(peer.to_string(), transport, config.clone()));
    let server: Arc<dyn FrameChannel> = Arc::new(TcpChannel::new(c2_addr, config));

    let id = match state.registry.create(Arc::clone(&server)).await {
        Ok(id) => id,
        Err(e) => {
            beacon.close().await;
            return Err(e.into());
        }
    };
    let key = id.to_string();
    info!(session = %key, "Beacon connected from {}", peer);

    // 连接器在转发元数据帧时把数字 ID 写回会话
    let session = match state.registry.get(&key).await {
        Ok(session) => session,
        Err(e) => {
            // 关闭流程已清空注册表
            beacon.close().await;
            server.close().await;
            return Err(e.into());
        }
    };
    let connector = Arc::new(
        Connector::new(key.clone(), beacon, server)
            .with_external_id_slot(session.external_id_slot()),
    );
    state
        .relays
        .write()
        .await
        .insert(key.clone(), Arc::clone(&connector));

    let result = connector.go().await;
    match &result {
        Ok(()) => connector.wait().await,
        Err(_) => connector.stop().await,
    }

    state.relays.write().await.remove(&key);
    if let Err(e) = state.registry.remove(&key).await {
        // 关闭流程可能已经清空注册表
        debug!(session = %key, "Session already removed: {}", e);
    }
    info!(session = %key, "Session finished");

    result.map_err(Into::into)
}
