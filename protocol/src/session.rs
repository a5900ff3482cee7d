//! 会话注册表
//!
//! 维护 beacon 标识到帧通道的映射，供外部协作层（如 HTTP 轮询服务）
//! 按标识转发入站帧、取出站帧或请求 stager。多个请求上下文可并发访问。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::beacon_id::{extract_external_id, BeaconId};
use crate::channel::FrameChannel;
use crate::error::{ChannelError, Result};

/// 单个 beacon 会话
pub struct Session {
    id: BeaconId,
    channel: Arc<dyn FrameChannel>,
    external_id: Arc<OnceLock<u32>>,
}

impl Session {
    /// 会话标识
    pub fn id(&self) -> BeaconId {
        self.id
    }

    /// C2 侧通道
    pub fn channel(&self) -> &Arc<dyn FrameChannel> {
        &self.channel
    }

    /// 从首个元数据帧中提取的 beacon 数字 ID
    pub fn external_id(&self) -> Option<u32> {
        self.external_id.get().copied()
    }

    /// 数字 ID 的共享存放位置，交给中继该会话的连接器
    pub fn external_id_slot(&self) -> Arc<OnceLock<u32>> {
        Arc::clone(&self.external_id)
    }
}

/// 会话注册表
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配新标识并注册通道；通道尚未连接时先连接
    pub async fn create(&self, channel: Arc<dyn FrameChannel>) -> Result<BeaconId> {
        let id = BeaconId::new()?;
        if !channel.is_connected() {
            channel.connect().await?;
        }

        let session = Arc::new(Session {
            id,
            channel,
            external_id: Arc::new(OnceLock::new()),
        });
        self.sessions.write().await.insert(id.to_string(), session);

        info!(session = %id, "Session created");
        Ok(id)
    }

    /// 按标识查找会话
    pub async fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ChannelError::NotFound(id.to_string()))
    }

    /// 把外部传入的字节作为一帧写入会话通道
    pub async fn forward(&self, id: &str, frame: &[u8]) -> Result<usize> {
        let session = self.get(id).await?;

        if session.external_id().is_none() {
            if let Some(external_id) = extract_external_id(frame) {
                if session.external_id.set(external_id).is_ok() {
                    info!(session = %id, external_id, "Extracted beacon id");
                }
            }
        }

        session.channel.send_frame(frame).await
    }

    /// 从会话通道读取一帧供外部投递
    pub async fn retrieve(&self, id: &str) -> Result<Bytes> {
        let session = self.get(id).await?;
        session.channel.read_frame().await
    }

    /// 在会话通道上执行 stager 握手
    pub async fn request_stager(
        &self,
        id: &str,
        pipe_name: &str,
        is_64bit: bool,
        block_time_ms: u32,
    ) -> Result<Bytes> {
        let session = self.get(id).await?;
        debug!(session = %id, pipe_name, is_64bit, block_time_ms, "Requesting stager");
        session
            .channel
            .request_stager(pipe_name, is_64bit, block_time_ms)
            .await
    }

    /// 注销会话并关闭其通道
    pub async fn remove(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ChannelError::NotFound(id.to_string()))?;

        session.channel.close().await;
        info!(session = %id, "Session removed");
        Ok(())
    }

    /// 当前会话数
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// 所有会话标识
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// 关闭并清空所有会话
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        for (id, session) in sessions {
            session.channel.close().await;
            debug!(session = %id, "Session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameReader, FrameWriter};
    use crate::testing::{memory_channel, MemoryChannel};
    use crate::{ChannelConfig, BEACON_METADATA_LEN};

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SessionRegistry::new();
        let (channel, _peer) = memory_channel(ChannelConfig::default());

        let id = registry.create(Arc::new(channel)).await.unwrap();
        assert_eq!(id.external_id, 0);
        assert_eq!(registry.len().await, 1);

        let session = registry.get(&id.to_string()).await.unwrap();
        assert_eq!(session.id(), id);
        assert!(session.channel().is_connected());
    }

    #[tokio::test]
    async fn test_create_fails_when_channel_unreachable() {
        let registry = SessionRegistry::new();
        let channel = MemoryChannel::new("unreachable", ChannelConfig::default());

        assert!(matches!(
            registry.create(Arc::new(channel)).await,
            Err(ChannelError::Connection { .. })
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.get("0_missing").await,
            Err(ChannelError::NotFound(_))
        ));
        assert!(matches!(
            registry.forward("0_missing", b"data").await,
            Err(ChannelError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove("0_missing").await,
            Err(ChannelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_and_retrieve() {
        let registry = SessionRegistry::new();
        let (channel, peer) = memory_channel(ChannelConfig::default());
        let id = registry.create(Arc::new(channel)).await.unwrap().to_string();

        let (peer_rx, peer_tx) = tokio::io::split(peer);
        let mut listener_reader = FrameReader::new(peer_rx);
        let mut listener_writer = FrameWriter::new(peer_tx);

        let mut metadata = vec![0u8; BEACON_METADATA_LEN];
        metadata[..4].copy_from_slice(&7u32.to_le_bytes());
        registry.forward(&id, &metadata).await.unwrap();
        assert_eq!(listener_reader.read_frame().await.unwrap().len(), BEACON_METADATA_LEN);
        assert_eq!(registry.get(&id).await.unwrap().external_id(), Some(7));

        listener_writer.write_frame(b"tasking").await.unwrap();
        assert_eq!(&registry.retrieve(&id).await.unwrap()[..], b"tasking");
    }

    #[tokio::test]
    async fn test_external_id_slot_is_shared() {
        let registry = SessionRegistry::new();
        let (channel, _peer) = memory_channel(ChannelConfig::default());
        let id = registry.create(Arc::new(channel)).await.unwrap().to_string();

        let session = registry.get(&id).await.unwrap();
        session.external_id_slot().set(55).unwrap();
        assert_eq!(registry.get(&id).await.unwrap().external_id(), Some(55));
    }

    #[tokio::test]
    async fn test_request_stager_by_id() {
        let registry = SessionRegistry::new();
        let (channel, peer) = memory_channel(ChannelConfig::default());
        let id = registry.create(Arc::new(channel)).await.unwrap().to_string();

        let (peer_rx, peer_tx) = tokio::io::split(peer);
        tokio::spawn(async move {
            let mut reader = FrameReader::new(peer_rx);
            let mut writer = FrameWriter::new(peer_tx);
            for _ in 0..4 {
                reader.read_frame().await.unwrap();
            }
            writer.write_frame(b"stage").await.unwrap();
        });

        let stager = registry.request_stager(&id, "pipe", true, 100).await.unwrap();
        assert_eq!(&stager[..], b"stage");
    }

    #[tokio::test]
    async fn test_remove_closes_channel() {
        let registry = SessionRegistry::new();
        let (channel, _peer) = memory_channel(ChannelConfig::default());
        let channel: Arc<dyn FrameChannel> = Arc::new(channel);
        let id = registry.create(Arc::clone(&channel)).await.unwrap().to_string();

        registry.remove(&id).await.unwrap();
        assert!(!channel.is_connected());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_creates() {
        let registry = Arc::new(SessionRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let (channel, peer) = memory_channel(ChannelConfig::default());
                    let id = registry.create(Arc::new(channel)).await.unwrap();
                    (id, peer)
                })
            })
            .collect();

        let mut peers = Vec::new();
        for handle in handles {
            peers.push(handle.await.unwrap());
        }

        assert_eq!(registry.len().await, 16);
        registry.close_all().await;
        assert!(registry.is_empty().await);
    }
}
