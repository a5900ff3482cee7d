//! Beacon 标识
//!
//! 由 C2 侧分配的数字 ID 和本地生成的随机 UUID 组成，渲染为 `{数字}_{UUID}`。
//! 仅作为会话关联键使用，连接器本身不依赖它。

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::TryRngCore;
use uuid::Uuid;

use crate::error::{ChannelError, Result};
use crate::BEACON_METADATA_LEN;

/// Beacon 会话标识
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BeaconId {
    /// C2 监听器分配的数字 ID，分配前为 0
    pub external_id: u32,
    /// 本地生成的随机 ID
    pub internal_id: Uuid,
}

impl BeaconId {
    /// 生成新的标识，随机源不可用时返回 `Randomness` 错误
    pub fn new() -> Result<Self> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| ChannelError::Randomness(e.to_string()))?;

        Ok(Self {
            external_id: 0,
            internal_id: uuid::Builder::from_random_bytes(bytes).into_uuid(),
        })
    }

    /// 返回带有指定数字 ID 的新标识
    pub fn with_external_id(self, external_id: u32) -> Self {
        Self {
            external_id,
            ..self
        }
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.external_id, self.internal_id)
    }
}

impl FromStr for BeaconId {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ChannelError::InvalidBeaconId(s.to_string());
        let (external, internal) = s.split_once('_').ok_or_else(invalid)?;
        Ok(Self {
            external_id: external.parse().map_err(|_| invalid())?,
            internal_id: internal.parse().map_err(|_| invalid())?,
        })
    }
}

/// 从 beacon 首个元数据帧中提取数字 ID
///
/// 元数据帧固定 132 字节，前 4 字节为小端 ID；其他长度返回 `None`。
pub fn extract_external_id(frame: &[u8]) -> Option<u32> {
    if frame.len() != BEACON_METADATA_LEN {
        return None;
    }
    let id = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    (id != 0).then_some(id)
}
