//! beacon 帧中继共享协议库
//!
//! 包含:
//! - 帧编解码 (FrameReader, FrameWriter)
//! - 传输层抽象 (Transport trait)
//! - 帧通道契约 (FrameChannel) 与字节流实现 (StreamChannel)
//! - Beacon 标识 (BeaconId)
//! - 连接器 (Connector)
//! - 会话注册表 (SessionRegistry)

mod beacon_id;
mod channel;
mod codec;
mod connector;
mod constants;
mod error;
mod session;
mod transport;

#[cfg(test)]
mod testing;

pub use beacon_id::{extract_external_id, BeaconId};
pub use channel::{FrameChannel, PipeChannel, StreamChannel, TcpChannel};
pub use codec::{FrameReader, FrameWriter, OversizePolicy};
pub use connector::{Connector, ConnectorState};
pub use constants::*;
pub use error::{ChannelError, Result};
pub use session::{Session, SessionRegistry};
pub use transport::{
    ChannelConfig, PipeTransport, TcpListener, TcpTransport, Transport, TransportListener,
};
