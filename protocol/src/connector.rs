//! 连接器
//!
//! 持有一对帧通道（beacon 侧、C2 侧），负责连接生命周期并双向中继帧。
//!
//! 状态机: `Idle` → `Initialized` → `Running` → `Stopped`（终态）。
//! 两个方向各自运行在独立任务中，只通过停止信号和通道关闭协调；
//! 任一方向出错都会拆除整个中继。
//! beacon → C2 方向在转发元数据帧时记录 beacon 的数字 ID。

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::beacon_id::extract_external_id;
use crate::channel::FrameChannel;
use crate::error::{ChannelError, Result};

/// 连接器状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorState {
    /// 已创建，尚未初始化
    Idle = 0,
    /// 两端通道均已连接
    Initialized = 1,
    /// 正在中继
    Running = 2,
    /// 已停止（终态）
    Stopped = 3,
}

impl From<u8> for ConnectorState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectorState::Idle,
            1 => ConnectorState::Initialized,
            2 => ConnectorState::Running,
            _ => ConnectorState::Stopped,
        }
    }
}

/// 中继方向
#[derive(Clone, Copy, Debug)]
enum Direction {
    BeaconToServer,
    ServerToBeacon,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::BeaconToServer => "beacon->server",
            Direction::ServerToBeacon => "server->beacon",
        }
    }
}

/// 两个中继任务共享的状态
struct Shared {
    state: AtomicU8,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> ConnectorState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn transition(&self, from: ConnectorState, to: ConnectorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 进入 `Stopped` 并发出停止信号，返回本次调用是否真正触发了停止
    fn begin_stop(&self) -> bool {
        let previous: ConnectorState = self
            .state
            .swap(ConnectorState::Stopped as u8, Ordering::SeqCst)
            .into();
        self.stop_tx.send_replace(true);
        previous != ConnectorState::Stopped
    }
}

/// 帧中继连接器
pub struct Connector {
    label: String,
    beacon: Option<Arc<dyn FrameChannel>>,
    server: Option<Arc<dyn FrameChannel>>,
    shared: Arc<Shared>,
    external_id: Arc<OnceLock<u32>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connector {
    /// 使用一对通道创建连接器
    ///
    /// # Arguments
    /// * `label` - 日志中标识本会话的名称（通常是 beacon ID）
    /// * `beacon` - beacon 侧通道
    /// * `server` - C2 监听器侧通道
    pub fn new(
        label: impl Into<String>,
        beacon: Arc<dyn FrameChannel>,
        server: Arc<dyn FrameChannel>,
    ) -> Self {
        let mut connector = Self::empty(label);
        connector.beacon = Some(beacon);
        connector.server = Some(server);
        connector
    }

    /// 创建未配置通道的连接器，稍后通过 setter 补齐
    pub fn empty(label: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            label: label.into(),
            beacon: None,
            server: None,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectorState::Idle as u8),
                stop_tx,
            }),
            external_id: Arc::new(OnceLock::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 与外部共享 beacon 数字 ID 的存放位置（如会话注册表中的会话）
    pub fn with_external_id_slot(mut self, slot: Arc<OnceLock<u32>>) -> Self {
        self.external_id = slot;
        self
    }

    pub fn set_beacon_channel(&mut self, channel: Arc<dyn FrameChannel>) {
        self.beacon = Some(channel);
    }

    pub fn set_server_channel(&mut self, channel: Arc<dyn FrameChannel>) {
        self.server = Some(channel);
    }

    pub fn beacon_channel(&self) -> Option<&Arc<dyn FrameChannel>> {
        self.beacon.as_ref()
    }

    pub fn server_channel(&self) -> Option<&Arc<dyn FrameChannel>> {
        self.server.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 从 beacon 元数据帧中提取的数字 ID，尚未见到元数据帧时为 `None`
    pub fn external_id(&self) -> Option<u32> {
        self.external_id.get().copied()
    }

    /// 当前状态
    pub fn state(&self) -> ConnectorState {
        self.shared.state()
    }

    /// 是否正在中继
    pub fn started(&self) -> bool {
        self.state() == ConnectorState::Running
    }

    /// 校验两端通道并连接尚未连接的一端
    ///
    /// 任一步失败返回 false，状态不会进入 `Running`。
    pub async fn initialize(&self) -> bool {
        match self.state() {
            ConnectorState::Idle | ConnectorState::Initialized => {}
            ConnectorState::Running => return true,
            ConnectorState::Stopped => {
                warn!(session = %self.label, "Cannot initialize a stopped connector");
                return false;
            }
        }

        let (Some(beacon), Some(server)) = (&self.beacon, &self.server) else {
            error!(session = %self.label, "Connector is missing a channel");
            return false;
        };

        for (side, channel) in [("beacon", beacon), ("server", server)] {
            if channel.is_connected() {
                continue;
            }
            if let Err(e) = channel.connect().await {
                error!(session = %self.label, "Failed to connect {} channel: {}", side, e);
                return false;
            }
        }

        self.shared
            .transition(ConnectorState::Idle, ConnectorState::Initialized);
        let ready = self.state() == ConnectorState::Initialized;
        if ready {
            info!(session = %self.label, "Connector initialized");
        }
        ready
    }

    /// 启动双向中继
    ///
    /// 仍处于 `Idle` 时先调用 `initialize()`。两个方向各自在独立任务中循环，
    /// 本方法在任务启动后立即返回；用 `wait()` 等待中继结束。
    pub async fn go(&self) -> Result<()> {
        if self.state() == ConnectorState::Idle && !self.initialize().await {
            return Err(ChannelError::NotInitialized);
        }

        let (Some(beacon), Some(server)) = (&self.beacon, &self.server) else {
            return Err(ChannelError::NotInitialized);
        };
        if !beacon.is_connected() || !server.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        if !self
            .shared
            .transition(ConnectorState::Initialized, ConnectorState::Running)
        {
            return Err(ChannelError::NotInitialized);
        }
        info!(session = %self.label, "Relay started");

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(relay(
            Direction::BeaconToServer,
            self.label.clone(),
            Arc::clone(beacon),
            Arc::clone(server),
            Arc::clone(&self.shared),
            Some(Arc::clone(&self.external_id)),
        )));
        tasks.push(tokio::spawn(relay(
            Direction::ServerToBeacon,
            self.label.clone(),
            Arc::clone(server),
            Arc::clone(beacon),
            Arc::clone(&self.shared),
            None,
        )));

        Ok(())
    }

    /// 停止中继并关闭两端通道，可重复调用
    pub async fn stop(&self) {
        if self.shared.begin_stop() {
            info!(session = %self.label, "Stopping connector");
        }

        if let Some(beacon) = &self.beacon {
            debug!(session = %self.label, "Closing beacon channel");
            beacon.close().await;
        }
        if let Some(server) = &self.server {
            debug!(session = %self.label, "Closing server channel");
            server.close().await;
        }
    }

    /// 等待两个中继任务退出
    pub async fn wait(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(session = %self.label, "Relay task panicked: {}", e);
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        // 中继任务收到信号后自行关闭通道
        self.shared.begin_stop();
    }
}

/// 单方向中继循环
///
/// 每帧之间检查停止信号；阻塞中的读取由通道关闭唤醒。
/// 循环结束时拆除整个连接器。
async fn relay(
    direction: Direction,
    label: String,
    from: Arc<dyn FrameChannel>,
    to: Arc<dyn FrameChannel>,
    shared: Arc<Shared>,
    external_id: Option<Arc<OnceLock<u32>>>,
) {
    let mut stop_rx = shared.stop_tx.subscribe();
    let direction = direction.as_str();

    loop {
        if *stop_rx.borrow_and_update() {
            break;
        }
        if !from.is_connected() {
            info!(session = %label, direction, "Source channel disconnected");
            break;
        }

        tokio::select! {
            _ = stop_rx.changed() => break,
            result = relay_frame(from.as_ref(), to.as_ref(), external_id.as_deref(), &label) => match result {
                Ok(true) => {}
                Ok(false) => {
                    info!(session = %label, direction, "Empty frame received, stopping relay");
                    break;
                }
                Err(e) => {
                    if shared.state() == ConnectorState::Stopped {
                        debug!(session = %label, direction, "Relay ended during shutdown: {}", e);
                    } else {
                        error!(session = %label, direction, "Relay failed: {}", e);
                    }
                    break;
                }
            }
        }
    }

    if shared.begin_stop() {
        info!(session = %label, direction, "Tearing down relay");
    }
    from.close().await;
    to.close().await;
    debug!(session = %label, direction, "Relay loop exited");
}

/// 转发一帧；ID 尚未记录时检查是否为元数据帧
async fn relay_frame(
    from: &dyn FrameChannel,
    to: &dyn FrameChannel,
    external_id: Option<&OnceLock<u32>>,
    label: &str,
) -> Result<bool> {
    let Some(slot) = external_id.filter(|slot| slot.get().is_none()) else {
        return from.read_and_relay_to(to).await;
    };

    let frame = from.read_frame().await?;
    if frame.is_empty() {
        return Ok(false);
    }
    if let Some(id) = extract_external_id(&frame) {
        if slot.set(id).is_ok() {
            info!(session = %label, external_id = id, "Extracted beacon id");
        }
    }
    to.send_frame(&frame).await?;
    Ok(true)
}
