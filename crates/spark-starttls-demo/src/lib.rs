#![doc = r#"
# spark-starttls-demo

## 设计动机（Why）
- 以最小的行协议演示 `spark-transport-starttls` 的完整使用路径：明文建连、协商、原地升级、
  在加密通道上继续同一会话、关闭；
- 演示代码同时充当集成测试的参照实现，服务端会话与客户端流程都以库函数暴露。

## 协议（What）
- 客户端发送 `PING`，服务端回复 `PONG`；
- 客户端发送 `STARTTLS` 后双方各自调用 `Writer::upgrade`，之后的字节全部加密；
- 客户端发送 `QUIT`，服务端关闭连接；
- 指令按行分隔，解析时忽略大小写与首尾空白；无法识别的指令得到 `ERR` 应答。

## 启动（How）
- [`cli::Cli`] 解析命令行，合并 `--config` 指定的 TOML 与命令行上的证书路径；
- [`init_tracing`] 安装 `fmt + EnvFilter`，默认级别 `info`，可用 `RUST_LOG` 覆盖。
"#]

pub mod cli;
pub mod client;
pub mod protocol;
pub mod server;

use tracing_subscriber::EnvFilter;

/// 安装全局日志订阅者；重复调用时保留已安装的订阅者。
pub fn init_tracing() {
    if tracing_subscriber::fmt()
        .with_env_filter(build_env_filter())
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already installed, keeping it");
    }
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
