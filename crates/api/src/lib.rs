//! # EvalFlow API
//!
//! 控制器对外的 HTTP 接口：Agent 与执行器的状态上报、作业提交与取消。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use response::ApiResponse;
pub use routes::{create_routes, AppState};

use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::info;

/// 启动 HTTP 服务，收到关闭信号后优雅退出
pub async fn serve(
    state: AppState,
    bind_address: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("无效的监听地址 {}: {}", bind_address, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API 服务监听 {}", addr);

    axum::serve(listener, create_routes(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("API 服务收到关闭信号");
        })
        .await?;
    Ok(())
}
