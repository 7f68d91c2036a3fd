//! # 配置管理
//!
//! 配置按 TOML 文件 → 环境变量的顺序叠加，加载完成后统一校验。
//! 校验失败属于致命错误，进程应在启动阶段直接退出。
//!
//! ```toml
//! [controller]
//! bind_address = "0.0.0.0:8082"
//! default_resource_pool = "default"
//!
//! [[controller.resource_pools]]
//! name = "default"
//! resources = [{ type = "cpu", min = 0.1, max = 64.0, default = 1.0 }]
//!
//! [agent]
//! enabled = true
//! controller_url = "http://127.0.0.1:8082"
//! ```

pub mod models;
pub mod validation;

pub use models::*;
pub use validation::{ConfigValidator, ValidationUtils};
