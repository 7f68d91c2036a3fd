use crate::{SchedulerError, SchedulerResult};

/// 配置校验接口
pub trait ConfigValidator {
    fn validate(&self) -> SchedulerResult<()>;
}

/// 常用的字段校验工具
pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field: &str) -> SchedulerResult<()> {
        if value.trim().is_empty() {
            return Err(SchedulerError::config_error(format!("{field} 不能为空")));
        }
        Ok(())
    }

    pub fn validate_interval_ms(value: u64, field: &str) -> SchedulerResult<()> {
        if value == 0 || value > 3_600_000 {
            return Err(SchedulerError::config_error(format!(
                "{field} 必须在 1 到 3600000 毫秒之间，当前值: {value}"
            )));
        }
        Ok(())
    }

    pub fn validate_bind_address(value: &str, field: &str) -> SchedulerResult<()> {
        value
            .parse::<std::net::SocketAddr>()
            .map(|_| ())
            .map_err(|e| SchedulerError::config_error(format!("{field} 不是合法的监听地址 {value}: {e}")))
    }

    pub fn validate_url(value: &str, field: &str) -> SchedulerResult<()> {
        Self::validate_not_empty(value, field)?;
        if !(value.starts_with("http://") || value.starts_with("https://")) {
            return Err(SchedulerError::config_error(format!(
                "{field} 必须以 http:// 或 https:// 开头: {value}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_utils() {
        assert!(ValidationUtils::validate_not_empty("agent-1", "agent.serial_number").is_ok());
        assert!(ValidationUtils::validate_not_empty("  ", "agent.serial_number").is_err());
        assert!(ValidationUtils::validate_interval_ms(0, "agent.report_interval_ms").is_err());
        assert!(ValidationUtils::validate_bind_address("0.0.0.0:8080", "controller.bind_address").is_ok());
        assert!(ValidationUtils::validate_bind_address("localhost", "controller.bind_address").is_err());
        assert!(ValidationUtils::validate_url("ftp://x", "agent.controller_url").is_err());
    }
}
