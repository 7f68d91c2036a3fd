use std::collections::HashMap;
use std::fmt;

use evalflow_core::{ControllerConfig, ResourcePoolConfig, SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

/// 任务请求的某类资源，`request`/`limit` 均为可选
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub request: Option<f32>,
    #[serde(default)]
    pub limit: Option<f32>,
}

impl RuntimeResource {
    pub fn new(resource_type: impl Into<String>, request: f32) -> Self {
        Self {
            resource_type: resource_type.into(),
            request: Some(request),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: f32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 资源池中某类资源的取值规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl Resource {
    fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// 命名资源池，规则按声明顺序保存
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePool {
    pub name: String,
    pub resources: Vec<Resource>,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, resources: Vec<Resource>) -> Self {
        Self {
            name: name.into(),
            resources,
        }
    }

    pub fn rule(&self, resource_type: &str) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|rule| rule.resource_type == resource_type)
    }

    /// 校验单个资源请求：类型必须有规则，`request` 与 `limit` 必须落在 [min, max] 内
    pub fn validate_resource(&self, req: &RuntimeResource) -> SchedulerResult<()> {
        let rule = self.rule(&req.resource_type).ok_or_else(|| {
            SchedulerError::invalid_resource(format!(
                "资源池 {} 未定义资源类型 {}",
                self.name, req.resource_type
            ))
        })?;

        for (field, value) in [("request", req.request), ("limit", req.limit)] {
            if let Some(value) = value {
                if !rule.contains(value) {
                    return Err(SchedulerError::invalid_resource(format!(
                        "{} 的 {field}={value} 超出范围 [{}, {}]",
                        req.resource_type, rule.min, rule.max
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn validate_resources(&self, reqs: &[RuntimeResource]) -> SchedulerResult<()> {
        reqs.iter().try_for_each(|req| self.validate_resource(req))
    }

    /// 按资源池声明顺序补全资源请求
    ///
    /// 缺失的类型填入规则默认值，资源池未定义的类型被丢弃。对已完整的列表再次补全结果不变。
    pub fn patch_resources(&self, reqs: &[RuntimeResource]) -> Vec<RuntimeResource> {
        self.resources
            .iter()
            .map(|rule| {
                reqs.iter()
                    .find(|req| req.resource_type == rule.resource_type)
                    .cloned()
                    .unwrap_or_else(|| RuntimeResource::new(rule.resource_type.clone(), rule.default))
            })
            .collect()
    }
}

impl From<&ResourcePoolConfig> for ResourcePool {
    fn from(config: &ResourcePoolConfig) -> Self {
        Self {
            name: config.name.clone(),
            resources: config
                .resources
                .iter()
                .map(|rule| Resource {
                    resource_type: rule.resource_type.clone(),
                    min: rule.min,
                    max: rule.max,
                    default: rule.default,
                })
                .collect(),
        }
    }
}

/// 控制器已知的全部资源池
#[derive(Debug, Clone)]
pub struct ResourcePoolRegistry {
    pools: HashMap<String, ResourcePool>,
    default_pool: String,
}

impl ResourcePoolRegistry {
    pub fn new(pools: Vec<ResourcePool>, default_pool: impl Into<String>) -> SchedulerResult<Self> {
        let default_pool = default_pool.into();
        let pools: HashMap<_, _> = pools
            .into_iter()
            .map(|pool| (pool.name.clone(), pool))
            .collect();
        if !pools.contains_key(&default_pool) {
            return Err(SchedulerError::config_error(format!(
                "默认资源池 {default_pool} 不存在"
            )));
        }
        Ok(Self {
            pools,
            default_pool,
        })
    }

    pub fn from_config(config: &ControllerConfig) -> SchedulerResult<Self> {
        Self::new(
            config.resource_pools.iter().map(ResourcePool::from).collect(),
            config.default_resource_pool.clone(),
        )
    }

    /// 名称为空时返回默认资源池
    pub fn get(&self, name: &str) -> SchedulerResult<&ResourcePool> {
        let name = if name.is_empty() {
            self.default_pool.as_str()
        } else {
            name
        };
        self.pools
            .get(name)
            .ok_or_else(|| SchedulerError::ResourcePoolNotFound(name.to_string()))
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceClass {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Cpu => write!(f, "CPU"),
            DeviceClass::Gpu => write!(f, "GPU"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Idle,
    Busy,
}

/// 节点上可分配的具体计算单元
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Device {
    pub id: String,
    pub class: DeviceClass,
    #[serde(rename = "type")]
    pub device_type: String,
    pub driver: String,
    pub status: DeviceStatus,
}

impl Device {
    pub fn cpu(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: DeviceClass::Cpu,
            device_type: "cpu".to_string(),
            driver: String::new(),
            status: DeviceStatus::Idle,
        }
    }

    pub fn gpu(id: impl Into<String>, device_type: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: DeviceClass::Gpu,
            device_type: device_type.into(),
            driver: driver.into(),
            status: DeviceStatus::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == DeviceStatus::Idle
    }
}

/// 一个任务需要的设备数量
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceRequest {
    pub cpu_num: usize,
    pub gpu_num: usize,
}

impl DeviceRequest {
    pub fn new(cpu_num: usize, gpu_num: usize) -> Self {
        Self { cpu_num, gpu_num }
    }

    pub fn of_class(class: DeviceClass, amount: usize) -> Self {
        match class {
            DeviceClass::Cpu => Self::new(amount, 0),
            DeviceClass::Gpu => Self::new(0, amount),
        }
    }

    pub fn amount(&self, class: DeviceClass) -> usize {
        match class {
            DeviceClass::Cpu => self.cpu_num,
            DeviceClass::Gpu => self.gpu_num,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_num == 0 && self.gpu_num == 0
    }

    /// 由资源请求换算设备数量，小数向上取整
    pub fn from_resources(resources: &[RuntimeResource]) -> Self {
        let amount = |types: &[&str]| {
            resources
                .iter()
                .filter(|r| types.contains(&r.resource_type.as_str()))
                .filter_map(|r| r.request)
                .map(|value| value.max(0.0).ceil() as usize)
                .sum::<usize>()
        };
        Self {
            cpu_num: amount(CPU_RESOURCE_TYPES),
            gpu_num: amount(GPU_RESOURCE_TYPES),
        }
    }
}

const CPU_RESOURCE_TYPES: &[&str] = &["cpu"];
const GPU_RESOURCE_TYPES: &[&str] = &["nvidia.com/gpu", "gpu"];
