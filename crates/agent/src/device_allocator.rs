//! 节点设备分配
//!
//! 设备表与持有关系在同一把锁下修改，分配要么全部成功要么不改变任何设备。
//! 设备不足时立即失败，不等待其他任务释放。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use evalflow_core::AgentConfig;
use evalflow_domain::{Device, DeviceClass, DeviceRequest, DeviceStatus, SchedulerError, SchedulerResult};

#[derive(Default)]
struct DeviceTable {
    devices: Vec<Device>,
    /// 设备 id -> 持有该设备的任务 id
    holders: HashMap<String, i64>,
}

impl DeviceTable {
    fn count(&self, class: DeviceClass, idle_only: bool) -> usize {
        self.devices
            .iter()
            .filter(|d| d.class == class && (!idle_only || d.is_idle()))
            .count()
    }
}

pub struct DeviceAllocator {
    table: Mutex<DeviceTable>,
    ready: AtomicBool,
}

impl DeviceAllocator {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            table: Mutex::new(DeviceTable {
                devices,
                holders: HashMap::new(),
            }),
            ready: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let mut devices: Vec<Device> = (0..config.devices.cpu_slots)
            .map(|slot| Device::cpu(format!("cpu-{slot}")))
            .collect();
        devices.extend(
            config
                .devices
                .gpus
                .iter()
                .map(|gpu| Device::gpu(gpu.id.clone(), gpu.gpu_type.clone(), gpu.driver.clone())),
        );
        Self::new(devices)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// 为任务分配设备
    ///
    /// 请求数量超过节点总量返回 [`SchedulerError::InvalidResource`]，
    /// 空闲数量不足返回 [`SchedulerError::InsufficientResource`]。
    pub async fn allocate(&self, task_id: i64, request: DeviceRequest) -> SchedulerResult<Vec<Device>> {
        let mut table = self.table.lock().await;

        for class in [DeviceClass::Cpu, DeviceClass::Gpu] {
            let requested = request.amount(class);
            if requested == 0 {
                continue;
            }
            let total = table.count(class, false);
            if requested > total {
                return Err(SchedulerError::invalid_resource(format!(
                    "任务 {task_id} 需要 {requested} 个 {class}，节点只有 {total} 个"
                )));
            }
            let available = table.count(class, true);
            if requested > available {
                return Err(SchedulerError::InsufficientResource {
                    class: class.to_string(),
                    requested,
                    available,
                });
            }
        }

        let mut allocated = Vec::with_capacity(request.cpu_num + request.gpu_num);
        let mut wanted = request;
        let DeviceTable { devices, holders } = &mut *table;
        for device in devices.iter_mut().filter(|d| d.is_idle()) {
            let remaining = match device.class {
                DeviceClass::Cpu => &mut wanted.cpu_num,
                DeviceClass::Gpu => &mut wanted.gpu_num,
            };
            if *remaining == 0 {
                continue;
            }
            *remaining -= 1;
            device.status = DeviceStatus::Busy;
            holders.insert(device.id.clone(), task_id);
            allocated.push(device.clone());
        }

        debug!("任务 {} 分配设备 {:?}", task_id, allocated.iter().map(|d| &d.id).collect::<Vec<_>>());
        Ok(allocated)
    }

    /// 恢复重启前任务持有的设备
    pub async fn reserve(&self, task_id: i64, devices: &[Device]) {
        let mut table = self.table.lock().await;
        let DeviceTable {
            devices: table_devices,
            holders,
        } = &mut *table;
        for held in devices {
            match table_devices.iter_mut().find(|d| d.id == held.id) {
                Some(device) => {
                    device.status = DeviceStatus::Busy;
                    holders.insert(device.id.clone(), task_id);
                }
                None => warn!("任务 {} 持有的设备 {} 已不在节点上", task_id, held.id),
            }
        }
    }

    /// 释放任务持有的所有设备，重复释放没有副作用
    pub async fn release(&self, task_id: i64) -> usize {
        let mut table = self.table.lock().await;
        let DeviceTable { devices, holders } = &mut *table;
        let mut released = 0;
        for device in devices.iter_mut() {
            if holders.get(&device.id) == Some(&task_id) {
                holders.remove(&device.id);
                device.status = DeviceStatus::Idle;
                released += 1;
            }
        }
        if released > 0 {
            debug!("任务 {} 释放 {} 个设备", task_id, released);
        }
        released
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.table.lock().await.devices.clone()
    }

    pub async fn idle_count(&self) -> usize {
        self.table
            .lock()
            .await
            .devices
            .iter()
            .filter(|d| d.is_idle())
            .count()
    }
}
