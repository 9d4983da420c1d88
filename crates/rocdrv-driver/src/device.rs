//! Read-only device queries.

use serde::Serialize;

use rocdrv_core::native::{DeviceAttribute, HipStatus};
use rocdrv_core::{Dim3, StatusOr};

use crate::context::Device;
use crate::driver::{check, Driver};

/// Snapshot of the properties of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProperties {
    pub ordinal: i32,
    pub name: String,
    pub compute_capability_major: i32,
    pub compute_capability_minor: i32,
    pub multiprocessor_count: i32,
    pub max_threads_per_multiprocessor: i32,
    pub max_threads_per_block: i32,
    pub max_shared_memory_per_block: i32,
    pub max_shared_memory_per_multiprocessor: i32,
    pub max_registers_per_block: i32,
    pub warp_size: i32,
    pub max_grid_dims: Dim3,
    pub ecc_enabled: bool,
    pub total_memory: u64,
    pub pci_bus_id: Option<String>,
}

impl Driver {
    pub fn get_device_count(&self) -> StatusOr<i32> {
        self.enter("get_device_count")?;
        check("hipGetDeviceCount", self.native().device_get_count(), String::new)
    }

    pub fn get_device(&self, ordinal: i32) -> StatusOr<Device> {
        self.enter("get_device")?;
        let raw = check("hipDeviceGet", self.native().device_get(ordinal), || {
            format!("ordinal={ordinal}")
        })?;
        Ok(Device::new(raw, ordinal))
    }

    pub fn get_driver_version(&self) -> StatusOr<i32> {
        self.enter("get_driver_version")?;
        check("hipDriverGetVersion", self.native().driver_get_version(), String::new)
    }

    pub fn get_device_name(&self, device: Device) -> StatusOr<String> {
        self.enter("get_device_name")?;
        check("hipDeviceGetName", self.native().device_get_name(device.raw()), || {
            format!("device={}", device.ordinal())
        })
    }

    pub fn get_compute_capability(&self, device: Device) -> StatusOr<(i32, i32)> {
        self.enter("get_compute_capability")?;
        check("hipDeviceComputeCapability", self.native().device_compute_capability(device.raw()), || {
            format!("device={}", device.ordinal())
        })
    }

    fn device_attribute(&self, operation: &'static str, attribute: DeviceAttribute, device: Device) -> StatusOr<i32> {
        self.enter(operation)?;
        check("hipDeviceGetAttribute", self.native().device_get_attribute(attribute, device.raw()), || {
            format!("device={} attribute={:?}", device.ordinal(), attribute)
        })
    }

    pub fn get_multiprocessor_count(&self, device: Device) -> StatusOr<i32> {
        self.device_attribute("get_multiprocessor_count", DeviceAttribute::MultiprocessorCount, device)
    }

    pub fn get_max_threads_per_multiprocessor(&self, device: Device) -> StatusOr<i32> {
        self.device_attribute(
            "get_max_threads_per_multiprocessor",
            DeviceAttribute::MaxThreadsPerMultiprocessor,
            device,
        )
    }

    pub fn get_max_threads_per_block(&self, device: Device) -> StatusOr<i32> {
        self.device_attribute("get_max_threads_per_block", DeviceAttribute::MaxThreadsPerBlock, device)
    }

    pub fn get_max_shared_memory_per_block(&self, device: Device) -> StatusOr<i32> {
        self.device_attribute(
            "get_max_shared_memory_per_block",
            DeviceAttribute::MaxSharedMemoryPerBlock,
            device,
        )
    }

    pub fn get_max_shared_memory_per_core(&self, device: Device) -> StatusOr<i32> {
        self.device_attribute(
            "get_max_shared_memory_per_core",
            DeviceAttribute::MaxSharedMemoryPerMultiprocessor,
            device,
        )
    }

    pub fn get_max_registers_per_block(&self, device: Device) -> StatusOr<i32> {
        self.device_attribute("get_max_registers_per_block", DeviceAttribute::MaxRegistersPerBlock, device)
    }

    pub fn get_warp_size(&self, device: Device) -> StatusOr<i32> {
        self.device_attribute("get_warp_size", DeviceAttribute::WarpSize, device)
    }

    pub fn get_grid_limits(&self, device: Device) -> StatusOr<Dim3> {
        let x = self.device_attribute("get_grid_limits", DeviceAttribute::MaxGridDimX, device)?;
        let y = self.device_attribute("get_grid_limits", DeviceAttribute::MaxGridDimY, device)?;
        let z = self.device_attribute("get_grid_limits", DeviceAttribute::MaxGridDimZ, device)?;
        Ok(Dim3::new(x.max(0) as u32, y.max(0) as u32, z.max(0) as u32))
    }

    pub fn is_ecc_enabled(&self, device: Device) -> StatusOr<bool> {
        self.device_attribute("is_ecc_enabled", DeviceAttribute::EccEnabled, device)
            .map(|v| v != 0)
    }

    pub fn get_device_total_memory(&self, device: Device) -> StatusOr<u64> {
        self.enter("get_device_total_memory")?;
        check("hipDeviceTotalMem", self.native().device_total_mem(device.raw()), || {
            format!("device={}", device.ordinal())
        })
        .map(|bytes| bytes as u64)
    }

    /// PCI bus id in lower case, e.g. `0000:03:00.0`.
    pub fn get_pci_bus_id(&self, device: Device) -> StatusOr<String> {
        self.enter("get_pci_bus_id")?;
        check("hipDeviceGetPCIBusId", self.native().device_get_pci_bus_id(device.raw()), || {
            format!("device={}", device.ordinal())
        })
        .map(|id| id.to_ascii_lowercase())
    }

    /// Gathers every device query for `ordinal` into one snapshot.
    pub fn get_device_properties(&self, ordinal: i32) -> StatusOr<DeviceProperties> {
        let device = self.get_device(ordinal)?;
        let (major, minor) = self.get_compute_capability(device)?;
        let pci_bus_id = match self.native().device_get_pci_bus_id(device.raw()) {
            Ok(id) => Some(id.to_ascii_lowercase()),
            Err(HipStatus::ERROR_NOT_SUPPORTED) => None,
            Err(status) => {
                return check("hipDeviceGetPCIBusId", Err(status), || format!("device={ordinal}"));
            }
        };
        Ok(DeviceProperties {
            ordinal,
            name: self.get_device_name(device)?,
            compute_capability_major: major,
            compute_capability_minor: minor,
            multiprocessor_count: self.get_multiprocessor_count(device)?,
            max_threads_per_multiprocessor: self.get_max_threads_per_multiprocessor(device)?,
            max_threads_per_block: self.get_max_threads_per_block(device)?,
            max_shared_memory_per_block: self.get_max_shared_memory_per_block(device)?,
            max_shared_memory_per_multiprocessor: self.get_max_shared_memory_per_core(device)?,
            max_registers_per_block: self.get_max_registers_per_block(device)?,
            warp_size: self.get_warp_size(device)?,
            max_grid_dims: self.get_grid_limits(device)?,
            ecc_enabled: self.is_ecc_enabled(device)?,
            total_memory: self.get_device_total_memory(device)?,
            pci_bus_id,
        })
    }
}
