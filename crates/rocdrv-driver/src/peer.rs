use tracing::{debug, error};

use rocdrv_core::native::HipStatus;
use rocdrv_core::{DriverError, Status};

use crate::context::Context;
use crate::driver::{check, Driver};

impl Driver {
    /// Whether `from` may be granted access to memory owned by `to`. A device
    /// can always access its own memory, so contexts on the same device always
    /// qualify. Unknown or destroyed contexts and query failures read as `false`.
    pub fn can_enable_peer_access(&self, from: &Context, to: &Context) -> bool {
        let entries = self
            .enter("can_enable_peer_access")
            .and_then(|()| self.context_entry(from))
            .and_then(|a| self.context_entry(to).map(|b| (a, b)));
        let (a, b) = match entries {
            Ok((a, b)) => (a.device, b.device),
            Err(e) => {
                error!("can_enable_peer_access: {}", e);
                return false;
            }
        };
        if a.ordinal() == b.ordinal() {
            return true;
        }
        match self.native().device_can_access_peer(a.raw(), b.raw()) {
            Ok(can) => can,
            Err(status) => {
                error!(
                    "hipDeviceCanAccessPeer failed: {} (device {} -> device {})",
                    status,
                    a.ordinal(),
                    b.ordinal()
                );
                false
            }
        }
    }

    /// Grants `from` access to `to`'s memory. One-directional and not reversible;
    /// a grant that already exists, or one between contexts on the same device,
    /// counts as success.
    pub fn enable_peer_access(&self, from: &Context, to: &Context) -> Status {
        self.enter("enable_peer_access")?;
        let from_device = self.context_entry(from)?.device;
        let to_raw = {
            let entry = self.context_entry(to)?;
            if entry.device.ordinal() == from_device.ordinal() {
                return Ok(());
            }
            entry.raw
        };
        if !self.can_enable_peer_access(from, to) {
            error!("peer access from context {} to context {} is not supported", from.id(), to.id());
            return Err(DriverError::Native {
                operation: "enable_peer_access",
                status: HipStatus::ERROR_PEER_ACCESS_UNSUPPORTED,
                message: format!("context {} cannot access context {}", from.id(), to.id()),
            });
        }
        let _guard = self.activate(from, "enable_peer_access")?;
        match self.native().ctx_enable_peer_access(to_raw, 0) {
            Ok(()) | Err(HipStatus::ERROR_PEER_ACCESS_ALREADY_ENABLED) => {
                debug!("peer access enabled: context {} -> context {}", from.id(), to.id());
                Ok(())
            }
            Err(status) => check("hipCtxEnablePeerAccess", Err(status), || {
                format!("from={} to={}", from.id(), to.id())
            }),
        }
    }
}
