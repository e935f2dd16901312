/// vCPU exit dispatch for the sparkler VMM
use crate::devices::{DeviceError, PortIo, PortIoBus};
use crate::session::VmSession;
use kvm_ioctls::VcpuExit;
use log::{debug, info};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("KVM_RUN: {0}")]
    Resume(#[source] kvm_ioctls::Error),

    #[error("KVM_EXIT_FAIL_ENTRY: hardware_entry_failure_reason = 0x{0:x}")]
    FailEntry(u64),

    #[error("KVM_EXIT_INTERNAL_ERROR: suberror = 0x{0:x}")]
    InternalError(u32),

    #[error("unhandled exit reason: {0}")]
    UnhandledExit(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

enum Flow {
    Continue,
    Halted,
}

/// Drives the single vCPU until the guest halts or something fatal happens.
pub struct VcpuManager<'a> {
    session: &'a mut VmSession,
    bus: &'a mut PortIoBus,
    exits: u64,
}

impl<'a> VcpuManager<'a> {
    pub fn new(session: &'a mut VmSession, bus: &'a mut PortIoBus) -> Self {
        Self {
            session,
            bus,
            exits: 0,
        }
    }

    /// Run the vCPU until `hlt`. Every other way out is an error.
    pub fn run(&mut self) -> Result<(), DispatchError> {
        info!("vCPU 0 run loop starting");
        loop {
            match self.dispatch_one()? {
                Flow::Continue => continue,
                Flow::Halted => {
                    info!("KVM_EXIT_HLT after {} exits", self.exits);
                    return Ok(());
                }
            }
        }
    }

    /// Resume the guest once and handle the exit it comes back with.
    fn dispatch_one(&mut self) -> Result<Flow, DispatchError> {
        let exit = self
            .session
            .vcpu_mut()
            .run()
            .map_err(DispatchError::Resume)?;
        self.exits += 1;

        match exit {
            VcpuExit::Hlt => Ok(Flow::Halted),
            VcpuExit::IoOut(port, data) => {
                debug!("io out: port=0x{:x} data={:02x?}", port, data);
                self.bus.transfer(port, PortIo::Out(data))?;
                Ok(Flow::Continue)
            }
            VcpuExit::IoIn(port, data) => {
                self.bus.transfer(port, PortIo::In(&mut *data))?;
                debug!("io in: port=0x{:x} data={:02x?}", port, data);
                Ok(Flow::Continue)
            }
            VcpuExit::FailEntry(reason, _cpu) => Err(DispatchError::FailEntry(reason)),
            VcpuExit::InternalError => Err(DispatchError::InternalError(
                self.session.internal_error_code(),
            )),
            other => Err(DispatchError::UnhandledExit(format!("{:?}", other))),
        }
    }
}
