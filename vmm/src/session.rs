/// VM session: KVM handle, VM, vCPU and guest memory for one guest run
use crate::config::VmmConfig;
use crate::cpuid::{apply_host_brand, host_cpuid};
use kvm_bindings::{kvm_run, kvm_userspace_memory_region, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use log::{debug, info};
use std::fmt;
use std::os::fd::AsRawFd;
use thiserror::Error;
use vm_memory::{Address, GuestAddress, GuestMemory, GuestMemoryMmap, GuestMemoryRegion};

/// Architecturally reserved RFLAGS bit 1 must always be set.
const RFLAGS_RESERVED: u64 = 0x2;

/// KVM setup steps, named in [`SessionError`] diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    OpenKvm,
    CreateVm,
    SetUserMemoryRegion,
    CreateVcpu,
    GetVcpuMmapSize,
    GetSupportedCpuid,
    SetCpuid,
    GetSregs,
    SetSregs,
    SetRegs,
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStep::OpenKvm => "/dev/kvm",
            SetupStep::CreateVm => "KVM_CREATE_VM",
            SetupStep::SetUserMemoryRegion => "KVM_SET_USER_MEMORY_REGION",
            SetupStep::CreateVcpu => "KVM_CREATE_VCPU",
            SetupStep::GetVcpuMmapSize => "KVM_GET_VCPU_MMAP_SIZE",
            SetupStep::GetSupportedCpuid => "KVM_GET_SUPPORTED_CPUID",
            SetupStep::SetCpuid => "KVM_SET_CPUID2",
            SetupStep::GetSregs => "KVM_GET_SREGS",
            SetupStep::SetSregs => "KVM_SET_SREGS",
            SetupStep::SetRegs => "KVM_SET_REGS",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{step}: {source}")]
    Kvm {
        step: SetupStep,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("allocating guest memory: {0}")]
    GuestMemory(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("KVM_GET_VCPU_MMAP_SIZE unexpectedly small ({actual} < {required} bytes)")]
    RunStateTooSmall { actual: usize, required: usize },
}

trait SetupContext<T> {
    fn step(self, step: SetupStep) -> Result<T, SessionError>;
}

impl<T> SetupContext<T> for Result<T, kvm_ioctls::Error> {
    fn step(self, step: SetupStep) -> Result<T, SessionError> {
        self.map_err(|source| SessionError::Kvm { step, source })
    }
}

/// Owns every kernel object of the VM.
///
/// Fields drop in declaration order, which releases the vCPU (and its mapped
/// `kvm_run`) first, then guest memory, the VM and finally the KVM handle.
pub struct VmSession {
    vcpu: VcpuFd,
    guest_memory: GuestMemoryMmap<()>,
    vm: VmFd,
    kvm: Kvm,
}

impl VmSession {
    pub fn create(config: &VmmConfig) -> Result<Self, SessionError> {
        let kvm = Kvm::new().step(SetupStep::OpenKvm)?;
        let vm = kvm.create_vm().step(SetupStep::CreateVm)?;
        info!("Created KVM VM: fd={}", vm.as_raw_fd());

        let guest_base = GuestAddress(config.guest_base);
        let guest_memory = GuestMemoryMmap::from_ranges(&[(guest_base, config.mem_size)])
            .map_err(|e| SessionError::GuestMemory(Box::new(e)))?;
        setup_memory(&vm, &guest_memory)?;

        let vcpu = vm.create_vcpu(0).step(SetupStep::CreateVcpu)?;

        // kvm-ioctls maps kvm_run itself; make sure the kernel's area covers it.
        let mmap_size = kvm
            .get_vcpu_mmap_size()
            .step(SetupStep::GetVcpuMmapSize)?;
        let required = std::mem::size_of::<kvm_run>();
        if mmap_size < required {
            return Err(SessionError::RunStateTooSmall {
                actual: mmap_size,
                required,
            });
        }
        debug!("vCPU run-state mapping: {} bytes", mmap_size);

        setup_cpuid(&kvm, &vcpu)?;
        setup_registers(&vcpu, config.guest_base)?;

        info!(
            "VM session ready: memory={}KiB at GPA 0x{:x}, entry=0x{:x}",
            config.mem_size >> 10,
            config.guest_base,
            config.guest_base
        );

        Ok(Self {
            vcpu,
            guest_memory,
            vm,
            kvm,
        })
    }

    pub fn guest_memory(&self) -> &GuestMemoryMmap<()> {
        &self.guest_memory
    }

    pub fn vcpu_mut(&mut self) -> &mut VcpuFd {
        &mut self.vcpu
    }

    /// Suberror code of the last `KVM_EXIT_INTERNAL_ERROR`.
    pub fn internal_error_code(&mut self) -> u32 {
        let run = self.vcpu.get_kvm_run();
        // SAFETY: only called after KVM reported an internal-error exit, which
        // makes `internal` the active member of the exit union.
        unsafe { run.__bindgen_anon_1.internal.suberror }
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        debug!(
            "Releasing VM session (vm fd={}, kvm fd={})",
            self.vm.as_raw_fd(),
            self.kvm.as_raw_fd()
        );
    }
}

/// Register every guest memory region as a KVM memory slot.
fn setup_memory(vm: &VmFd, guest_memory: &GuestMemoryMmap<()>) -> Result<(), SessionError> {
    for (slot, region) in guest_memory.iter().enumerate() {
        let mem_region = kvm_userspace_memory_region {
            slot: slot as u32,
            flags: 0,
            guest_phys_addr: region.start_addr().raw_value(),
            memory_size: region.len(),
            userspace_addr: region.as_ptr() as u64,
        };

        // SAFETY: the region is owned by the session and outlives the VM fd
        // it is registered with; its host mapping never moves.
        unsafe { vm.set_user_memory_region(mem_region) }.step(SetupStep::SetUserMemoryRegion)?;

        info!(
            "Mapped slot {}: GPA 0x{:x}, size 0x{:x}",
            slot, mem_region.guest_phys_addr, mem_region.memory_size
        );
    }
    Ok(())
}

fn setup_cpuid(kvm: &Kvm, vcpu: &VcpuFd) -> Result<(), SessionError> {
    let mut cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .step(SetupStep::GetSupportedCpuid)?;
    let patched = apply_host_brand(cpuid.as_mut_slice(), host_cpuid);
    debug!(
        "CPUID: {} leaves, {} brand-string leaves from host",
        cpuid.as_slice().len(),
        patched
    );
    vcpu.set_cpuid2(&cpuid).step(SetupStep::SetCpuid)
}

/// Flat real-mode start: CS base and selector 0, execution at `entry`.
fn setup_registers(vcpu: &VcpuFd, entry: u64) -> Result<(), SessionError> {
    let mut sregs = vcpu.get_sregs().step(SetupStep::GetSregs)?;
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    vcpu.set_sregs(&sregs).step(SetupStep::SetSregs)?;

    let regs = kvm_bindings::kvm_regs {
        rip: entry,
        rflags: RFLAGS_RESERVED,
        ..Default::default()
    };
    vcpu.set_regs(&regs).step(SetupStep::SetRegs)
}
