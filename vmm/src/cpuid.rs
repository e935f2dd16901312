/// CPUID leaf filtering for the guest vCPU
use kvm_bindings::kvm_cpuid_entry2;
use std::arch::x86_64::{CpuidResult, __cpuid};
use std::ops::RangeInclusive;

/// Extended leaves holding the 48-byte processor brand string.
pub const BRAND_STRING_LEAVES: RangeInclusive<u32> = 0x8000_0002..=0x8000_0004;

/// Execute `cpuid` on the host.
pub fn host_cpuid(leaf: u32) -> CpuidResult {
    // SAFETY: cpuid is available on every x86_64 CPU.
    unsafe { __cpuid(leaf) }
}

/// Replace the brand-string leaves of `entries` with the values returned by
/// `query`, leaving every other leaf as KVM reported it. Returns how many
/// entries were rewritten.
pub fn apply_host_brand<F>(entries: &mut [kvm_cpuid_entry2], query: F) -> usize
where
    F: Fn(u32) -> CpuidResult,
{
    let mut patched = 0;
    for entry in entries
        .iter_mut()
        .filter(|e| BRAND_STRING_LEAVES.contains(&e.function))
    {
        let host = query(entry.function);
        entry.eax = host.eax;
        entry.ebx = host.ebx;
        entry.ecx = host.ecx;
        entry.edx = host.edx;
        patched += 1;
    }
    patched
}
