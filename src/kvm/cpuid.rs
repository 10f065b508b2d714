//! CPUID filtering.
//!
//! The supported-CPUID table from the host is rewritten per vCPU before it
//! is handed to the guest: a stable vendor string, the hypervisor bit, no
//! hyperthreading, no PMU, no frequency management, and a topology that
//! matches the configured vCPU count instead of the host's.

use kvm_bindings::CpuId;

// Leaf 0x1 ECX/EDX bits.
const ECX_HYPERVISOR_SHIFT: u32 = 31;
const EDX_HTT_SHIFT: u32 = 28;

// Leaf 0x1 EBX fields.
const EBX_CPU_COUNT_SHIFT: u32 = 16;
const EBX_APICID_SHIFT: u32 = 24;

// Leaf 0x4: cache sharing fields in EAX.
const EAX_MAX_IDS_SHARING_CACHE_SHIFT: u32 = 14;
const EAX_MAX_IDS_IN_PACKAGE_SHIFT: u32 = 26;

// Leaf 0x6: turbo boost (EAX) and energy-performance bias (ECX).
const EAX_TURBO_BOOST_SHIFT: u32 = 1;
const ECX_EPB_SHIFT: u32 = 3;

// Leaf 0xB level types.
const LEVEL_TYPE_SHIFT: u32 = 8;
const LEVEL_TYPE_CORE: u32 = 2;

/// APIC id bits consumed below the core level in leaf 0xB index 1.
const LEAFBH_INDEX1_APICID_SHIFT: u32 = 6;

/// Rewrite the host CPUID table for one vCPU.
pub fn filter_cpuid(cpuid: &mut CpuId, cpu_id: u8, ncpus: u8) {
    for entry in cpuid.as_mut_slice().iter_mut() {
        match entry.function {
            0x0 => {
                // "GenuineIntel" in the EBX:EDX:ECX register order.
                entry.ebx = u32::from_le_bytes(*b"Genu");
                entry.edx = u32::from_le_bytes(*b"ineI");
                entry.ecx = u32::from_le_bytes(*b"ntel");
            }
            0x1 => {
                entry.ecx |= 1 << ECX_HYPERVISOR_SHIFT;
                entry.edx &= !(1 << EDX_HTT_SHIFT);
                entry.ebx = (entry.ebx & 0x0000_ffff)
                    | (u32::from(ncpus) << EBX_CPU_COUNT_SHIFT)
                    | (u32::from(cpu_id) << EBX_APICID_SHIFT);
            }
            0x4 => {
                // No cache sharing across the host's real topology.
                entry.eax &= !(0xfff << EAX_MAX_IDS_SHARING_CACHE_SHIFT);
                entry.eax &= !(0x3f << EAX_MAX_IDS_IN_PACKAGE_SHIFT);
            }
            0x6 => {
                entry.eax &= !(1 << EAX_TURBO_BOOST_SHIFT);
                entry.ecx &= !(1 << ECX_EPB_SHIFT);
            }
            0xa => {
                // Architectural performance monitoring: off.
                entry.eax = 0;
                entry.ebx = 0;
                entry.ecx = 0;
                entry.edx = 0;
            }
            0xb => {
                // Rebuild the topology: one thread per core, ncpus cores.
                entry.edx = u32::from(cpu_id);
                match entry.index {
                    0 => {
                        entry.eax = 0;
                        entry.ebx = 1;
                        entry.ecx = LEVEL_TYPE_CORE << LEVEL_TYPE_SHIFT;
                    }
                    1 => {
                        entry.eax = LEAFBH_INDEX1_APICID_SHIFT;
                        entry.ebx = u32::from(ncpus);
                        entry.ecx = entry.index;
                    }
                    _ => {
                        entry.eax = 0;
                        entry.ebx = 0;
                        entry.ecx = entry.index;
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::kvm_cpuid_entry2;

    fn entry(function: u32, index: u32) -> kvm_cpuid_entry2 {
        kvm_cpuid_entry2 {
            function,
            index,
            eax: 0xffff_ffff,
            ebx: 0xffff_ffff,
            ecx: 0xffff_ffff,
            edx: 0xffff_ffff,
            ..Default::default()
        }
    }

    fn filtered(cpu_id: u8, ncpus: u8) -> CpuId {
        let entries = [
            entry(0x0, 0),
            entry(0x1, 0),
            entry(0x4, 0),
            entry(0x6, 0),
            entry(0xa, 0),
            entry(0xb, 0),
            entry(0xb, 1),
            entry(0xb, 2),
        ];
        let mut cpuid = CpuId::from_entries(&entries).unwrap();
        filter_cpuid(&mut cpuid, cpu_id, ncpus);
        cpuid
    }

    fn find(cpuid: &CpuId, function: u32, index: u32) -> kvm_cpuid_entry2 {
        *cpuid
            .as_slice()
            .iter()
            .find(|e| e.function == function && e.index == index)
            .unwrap()
    }

    #[test]
    fn test_vendor_string() {
        let cpuid = filtered(0, 1);
        let leaf0 = find(&cpuid, 0x0, 0);
        assert_eq!(&leaf0.ebx.to_le_bytes(), b"Genu");
        assert_eq!(&leaf0.edx.to_le_bytes(), b"ineI");
        assert_eq!(&leaf0.ecx.to_le_bytes(), b"ntel");
    }

    #[test]
    fn test_hypervisor_set_htt_clear() {
        let cpuid = filtered(0, 1);
        let leaf1 = find(&cpuid, 0x1, 0);
        assert_ne!(leaf1.ecx & (1 << 31), 0, "HYPERVISOR must be set");
        assert_eq!(leaf1.edx & (1 << 28), 0, "HTT must be clear");
        assert_eq!((leaf1.ebx >> 16) & 0xff, 1, "one logical processor");
    }

    #[test]
    fn test_pmu_disabled() {
        let cpuid = filtered(0, 1);
        let leaf = find(&cpuid, 0xa, 0);
        assert_eq!(
            (leaf.eax, leaf.ebx, leaf.ecx, leaf.edx),
            (0, 0, 0, 0)
        );
    }

    #[test]
    fn test_turbo_and_epb_cleared() {
        let cpuid = filtered(0, 1);
        let leaf = find(&cpuid, 0x6, 0);
        assert_eq!(leaf.eax & (1 << 1), 0);
        assert_eq!(leaf.ecx & (1 << 3), 0);
    }

    #[test]
    fn test_cache_sharing_zeroed() {
        let cpuid = filtered(0, 1);
        let leaf = find(&cpuid, 0x4, 0);
        assert_eq!((leaf.eax >> 14) & 0xfff, 0);
        assert_eq!((leaf.eax >> 26) & 0x3f, 0);
    }

    #[test]
    fn test_topology_per_cpu() {
        let cpuid = filtered(2, 4);
        let idx0 = find(&cpuid, 0xb, 0);
        assert_eq!(idx0.ebx, 1);
        assert_eq!(idx0.ecx, 2 << 8);
        assert_eq!(idx0.edx, 2, "EDX carries the x2APIC id");

        let idx1 = find(&cpuid, 0xb, 1);
        assert_eq!(idx1.eax, 6);
        assert_eq!(idx1.ebx, 4, "core level reports all vCPUs");
        assert_eq!(idx1.ecx, 1);

        let idx2 = find(&cpuid, 0xb, 2);
        assert_eq!(idx2.ebx, 0);
        assert_eq!(idx2.ecx, 2);
    }
}
