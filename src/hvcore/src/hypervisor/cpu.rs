//! Processor identification.

use bit_field::BitField;

use super::error::HvError;

/// What the hypervisor needs to know about the processor it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    /// The vendor identification string, eg, `AuthenticAMD`.
    pub vendor: [u8; 12],
    /// The family, including the extended family.
    pub family: u32,
    /// The model, including the extended model.
    pub model: u32,
    /// The stepping.
    pub stepping: u32,
    /// CPUID Fn8000_0001_ECX[SVM]
    pub svm: bool,
    /// CPUID Fn8000_000A_EDX[NP]
    pub nested_paging: bool,
    /// CPUID Fn8000_0008_EAX[PhysAddrSize]
    pub phys_addr_bits: u8,
}

impl CpuInfo {
    /// Queries the current processor with the CPUID instruction.
    pub fn identify() -> Self {
        let leaf0 = x86::cpuid::cpuid!(0x0);
        let mut vendor = [0u8; 12];
        vendor[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
        vendor[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
        vendor[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());

        let signature = x86::cpuid::cpuid!(0x1).eax;
        let mut family = signature.get_bits(8..=11);
        let mut model = signature.get_bits(4..=7);
        if family == 0xf {
            family += signature.get_bits(20..=27);
            model |= signature.get_bits(16..=19) << 4;
        }

        let max_extended_leaf = x86::cpuid::cpuid!(0x8000_0000).eax;
        let svm = max_extended_leaf >= 0x8000_0001
            && x86::cpuid::cpuid!(0x8000_0001).ecx.get_bit(2);
        let nested_paging = svm
            && max_extended_leaf >= 0x8000_000a
            && x86::cpuid::cpuid!(0x8000_000a).edx.get_bit(0);
        let phys_addr_bits = if max_extended_leaf >= 0x8000_0008 {
            x86::cpuid::cpuid!(0x8000_0008).eax.get_bits(0..=7) as u8
        } else {
            36
        };

        Self {
            vendor,
            family,
            model,
            stepping: signature.get_bits(0..=3),
            svm,
            nested_paging,
            phys_addr_bits,
        }
    }

    /// The vendor identification string as text.
    pub fn vendor(&self) -> &str {
        core::str::from_utf8(&self.vendor).unwrap_or("<invalid>")
    }

    /// Checks that the processor can run the guest: an AMD processor with SVM
    /// and nested paging.
    pub(crate) fn validate(&self) -> Result<(), HvError> {
        if self.vendor() != "AuthenticAMD" {
            return Err(HvError::UnsupportedProcessor {
                reason: "not an AMD processor",
            });
        }
        if !self.svm {
            return Err(HvError::UnsupportedProcessor {
                reason: "SVM is not supported",
            });
        }
        if !self.nested_paging {
            return Err(HvError::UnsupportedProcessor {
                reason: "nested paging is not supported",
            });
        }
        log::info!(
            "Family {:#x} Model {:#x} Stepping {:#x}, {} physical address bits",
            self.family,
            self.model,
            self.stepping,
            self.phys_addr_bits
        );
        Ok(())
    }
}
