//! The checks the processor performs on the guest state at VMRUN, done in
//! software first so that a bad VMCB is reported instead of failing with
//! VMEXIT_INVALID.
//!
//! See: 15.5.1 Basic Operation, "Canonicalization and Consistency Checks"

use bit_field::BitField;
use x86::controlregs::{Cr0, Cr4};

use super::vmcb::{EFER_LME, EFER_SVME, SVM_INTERCEPT_MISC2_VMRUN, Vmcb};
use crate::hypervisor::error::HvError;

/// The outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Pass,
    Violation,
    /// The check is not implemented and says nothing about the VMCB.
    Unverified,
}

impl From<bool> for Verdict {
    fn from(violated: bool) -> Self {
        if violated { Self::Violation } else { Self::Pass }
    }
}

/// A named condition on the VMCB.
#[derive(Clone, Copy)]
pub(crate) struct ConsistencyCheck {
    pub(crate) message: &'static str,
    pub(crate) predicate: fn(&Vmcb) -> Verdict,
}

impl core::fmt::Debug for ConsistencyCheck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("ConsistencyCheck").field(&self.message).finish()
    }
}

/// The checks in the order they are evaluated.
pub(crate) const CHECKS: [ConsistencyCheck; 12] = [
    ConsistencyCheck {
        message: "EFER.SVME is not set.",
        predicate: efer_svme_clear,
    },
    ConsistencyCheck {
        message: "CR0.CD is not set, and CR0.NW is set.",
        predicate: cr0_nw_without_cd,
    },
    ConsistencyCheck {
        message: "CR0[32:63] are not zero.",
        predicate: cr0_upper_bits_set,
    },
    ConsistencyCheck {
        message: "CR4[11:63] are not zero.",
        predicate: cr4_reserved_bits_set,
    },
    ConsistencyCheck {
        message: "DR6[32:63] are not zero.",
        predicate: dr6_upper_bits_set,
    },
    ConsistencyCheck {
        message: "DR7[32:63] are not zero.",
        predicate: dr7_upper_bits_set,
    },
    ConsistencyCheck {
        message: "EFER[15:63] are not zero.",
        predicate: efer_reserved_bits_set,
    },
    ConsistencyCheck {
        message: "EFER.LME is set, CR0.PG is set, and CR4.PAE is not set.",
        predicate: long_mode_without_pae,
    },
    ConsistencyCheck {
        message: "EFER.LME is set, CR0.PG is set, and CR0.PE is not set.",
        predicate: long_mode_without_pe,
    },
    ConsistencyCheck {
        message: "EFER.LME, CR0.PG, CR4.PAE, CS.L, and CS.D are set.",
        predicate: long_mode_code_with_db,
    },
    ConsistencyCheck {
        message: "The VMRUN intercept bit is clear.",
        predicate: vmrun_not_intercepted,
    },
    ConsistencyCheck {
        message: "Wrong The MSR or IOIO intercept tables address.",
        predicate: permission_maps_out_of_range,
    },
];

/// The result of a passing run. Keeps what is needed to tell which checks
/// could not be evaluated.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConsistencyReport<'a> {
    vmcb: &'a Vmcb,
    checks: &'a [ConsistencyCheck],
}

impl<'a> ConsistencyReport<'a> {
    /// Returns whether every check was evaluated.
    pub(crate) fn is_fully_verified(&self) -> bool {
        self.unverified().next().is_none()
    }

    /// The messages of the checks that were not evaluated.
    pub(crate) fn unverified(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        let vmcb = self.vmcb;
        let checks = self.checks;
        checks
            .iter()
            .filter(move |check| (check.predicate)(vmcb) == Verdict::Unverified)
            .map(|check| check.message)
    }
}

/// Runs [`CHECKS`] against `vmcb`.
pub(crate) fn check(vmcb: &Vmcb) -> Result<ConsistencyReport<'_>, HvError> {
    check_with(vmcb, &CHECKS)
}

/// Runs `checks` in order and stops at the first violation.
pub(crate) fn check_with<'a>(
    vmcb: &'a Vmcb,
    checks: &'a [ConsistencyCheck],
) -> Result<ConsistencyReport<'a>, HvError> {
    for check in checks {
        match (check.predicate)(vmcb) {
            Verdict::Pass | Verdict::Unverified => {}
            Verdict::Violation => {
                log::error!("{}", check.message);
                return Err(HvError::ConsistencyCheck {
                    message: check.message,
                });
            }
        }
    }
    Ok(ConsistencyReport { vmcb, checks })
}

fn long_mode_paging(vmcb: &Vmcb) -> bool {
    let state = &vmcb.state_save_area;
    state.efer & EFER_LME != 0 && state.cr0 & Cr0::CR0_ENABLE_PAGING.bits() as u64 != 0
}

fn pae(vmcb: &Vmcb) -> bool {
    vmcb.state_save_area.cr4 & Cr4::CR4_ENABLE_PAE.bits() as u64 != 0
}

fn efer_svme_clear(vmcb: &Vmcb) -> Verdict {
    (vmcb.state_save_area.efer & EFER_SVME == 0).into()
}

fn cr0_nw_without_cd(vmcb: &Vmcb) -> Verdict {
    let cr0 = vmcb.state_save_area.cr0;
    (cr0 & Cr0::CR0_CACHE_DISABLE.bits() as u64 == 0
        && cr0 & Cr0::CR0_NOT_WRITE_THROUGH.bits() as u64 != 0)
        .into()
}

fn cr0_upper_bits_set(vmcb: &Vmcb) -> Verdict {
    (vmcb.state_save_area.cr0.get_bits(32..64) != 0).into()
}

fn cr4_reserved_bits_set(vmcb: &Vmcb) -> Verdict {
    (vmcb.state_save_area.cr4.get_bits(11..64) != 0).into()
}

fn dr6_upper_bits_set(vmcb: &Vmcb) -> Verdict {
    (vmcb.state_save_area.dr6.get_bits(32..64) != 0).into()
}

fn dr7_upper_bits_set(vmcb: &Vmcb) -> Verdict {
    (vmcb.state_save_area.dr7.get_bits(32..64) != 0).into()
}

fn efer_reserved_bits_set(vmcb: &Vmcb) -> Verdict {
    (vmcb.state_save_area.efer.get_bits(15..64) != 0).into()
}

fn long_mode_without_pae(vmcb: &Vmcb) -> Verdict {
    (long_mode_paging(vmcb) && !pae(vmcb)).into()
}

fn long_mode_without_pe(vmcb: &Vmcb) -> Verdict {
    (long_mode_paging(vmcb)
        && vmcb.state_save_area.cr0 & Cr0::CR0_PROTECTED_MODE.bits() as u64 == 0)
        .into()
}

fn long_mode_code_with_db(vmcb: &Vmcb) -> Verdict {
    let cs = vmcb.state_save_area.cs.attributes();
    (long_mode_paging(vmcb) && pae(vmcb) && cs.l() && cs.db()).into()
}

fn vmrun_not_intercepted(vmcb: &Vmcb) -> Verdict {
    (vmcb.control_area.intercept_misc2 & SVM_INTERCEPT_MISC2_VMRUN == 0).into()
}

// The maps must lie below the maximum physical address. That needs the
// processor's physical address width, which the check does not have.
fn permission_maps_out_of_range(_vmcb: &Vmcb) -> Verdict {
    Verdict::Unverified
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::{CHECKS, ConsistencyCheck, Verdict, check, check_with};
    use crate::hypervisor::{
        amd::vmcb::{EFER_SVME, Vmcb, build_state_save_area},
        error::HvError,
    };

    fn built_vmcb() -> Vmcb {
        let mut vmcb = Vmcb::default();
        vmcb.control_area.intercept_misc2 = 1;
        build_state_save_area(&mut vmcb, 0x10_0000, 0x40_0000);
        vmcb
    }

    fn failing_message(vmcb: &Vmcb) -> &'static str {
        match check(vmcb) {
            Err(HvError::ConsistencyCheck { message }) => message,
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn built_vmcb_passes_all_but_the_unverified_check() {
        let vmcb = built_vmcb();
        let report = check(&vmcb).unwrap();
        assert!(!report.is_fully_verified());
        let unverified: std::vec::Vec<_> = report.unverified().collect();
        assert_eq!(unverified, [CHECKS[11].message]);
    }

    #[test]
    fn svme_clear_is_reported_first() {
        let mut vmcb = built_vmcb();
        vmcb.state_save_area.efer &= !EFER_SVME;
        // Also violates later checks.
        vmcb.state_save_area.cr4 = 0;
        vmcb.control_area.intercept_misc2 = 0;
        assert_eq!(failing_message(&vmcb), "EFER.SVME is not set.");
    }

    #[test]
    fn each_violation_is_named() {
        let cases: [(fn(&mut Vmcb), usize); 10] = [
            (|v| v.state_save_area.cr0 |= 1 << 29, 1),
            (|v| v.state_save_area.cr0 |= 1 << 32, 2),
            (|v| v.state_save_area.cr4 |= 1 << 11, 3),
            (|v| v.state_save_area.dr6 |= 1 << 63, 4),
            (|v| v.state_save_area.dr7 |= 1 << 40, 5),
            (|v| v.state_save_area.efer |= 1 << 15, 6),
            (|v| v.state_save_area.cr4 &= !(1 << 5), 7),
            (|v| v.state_save_area.cr0 &= !1, 8),
            (|v| v.state_save_area.cs.attrib |= 1 << 10, 9),
            (|v| v.control_area.intercept_misc2 = 0, 10),
        ];
        for (corrupt, index) in cases {
            let mut vmcb = built_vmcb();
            corrupt(&mut vmcb);
            assert_eq!(failing_message(&vmcb), CHECKS[index].message);
        }
    }

    #[test]
    fn cd_with_nw_is_consistent() {
        let mut vmcb = built_vmcb();
        vmcb.state_save_area.cr0 |= (1 << 30) | (1 << 29);
        assert!(check(&vmcb).is_ok());
    }

    static EVALUATED: AtomicUsize = AtomicUsize::new(0);

    fn counted_pass(_: &Vmcb) -> Verdict {
        let _ = EVALUATED.fetch_add(1, Ordering::Relaxed);
        Verdict::Pass
    }

    fn counted_violation(_: &Vmcb) -> Verdict {
        let _ = EVALUATED.fetch_add(1, Ordering::Relaxed);
        Verdict::Violation
    }

    #[test]
    fn evaluation_stops_at_first_violation() {
        let checks = [
            ConsistencyCheck {
                message: "first",
                predicate: counted_pass,
            },
            ConsistencyCheck {
                message: "second",
                predicate: counted_violation,
            },
            ConsistencyCheck {
                message: "third",
                predicate: counted_violation,
            },
        ];
        let vmcb = Vmcb::default();
        let result = check_with(&vmcb, &checks);
        assert!(matches!(
            result,
            Err(HvError::ConsistencyCheck { message: "second" })
        ));
        assert_eq!(EVALUATED.load(Ordering::Relaxed), 2);
    }

    fn not_evaluated(_: &Vmcb) -> Verdict {
        Verdict::Unverified
    }

    #[test]
    fn long_check_lists_report_every_unverified_check() {
        let mut checks = [ConsistencyCheck {
            message: "unverified",
            predicate: not_evaluated,
        }; 100];
        checks[99].message = "last";
        let vmcb = Vmcb::default();

        let report = check_with(&vmcb, &checks).unwrap();
        assert!(!report.is_fully_verified());
        assert_eq!(report.unverified().count(), 100);
        assert_eq!(report.unverified().last(), Some("last"));
    }
}
