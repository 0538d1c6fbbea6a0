//! Page-fault normalization
//!
//! The two architectures report faults through very different syndromes: the
//! x86-like CPU pushes a 5-bit error code and parks the address in CR2; the
//! ARM-like CPU encodes an exception class and fault status code in ESR with
//! the address in FAR. Both decode into one [`PageFaultInfo`] so the VMM can
//! resolve faults without architecture conditionals. Both decoders are plain
//! functions compiled on every target.

use crate::mm::VirtualAddress;

/// Normalized page-fault description.
///
/// `is_present` distinguishes a permission violation on an existing mapping
/// (the copy-on-write gate) from a translation fault on a missing one.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The virtual address that faulted.
    pub vaddr: VirtualAddress,
    /// The access was a write.
    pub is_write: bool,
    /// The access originated at user privilege.
    pub is_user: bool,
    /// The access was an instruction fetch.
    pub is_exec: bool,
    /// A mapping existed; the fault is a permission/aging violation.
    pub is_present: bool,
    /// Reserved-bit violation (diagnosable on the x86-like arch only).
    pub is_reserved_bit: bool,
    /// The original syndrome, kept for diagnostics.
    pub raw: u64,
}

// ---------------------------------------------------------------------------
// x86-like decoder
// ---------------------------------------------------------------------------

/// Error-code bits pushed by the x86-like CPU.
mod x86_err {
    /// 0 = not present, 1 = protection violation.
    pub const PRESENT: u64 = 1 << 0;
    /// 1 = write access.
    pub const WRITE: u64 = 1 << 1;
    /// 1 = fault originated at user privilege.
    pub const USER: u64 = 1 << 2;
    /// 1 = reserved bit set in a paging structure.
    pub const RESERVED: u64 = 1 << 3;
    /// 1 = instruction fetch.
    pub const FETCH: u64 = 1 << 4;
}

/// Decode an x86-like fault from its error code and the CR2 address.
pub fn decode_x86(error_code: u64, cr2: u64) -> PageFaultInfo {
    PageFaultInfo {
        vaddr: VirtualAddress::new(cr2),
        is_write: error_code & x86_err::WRITE != 0,
        is_user: error_code & x86_err::USER != 0,
        is_exec: error_code & x86_err::FETCH != 0,
        // A reserved-bit violation only occurs on a present (if malformed)
        // translation; fold it into the present class.
        is_present: error_code & (x86_err::PRESENT | x86_err::RESERVED) != 0,
        is_reserved_bit: error_code & x86_err::RESERVED != 0,
        raw: error_code,
    }
}

// ---------------------------------------------------------------------------
// ARM-like decoder
// ---------------------------------------------------------------------------

/// ESR exception-class values for the aborts this kernel resolves.
mod arm_ec {
    /// Instruction abort from a lower exception level (user).
    pub const IABT_LOWER: u64 = 0b10_0000;
    /// Instruction abort taken without a change of level (kernel).
    pub const IABT_SAME: u64 = 0b10_0001;
    /// Data abort from a lower exception level (user).
    pub const DABT_LOWER: u64 = 0b10_0100;
    /// Data abort taken without a change of level (kernel).
    pub const DABT_SAME: u64 = 0b10_0101;
}

/// Fault-status-code ranges inside the abort ISS.
///
/// The low nibble identifies the class; the level sits in the bottom two
/// bits. Translation faults mean the walk found nothing; permission and
/// access-flag faults mean a descriptor existed.
mod arm_fsc {
    pub const ADDR_SIZE_FIRST: u64 = 0x00;
    pub const ADDR_SIZE_LAST: u64 = 0x03;
    pub const TRANSLATION_FIRST: u64 = 0x04;
    pub const TRANSLATION_LAST: u64 = 0x07;
    pub const ACCESS_FLAG_FIRST: u64 = 0x08;
    pub const ACCESS_FLAG_LAST: u64 = 0x0B;
    pub const PERMISSION_FIRST: u64 = 0x0C;
    pub const PERMISSION_LAST: u64 = 0x0F;
}

/// ISS bit 6: write-not-read, valid for data aborts.
const ARM_ISS_WNR: u64 = 1 << 6;

/// Decode an ARM-like abort from ESR and the FAR address.
///
/// Syndromes whose exception class is not a data/instruction abort decode
/// with all access bits clear and `is_present = false`; the router treats
/// those as unrecoverable.
pub fn decode_arm64(esr: u64, far: u64) -> PageFaultInfo {
    let ec = (esr >> 26) & 0x3F;
    let fsc = esr & 0x3F;

    let is_exec = matches!(ec, arm_ec::IABT_LOWER | arm_ec::IABT_SAME);
    let is_data = matches!(ec, arm_ec::DABT_LOWER | arm_ec::DABT_SAME);
    let is_user = matches!(ec, arm_ec::IABT_LOWER | arm_ec::DABT_LOWER);

    // WnR is only meaningful for data aborts; instruction fetches read.
    let is_write = is_data && (esr & ARM_ISS_WNR != 0);

    let is_present = match fsc {
        arm_fsc::TRANSLATION_FIRST..=arm_fsc::TRANSLATION_LAST => false,
        arm_fsc::PERMISSION_FIRST..=arm_fsc::PERMISSION_LAST => true,
        arm_fsc::ACCESS_FLAG_FIRST..=arm_fsc::ACCESS_FLAG_LAST => true,
        arm_fsc::ADDR_SIZE_FIRST..=arm_fsc::ADDR_SIZE_LAST => false,
        _ => false,
    };

    PageFaultInfo {
        vaddr: VirtualAddress::new(far),
        is_write,
        is_user,
        is_exec,
        is_present,
        is_reserved_bit: false,
        raw: esr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm_esr(ec: u64, iss: u64) -> u64 {
        (ec << 26) | iss
    }

    #[test]
    fn x86_all_error_code_combinations_decode() {
        // Every 5-bit combination must produce well-defined booleans.
        for code in 0u64..32 {
            let info = decode_x86(code, 0x1000);
            assert_eq!(info.is_write, code & 0b00010 != 0);
            assert_eq!(info.is_user, code & 0b00100 != 0);
            assert_eq!(info.is_exec, code & 0b10000 != 0);
            assert_eq!(info.is_reserved_bit, code & 0b01000 != 0);
            assert_eq!(info.is_present, code & 0b01001 != 0);
            assert_eq!(info.raw, code);
        }
    }

    #[test]
    fn x86_user_write_protection_fault() {
        // CR2 = 0xBFFFF000, error 0b00111: present, write, user.
        let info = decode_x86(0b00111, 0xBFFF_F000);
        assert!(info.is_present);
        assert!(info.is_write);
        assert!(info.is_user);
        assert!(!info.is_exec);
        assert!(!info.is_reserved_bit);
        assert_eq!(info.vaddr.as_u64(), 0xBFFF_F000);
    }

    #[test]
    fn arm_user_translation_write_fault() {
        // Data abort from EL0, FSC 0x07 (translation, level 3), WnR set.
        let esr = arm_esr(0b10_0100, ARM_ISS_WNR | 0x07);
        let info = decode_arm64(esr, 0x0040_0000);
        assert!(!info.is_present);
        assert!(info.is_write);
        assert!(info.is_user);
        assert!(!info.is_exec);
        assert_eq!(info.vaddr.as_u64(), 0x0040_0000);
    }

    #[test]
    fn arm_fsc_ranges() {
        // Each FSC class at each level, as a user data abort.
        for level in 0..4u64 {
            let translation = arm_esr(0b10_0100, 0x04 | level);
            assert!(!decode_arm64(translation, 0).is_present);

            let access_flag = arm_esr(0b10_0100, 0x08 | level);
            assert!(decode_arm64(access_flag, 0).is_present);

            let permission = arm_esr(0b10_0100, 0x0C | level);
            assert!(decode_arm64(permission, 0).is_present);

            let addr_size = arm_esr(0b10_0100, level);
            assert!(!decode_arm64(addr_size, 0).is_present);
        }
    }

    #[test]
    fn arm_instruction_abort_is_exec_not_write() {
        // Instruction abort from EL0, translation fault. The WnR bit
        // position carries other meaning for instruction aborts and must
        // be ignored.
        let esr = arm_esr(0b10_0000, ARM_ISS_WNR | 0x05);
        let info = decode_arm64(esr, 0x40_0000);
        assert!(info.is_exec);
        assert!(!info.is_write);
        assert!(info.is_user);
        assert!(!info.is_present);
    }

    #[test]
    fn arm_kernel_aborts_are_not_user() {
        let data = arm_esr(0b10_0101, 0x0D);
        assert!(!decode_arm64(data, 0).is_user);
        assert!(decode_arm64(data, 0).is_present);

        let instr = arm_esr(0b10_0001, 0x06);
        assert!(!decode_arm64(instr, 0).is_user);
        assert!(decode_arm64(instr, 0).is_exec);
    }

    #[test]
    fn arm_reserved_bit_never_reported() {
        for fsc in 0u64..0x40 {
            let info = decode_arm64(arm_esr(0b10_0100, fsc), 0);
            assert!(!info.is_reserved_bit);
        }
    }
}
