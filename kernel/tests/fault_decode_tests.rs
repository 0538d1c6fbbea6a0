//! Fault-interpreter fixtures: every x86 error-code combination and every
//! ARM fault-status-code range must decode into well-defined booleans, and
//! the backend `parse_fault` bindings must agree with the raw decoders.

use nimbus_kernel::{
    hal::{arm64::Arm64Hal, mock::TestArena, x86::X86Hal, Hal, RawFault},
    mm::{
        fault::{decode_arm64, decode_x86},
        PAGE_SIZE,
    },
};

fn esr(ec: u64, iss: u64) -> u64 {
    (ec << 26) | iss
}

/// Scenario: ARM data abort from EL0, translation fault level 3, write.
#[test]
fn arm_translation_write_abort() {
    let info = decode_arm64(esr(0x24, (1 << 6) | 0x07), 0x0040_0000);
    assert!(!info.is_present);
    assert!(info.is_write);
    assert!(info.is_user);
    assert!(!info.is_exec);
    assert!(!info.is_reserved_bit);
    assert_eq!(info.vaddr.as_u64(), 0x0040_0000);
}

/// Scenario: x86 present+write+user protection fault at 0xBFFFF000.
#[test]
fn x86_protection_write_user() {
    let info = decode_x86(0b00111, 0xBFFF_F000);
    assert!(info.is_present);
    assert!(info.is_write);
    assert!(info.is_user);
    assert!(!info.is_exec);
    assert!(!info.is_reserved_bit);
    assert_eq!(info.vaddr.as_u64(), 0xBFFF_F000);
}

/// Totality over the x86 error-code space: all 32 combinations produce
/// consistent, well-defined flags.
#[test]
fn x86_error_code_space_is_total() {
    for code in 0u64..32 {
        let info = decode_x86(code, 0xDEAD_0000 + code);
        assert_eq!(info.is_present, code & 0b01001 != 0, "code {:05b}", code);
        assert_eq!(info.is_write, code & 0b00010 != 0);
        assert_eq!(info.is_user, code & 0b00100 != 0);
        assert_eq!(info.is_reserved_bit, code & 0b01000 != 0);
        assert_eq!(info.is_exec, code & 0b10000 != 0);
        assert_eq!(info.raw, code);
        assert_eq!(info.vaddr.as_u64(), 0xDEAD_0000 + code);
    }
}

/// Totality over the ARM FSC ranges for data and instruction aborts from
/// both privilege levels.
#[test]
fn arm_fsc_ranges_are_total() {
    // (ec, user, exec)
    let classes = [
        (0x20u64, true, true),   // instruction abort, EL0
        (0x21u64, false, true),  // instruction abort, EL1
        (0x24u64, true, false),  // data abort, EL0
        (0x25u64, false, false), // data abort, EL1
    ];

    for (ec, user, exec) in classes {
        for fsc in 0u64..0x10 {
            let info = decode_arm64(esr(ec, fsc), 0x1000);
            assert_eq!(info.is_user, user, "ec {:#x} fsc {:#x}", ec, fsc);
            assert_eq!(info.is_exec, exec, "ec {:#x} fsc {:#x}", ec, fsc);
            assert!(!info.is_reserved_bit);

            let expect_present = matches!(fsc, 0x08..=0x0F);
            assert_eq!(
                info.is_present, expect_present,
                "ec {:#x} fsc {:#x}",
                ec, fsc
            );
        }
    }

    // WnR only means "write" for data aborts.
    assert!(decode_arm64(esr(0x24, (1 << 6) | 0x05), 0).is_write);
    assert!(!decode_arm64(esr(0x20, (1 << 6) | 0x05), 0).is_write);
}

/// The backend bindings route their architecture's syndrome format into
/// the same decoders.
#[test]
fn backend_parse_fault_bindings() {
    let arena = TestArena::new(64 * PAGE_SIZE);
    let frames = arena.frame_allocator();

    let x86 = X86Hal::new(arena.mapper(), &frames).unwrap();
    let info = x86.parse_fault(RawFault {
        syndrome: 0b00111,
        address: 0xBFFF_F000,
    });
    assert!(info.is_present && info.is_write && info.is_user);

    let arm = Arm64Hal::new(arena.mapper(), &frames).unwrap();
    let info = arm.parse_fault(RawFault {
        syndrome: esr(0x24, (1 << 6) | 0x07),
        address: 0x40_0000,
    });
    assert!(!info.is_present && info.is_write && info.is_user);
    assert_eq!(info.vaddr.as_u64(), 0x40_0000);
}
