//! Copy-on-write fork and demand-paging integration tests, driven through
//! the VMM fault path over the real page-table backends.

use nimbus_kernel::{
    hal::{arm64::Arm64Hal, mock::TestArena, x86::X86Hal, Hal},
    mm::{
        vmm::{FaultResolution, UserExtents},
        FrameAllocator, PageFaultInfo, PageFlags, VirtualAddress, Vmm, PAGE_SIZE,
    },
};

const ARENA_BYTES: usize = 1024 * PAGE_SIZE;

fn write_fault(vaddr: VirtualAddress) -> PageFaultInfo {
    PageFaultInfo {
        vaddr,
        is_write: true,
        is_user: true,
        is_exec: false,
        is_present: true,
        is_reserved_bit: false,
        raw: 0x7,
    }
}

fn missing_fault(vaddr: VirtualAddress) -> PageFaultInfo {
    PageFaultInfo {
        vaddr,
        is_write: true,
        is_user: true,
        is_exec: false,
        is_present: false,
        is_reserved_bit: false,
        raw: 0x6,
    }
}

/// Scenario: a writable page is COW-shared by a clone; the first write
/// copies, the second (now sole) owner reclaims in place.
fn cow_clone_and_resolve<H: Hal>(hal: &H, frames: &FrameAllocator, vmm: &Vmm) {
    let va = VirtualAddress::new(0x2000_0000);

    let s1 = hal.create_space(frames).expect("create s1");
    let frame = frames.alloc_frame().expect("alloc");
    assert!(hal.map(frames, s1, va, frame, PageFlags::user_data()));

    // Recognizable content to verify the private copy.
    let mapper = frames.mapper();
    unsafe {
        core::ptr::write_bytes(mapper.translate(frame), 0x5A, PAGE_SIZE);
    }

    hal.switch_space(s1);
    let s2 = vmm.clone_space_cow(hal, frames, s1).expect("clone");

    // Both spaces share the frame read-only with the COW marker.
    assert_eq!(frames.refcount(frame), 2);
    for space in [s1, s2] {
        let (paddr, flags) = hal.query(space, va).expect("query");
        assert_eq!(paddr, frame);
        assert!(flags.contains(PageFlags::COW), "COW missing in {:?}", space);
        assert!(!flags.contains(PageFlags::WRITE));
    }

    // First writer (task in s1) faults and gets a private copy.
    assert_eq!(
        vmm.handle_fault(hal, frames, None, &write_fault(va)),
        FaultResolution::Handled
    );
    let (private, flags) = hal.query(s1, va).expect("query after COW break");
    assert_ne!(private, frame);
    assert!(flags.contains(PageFlags::WRITE));
    assert!(!flags.contains(PageFlags::COW));
    assert_eq!(frames.refcount(frame), 1);
    assert_eq!(frames.refcount(private), 1);

    // The copy carried the content.
    unsafe {
        let p = mapper.translate(private);
        for i in 0..PAGE_SIZE {
            assert_eq!(*p.add(i), 0x5A);
        }
    }

    // Remaining owner (task in s2) writes: refcount is 1, so the page is
    // reclaimed in place, no copy.
    hal.switch_space(s2);
    assert_eq!(
        vmm.handle_fault(hal, frames, None, &write_fault(va)),
        FaultResolution::Handled
    );
    let (paddr, flags) = hal.query(s2, va).expect("query after reclaim");
    assert_eq!(paddr, frame);
    assert!(flags.contains(PageFlags::WRITE));
    assert!(!flags.contains(PageFlags::COW));
    assert_eq!(frames.refcount(frame), 1);

    // Every write-enabled mapping references a refcount-1 frame.
    assert_eq!(frames.refcount(private), 1);
}

#[test]
fn cow_clone_and_resolve_x86() {
    let arena = TestArena::new(ARENA_BYTES);
    let frames = arena.frame_allocator();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();
    let vmm = Vmm::new(&hal, arena.mapper());
    cow_clone_and_resolve(&hal, &frames, &vmm);
}

#[test]
fn cow_clone_and_resolve_arm64() {
    let arena = TestArena::new(ARENA_BYTES);
    let frames = arena.frame_allocator();
    let hal = Arm64Hal::new(arena.mapper(), &frames).unwrap();
    let vmm = Vmm::new(&hal, arena.mapper());
    cow_clone_and_resolve(&hal, &frames, &vmm);
}

/// Scenario: demand stack growth. Faults below the mapped stack but inside
/// the declared extent produce zeroed writable pages, one per fault.
fn demand_stack_growth<H: Hal>(hal: &H, frames: &FrameAllocator, vmm: &Vmm) {
    let stack_top = VirtualAddress::new(0x4000_0000);
    let extents = UserExtents {
        heap_start: VirtualAddress::new(0x1000_0000),
        heap_end: VirtualAddress::new(0x1000_0000),
        heap_max: VirtualAddress::new(0x1800_0000),
        stack_top,
        stack_limit: VirtualAddress::new(stack_top.as_u64() - 256 * PAGE_SIZE as u64),
        mmap_base: VirtualAddress::new(0x3000_0000),
        mmap_cursor: VirtualAddress::new(0x3000_0000),
    };

    let space = hal.create_space(frames).expect("create");
    hal.switch_space(space);

    let free_before = frames.free_frames();

    // First touch: stack_top - 0x800, previously unmapped.
    let first = VirtualAddress::new(stack_top.as_u64() - 0x800);
    assert!(hal.query(space, first).is_none());
    assert_eq!(
        vmm.handle_fault(hal, frames, Some(&extents), &missing_fault(first)),
        FaultResolution::Handled
    );
    let (paddr, flags) = hal.query(space, first).expect("mapped after fault");
    assert!(flags.contains(PageFlags::WRITE | PageFlags::USER));
    assert_eq!(frames.refcount(paddr), 1);

    // 99 more pages of growth.
    for i in 1..100u64 {
        let va = VirtualAddress::new(stack_top.as_u64() - 0x800 - i * PAGE_SIZE as u64);
        assert_eq!(
            vmm.handle_fault(hal, frames, Some(&extents), &missing_fault(va)),
            FaultResolution::Handled,
            "growth fault {} failed",
            i
        );
        let (paddr, _) = hal.query(space, va).expect("mapped");
        assert_eq!(frames.refcount(paddr), 1);
    }

    // 100 data frames were consumed (page tables come on top).
    let consumed = free_before - frames.free_frames();
    assert!(consumed >= 100, "only {} frames consumed", consumed);

    // Outside the declared extent: the task dies.
    let stray = VirtualAddress::new(stack_top.as_u64() - 512 * PAGE_SIZE as u64);
    assert_eq!(
        vmm.handle_fault(hal, frames, Some(&extents), &missing_fault(stray)),
        FaultResolution::KillTask
    );
}

#[test]
fn demand_stack_growth_x86() {
    let arena = TestArena::new(ARENA_BYTES);
    let frames = arena.frame_allocator();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();
    let vmm = Vmm::new(&hal, arena.mapper());
    demand_stack_growth(&hal, &frames, &vmm);
}

#[test]
fn demand_stack_growth_arm64() {
    let arena = TestArena::new(ARENA_BYTES);
    let frames = arena.frame_allocator();
    let hal = Arm64Hal::new(arena.mapper(), &frames).unwrap();
    let vmm = Vmm::new(&hal, arena.mapper());
    demand_stack_growth(&hal, &frames, &vmm);
}

/// Kernel-half misses sync lazily from the master template; unresolvable
/// kernel faults report Panic, unresolvable user faults KillTask.
#[test]
fn kernel_half_sync_and_verdicts() {
    let arena = TestArena::new(ARENA_BYTES);
    let frames = arena.frame_allocator();
    let hal = X86Hal::new(arena.mapper(), &frames).unwrap();
    let vmm = Vmm::new(&hal, arena.mapper());

    // A kernel-global mapping created after the user space existed.
    let space = hal.create_space(&frames).unwrap();
    let kva = VirtualAddress::new(0xC800_0000);
    let kframe = frames.alloc_frame().unwrap();
    assert!(hal.map(&frames, hal.kernel_space(), kva, kframe, PageFlags::kernel_data()));
    assert!(hal.query(space, kva).is_none());

    hal.switch_space(space);
    let kernel_miss = PageFaultInfo {
        vaddr: kva,
        is_write: false,
        is_user: false,
        is_exec: false,
        is_present: false,
        is_reserved_bit: false,
        raw: 0,
    };
    assert_eq!(
        vmm.handle_fault(&hal, &frames, None, &kernel_miss),
        FaultResolution::Handled
    );
    assert_eq!(hal.query(space, kva).map(|(p, _)| p), Some(kframe));

    // A kernel fault nothing can explain panics the machine.
    let bad_kernel = PageFaultInfo {
        vaddr: VirtualAddress::new(0xD123_4000),
        ..kernel_miss
    };
    assert_eq!(
        vmm.handle_fault(&hal, &frames, None, &bad_kernel),
        FaultResolution::Panic
    );

    // A user fault with no extent to grow into kills the task.
    assert_eq!(
        vmm.handle_fault(
            &hal,
            &frames,
            None,
            &missing_fault(VirtualAddress::new(0x0666_0000))
        ),
        FaultResolution::KillTask
    );
}
