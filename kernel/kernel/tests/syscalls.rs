use kernel::{
    BootSpec, Kernel, NextAction, PagePerms, PageOwner, Pid, ProcState, VirtAddr,
};
use kernel_info::memory as info;
use kernel_syscall::{MappingRecord, SYSCALL_FAILURE, Syscall, TrapFrame};

fn boot(programs: &[usize]) -> Kernel {
    let spec = BootSpec {
        spawn: programs
            .iter()
            .enumerate()
            .map(|(i, &program)| (Pid::new(i + 1), program))
            .collect(),
        display: false,
    };
    let mut kernel = Kernel::boot(&spec).unwrap();
    assert_eq!(kernel.start(), NextAction::Resume(Pid::new(1)));
    kernel
}

fn page_alloc(kernel: &mut Kernel, addr: u64) -> u64 {
    kernel.exception(TrapFrame::syscall(Syscall::PageAlloc, addr, 0));
    kernel.frame(kernel.current()).rax
}

#[test]
fn page_alloc_validates_and_recovers() {
    let mut kernel = boot(&[3]);

    // Misaligned address.
    assert_eq!(page_alloc(&mut kernel, 0x28_0010), SYSCALL_FAILURE);
    // Beyond the virtual bound.
    assert_eq!(page_alloc(&mut kernel, info::MEMSIZE_VIRTUAL), SYSCALL_FAILURE);
    // Below the process range.
    assert_eq!(page_alloc(&mut kernel, info::CONSOLE_ADDR), SYSCALL_FAILURE);

    // A valid request still succeeds after the failures.
    assert_eq!(page_alloc(&mut kernel, 0x28_0000), 0);

    let space = kernel.process(Pid::new(1)).space().unwrap();
    let mapping = space.lookup(kernel.mem(), VirtAddr::new(0x28_0000));
    assert_eq!(mapping.perms(), PagePerms::USER_RW);
    let record = kernel.mem().record(mapping.page().unwrap());
    assert_eq!(record.owner, PageOwner::Process(Pid::new(1)));
    assert_eq!(record.refcount, 1);
}

#[test]
fn page_alloc_rejects_an_already_mapped_address() {
    let mut kernel = boot(&[3]);
    assert_eq!(page_alloc(&mut kernel, 0x28_0000), 0);
    assert_eq!(page_alloc(&mut kernel, 0x28_0000), SYSCALL_FAILURE);
    // The program's own text is mapped too.
    assert_eq!(page_alloc(&mut kernel, 0x10_0000), SYSCALL_FAILURE);
}

#[test]
fn processes_allocating_the_same_address_stay_isolated() {
    let mut kernel = boot(&[3, 3]);

    assert_eq!(page_alloc(&mut kernel, 0x28_0000), 0);
    assert_eq!(
        kernel.exception(TrapFrame::syscall(Syscall::Yield, 0, 0)),
        NextAction::Resume(Pid::new(2))
    );
    assert_eq!(page_alloc(&mut kernel, 0x28_0000), 0);

    let space1 = kernel.process(Pid::new(1)).space().unwrap();
    let space2 = kernel.process(Pid::new(2)).space().unwrap();
    let pa1 = space1
        .lookup(kernel.mem(), VirtAddr::new(0x28_0000))
        .phys_addr()
        .unwrap();
    let pa2 = space2
        .lookup(kernel.mem(), VirtAddr::new(0x28_0000))
        .phys_addr()
        .unwrap();
    assert_ne!(pa1, pa2);

    // One process's write is never observable through the other's mapping.
    kernel.mem_mut().write_bytes(pa1, b"process one");
    let mut seen = [0u8; 11];
    kernel.mem().read_bytes(pa2, &mut seen);
    assert_eq!(seen, [0; 11]);
}

#[test]
fn query_mapping_writes_the_record() {
    let mut kernel = boot(&[3]);
    assert_eq!(page_alloc(&mut kernel, 0x28_0000), 0);

    kernel.exception(TrapFrame::syscall(Syscall::QueryMapping, 0x28_0000, 0x10_0000));

    let space = kernel.process(Pid::new(1)).space().unwrap();
    let buffer_pa = space
        .lookup(kernel.mem(), VirtAddr::new(0x28_0000))
        .phys_addr()
        .unwrap();
    let mut bytes = [0u8; MappingRecord::SIZE];
    kernel.mem().read_bytes(buffer_pa, &mut bytes);
    let record = MappingRecord::from_bytes(&bytes);

    let text = space.lookup(kernel.mem(), VirtAddr::new(0x10_0000));
    assert_eq!(record.pn, text.page().unwrap().as_u64() as i64);
    assert_eq!(record.pa, text.phys_addr().unwrap().as_u64());
    assert_eq!(record.perm, u64::from(PagePerms::USER_RO.bits()));
}

#[test]
fn query_mapping_reports_unmapped_addresses() {
    let mut kernel = boot(&[3]);
    assert_eq!(page_alloc(&mut kernel, 0x28_0000), 0);

    kernel.exception(TrapFrame::syscall(Syscall::QueryMapping, 0x28_0000, 0x2C_0000));

    let space = kernel.process(Pid::new(1)).space().unwrap();
    let buffer_pa = space
        .lookup(kernel.mem(), VirtAddr::new(0x28_0000))
        .phys_addr()
        .unwrap();
    let mut bytes = [0u8; MappingRecord::SIZE];
    kernel.mem().read_bytes(buffer_pa, &mut bytes);
    assert_eq!(MappingRecord::from_bytes(&bytes), MappingRecord::unmapped());
}

#[test]
fn query_mapping_handles_a_straddling_buffer() {
    let mut kernel = boot(&[3]);
    assert_eq!(page_alloc(&mut kernel, 0x28_0000), 0);
    assert_eq!(page_alloc(&mut kernel, 0x28_1000), 0);

    // The buffer crosses the boundary between the two fresh pages.
    let buffer_va = 0x28_1000 - 8;
    kernel.exception(TrapFrame::syscall(Syscall::QueryMapping, buffer_va, 0x10_0000));

    let space = kernel.process(Pid::new(1)).space().unwrap();
    let first_pa = space
        .lookup(kernel.mem(), VirtAddr::new(buffer_va))
        .phys_addr()
        .unwrap();
    let second_pa = space
        .lookup(kernel.mem(), VirtAddr::new(0x28_1000))
        .phys_addr()
        .unwrap();

    let mut bytes = [0u8; MappingRecord::SIZE];
    kernel.mem().read_bytes(first_pa, &mut bytes[..8]);
    kernel.mem().read_bytes(second_pa, &mut bytes[8..]);
    let record = MappingRecord::from_bytes(&bytes);

    let text = space.lookup(kernel.mem(), VirtAddr::new(0x10_0000));
    assert_eq!(record.pn, text.page().unwrap().as_u64() as i64);
}

#[test]
fn query_mapping_refuses_an_unwritable_buffer() {
    let mut kernel = boot(&[3]);

    // The program text is user-readable but not writable; the kernel must
    // silently write nothing there.
    let space = kernel.process(Pid::new(1)).space().unwrap();
    let text_pa = space
        .lookup(kernel.mem(), VirtAddr::new(0x10_0000))
        .phys_addr()
        .unwrap();
    let mut before = [0u8; MappingRecord::SIZE];
    kernel.mem().read_bytes(text_pa, &mut before);

    kernel.exception(TrapFrame::syscall(Syscall::QueryMapping, 0x10_0000, 0x10_0000));

    let mut after = [0u8; MappingRecord::SIZE];
    kernel.mem().read_bytes(text_pa, &mut after);
    assert_eq!(before, after);
}

#[test]
fn toggle_display_flips_global_and_per_process_flags() {
    let mut kernel = boot(&[3]);
    assert!(!kernel.display_enabled());

    kernel.exception(TrapFrame::syscall(Syscall::ToggleDisplay, 0, 0));
    assert!(kernel.display_enabled());

    assert!(kernel.process(Pid::new(1)).display());
    kernel.exception(TrapFrame::syscall(Syscall::ToggleDisplay, 1, 0));
    assert!(!kernel.process(Pid::new(1)).display());

    // Another process's pid is ignored.
    kernel.exception(TrapFrame::syscall(Syscall::ToggleDisplay, 7, 0));
    assert!(!kernel.process(Pid::new(1)).display());
}

#[test]
fn panic_syscall_reads_the_message_and_halts() {
    let mut kernel = boot(&[3]);
    assert_eq!(page_alloc(&mut kernel, 0x28_0000), 0);

    let space = kernel.process(Pid::new(1)).space().unwrap();
    let pa = space
        .lookup(kernel.mem(), VirtAddr::new(0x28_0000))
        .phys_addr()
        .unwrap();
    kernel.mem_mut().write_bytes(pa, b"out of cheese\0");

    let action = kernel.exception(TrapFrame::syscall(Syscall::Panic, 0x28_0000, 0));
    assert_eq!(action, NextAction::Halt);

    // The message landed on the console's fault row.
    let row = info::CONSOLE_ROWS - 1;
    let rendered: String = (0..32)
        .map(|col| char::from((kernel.console_cell(row, col) & 0xFF) as u8))
        .collect();
    assert!(rendered.starts_with("KERNEL PANIC: out of cheese"));
}

#[test]
fn panic_with_no_pointer_still_halts() {
    let mut kernel = boot(&[3]);
    let action = kernel.exception(TrapFrame::syscall(Syscall::Panic, 0, 0));
    assert_eq!(action, NextAction::Halt);
}

#[test]
fn exit_is_never_answered() {
    let mut kernel = boot(&[3, 3]);
    // The exiting process is gone; its sibling runs next.
    let action = kernel.exception(TrapFrame::syscall(Syscall::Exit, 0, 0));
    assert_eq!(action, NextAction::Resume(Pid::new(2)));
    assert_eq!(kernel.process(Pid::new(1)).state(), ProcState::Free);
}
