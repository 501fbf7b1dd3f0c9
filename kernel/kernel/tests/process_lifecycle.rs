use kernel::{
    BootSpec, Kernel, NextAction, PagePerms, PageOwner, Pid, ProcState, ProcessError, VirtAddr,
};
use kernel_info::memory as info;
use kernel_syscall::{Syscall, TrapFrame};

fn boot_one() -> Kernel {
    let spec = BootSpec {
        spawn: vec![(Pid::new(1), 1)],
        display: false,
    };
    Kernel::boot(&spec).unwrap()
}

#[test]
fn boot_creates_runnable_processes() {
    let kernel = Kernel::boot(&BootSpec::default()).unwrap();

    assert_eq!(kernel.process(Pid::new(0)).state(), ProcState::Free);
    for pid in 1..=4 {
        let process = kernel.process(Pid::new(pid));
        assert_eq!(process.state(), ProcState::Runnable);
        assert!(process.space().is_some());
        assert_eq!(process.registers().rip, info::PROC_START_ADDR);
        assert_eq!(process.registers().rsp, info::MEMSIZE_VIRTUAL);
    }
    for pid in 5..info::NPROC {
        assert_eq!(kernel.process(Pid::new(pid)).state(), ProcState::Free);
    }
}

#[test]
fn get_pid_returns_the_callers_pid() {
    let mut kernel = Kernel::boot(&BootSpec::default()).unwrap();
    assert_eq!(kernel.start(), NextAction::Resume(Pid::new(1)));

    let action = kernel.exception(TrapFrame::syscall(Syscall::GetPid, 0, 0));
    assert_eq!(action, NextAction::Resume(Pid::new(1)));
    assert_eq!(kernel.frame(Pid::new(1)).rax, 1);
}

#[test]
fn exit_reclaims_every_owned_page() {
    let mut kernel = boot_one();
    let _ = kernel.start();

    let owner = PageOwner::Process(Pid::new(1));
    assert!(kernel.mem().owned_page_count(owner) > 0);

    // The only process exits; nothing is left to run.
    let action = kernel.exception(TrapFrame::syscall(Syscall::Exit, 0, 0));
    assert_eq!(action, NextAction::Spin);

    assert_eq!(kernel.process(Pid::new(1)).state(), ProcState::Free);
    assert_eq!(kernel.mem().owned_page_count(owner), 0);
    kernel.check_virtual_memory();
}

#[test]
fn slot_is_reusable_after_exit() {
    let mut kernel = boot_one();
    let _ = kernel.start();
    kernel.exception(TrapFrame::syscall(Syscall::Exit, 0, 0));

    kernel.create(Pid::new(1), 2).unwrap();
    assert_eq!(kernel.process(Pid::new(1)).state(), ProcState::Runnable);
    kernel.check_virtual_memory();
}

#[test]
fn create_rejects_a_used_slot() {
    let mut kernel = boot_one();
    assert_eq!(
        kernel.create(Pid::new(1), 0),
        Err(ProcessError::SlotInUse(Pid::new(1)))
    );
}

#[test]
fn create_rejects_an_unknown_program() {
    let mut kernel = boot_one();
    assert_eq!(
        kernel.create(Pid::new(2), 99),
        Err(ProcessError::UnknownProgram(99))
    );
}

#[test]
fn create_rolls_back_cleanly_on_exhaustion() {
    let mut kernel = boot_one();
    while kernel.mem_mut().alloc(PageOwner::Kernel).is_some() {}

    assert_eq!(
        kernel.create(Pid::new(2), 0),
        Err(ProcessError::OutOfMemory)
    );
    assert_eq!(kernel.process(Pid::new(2)).state(), ProcState::Free);
    assert_eq!(
        kernel.mem().owned_page_count(PageOwner::Process(Pid::new(2))),
        0
    );
}

#[test]
fn loaded_segments_follow_their_permissions() {
    let kernel = boot_one();
    let space = kernel.process(Pid::new(1)).space().unwrap();

    // Program 1 ("forktest"): read-only text, writable data, plus the
    // stack page created at the top of the virtual range.
    let text = space.lookup(kernel.mem(), VirtAddr::new(0x10_0000));
    assert!(text.is_mapped());
    assert!(!text.perms().contains(PagePerms::WRITABLE));

    let data = space.lookup(kernel.mem(), VirtAddr::new(0x18_0000));
    assert!(data.is_mapped());
    assert!(data.perms().contains(PagePerms::WRITABLE));

    let stack = space.lookup(
        kernel.mem(),
        VirtAddr::new(info::MEMSIZE_VIRTUAL - 0x1000),
    );
    assert!(stack.is_mapped());
    assert!(stack.perms().contains(PagePerms::WRITABLE));
}
