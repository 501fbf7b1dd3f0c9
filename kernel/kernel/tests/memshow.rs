use kernel::{BootSpec, Kernel, NextAction, Pid, VirtAddr};
use kernel_info::memory as info;
use kernel_syscall::{Syscall, TrapFrame};

fn cell_char(kernel: &Kernel, row: usize, col: usize) -> char {
    char::from((kernel.console_cell(row, col) & 0xFF) as u8)
}

fn physical_cell(pn: u64) -> (usize, usize) {
    (1 + pn as usize / 64, 12 + pn as usize % 64)
}

#[test]
fn the_visualizer_paints_the_physical_map() {
    let mut kernel = Kernel::boot(&BootSpec::default()).unwrap();
    assert_eq!(kernel.start(), NextAction::Resume(Pid::new(1)));
    kernel.exception(TrapFrame::timer());

    // Title line.
    let title: String = (32..47).map(|col| cell_char(&kernel, 0, col)).collect();
    assert_eq!(title, "PHYSICAL MEMORY");

    // The null page is reserved, the kernel image is kernel-owned.
    let (row, col) = physical_cell(0);
    assert_eq!(cell_char(&kernel, row, col), 'R');
    let (row, col) = physical_cell(info::KERNEL_START_ADDR >> 12);
    assert_eq!(cell_char(&kernel, row, col), 'K');
    let (row, col) = physical_cell(info::CONSOLE_ADDR >> 12);
    assert_eq!(cell_char(&kernel, row, col), 'R');
}

#[test]
fn the_visualizer_rotates_per_process_virtual_maps() {
    let mut kernel = Kernel::boot(&BootSpec::default()).unwrap();
    let _ = kernel.start();
    kernel.exception(TrapFrame::timer());

    let title: String = (26..52).map(|col| cell_char(&kernel, 10, col)).collect();
    assert_eq!(title, "VIRTUAL ADDRESS SPACE FOR ");
}

#[test]
fn shared_pages_are_marked_after_fork() {
    let spec = BootSpec {
        spawn: vec![(Pid::new(1), 1)],
        display: true,
    };
    let mut kernel = Kernel::boot(&spec).unwrap();
    let _ = kernel.start();
    kernel.exception(TrapFrame::syscall(Syscall::Fork, 0, 0));

    let text_page = kernel
        .process(Pid::new(1))
        .space()
        .unwrap()
        .lookup(kernel.mem(), VirtAddr::new(0x10_0000))
        .page()
        .unwrap();

    // Repaint with the share in place.
    kernel.exception(TrapFrame::syscall(Syscall::GetPid, 0, 0));
    let (row, col) = physical_cell(text_page.as_u64());
    assert_eq!(cell_char(&kernel, row, col), 'S');
}

#[test]
fn display_toggle_controls_the_refresh() {
    let spec = BootSpec {
        spawn: vec![(Pid::new(1), 3)],
        display: false,
    };
    let mut kernel = Kernel::boot(&spec).unwrap();
    let _ = kernel.start();

    // Display off: the title cells stay blank after a trap.
    kernel.exception(TrapFrame::syscall(Syscall::GetPid, 0, 0));
    assert_eq!(cell_char(&kernel, 0, 32), ' ');

    // Toggle on; the next trap paints.
    kernel.exception(TrapFrame::syscall(Syscall::ToggleDisplay, 0, 0));
    kernel.exception(TrapFrame::syscall(Syscall::GetPid, 0, 0));
    assert_eq!(cell_char(&kernel, 0, 32), 'P');
}
