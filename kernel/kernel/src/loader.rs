//! The program loader: maps and populates a program's loadable segments.
//!
//! Program images are declarative: a list of segments with their requested
//! virtual addresses and permissions, plus an entry point. The loader maps
//! each segment page by page, one fresh physical page per page of segment
//! memory, and copies the image bytes in, zero-filling the remainder
//! (fresh pages are already zeroed by the allocator).

use kernel_alloc::{PageOwner, PhysicalMemory, Pid};
use kernel_info::memory as info;
use kernel_memory_addresses::{PAGE_SIZE, VirtAddr};
use kernel_vmem::{AddressSpace, PagePerms};
use log::debug;

use crate::process::ProcessError;

/// One loadable segment of a program image.
pub struct Segment {
    /// Requested virtual address (page-aligned, inside the process range).
    pub vaddr: u64,
    /// Size of the segment in memory; the tail beyond `data` is zero.
    pub mem_size: u64,
    /// Image bytes copied to the start of the segment.
    pub data: &'static [u8],
    /// Whether the segment is mapped writable (data) or read-only (text).
    pub writable: bool,
}

/// A complete program image.
pub struct Program {
    pub name: &'static str,
    /// Entry address; becomes the created process's instruction pointer.
    pub entry: u64,
    pub segments: &'static [Segment],
}

/// Deterministic image bytes so tests can recognize what the loader put
/// where.
const fn image<const N: usize>(seed: u8) -> [u8; N] {
    let mut bytes = [0u8; N];
    let mut i = 0;
    while i < N {
        bytes[i] = seed ^ (i as u8);
        i += 1;
    }
    bytes
}

static ALLOCATOR_TEXT: [u8; 512] = image(0xA1);
static ALLOCATOR_DATA: [u8; 256] = image(0xA2);
static FORKTEST_TEXT: [u8; 512] = image(0xB1);
static FORKTEST_DATA: [u8; 128] = image(0xB2);
static STRESS_TEXT: [u8; 512] = image(0xC1);
static STRESS_DATA: [u8; 512] = image(0xC2);
static PROBE_TEXT: [u8; 256] = image(0xD1);

/// The built-in program images, indexed by program id.
static PROGRAMS: [Program; 4] = [
    Program {
        name: "allocator",
        entry: info::PROC_START_ADDR,
        segments: &[
            Segment {
                vaddr: info::PROC_START_ADDR,
                mem_size: 2 * PAGE_SIZE,
                data: &ALLOCATOR_TEXT,
                writable: false,
            },
            Segment {
                vaddr: 0x14_0000,
                mem_size: PAGE_SIZE,
                data: &ALLOCATOR_DATA,
                writable: true,
            },
        ],
    },
    Program {
        name: "forktest",
        entry: info::PROC_START_ADDR,
        segments: &[
            Segment {
                vaddr: info::PROC_START_ADDR,
                mem_size: PAGE_SIZE,
                data: &FORKTEST_TEXT,
                writable: false,
            },
            Segment {
                vaddr: 0x18_0000,
                mem_size: PAGE_SIZE,
                data: &FORKTEST_DATA,
                writable: true,
            },
        ],
    },
    Program {
        name: "stress",
        entry: info::PROC_START_ADDR,
        segments: &[
            Segment {
                vaddr: info::PROC_START_ADDR,
                mem_size: PAGE_SIZE,
                data: &STRESS_TEXT,
                writable: false,
            },
            Segment {
                vaddr: 0x14_0000,
                mem_size: 2 * PAGE_SIZE,
                data: &STRESS_DATA,
                writable: true,
            },
        ],
    },
    Program {
        name: "probe",
        entry: info::PROC_START_ADDR,
        segments: &[Segment {
            vaddr: info::PROC_START_ADDR,
            mem_size: PAGE_SIZE,
            data: &PROBE_TEXT,
            writable: false,
        }],
    },
];

/// Number of built-in programs.
pub const PROGRAM_COUNT: usize = PROGRAMS.len();

/// Look up a built-in program image by id.
#[must_use]
pub fn program(id: usize) -> Option<&'static Program> {
    PROGRAMS.get(id)
}

/// Map and populate every loadable segment of `program` into `space`,
/// reserving each backing page for `pid`. Returns the entry address.
///
/// Pages already placed stay behind on failure; the caller tears down the
/// whole space, which releases them.
pub fn load(
    mem: &mut PhysicalMemory,
    space: &AddressSpace,
    pid: Pid,
    program: &Program,
) -> Result<u64, ProcessError> {
    for segment in program.segments {
        load_segment(mem, space, pid, segment)?;
    }
    debug!("loaded '{}' for pid {pid}", program.name);
    Ok(program.entry)
}

fn load_segment(
    mem: &mut PhysicalMemory,
    space: &AddressSpace,
    pid: Pid,
    segment: &Segment,
) -> Result<(), ProcessError> {
    assert!(segment.vaddr % PAGE_SIZE == 0, "segment must be page-aligned");
    assert!(
        segment.vaddr >= info::PROC_START_ADDR
            && segment.vaddr + segment.mem_size <= info::MEMSIZE_VIRTUAL,
        "segment must lie inside the process range"
    );
    assert!(segment.data.len() as u64 <= segment.mem_size);

    let perms = if segment.writable {
        PagePerms::USER_RW
    } else {
        PagePerms::USER_RO
    };

    let pages = segment.mem_size.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        let page = mem
            .alloc(PageOwner::Process(pid))
            .ok_or(ProcessError::OutOfMemory)?;
        let va = VirtAddr::new(segment.vaddr + i * PAGE_SIZE);
        if let Err(err) = space.map(mem, va, page.base(), PAGE_SIZE, perms) {
            mem.release(page);
            return Err(err.into());
        }

        let start = (i * PAGE_SIZE) as usize;
        if start < segment.data.len() {
            let end = segment.data.len().min(start + PAGE_SIZE as usize);
            mem.write_bytes(page.base(), &segment.data[start..end]);
        }
    }
    Ok(())
}
