//! # Syscall ABI
//!
//! The fixed vocabulary spoken across the user/kernel boundary: interrupt
//! vector numbers, the saved register snapshot carried into every trap, the
//! page-fault error code, and the record written by the query-mapping call.
//!
//! ## Convention
//!
//! A syscall is a software interrupt with a vector from [`Syscall`].
//! Arguments travel in `rdi` and `rsi`; the single result comes back in
//! `rax`. [`SYSCALL_FAILURE`] (all ones, i.e. −1) in `rax` means the call
//! failed.
//!
//! The frame-builder helpers ([`TrapFrame::syscall`] and friends) are the
//! user side of the ABI: they produce exactly the snapshot the hardware
//! would deliver for the corresponding trap.

#![cfg_attr(not(test), no_std)]

mod frame;

pub use frame::TrapFrame;

use bitfield_struct::bitfield;

/// Software interrupt vectors for the system-call vocabulary.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Syscall {
    /// Stop the whole kernel, optionally with a message pointed to by `rdi`.
    Panic = 48,
    /// Return the calling process's pid.
    GetPid = 49,
    /// Give up the processor voluntarily.
    Yield = 50,
    /// Map one fresh writable page at the address in `rdi`.
    PageAlloc = 51,
    /// Duplicate the calling process.
    Fork = 52,
    /// Terminate the calling process.
    Exit = 53,
    /// Write the mapping of the address in `rsi` to the buffer in `rdi`.
    QueryMapping = 54,
    /// Flip the global (`rdi == 0`) or own (`rdi == pid`) display flag.
    ToggleDisplay = 56,
}

impl TryFrom<u64> for Syscall {
    type Error = u64;

    fn try_from(vector: u64) -> Result<Self, u64> {
        match vector {
            48 => Ok(Self::Panic),
            49 => Ok(Self::GetPid),
            50 => Ok(Self::Yield),
            51 => Ok(Self::PageAlloc),
            52 => Ok(Self::Fork),
            53 => Ok(Self::Exit),
            54 => Ok(Self::QueryMapping),
            56 => Ok(Self::ToggleDisplay),
            other => Err(other),
        }
    }
}

/// General protection fault vector.
pub const INT_GPF: u64 = 0xD;

/// Page fault vector.
pub const INT_PAGE_FAULT: u64 = 0xE;

/// Timer interrupt vector.
pub const INT_TIMER: u64 = 32;

/// The failure value of the syscall result register (−1).
pub const SYSCALL_FAILURE: u64 = u64::MAX;

/// Maximum length of a message passed to the panic syscall.
pub const PANIC_MESSAGE_MAX: usize = 160;

/// The error code delivered with a page or protection fault.
#[bitfield(u32)]
pub struct PageFaultCode {
    /// Set when the fault is a protection violation; clear when the page
    /// was simply missing.
    pub protection: bool,

    /// Set when the faulting access was a write.
    pub write: bool,

    /// Set when the fault came from user mode; clear means the kernel
    /// itself faulted.
    pub user: bool,

    #[bits(29)]
    __zero: u32,
}

/// The wire format of one query-mapping answer, written into the caller's
/// buffer: page number (−1 when unmapped), physical address, and the raw
/// permission bits.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MappingRecord {
    /// Destination page number, or −1 when the address is unmapped.
    pub pn: i64,
    /// Destination physical address (meaningless when `pn` is −1).
    pub pa: u64,
    /// Permission bits: present (bit 0), writable (bit 1),
    /// user-accessible (bit 2).
    pub perm: u64,
}

impl MappingRecord {
    /// Size of the record as written to user memory.
    pub const SIZE: usize = size_of::<Self>();

    /// The record for an unmapped address.
    #[must_use]
    pub const fn unmapped() -> Self {
        Self {
            pn: -1,
            pa: u64::MAX,
            perm: 0,
        }
    }

    /// Serialize for a write into user memory.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.pn.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.pa.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.perm.to_le_bytes());
        bytes
    }

    /// Deserialize a record read back from user memory.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut field = [0u8; 8];
        field.copy_from_slice(&bytes[0..8]);
        let pn = i64::from_le_bytes(field);
        field.copy_from_slice(&bytes[8..16]);
        let pa = u64::from_le_bytes(field);
        field.copy_from_slice(&bytes[16..24]);
        let perm = u64::from_le_bytes(field);
        Self { pn, pa, perm }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_vectors_roundtrip() {
        for vector in [48, 49, 50, 51, 52, 53, 54, 56] {
            let call = Syscall::try_from(vector).unwrap();
            assert_eq!(call as u64, vector);
        }
        assert_eq!(Syscall::try_from(55), Err(55));
        assert_eq!(Syscall::try_from(0), Err(0));
    }

    #[test]
    fn fault_code_bits() {
        let code = PageFaultCode::new().with_write(true).with_user(true);
        assert!(!code.protection());
        assert_eq!(u32::from(code), 0b110);
    }

    #[test]
    fn mapping_record_roundtrip() {
        let record = MappingRecord {
            pn: 0x1F3,
            pa: 0x1F3_123,
            perm: 0b111,
        };
        assert_eq!(MappingRecord::from_bytes(&record.to_bytes()), record);

        let none = MappingRecord::unmapped();
        assert_eq!(none.pn, -1);
        assert_eq!(MappingRecord::from_bytes(&none.to_bytes()), none);
    }
}
