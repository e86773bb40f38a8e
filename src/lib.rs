pub mod bus;
pub mod cpu;
pub mod csr;
pub mod decode;
pub mod emulator;
pub mod loader;
pub mod ram;
pub mod tbio;

use thiserror::Error;

/// Synchronous exception causes raised by the executor, numbered per the
/// `mcause` encoding.
///
/// These are always recovered locally by redirecting the guest to its trap
/// vector; they never terminate the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// Instruction fetch got no response from the bus.
    InstrFault,
    /// Unrecognised encoding, or a privileged operation at insufficient
    /// privilege.
    Illegal,
    /// EBREAK or C.EBREAK.
    Breakpoint,
    /// Misaligned load effective address.
    LoadAlign,
    /// Load got no response from the bus.
    LoadFault,
    /// Misaligned store/AMO effective address.
    StoreAlign,
    /// Store/AMO got no response from the bus. AMOs report this for failed
    /// reads as well, since the architecture classes them as stores.
    StoreFault,
    /// ECALL from U-mode.
    EcallU,
    /// ECALL from M-mode.
    EcallM,
}

impl Exception {
    /// The `mcause` code for this exception.
    pub fn code(self) -> u32 {
        match self {
            Exception::InstrFault => 1,
            Exception::Illegal => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAlign => 4,
            Exception::LoadFault => 5,
            Exception::StoreAlign => 6,
            Exception::StoreFault => 7,
            Exception::EcallU => 8,
            Exception::EcallM => 11,
        }
    }
}

/// Raised out of the step loop when the guest writes the testbench exit
/// port. The payload is the exit code the guest wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest requested halt with exit code {0:#010x}")]
pub struct Halt(pub u32);
