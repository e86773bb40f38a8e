use crate::bus::{BusError, Device};

/// Base of the testbench I/O window.
pub const TBIO_BASE: u32 = 0x8000_0000;
/// Size of the testbench I/O window in bytes.
pub const TBIO_SIZE: u32 = 0xc;

const EXIT_OFFSET: u32 = 0x0;
const PUTC_OFFSET: u32 = 0x4;
const PUTHEX_OFFSET: u32 = 0x8;

/// Testbench I/O device.
///
/// Three word-sized write-only ports: exit (the written value becomes the
/// guest's exit code and ends the run), character output, and hex-word
/// output. Reads and sub-word writes go unclaimed.
pub struct TbIo;

impl Device for TbIo {
    fn write32(&mut self, offset: u32, data: u32) -> Result<(), BusError> {
        match offset {
            EXIT_OFFSET => Err(BusError::Halt(data)),
            PUTC_OFFSET => {
                print!("{}", (data & 0xff) as u8 as char);
                Ok(())
            }
            PUTHEX_OFFSET => {
                println!("{:08x}", data);
                Ok(())
            }
            _ => Err(BusError::Unmapped),
        }
    }
}
