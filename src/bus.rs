use thiserror::Error;

use crate::ram::Ram;

/// Error surfaced by a bus access.
///
/// The bus itself never raises a guest-visible trap: `Unmapped` is turned
/// into a load/store access fault by the executor, while `Halt` is the
/// testbench exit signal and unwinds all the way out of the step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    /// No device claimed the access.
    #[error("no device claimed the access")]
    Unmapped,
    /// The guest wrote the testbench exit port; the payload is the exit code.
    #[error("halt requested with exit code {0:#010x}")]
    Halt(u32),
}

/// Byte-addressable system bus as seen by the hart.
///
/// The core guarantees it only issues naturally aligned accesses. Reads
/// never produce [`BusError::Halt`].
pub trait Bus {
    fn read8(&mut self, addr: u32) -> Result<u8, BusError>;
    fn read16(&mut self, addr: u32) -> Result<u16, BusError>;
    fn read32(&mut self, addr: u32) -> Result<u32, BusError>;

    fn write8(&mut self, addr: u32, data: u8) -> Result<(), BusError>;
    fn write16(&mut self, addr: u32, data: u16) -> Result<(), BusError>;
    fn write32(&mut self, addr: u32, data: u32) -> Result<(), BusError>;
}

/// A memory-mapped peripheral occupying a window on the system bus.
///
/// Handlers receive offsets relative to the window base. The defaults
/// decline every access, so a device only implements the widths it decodes.
pub trait Device {
    fn read8(&mut self, _offset: u32) -> Option<u8> {
        None
    }
    fn read16(&mut self, _offset: u32) -> Option<u16> {
        None
    }
    fn read32(&mut self, _offset: u32) -> Option<u32> {
        None
    }
    fn write8(&mut self, _offset: u32, _data: u8) -> Result<(), BusError> {
        Err(BusError::Unmapped)
    }
    fn write16(&mut self, _offset: u32, _data: u16) -> Result<(), BusError> {
        Err(BusError::Unmapped)
    }
    fn write32(&mut self, _offset: u32, _data: u32) -> Result<(), BusError> {
        Err(BusError::Unmapped)
    }
}

struct Mapping {
    base: u32,
    size: u32,
    device: Box<dyn Device>,
}

/// System bus composing the flat RAM window with a sparse set of device
/// regions. RAM takes precedence over anything mapped at the same address.
pub struct SystemBus {
    pub ram: Ram,
    devices: Vec<Mapping>,
}

impl SystemBus {
    pub fn new(ram: Ram) -> Self {
        Self {
            ram,
            devices: Vec::new(),
        }
    }

    /// Map `device` over `[base, base + size)`.
    pub fn map_device(&mut self, base: u32, size: u32, device: Box<dyn Device>) {
        self.devices.push(Mapping { base, size, device });
    }

    fn device_at(&mut self, addr: u32) -> Option<(&mut dyn Device, u32)> {
        for m in self.devices.iter_mut() {
            if addr >= m.base && addr - m.base < m.size {
                return Some((m.device.as_mut(), addr - m.base));
            }
        }
        None
    }
}

impl Bus for SystemBus {
    fn read8(&mut self, addr: u32) -> Result<u8, BusError> {
        if self.ram.contains(addr) {
            return Ok(self.ram.read8(addr));
        }
        match self.device_at(addr) {
            Some((dev, off)) => dev.read8(off).ok_or(BusError::Unmapped),
            None => Err(BusError::Unmapped),
        }
    }

    fn read16(&mut self, addr: u32) -> Result<u16, BusError> {
        if self.ram.contains(addr) {
            return Ok(self.ram.read16(addr));
        }
        match self.device_at(addr) {
            Some((dev, off)) => dev.read16(off).ok_or(BusError::Unmapped),
            None => Err(BusError::Unmapped),
        }
    }

    fn read32(&mut self, addr: u32) -> Result<u32, BusError> {
        if self.ram.contains(addr) {
            return Ok(self.ram.read32(addr));
        }
        match self.device_at(addr) {
            Some((dev, off)) => dev.read32(off).ok_or(BusError::Unmapped),
            None => Err(BusError::Unmapped),
        }
    }

    fn write8(&mut self, addr: u32, data: u8) -> Result<(), BusError> {
        if self.ram.contains(addr) {
            self.ram.write8(addr, data);
            return Ok(());
        }
        match self.device_at(addr) {
            Some((dev, off)) => dev.write8(off, data),
            None => Err(BusError::Unmapped),
        }
    }

    fn write16(&mut self, addr: u32, data: u16) -> Result<(), BusError> {
        if self.ram.contains(addr) {
            self.ram.write16(addr, data);
            return Ok(());
        }
        match self.device_at(addr) {
            Some((dev, off)) => dev.write16(off, data),
            None => Err(BusError::Unmapped),
        }
    }

    fn write32(&mut self, addr: u32, data: u32) -> Result<(), BusError> {
        if self.ram.contains(addr) {
            self.ram.write32(addr, data);
            return Ok(());
        }
        match self.device_at(addr) {
            Some((dev, off)) => dev.write32(off, data),
            None => Err(BusError::Unmapped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tbio::{TbIo, TBIO_BASE, TBIO_SIZE};

    fn make_bus() -> SystemBus {
        let mut bus = SystemBus::new(Ram::new(0, 64 * 1024));
        bus.map_device(TBIO_BASE, TBIO_SIZE, Box::new(TbIo));
        bus
    }

    #[test]
    fn ram_round_trips_all_widths() {
        let mut bus = make_bus();
        bus.write32(0x200, 0xcafe_f00d).unwrap();
        assert_eq!(bus.read32(0x200).unwrap(), 0xcafe_f00d);
        assert_eq!(bus.read16(0x200).unwrap(), 0xf00d);
        assert_eq!(bus.read8(0x203).unwrap(), 0xca);

        bus.write16(0x200, 0xbeef).unwrap();
        bus.write8(0x203, 0x11).unwrap();
        assert_eq!(bus.read32(0x200).unwrap(), 0x11fe_beef);
    }

    #[test]
    fn holes_in_the_map_are_unclaimed() {
        let mut bus = make_bus();
        assert_eq!(bus.read32(0x9000_0000), Err(BusError::Unmapped));
        assert_eq!(bus.write32(0x9000_0000, 1), Err(BusError::Unmapped));
        // Past the end of the testbench I/O window.
        assert_eq!(bus.write32(TBIO_BASE + TBIO_SIZE, 1), Err(BusError::Unmapped));
    }

    #[test]
    fn exit_port_write_signals_halt() {
        let mut bus = make_bus();
        assert_eq!(bus.write32(TBIO_BASE, 42), Err(BusError::Halt(42)));
    }

    #[test]
    fn exit_port_is_write_only_and_word_only() {
        let mut bus = make_bus();
        assert_eq!(bus.read32(TBIO_BASE), Err(BusError::Unmapped));
        assert_eq!(bus.write8(TBIO_BASE, 1), Err(BusError::Unmapped));
        assert_eq!(bus.write16(TBIO_BASE, 1), Err(BusError::Unmapped));
    }
}
