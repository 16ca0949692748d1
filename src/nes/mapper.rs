use anyhow::Result;

use crate::error::NesError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
}

/// Result of routing a CPU access through the mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMapping {
    /// Byte offset into PRG ROM.
    Prg(usize),
    /// The mapper serviced the access itself (bank register or on-board RAM).
    /// Reads carry the byte; writes echo the written value.
    Direct(u8),
}

/// Address translation between the CPU/PPU buses and cartridge memory.
///
/// Returning `None` means the cartridge does not claim the address and the
/// bus should fall through to its own devices.
pub trait Mapper {
    fn cpu_map_read(&self, addr: u16) -> Option<CpuMapping>;
    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuMapping>;
    /// Offset into CHR memory.
    fn ppu_map_read(&mut self, addr: u16) -> Option<usize>;
    /// Offset into CHR memory; only CHR RAM boards accept writes.
    fn ppu_map_write(&mut self, addr: u16) -> Option<usize>;
    fn reset(&mut self);
    /// Overrides the header's hardwired mirroring when `Some`.
    fn mirror(&self) -> Option<Mirroring> {
        None
    }
    fn irq_state(&self) -> bool {
        false
    }
    fn irq_clear(&mut self) {}
    /// Called once per rendered scanline by the PPU.
    fn scanline(&mut self) {}
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        66 => "GxROM",
        _ => "Unsupported",
    }
}

macro_rules! dispatch {
    ($self:ident, $m:ident => $body:expr) => {
        match $self {
            MapperKind::Nrom($m) => $body,
            MapperKind::Mmc1($m) => $body,
            MapperKind::Uxrom($m) => $body,
            MapperKind::Cnrom($m) => $body,
            MapperKind::Mmc3($m) => $body,
            MapperKind::Gxrom($m) => $body,
        }
    };
}

/// Every board this core knows how to drive.
#[derive(Debug, Clone)]
pub enum MapperKind {
    Nrom(Nrom),
    Mmc1(Mmc1),
    Uxrom(Uxrom),
    Cnrom(Cnrom),
    Mmc3(Mmc3),
    Gxrom(Gxrom),
}

impl MapperKind {
    /// `prg_banks` counts 16KB units, `chr_banks` 8KB units (0 means CHR RAM).
    pub fn new(mapper_id: u16, prg_banks: usize, chr_banks: usize) -> Result<Self> {
        let mut mapper = match mapper_id {
            0 => MapperKind::Nrom(Nrom::new(prg_banks, chr_banks)),
            1 => MapperKind::Mmc1(Mmc1::new(prg_banks, chr_banks)),
            2 => MapperKind::Uxrom(Uxrom::new(prg_banks, chr_banks)),
            3 => MapperKind::Cnrom(Cnrom::new(prg_banks, chr_banks)),
            4 => MapperKind::Mmc3(Mmc3::new(prg_banks, chr_banks)),
            66 => MapperKind::Gxrom(Gxrom::new(prg_banks, chr_banks)),
            id => return Err(NesError::UnsupportedMapper(id).into()),
        };
        mapper.reset();
        Ok(mapper)
    }

    pub fn id(&self) -> u16 {
        match self {
            MapperKind::Nrom(_) => 0,
            MapperKind::Mmc1(_) => 1,
            MapperKind::Uxrom(_) => 2,
            MapperKind::Cnrom(_) => 3,
            MapperKind::Mmc3(_) => 4,
            MapperKind::Gxrom(_) => 66,
        }
    }

    pub fn name(&self) -> &'static str {
        mapper_name(self.id())
    }
}

impl Mapper for MapperKind {
    fn cpu_map_read(&self, addr: u16) -> Option<CpuMapping> {
        dispatch!(self, m => m.cpu_map_read(addr))
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuMapping> {
        dispatch!(self, m => m.cpu_map_write(addr, data))
    }

    fn ppu_map_read(&mut self, addr: u16) -> Option<usize> {
        dispatch!(self, m => m.ppu_map_read(addr))
    }

    fn ppu_map_write(&mut self, addr: u16) -> Option<usize> {
        dispatch!(self, m => m.ppu_map_write(addr))
    }

    fn reset(&mut self) {
        dispatch!(self, m => m.reset())
    }

    fn mirror(&self) -> Option<Mirroring> {
        dispatch!(self, m => m.mirror())
    }

    fn irq_state(&self) -> bool {
        dispatch!(self, m => m.irq_state())
    }

    fn irq_clear(&mut self) {
        dispatch!(self, m => m.irq_clear())
    }

    fn scanline(&mut self) {
        dispatch!(self, m => m.scanline())
    }
}

/// Pattern table access shared by the fixed-CHR boards.
fn chr_window(addr: u16) -> Option<usize> {
    (addr < 0x2000).then_some(addr as usize)
}

/// Mapper 0: 16KB or 32KB PRG, 8KB CHR, no registers.
#[derive(Debug, Clone)]
pub struct Nrom {
    prg_banks: usize,
    chr_banks: usize,
}

impl Nrom {
    pub fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
        }
    }

    fn prg_offset(&self, addr: u16) -> usize {
        let mask = if self.prg_banks > 1 { 0x7FFF } else { 0x3FFF };
        (addr & mask) as usize
    }
}

impl Mapper for Nrom {
    fn cpu_map_read(&self, addr: u16) -> Option<CpuMapping> {
        (addr >= 0x8000).then(|| CpuMapping::Prg(self.prg_offset(addr)))
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuMapping> {
        (addr >= 0x8000).then_some(CpuMapping::Direct(data))
    }

    fn ppu_map_read(&mut self, addr: u16) -> Option<usize> {
        chr_window(addr)
    }

    fn ppu_map_write(&mut self, addr: u16) -> Option<usize> {
        if self.chr_banks == 0 {
            chr_window(addr)
        } else {
            None
        }
    }

    fn reset(&mut self) {}
}

/// Mapper 1: serial-loaded control, CHR and PRG registers.
#[derive(Debug, Clone)]
pub struct Mmc1 {
    prg_banks: usize,
    chr_banks: usize,
    load: u8,
    load_count: u8,
    control: u8,
    chr_lo: usize,
    chr_hi: usize,
    chr_8k: usize,
    prg_lo: usize,
    prg_hi: usize,
    prg_32k: usize,
    mirror: Mirroring,
    ram: Vec<u8>,
}

impl Mmc1 {
    pub fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
            load: 0,
            load_count: 0,
            control: 0x1C,
            chr_lo: 0,
            chr_hi: 0,
            chr_8k: 0,
            prg_lo: 0,
            prg_hi: 0,
            prg_32k: 0,
            mirror: Mirroring::Horizontal,
            ram: vec![0; 0x2000],
        }
    }

    fn commit(&mut self, addr: u16) {
        let value = self.load;
        match (addr >> 13) & 0x03 {
            0 => {
                self.control = value & 0x1F;
                self.mirror = match self.control & 0x03 {
                    0 => Mirroring::OneScreenLower,
                    1 => Mirroring::OneScreenUpper,
                    2 => Mirroring::Vertical,
                    _ => Mirroring::Horizontal,
                };
            }
            1 => {
                if self.control & 0x10 != 0 {
                    self.chr_lo = (value & 0x1F) as usize;
                } else {
                    self.chr_8k = ((value & 0x1E) >> 1) as usize;
                }
            }
            2 => {
                if self.control & 0x10 != 0 {
                    self.chr_hi = (value & 0x1F) as usize;
                }
            }
            _ => match (self.control >> 2) & 0x03 {
                0 | 1 => self.prg_32k = ((value & 0x0E) >> 1) as usize,
                2 => {
                    self.prg_lo = 0;
                    self.prg_hi = (value & 0x0F) as usize;
                }
                _ => {
                    self.prg_lo = (value & 0x0F) as usize;
                    self.prg_hi = self.prg_banks.saturating_sub(1);
                }
            },
        }
    }
}

impl Mapper for Mmc1 {
    fn cpu_map_read(&self, addr: u16) -> Option<CpuMapping> {
        match addr {
            0x6000..=0x7FFF => Some(CpuMapping::Direct(self.ram[(addr & 0x1FFF) as usize])),
            0x8000..=0xFFFF => {
                let offset = if self.control & 0x08 != 0 {
                    let bank = if addr < 0xC000 { self.prg_lo } else { self.prg_hi };
                    bank * 0x4000 + (addr & 0x3FFF) as usize
                } else {
                    self.prg_32k * 0x8000 + (addr & 0x7FFF) as usize
                };
                Some(CpuMapping::Prg(offset))
            }
            _ => None,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuMapping> {
        match addr {
            0x6000..=0x7FFF => {
                self.ram[(addr & 0x1FFF) as usize] = data;
                Some(CpuMapping::Direct(data))
            }
            0x8000..=0xFFFF => {
                if data & 0x80 != 0 {
                    self.load = 0;
                    self.load_count = 0;
                    self.control |= 0x0C;
                } else {
                    self.load >>= 1;
                    self.load |= (data & 0x01) << 4;
                    self.load_count += 1;
                    if self.load_count == 5 {
                        self.commit(addr);
                        self.load = 0;
                        self.load_count = 0;
                    }
                }
                Some(CpuMapping::Direct(data))
            }
            _ => None,
        }
    }

    fn ppu_map_read(&mut self, addr: u16) -> Option<usize> {
        if addr >= 0x2000 {
            return None;
        }
        if self.chr_banks == 0 {
            return Some(addr as usize);
        }
        let offset = if self.control & 0x10 != 0 {
            let bank = if addr < 0x1000 { self.chr_lo } else { self.chr_hi };
            bank * 0x1000 + (addr & 0x0FFF) as usize
        } else {
            self.chr_8k * 0x2000 + (addr & 0x1FFF) as usize
        };
        Some(offset)
    }

    fn ppu_map_write(&mut self, addr: u16) -> Option<usize> {
        if self.chr_banks == 0 {
            chr_window(addr)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.control = 0x1C;
        self.load = 0;
        self.load_count = 0;
        self.chr_lo = 0;
        self.chr_hi = 0;
        self.chr_8k = 0;
        self.prg_32k = 0;
        self.prg_lo = 0;
        self.prg_hi = self.prg_banks.saturating_sub(1);
    }

    fn mirror(&self) -> Option<Mirroring> {
        Some(self.mirror)
    }
}

/// Mapper 2: switchable 16KB at $8000, last bank fixed at $C000.
#[derive(Debug, Clone)]
pub struct Uxrom {
    prg_banks: usize,
    chr_banks: usize,
    prg_lo: usize,
    prg_hi: usize,
}

impl Uxrom {
    pub fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
            prg_lo: 0,
            prg_hi: 0,
        }
    }
}

impl Mapper for Uxrom {
    fn cpu_map_read(&self, addr: u16) -> Option<CpuMapping> {
        match addr {
            0x8000..=0xBFFF => Some(CpuMapping::Prg(
                self.prg_lo * 0x4000 + (addr & 0x3FFF) as usize,
            )),
            0xC000..=0xFFFF => Some(CpuMapping::Prg(
                self.prg_hi * 0x4000 + (addr & 0x3FFF) as usize,
            )),
            _ => None,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuMapping> {
        if addr >= 0x8000 {
            self.prg_lo = (data & 0x0F) as usize;
            Some(CpuMapping::Direct(data))
        } else {
            None
        }
    }

    fn ppu_map_read(&mut self, addr: u16) -> Option<usize> {
        chr_window(addr)
    }

    fn ppu_map_write(&mut self, addr: u16) -> Option<usize> {
        if self.chr_banks == 0 {
            chr_window(addr)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.prg_lo = 0;
        self.prg_hi = self.prg_banks.saturating_sub(1);
    }
}

/// Mapper 3: fixed PRG, switchable 8KB CHR.
#[derive(Debug, Clone)]
pub struct Cnrom {
    prg_banks: usize,
    chr_banks: usize,
    chr_select: usize,
}

impl Cnrom {
    pub fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
            chr_select: 0,
        }
    }
}

impl Mapper for Cnrom {
    fn cpu_map_read(&self, addr: u16) -> Option<CpuMapping> {
        let mask = if self.prg_banks > 1 { 0x7FFF } else { 0x3FFF };
        (addr >= 0x8000).then(|| CpuMapping::Prg((addr & mask) as usize))
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuMapping> {
        if addr >= 0x8000 {
            self.chr_select = (data & 0x03) as usize;
            Some(CpuMapping::Direct(data))
        } else {
            None
        }
    }

    fn ppu_map_read(&mut self, addr: u16) -> Option<usize> {
        chr_window(addr).map(|a| self.chr_select * 0x2000 + a)
    }

    fn ppu_map_write(&mut self, addr: u16) -> Option<usize> {
        if self.chr_banks == 0 {
            chr_window(addr)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.chr_select = 0;
    }
}

/// Mapper 4: eight bank registers, 1KB CHR / 8KB PRG granularity and a
/// scanline counter IRQ.
#[derive(Debug, Clone)]
pub struct Mmc3 {
    prg_banks: usize,
    chr_banks: usize,
    target: usize,
    prg_mode: bool,
    chr_inversion: bool,
    registers: [usize; 8],
    chr_bank: [usize; 8],
    prg_bank: [usize; 4],
    irq_active: bool,
    irq_enable: bool,
    irq_counter: u8,
    irq_reload: u8,
    mirror: Mirroring,
    ram: Vec<u8>,
}

impl Mmc3 {
    pub fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
            target: 0,
            prg_mode: false,
            chr_inversion: false,
            registers: [0; 8],
            chr_bank: [0; 8],
            prg_bank: [0; 4],
            irq_active: false,
            irq_enable: false,
            irq_counter: 0,
            irq_reload: 0,
            mirror: Mirroring::Horizontal,
            ram: vec![0; 0x2000],
        }
    }

    fn second_last_prg(&self) -> usize {
        (self.prg_banks * 2).saturating_sub(2) * 0x2000
    }

    fn last_prg(&self) -> usize {
        (self.prg_banks * 2).saturating_sub(1) * 0x2000
    }

    fn update_banks(&mut self) {
        let r = self.registers;
        let pair = |v: usize| [(v & 0xFE) * 0x0400, (v & 0xFE) * 0x0400 + 0x0400];
        let [r0a, r0b] = pair(r[0]);
        let [r1a, r1b] = pair(r[1]);
        let singles = [r[2] * 0x0400, r[3] * 0x0400, r[4] * 0x0400, r[5] * 0x0400];
        let doubles = [r0a, r0b, r1a, r1b];

        if self.chr_inversion {
            self.chr_bank[..4].copy_from_slice(&singles);
            self.chr_bank[4..].copy_from_slice(&doubles);
        } else {
            self.chr_bank[..4].copy_from_slice(&doubles);
            self.chr_bank[4..].copy_from_slice(&singles);
        }

        let r6 = (r[6] & 0x3F) * 0x2000;
        if self.prg_mode {
            self.prg_bank[0] = self.second_last_prg();
            self.prg_bank[2] = r6;
        } else {
            self.prg_bank[0] = r6;
            self.prg_bank[2] = self.second_last_prg();
        }
        self.prg_bank[1] = (r[7] & 0x3F) * 0x2000;
        self.prg_bank[3] = self.last_prg();
    }

    fn chr_offset(&self, addr: u16) -> usize {
        self.chr_bank[(addr >> 10) as usize] + (addr & 0x03FF) as usize
    }
}

impl Mapper for Mmc3 {
    fn cpu_map_read(&self, addr: u16) -> Option<CpuMapping> {
        match addr {
            0x6000..=0x7FFF => Some(CpuMapping::Direct(self.ram[(addr & 0x1FFF) as usize])),
            0x8000..=0xFFFF => {
                let slot = ((addr - 0x8000) >> 13) as usize;
                Some(CpuMapping::Prg(
                    self.prg_bank[slot] + (addr & 0x1FFF) as usize,
                ))
            }
            _ => None,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuMapping> {
        let even = addr & 0x0001 == 0;
        match addr {
            0x6000..=0x7FFF => self.ram[(addr & 0x1FFF) as usize] = data,
            0x8000..=0x9FFF => {
                if even {
                    self.target = (data & 0x07) as usize;
                    self.prg_mode = data & 0x40 != 0;
                    self.chr_inversion = data & 0x80 != 0;
                } else {
                    self.registers[self.target] = data as usize;
                }
                self.update_banks();
            }
            0xA000..=0xBFFF => {
                // Odd addresses are PRG RAM protect, not modelled.
                if even {
                    self.mirror = if data & 0x01 != 0 {
                        Mirroring::Horizontal
                    } else {
                        Mirroring::Vertical
                    };
                }
            }
            0xC000..=0xDFFF => {
                if even {
                    self.irq_reload = data;
                } else {
                    self.irq_counter = 0;
                }
            }
            0xE000..=0xFFFF => {
                if even {
                    self.irq_enable = false;
                    self.irq_active = false;
                } else {
                    self.irq_enable = true;
                }
            }
            _ => return None,
        }
        Some(CpuMapping::Direct(data))
    }

    fn ppu_map_read(&mut self, addr: u16) -> Option<usize> {
        (addr < 0x2000).then(|| self.chr_offset(addr))
    }

    fn ppu_map_write(&mut self, addr: u16) -> Option<usize> {
        (addr < 0x2000 && self.chr_banks == 0).then(|| self.chr_offset(addr))
    }

    fn reset(&mut self) {
        self.target = 0;
        self.prg_mode = false;
        self.chr_inversion = false;
        self.mirror = Mirroring::Horizontal;
        self.irq_active = false;
        self.irq_enable = false;
        self.irq_counter = 0;
        self.irq_reload = 0;
        self.registers = [0; 8];
        self.chr_bank = [0; 8];
        self.prg_bank = [0, 0x2000, self.second_last_prg(), self.last_prg()];
    }

    fn mirror(&self) -> Option<Mirroring> {
        Some(self.mirror)
    }

    fn irq_state(&self) -> bool {
        self.irq_active
    }

    fn irq_clear(&mut self) {
        self.irq_active = false;
    }

    fn scanline(&mut self) {
        if self.irq_counter == 0 {
            self.irq_counter = self.irq_reload;
        } else {
            self.irq_counter -= 1;
        }
        if self.irq_counter == 0 && self.irq_enable {
            self.irq_active = true;
        }
    }
}

/// Mapper 66: one register selecting 32KB PRG and 8KB CHR.
#[derive(Debug, Clone)]
pub struct Gxrom {
    chr_banks: usize,
    prg_select: usize,
    chr_select: usize,
}

impl Gxrom {
    pub fn new(_prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            chr_banks,
            prg_select: 0,
            chr_select: 0,
        }
    }
}

impl Mapper for Gxrom {
    fn cpu_map_read(&self, addr: u16) -> Option<CpuMapping> {
        (addr >= 0x8000)
            .then(|| CpuMapping::Prg(self.prg_select * 0x8000 + (addr & 0x7FFF) as usize))
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuMapping> {
        if addr >= 0x8000 {
            self.prg_select = ((data & 0x30) >> 4) as usize;
            self.chr_select = (data & 0x03) as usize;
            Some(CpuMapping::Direct(data))
        } else {
            None
        }
    }

    fn ppu_map_read(&mut self, addr: u16) -> Option<usize> {
        chr_window(addr).map(|a| self.chr_select * 0x2000 + a)
    }

    fn ppu_map_write(&mut self, addr: u16) -> Option<usize> {
        if self.chr_banks == 0 {
            chr_window(addr)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.prg_select = 0;
        self.chr_select = 0;
    }
}
