use anyhow::Result;
use std::{fs, path::Path};
use tracing::{info, warn};

use super::mapper::{CpuMapping, Mapper, MapperKind, Mirroring};
use crate::error::NesError;

const HEADER_LEN: usize = 16;
const TRAINER_LEN: usize = 512;
const PRG_BANK_SIZE: usize = 16 * 1024;
const CHR_BANK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub prg_banks: usize,
    pub chr_banks: usize,
    pub hardware_mirroring: Mirroring,
    prg_rom: Vec<u8>,
    chr_data: Vec<u8>,
    mapper: MapperKind,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| NesError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid("file is too small to contain an iNES header"));
        }
        if &bytes[0..4] != b"NES\x1A" {
            return Err(invalid("bad iNES magic, expected NES<EOF>"));
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let mapper_id = ((flags7 & 0xF0) | (flags6 >> 4)) as u16;
        let hardware_mirroring = if flags6 & 0x01 != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        // NES 2.0 borrows the PRG-RAM size byte for the high bits of both counts.
        let is_nes2 = flags7 & 0x0C == 0x08;
        let (prg_banks, chr_banks) = if is_nes2 {
            let prg = ((bytes[8] as usize & 0x07) << 8) | bytes[4] as usize;
            let chr = ((bytes[8] as usize & 0x38) << 5) | bytes[5] as usize;
            (prg, chr)
        } else {
            (bytes[4] as usize, bytes[5] as usize)
        };
        if prg_banks == 0 {
            return Err(invalid("header declares no PRG banks"));
        }

        let mut cursor = HEADER_LEN;
        if flags6 & 0x04 != 0 {
            cursor += TRAINER_LEN;
        }

        let prg_end = cursor + prg_banks * PRG_BANK_SIZE;
        let prg_rom = bytes
            .get(cursor..prg_end)
            .ok_or_else(|| {
                invalid(&format!(
                    "truncated: expected {} PRG bytes",
                    prg_banks * PRG_BANK_SIZE
                ))
            })?
            .to_vec();
        cursor = prg_end;

        let chr_data = if chr_banks == 0 {
            vec![0; CHR_BANK_SIZE]
        } else {
            let chr_end = cursor + chr_banks * CHR_BANK_SIZE;
            bytes
                .get(cursor..chr_end)
                .ok_or_else(|| {
                    invalid(&format!(
                        "truncated: expected {} CHR bytes",
                        chr_banks * CHR_BANK_SIZE
                    ))
                })?
                .to_vec()
        };

        let mapper = MapperKind::new(mapper_id, prg_banks, chr_banks).inspect_err(|_| {
            warn!(mapper_id, "rejecting cartridge with unsupported mapper");
        })?;

        info!(
            mapper_id,
            mapper = mapper.name(),
            prg_banks,
            chr_banks,
            chr_ram = chr_banks == 0,
            nes2 = is_nes2,
            mirroring = ?hardware_mirroring,
            "loaded cartridge"
        );

        Ok(Self {
            mapper_id,
            prg_banks,
            chr_banks,
            hardware_mirroring,
            prg_rom,
            chr_data,
            mapper,
        })
    }

    pub fn mapper_name(&self) -> &'static str {
        self.mapper.name()
    }

    pub fn chr_is_ram(&self) -> bool {
        self.chr_banks == 0
    }

    /// `None` when the cartridge does not claim `addr`. Reads never change
    /// mapper state, so this doubles as the disassembler's peek.
    pub fn cpu_read(&self, addr: u16) -> Option<u8> {
        match self.mapper.cpu_map_read(addr)? {
            CpuMapping::Prg(offset) => Some(self.prg_rom[offset % self.prg_rom.len()]),
            CpuMapping::Direct(data) => Some(data),
        }
    }

    /// Returns whether the cartridge claimed the write.
    pub fn cpu_write(&mut self, addr: u16, data: u8) -> bool {
        match self.mapper.cpu_map_write(addr, data) {
            Some(CpuMapping::Prg(offset)) => {
                let len = self.prg_rom.len();
                self.prg_rom[offset % len] = data;
                true
            }
            Some(CpuMapping::Direct(_)) => true,
            None => false,
        }
    }

    pub fn ppu_read(&mut self, addr: u16) -> Option<u8> {
        let offset = self.mapper.ppu_map_read(addr)?;
        Some(self.chr_data[offset % self.chr_data.len()])
    }

    pub fn ppu_write(&mut self, addr: u16, data: u8) -> bool {
        match self.mapper.ppu_map_write(addr) {
            Some(offset) => {
                let len = self.chr_data.len();
                self.chr_data[offset % len] = data;
                true
            }
            None => false,
        }
    }

    /// Effective nametable arrangement: the mapper's choice when it has one,
    /// otherwise the solder pads from the header.
    pub fn mirroring(&self) -> Mirroring {
        self.mapper.mirror().unwrap_or(self.hardware_mirroring)
    }

    pub fn reset(&mut self) {
        self.mapper.reset();
    }

    pub fn irq_state(&self) -> bool {
        self.mapper.irq_state()
    }

    pub fn irq_clear(&mut self) {
        self.mapper.irq_clear();
    }

    pub fn scanline(&mut self) {
        self.mapper.scanline();
    }
}

fn invalid(reason: &str) -> anyhow::Error {
    NesError::InvalidRom(reason.to_string()).into()
}

/// In-memory iNES images for tests across the crate.
#[cfg(test)]
pub(crate) mod test_rom {
    /// `total` bytes split into `bank_size` banks, bank `i` filled with `i + 1`.
    pub fn patterned_banks(total: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0; total];
        for (i, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((i as u8).wrapping_add(1));
        }
        data
    }

    pub fn build_ines(mapper_id: u8, flags6_low: u8, prg: &[u8], chr: &[u8]) -> Vec<u8> {
        let mut rom = Vec::with_capacity(16 + prg.len() + chr.len());
        rom.extend_from_slice(b"NES\x1A");
        rom.push((prg.len() / (16 * 1024)) as u8);
        rom.push((chr.len() / (8 * 1024)) as u8);
        rom.push(((mapper_id & 0x0F) << 4) | (flags6_low & 0x0F));
        rom.push(mapper_id & 0xF0);
        rom.extend_from_slice(&[0; 8]);
        rom.extend_from_slice(prg);
        rom.extend_from_slice(chr);
        rom
    }

    /// 32KB NROM image whose reset vector points at `entry` and whose code at
    /// `entry` is `program`. Remaining PRG is filled with NOPs.
    pub fn nrom_with_program(entry: u16, program: &[u8]) -> Vec<u8> {
        let mut prg = vec![0xEA; 32 * 1024];
        let start = (entry as usize) & 0x7FFF;
        prg[start..start + program.len()].copy_from_slice(program);
        prg[0x7FFC] = entry as u8;
        prg[0x7FFD] = (entry >> 8) as u8;
        build_ines(0, 0, &prg, &vec![0; 8 * 1024])
    }
}
