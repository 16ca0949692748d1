use tracing::debug;

use super::apu::Apu;
use super::cartridge::Cartridge;
use super::cpu::{Cpu, CpuBus};
use super::ppu::Ppu;

/// CPU cycles the DMC reader steals per sample byte.
const DMC_STALL_CYCLES: u8 = 4;

#[derive(Debug, Clone, Copy)]
struct OamDma {
    page: u8,
    addr: u8,
    data: u8,
    /// Waiting for an odd system clock before the first read.
    dummy: bool,
    active: bool,
}

impl Default for OamDma {
    fn default() -> Self {
        Self {
            page: 0,
            addr: 0,
            data: 0,
            dummy: true,
            active: false,
        }
    }
}

/// Everything the CPU can address.
pub struct Board {
    ram: [u8; 2048],
    pub ppu: Ppu,
    pub apu: Apu,
    cart: Option<Cartridge>,
    controllers: [u8; 2],
    controller_shift: [u8; 2],
    dma: OamDma,
}

impl Default for Board {
    fn default() -> Self {
        Self::new()
    }
}

impl Board {
    pub fn new() -> Self {
        Self {
            ram: [0; 2048],
            ppu: Ppu::new(),
            apu: Apu::new(),
            cart: None,
            controllers: [0; 2],
            controller_shift: [0; 2],
            dma: OamDma::default(),
        }
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.cart.as_ref()
    }

    /// Live button mask for `player` (0 or 1), latched on the next `$4016` write.
    pub fn set_controller(&mut self, player: usize, state: u8) {
        if let Some(slot) = self.controllers.get_mut(player) {
            *slot = state;
        }
    }

    pub fn dma_active(&self) -> bool {
        self.dma.active
    }

    fn start_dma(&mut self, page: u8) {
        self.dma.page = page;
        self.dma.addr = 0;
        self.dma.active = true;
    }

    /// One CPU slot of OAM DMA: reads on even system clocks, writes on odd.
    fn step_dma(&mut self, system_clock: u64) {
        if self.dma.dummy {
            if system_clock % 2 == 1 {
                self.dma.dummy = false;
            }
        } else if system_clock % 2 == 0 {
            let addr = ((self.dma.page as u16) << 8) | self.dma.addr as u16;
            self.dma.data = self.read(addr);
        } else {
            self.ppu.write_oam(self.dma.addr, self.dma.data);
            self.dma.addr = self.dma.addr.wrapping_add(1);
            if self.dma.addr == 0 {
                self.dma.active = false;
                self.dma.dummy = true;
            }
        }
    }

    fn irq_line(&self) -> bool {
        self.apu.irq_pending() || self.cart.as_ref().is_some_and(|cart| cart.irq_state())
    }
}

impl CpuBus for Board {
    fn read(&mut self, addr: u16) -> u8 {
        if let Some(value) = self.cart.as_ref().and_then(|cart| cart.cpu_read(addr)) {
            return value;
        }

        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],
            0x2000..=0x3FFF => match self.cart.as_mut() {
                Some(cart) => self.ppu.cpu_read_register(addr & 0x0007, cart),
                None => 0,
            },
            0x4016 | 0x4017 => {
                let port = (addr & 0x0001) as usize;
                let bit = (self.controller_shift[port] & 0x80) != 0;
                self.controller_shift[port] <<= 1;
                bit as u8
            }
            0x4015 => self.apu.read_status(),
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, data: u8) {
        if self.cart.as_mut().is_some_and(|cart| cart.cpu_write(addr, data)) {
            return;
        }

        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize] = data,
            0x2000..=0x3FFF => {
                if let Some(cart) = self.cart.as_mut() {
                    self.ppu.cpu_write_register(addr & 0x0007, data, cart);
                }
            }
            0x4014 => self.start_dma(data),
            0x4016 => self.controller_shift = self.controllers,
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.write_register(addr, data),
            _ => {}
        }
    }

    fn peek(&self, addr: u16) -> u8 {
        if let Some(value) = self.cart.as_ref().and_then(|cart| cart.cpu_read(addr)) {
            return value;
        }
        match addr {
            0x0000..=0x1FFF => self.ram[(addr & 0x07FF) as usize],
            _ => 0,
        }
    }
}

/// Owns the CPU and the board and runs them at the 3:1 PPU:CPU ratio.
#[derive(Default)]
pub struct Bus {
    pub cpu: Cpu,
    pub board: Board,
    system_clock: u64,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `cart`, returning the previous one. Call `reset` afterwards.
    pub fn insert_cartridge(&mut self, cart: Cartridge) -> Option<Cartridge> {
        self.board.cart.replace(cart)
    }

    pub fn has_cartridge(&self) -> bool {
        self.board.cart.is_some()
    }

    pub fn system_clock(&self) -> u64 {
        self.system_clock
    }

    pub fn reset(&mut self) {
        if let Some(cart) = self.board.cart.as_mut() {
            cart.reset();
        }
        self.board.ppu.reset();
        self.board.apu.reset();
        self.board.dma = OamDma::default();
        self.board.controller_shift = [0; 2];
        self.cpu.reset(&mut self.board);
        self.system_clock = 0;
        debug!("CPU reset, PC=${:04X}", self.cpu.pc);
    }

    /// One PPU dot. Does nothing without a cartridge.
    pub fn clock(&mut self) {
        let Some(cart) = self.board.cart.as_mut() else {
            return;
        };
        self.board.ppu.clock(cart);

        if self.system_clock % 3 == 0 {
            if self.board.dma.active {
                self.board.step_dma(self.system_clock);
            } else {
                if self.cpu.complete() && self.board.irq_line() && self.cpu.irq(&mut self.board)
                {
                    if let Some(cart) = self.board.cart.as_mut() {
                        cart.irq_clear();
                    }
                }
                self.cpu.clock(&mut self.board);
            }

            self.board.apu.clock();
            if let Some(addr) = self.board.apu.take_dmc_dma_request() {
                let value = self.board.read(addr);
                self.board.apu.complete_dmc_dma(value);
                self.cpu.stall(DMC_STALL_CYCLES);
            }
        }

        if self.board.ppu.take_nmi() {
            self.cpu.nmi(&mut self.board);
        }

        self.system_clock += 1;
    }

    /// Clocks until the PPU finishes a frame, then clears the flag.
    pub fn run_frame(&mut self) {
        if !self.has_cartridge() {
            return;
        }
        while !self.board.ppu.frame_complete() {
            self.clock();
        }
        self.board.ppu.clear_frame_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::test_rom::nrom_with_program;
    use crate::nes::cpu::FLAG_INTERRUPT;

    fn bus_with_program(program: &[u8]) -> Bus {
        let rom = nrom_with_program(0xC000, program);
        let mut bus = Bus::new();
        bus.insert_cartridge(Cartridge::from_bytes(&rom).unwrap());
        bus.reset();
        bus
    }

    #[test]
    fn reset_vector_sets_pc() {
        let bus = bus_with_program(&[]);
        assert_eq!(bus.cpu.pc, 0xC000);
    }

    #[test]
    fn ram_is_mirrored_every_2k() {
        let mut bus = bus_with_program(&[]);
        bus.board.write(0x0001, 0x42);
        for addr in [0x0801, 0x1001, 0x1801] {
            assert_eq!(bus.board.read(addr), 0x42);
        }
        bus.board.write(0x1FFF, 0x17);
        assert_eq!(bus.board.peek(0x07FF), 0x17);
    }

    #[test]
    fn cartridge_wins_over_board() {
        let bus = bus_with_program(&[0xA9, 0x33]);
        assert_eq!(bus.board.peek(0xC000), 0xA9);
        assert_eq!(bus.board.peek(0xC001), 0x33);
        assert_eq!(bus.board.peek(0x8000), 0xEA);
    }

    #[test]
    fn controller_shifts_msb_first() {
        let mut bus = bus_with_program(&[]);
        bus.board.set_controller(0, 0x81);
        bus.board.set_controller(1, 0x40);
        bus.board.write(0x4016, 1);

        let bits: Vec<u8> = (0..8).map(|_| bus.board.read(0x4016)).collect();
        assert_eq!(bits, [1, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(bus.board.read(0x4016), 0);

        assert_eq!(bus.board.read(0x4017), 0);
        assert_eq!(bus.board.read(0x4017), 1);
    }

    #[test]
    fn controller_state_needs_a_latch() {
        let mut bus = bus_with_program(&[]);
        bus.board.set_controller(0, 0xFF);
        assert_eq!(bus.board.read(0x4016), 0);
        bus.board.write(0x4016, 0);
        assert_eq!(bus.board.read(0x4016), 1);
    }

    #[test]
    fn oam_dma_copies_page_and_stalls_cpu() {
        let mut stalls = Vec::new();
        // The zero-page load shifts the trigger by one CPU cycle.
        for prefix in [&[][..], &[0xA5, 0x00][..]] {
            let mut program = prefix.to_vec();
            program.extend_from_slice(&[0xA9, 0x02, 0x8D, 0x14, 0x40]);
            let mut bus = bus_with_program(&program);
            for i in 0..=255u16 {
                bus.board.write(0x0200 + i, i as u8 ^ 0x5A);
            }

            let mut guard = 0;
            while !bus.board.dma_active() {
                bus.clock();
                guard += 1;
                assert!(guard < 10_000);
            }

            let cpu_clocks = bus.cpu.clock_count();
            let mut stalled = 0;
            while bus.board.dma_active() {
                if bus.system_clock() % 3 == 0 {
                    stalled += 1;
                }
                bus.clock();
            }
            assert_eq!(bus.cpu.clock_count(), cpu_clocks);
            stalls.push(stalled);

            let oam = bus.board.ppu.oam();
            for i in 0..256 {
                assert_eq!(oam[i], i as u8 ^ 0x5A);
            }
        }

        stalls.sort();
        assert_eq!(stalls, [513, 514]);
    }

    #[test]
    fn apu_frame_irq_reaches_cpu() {
        let mut bus = bus_with_program(&[]);
        let mut guard = 0u64;
        while bus.cpu.sp == 0xFD {
            bus.clock();
            guard += 1;
            assert!(guard < 3 * 30_000);
        }
        // Vector bytes come from the NOP fill.
        assert_eq!(bus.cpu.pc, 0xEAEA);
        assert!(bus.cpu.get_flag(FLAG_INTERRUPT));
        assert!(bus.cpu.clock_count() >= 22_000);
    }

    #[test]
    fn nothing_runs_without_cartridge() {
        let mut bus = Bus::new();
        bus.clock();
        bus.run_frame();
        assert_eq!(bus.system_clock(), 0);
        assert_eq!(bus.cpu.clock_count(), 0);
    }

    #[test]
    fn run_frame_clears_completion() {
        let mut bus = bus_with_program(&[]);
        bus.run_frame();
        assert!(!bus.board.ppu.frame_complete());
        assert_eq!(bus.board.ppu.position(), (-1, 0));
        let first = bus.system_clock();
        bus.run_frame();
        assert_eq!(bus.system_clock() - first, 341 * 262);
    }
}
