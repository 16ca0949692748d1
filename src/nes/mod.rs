pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod mapper;
pub mod opcodes;
mod palette;
pub mod ppu;

use anyhow::{Context, Result};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use tracing::{debug, info};

use crate::audio::AudioQueue;
use crate::config::Config;
use bus::Bus;
use cartridge::Cartridge;

pub const BUTTON_A: u8 = 0x80;
pub const BUTTON_B: u8 = 0x40;
pub const BUTTON_SELECT: u8 = 0x20;
pub const BUTTON_START: u8 = 0x10;
pub const BUTTON_UP: u8 = 0x08;
pub const BUTTON_DOWN: u8 = 0x04;
pub const BUTTON_LEFT: u8 = 0x02;
pub const BUTTON_RIGHT: u8 = 0x01;

const NO_ROM: &str = "No ROM loaded";

/// The console as a host sees it: load a game, tick frames, read pixels and
/// samples back out.
pub struct Nes {
    bus: Bus,
    sample_rate: u32,
    audio: Option<Arc<AudioQueue>>,
    frame_count: u64,
    mapper_name: String,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nes {
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        let mut nes = Self {
            bus: Bus::new(),
            sample_rate: config.sample_rate,
            audio: None,
            frame_count: 0,
            mapper_name: NO_ROM.to_string(),
        };
        nes.bus.board.apu.set_sample_rate(config.sample_rate);
        nes
    }

    /// Back to a powered-on console with no cartridge. An attached audio
    /// queue stays attached but is emptied.
    pub fn initialize(&mut self) {
        self.bus = Bus::new();
        self.bus.board.apu.set_sample_rate(self.sample_rate);
        self.frame_count = 0;
        self.mapper_name = NO_ROM.to_string();
        if let Some(queue) = &self.audio {
            queue.clear();
        }
        debug!("console initialized");
    }

    /// Loads an iNES file and resets. On failure the running game, if any,
    /// is left as it was.
    pub fn load_game(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)
            .with_context(|| format!("failed to load ROM: {}", path.display()))?;
        self.install(cart);
        Ok(())
    }

    pub fn load_game_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let cart = Cartridge::from_bytes(bytes).context("failed to load ROM image")?;
        self.install(cart);
        Ok(())
    }

    fn install(&mut self, cart: Cartridge) {
        self.mapper_name = format!("{} (mapper {})", cart.mapper_name(), cart.mapper_id);
        self.bus.insert_cartridge(cart);
        self.reset();
        info!(mapper = %self.mapper_name, "game loaded");
    }

    pub fn has_game(&self) -> bool {
        self.bus.has_cartridge()
    }

    pub fn reset(&mut self) {
        if !self.bus.has_cartridge() {
            return;
        }
        self.bus.reset();
        self.frame_count = 0;
        if let Some(queue) = &self.audio {
            queue.clear();
        }
    }

    /// Runs exactly one frame. No-op without a game.
    pub fn tick(&mut self) {
        if !self.bus.has_cartridge() {
            return;
        }

        self.bus.run_frame();
        self.frame_count += 1;

        if let Some(queue) = &self.audio {
            let samples = self.bus.board.apu.take_samples();
            queue.push_mono(&samples);
        }
    }

    /// 256x240 RGB, row-major.
    pub fn framebuffer(&self) -> &[u8] {
        self.bus.board.ppu.frame_buffer()
    }

    /// `mask` uses the `BUTTON_*` layout. Players other than 0 and 1 are ignored.
    pub fn set_controller_state(&mut self, player: usize, mask: u8) {
        self.bus.board.set_controller(player, mask);
    }

    /// Routes every frame's samples into `queue`, resampled to its rate.
    pub fn attach_audio(&mut self, queue: Arc<AudioQueue>) {
        self.sample_rate = queue.sample_rate();
        self.bus.board.apu.set_sample_rate(self.sample_rate);
        self.audio = Some(queue);
    }

    pub fn detach_audio(&mut self) -> Option<Arc<AudioQueue>> {
        self.audio.take()
    }

    /// Mixed samples produced since the last call, for hosts without a queue.
    pub fn take_audio_samples(&mut self) -> Vec<f32> {
        self.bus.board.apu.take_samples()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn cpu(&self) -> &cpu::Cpu {
        &self.bus.cpu
    }

    pub fn disassemble(&self, start: u16, stop: u16) -> BTreeMap<u16, String> {
        cpu::disassemble(&self.bus.board, start, stop)
    }
}
