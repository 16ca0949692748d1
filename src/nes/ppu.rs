use super::cartridge::Cartridge;
use super::mapper::Mirroring;
use super::palette::NES_PALETTE;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

const CTRL_NAMETABLE_X: u8 = 0x01;
const CTRL_NAMETABLE_Y: u8 = 0x02;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_NMI_ENABLE: u8 = 0x80;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

const ATTR_PALETTE: u8 = 0x03;
const ATTR_BEHIND_BG: u8 = 0x20;
const ATTR_FLIP_H: u8 = 0x40;
const ATTR_FLIP_V: u8 = 0x80;

/// 15-bit scroll/address register: `yyy NN YYYYY XXXXX`
/// (fine Y, nametable select, coarse Y, coarse X).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Loopy(u16);

impl Loopy {
    const COARSE_X: u16 = 0x001F;
    const COARSE_Y: u16 = 0x03E0;
    const NAMETABLE_X: u16 = 0x0400;
    const NAMETABLE_Y: u16 = 0x0800;
    const FINE_Y: u16 = 0x7000;

    fn coarse_x(self) -> u16 {
        self.0 & Self::COARSE_X
    }

    fn set_coarse_x(&mut self, v: u16) {
        self.0 = (self.0 & !Self::COARSE_X) | (v & 0x1F);
    }

    fn coarse_y(self) -> u16 {
        (self.0 & Self::COARSE_Y) >> 5
    }

    fn set_coarse_y(&mut self, v: u16) {
        self.0 = (self.0 & !Self::COARSE_Y) | ((v & 0x1F) << 5);
    }

    fn nametable_x(self) -> u16 {
        (self.0 & Self::NAMETABLE_X) >> 10
    }

    fn set_nametable_x(&mut self, v: u16) {
        self.0 = (self.0 & !Self::NAMETABLE_X) | ((v & 0x01) << 10);
    }

    fn nametable_y(self) -> u16 {
        (self.0 & Self::NAMETABLE_Y) >> 11
    }

    fn set_nametable_y(&mut self, v: u16) {
        self.0 = (self.0 & !Self::NAMETABLE_Y) | ((v & 0x01) << 11);
    }

    fn fine_y(self) -> u16 {
        (self.0 & Self::FINE_Y) >> 12
    }

    fn set_fine_y(&mut self, v: u16) {
        self.0 = (self.0 & !Self::FINE_Y) | ((v & 0x07) << 12);
    }
}

#[derive(Debug, Clone, Copy)]
struct SpriteEntry {
    y: u8,
    tile: u8,
    attr: u8,
    x: u8,
}

impl SpriteEntry {
    const HIDDEN: Self = Self {
        y: 0xFF,
        tile: 0xFF,
        attr: 0xFF,
        x: 0xFF,
    };
}

pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    oam: [u8; 256],

    nametables: [[u8; 1024]; 2],
    pattern_ram: [[u8; 4096]; 2],
    palette_ram: [u8; 32],

    write_toggle: bool,
    data_buffer: u8,
    v: Loopy,
    t: Loopy,
    fine_x: u8,

    scanline: i16,
    cycle: i16,
    odd_frame: bool,
    frame_complete: bool,
    nmi: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u16,
    bg_shift_attr_hi: u16,

    sprites: [SpriteEntry; 8],
    sprite_count: usize,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_zero_possible: bool,
    sprite_zero_rendering: bool,

    frame_buffer: Vec<u8>,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0; 256],
            nametables: [[0; 1024]; 2],
            pattern_ram: [[0; 4096]; 2],
            palette_ram: [0; 32],
            write_toggle: false,
            data_buffer: 0,
            v: Loopy::default(),
            t: Loopy::default(),
            fine_x: 0,
            scanline: -1,
            cycle: 0,
            odd_frame: false,
            frame_complete: false,
            nmi: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            sprites: [SpriteEntry::HIDDEN; 8],
            sprite_count: 0,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_zero_possible: false,
            sprite_zero_rendering: false,
            frame_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT * 3],
        }
    }

    /// Register and timing state go back to power-on; memories are kept.
    pub fn reset(&mut self) {
        self.ctrl = 0;
        self.mask = 0;
        self.status = 0;
        self.oam_addr = 0;
        self.write_toggle = false;
        self.data_buffer = 0;
        self.v = Loopy::default();
        self.t = Loopy::default();
        self.fine_x = 0;
        self.scanline = -1;
        self.cycle = 0;
        self.odd_frame = false;
        self.frame_complete = false;
        self.nmi = false;
        self.next_tile_id = 0;
        self.next_tile_attr = 0;
        self.next_tile_lsb = 0;
        self.next_tile_msb = 0;
        self.bg_shift_pattern_lo = 0;
        self.bg_shift_pattern_hi = 0;
        self.bg_shift_attr_lo = 0;
        self.bg_shift_attr_hi = 0;
        self.sprite_count = 0;
        self.sprite_zero_possible = false;
        self.sprite_zero_rendering = false;
    }

    /// 256x240 RGB, row-major, three bytes per pixel.
    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    pub fn frame_complete(&self) -> bool {
        self.frame_complete
    }

    pub fn clear_frame_complete(&mut self) {
        self.frame_complete = false;
    }

    /// `(scanline, cycle)` of the next dot to be clocked.
    pub fn position(&self) -> (i16, i16) {
        (self.scanline, self.cycle)
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi)
    }

    pub fn write_oam(&mut self, index: u8, data: u8) {
        self.oam[index as usize] = data;
    }

    pub fn oam(&self) -> &[u8; 256] {
        &self.oam
    }

    pub fn cpu_read_register(&mut self, addr: u16, cart: &mut Cartridge) -> u8 {
        match addr & 0x0007 {
            0x0002 => {
                let value = (self.status & 0xE0) | (self.data_buffer & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                value
            }
            0x0004 => self.oam[self.oam_addr as usize],
            0x0007 => {
                let addr = self.v.0 & 0x3FFF;
                let mut value = self.data_buffer;
                self.data_buffer = self.ppu_read(addr, cart);
                if addr >= 0x3F00 {
                    value = self.data_buffer;
                }
                self.increment_vram_addr();
                value
            }
            // Write-only registers.
            _ => 0,
        }
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, cart: &mut Cartridge) {
        match addr & 0x0007 {
            0x0000 => {
                self.ctrl = value;
                self.t.set_nametable_x((value & CTRL_NAMETABLE_X) as u16);
                self.t.set_nametable_y(((value & CTRL_NAMETABLE_Y) >> 1) as u16);
            }
            0x0001 => self.mask = value,
            0x0003 => self.oam_addr = value,
            0x0004 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x0005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t.set_coarse_x((value >> 3) as u16);
                } else {
                    self.t.set_fine_y((value & 0x07) as u16);
                    self.t.set_coarse_y((value >> 3) as u16);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x0006 => {
                if !self.write_toggle {
                    self.t.0 = ((value as u16 & 0x3F) << 8) | (self.t.0 & 0x00FF);
                } else {
                    self.t.0 = (self.t.0 & 0xFF00) | value as u16;
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x0007 => {
                self.ppu_write(self.v.0 & 0x3FFF, value, cart);
                self.increment_vram_addr();
            }
            _ => {}
        }
    }

    /// Advances one dot.
    pub fn clock(&mut self, cart: &mut Cartridge) {
        if self.scanline >= -1 && self.scanline < 240 {
            if self.scanline == 0 && self.cycle == 0 && self.odd_frame && self.rendering_enabled()
            {
                self.cycle = 1;
            }

            if self.scanline == -1 && self.cycle == 1 {
                self.status &= !(STATUS_VBLANK | STATUS_SPRITE_OVERFLOW | STATUS_SPRITE_ZERO_HIT);
                // Nothing is evaluated on the pre-render line; drop line 239's picks.
                self.sprites = [SpriteEntry::HIDDEN; 8];
                self.sprite_count = 0;
                self.sprite_zero_possible = false;
                self.sprite_patterns_lo = [0; 8];
                self.sprite_patterns_hi = [0; 8];
            }

            if (2..258).contains(&self.cycle) || (321..338).contains(&self.cycle) {
                self.update_shifters();
                match (self.cycle - 1) % 8 {
                    0 => {
                        self.load_background_shifters();
                        self.next_tile_id = self.ppu_read(0x2000 | (self.v.0 & 0x0FFF), cart);
                    }
                    2 => {
                        let addr = 0x23C0
                            | (self.v.nametable_y() << 11)
                            | (self.v.nametable_x() << 10)
                            | ((self.v.coarse_y() >> 2) << 3)
                            | (self.v.coarse_x() >> 2);
                        let mut attr = self.ppu_read(addr, cart);
                        if self.v.coarse_y() & 0x02 != 0 {
                            attr >>= 4;
                        }
                        if self.v.coarse_x() & 0x02 != 0 {
                            attr >>= 2;
                        }
                        self.next_tile_attr = attr & 0x03;
                    }
                    4 => {
                        let addr = self.background_pattern_addr();
                        self.next_tile_lsb = self.ppu_read(addr, cart);
                    }
                    6 => {
                        let addr = self.background_pattern_addr() + 8;
                        self.next_tile_msb = self.ppu_read(addr, cart);
                    }
                    7 => self.increment_scroll_x(),
                    _ => {}
                }
            }

            if self.cycle == 256 {
                self.increment_scroll_y();
            }

            if self.cycle == 257 {
                self.load_background_shifters();
                self.transfer_address_x();
            }

            // Unused nametable fetches at the end of the line.
            if self.cycle == 338 || self.cycle == 340 {
                self.next_tile_id = self.ppu_read(0x2000 | (self.v.0 & 0x0FFF), cart);
            }

            if self.scanline == -1 && (280..305).contains(&self.cycle) {
                self.transfer_address_y();
            }

            if self.cycle == 257 && self.scanline >= 0 {
                self.evaluate_sprites();
            }

            if self.cycle == 340 {
                self.fetch_sprite_patterns(cart);
            }
        }

        if self.scanline == 241 && self.cycle == 1 {
            self.status |= STATUS_VBLANK;
            if self.ctrl & CTRL_NMI_ENABLE != 0 {
                self.nmi = true;
            }
        }

        self.render_pixel(cart);

        self.cycle += 1;
        if self.rendering_enabled() && self.cycle == 260 && self.scanline < 240 {
            cart.scanline();
        }

        if self.cycle >= 341 {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline >= 261 {
                self.scanline = -1;
                self.frame_complete = true;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    fn rendering_enabled(&self) -> bool {
        self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES) != 0
    }

    fn background_pattern_addr(&self) -> u16 {
        let table = ((self.ctrl & CTRL_BG_TABLE) as u16) << 8;
        table + ((self.next_tile_id as u16) << 4) + self.v.fine_y()
    }

    fn render_pixel(&mut self, cart: &mut Cartridge) {
        let (bg_pixel, bg_palette) = self.background_sample();
        let (fg_pixel, fg_palette, fg_in_front) = self.sprite_sample();

        let (pixel, palette) = match (bg_pixel, fg_pixel) {
            (0, 0) => (0, 0),
            (0, _) => (fg_pixel, fg_palette),
            (_, 0) => (bg_pixel, bg_palette),
            _ => {
                if self.sprite_zero_possible
                    && self.sprite_zero_rendering
                    && self.mask & MASK_SHOW_BG != 0
                    && self.mask & MASK_SHOW_SPRITES != 0
                {
                    let left_clipped = self.mask & MASK_SHOW_BG_LEFT == 0
                        || self.mask & MASK_SHOW_SPRITE_LEFT == 0;
                    let first = if left_clipped { 9 } else { 1 };
                    if (first..258).contains(&self.cycle) {
                        self.status |= STATUS_SPRITE_ZERO_HIT;
                    }
                }
                if fg_in_front {
                    (fg_pixel, fg_palette)
                } else {
                    (bg_pixel, bg_palette)
                }
            }
        };

        let x = self.cycle - 1;
        let y = self.scanline;
        if (0..FRAME_WIDTH as i16).contains(&x) && (0..FRAME_HEIGHT as i16).contains(&y) {
            let rgb = self.palette_rgb(palette, pixel, cart);
            let offset = (y as usize * FRAME_WIDTH + x as usize) * 3;
            self.frame_buffer[offset..offset + 3].copy_from_slice(&rgb);
        }
    }

    fn background_sample(&self) -> (u8, u8) {
        if self.mask & MASK_SHOW_BG == 0 {
            return (0, 0);
        }
        if self.mask & MASK_SHOW_BG_LEFT == 0 && self.cycle < 9 {
            return (0, 0);
        }
        let bit = 0x8000u16 >> self.fine_x;
        let p0 = (self.bg_shift_pattern_lo & bit != 0) as u8;
        let p1 = (self.bg_shift_pattern_hi & bit != 0) as u8;
        let a0 = (self.bg_shift_attr_lo & bit != 0) as u8;
        let a1 = (self.bg_shift_attr_hi & bit != 0) as u8;
        ((p1 << 1) | p0, (a1 << 1) | a0)
    }

    /// First opaque sprite wins; returns (pixel, palette, in front of background).
    fn sprite_sample(&mut self) -> (u8, u8, bool) {
        self.sprite_zero_rendering = false;
        if self.mask & MASK_SHOW_SPRITES == 0 {
            return (0, 0, false);
        }
        if self.mask & MASK_SHOW_SPRITE_LEFT == 0 && self.cycle < 9 {
            return (0, 0, false);
        }
        for i in 0..self.sprite_count {
            let sprite = self.sprites[i];
            if sprite.x != 0 {
                continue;
            }
            let lo = (self.sprite_patterns_lo[i] & 0x80 != 0) as u8;
            let hi = (self.sprite_patterns_hi[i] & 0x80 != 0) as u8;
            let pixel = (hi << 1) | lo;
            if pixel != 0 {
                if i == 0 {
                    self.sprite_zero_rendering = true;
                }
                let palette = (sprite.attr & ATTR_PALETTE) + 0x04;
                return (pixel, palette, sprite.attr & ATTR_BEHIND_BG == 0);
            }
        }
        (0, 0, false)
    }

    fn update_shifters(&mut self) {
        if self.mask & MASK_SHOW_BG != 0 {
            self.bg_shift_pattern_lo <<= 1;
            self.bg_shift_pattern_hi <<= 1;
            self.bg_shift_attr_lo <<= 1;
            self.bg_shift_attr_hi <<= 1;
        }

        if self.mask & MASK_SHOW_SPRITES != 0 && (1..258).contains(&self.cycle) {
            for i in 0..self.sprite_count {
                if self.sprites[i].x > 0 {
                    self.sprites[i].x -= 1;
                } else {
                    self.sprite_patterns_lo[i] <<= 1;
                    self.sprite_patterns_hi[i] <<= 1;
                }
            }
        }
    }

    fn load_background_shifters(&mut self) {
        let spread = |bit: bool| if bit { 0x00FF } else { 0x0000 };
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;
        self.bg_shift_attr_lo =
            (self.bg_shift_attr_lo & 0xFF00) | spread(self.next_tile_attr & 0x01 != 0);
        self.bg_shift_attr_hi =
            (self.bg_shift_attr_hi & 0xFF00) | spread(self.next_tile_attr & 0x02 != 0);
    }

    fn increment_scroll_x(&mut self) {
        if !self.rendering_enabled() {
            return;
        }
        if self.v.coarse_x() == 31 {
            self.v.set_coarse_x(0);
            self.v.set_nametable_x(self.v.nametable_x() ^ 1);
        } else {
            self.v.set_coarse_x(self.v.coarse_x() + 1);
        }
    }

    fn increment_scroll_y(&mut self) {
        if !self.rendering_enabled() {
            return;
        }
        if self.v.fine_y() < 7 {
            self.v.set_fine_y(self.v.fine_y() + 1);
            return;
        }
        self.v.set_fine_y(0);
        match self.v.coarse_y() {
            29 => {
                self.v.set_coarse_y(0);
                self.v.set_nametable_y(self.v.nametable_y() ^ 1);
            }
            // Attribute rows: wrap without switching nametables.
            31 => self.v.set_coarse_y(0),
            y => self.v.set_coarse_y(y + 1),
        }
    }

    fn transfer_address_x(&mut self) {
        if self.rendering_enabled() {
            self.v.set_nametable_x(self.t.nametable_x());
            self.v.set_coarse_x(self.t.coarse_x());
        }
    }

    fn transfer_address_y(&mut self) {
        if self.rendering_enabled() {
            self.v.set_fine_y(self.t.fine_y());
            self.v.set_nametable_y(self.t.nametable_y());
            self.v.set_coarse_y(self.t.coarse_y());
        }
    }

    fn sprite_height(&self) -> i16 {
        if self.ctrl & CTRL_SPRITE_SIZE_16 != 0 {
            16
        } else {
            8
        }
    }

    /// Selects up to eight sprites from OAM for the next line.
    fn evaluate_sprites(&mut self) {
        self.sprites = [SpriteEntry::HIDDEN; 8];
        self.sprite_patterns_lo = [0; 8];
        self.sprite_patterns_hi = [0; 8];
        self.sprite_zero_possible = false;

        let height = self.sprite_height();
        let mut found = 0usize;
        for (n, entry) in self.oam.chunks_exact(4).enumerate() {
            let diff = self.scanline - entry[0] as i16;
            if !(0..height).contains(&diff) {
                continue;
            }
            if found == 8 {
                self.status |= STATUS_SPRITE_OVERFLOW;
                break;
            }
            if n == 0 {
                self.sprite_zero_possible = true;
            }
            self.sprites[found] = SpriteEntry {
                y: entry[0],
                tile: entry[1],
                attr: entry[2],
                x: entry[3],
            };
            found += 1;
        }
        self.sprite_count = found;
    }

    fn fetch_sprite_patterns(&mut self, cart: &mut Cartridge) {
        for i in 0..self.sprite_count {
            let sprite = self.sprites[i];
            let row = (self.scanline - sprite.y as i16) as u16;
            let flip_v = sprite.attr & ATTR_FLIP_V != 0;

            let addr_lo = if self.ctrl & CTRL_SPRITE_SIZE_16 == 0 {
                let table = ((self.ctrl & CTRL_SPRITE_TABLE) as u16) << 9;
                let line = if flip_v { 7 - row } else { row };
                table | ((sprite.tile as u16) << 4) | line
            } else {
                let table = ((sprite.tile & 0x01) as u16) << 12;
                let top = (sprite.tile & 0xFE) as u16;
                let upper_half = row < 8;
                let tile = if upper_half != flip_v { top } else { top + 1 };
                let line = if flip_v { 7 - (row & 0x07) } else { row & 0x07 };
                table | (tile << 4) | line
            };

            let mut lo = self.ppu_read(addr_lo, cart);
            let mut hi = self.ppu_read(addr_lo + 8, cart);
            if sprite.attr & ATTR_FLIP_H != 0 {
                lo = lo.reverse_bits();
                hi = hi.reverse_bits();
            }
            self.sprite_patterns_lo[i] = lo;
            self.sprite_patterns_hi[i] = hi;
        }
    }

    fn increment_vram_addr(&mut self) {
        let step = if self.ctrl & CTRL_VRAM_INC_32 != 0 { 32 } else { 1 };
        self.v.0 = self.v.0.wrapping_add(step) & 0x7FFF;
    }

    fn palette_rgb(&mut self, palette: u8, pixel: u8, cart: &mut Cartridge) -> [u8; 3] {
        let addr = 0x3F00 + ((palette as u16) << 2) + pixel as u16;
        NES_PALETTE[(self.ppu_read(addr, cart) & 0x3F) as usize]
    }

    fn palette_index(addr: u16) -> usize {
        let index = (addr & 0x001F) as usize;
        match index {
            0x10 | 0x14 | 0x18 | 0x1C => index - 0x10,
            _ => index,
        }
    }

    fn nametable_slot(addr: u16, mirroring: Mirroring) -> (usize, usize) {
        let addr = addr & 0x0FFF;
        let table = match mirroring {
            Mirroring::Vertical => (addr >> 10) & 0x01,
            Mirroring::Horizontal => (addr >> 11) & 0x01,
            Mirroring::OneScreenLower => 0,
            Mirroring::OneScreenUpper => 1,
        };
        (table as usize, (addr & 0x03FF) as usize)
    }

    fn ppu_read(&mut self, addr: u16, cart: &mut Cartridge) -> u8 {
        let addr = addr & 0x3FFF;
        if let Some(value) = cart.ppu_read(addr) {
            return value;
        }
        match addr {
            0x0000..=0x1FFF => {
                self.pattern_ram[((addr & 0x1000) >> 12) as usize][(addr & 0x0FFF) as usize]
            }
            0x2000..=0x3EFF => {
                let (table, offset) = Self::nametable_slot(addr, cart.mirroring());
                self.nametables[table][offset]
            }
            _ => {
                let mask = if self.mask & MASK_GRAYSCALE != 0 {
                    0x30
                } else {
                    0x3F
                };
                self.palette_ram[Self::palette_index(addr)] & mask
            }
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, cart: &mut Cartridge) {
        let addr = addr & 0x3FFF;
        if cart.ppu_write(addr, value) {
            return;
        }
        match addr {
            0x0000..=0x1FFF => {
                self.pattern_ram[((addr & 0x1000) >> 12) as usize][(addr & 0x0FFF) as usize] =
                    value;
            }
            0x2000..=0x3EFF => {
                let (table, offset) = Self::nametable_slot(addr, cart.mirroring());
                self.nametables[table][offset] = value;
            }
            _ => self.palette_ram[Self::palette_index(addr)] = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::test_rom::build_ines;

    const DOTS_PER_FRAME: usize = 262 * 341;

    fn cart(mapper: u8, flags6: u8) -> Cartridge {
        let rom = build_ines(mapper, flags6, &vec![0; 0x8000], &[]);
        Cartridge::from_bytes(&rom).unwrap()
    }

    fn set_addr(ppu: &mut Ppu, cart: &mut Cartridge, addr: u16) {
        ppu.cpu_write_register(0x2006, (addr >> 8) as u8, cart);
        ppu.cpu_write_register(0x2006, addr as u8, cart);
    }

    fn write_vram(ppu: &mut Ppu, cart: &mut Cartridge, addr: u16, value: u8) {
        set_addr(ppu, cart, addr);
        ppu.cpu_write_register(0x2007, value, cart);
    }

    fn read_vram(ppu: &mut Ppu, cart: &mut Cartridge, addr: u16) -> u8 {
        set_addr(ppu, cart, addr);
        ppu.cpu_read_register(0x2007, cart);
        ppu.cpu_read_register(0x2007, cart)
    }

    fn run_until(ppu: &mut Ppu, cart: &mut Cartridge, scanline: i16, cycle: i16) {
        while ppu.position() != (scanline, cycle) {
            ppu.clock(cart);
        }
    }

    #[test]
    fn horizontal_mirroring_pairs_2000_and_2400() {
        let mut cart = cart(0, 0x00);
        let mut ppu = Ppu::new();
        write_vram(&mut ppu, &mut cart, 0x2000, 0xAB);
        assert_eq!(read_vram(&mut ppu, &mut cart, 0x2400), 0xAB);
        assert_ne!(read_vram(&mut ppu, &mut cart, 0x2800), 0xAB);
    }

    #[test]
    fn vertical_mirroring_pairs_2000_and_2800() {
        let mut cart = cart(0, 0x01);
        let mut ppu = Ppu::new();
        write_vram(&mut ppu, &mut cart, 0x2000, 0xCD);
        assert_eq!(read_vram(&mut ppu, &mut cart, 0x2800), 0xCD);
        assert_ne!(read_vram(&mut ppu, &mut cart, 0x2400), 0xCD);
    }

    #[test]
    fn data_reads_are_buffered_except_palette() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        write_vram(&mut ppu, &mut cart, 0x2005, 0x42);
        write_vram(&mut ppu, &mut cart, 0x3F01, 0x21);

        set_addr(&mut ppu, &mut cart, 0x2005);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut cart), 0x00);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut cart), 0x42);

        set_addr(&mut ppu, &mut cart, 0x3F01);
        assert_eq!(ppu.cpu_read_register(0x2007, &mut cart), 0x21);
    }

    #[test]
    fn data_port_increments_by_32_in_column_mode() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        ppu.cpu_write_register(0x2000, CTRL_VRAM_INC_32, &mut cart);
        set_addr(&mut ppu, &mut cart, 0x2000);
        ppu.cpu_write_register(0x2007, 1, &mut cart);
        ppu.cpu_write_register(0x2007, 2, &mut cart);
        ppu.cpu_write_register(0x2000, 0, &mut cart);
        assert_eq!(read_vram(&mut ppu, &mut cart, 0x2000), 1);
        assert_eq!(read_vram(&mut ppu, &mut cart, 0x2020), 2);
    }

    #[test]
    fn palette_backdrop_mirrors() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        write_vram(&mut ppu, &mut cart, 0x3F10, 0x0C);
        assert_eq!(read_vram(&mut ppu, &mut cart, 0x3F00), 0x0C);
        write_vram(&mut ppu, &mut cart, 0x3F1C, 0x1A);
        assert_eq!(read_vram(&mut ppu, &mut cart, 0x3F0C), 0x1A);
    }

    #[test]
    fn grayscale_masks_palette_reads() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        write_vram(&mut ppu, &mut cart, 0x3F00, 0x27);
        ppu.cpu_write_register(0x2001, MASK_GRAYSCALE, &mut cart);
        assert_eq!(read_vram(&mut ppu, &mut cart, 0x3F00), 0x20);
    }

    #[test]
    fn scroll_and_addr_share_write_latch() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        ppu.cpu_write_register(0x2005, 0x7D, &mut cart);
        assert!(ppu.write_toggle);
        assert_eq!(ppu.fine_x, 0x05);
        assert_eq!(ppu.t.coarse_x(), 0x0F);

        // The second write lands on $2006's low byte path.
        ppu.cpu_write_register(0x2006, 0x34, &mut cart);
        assert!(!ppu.write_toggle);
        assert_eq!(ppu.v.0 & 0x00FF, 0x34);

        ppu.cpu_write_register(0x2005, 0x5E, &mut cart);
        ppu.cpu_write_register(0x2005, 0x5E, &mut cart);
        assert_eq!(ppu.t.fine_y(), 0x06);
        assert_eq!(ppu.t.coarse_y(), 0x0B);
    }

    #[test]
    fn status_read_clears_vblank_and_latch() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        run_until(&mut ppu, &mut cart, 241, 2);
        ppu.cpu_write_register(0x2005, 0x10, &mut cart);

        let status = ppu.cpu_read_register(0x2002, &mut cart);
        assert_eq!(status & STATUS_VBLANK, STATUS_VBLANK);
        assert!(!ppu.write_toggle);
        assert_eq!(ppu.cpu_read_register(0x2002, &mut cart) & STATUS_VBLANK, 0);
    }

    #[test]
    fn ctrl_write_sets_nametable_bits_in_t() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        ppu.cpu_write_register(0x2000, 0x03, &mut cart);
        assert_eq!(ppu.t.nametable_x(), 1);
        assert_eq!(ppu.t.nametable_y(), 1);
    }

    #[test]
    fn oam_data_port_increments_address() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        ppu.cpu_write_register(0x2003, 0x10, &mut cart);
        ppu.cpu_write_register(0x2004, 0xAA, &mut cart);
        ppu.cpu_write_register(0x2004, 0xBB, &mut cart);
        ppu.cpu_write_register(0x2003, 0x11, &mut cart);
        assert_eq!(ppu.cpu_read_register(0x2004, &mut cart), 0xBB);
    }

    #[test]
    fn vblank_raises_nmi_when_enabled() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        ppu.cpu_write_register(0x2000, CTRL_NMI_ENABLE, &mut cart);
        run_until(&mut ppu, &mut cart, 241, 1);
        assert!(!ppu.take_nmi());
        ppu.clock(&mut cart);
        assert!(ppu.take_nmi());
        assert!(!ppu.take_nmi());
        assert_ne!(ppu.status & STATUS_VBLANK, 0);

        run_until(&mut ppu, &mut cart, -1, 2);
        assert_eq!(ppu.status & STATUS_VBLANK, 0);
    }

    #[test]
    fn frame_takes_fixed_dot_count_and_returns_to_prerender() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        for frame in 0..3 {
            for dot in 0..DOTS_PER_FRAME {
                assert!(!ppu.frame_complete(), "frame {frame} finished early at {dot}");
                ppu.clock(&mut cart);
            }
            assert!(ppu.frame_complete());
            assert_eq!(ppu.position(), (-1, 0));
            ppu.clear_frame_complete();
        }
    }

    #[test]
    fn odd_frames_skip_a_dot_while_rendering() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        ppu.cpu_write_register(0x2001, MASK_SHOW_BG, &mut cart);
        let mut dots = Vec::new();
        for _ in 0..2 {
            let mut count = 0;
            while !ppu.frame_complete() {
                ppu.clock(&mut cart);
                count += 1;
            }
            ppu.clear_frame_complete();
            dots.push(count);
        }
        assert_eq!(dots, vec![DOTS_PER_FRAME, DOTS_PER_FRAME - 1]);
    }

    fn place_sprites(ppu: &mut Ppu, count: usize, y: u8) {
        for i in 0..count {
            ppu.oam[i * 4] = y;
            ppu.oam[i * 4 + 3] = (i * 8) as u8;
        }
        for i in count..64 {
            ppu.oam[i * 4] = 0xF0;
        }
    }

    #[test]
    fn sprite_overflow_requires_nine_on_a_line() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        ppu.cpu_write_register(0x2001, MASK_SHOW_SPRITES, &mut cart);

        place_sprites(&mut ppu, 8, 20);
        run_until(&mut ppu, &mut cart, 24, 258);
        assert_eq!(ppu.sprite_count, 8);
        assert_eq!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);

        place_sprites(&mut ppu, 9, 40);
        run_until(&mut ppu, &mut cart, 44, 258);
        assert_eq!(ppu.sprite_count, 8);
        assert_ne!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn renders_background_tile_through_palette() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        // Tile 0: low plane solid, so every background pixel is color 1.
        for row in 0..8 {
            write_vram(&mut ppu, &mut cart, row, 0xFF);
        }
        write_vram(&mut ppu, &mut cart, 0x3F00, 0x0F);
        write_vram(&mut ppu, &mut cart, 0x3F01, 0x16);
        set_addr(&mut ppu, &mut cart, 0x0000);
        ppu.cpu_write_register(0x2001, MASK_SHOW_BG | MASK_SHOW_BG_LEFT, &mut cart);

        while !ppu.frame_complete() {
            ppu.clock(&mut cart);
        }

        let offset = (100 * FRAME_WIDTH + 100) * 3;
        assert_eq!(&ppu.frame_buffer()[offset..offset + 3], &NES_PALETTE[0x16]);
    }

    #[test]
    fn sprite_zero_hit_over_opaque_background() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        // Tile 0 (background) and tile 1 (sprite) both solid.
        for row in 0..8 {
            write_vram(&mut ppu, &mut cart, row, 0xFF);
            write_vram(&mut ppu, &mut cart, 0x10 + row, 0xFF);
        }
        set_addr(&mut ppu, &mut cart, 0x0000);
        place_sprites(&mut ppu, 1, 50);
        ppu.oam[1] = 1;
        ppu.oam[3] = 60;
        ppu.cpu_write_register(
            0x2001,
            MASK_SHOW_BG | MASK_SHOW_SPRITES | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITE_LEFT,
            &mut cart,
        );

        run_until(&mut ppu, &mut cart, 50, 0);
        assert_eq!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);
        run_until(&mut ppu, &mut cart, 52, 0);
        assert_ne!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);
    }

    #[test]
    fn mmc3_counter_clocked_each_rendered_line() {
        let mut cart = cart(4, 0);
        let mut ppu = Ppu::new();
        cart.cpu_write(0xC000, 10);
        cart.cpu_write(0xC001, 0);
        cart.cpu_write(0xE001, 0);
        ppu.cpu_write_register(0x2001, MASK_SHOW_BG, &mut cart);

        // Pre-render line reloads the counter; it reaches zero on line 9.
        run_until(&mut ppu, &mut cart, 9, 259);
        assert!(!cart.irq_state());
        run_until(&mut ppu, &mut cart, 9, 261);
        assert!(cart.irq_state());
    }

    #[test]
    fn prerender_line_drops_previous_line_sprites() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        place_sprites(&mut ppu, 1, 235);
        ppu.oam[2] = ATTR_FLIP_V;
        ppu.cpu_write_register(0x2001, MASK_SHOW_SPRITES, &mut cart);

        run_until(&mut ppu, &mut cart, 239, 258);
        assert_eq!(ppu.sprite_count, 1);

        run_until(&mut ppu, &mut cart, 0, 0);
        assert_eq!(ppu.sprite_count, 0);
        assert!(!ppu.sprite_zero_possible);
        assert_eq!(ppu.sprite_patterns_lo, [0; 8]);
        assert_eq!(ppu.sprite_patterns_hi, [0; 8]);
    }

    /// Fills pattern memory so each byte identifies its address.
    fn fill_pattern_tables(ppu: &mut Ppu, cart: &mut Cartridge) {
        set_addr(ppu, cart, 0x0000);
        for addr in 0u16..0x2000 {
            let marker = if addr & 0x1000 != 0 { 0x80 } else { 0x00 };
            ppu.cpu_write_register(0x2007, addr as u8 ^ marker, cart);
        }
    }

    fn fetch_one(
        ppu: &mut Ppu,
        cart: &mut Cartridge,
        ctrl: u8,
        tile: u8,
        attr: u8,
        row: i16,
    ) -> (u8, u8) {
        ppu.ctrl = ctrl;
        ppu.scanline = 100 + row;
        ppu.sprites[0] = SpriteEntry {
            y: 100,
            tile,
            attr,
            x: 0,
        };
        ppu.sprite_count = 1;
        ppu.fetch_sprite_patterns(cart);
        (ppu.sprite_patterns_lo[0], ppu.sprite_patterns_hi[0])
    }

    #[test]
    fn sprite_fetch_honors_flips_in_8x8_mode() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        fill_pattern_tables(&mut ppu, &mut cart);

        // Tile 2, row 3 lives at $0023/$002B.
        assert_eq!(fetch_one(&mut ppu, &mut cart, 0, 2, 0, 3), (0x23, 0x2B));
        assert_eq!(fetch_one(&mut ppu, &mut cart, 0, 2, ATTR_FLIP_V, 3), (0x24, 0x2C));
        assert_eq!(
            fetch_one(&mut ppu, &mut cart, 0, 2, ATTR_FLIP_H, 3),
            (0x23u8.reverse_bits(), 0x2Bu8.reverse_bits())
        );
        assert_eq!(
            fetch_one(&mut ppu, &mut cart, 0, 2, ATTR_FLIP_H | ATTR_FLIP_V, 3),
            (0x24u8.reverse_bits(), 0x2Cu8.reverse_bits())
        );
        assert_eq!(fetch_one(&mut ppu, &mut cart, CTRL_SPRITE_TABLE, 2, 0, 3), (0xA3, 0xAB));
    }

    #[test]
    fn sprite_fetch_addresses_tall_sprites_by_tile_bit() {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        fill_pattern_tables(&mut ppu, &mut cart);
        let tall = CTRL_SPRITE_SIZE_16;

        // Odd tile index selects $1000; the pair is tiles 2 and 3.
        assert_eq!(fetch_one(&mut ppu, &mut cart, tall, 0x03, 0, 3), (0xA3, 0xAB));
        assert_eq!(fetch_one(&mut ppu, &mut cart, tall, 0x03, 0, 11), (0xB3, 0xBB));
        // Vertical flip swaps the halves as well as the rows.
        assert_eq!(fetch_one(&mut ppu, &mut cart, tall, 0x03, ATTR_FLIP_V, 3), (0xB4, 0xBC));
        assert_eq!(fetch_one(&mut ppu, &mut cart, tall, 0x03, ATTR_FLIP_V, 11), (0xA4, 0xAC));
        assert_eq!(
            fetch_one(&mut ppu, &mut cart, tall, 0x03, ATTR_FLIP_H | ATTR_FLIP_V, 15),
            (0xA0u8.reverse_bits(), 0xA8u8.reverse_bits())
        );
        // The control register's sprite table bit is ignored for tall sprites.
        assert_eq!(
            fetch_one(&mut ppu, &mut cart, tall | CTRL_SPRITE_TABLE, 0x02, 0, 0),
            (0x20, 0x28)
        );
    }

    fn render_sprite_over_background(attr: u8) -> [u8; 3] {
        let mut cart = cart(0, 0);
        let mut ppu = Ppu::new();
        for row in 0..8 {
            write_vram(&mut ppu, &mut cart, row, 0xFF);
            write_vram(&mut ppu, &mut cart, 0x10 + row, 0xFF);
        }
        write_vram(&mut ppu, &mut cart, 0x3F01, 0x16);
        write_vram(&mut ppu, &mut cart, 0x3F11, 0x2A);
        set_addr(&mut ppu, &mut cart, 0x0000);
        place_sprites(&mut ppu, 1, 50);
        ppu.oam[1] = 1;
        ppu.oam[2] = attr;
        ppu.oam[3] = 60;
        ppu.cpu_write_register(
            0x2001,
            MASK_SHOW_BG | MASK_SHOW_SPRITES | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITE_LEFT,
            &mut cart,
        );

        while !ppu.frame_complete() {
            ppu.clock(&mut cart);
        }

        let offset = (54 * FRAME_WIDTH + 63) * 3;
        let mut rgb = [0; 3];
        rgb.copy_from_slice(&ppu.frame_buffer()[offset..offset + 3]);
        rgb
    }

    #[test]
    fn opaque_background_covers_behind_priority_sprite() {
        assert_eq!(render_sprite_over_background(0), NES_PALETTE[0x2A]);
        assert_eq!(render_sprite_over_background(ATTR_BEHIND_BG), NES_PALETTE[0x16]);
    }
}
