use crate::config::DEFAULT_SAMPLE_RATE;

pub const CPU_CLOCK_HZ: f64 = 1_789_773.0;

/// The frame sequencer runs at 240Hz. Five-step mode reaches 192Hz by idling
/// on its last step.
const SEQUENCER_PERIOD: f64 = CPU_CLOCK_HZ / 240.0;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 1, 0, 0, 0, 0, 0, 0],
    [0, 1, 1, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0, 0, 0],
    [1, 0, 0, 1, 1, 1, 1, 1],
];

const TRI_TABLE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequencerMode {
    FourStep,
    FiveStep,
}

pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,

    sequencer_mode: SequencerMode,
    sequencer_value: u8,
    irq_enabled: bool,
    frame_irq: bool,

    cycles: u64,
    sample_rate: u32,
    sample_phase: f64,
    samples: Vec<f32>,
    dmc_dma_request: Option<u16>,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

impl Apu {
    pub fn new() -> Self {
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            triangle: TriangleChannel::new(),
            noise: NoiseChannel::new(),
            dmc: DmcChannel::new(),
            sequencer_mode: SequencerMode::FourStep,
            sequencer_value: 0,
            irq_enabled: true,
            frame_irq: false,
            cycles: 0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_phase: 0.0,
            samples: Vec::new(),
            dmc_dma_request: None,
        }
    }

    pub fn reset(&mut self) {
        self.pulse1 = PulseChannel::new(true);
        self.pulse2 = PulseChannel::new(false);
        self.triangle = TriangleChannel::new();
        self.noise = NoiseChannel::new();
        self.dmc = DmcChannel::new();
        self.sequencer_mode = SequencerMode::FourStep;
        self.sequencer_value = 0;
        self.irq_enabled = true;
        self.frame_irq = false;
        self.cycles = 0;
        self.sample_phase = 0.0;
        self.samples.clear();
        self.dmc_dma_request = None;
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.sample_phase = 0.0;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.write_sweep(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),

            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.write_sweep(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),

            0x4008 => self.triangle.write_linear(value),
            0x400A => self.triangle.write_timer_low(value),
            0x400B => self.triangle.write_timer_high(value),

            0x400C => self.noise.write_control(value),
            0x400E => self.noise.write_mode(value),
            0x400F => self.noise.write_length(value),

            0x4010 => self.dmc.write_control(value),
            0x4011 => self.dmc.write_output_level(value),
            0x4012 => self.dmc.write_sample_addr(value),
            0x4013 => self.dmc.write_sample_length(value),

            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            _ => {}
        }
    }

    /// `$4015`: `if-d nt21`. Reading acknowledges the frame IRQ only.
    pub fn read_status(&mut self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length_value > 0 {
            status |= 0x01;
        }
        if self.pulse2.length_value > 0 {
            status |= 0x02;
        }
        if self.triangle.length_value > 0 {
            status |= 0x04;
        }
        if self.noise.length_value > 0 {
            status |= 0x08;
        }
        if self.dmc.bytes_remaining > 0 {
            status |= 0x10;
        }
        if self.frame_irq {
            status |= 0x40;
        }
        if self.dmc.irq_flag {
            status |= 0x80;
        }

        self.frame_irq = false;
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.frame_irq || self.dmc.irq_flag
    }

    /// One CPU cycle.
    pub fn clock(&mut self) {
        let before = self.cycles;
        self.cycles += 1;

        self.triangle.clock_timer();
        if self.cycles % 2 == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.dmc.clock_timer();
        self.queue_dmc_fetch();

        let step_before = (before as f64 / SEQUENCER_PERIOD) as u64;
        let step_after = (self.cycles as f64 / SEQUENCER_PERIOD) as u64;
        if step_before != step_after {
            self.step_sequencer();
        }

        self.sample_phase += self.sample_rate as f64;
        while self.sample_phase >= CPU_CLOCK_HZ {
            self.sample_phase -= CPU_CLOCK_HZ;
            let sample = self.mix_sample();
            self.samples.push(sample);
        }
    }

    pub fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    /// Address the DMC wants read from the CPU bus, if any.
    pub fn take_dmc_dma_request(&mut self) -> Option<u16> {
        self.dmc_dma_request.take()
    }

    pub fn complete_dmc_dma(&mut self, value: u8) {
        self.dmc.load_sample_byte(value);
        self.queue_dmc_fetch();
    }

    fn queue_dmc_fetch(&mut self) {
        if self.dmc.needs_fetch() && self.dmc_dma_request.is_none() {
            self.dmc_dma_request = Some(self.dmc.current_addr);
        }
    }

    fn write_status(&mut self, value: u8) {
        self.dmc.irq_flag = false;

        self.pulse1.enabled = value & 0x01 != 0;
        self.pulse2.enabled = value & 0x02 != 0;
        self.triangle.enabled = value & 0x04 != 0;
        self.noise.enabled = value & 0x08 != 0;
        self.dmc.enabled = value & 0x10 != 0;

        if !self.pulse1.enabled {
            self.pulse1.length_value = 0;
        }
        if !self.pulse2.enabled {
            self.pulse2.length_value = 0;
        }
        if !self.triangle.enabled {
            self.triangle.length_value = 0;
        }
        if !self.noise.enabled {
            self.noise.length_value = 0;
        }
        if !self.dmc.enabled {
            self.dmc.bytes_remaining = 0;
            self.dmc_dma_request = None;
        } else if self.dmc.bytes_remaining == 0 {
            self.dmc.restart();
        }
        self.queue_dmc_fetch();
    }

    /// `$4017`: `MI-- ----` mode, IRQ inhibit.
    fn write_frame_counter(&mut self, value: u8) {
        self.sequencer_mode = if value & 0x80 == 0 {
            SequencerMode::FourStep
        } else {
            SequencerMode::FiveStep
        };
        self.irq_enabled = value & 0x40 == 0;
        if !self.irq_enabled {
            self.frame_irq = false;
        }

        if self.sequencer_mode == SequencerMode::FiveStep {
            self.step_envelopes();
            self.step_sweeps();
            self.step_lengths();
        }
    }

    fn step_sequencer(&mut self) {
        match self.sequencer_mode {
            SequencerMode::FourStep => {
                // e e e e   envelope + linear counter
                // - l - l   length + sweep
                // - - - f   IRQ
                self.sequencer_value = (self.sequencer_value + 1) % 4;
                match self.sequencer_value {
                    1 | 3 => {
                        self.step_envelopes();
                        self.step_sweeps();
                        self.step_lengths();
                        if self.sequencer_value == 3 && self.irq_enabled {
                            self.frame_irq = true;
                        }
                    }
                    _ => self.step_envelopes(),
                }
            }
            SequencerMode::FiveStep => {
                // e e e e -
                // - l - l -
                self.sequencer_value = (self.sequencer_value + 1) % 5;
                match self.sequencer_value {
                    1 | 3 => {
                        self.step_envelopes();
                        self.step_sweeps();
                        self.step_lengths();
                    }
                    0 | 2 => self.step_envelopes(),
                    _ => {}
                }
            }
        }
    }

    fn step_envelopes(&mut self) {
        self.pulse1.envelope.step();
        self.pulse2.envelope.step();
        self.triangle.step_linear_counter();
        self.noise.envelope.step();
    }

    fn step_sweeps(&mut self) {
        self.pulse1.step_sweep();
        self.pulse2.step_sweep();
    }

    fn step_lengths(&mut self) {
        self.pulse1.step_length();
        self.pulse2.step_length();
        self.triangle.step_length();
        self.noise.step_length();
    }

    fn mix_sample(&self) -> f32 {
        let p1 = self.pulse1.output() as f32;
        let p2 = self.pulse2.output() as f32;
        let t = self.triangle.output() as f32;
        let n = self.noise.output() as f32;
        let d = self.dmc.output() as f32;
        mix(p1, p2, t, n, d)
    }
}

/// Non-linear two-group mixer. Silent groups contribute zero instead of
/// dividing by zero.
fn mix(p1: f32, p2: f32, triangle: f32, noise: f32, dmc: f32) -> f32 {
    let pulse_sum = p1 + p2;
    let pulse_out = if pulse_sum > 0.0 {
        95.88 / (100.0 + 8128.0 / pulse_sum)
    } else {
        0.0
    };

    let tnd_in = triangle / 8227.0 + noise / 12241.0 + dmc / 22638.0;
    let tnd_out = if tnd_in > 0.0 {
        159.79 / (100.0 + 1.0 / tnd_in)
    } else {
        0.0
    };

    pulse_out + tnd_out
}

#[derive(Debug, Clone, Copy, Default)]
struct Envelope {
    enabled: bool,
    start: bool,
    looping: bool,
    volume: u8,
    period: u8,
    value: u8,
    constant_volume: u8,
}

impl Envelope {
    /// `--le nnnn`: loop (also halts length), constant volume, period/volume.
    fn write(&mut self, value: u8) {
        self.looping = value & 0x20 != 0;
        self.enabled = value & 0x10 == 0;
        self.period = value & 0x0F;
        self.constant_volume = value & 0x0F;
        self.start = true;
    }

    fn step(&mut self) {
        if self.start {
            self.volume = 15;
            self.value = self.period + 1;
            self.start = false;
        } else if self.value > 0 {
            self.value -= 1;
        } else {
            if self.volume > 0 {
                self.volume -= 1;
            } else if self.looping {
                self.volume = 15;
            }
            self.value = self.period + 1;
        }
    }

    fn output(&self) -> u8 {
        if self.enabled {
            self.volume
        } else {
            self.constant_volume
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PulseChannel {
    enabled: bool,
    channel1: bool,
    duty_mode: u8,
    duty_value: u8,

    length_enabled: bool,
    length_value: u8,
    timer_period: u16,
    timer_value: u16,

    envelope: Envelope,

    sweep_enabled: bool,
    sweep_negate: bool,
    sweep_reload: bool,
    sweep_period: u8,
    sweep_shift: u8,
    sweep_value: u8,
}

impl PulseChannel {
    fn new(channel1: bool) -> Self {
        Self {
            enabled: false,
            channel1,
            duty_mode: 0,
            duty_value: 0,
            length_enabled: false,
            length_value: 0,
            timer_period: 0,
            timer_value: 0,
            envelope: Envelope::default(),
            sweep_enabled: false,
            sweep_negate: false,
            sweep_reload: false,
            sweep_period: 0,
            sweep_shift: 0,
            sweep_value: 0,
        }
    }

    /// `ddle nnnn`
    fn write_control(&mut self, value: u8) {
        self.duty_mode = (value >> 6) & 0x03;
        self.length_enabled = value & 0x20 == 0;
        self.envelope.write(value);
    }

    /// `eppp nsss`
    fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = value & 0x80 != 0;
        self.sweep_period = (value >> 4) & 0x07;
        self.sweep_negate = value & 0x08 != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    /// `llll lppp`
    fn write_timer_high(&mut self, value: u8) {
        self.length_value = LENGTH_TABLE[(value >> 3) as usize];
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        self.envelope.start = true;
        self.duty_value = 0;
    }

    fn clock_timer(&mut self) {
        if self.timer_value == 0 {
            self.timer_value = self.timer_period + 1;
            self.duty_value = (self.duty_value + 1) % 8;
        } else {
            self.timer_value -= 1;
        }
    }

    fn step_length(&mut self) {
        if self.length_enabled && self.length_value > 0 {
            self.length_value -= 1;
        }
    }

    fn step_sweep(&mut self) {
        if self.sweep_reload {
            if self.sweep_enabled && self.sweep_value == 0 {
                self.sweep();
            }
            self.sweep_value = self.sweep_period + 1;
            self.sweep_reload = false;
        } else if self.sweep_value > 0 {
            self.sweep_value -= 1;
        } else {
            if self.sweep_enabled {
                self.sweep();
            }
            self.sweep_value = self.sweep_period + 1;
        }
    }

    fn sweep(&mut self) {
        if self.sweep_shift == 0 {
            return;
        }
        let delta = self.timer_period >> self.sweep_shift;
        if self.sweep_negate {
            // Pulse 1 adds the one's complement, so it lands one lower.
            let extra = u16::from(self.channel1);
            self.timer_period = self.timer_period.wrapping_sub(delta + extra);
        } else {
            self.timer_period = self.timer_period.wrapping_add(delta);
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled
            || self.timer_period > 0x7FF
            || self.length_value == 0
            || self.timer_period < 8
            || DUTY_TABLE[self.duty_mode as usize][self.duty_value as usize] == 0
        {
            return 0;
        }
        self.envelope.output()
    }
}

#[derive(Debug, Clone, Copy)]
struct TriangleChannel {
    enabled: bool,
    control_flag: bool,
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload_flag: bool,

    timer_period: u16,
    timer_value: u16,
    length_value: u8,
    seq_step: u8,
}

impl TriangleChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            control_flag: false,
            linear_reload_value: 0,
            linear_counter: 0,
            linear_reload_flag: false,
            timer_period: 0,
            timer_value: 0,
            length_value: 0,
            seq_step: 0,
        }
    }

    /// `crrr rrrr`: control (halts length), linear counter reload.
    fn write_linear(&mut self, value: u8) {
        self.control_flag = value & 0x80 != 0;
        self.linear_reload_value = value & 0x7F;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0xFF00) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        self.length_value = LENGTH_TABLE[(value >> 3) as usize];
        self.linear_reload_flag = true;
    }

    fn step_linear_counter(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        if !self.control_flag {
            self.linear_reload_flag = false;
        }
    }

    fn step_length(&mut self) {
        if !self.control_flag && self.length_value > 0 {
            self.length_value -= 1;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_value == 0 {
            self.timer_value = self.timer_period;
            // Ultrasonic periods freeze the sequencer instead of aliasing.
            if self.length_value > 0 && self.linear_counter > 0 && self.timer_period > 1 {
                self.seq_step = (self.seq_step + 1) & 0x1F;
            }
        } else {
            self.timer_value -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_value == 0 || self.linear_counter == 0 {
            0
        } else {
            TRI_TABLE[self.seq_step as usize]
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NoiseChannel {
    enabled: bool,
    length_enabled: bool,
    length_value: u8,
    envelope: Envelope,

    /// Feedback tap: 6 in short mode, otherwise 1.
    shift_mode: u8,
    shift_register: u16,
    timer_period: u16,
    timer_value: u16,
}

impl NoiseChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            length_enabled: false,
            length_value: 0,
            envelope: Envelope::default(),
            shift_mode: 1,
            shift_register: 1,
            timer_period: 0,
            timer_value: 0,
        }
    }

    fn write_control(&mut self, value: u8) {
        self.length_enabled = value & 0x20 == 0;
        self.envelope.write(value);
    }

    /// `s--- pppp`: short mode, period index.
    fn write_mode(&mut self, value: u8) {
        self.shift_mode = if value & 0x80 != 0 { 6 } else { 1 };
        self.timer_period = NOISE_PERIOD_TABLE[(value & 0x0F) as usize];
    }

    fn write_length(&mut self, value: u8) {
        self.length_value = LENGTH_TABLE[(value >> 3) as usize];
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_value == 0 {
            self.timer_value = self.timer_period;
            let feedback =
                (self.shift_register & 0x01) ^ ((self.shift_register >> self.shift_mode) & 0x01);
            self.shift_register >>= 1;
            self.shift_register |= feedback << 14;
        } else {
            self.timer_value -= 1;
        }
    }

    fn step_length(&mut self) {
        if self.length_enabled && self.length_value > 0 {
            self.length_value -= 1;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.length_value == 0 || self.shift_register & 0x01 != 0 {
            0
        } else {
            self.envelope.output()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DmcChannel {
    enabled: bool,
    irq_enabled: bool,
    irq_flag: bool,
    loop_flag: bool,
    timer_period: u16,
    timer_value: u16,
    output_level: u8,
    sample_addr: u8,
    sample_length: u8,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
}

impl DmcChannel {
    fn new() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq_flag: false,
            loop_flag: false,
            timer_period: DMC_RATE_TABLE[0],
            timer_value: DMC_RATE_TABLE[0],
            output_level: 0,
            sample_addr: 0,
            sample_length: 0,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
        }
    }

    /// `IL-- rrrr`: IRQ enable, loop, rate index.
    fn write_control(&mut self, value: u8) {
        self.irq_enabled = value & 0x80 != 0;
        if !self.irq_enabled {
            self.irq_flag = false;
        }
        self.loop_flag = value & 0x40 != 0;
        self.timer_period = DMC_RATE_TABLE[(value & 0x0F) as usize];
    }

    fn write_output_level(&mut self, value: u8) {
        self.output_level = value & 0x7F;
    }

    fn write_sample_addr(&mut self, value: u8) {
        self.sample_addr = value;
    }

    fn write_sample_length(&mut self, value: u8) {
        self.sample_length = value;
    }

    fn restart(&mut self) {
        self.current_addr = 0xC000 | ((self.sample_addr as u16) << 6);
        self.bytes_remaining = ((self.sample_length as u16) << 4) | 0x0001;
    }

    fn needs_fetch(&self) -> bool {
        self.enabled && self.sample_buffer.is_none() && self.bytes_remaining > 0
    }

    fn load_sample_byte(&mut self, byte: u8) {
        self.sample_buffer = Some(byte);
        // Sample addresses wrap from $FFFF back to $8000.
        self.current_addr = if self.current_addr == 0xFFFF {
            0x8000
        } else {
            self.current_addr + 1
        };
        self.bytes_remaining = self.bytes_remaining.saturating_sub(1);
        if self.bytes_remaining == 0 {
            if self.loop_flag {
                self.restart();
            } else if self.irq_enabled {
                self.irq_flag = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_value > 0 {
            self.timer_value -= 1;
            return;
        }
        self.timer_value = self.timer_period - 1;
        self.clock_output_unit();
    }

    fn clock_output_unit(&mut self) {
        if !self.silence {
            if self.shift_register & 0x01 != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }
        self.shift_register >>= 1;
        self.bits_remaining -= 1;

        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            match self.sample_buffer.take() {
                Some(sample) => {
                    self.shift_register = sample;
                    self.silence = false;
                }
                None => self.silence = true,
            }
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        self.output_level
    }
}
