use std::collections::BTreeMap;

use super::opcodes::{AddrMode, OPCODES, Operation};

pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

const STACK_BASE: u16 = 0x0100;
const NMI_VECTOR: u16 = 0xFFFA;
const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;

/// The CPU's view of the rest of the machine.
pub trait CpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, data: u8);

    /// Read without side effects (no PPU latch clears, no controller shifts).
    fn peek(&self, addr: u16) -> u8 {
        let _ = addr;
        0
    }
}

/// 2A03 CPU core.
///
/// Instructions execute in full on their first cycle; the remaining cycles
/// are a countdown so the rest of the system sees the right timing.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
    pub status: u8,

    fetched: u8,
    addr_abs: u16,
    addr_rel: u16,
    opcode: u8,
    cycles: u8,
    clock_count: u64,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            pc: 0,
            status: FLAG_UNUSED,
            fetched: 0,
            addr_abs: 0,
            addr_rel: 0,
            opcode: 0,
            cycles: 0,
            clock_count: 0,
        }
    }

    pub fn reset(&mut self, bus: &mut impl CpuBus) {
        self.pc = read_u16(bus, RESET_VECTOR);
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.sp = 0xFD;
        self.status = FLAG_UNUSED;
        self.fetched = 0;
        self.addr_abs = 0;
        self.addr_rel = 0;
        self.cycles = 8;
    }

    /// True between instructions.
    pub fn complete(&self) -> bool {
        self.cycles == 0
    }

    pub fn clock_count(&self) -> u64 {
        self.clock_count
    }

    /// Hold the CPU for `cycles` extra cycles (DMC sample fetches).
    pub fn stall(&mut self, cycles: u8) {
        self.cycles = self.cycles.saturating_add(cycles);
    }

    pub fn clock(&mut self, bus: &mut impl CpuBus) {
        if self.cycles == 0 {
            self.opcode = bus.read(self.pc);
            self.set_flag(FLAG_UNUSED, true);
            self.pc = self.pc.wrapping_add(1);

            let inst = OPCODES[self.opcode as usize];
            self.cycles = inst.cycles;
            let extra_addr = self.address(inst.mode, bus);
            let extra_op = self.execute(inst.op, inst.mode, bus);
            self.cycles += extra_addr & extra_op;

            self.set_flag(FLAG_UNUSED, true);
        }

        self.clock_count += 1;
        self.cycles = self.cycles.saturating_sub(1);
    }

    pub fn nmi(&mut self, bus: &mut impl CpuBus) {
        self.interrupt(bus, NMI_VECTOR);
        self.cycles = 8;
    }

    /// Maskable interrupt; ignored while InterruptDisable is set.
    pub fn irq(&mut self, bus: &mut impl CpuBus) -> bool {
        if self.get_flag(FLAG_INTERRUPT) {
            return false;
        }
        self.interrupt(bus, IRQ_VECTOR);
        self.cycles = 7;
        true
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.status & flag) != 0
    }

    pub fn set_flag(&mut self, flag: u8, enabled: bool) {
        if enabled {
            self.status |= flag;
        } else {
            self.status &= !flag;
        }
    }

    fn interrupt(&mut self, bus: &mut impl CpuBus, vector: u16) {
        self.push_u16(bus, self.pc);
        self.set_flag(FLAG_BREAK, false);
        self.set_flag(FLAG_UNUSED, true);
        self.set_flag(FLAG_INTERRUPT, true);
        self.push(bus, self.status);
        self.pc = read_u16(bus, vector);
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn push(&mut self, bus: &mut impl CpuBus, value: u8) {
        bus.write(STACK_BASE + self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pull(&mut self, bus: &mut impl CpuBus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(STACK_BASE + self.sp as u16)
    }

    fn push_u16(&mut self, bus: &mut impl CpuBus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pull_u16(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.pull(bus) as u16;
        let hi = self.pull(bus) as u16;
        (hi << 8) | lo
    }

    fn fetch_byte(&mut self, bus: &mut impl CpuBus) -> u8 {
        let value = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn fetch_u16(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.fetch_byte(bus) as u16;
        let hi = self.fetch_byte(bus) as u16;
        (hi << 8) | lo
    }

    /// Resolves the operand location. Returns 1 when a page boundary was
    /// crossed by an indexed mode.
    fn address(&mut self, mode: AddrMode, bus: &mut impl CpuBus) -> u8 {
        match mode {
            AddrMode::Imp => {
                self.fetched = self.a;
                0
            }
            AddrMode::Imm => {
                self.addr_abs = self.pc;
                self.pc = self.pc.wrapping_add(1);
                0
            }
            AddrMode::Zp0 => {
                self.addr_abs = self.fetch_byte(bus) as u16;
                0
            }
            AddrMode::Zpx => {
                self.addr_abs = self.fetch_byte(bus).wrapping_add(self.x) as u16;
                0
            }
            AddrMode::Zpy => {
                self.addr_abs = self.fetch_byte(bus).wrapping_add(self.y) as u16;
                0
            }
            AddrMode::Rel => {
                self.addr_rel = self.fetch_byte(bus) as i8 as i16 as u16;
                0
            }
            AddrMode::Abs => {
                self.addr_abs = self.fetch_u16(bus);
                0
            }
            AddrMode::Abx => self.indexed_abs(bus, self.x),
            AddrMode::Aby => self.indexed_abs(bus, self.y),
            AddrMode::Ind => {
                let ptr = self.fetch_u16(bus);
                let lo = bus.read(ptr) as u16;
                // The high byte never carries into the next page.
                let hi_addr = (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF);
                let hi = bus.read(hi_addr) as u16;
                self.addr_abs = (hi << 8) | lo;
                0
            }
            AddrMode::Izx => {
                let base = self.fetch_byte(bus).wrapping_add(self.x);
                self.addr_abs = read_zp_u16(bus, base);
                0
            }
            AddrMode::Izy => {
                let base = self.fetch_byte(bus);
                let ptr = read_zp_u16(bus, base);
                self.addr_abs = ptr.wrapping_add(self.y as u16);
                page_crossed(ptr, self.addr_abs)
            }
        }
    }

    fn indexed_abs(&mut self, bus: &mut impl CpuBus, index: u8) -> u8 {
        let base = self.fetch_u16(bus);
        self.addr_abs = base.wrapping_add(index as u16);
        page_crossed(base, self.addr_abs)
    }

    fn fetch(&mut self, mode: AddrMode, bus: &mut impl CpuBus) -> u8 {
        if mode != AddrMode::Imp {
            self.fetched = bus.read(self.addr_abs);
        }
        self.fetched
    }

    /// Writes a read-modify-write result back to A or memory.
    fn store_result(&mut self, mode: AddrMode, bus: &mut impl CpuBus, value: u8) {
        if mode == AddrMode::Imp {
            self.a = value;
        } else {
            bus.write(self.addr_abs, value);
        }
    }

    /// Performs the operation. Returns 1 if the operation can take the
    /// page-cross penalty.
    fn execute(&mut self, op: Operation, mode: AddrMode, bus: &mut impl CpuBus) -> u8 {
        match op {
            Operation::Adc => {
                let value = self.fetch(mode, bus);
                self.adc(value);
                1
            }
            Operation::Sbc => {
                let value = self.fetch(mode, bus);
                self.adc(value ^ 0xFF);
                1
            }
            Operation::And => {
                self.a &= self.fetch(mode, bus);
                self.update_zn(self.a);
                1
            }
            Operation::Ora => {
                self.a |= self.fetch(mode, bus);
                self.update_zn(self.a);
                1
            }
            Operation::Eor => {
                self.a ^= self.fetch(mode, bus);
                self.update_zn(self.a);
                1
            }
            Operation::Asl => {
                let value = self.fetch(mode, bus);
                self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
                let result = value << 1;
                self.update_zn(result);
                self.store_result(mode, bus, result);
                0
            }
            Operation::Lsr => {
                let value = self.fetch(mode, bus);
                self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
                let result = value >> 1;
                self.update_zn(result);
                self.store_result(mode, bus, result);
                0
            }
            Operation::Rol => {
                let value = self.fetch(mode, bus);
                let carry_in = self.get_flag(FLAG_CARRY) as u8;
                self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
                let result = (value << 1) | carry_in;
                self.update_zn(result);
                self.store_result(mode, bus, result);
                0
            }
            Operation::Ror => {
                let value = self.fetch(mode, bus);
                let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
                self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
                let result = (value >> 1) | carry_in;
                self.update_zn(result);
                self.store_result(mode, bus, result);
                0
            }
            Operation::Bit => {
                let value = self.fetch(mode, bus);
                self.set_flag(FLAG_ZERO, (self.a & value) == 0);
                self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
                self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
                0
            }
            Operation::Bcc => self.branch(!self.get_flag(FLAG_CARRY)),
            Operation::Bcs => self.branch(self.get_flag(FLAG_CARRY)),
            Operation::Beq => self.branch(self.get_flag(FLAG_ZERO)),
            Operation::Bne => self.branch(!self.get_flag(FLAG_ZERO)),
            Operation::Bmi => self.branch(self.get_flag(FLAG_NEGATIVE)),
            Operation::Bpl => self.branch(!self.get_flag(FLAG_NEGATIVE)),
            Operation::Bvc => self.branch(!self.get_flag(FLAG_OVERFLOW)),
            Operation::Bvs => self.branch(self.get_flag(FLAG_OVERFLOW)),
            Operation::Brk => {
                self.set_flag(FLAG_INTERRUPT, true);
                self.push_u16(bus, self.pc);
                self.push(bus, self.status | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_BREAK, false);
                self.pc = read_u16(bus, IRQ_VECTOR);
                0
            }
            Operation::Clc => self.flag_op(FLAG_CARRY, false),
            Operation::Cld => self.flag_op(FLAG_DECIMAL, false),
            Operation::Cli => self.flag_op(FLAG_INTERRUPT, false),
            Operation::Clv => self.flag_op(FLAG_OVERFLOW, false),
            Operation::Sec => self.flag_op(FLAG_CARRY, true),
            Operation::Sed => self.flag_op(FLAG_DECIMAL, true),
            Operation::Sei => self.flag_op(FLAG_INTERRUPT, true),
            Operation::Cmp => {
                let value = self.fetch(mode, bus);
                self.compare(self.a, value);
                1
            }
            Operation::Cpx => {
                let value = self.fetch(mode, bus);
                self.compare(self.x, value);
                0
            }
            Operation::Cpy => {
                let value = self.fetch(mode, bus);
                self.compare(self.y, value);
                0
            }
            Operation::Dec => {
                let result = self.fetch(mode, bus).wrapping_sub(1);
                bus.write(self.addr_abs, result);
                self.update_zn(result);
                0
            }
            Operation::Inc => {
                let result = self.fetch(mode, bus).wrapping_add(1);
                bus.write(self.addr_abs, result);
                self.update_zn(result);
                0
            }
            Operation::Dex => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
                0
            }
            Operation::Dey => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
                0
            }
            Operation::Inx => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
                0
            }
            Operation::Iny => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
                0
            }
            Operation::Jmp => {
                self.pc = self.addr_abs;
                0
            }
            Operation::Jsr => {
                self.push_u16(bus, self.pc.wrapping_sub(1));
                self.pc = self.addr_abs;
                0
            }
            Operation::Rts => {
                self.pc = self.pull_u16(bus).wrapping_add(1);
                0
            }
            Operation::Rti => {
                let status = self.pull(bus);
                self.status = (status & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pull_u16(bus);
                0
            }
            Operation::Lda => {
                self.a = self.fetch(mode, bus);
                self.update_zn(self.a);
                1
            }
            Operation::Ldx => {
                self.x = self.fetch(mode, bus);
                self.update_zn(self.x);
                1
            }
            Operation::Ldy => {
                self.y = self.fetch(mode, bus);
                self.update_zn(self.y);
                1
            }
            Operation::Sta => {
                bus.write(self.addr_abs, self.a);
                0
            }
            Operation::Stx => {
                bus.write(self.addr_abs, self.x);
                0
            }
            Operation::Sty => {
                bus.write(self.addr_abs, self.y);
                0
            }
            Operation::Pha => {
                self.push(bus, self.a);
                0
            }
            Operation::Php => {
                self.push(bus, self.status | FLAG_BREAK | FLAG_UNUSED);
                0
            }
            Operation::Pla => {
                self.a = self.pull(bus);
                self.update_zn(self.a);
                0
            }
            Operation::Plp => {
                self.status = self.pull(bus) | FLAG_UNUSED;
                0
            }
            Operation::Tax => {
                self.x = self.a;
                self.update_zn(self.x);
                0
            }
            Operation::Tay => {
                self.y = self.a;
                self.update_zn(self.y);
                0
            }
            Operation::Tsx => {
                self.x = self.sp;
                self.update_zn(self.x);
                0
            }
            Operation::Txa => {
                self.a = self.x;
                self.update_zn(self.a);
                0
            }
            Operation::Txs => {
                self.sp = self.x;
                0
            }
            Operation::Tya => {
                self.a = self.y;
                self.update_zn(self.a);
                0
            }
            // Absolute,X NOPs pay the page-cross cycle.
            Operation::Nop => matches!(self.opcode, 0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC) as u8,
            Operation::Xxx => 0,
        }
    }

    fn flag_op(&mut self, flag: u8, enabled: bool) -> u8 {
        self.set_flag(flag, enabled);
        0
    }

    fn branch(&mut self, condition: bool) -> u8 {
        if condition {
            self.cycles += 1;
            let target = self.pc.wrapping_add(self.addr_rel);
            if (target & 0xFF00) != (self.pc & 0xFF00) {
                self.cycles += 1;
            }
            self.addr_abs = target;
            self.pc = target;
        }
        0
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(register.wrapping_sub(value));
    }

    fn adc(&mut self, value: u8) {
        let carry_in = self.get_flag(FLAG_CARRY) as u16;
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, (!(self.a ^ value) & (self.a ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }
}

fn read_u16(bus: &mut impl CpuBus, addr: u16) -> u16 {
    let lo = bus.read(addr) as u16;
    let hi = bus.read(addr.wrapping_add(1)) as u16;
    (hi << 8) | lo
}

fn read_zp_u16(bus: &mut impl CpuBus, addr: u8) -> u16 {
    let lo = bus.read(addr as u16) as u16;
    let hi = bus.read(addr.wrapping_add(1) as u16) as u16;
    (hi << 8) | lo
}

fn page_crossed(base: u16, addr: u16) -> u8 {
    ((base & 0xFF00) != (addr & 0xFF00)) as u8
}

/// Listing of `start..=stop` keyed by instruction address, e.g.
/// `$C000: LDA #$01 {IMM}`. Uses side-effect free reads only.
pub fn disassemble(bus: &impl CpuBus, start: u16, stop: u16) -> BTreeMap<u16, String> {
    let mut lines = BTreeMap::new();
    let mut addr = start as u32;
    let stop = stop as u32;

    while addr <= stop {
        let line_addr = addr as u16;
        let mut next = || {
            let value = bus.peek(addr as u16);
            addr += 1;
            value
        };

        let inst = OPCODES[next() as usize];
        let operand = match inst.mode {
            AddrMode::Imp => "{IMP}".to_string(),
            AddrMode::Imm => format!("#${:02X} {{IMM}}", next()),
            AddrMode::Zp0 => format!("${:02X} {{ZP0}}", next()),
            AddrMode::Zpx => format!("${:02X}, X {{ZPX}}", next()),
            AddrMode::Zpy => format!("${:02X}, Y {{ZPY}}", next()),
            AddrMode::Izx => format!("(${:02X}, X) {{IZX}}", next()),
            AddrMode::Izy => format!("(${:02X}), Y {{IZY}}", next()),
            AddrMode::Abs => format!("${:04X} {{ABS}}", word(next(), next())),
            AddrMode::Abx => format!("${:04X}, X {{ABX}}", word(next(), next())),
            AddrMode::Aby => format!("${:04X}, Y {{ABY}}", word(next(), next())),
            AddrMode::Ind => format!("(${:04X}) {{IND}}", word(next(), next())),
            AddrMode::Rel => {
                let offset = next();
                let target = (addr as u16).wrapping_add(offset as i8 as i16 as u16);
                format!("${offset:02X} [${target:04X}] {{REL}}")
            }
        };

        lines.insert(line_addr, format!("${line_addr:04X}: {} {operand}", inst.mnemonic));
    }

    lines
}

fn word(lo: u8, hi: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat 64KB of RAM.
    struct TestBus {
        mem: Vec<u8>,
    }

    impl TestBus {
        fn with_program(origin: u16, program: &[u8]) -> Self {
            let mut mem = vec![0; 0x10000];
            mem[origin as usize..origin as usize + program.len()].copy_from_slice(program);
            mem[RESET_VECTOR as usize] = origin as u8;
            mem[RESET_VECTOR as usize + 1] = (origin >> 8) as u8;
            Self { mem }
        }
    }

    impl CpuBus for TestBus {
        fn read(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }

        fn write(&mut self, addr: u16, data: u8) {
            self.mem[addr as usize] = data;
        }

        fn peek(&self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }
    }

    fn boot(bus: &mut TestBus) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.reset(bus);
        while !cpu.complete() {
            cpu.clock(bus);
        }
        cpu
    }

    /// Runs one instruction and returns the cycles it took.
    fn step(cpu: &mut Cpu, bus: &mut TestBus) -> u64 {
        let start = cpu.clock_count();
        cpu.clock(bus);
        while !cpu.complete() {
            cpu.clock(bus);
        }
        cpu.clock_count() - start
    }

    #[test]
    fn reset_loads_vector_and_state() {
        let mut bus = TestBus::with_program(0xC000, &[]);
        let mut cpu = Cpu::new();
        cpu.a = 0x55;
        cpu.reset(&mut bus);
        assert_eq!(cpu.pc, 0xC000);
        assert_eq!(cpu.sp, 0xFD);
        assert_eq!(cpu.status, FLAG_UNUSED);
        assert_eq!(cpu.a, 0);

        let mut clocks = 0;
        while !cpu.complete() {
            cpu.clock(&mut bus);
            clocks += 1;
        }
        assert_eq!(clocks, 8);
    }

    #[test]
    fn instruction_length_matches_disassembly() {
        for opcode in 0..=255u8 {
            let inst = OPCODES[opcode as usize];
            if matches!(
                inst.op,
                Operation::Jmp
                    | Operation::Jsr
                    | Operation::Rts
                    | Operation::Rti
                    | Operation::Brk
            ) || inst.mode == AddrMode::Rel
            {
                continue;
            }

            let mut bus = TestBus::with_program(0x8000, &[opcode, 0x10, 0x20]);
            let mut cpu = boot(&mut bus);
            step(&mut cpu, &mut bus);

            let listing = disassemble(&bus, 0x8000, 0x8000);
            let consumed = cpu.pc - 0x8000;
            assert_eq!(consumed, 1 + inst.mode.operand_len(), "opcode {opcode:02X}");
            assert!(listing[&0x8000].contains(inst.mnemonic));

            let full = disassemble(&bus, 0x8000, 0x8003);
            assert!(full.contains_key(&(0x8000 + consumed)), "opcode {opcode:02X}");
        }
    }

    #[test]
    fn branch_and_brk_lengths() {
        // BNE not taken, then BRK.
        let mut bus = TestBus::with_program(0x8000, &[0xA9, 0x00, 0xD0, 0x05, 0x00, 0xFF]);
        bus.mem[0xFFFE] = 0x00;
        bus.mem[0xFFFF] = 0x90;
        let mut cpu = boot(&mut bus);
        step(&mut cpu, &mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 2);
        assert_eq!(cpu.pc, 0x8004);

        step(&mut cpu, &mut bus);
        assert_eq!(cpu.pc, 0x9000);
        // Return address skips the padding byte.
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x06);
    }

    #[test]
    fn adc_sbc_round_trip() {
        for a in 0..=255u8 {
            for m in 0..=255u8 {
                let mut cpu = Cpu::new();
                cpu.a = a;
                cpu.set_flag(FLAG_CARRY, false);
                cpu.adc(m);
                // SBC with carry set subtracts with no borrow.
                cpu.set_flag(FLAG_CARRY, true);
                cpu.adc(m ^ 0xFF);
                assert_eq!(cpu.a, a, "a={a} m={m}");
            }
        }
    }

    #[test]
    fn adc_overflow_flag() {
        let mut cpu = Cpu::new();
        cpu.a = 0x50;
        cpu.adc(0x50);
        assert_eq!(cpu.a, 0xA0);
        assert!(cpu.get_flag(FLAG_OVERFLOW));
        assert!(cpu.get_flag(FLAG_NEGATIVE));
        assert!(!cpu.get_flag(FLAG_CARRY));

        cpu.a = 0xD0;
        cpu.set_flag(FLAG_CARRY, false);
        cpu.adc(0x90);
        assert_eq!(cpu.a, 0x60);
        assert!(cpu.get_flag(FLAG_OVERFLOW));
        assert!(cpu.get_flag(FLAG_CARRY));
    }

    #[test]
    fn indirect_jump_wraps_within_page() {
        let mut bus = TestBus::with_program(0x8000, &[0x6C, 0xFF, 0x02]);
        bus.mem[0x02FF] = 0x34;
        bus.mem[0x0200] = 0x12;
        bus.mem[0x0300] = 0x99;
        let mut cpu = boot(&mut bus);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.pc, 0x1234);
    }

    #[test]
    fn php_pushes_break_without_touching_status() {
        let mut bus = TestBus::with_program(0x8000, &[0x08]);
        let mut cpu = boot(&mut bus);
        step(&mut cpu, &mut bus);
        assert_eq!(bus.mem[0x01FD], FLAG_UNUSED | FLAG_BREAK);
        assert!(!cpu.get_flag(FLAG_BREAK));
        assert_eq!(cpu.sp, 0xFC);
    }

    #[test]
    fn nmi_pushes_state_and_jumps() {
        let mut bus = TestBus::with_program(0x8000, &[]);
        bus.mem[0xFFFA] = 0x00;
        bus.mem[0xFFFB] = 0xA0;
        let mut cpu = boot(&mut bus);
        cpu.set_flag(FLAG_CARRY, true);
        cpu.nmi(&mut bus);
        assert_eq!(cpu.pc, 0xA000);
        assert_eq!(bus.mem[0x01FD], 0x80);
        assert_eq!(bus.mem[0x01FC], 0x00);
        assert_eq!(bus.mem[0x01FB], FLAG_UNUSED | FLAG_INTERRUPT | FLAG_CARRY);
        assert!(cpu.get_flag(FLAG_INTERRUPT));

        let mut clocks = 0;
        while !cpu.complete() {
            cpu.clock(&mut bus);
            clocks += 1;
        }
        assert_eq!(clocks, 8);
    }

    #[test]
    fn irq_respects_interrupt_disable() {
        let mut bus = TestBus::with_program(0x8000, &[]);
        bus.mem[0xFFFE] = 0x00;
        bus.mem[0xFFFF] = 0xB0;
        let mut cpu = boot(&mut bus);
        cpu.set_flag(FLAG_INTERRUPT, true);
        assert!(!cpu.irq(&mut bus));
        assert_eq!(cpu.pc, 0x8000);

        cpu.set_flag(FLAG_INTERRUPT, false);
        assert!(cpu.irq(&mut bus));
        assert_eq!(cpu.pc, 0xB000);
    }

    #[test]
    fn page_cross_and_branch_timing() {
        // LDX #$01; LDA $80FF,X; BEQ +2 (taken); NOP; NOP; BNE +0 (not taken)
        let program = [0xA2, 0x01, 0xBD, 0xFF, 0x80, 0xF0, 0x02, 0xEA, 0xEA, 0xD0, 0x00];
        let mut bus = TestBus::with_program(0x8000, &program);
        let mut cpu = boot(&mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 2);
        assert_eq!(step(&mut cpu, &mut bus), 5);
        assert_eq!(step(&mut cpu, &mut bus), 3);
        assert_eq!(cpu.pc, 0x8009);
        assert_eq!(step(&mut cpu, &mut bus), 2);
    }

    #[test]
    fn stores_do_not_pay_page_cross() {
        // LDX #$01; STA $02FF,X
        let mut bus = TestBus::with_program(0x8000, &[0xA2, 0x01, 0x9D, 0xFF, 0x02]);
        let mut cpu = boot(&mut bus);
        step(&mut cpu, &mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 5);
    }

    #[test]
    fn rotate_through_accumulator() {
        // SEC; LDA #$80; ROL A; ROR A
        let mut bus = TestBus::with_program(0x8000, &[0x38, 0xA9, 0x80, 0x2A, 0x6A]);
        let mut cpu = boot(&mut bus);
        step(&mut cpu, &mut bus);
        step(&mut cpu, &mut bus);
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.a, 0x01);
        assert!(cpu.get_flag(FLAG_CARRY));
        step(&mut cpu, &mut bus);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.get_flag(FLAG_CARRY));
        assert!(cpu.get_flag(FLAG_NEGATIVE));
    }

    #[test]
    fn jsr_rts_round_trip() {
        let mut bus = TestBus::with_program(0x8000, &[0x20, 0x00, 0x90, 0xEA]);
        bus.mem[0x9000] = 0x60;
        let mut cpu = boot(&mut bus);
        assert_eq!(step(&mut cpu, &mut bus), 6);
        assert_eq!(cpu.pc, 0x9000);
        assert_eq!(step(&mut cpu, &mut bus), 6);
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.sp, 0xFD);
    }

    #[test]
    fn disassembly_format() {
        let program = [0xA9, 0x01, 0x8D, 0x00, 0x20, 0xD0, 0xFE, 0xEA];
        let bus = TestBus::with_program(0xC000, &program);
        let listing = disassemble(&bus, 0xC000, 0xC007);
        assert_eq!(listing[&0xC000], "$C000: LDA #$01 {IMM}");
        assert_eq!(listing[&0xC002], "$C002: STA $2000 {ABS}");
        assert_eq!(listing[&0xC005], "$C005: BNE $FE [$C005] {REL}");
        assert_eq!(listing[&0xC007], "$C007: NOP {IMP}");
        assert_eq!(listing.len(), 4);
    }
}
