//! Static decode table for the 6502.

/// What an instruction does. `Xxx` covers the unofficial opcodes, which are
/// decoded for their length and timing but have no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
    Xxx,
}

/// How an instruction finds its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    /// Implied, or the accumulator.
    Imp,
    Imm,
    Zp0,
    Zpx,
    Zpy,
    /// Signed 8-bit branch offset.
    Rel,
    Abs,
    Abx,
    Aby,
    /// `JMP ($xxxx)` only.
    Ind,
    /// `($zp,X)`
    Izx,
    /// `($zp),Y`
    Izy,
}

impl AddrMode {
    /// Operand bytes following the opcode.
    pub const fn operand_len(self) -> u16 {
        match self {
            AddrMode::Imp => 0,
            AddrMode::Imm
            | AddrMode::Zp0
            | AddrMode::Zpx
            | AddrMode::Zpy
            | AddrMode::Rel
            | AddrMode::Izx
            | AddrMode::Izy => 1,
            AddrMode::Abs | AddrMode::Abx | AddrMode::Aby | AddrMode::Ind => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub mnemonic: &'static str,
    pub op: Operation,
    pub mode: AddrMode,
    /// Base cycle count before page-cross and branch penalties.
    pub cycles: u8,
}

const fn op(mnemonic: &'static str, op: Operation, mode: AddrMode, cycles: u8) -> Instruction {
    Instruction {
        mnemonic,
        op,
        mode,
        cycles,
    }
}

use AddrMode::*;
use Operation::*;

pub const OPCODES: [Instruction; 256] = [
    // 00
    op("BRK", Brk, Imm, 7),
    op("ORA", Ora, Izx, 6),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 3),
    op("ORA", Ora, Zp0, 3),
    op("ASL", Asl, Zp0, 5),
    op("???", Xxx, Imp, 5),
    op("PHP", Php, Imp, 3),
    op("ORA", Ora, Imm, 2),
    op("ASL", Asl, Imp, 2),
    op("???", Xxx, Imp, 2),
    op("???", Nop, Imp, 4),
    op("ORA", Ora, Abs, 4),
    op("ASL", Asl, Abs, 6),
    op("???", Xxx, Imp, 6),
    // 10
    op("BPL", Bpl, Rel, 2),
    op("ORA", Ora, Izy, 5),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 4),
    op("ORA", Ora, Zpx, 4),
    op("ASL", Asl, Zpx, 6),
    op("???", Xxx, Imp, 6),
    op("CLC", Clc, Imp, 2),
    op("ORA", Ora, Aby, 4),
    op("???", Nop, Imp, 2),
    op("???", Xxx, Imp, 7),
    op("???", Nop, Imp, 4),
    op("ORA", Ora, Abx, 4),
    op("ASL", Asl, Abx, 7),
    op("???", Xxx, Imp, 7),
    // 20
    op("JSR", Jsr, Abs, 6),
    op("AND", And, Izx, 6),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("BIT", Bit, Zp0, 3),
    op("AND", And, Zp0, 3),
    op("ROL", Rol, Zp0, 5),
    op("???", Xxx, Imp, 5),
    op("PLP", Plp, Imp, 4),
    op("AND", And, Imm, 2),
    op("ROL", Rol, Imp, 2),
    op("???", Xxx, Imp, 2),
    op("BIT", Bit, Abs, 4),
    op("AND", And, Abs, 4),
    op("ROL", Rol, Abs, 6),
    op("???", Xxx, Imp, 6),
    // 30
    op("BMI", Bmi, Rel, 2),
    op("AND", And, Izy, 5),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 4),
    op("AND", And, Zpx, 4),
    op("ROL", Rol, Zpx, 6),
    op("???", Xxx, Imp, 6),
    op("SEC", Sec, Imp, 2),
    op("AND", And, Aby, 4),
    op("???", Nop, Imp, 2),
    op("???", Xxx, Imp, 7),
    op("???", Nop, Imp, 4),
    op("AND", And, Abx, 4),
    op("ROL", Rol, Abx, 7),
    op("???", Xxx, Imp, 7),
    // 40
    op("RTI", Rti, Imp, 6),
    op("EOR", Eor, Izx, 6),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 3),
    op("EOR", Eor, Zp0, 3),
    op("LSR", Lsr, Zp0, 5),
    op("???", Xxx, Imp, 5),
    op("PHA", Pha, Imp, 3),
    op("EOR", Eor, Imm, 2),
    op("LSR", Lsr, Imp, 2),
    op("???", Xxx, Imp, 2),
    op("JMP", Jmp, Abs, 3),
    op("EOR", Eor, Abs, 4),
    op("LSR", Lsr, Abs, 6),
    op("???", Xxx, Imp, 6),
    // 50
    op("BVC", Bvc, Rel, 2),
    op("EOR", Eor, Izy, 5),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 4),
    op("EOR", Eor, Zpx, 4),
    op("LSR", Lsr, Zpx, 6),
    op("???", Xxx, Imp, 6),
    op("CLI", Cli, Imp, 2),
    op("EOR", Eor, Aby, 4),
    op("???", Nop, Imp, 2),
    op("???", Xxx, Imp, 7),
    op("???", Nop, Imp, 4),
    op("EOR", Eor, Abx, 4),
    op("LSR", Lsr, Abx, 7),
    op("???", Xxx, Imp, 7),
    // 60
    op("RTS", Rts, Imp, 6),
    op("ADC", Adc, Izx, 6),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 3),
    op("ADC", Adc, Zp0, 3),
    op("ROR", Ror, Zp0, 5),
    op("???", Xxx, Imp, 5),
    op("PLA", Pla, Imp, 4),
    op("ADC", Adc, Imm, 2),
    op("ROR", Ror, Imp, 2),
    op("???", Xxx, Imp, 2),
    op("JMP", Jmp, Ind, 5),
    op("ADC", Adc, Abs, 4),
    op("ROR", Ror, Abs, 6),
    op("???", Xxx, Imp, 6),
    // 70
    op("BVS", Bvs, Rel, 2),
    op("ADC", Adc, Izy, 5),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 4),
    op("ADC", Adc, Zpx, 4),
    op("ROR", Ror, Zpx, 6),
    op("???", Xxx, Imp, 6),
    op("SEI", Sei, Imp, 2),
    op("ADC", Adc, Aby, 4),
    op("???", Nop, Imp, 2),
    op("???", Xxx, Imp, 7),
    op("???", Nop, Imp, 4),
    op("ADC", Adc, Abx, 4),
    op("ROR", Ror, Abx, 7),
    op("???", Xxx, Imp, 7),
    // 80
    op("???", Nop, Imp, 2),
    op("STA", Sta, Izx, 6),
    op("???", Nop, Imp, 2),
    op("???", Xxx, Imp, 6),
    op("STY", Sty, Zp0, 3),
    op("STA", Sta, Zp0, 3),
    op("STX", Stx, Zp0, 3),
    op("???", Xxx, Imp, 3),
    op("DEY", Dey, Imp, 2),
    op("???", Nop, Imp, 2),
    op("TXA", Txa, Imp, 2),
    op("???", Xxx, Imp, 2),
    op("STY", Sty, Abs, 4),
    op("STA", Sta, Abs, 4),
    op("STX", Stx, Abs, 4),
    op("???", Xxx, Imp, 4),
    // 90
    op("BCC", Bcc, Rel, 2),
    op("STA", Sta, Izy, 6),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 6),
    op("STY", Sty, Zpx, 4),
    op("STA", Sta, Zpx, 4),
    op("STX", Stx, Zpy, 4),
    op("???", Xxx, Imp, 4),
    op("TYA", Tya, Imp, 2),
    op("STA", Sta, Aby, 5),
    op("TXS", Txs, Imp, 2),
    op("???", Xxx, Imp, 5),
    op("???", Nop, Imp, 5),
    op("STA", Sta, Abx, 5),
    op("???", Xxx, Imp, 5),
    op("???", Xxx, Imp, 5),
    // A0
    op("LDY", Ldy, Imm, 2),
    op("LDA", Lda, Izx, 6),
    op("LDX", Ldx, Imm, 2),
    op("???", Xxx, Imp, 6),
    op("LDY", Ldy, Zp0, 3),
    op("LDA", Lda, Zp0, 3),
    op("LDX", Ldx, Zp0, 3),
    op("???", Xxx, Imp, 3),
    op("TAY", Tay, Imp, 2),
    op("LDA", Lda, Imm, 2),
    op("TAX", Tax, Imp, 2),
    op("???", Xxx, Imp, 2),
    op("LDY", Ldy, Abs, 4),
    op("LDA", Lda, Abs, 4),
    op("LDX", Ldx, Abs, 4),
    op("???", Xxx, Imp, 4),
    // B0
    op("BCS", Bcs, Rel, 2),
    op("LDA", Lda, Izy, 5),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 5),
    op("LDY", Ldy, Zpx, 4),
    op("LDA", Lda, Zpx, 4),
    op("LDX", Ldx, Zpy, 4),
    op("???", Xxx, Imp, 4),
    op("CLV", Clv, Imp, 2),
    op("LDA", Lda, Aby, 4),
    op("TSX", Tsx, Imp, 2),
    op("???", Xxx, Imp, 4),
    op("LDY", Ldy, Abx, 4),
    op("LDA", Lda, Abx, 4),
    op("LDX", Ldx, Aby, 4),
    op("???", Xxx, Imp, 4),
    // C0
    op("CPY", Cpy, Imm, 2),
    op("CMP", Cmp, Izx, 6),
    op("???", Nop, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("CPY", Cpy, Zp0, 3),
    op("CMP", Cmp, Zp0, 3),
    op("DEC", Dec, Zp0, 5),
    op("???", Xxx, Imp, 5),
    op("INY", Iny, Imp, 2),
    op("CMP", Cmp, Imm, 2),
    op("DEX", Dex, Imp, 2),
    op("???", Xxx, Imp, 2),
    op("CPY", Cpy, Abs, 4),
    op("CMP", Cmp, Abs, 4),
    op("DEC", Dec, Abs, 6),
    op("???", Xxx, Imp, 6),
    // D0
    op("BNE", Bne, Rel, 2),
    op("CMP", Cmp, Izy, 5),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 4),
    op("CMP", Cmp, Zpx, 4),
    op("DEC", Dec, Zpx, 6),
    op("???", Xxx, Imp, 6),
    op("CLD", Cld, Imp, 2),
    op("CMP", Cmp, Aby, 4),
    op("NOP", Nop, Imp, 2),
    op("???", Xxx, Imp, 7),
    op("???", Nop, Imp, 4),
    op("CMP", Cmp, Abx, 4),
    op("DEC", Dec, Abx, 7),
    op("???", Xxx, Imp, 7),
    // E0
    op("CPX", Cpx, Imm, 2),
    op("SBC", Sbc, Izx, 6),
    op("???", Nop, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("CPX", Cpx, Zp0, 3),
    op("SBC", Sbc, Zp0, 3),
    op("INC", Inc, Zp0, 5),
    op("???", Xxx, Imp, 5),
    op("INX", Inx, Imp, 2),
    op("SBC", Sbc, Imm, 2),
    op("NOP", Nop, Imp, 2),
    op("???", Sbc, Imp, 2),
    op("CPX", Cpx, Abs, 4),
    op("SBC", Sbc, Abs, 4),
    op("INC", Inc, Abs, 6),
    op("???", Xxx, Imp, 6),
    // F0
    op("BEQ", Beq, Rel, 2),
    op("SBC", Sbc, Izy, 5),
    op("???", Xxx, Imp, 2),
    op("???", Xxx, Imp, 8),
    op("???", Nop, Imp, 4),
    op("SBC", Sbc, Zpx, 4),
    op("INC", Inc, Zpx, 6),
    op("???", Xxx, Imp, 6),
    op("SED", Sed, Imp, 2),
    op("SBC", Sbc, Aby, 4),
    op("NOP", Nop, Imp, 2),
    op("???", Xxx, Imp, 7),
    op("???", Nop, Imp, 4),
    op("SBC", Sbc, Abx, 4),
    op("INC", Inc, Abx, 7),
    op("???", Xxx, Imp, 7),
];
