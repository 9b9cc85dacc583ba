//! 6502/65C02 逆アセンブラ
//!
//! デバッグステッパー用に1命令を1行のテキストに変換する

use super::{CpuType, MemoryBus};

/// アドレッシングモードの種類
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndirectX,
    IndirectY,
    IndirectZp,
    AbsIndirectX,
    Relative,
}

impl Mode {
    /// オペランドのバイト数
    fn operand_len(self) -> u16 {
        match self {
            Mode::Implied | Mode::Accumulator => 0,
            Mode::Immediate
            | Mode::ZeroPage
            | Mode::ZeroPageX
            | Mode::ZeroPageY
            | Mode::IndirectX
            | Mode::IndirectY
            | Mode::IndirectZp
            | Mode::Relative => 1,
            Mode::Absolute | Mode::AbsoluteX | Mode::AbsoluteY | Mode::Indirect
            | Mode::AbsIndirectX => 2,
        }
    }
}

/// オペコードからニーモニックとモードを引く
fn decode(opcode: u8, cpu_type: CpuType) -> (&'static str, Mode) {
    use Mode::*;
    let entry = match opcode {
        0xA9 => ("LDA", Immediate),
        0xA5 => ("LDA", ZeroPage),
        0xB5 => ("LDA", ZeroPageX),
        0xAD => ("LDA", Absolute),
        0xBD => ("LDA", AbsoluteX),
        0xB9 => ("LDA", AbsoluteY),
        0xA1 => ("LDA", IndirectX),
        0xB1 => ("LDA", IndirectY),
        0xA2 => ("LDX", Immediate),
        0xA6 => ("LDX", ZeroPage),
        0xB6 => ("LDX", ZeroPageY),
        0xAE => ("LDX", Absolute),
        0xBE => ("LDX", AbsoluteY),
        0xA0 => ("LDY", Immediate),
        0xA4 => ("LDY", ZeroPage),
        0xB4 => ("LDY", ZeroPageX),
        0xAC => ("LDY", Absolute),
        0xBC => ("LDY", AbsoluteX),
        0x85 => ("STA", ZeroPage),
        0x95 => ("STA", ZeroPageX),
        0x8D => ("STA", Absolute),
        0x9D => ("STA", AbsoluteX),
        0x99 => ("STA", AbsoluteY),
        0x81 => ("STA", IndirectX),
        0x91 => ("STA", IndirectY),
        0x86 => ("STX", ZeroPage),
        0x96 => ("STX", ZeroPageY),
        0x8E => ("STX", Absolute),
        0x84 => ("STY", ZeroPage),
        0x94 => ("STY", ZeroPageX),
        0x8C => ("STY", Absolute),
        0xAA => ("TAX", Implied),
        0x8A => ("TXA", Implied),
        0xA8 => ("TAY", Implied),
        0x98 => ("TYA", Implied),
        0xBA => ("TSX", Implied),
        0x9A => ("TXS", Implied),
        0x48 => ("PHA", Implied),
        0x68 => ("PLA", Implied),
        0x08 => ("PHP", Implied),
        0x28 => ("PLP", Implied),
        0x69 => ("ADC", Immediate),
        0x65 => ("ADC", ZeroPage),
        0x75 => ("ADC", ZeroPageX),
        0x6D => ("ADC", Absolute),
        0x7D => ("ADC", AbsoluteX),
        0x79 => ("ADC", AbsoluteY),
        0x61 => ("ADC", IndirectX),
        0x71 => ("ADC", IndirectY),
        0xE9 => ("SBC", Immediate),
        0xE5 => ("SBC", ZeroPage),
        0xF5 => ("SBC", ZeroPageX),
        0xED => ("SBC", Absolute),
        0xFD => ("SBC", AbsoluteX),
        0xF9 => ("SBC", AbsoluteY),
        0xE1 => ("SBC", IndirectX),
        0xF1 => ("SBC", IndirectY),
        0xC9 => ("CMP", Immediate),
        0xC5 => ("CMP", ZeroPage),
        0xD5 => ("CMP", ZeroPageX),
        0xCD => ("CMP", Absolute),
        0xDD => ("CMP", AbsoluteX),
        0xD9 => ("CMP", AbsoluteY),
        0xC1 => ("CMP", IndirectX),
        0xD1 => ("CMP", IndirectY),
        0xE0 => ("CPX", Immediate),
        0xE4 => ("CPX", ZeroPage),
        0xEC => ("CPX", Absolute),
        0xC0 => ("CPY", Immediate),
        0xC4 => ("CPY", ZeroPage),
        0xCC => ("CPY", Absolute),
        0xE6 => ("INC", ZeroPage),
        0xF6 => ("INC", ZeroPageX),
        0xEE => ("INC", Absolute),
        0xFE => ("INC", AbsoluteX),
        0xC6 => ("DEC", ZeroPage),
        0xD6 => ("DEC", ZeroPageX),
        0xCE => ("DEC", Absolute),
        0xDE => ("DEC", AbsoluteX),
        0xE8 => ("INX", Implied),
        0xC8 => ("INY", Implied),
        0xCA => ("DEX", Implied),
        0x88 => ("DEY", Implied),
        0x29 => ("AND", Immediate),
        0x25 => ("AND", ZeroPage),
        0x35 => ("AND", ZeroPageX),
        0x2D => ("AND", Absolute),
        0x3D => ("AND", AbsoluteX),
        0x39 => ("AND", AbsoluteY),
        0x21 => ("AND", IndirectX),
        0x31 => ("AND", IndirectY),
        0x09 => ("ORA", Immediate),
        0x05 => ("ORA", ZeroPage),
        0x15 => ("ORA", ZeroPageX),
        0x0D => ("ORA", Absolute),
        0x1D => ("ORA", AbsoluteX),
        0x19 => ("ORA", AbsoluteY),
        0x01 => ("ORA", IndirectX),
        0x11 => ("ORA", IndirectY),
        0x49 => ("EOR", Immediate),
        0x45 => ("EOR", ZeroPage),
        0x55 => ("EOR", ZeroPageX),
        0x4D => ("EOR", Absolute),
        0x5D => ("EOR", AbsoluteX),
        0x59 => ("EOR", AbsoluteY),
        0x41 => ("EOR", IndirectX),
        0x51 => ("EOR", IndirectY),
        0x0A => ("ASL", Accumulator),
        0x06 => ("ASL", ZeroPage),
        0x16 => ("ASL", ZeroPageX),
        0x0E => ("ASL", Absolute),
        0x1E => ("ASL", AbsoluteX),
        0x4A => ("LSR", Accumulator),
        0x46 => ("LSR", ZeroPage),
        0x56 => ("LSR", ZeroPageX),
        0x4E => ("LSR", Absolute),
        0x5E => ("LSR", AbsoluteX),
        0x2A => ("ROL", Accumulator),
        0x26 => ("ROL", ZeroPage),
        0x36 => ("ROL", ZeroPageX),
        0x2E => ("ROL", Absolute),
        0x3E => ("ROL", AbsoluteX),
        0x6A => ("ROR", Accumulator),
        0x66 => ("ROR", ZeroPage),
        0x76 => ("ROR", ZeroPageX),
        0x6E => ("ROR", Absolute),
        0x7E => ("ROR", AbsoluteX),
        0x24 => ("BIT", ZeroPage),
        0x2C => ("BIT", Absolute),
        0x10 => ("BPL", Relative),
        0x30 => ("BMI", Relative),
        0x50 => ("BVC", Relative),
        0x70 => ("BVS", Relative),
        0x90 => ("BCC", Relative),
        0xB0 => ("BCS", Relative),
        0xD0 => ("BNE", Relative),
        0xF0 => ("BEQ", Relative),
        0x4C => ("JMP", Absolute),
        0x6C => ("JMP", Indirect),
        0x20 => ("JSR", Absolute),
        0x60 => ("RTS", Implied),
        0x00 => ("BRK", Implied),
        0x40 => ("RTI", Implied),
        0x18 => ("CLC", Implied),
        0x38 => ("SEC", Implied),
        0x58 => ("CLI", Implied),
        0x78 => ("SEI", Implied),
        0xB8 => ("CLV", Implied),
        0xD8 => ("CLD", Implied),
        0xF8 => ("SED", Implied),
        0xEA => ("NOP", Implied),
        _ => ("???", Implied),
    };

    if entry.0 != "???" {
        return entry;
    }

    // 65C02拡張
    if cpu_type == CpuType::Cpu65C02 {
        return match opcode {
            0x1A => ("INC", Accumulator),
            0x3A => ("DEC", Accumulator),
            0x80 => ("BRA", Relative),
            0x64 => ("STZ", ZeroPage),
            0x74 => ("STZ", ZeroPageX),
            0x9C => ("STZ", Absolute),
            0x9E => ("STZ", AbsoluteX),
            0x7C => ("JMP", AbsIndirectX),
            0x12 => ("ORA", IndirectZp),
            0x32 => ("AND", IndirectZp),
            0x52 => ("EOR", IndirectZp),
            0x72 => ("ADC", IndirectZp),
            0x92 => ("STA", IndirectZp),
            0xB2 => ("LDA", IndirectZp),
            0xD2 => ("CMP", IndirectZp),
            0xF2 => ("SBC", IndirectZp),
            0xDA => ("PHX", Implied),
            0xFA => ("PLX", Implied),
            0x5A => ("PHY", Implied),
            0x7A => ("PLY", Implied),
            0x89 => ("BIT", Immediate),
            0x34 => ("BIT", ZeroPageX),
            0x3C => ("BIT", AbsoluteX),
            0x14 => ("TRB", ZeroPage),
            0x1C => ("TRB", Absolute),
            0x04 => ("TSB", ZeroPage),
            0x0C => ("TSB", Absolute),
            _ => ("???", Implied),
        };
    }

    ("???", Implied)
}

/// PC位置の1命令を逆アセンブルして行テキストを返す
pub fn disassemble<M: MemoryBus>(memory: &mut M, pc: u16, cpu_type: CpuType) -> String {
    let opcode = memory.read(pc);
    let (mnemonic, mode) = decode(opcode, cpu_type);
    let len = mode.operand_len();

    let b1 = if len >= 1 { memory.read(pc.wrapping_add(1)) } else { 0 };
    let b2 = if len >= 2 { memory.read(pc.wrapping_add(2)) } else { 0 };
    let word = ((b2 as u16) << 8) | b1 as u16;

    let bytes = match len {
        0 => format!("{:02X}      ", opcode),
        1 => format!("{:02X} {:02X}   ", opcode, b1),
        _ => format!("{:02X} {:02X} {:02X}", opcode, b1, b2),
    };

    let operand = match mode {
        Mode::Implied => String::new(),
        Mode::Accumulator => "A".to_string(),
        Mode::Immediate => format!("#${:02X}", b1),
        Mode::ZeroPage => format!("${:02X}", b1),
        Mode::ZeroPageX => format!("${:02X},X", b1),
        Mode::ZeroPageY => format!("${:02X},Y", b1),
        Mode::Absolute => format!("${:04X}", word),
        Mode::AbsoluteX => format!("${:04X},X", word),
        Mode::AbsoluteY => format!("${:04X},Y", word),
        Mode::Indirect => format!("(${:04X})", word),
        Mode::IndirectX => format!("(${:02X},X)", b1),
        Mode::IndirectY => format!("(${:02X}),Y", b1),
        Mode::IndirectZp => format!("(${:02X})", b1),
        Mode::AbsIndirectX => format!("(${:04X},X)", word),
        Mode::Relative => {
            let target = pc.wrapping_add(2).wrapping_add(b1 as i8 as u16);
            format!("${:04X}", target)
        }
    };

    if operand.is_empty() {
        format!("{:04X}: {}  {}", pc, bytes, mnemonic)
    } else {
        format!("{:04X}: {}  {} {}", pc, bytes, mnemonic, operand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flat(Vec<u8>);
    impl MemoryBus for Flat {
        fn read(&mut self, address: u16) -> u8 {
            self.0[address as usize]
        }
        fn write(&mut self, address: u16, value: u8) {
            self.0[address as usize] = value;
        }
    }

    #[test]
    fn test_disassemble_absolute() {
        let mut mem = Flat(vec![0; 65536]);
        mem.0[0x0600] = 0xAD;
        mem.0[0x0601] = 0x51;
        mem.0[0x0602] = 0xC0;
        let line = disassemble(&mut mem, 0x0600, CpuType::Cpu6502);
        assert_eq!(line, "0600: AD 51 C0  LDA $C051");
    }

    #[test]
    fn test_disassemble_branch_target() {
        let mut mem = Flat(vec![0; 65536]);
        mem.0[0x0600] = 0xD0; // BNE
        mem.0[0x0601] = 0xFE; // -2 -> 自分自身へ
        let line = disassemble(&mut mem, 0x0600, CpuType::Cpu6502);
        assert_eq!(line, "0600: D0 FE     BNE $0600");
    }

    #[test]
    fn test_disassemble_65c02_only() {
        let mut mem = Flat(vec![0; 65536]);
        mem.0[0x0600] = 0x64; // STZ zp
        mem.0[0x0601] = 0x10;
        let line = disassemble(&mut mem, 0x0600, CpuType::Cpu65C02);
        assert!(line.contains("STZ $10"));
        let line2 = disassemble(&mut mem, 0x0600, CpuType::Cpu6502);
        assert!(line2.contains("???"));
    }
}
