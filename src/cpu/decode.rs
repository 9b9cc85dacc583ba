//! オペコードのデコードテーブル
//!
//! 256エントリの {命令, アドレッシングモード, 基本サイクル} テーブル。
//! ページ境界越えや分岐成立のペナルティサイクルは実行エンジン側で加算する。

use super::CpuType;

/// 命令の種類
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum Op {
    Lda,
    Ldx,
    Ldy,
    Sta,
    Stx,
    Sty,
    Stz,
    Tax,
    Txa,
    Tay,
    Tya,
    Tsx,
    Txs,
    Pha,
    Pla,
    Php,
    Plp,
    Phx,
    Plx,
    Phy,
    Ply,
    Adc,
    Sbc,
    Cmp,
    Cpx,
    Cpy,
    Inc,
    Dec,
    Inx,
    Iny,
    Dex,
    Dey,
    And,
    Ora,
    Eor,
    Bit,
    Asl,
    Lsr,
    Rol,
    Ror,
    Trb,
    Tsb,
    Bpl,
    Bmi,
    Bvc,
    Bvs,
    Bcc,
    Bcs,
    Bne,
    Beq,
    Bra,
    Jmp,
    Jsr,
    Rts,
    Brk,
    Rti,
    Clc,
    Sec,
    Cli,
    Sei,
    Clv,
    Cld,
    Sed,
    Nop,
}

/// アドレッシングモード
#[derive(Debug, Clone, Copy, PartialEq)]
pub(super) enum Mode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    /// ($nnnn) - JMP専用
    Indirect,
    /// ($nnnn,X) - 65C02 JMP専用
    AbsIndirectX,
    /// ($nn,X)
    IndexedIndirect,
    /// ($nn),Y
    IndirectIndexed,
    /// ($nn) - 65C02
    ZpIndirect,
    Relative,
}

/// オペコードを {命令, モード, 基本サイクル} に変換する
/// 未定義オペコードもNOP相当のエントリとして返す
pub(super) fn decode(opcode: u8, cpu_type: CpuType) -> (Op, Mode, u32) {
    if let Some(entry) = decode_documented(opcode) {
        return entry;
    }
    if cpu_type == CpuType::Cpu65C02 {
        decode_cmos(opcode)
    } else {
        decode_nmos_undocumented(opcode)
    }
}

/// NMOS 6502の定義済み151オペコード
fn decode_documented(opcode: u8) -> Option<(Op, Mode, u32)> {
    use Mode::*;
    use Op::*;
    let entry = match opcode {
        // ロード
        0xA9 => (Lda, Immediate, 2),
        0xA5 => (Lda, ZeroPage, 3),
        0xB5 => (Lda, ZeroPageX, 4),
        0xAD => (Lda, Absolute, 4),
        0xBD => (Lda, AbsoluteX, 4),
        0xB9 => (Lda, AbsoluteY, 4),
        0xA1 => (Lda, IndexedIndirect, 6),
        0xB1 => (Lda, IndirectIndexed, 5),
        0xA2 => (Ldx, Immediate, 2),
        0xA6 => (Ldx, ZeroPage, 3),
        0xB6 => (Ldx, ZeroPageY, 4),
        0xAE => (Ldx, Absolute, 4),
        0xBE => (Ldx, AbsoluteY, 4),
        0xA0 => (Ldy, Immediate, 2),
        0xA4 => (Ldy, ZeroPage, 3),
        0xB4 => (Ldy, ZeroPageX, 4),
        0xAC => (Ldy, Absolute, 4),
        0xBC => (Ldy, AbsoluteX, 4),

        // ストア（インデックス付きは固定コスト）
        0x85 => (Sta, ZeroPage, 3),
        0x95 => (Sta, ZeroPageX, 4),
        0x8D => (Sta, Absolute, 4),
        0x9D => (Sta, AbsoluteX, 5),
        0x99 => (Sta, AbsoluteY, 5),
        0x81 => (Sta, IndexedIndirect, 6),
        0x91 => (Sta, IndirectIndexed, 6),
        0x86 => (Stx, ZeroPage, 3),
        0x96 => (Stx, ZeroPageY, 4),
        0x8E => (Stx, Absolute, 4),
        0x84 => (Sty, ZeroPage, 3),
        0x94 => (Sty, ZeroPageX, 4),
        0x8C => (Sty, Absolute, 4),

        // 転送
        0xAA => (Tax, Implied, 2),
        0x8A => (Txa, Implied, 2),
        0xA8 => (Tay, Implied, 2),
        0x98 => (Tya, Implied, 2),
        0xBA => (Tsx, Implied, 2),
        0x9A => (Txs, Implied, 2),

        // スタック
        0x48 => (Pha, Implied, 3),
        0x68 => (Pla, Implied, 4),
        0x08 => (Php, Implied, 3),
        0x28 => (Plp, Implied, 4),

        // 加減算
        0x69 => (Adc, Immediate, 2),
        0x65 => (Adc, ZeroPage, 3),
        0x75 => (Adc, ZeroPageX, 4),
        0x6D => (Adc, Absolute, 4),
        0x7D => (Adc, AbsoluteX, 4),
        0x79 => (Adc, AbsoluteY, 4),
        0x61 => (Adc, IndexedIndirect, 6),
        0x71 => (Adc, IndirectIndexed, 5),
        0xE9 => (Sbc, Immediate, 2),
        0xE5 => (Sbc, ZeroPage, 3),
        0xF5 => (Sbc, ZeroPageX, 4),
        0xED => (Sbc, Absolute, 4),
        0xFD => (Sbc, AbsoluteX, 4),
        0xF9 => (Sbc, AbsoluteY, 4),
        0xE1 => (Sbc, IndexedIndirect, 6),
        0xF1 => (Sbc, IndirectIndexed, 5),

        // 比較
        0xC9 => (Cmp, Immediate, 2),
        0xC5 => (Cmp, ZeroPage, 3),
        0xD5 => (Cmp, ZeroPageX, 4),
        0xCD => (Cmp, Absolute, 4),
        0xDD => (Cmp, AbsoluteX, 4),
        0xD9 => (Cmp, AbsoluteY, 4),
        0xC1 => (Cmp, IndexedIndirect, 6),
        0xD1 => (Cmp, IndirectIndexed, 5),
        0xE0 => (Cpx, Immediate, 2),
        0xE4 => (Cpx, ZeroPage, 3),
        0xEC => (Cpx, Absolute, 4),
        0xC0 => (Cpy, Immediate, 2),
        0xC4 => (Cpy, ZeroPage, 3),
        0xCC => (Cpy, Absolute, 4),

        // インクリメント/デクリメント
        0xE6 => (Inc, ZeroPage, 5),
        0xF6 => (Inc, ZeroPageX, 6),
        0xEE => (Inc, Absolute, 6),
        0xFE => (Inc, AbsoluteX, 7),
        0xC6 => (Dec, ZeroPage, 5),
        0xD6 => (Dec, ZeroPageX, 6),
        0xCE => (Dec, Absolute, 6),
        0xDE => (Dec, AbsoluteX, 7),
        0xE8 => (Inx, Implied, 2),
        0xC8 => (Iny, Implied, 2),
        0xCA => (Dex, Implied, 2),
        0x88 => (Dey, Implied, 2),

        // 論理演算
        0x29 => (And, Immediate, 2),
        0x25 => (And, ZeroPage, 3),
        0x35 => (And, ZeroPageX, 4),
        0x2D => (And, Absolute, 4),
        0x3D => (And, AbsoluteX, 4),
        0x39 => (And, AbsoluteY, 4),
        0x21 => (And, IndexedIndirect, 6),
        0x31 => (And, IndirectIndexed, 5),
        0x09 => (Ora, Immediate, 2),
        0x05 => (Ora, ZeroPage, 3),
        0x15 => (Ora, ZeroPageX, 4),
        0x0D => (Ora, Absolute, 4),
        0x1D => (Ora, AbsoluteX, 4),
        0x19 => (Ora, AbsoluteY, 4),
        0x01 => (Ora, IndexedIndirect, 6),
        0x11 => (Ora, IndirectIndexed, 5),
        0x49 => (Eor, Immediate, 2),
        0x45 => (Eor, ZeroPage, 3),
        0x55 => (Eor, ZeroPageX, 4),
        0x4D => (Eor, Absolute, 4),
        0x5D => (Eor, AbsoluteX, 4),
        0x59 => (Eor, AbsoluteY, 4),
        0x41 => (Eor, IndexedIndirect, 6),
        0x51 => (Eor, IndirectIndexed, 5),
        0x24 => (Bit, ZeroPage, 3),
        0x2C => (Bit, Absolute, 4),

        // シフト/ローテート
        0x0A => (Asl, Accumulator, 2),
        0x06 => (Asl, ZeroPage, 5),
        0x16 => (Asl, ZeroPageX, 6),
        0x0E => (Asl, Absolute, 6),
        0x1E => (Asl, AbsoluteX, 7),
        0x4A => (Lsr, Accumulator, 2),
        0x46 => (Lsr, ZeroPage, 5),
        0x56 => (Lsr, ZeroPageX, 6),
        0x4E => (Lsr, Absolute, 6),
        0x5E => (Lsr, AbsoluteX, 7),
        0x2A => (Rol, Accumulator, 2),
        0x26 => (Rol, ZeroPage, 5),
        0x36 => (Rol, ZeroPageX, 6),
        0x2E => (Rol, Absolute, 6),
        0x3E => (Rol, AbsoluteX, 7),
        0x6A => (Ror, Accumulator, 2),
        0x66 => (Ror, ZeroPage, 5),
        0x76 => (Ror, ZeroPageX, 6),
        0x6E => (Ror, Absolute, 6),
        0x7E => (Ror, AbsoluteX, 7),

        // 分岐
        0x10 => (Bpl, Relative, 2),
        0x30 => (Bmi, Relative, 2),
        0x50 => (Bvc, Relative, 2),
        0x70 => (Bvs, Relative, 2),
        0x90 => (Bcc, Relative, 2),
        0xB0 => (Bcs, Relative, 2),
        0xD0 => (Bne, Relative, 2),
        0xF0 => (Beq, Relative, 2),

        // ジャンプ/サブルーチン/割り込み
        0x4C => (Jmp, Absolute, 3),
        0x6C => (Jmp, Indirect, 5),
        0x20 => (Jsr, Absolute, 6),
        0x60 => (Rts, Implied, 6),
        0x00 => (Brk, Implied, 7),
        0x40 => (Rti, Implied, 6),

        // フラグ
        0x18 => (Clc, Implied, 2),
        0x38 => (Sec, Implied, 2),
        0x58 => (Cli, Implied, 2),
        0x78 => (Sei, Implied, 2),
        0xB8 => (Clv, Implied, 2),
        0xD8 => (Cld, Implied, 2),
        0xF8 => (Sed, Implied, 2),

        0xEA => (Nop, Implied, 2),

        _ => return None,
    };
    Some(entry)
}

/// 65C02の拡張オペコード
/// 残りの未定義オペコードは1サイクルNOPになる
fn decode_cmos(opcode: u8) -> (Op, Mode, u32) {
    use Mode::*;
    use Op::*;
    match opcode {
        0x80 => (Bra, Relative, 2),
        0x64 => (Stz, ZeroPage, 3),
        0x74 => (Stz, ZeroPageX, 4),
        0x9C => (Stz, Absolute, 4),
        0x9E => (Stz, AbsoluteX, 5),
        0xDA => (Phx, Implied, 3),
        0xFA => (Plx, Implied, 4),
        0x5A => (Phy, Implied, 3),
        0x7A => (Ply, Implied, 4),
        // INC A / DEC A はアキュムレータモードのInc/Dec
        0x1A => (Inc, Accumulator, 2),
        0x3A => (Dec, Accumulator, 2),
        0x14 => (Trb, ZeroPage, 5),
        0x1C => (Trb, Absolute, 6),
        0x04 => (Tsb, ZeroPage, 5),
        0x0C => (Tsb, Absolute, 6),
        0x89 => (Bit, Immediate, 2),
        0x34 => (Bit, ZeroPageX, 4),
        0x3C => (Bit, AbsoluteX, 4),
        0x7C => (Jmp, AbsIndirectX, 6),
        // (zp)アドレッシング
        0x12 => (Ora, ZpIndirect, 5),
        0x32 => (And, ZpIndirect, 5),
        0x52 => (Eor, ZpIndirect, 5),
        0x72 => (Adc, ZpIndirect, 5),
        0x92 => (Sta, ZpIndirect, 5),
        0xB2 => (Lda, ZpIndirect, 5),
        0xD2 => (Cmp, ZpIndirect, 5),
        0xF2 => (Sbc, ZpIndirect, 5),
        // マルチバイトNOP
        0x02 | 0x22 | 0x42 | 0x62 | 0x82 | 0xC2 | 0xE2 => (Nop, Immediate, 2),
        0x44 => (Nop, ZeroPage, 3),
        0x54 | 0xD4 | 0xF4 => (Nop, ZeroPageX, 4),
        0x5C | 0xDC | 0xFC => (Nop, Absolute, 4),
        // 1サイクルNOP
        _ => (Nop, Implied, 1),
    }
}

/// NMOSの未定義オペコード
/// 個別にモデル化していないものはアドレッシングモード相当のNOPとして実行する
fn decode_nmos_undocumented(opcode: u8) -> (Op, Mode, u32) {
    use Mode::*;
    use Op::*;
    match opcode {
        0x1A | 0x3A | 0x5A | 0x7A | 0xDA | 0xFA => (Nop, Implied, 2),
        0x80 | 0x82 | 0x89 | 0xC2 | 0xE2 => (Nop, Immediate, 2),
        0x04 | 0x44 | 0x64 => (Nop, ZeroPage, 3),
        0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => (Nop, ZeroPageX, 4),
        0x0C => (Nop, Absolute, 4),
        0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC => (Nop, AbsoluteX, 4),
        // その他（KIL等）は2サイクルNOP扱い
        _ => (Nop, Implied, 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_coverage() {
        // 定義済みNMOSオペコードは151個
        let count = (0u16..=255)
            .filter(|&op| decode_documented(op as u8).is_some())
            .count();
        assert_eq!(count, 151);
    }

    #[test]
    fn test_cmos_fallback_is_one_cycle_nop() {
        let (op, mode, cycles) = decode(0x03, CpuType::Cpu65C02);
        assert_eq!(op, Op::Nop);
        assert_eq!(mode, Mode::Implied);
        assert_eq!(cycles, 1);
    }

    #[test]
    fn test_nmos_does_not_see_cmos_ops() {
        // STZ zpはNMOSでは未定義NOP
        let (op, _, cycles) = decode(0x64, CpuType::Cpu6502);
        assert_eq!(op, Op::Nop);
        assert_eq!(cycles, 3);
        let (op, _, _) = decode(0x64, CpuType::Cpu65C02);
        assert_eq!(op, Op::Stz);
    }

    #[test]
    fn test_base_cycles_sample() {
        assert_eq!(decode(0x20, CpuType::Cpu6502).2, 6); // JSR
        assert_eq!(decode(0x60, CpuType::Cpu6502).2, 6); // RTS
        assert_eq!(decode(0x00, CpuType::Cpu6502).2, 7); // BRK
        assert_eq!(decode(0xFE, CpuType::Cpu6502).2, 7); // INC abs,X
        assert_eq!(decode(0x9D, CpuType::Cpu6502).2, 5); // STA abs,X
    }
}
