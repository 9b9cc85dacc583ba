//! 命令実行エンジン
//!
//! デコードテーブルが返す {命令, モード, 基本サイクル} を受け取り、
//! オペランド解決と命令本体の実行を行う。基本サイクルはテーブル側、
//! ページ境界・分岐成立・BCDの追加サイクルはここで加算する。

use super::decode::{decode, Mode, Op};
use super::{flags, Cpu, CpuType, MemoryBus};

/// 解決済みオペランド
#[derive(Debug, Clone, Copy)]
enum Operand {
    None,
    Accumulator,
    Immediate(u8),
    Address(u16),
}

/// オペランドを読むだけの命令か（ページ境界ペナルティの対象）
fn takes_cross_penalty(op: Op) -> bool {
    matches!(
        op,
        Op::Lda
            | Op::Ldx
            | Op::Ldy
            | Op::Adc
            | Op::Sbc
            | Op::Cmp
            | Op::And
            | Op::Ora
            | Op::Eor
            | Op::Bit
            | Op::Nop
    )
}

impl Cpu {
    /// 1オペコードをデコードして実行する
    pub(super) fn execute_opcode<M: MemoryBus>(&mut self, memory: &mut M, opcode: u8) {
        let (op, mode, base) = decode(opcode, self.cpu_type);
        self.cycles += base;

        // ジャンプ/分岐はオペランドを命令側で消費する
        let operand = match mode {
            Mode::Relative | Mode::Indirect | Mode::AbsIndirectX => Operand::None,
            _ => self.resolve(memory, mode, takes_cross_penalty(op)),
        };

        match op {
            // ロード/ストア
            Op::Lda => {
                let value = self.operand_value(memory, operand);
                self.regs.a = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Ldx => {
                let value = self.operand_value(memory, operand);
                self.regs.x = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Ldy => {
                let value = self.operand_value(memory, operand);
                self.regs.y = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Sta => self.store(memory, operand, self.regs.a),
            Op::Stx => self.store(memory, operand, self.regs.x),
            Op::Sty => self.store(memory, operand, self.regs.y),
            Op::Stz => self.store(memory, operand, 0),

            // 転送
            Op::Tax => {
                self.regs.x = self.regs.a;
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Op::Txa => {
                self.regs.a = self.regs.x;
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Tay => {
                self.regs.y = self.regs.a;
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Op::Tya => {
                self.regs.a = self.regs.y;
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Tsx => {
                self.regs.x = self.regs.sp;
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Op::Txs => self.regs.sp = self.regs.x,

            // スタック
            Op::Pha => self.push_byte(memory, self.regs.a),
            Op::Phx => self.push_byte(memory, self.regs.x),
            Op::Phy => self.push_byte(memory, self.regs.y),
            Op::Pla => {
                let value = self.pop_byte(memory);
                self.regs.a = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Plx => {
                let value = self.pop_byte(memory);
                self.regs.x = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Ply => {
                let value = self.pop_byte(memory);
                self.regs.y = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Php => {
                self.push_byte(memory, self.regs.status | flags::BREAK | flags::UNUSED)
            }
            Op::Plp => {
                self.regs.status = self.pop_byte(memory);
                self.regs.set_flag(flags::UNUSED, true);
                self.regs.set_flag(flags::BREAK, false);
            }

            // 算術
            Op::Adc => {
                let value = self.operand_value(memory, operand);
                self.add_with_carry(value);
            }
            Op::Sbc => {
                let value = self.operand_value(memory, operand);
                self.subtract_with_carry(value);
            }
            Op::Cmp => {
                let value = self.operand_value(memory, operand);
                self.compare(self.regs.a, value);
            }
            Op::Cpx => {
                let value = self.operand_value(memory, operand);
                self.compare(self.regs.x, value);
            }
            Op::Cpy => {
                let value = self.operand_value(memory, operand);
                self.compare(self.regs.y, value);
            }

            // インクリメント/デクリメント
            Op::Inc => self.modify(memory, operand, |cpu, v| {
                let result = v.wrapping_add(1);
                cpu.regs.update_zero_negative_flags(result);
                result
            }),
            Op::Dec => self.modify(memory, operand, |cpu, v| {
                let result = v.wrapping_sub(1);
                cpu.regs.update_zero_negative_flags(result);
                result
            }),
            Op::Inx => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Op::Iny => {
                self.regs.y = self.regs.y.wrapping_add(1);
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Op::Dex => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Op::Dey => {
                self.regs.y = self.regs.y.wrapping_sub(1);
                self.regs.update_zero_negative_flags(self.regs.y);
            }

            // 論理演算
            Op::And => {
                self.regs.a &= self.operand_value(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Ora => {
                self.regs.a |= self.operand_value(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Eor => {
                self.regs.a ^= self.operand_value(memory, operand);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Bit => {
                let value = self.operand_value(memory, operand);
                self.regs
                    .set_flag(flags::ZERO, self.regs.a & value == 0);
                // BIT #はNとVに影響しない
                if mode != Mode::Immediate {
                    self.regs.set_flag(flags::OVERFLOW, value & 0x40 != 0);
                    self.regs.set_flag(flags::NEGATIVE, value & 0x80 != 0);
                }
            }

            // シフト/ローテート
            Op::Asl => self.modify(memory, operand, |cpu, v| {
                cpu.regs.set_flag(flags::CARRY, v & 0x80 != 0);
                let result = v << 1;
                cpu.regs.update_zero_negative_flags(result);
                result
            }),
            Op::Lsr => self.modify(memory, operand, |cpu, v| {
                cpu.regs.set_flag(flags::CARRY, v & 0x01 != 0);
                let result = v >> 1;
                cpu.regs.update_zero_negative_flags(result);
                result
            }),
            Op::Rol => self.modify(memory, operand, |cpu, v| {
                let carry_in = if cpu.regs.get_flag(flags::CARRY) { 1 } else { 0 };
                cpu.regs.set_flag(flags::CARRY, v & 0x80 != 0);
                let result = (v << 1) | carry_in;
                cpu.regs.update_zero_negative_flags(result);
                result
            }),
            Op::Ror => self.modify(memory, operand, |cpu, v| {
                let carry_in = if cpu.regs.get_flag(flags::CARRY) { 0x80 } else { 0 };
                cpu.regs.set_flag(flags::CARRY, v & 0x01 != 0);
                let result = (v >> 1) | carry_in;
                cpu.regs.update_zero_negative_flags(result);
                result
            }),

            // TRB/TSB (65C02) - ZフラグはA & Mから決まる
            Op::Trb => {
                if let Operand::Address(addr) = operand {
                    let value = memory.read(addr);
                    self.regs
                        .set_flag(flags::ZERO, self.regs.a & value == 0);
                    memory.write(addr, value & !self.regs.a);
                }
            }
            Op::Tsb => {
                if let Operand::Address(addr) = operand {
                    let value = memory.read(addr);
                    self.regs
                        .set_flag(flags::ZERO, self.regs.a & value == 0);
                    memory.write(addr, value | self.regs.a);
                }
            }

            // 分岐
            Op::Bpl => {
                let taken = !self.regs.get_flag(flags::NEGATIVE);
                self.branch(memory, taken);
            }
            Op::Bmi => {
                let taken = self.regs.get_flag(flags::NEGATIVE);
                self.branch(memory, taken);
            }
            Op::Bvc => {
                let taken = !self.regs.get_flag(flags::OVERFLOW);
                self.branch(memory, taken);
            }
            Op::Bvs => {
                let taken = self.regs.get_flag(flags::OVERFLOW);
                self.branch(memory, taken);
            }
            Op::Bcc => {
                let taken = !self.regs.get_flag(flags::CARRY);
                self.branch(memory, taken);
            }
            Op::Bcs => {
                let taken = self.regs.get_flag(flags::CARRY);
                self.branch(memory, taken);
            }
            Op::Bne => {
                let taken = !self.regs.get_flag(flags::ZERO);
                self.branch(memory, taken);
            }
            Op::Beq => {
                let taken = self.regs.get_flag(flags::ZERO);
                self.branch(memory, taken);
            }
            Op::Bra => self.branch(memory, true),

            // ジャンプ/サブルーチン
            Op::Jmp => self.jump(memory, mode),
            Op::Jsr => {
                let target = self.fetch_word(memory);
                self.push_word(memory, self.regs.pc.wrapping_sub(1));
                self.regs.pc = target;
            }
            Op::Rts => self.regs.pc = self.pop_word(memory).wrapping_add(1),

            // ソフトウェア割り込み
            Op::Brk => {
                self.regs.pc = self.regs.pc.wrapping_add(1);
                self.push_word(memory, self.regs.pc);
                self.push_byte(memory, self.regs.status | flags::BREAK | flags::UNUSED);
                self.regs.set_flag(flags::IRQ_DISABLE, true);
                // 65C02はBRKでDフラグをクリア
                if self.cpu_type == CpuType::Cpu65C02 {
                    self.regs.set_flag(flags::DECIMAL, false);
                }
                let low = memory.read(0xFFFE) as u16;
                let high = memory.read(0xFFFF) as u16;
                self.regs.pc = (high << 8) | low;
            }
            Op::Rti => {
                self.regs.status = self.pop_byte(memory);
                self.regs.set_flag(flags::UNUSED, true);
                self.regs.set_flag(flags::BREAK, false);
                self.regs.pc = self.pop_word(memory);
            }

            // フラグ
            Op::Clc => self.regs.set_flag(flags::CARRY, false),
            Op::Sec => self.regs.set_flag(flags::CARRY, true),
            Op::Cli => self.regs.set_flag(flags::IRQ_DISABLE, false),
            Op::Sei => self.regs.set_flag(flags::IRQ_DISABLE, true),
            Op::Clv => self.regs.set_flag(flags::OVERFLOW, false),
            Op::Cld => self.regs.set_flag(flags::DECIMAL, false),
            Op::Sed => self.regs.set_flag(flags::DECIMAL, true),

            // オペランドは解決済みなので何もしない
            Op::Nop => {}
        }
    }

    // ========================================
    // オペランド解決
    // ========================================

    /// アドレッシングモードから実効アドレスを求める
    /// cross_penaltyが有効な場合、インデックスでページ境界を越えると+1サイクル
    fn resolve<M: MemoryBus>(
        &mut self,
        memory: &mut M,
        mode: Mode,
        cross_penalty: bool,
    ) -> Operand {
        match mode {
            Mode::Implied => Operand::None,
            Mode::Accumulator => Operand::Accumulator,
            Mode::Immediate => Operand::Immediate(self.fetch_byte(memory)),
            Mode::ZeroPage => Operand::Address(self.fetch_byte(memory) as u16),
            Mode::ZeroPageX => {
                Operand::Address(self.fetch_byte(memory).wrapping_add(self.regs.x) as u16)
            }
            Mode::ZeroPageY => {
                Operand::Address(self.fetch_byte(memory).wrapping_add(self.regs.y) as u16)
            }
            Mode::Absolute => Operand::Address(self.fetch_word(memory)),
            Mode::AbsoluteX => {
                let index = self.regs.x;
                Operand::Address(self.indexed_addr(memory, index, cross_penalty))
            }
            Mode::AbsoluteY => {
                let index = self.regs.y;
                Operand::Address(self.indexed_addr(memory, index, cross_penalty))
            }
            Mode::IndexedIndirect => {
                let ptr = self.fetch_byte(memory).wrapping_add(self.regs.x);
                Operand::Address(self.zp_pointer(memory, ptr))
            }
            Mode::IndirectIndexed => {
                let ptr = self.fetch_byte(memory);
                let base = self.zp_pointer(memory, ptr);
                let addr = base.wrapping_add(self.regs.y as u16);
                if cross_penalty && (base & 0xFF00) != (addr & 0xFF00) {
                    self.cycles += 1;
                }
                Operand::Address(addr)
            }
            Mode::ZpIndirect => {
                let ptr = self.fetch_byte(memory);
                Operand::Address(self.zp_pointer(memory, ptr))
            }
            Mode::Relative | Mode::Indirect | Mode::AbsIndirectX => Operand::None,
        }
    }

    /// 絶対,X / 絶対,Y の実効アドレス
    fn indexed_addr<M: MemoryBus>(
        &mut self,
        memory: &mut M,
        index: u8,
        cross_penalty: bool,
    ) -> u16 {
        let base = self.fetch_word(memory);
        let addr = base.wrapping_add(index as u16);
        if cross_penalty && (base & 0xFF00) != (addr & 0xFF00) {
            self.cycles += 1;
        }
        addr
    }

    /// ゼロページ上の16ビットポインタ（ページ内でラップする）
    fn zp_pointer<M: MemoryBus>(&mut self, memory: &mut M, ptr: u8) -> u16 {
        let low = memory.read(ptr as u16) as u16;
        let high = memory.read(ptr.wrapping_add(1) as u16) as u16;
        (high << 8) | low
    }

    fn fetch_word<M: MemoryBus>(&mut self, memory: &mut M) -> u16 {
        let low = self.fetch_byte(memory) as u16;
        let high = self.fetch_byte(memory) as u16;
        (high << 8) | low
    }

    /// オペランドの値を読む
    fn operand_value<M: MemoryBus>(&mut self, memory: &mut M, operand: Operand) -> u8 {
        match operand {
            Operand::Immediate(value) => value,
            Operand::Address(addr) => memory.read(addr),
            Operand::Accumulator => self.regs.a,
            Operand::None => 0,
        }
    }

    /// オペランド位置へ値を書く（ストア系）
    fn store<M: MemoryBus>(&mut self, memory: &mut M, operand: Operand, value: u8) {
        if let Operand::Address(addr) = operand {
            memory.write(addr, value);
        }
    }

    /// read-modify-write命令の共通処理
    /// アキュムレータモードとメモリオペランドの両方を扱う
    fn modify<M, F>(&mut self, memory: &mut M, operand: Operand, f: F)
    where
        M: MemoryBus,
        F: FnOnce(&mut Cpu, u8) -> u8,
    {
        match operand {
            Operand::Accumulator => {
                let result = f(self, self.regs.a);
                self.regs.a = result;
            }
            Operand::Address(addr) => {
                let value = memory.read(addr);
                let result = f(self, value);
                memory.write(addr, result);
            }
            _ => {}
        }
    }

    // ========================================
    // 命令本体のヘルパー
    // ========================================

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.regs.set_flag(flags::CARRY, register >= value);
        self.regs.update_zero_negative_flags(result);
    }

    /// キャリー付き加算
    fn add_with_carry(&mut self, value: u8) {
        let carry = if self.regs.get_flag(flags::CARRY) { 1u16 } else { 0u16 };

        if self.regs.get_flag(flags::DECIMAL) {
            // BCDモード
            let a = self.regs.a;
            let bin = a as u16 + value as u16 + carry;
            let mut low = (a & 0x0F) as u16 + (value & 0x0F) as u16 + carry;
            let mut high = (a >> 4) as u16 + (value >> 4) as u16;
            if low > 9 {
                low += 6;
                high += 1;
            }
            // NMOSではNとVはハイニブル調整前の中間結果、Zはバイナリ和から決まる
            let mid = ((high << 4) as u8).wrapping_add((low & 0x0F) as u8);
            self.regs.set_flag(flags::NEGATIVE, mid & 0x80 != 0);
            self.regs
                .set_flag(flags::OVERFLOW, (a ^ mid) & (value ^ mid) & 0x80 != 0);
            self.regs.set_flag(flags::ZERO, bin & 0xFF == 0);
            if high > 9 {
                high += 6;
            }
            self.regs.set_flag(flags::CARRY, high > 15);
            let result = (((high & 0x0F) << 4) | (low & 0x0F)) as u8;
            if self.cpu_type == CpuType::Cpu65C02 {
                // 65C02はBCDでもNとZを結果から正しく設定する（1サイクル追加）
                self.regs.update_zero_negative_flags(result);
                self.cycles += 1;
            }
            self.regs.a = result;
        } else {
            let result = self.regs.a as u16 + value as u16 + carry;
            let result8 = result as u8;

            self.regs.set_flag(flags::CARRY, result > 0xFF);
            self.regs.set_flag(
                flags::OVERFLOW,
                (self.regs.a ^ result8) & (value ^ result8) & 0x80 != 0,
            );
            self.regs.update_zero_negative_flags(result8);
            self.regs.a = result8;
        }
    }

    /// キャリー付き減算
    fn subtract_with_carry(&mut self, value: u8) {
        if self.regs.get_flag(flags::DECIMAL) {
            // BCDモード
            // NMOSではフラグはすべてバイナリ減算の結果から決まる
            let a = self.regs.a;
            let borrow: i16 = if self.regs.get_flag(flags::CARRY) { 0 } else { 1 };
            let bin = a as i16 - value as i16 - borrow;
            let bin8 = bin as u8;
            self.regs.set_flag(flags::CARRY, bin >= 0);
            self.regs
                .set_flag(flags::OVERFLOW, (a ^ value) & (a ^ bin8) & 0x80 != 0);
            self.regs.update_zero_negative_flags(bin8);

            let mut low = (a & 0x0F) as i16 - (value & 0x0F) as i16 - borrow;
            let mut high = (a >> 4) as i16 - (value >> 4) as i16;
            if low < 0 {
                low += 10;
                high -= 1;
            }
            if high < 0 {
                high += 10;
            }
            let result = (((high as u8) & 0x0F) << 4) | ((low as u8) & 0x0F);
            if self.cpu_type == CpuType::Cpu65C02 {
                self.regs.update_zero_negative_flags(result);
                self.cycles += 1;
            }
            self.regs.a = result;
        } else {
            // バイナリ減算は補数の加算
            self.add_with_carry(!value);
        }
    }

    /// 分岐の共通処理（成立で+1、ページ境界越えでさらに+1）
    fn branch<M: MemoryBus>(&mut self, memory: &mut M, taken: bool) {
        let offset = self.fetch_byte(memory) as i8;
        if taken {
            let from = self.regs.pc;
            self.regs.pc = from.wrapping_add(offset as u16);
            self.cycles += 1;
            if (from & 0xFF00) != (self.regs.pc & 0xFF00) {
                self.cycles += 1;
            }
        }
    }

    /// JMPの各モード
    fn jump<M: MemoryBus>(&mut self, memory: &mut M, mode: Mode) {
        match mode {
            Mode::Absolute => self.regs.pc = self.fetch_word(memory),
            Mode::Indirect => {
                let ptr = self.fetch_word(memory);
                let low = memory.read(ptr) as u16;
                let high = if self.cpu_type == CpuType::Cpu65C02 {
                    // 65C02はページ境界バグが修正されている（1サイクル追加）
                    self.cycles += 1;
                    memory.read(ptr.wrapping_add(1)) as u16
                } else {
                    // 6502バグ: ポインタがページ境界を跨ぐと同一ページ内でラップ
                    memory.read((ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF)) as u16
                };
                self.regs.pc = (high << 8) | low;
            }
            Mode::AbsIndirectX => {
                let addr = self.fetch_word(memory).wrapping_add(self.regs.x as u16);
                let low = memory.read(addr) as u16;
                let high = memory.read(addr.wrapping_add(1)) as u16;
                self.regs.pc = (high << 8) | low;
            }
            _ => {}
        }
    }
}
