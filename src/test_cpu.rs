//! Klaus2m5 6502 Functional Test Runner
//!
//! 実行方法:
//! a2core --test-cpu 6502_functional_test.bin

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use crate::bus::{PagedBus, Ram};
use crate::cpu::{Cpu, CpuType, MemoryBus};

/// 成功時の無限ループアドレス
const SUCCESS_ADDRESS: u16 = 0x3469;
/// テストの実行開始アドレス
const START_ADDRESS: u16 = 0x0400;
/// タイムアウトまでのサイクル数
const MAX_CYCLES: u64 = 100_000_000;

/// フラットな64KB RAMバスを構築してテストバイナリをロード
fn build_bus(data: &[u8]) -> Result<PagedBus, String> {
    let mut ram = Ram::new(0x00, 0xFF);
    ram.load(0, data);
    let mut bus = PagedBus::new();
    bus.add_page_handler(Rc::new(RefCell::new(ram)))
        .map_err(|e| e.to_string())?;
    Ok(bus)
}

/// Klaus2m5の6502機能テストを実行
///
/// テストバイナリは$0000からロードされ、$0400から実行開始。
/// 成功すると$3469で無限ループ（JMP $3469）に入る。
/// 失敗するとそれ以外のアドレスでトラップ（同じアドレスへのJMP）する。
pub fn run_functional_test(test_path: &str) -> Result<bool, String> {
    run_test(test_path, CpuType::Cpu6502, SUCCESS_ADDRESS)
}

/// 65C02拡張命令テストを実行
pub fn run_65c02_test(test_path: &str) -> Result<bool, String> {
    run_test(test_path, CpuType::Cpu65C02, SUCCESS_ADDRESS)
}

fn run_test(test_path: &str, cpu_type: CpuType, success: u16) -> Result<bool, String> {
    let data = fs::read(test_path).map_err(|e| format!("Failed to load test file: {}", e))?;

    if data.len() != 65536 {
        return Err(format!("Expected 65536 bytes, got {}", data.len()));
    }

    println!("Running Klaus2m5 functional test ({:?})...", cpu_type);
    println!("Test file: {}", test_path);

    let mut bus = build_bus(&data)?;
    let mut cpu = Cpu::new(cpu_type);
    cpu.reset_pending = false;
    cpu.regs.pc = START_ADDRESS;
    cpu.regs.sp = 0xFF;
    cpu.regs.status = 0x00;

    println!("Starting execution at ${:04X}", cpu.regs.pc);
    println!("Success address: ${:04X}", success);

    let mut cycles: u64 = 0;
    let mut trap_count = 0;
    let mut next_report: u64 = 10_000_000;

    loop {
        let pc_before = cpu.regs.pc;
        cycles += cpu.step(&mut bus) as u64;

        // 同じアドレスに留まっている（トラップ検出）
        if cpu.regs.pc == pc_before {
            trap_count += 1;
            if trap_count > 2 {
                if cpu.regs.pc == success {
                    println!("SUCCESS! Test passed at ${:04X}", cpu.regs.pc);
                    println!("Total cycles: {}", cycles);
                    return Ok(true);
                }
                let test_num = bus.read(0x0200);
                println!("FAILED! Trap at ${:04X}", cpu.regs.pc);
                println!("Test number: ${:02X} ({})", test_num, test_num);
                println!("Total cycles: {}", cycles);
                println!("CPU State:");
                println!(
                    "  A=${:02X} X=${:02X} Y=${:02X} SP=${:02X} Status=${:02X}",
                    cpu.regs.a, cpu.regs.x, cpu.regs.y, cpu.regs.sp, cpu.regs.status
                );
                return Ok(false);
            }
        } else {
            trap_count = 0;
        }

        if cycles >= next_report {
            println!("Cycles: {}M, PC: ${:04X}", cycles / 1_000_000, cpu.regs.pc);
            next_report += 10_000_000;
        }

        if cycles >= MAX_CYCLES {
            println!("TIMEOUT after {} cycles at PC ${:04X}", cycles, cpu.regs.pc);
            return Ok(false);
        }
    }
}
