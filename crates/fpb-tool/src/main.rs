use clap::{Parser, Subcommand, ValueEnum};
use clap_num::maybe_hex;
use colored::Colorize;
use derive_more::IsVariant;
use fpb_hal::{Demcr, FpCtrl, FpRemap, MockRegisters, RegisterInterface};
use fpb_inject::{
    BareRedirector, MAX_TRAMPOLINES, MissPolicy, PatchRegistry, RemapTable, TargetTable, TrampolineTable,
    thumb::{self, BranchKind},
};

use crate::err::Error;

mod err;
mod logging;

type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Copy, Default, ValueEnum, IsVariant)]
#[clap(rename_all = "kebab_case")]
enum Strategy {
    /// `b.w` in the remap table
    #[default]
    Remap,
    /// `b.w` in the remap table to a trampoline stub
    Trampoline,
    /// DebugMonitor breakpoint and stacked PC rewrite
    Debugmon,
}

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encode a branch between two addresses
    Encode {
        #[arg(value_parser=maybe_hex::<u32>)]
        from: u32,
        #[arg(value_parser=maybe_hex::<u32>)]
        to: u32,
        /// Encode `bl` instead of the shortest `b`
        #[arg(short, long)]
        call: bool,
    },
    /// Decode an unconditional branch
    Decode {
        /// First halfword
        #[arg(value_parser=maybe_hex::<u16>)]
        hw1: u16,
        /// Second halfword of a 32-bit branch
        #[arg(value_parser=maybe_hex::<u16>)]
        hw2: Option<u16>,
        /// Address of the instruction
        #[arg(short, long, default_value = "0", value_parser=maybe_hex::<u32>)]
        address: u32,
    },
    /// Program one redirect on a simulated FPB and dump the registers
    Plan {
        slot: usize,
        #[arg(value_parser=maybe_hex::<u32>)]
        original: u32,
        #[arg(value_parser=maybe_hex::<u32>)]
        target: u32,
        #[arg(short, long, value_enum, default_value_t)]
        strategy: Strategy,
        /// Code comparators of the simulated unit
        #[arg(short, long, default_value_t = 6)]
        comparators: u8,
        /// Literal comparators of the simulated unit
        #[arg(short, long, default_value_t = 2)]
        literals: u8,
        /// Simulate the second FPB version (no remap)
        #[arg(long)]
        v8m: bool,
    },
}

fn mnemonic(kind: BranchKind) -> &'static str {
    match kind {
        BranchKind::B => "b",
        BranchKind::BW => "b.w",
        BranchKind::BL => "bl",
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn encode(from: u32, to: u32, call: bool) -> Result<()> {
    let branch = if call {
        thumb::encode_call(from, to)?
    } else {
        thumb::encode_branch(from, to)?
    };
    let decoded = thumb::decode(from, branch.bytes()).ok_or(Error::Custom("Encoded branch does not decode".into()))?;

    println!("{} {:#x} -> {:#x}", mnemonic(decoded.kind), from, decoded.target);
    println!("bytes: {}", hex(branch.bytes()).cyan());
    if branch.is_wide() {
        register!("word", branch.as_word());
    }
    Ok(())
}

fn decode(hw1: u16, hw2: Option<u16>, address: u32) -> Result<()> {
    let mut bytes = hw1.to_le_bytes().to_vec();
    if let Some(hw2) = hw2 {
        bytes.extend(hw2.to_le_bytes());
    }

    let decoded = thumb::decode(address, &bytes).ok_or(Error::Custom("Not an unconditional branch".into()))?;
    println!(
        "{} {:#x} -> {} ({} bytes)",
        mnemonic(decoded.kind),
        address,
        format!("{:#x}", decoded.target).cyan(),
        decoded.len
    );
    Ok(())
}

fn dump_fpb<R: RegisterInterface>(regs: &R, slot: usize) {
    register!("FP_CTRL", u32::from(regs.read::<FpCtrl>()));
    register!("FP_REMAP", u32::from(regs.read::<FpRemap>()));
    register!(format!("FP_COMP{slot}"), u32::from(regs.read_comp(slot)));
}

fn plan_remap(mock: &mut MockRegisters, slot: usize, original: u32, target: u32, indirect: bool) -> Result<()> {
    let mut table = RemapTable::new();
    let mut targets = TargetTable::new();
    let mut trampolines = TrampolineTable::detached(&mut targets, MAX_TRAMPOLINES);
    let mut registry = PatchRegistry::new(mock, &mut table);

    log!("Initializing FPB...");
    status!(registry.init())?;

    log!("Programming slot {slot}...");
    if indirect {
        status!(registry.set_patch_indirect(slot, original, target, &mut trampolines))?;
    } else {
        status!(registry.set_patch(slot, original, target))?;
    }

    dump_fpb(registry.registers(), slot);

    let word = registry.get_state().remap[slot];
    register!(format!("REMAP[{slot}]"), word);
    if let Some(branch) = thumb::decode(original, &word.to_le_bytes()) {
        println!("  {} {:#x}", mnemonic(branch.kind), branch.target);
    }

    if indirect {
        register!("stub", trampolines.get_stub_address(slot)?);
        register!("target", trampolines.get_target(slot)?);
    }
    Ok(())
}

fn plan_debugmon(mock: &mut MockRegisters, slot: usize, original: u32, target: u32) -> Result<()> {
    let mut redirector = BareRedirector::new(mock, MissPolicy::default());

    log!("Arming DebugMonitor...");
    status!(redirector.init())?;

    log!("Programming slot {slot}...");
    status!(redirector.set_redirect(slot, original, target))?;

    dump_fpb(redirector.registers(), slot);
    register!("DEMCR", u32::from(redirector.registers().read::<Demcr>()));
    if let Some(redirect) = redirector.get_redirect(original) {
        register!("resume", redirect);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Encode { from, to, call } => encode(from, to, call),
        Command::Decode { hw1, hw2, address } => decode(hw1, hw2, address),
        Command::Plan {
            slot,
            original,
            target,
            strategy,
            comparators,
            literals,
            v8m,
        } => {
            let mut mock = if v8m {
                MockRegisters::v8m(comparators, literals)
            } else {
                MockRegisters::new(comparators, literals)
            };
            println!("Simulated FPB: {comparators} code, {literals} literal comparators");

            match strategy {
                Strategy::Remap | Strategy::Trampoline => {
                    plan_remap(&mut mock, slot, original, target, strategy.is_trampoline())
                }
                Strategy::Debugmon => plan_debugmon(&mut mock, slot, original, target),
            }
        }
    }
}

fn main() -> core::result::Result<(), String> {
    run(Cli::parse()).map_err(|e| e.to_string())
}
