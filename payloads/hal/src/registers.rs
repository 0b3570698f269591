//! Bit layouts of the FPB and debug registers.

use bitfield::bitfield;
use derive_more::IsVariant;

use crate::CoreRegister;

/// Address bits a comparator can match, 4-byte granular.
pub const COMP_ADDRESS_MASK: u32 = 0x1FFF_FFFC;

/// Address bits held by FP_REMAP, 32-byte granular.
pub const REMAP_ADDRESS_MASK: u32 = 0x1FFF_FFE0;

/// Required alignment of the remap table.
pub const REMAP_ALIGN: u32 = 32;

macro_rules! raw_conversions {
    ($reg:ident) => {
        impl From<u32> for $reg {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }

        impl From<$reg> for u32 {
            fn from(value: $reg) -> Self {
                value.0
            }
        }
    };
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct FpCtrl(u32);
    impl Debug;

    pub rev, _: 31, 28;
    num_code_1, _: 14, 12;
    pub num_lit, _: 11, 8;
    num_code_0, _: 7, 4;
    pub key, set_key: 1;
    pub enable, set_enable: 0;
}

impl FpCtrl {
    /// REV reads 0 on the first FPB version, the only one with remap.
    pub fn supports_remap(&self) -> bool {
        self.rev() == 0
    }

    /// Total code comparators, including the NUM_CODE2 extension bits.
    pub fn num_code(&self) -> u32 {
        (self.num_code_1() << 4) | self.num_code_0()
    }

    /// Value that switches the unit on. The enable bit is ignored by
    /// hardware unless KEY is set in the same write.
    pub fn enabled() -> Self {
        let mut reg = Self(0);
        reg.set_key(true);
        reg.set_enable(true);
        reg
    }

    /// Value that switches the unit off.
    pub fn disabled() -> Self {
        let mut reg = Self(0);
        reg.set_key(true);
        reg
    }
}

raw_conversions!(FpCtrl);

impl CoreRegister for FpCtrl {
    const ADDRESS: u32 = 0xE000_2000;
    const NAME: &'static str = "FP_CTRL";
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct FpRemap(u32);
    impl Debug;

    /// Remap not supported (ARMv8-M) or supported (ARMv7-M)
    pub rmpspt, _: 29;
    remap, set_remap: 28, 5;
}

impl FpRemap {
    /// FP_REMAP value pointing at a table placed at `base`.
    pub fn with_base(base: u32) -> Self {
        let mut reg = Self(0);
        reg.set_remap((base & REMAP_ADDRESS_MASK) >> 5);
        reg
    }

    pub fn base(&self) -> u32 {
        self.remap() << 5
    }
}

raw_conversions!(FpRemap);

impl CoreRegister for FpRemap {
    const ADDRESS: u32 = 0xE000_2004;
    const NAME: &'static str = "FP_REMAP";
}

/// What a comparator does when its address is fetched.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IsVariant)]
#[repr(u8)]
pub enum Replace {
    /// Fetch the word from the remap table instead
    Remap = 0b00,
    /// Replace the lower halfword
    Lower = 0b01,
    /// Replace the upper halfword
    Upper = 0b10,
    /// Breakpoint on both halfwords
    Both = 0b11,
}

impl From<u32> for Replace {
    fn from(value: u32) -> Self {
        match value & 0b11 {
            0b00 => Self::Remap,
            0b01 => Self::Lower,
            0b10 => Self::Upper,
            _ => Self::Both,
        }
    }
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct FpComp(u32);
    impl Debug;

    replace_bits, set_replace_bits: 31, 30;
    comp, set_comp: 28, 2;
    pub enable, set_enable: 0;
}

impl FpComp {
    /// Address of comparator `n`
    pub const fn address_of(n: usize) -> u32 {
        <Self as CoreRegister>::ADDRESS + (n as u32) * 4
    }

    /// Enabled comparator matching `address` with the given replace mode.
    ///
    /// Bits outside [`COMP_ADDRESS_MASK`] are dropped.
    pub fn matching(address: u32, replace: Replace) -> Self {
        let mut reg = Self(0);
        reg.set_comp((address & COMP_ADDRESS_MASK) >> 2);
        reg.set_replace(replace);
        reg.set_enable(true);
        reg
    }

    pub fn replace(&self) -> Replace {
        Replace::from(self.replace_bits())
    }

    pub fn set_replace(&mut self, replace: Replace) {
        self.set_replace_bits(replace as u32);
    }

    /// Breakpoint on either halfword of `address`, first FPB version.
    pub fn breakpoint(address: u32) -> Self {
        Self::matching(address, Replace::Both)
    }

    /// Breakpoint on the halfword at `address`, second FPB version
    /// (BPADDR in bits [31:1], BE in bit 0).
    pub fn breakpoint_v2(address: u32) -> Self {
        Self((address & !1) | 1)
    }

    /// Word address the comparator matches.
    pub fn address(&self) -> u32 {
        self.comp() << 2
    }
}

raw_conversions!(FpComp);

impl CoreRegister for FpComp {
    const ADDRESS: u32 = 0xE000_2008;
    const NAME: &'static str = "FP_COMP0";
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dhcsr(u32);
    impl Debug;

    pub s_reset_st, _: 25;
    pub s_retire_st, _: 24;
    pub s_lockup, _: 19;
    pub s_sleep, _: 18;
    pub s_halt, _: 17;
    pub s_regrdy, _: 16;
    pub c_snapstall, set_c_snapstall: 5;
    pub c_maskints, set_c_maskints: 3;
    pub c_step, set_c_step: 2;
    pub c_halt, set_c_halt: 1;
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Writes to DHCSR are ignored unless the upper halfword holds this key.
    pub const DBGKEY: u32 = 0xA05F;

    /// Put the debug key into the upper halfword, replacing the status bits
    /// that alias it on read.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xffff << 16);
        self.0 |= Self::DBGKEY << 16;
    }
}

raw_conversions!(Dhcsr);

impl CoreRegister for Dhcsr {
    const ADDRESS: u32 = 0xE000_EDF0;
    const NAME: &'static str = "DHCSR";
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Demcr(u32);
    impl Debug;
    /// Global enable for DWT and ITM features
    pub trcena, set_trcena: 24;
    /// DebugMonitor semaphore bit
    pub mon_req, set_mon_req: 19;
    /// Step the processor on return from the monitor
    pub mon_step, set_mon_step: 18;
    /// Sets or clears the pending state of the DebugMonitor exception
    pub mon_pend, set_mon_pend: 17;
    /// Enable the DebugMonitor exception
    pub mon_en, set_mon_en: 16;
    pub vc_harderr, set_vc_harderr: 10;
    pub vc_corereset, set_vc_corereset: 0;
}

raw_conversions!(Demcr);

impl CoreRegister for Demcr {
    const ADDRESS: u32 = 0xE000_EDFC;
    const NAME: &'static str = "DEMCR";
}

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dfsr(u32);
    impl Debug;
    pub external, set_external: 4;
    pub vcatch, set_vcatch: 3;
    pub dwttrap, set_dwttrap: 2;
    pub bkpt, set_bkpt: 1;
    pub halted, set_halted: 0;
}

impl Dfsr {
    /// Write-one-to-clear value for the BKPT flag alone.
    pub fn clear_bkpt() -> Self {
        let mut reg = Self(0);
        reg.set_bkpt(true);
        reg
    }

    /// Write-one-to-clear value for the HALTED (step) flag alone.
    pub fn clear_halted() -> Self {
        let mut reg = Self(0);
        reg.set_halted(true);
        reg
    }
}

impl From<u32> for Dfsr {
    fn from(value: u32) -> Self {
        Self(value & 0b11111)
    }
}

impl From<Dfsr> for u32 {
    fn from(value: Dfsr) -> Self {
        value.0
    }
}

impl CoreRegister for Dfsr {
    const ADDRESS: u32 = 0xE000_ED30;
    const NAME: &'static str = "DFSR";
}
