use crate::{
    CoreRegister, RegisterInterface,
    registers::{Demcr, Dfsr, Dhcsr, FpComp, FpCtrl, FpRemap, REMAP_ADDRESS_MASK},
};

/// Comparator registers the mock backs, code and literal together.
const MOCK_COMPARATORS: usize = 16;

/// In-memory stand-in for the FPB and debug registers.
///
/// Models the parts of the hardware the engine relies on: the FP_CTRL key
/// gate with read-only count fields, the DHCSR debug key, the DFSR
/// write-one-to-clear flags, and whether a `dsb; isb` pair has been issued
/// since the last write.
#[derive(Debug, Clone)]
pub struct MockRegisters {
    fp_ctrl: u32,
    fp_remap: u32,
    fp_comp: [u32; MOCK_COMPARATORS],
    dhcsr: u32,
    demcr: u32,
    dfsr: u32,
    debugger_attached: bool,
    synced: bool,
    writes: usize,
    syncs: usize,
}

impl MockRegisters {
    /// First FPB version (remap capable) with the given comparator counts.
    pub fn new(num_code: u8, num_lit: u8) -> Self {
        let num_code = num_code as u32;
        let num_lit = num_lit as u32;
        let ctrl = (((num_code >> 4) & 0x7) << 12)
            | ((num_lit & 0xF) << 8)
            | ((num_code & 0xF) << 4);

        Self {
            fp_ctrl: ctrl,
            fp_remap: 1 << 29,
            fp_comp: [0; MOCK_COMPARATORS],
            dhcsr: 0,
            demcr: 0,
            dfsr: 0,
            debugger_attached: false,
            synced: true,
            writes: 0,
            syncs: 0,
        }
    }

    /// Second FPB version (ARMv8-M): no remap support.
    pub fn v8m(num_code: u8, num_lit: u8) -> Self {
        let mut mock = Self::new(num_code, num_lit);
        mock.fp_ctrl |= 1 << 28;
        mock.fp_remap = 0;
        mock
    }

    /// An external debugger owns C_DEBUGEN; software writes cannot change it.
    pub fn with_debugger(mut self) -> Self {
        self.debugger_attached = true;
        self.dhcsr |= 1;
        self
    }

    /// Latch a breakpoint event the way the core does before entering the
    /// DebugMonitor exception.
    pub fn raise_breakpoint(&mut self) {
        self.dfsr |= 1 << 1;
    }

    /// Latch a completed monitor step.
    pub fn raise_step(&mut self) {
        self.dfsr |= 1;
    }

    pub fn ctrl(&self) -> FpCtrl {
        FpCtrl::from(self.fp_ctrl)
    }

    pub fn remap(&self) -> FpRemap {
        FpRemap::from(self.fp_remap)
    }

    pub fn comparator(&self, n: usize) -> FpComp {
        FpComp::from(self.fp_comp[n])
    }

    pub fn dhcsr(&self) -> Dhcsr {
        Dhcsr::from(self.dhcsr)
    }

    pub fn demcr(&self) -> Demcr {
        Demcr::from(self.demcr)
    }

    pub fn dfsr(&self) -> Dfsr {
        Dfsr::from(self.dfsr)
    }

    /// No register write is pending a barrier.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn sync_count(&self) -> usize {
        self.syncs
    }

    fn comparator_index(address: u32) -> Option<usize> {
        let first = FpComp::address_of(0);
        let last = FpComp::address_of(MOCK_COMPARATORS - 1);
        if (first..=last).contains(&address) && address % 4 == 0 {
            Some(((address - first) / 4) as usize)
        } else {
            None
        }
    }
}

impl RegisterInterface for MockRegisters {
    fn read_word_32(&self, address: u32) -> u32 {
        match address {
            // KEY reads as zero
            a if a == FpCtrl::ADDRESS => self.fp_ctrl & !0b10,
            a if a == FpRemap::ADDRESS => self.fp_remap,
            a if a == Dhcsr::ADDRESS => self.dhcsr,
            a if a == Demcr::ADDRESS => self.demcr,
            a if a == Dfsr::ADDRESS => self.dfsr,
            _ => Self::comparator_index(address).map_or(0, |n| self.fp_comp[n]),
        }
    }

    fn write_word_32(&mut self, address: u32, value: u32) {
        self.writes += 1;
        self.synced = false;

        match address {
            a if a == FpCtrl::ADDRESS => {
                if value & 0b10 != 0 {
                    self.fp_ctrl = (self.fp_ctrl & !1) | (value & 1);
                }
            }
            a if a == FpRemap::ADDRESS => {
                self.fp_remap = (self.fp_remap & !REMAP_ADDRESS_MASK) | (value & REMAP_ADDRESS_MASK);
            }
            a if a == Dhcsr::ADDRESS => {
                if value >> 16 == Dhcsr::DBGKEY {
                    let mut low = value & 0xFFFF;
                    if self.debugger_attached {
                        low |= 1;
                    }
                    self.dhcsr = (self.dhcsr & 0xFFFF_0000) | low;
                }
            }
            a if a == Demcr::ADDRESS => self.demcr = value,
            a if a == Dfsr::ADDRESS => self.dfsr &= !value,
            _ => {
                if let Some(n) = Self::comparator_index(address) {
                    self.fp_comp[n] = value;
                }
            }
        }
    }

    fn sync(&mut self) {
        self.syncs += 1;
        self.synced = true;
    }
}
