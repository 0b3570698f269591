#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::{
    convert::Infallible,
    mem::transmute,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use ufmt::uWrite;

/// Thumb state bit carried in branch targets and function pointers.
pub const THUMB_BIT: u32 = 1;

/// First address past the Code region (SRAM starts here on ARMv7-M/ARMv8-M).
pub const CODE_REGION_END: u32 = 0x2000_0000;

static CONSOLE: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install the byte sink used by the `console_*` macros.
///
/// The porting layer owns the actual device (UART, semihosting, RTT...);
/// until a sink is installed every print is dropped.
pub fn set_console(putc: fn(u8)) {
    CONSOLE.store(putc as *mut (), Ordering::Release);
}

/// Detach the console sink.
pub fn clear_console() {
    CONSOLE.store(ptr::null_mut(), Ordering::Release);
}

pub fn console_putc(c: u8) {
    let sink = CONSOLE.load(Ordering::Acquire);
    if sink.is_null() {
        return;
    }

    // SAFETY: only `set_console` stores non-null values and it stores a `fn(u8)`
    let putc: fn(u8) = unsafe { transmute(sink) };
    putc(c);
}

/// `ufmt` writer over the installed console sink.
pub struct Console;

impl uWrite for Console {
    type Error = Infallible;

    fn write_str(&mut self, s: &str) -> Result<(), Self::Error> {
        for c in s.bytes() {
            console_putc(c);
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! console_print {
    ($s:expr) => {{
        for c in $s.bytes() {
            $crate::console_putc(c);
        }
    }};
}

#[macro_export]
macro_rules! console_println {
    ($s:expr) => {{
        $crate::console_print!($s);
        $crate::console_putc(b'\n');
        $crate::console_putc(b'\r');
    }};
}

/// `uwrite!` to the console followed by a line break.
///
/// The calling crate must depend on `ufmt` for the formatting machinery.
#[macro_export]
macro_rules! console_printfln {
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        let _ = ufmt::uwrite!(&mut $crate::Console, $fmt $(, $($arg)+)?);
        $crate::console_println!("");
    }};
}

/// Drop the Thumb bit, yielding the halfword-aligned fetch address.
#[inline(always)]
pub const fn strip_thumb(addr: u32) -> u32 {
    addr & !THUMB_BIT
}

/// Force the Thumb bit, yielding a valid interworking branch target.
#[inline(always)]
pub const fn with_thumb(addr: u32) -> u32 {
    addr | THUMB_BIT
}

/// Whether `addr` lies in the Code region the FPB comparators can match.
#[inline(always)]
pub const fn is_code_address(addr: u32) -> bool {
    addr < CODE_REGION_END
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn capture(c: u8) {
        CAPTURED.lock().unwrap().push(c);
    }

    #[test]
    fn thumb_helpers() {
        assert_eq!(strip_thumb(0x0800_1001), 0x0800_1000);
        assert_eq!(strip_thumb(0x0800_1000), 0x0800_1000);
        assert_eq!(with_thumb(0x2000_1000), 0x2000_1001);
        assert_eq!(with_thumb(0x2000_1001), 0x2000_1001);
    }

    #[test]
    fn code_region_boundary() {
        assert!(is_code_address(0));
        assert!(is_code_address(0x1FFF_FFFE));
        assert!(!is_code_address(0x2000_0000));
        assert!(!is_code_address(0xE000_2000));
    }

    #[test]
    fn console_routes_through_sink() {
        console_println!("dropped");

        set_console(capture);
        console_printfln!("slot {} at 0x{:08x}", 3u8, 0x0800_1000u32);
        clear_console();
        console_println!("dropped too");

        let out = CAPTURED.lock().unwrap().clone();
        assert_eq!(String::from_utf8(out).unwrap(), "slot 3 at 0x08001000\n\r");
    }
}
