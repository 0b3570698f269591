/// Print a step without a newline so [`status!`] can finish the line.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        print!($($arg)*);
        ::std::io::Write::flush(&mut ::std::io::stdout())?;
    }};
}

/// Finish a [`log!`] line with the outcome of `$code` and hand it back.
#[macro_export]
macro_rules! status {
    ($code:expr) => {{
        let ret = $code;
        match &ret {
            Ok(_) => println!("{}", ::colored::Colorize::green("ok")),
            Err(e) => println!("{}: {e}", ::colored::Colorize::red("failed")),
        }
        ret
    }};
}

/// Register name and value, padded into columns.
#[macro_export]
macro_rules! register {
    ($name:expr, $value:expr) => {{
        println!("{:<10} {}", $name, ::colored::Colorize::cyan(format!("{:#010x}", $value).as_str()));
    }};
}
