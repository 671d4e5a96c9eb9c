pub const APP_DESCRIPTION: &str =
    "Client and worker runtime for Faktory-compatible job queue servers.";

/// Single line identifying the build, also used in the startup log.
pub fn version_line() -> String {
    format!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("FAKTORY_WORKER_BUILD_DATE_UTC")
    )
}

pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;172m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
  __       _    _
 / _| __ _| | _| |_ ___  _ __ _   _    __      _____  _ __| | _____ _ __
| |_ / _` | |/ / __/ _ \| '__| | | |___\ \ /\ / / _ \| '__| |/ / _ \ '__|
|  _| (_| |   <| || (_) | |  | |_| |___|\ V  V / (_) | |  |   <  __/ |
|_|  \__,_|_|\_\\__\___/|_|   \__, |     \_/\_/ \___/|_|  |_|\_\___|_|
                              |___/                                    "#;
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}{BANNER}{RESET}");
    println!("{}", version_line());
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
