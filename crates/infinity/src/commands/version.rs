//! Version command implementation

/// Print the version of the command line tool
pub fn execute_version() {
    println!("Infinity command line tool {}", env!("CARGO_PKG_VERSION"));
}
