use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, exit};

/// Short alias that forwards to the `release-pipeline` binary installed next
/// to it, falling back to the search path.
fn main() {
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    let sibling = env::current_exe().ok().and_then(|exe| {
        let name = format!("release-pipeline{}", env::consts::EXE_SUFFIX);
        exe.parent().map(|dir| dir.join(name))
    });
    let program = sibling
        .filter(|path| path.is_file())
        .unwrap_or_else(|| PathBuf::from("release-pipeline"));

    match Command::new(&program).args(&args).status() {
        Ok(status) => {
            if let Some(code) = status.code() {
                if code != 0 {
                    exit(code);
                }
            } else {
                exit(1);
            }
        }
        Err(err) => {
            eprintln!("Failed to invoke release-pipeline: {err}");
            exit(1);
        }
    }
}
