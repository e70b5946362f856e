// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("guestpatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Guest-side patch assessment and installation agent")
        .arg(
            Arg::new("handler_dir")
                .long("handler-dir")
                .value_name("DIR")
                .default_value(".")
                .help("Directory holding HandlerEnvironment.json")
                .global(true),
        )
        .subcommand(Command::new("enable").about("Run the requested patch operation"))
        .subcommand(Command::new("install").about("First-time handler setup"))
        .subcommand(Command::new("disable").about("Stop participating in patch operations"))
        .subcommand(Command::new("uninstall").about("Remove handler state"))
        .subcommand(Command::new("update").about("Handler version change"))
        .subcommand(Command::new("reset").about("Clear handler state"))
}

fn main() -> std::io::Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(man_dir.join("guestpatch.1"), buffer)?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
