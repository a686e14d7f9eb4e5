//! Man page generator for spiboot
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use std::fs;
use std::path::PathBuf;

#[path = "../cli.rs"]
#[allow(dead_code)]
mod cli;

fn main() -> std::io::Result<()> {
    // Default to ./man directory
    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));

    fs::create_dir_all(&output_dir)?;

    let cmd = cli::Cli::command();
    let mut pages = vec![(String::from("spiboot"), cmd.clone())];
    for sub in cmd.get_subcommands() {
        let name = format!("spiboot-{}", sub.get_name());
        pages.push((name, sub.clone()));
    }

    for (name, cmd) in pages {
        let mut buffer = Vec::new();
        clap_mangen::Man::new(cmd).render(&mut buffer)?;
        let output_path = output_dir.join(format!("{}.1", name));
        fs::write(&output_path, buffer)?;
        println!("Man page generated at: {}", output_path.display());
    }

    println!("\nTo view the man page:");
    println!("  man -l {}", output_dir.join("spiboot.1").display());
    println!("\nTo install system-wide (requires sudo):");
    println!("  sudo cp {}/*.1 /usr/local/share/man/man1/", output_dir.display());
    println!("  sudo mandb");

    Ok(())
}
