use std::path::PathBuf;

use clap::Parser;
use diskmorph_abi::Role;
use diskmorph_core::Registry;

pub const DEFAULT_PLUGIN_DIR: &str = "/usr/local/lib/diskmorph";

#[derive(Parser, Debug)]
pub struct Cli {
    /// Directory to scan for plug-in shared objects
    #[arg(short = 'p', long, default_value = DEFAULT_PLUGIN_DIR)]
    plugin_dir: PathBuf,
}

pub fn run(args: Cli) -> anyhow::Result<()> {
    let registry = Registry::discover(&args.plugin_dir)?;

    for (role, name, mut formats) in registry.list() {
        formats.sort();
        let role = match role {
            Role::Input => "input",
            Role::Morph => "morph",
            Role::Output => "output",
        };
        println!("{role:<7} {name:<40} {}", formats.join(", "));
    }

    Ok(())
}
