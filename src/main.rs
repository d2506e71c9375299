use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use scantree::config::Settings;
use scantree::data::loader::{mimetype_for_extension, read_directory, read_file};
use scantree::data::mimetype::MimetypeDetector;

/// Read SPEC, MDA and image files as array/metadata trees
#[derive(Parser, Debug)]
#[command(name = "scantree")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the detected mimetype of each file
    Detect {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Read one file and print its tree
    Read {
        file: PathBuf,

        /// Print the full tree as JSON instead of a structure summary
        #[arg(long)]
        json: bool,
    },

    /// Read every file in a directory
    Scan { dir: PathBuf },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Command::Detect { files } => {
            let detector = MimetypeDetector::new(&settings);
            for file in files {
                let mimetype = detector.detect(&file, mimetype_for_extension(&file));
                println!("{mimetype}  {}", file.display());
            }
        }
        Command::Read { file, json } => {
            let detector = MimetypeDetector::new(&settings);
            let mimetype = detector.detect(&file, mimetype_for_extension(&file));
            let node = read_file(&file, &mimetype)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&node).context("serializing tree")?);
            } else {
                print!("{}", node.structure());
            }
        }
        Command::Scan { dir } => {
            let results = read_directory(&dir, &settings)
                .with_context(|| format!("listing {}", dir.display()))?;
            for (path, mimetype, result) in results {
                match result {
                    Ok(_) => println!("ok   {mimetype}  {}", path.display()),
                    Err(e) => println!("err  {mimetype}  {e}"),
                }
            }
        }
    }
    Ok(())
}
