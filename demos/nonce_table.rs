/*!
Locates the nonce table of a kernelcache on disk.

    cargo run --example nonce_table -- -vv --darwin 23.2.0 --arm64e kernelcache.decompressed
*/

use clap::{ArgAction, Parser};
use memflow::prelude::v1::*;
use memflow_xnu::*;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nonce_table", version)]
#[command(about = "Locates the nonce table of a kernelcache on disk.", long_about = None)]
struct Cli {
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Darwin version of the kernel, e.g. 23.2.0
    #[arg(short, long)]
    darwin: String,

    /// kernel uses pointer authentication
    #[arg(long)]
    arm64e: bool,

    /// list the sections found in the kernelcache
    #[arg(short, long)]
    sections: bool,

    kernelcache: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .ok();

    let path = &cli.kernelcache;
    let bytes = std::fs::read(path).map_err(|err| {
        log::error!("unable to read {}: {}", path.display(), err);
        Error(ErrorOrigin::Other, ErrorKind::UnableToReadFile)
    })?;

    let mut image = MachoImage::parse(bytes)?;
    let build = KernelBuild::new(&cli.darwin, cli.arm64e, image.is_fileset())?;

    println!("{} at {:x}", build, image.base());

    if cli.sections {
        for section in image.scanner().sections() {
            println!(
                "{:<40} {:<16} {:<16} {:x} {:#x}",
                section.entry.as_deref().unwrap_or("-"),
                section.segment,
                section.section,
                section.vmaddr,
                section.data.len()
            );
        }
    }

    let locator = SignatureLocator::new(&build);
    println!("AppleImage4 sections: {:?}", locator.sections());

    match locator.find_array(&mut image) {
        Ok(array) => println!(
            "{:?} array at {:x}, {} entries",
            array.layout, array.address, array.count
        ),
        Err(err) => println!("nonce table not found: {}", err),
    }

    Ok(())
}
