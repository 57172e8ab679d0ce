//! Dump driver: map a PE image, parse it, print the decoded model.
//!
//! All of the interesting work happens in the library; this binary only
//! hands it a path and formats the result.

use std::env;
use std::process;

use peview::PeFile;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let mut paths = Vec::new();
    for (i, arg) in env::args().enumerate() {
        if i == 0 {
            continue;
        }
        paths.push(arg);
    }
    if paths.is_empty() {
        eprintln!("usage: peview <image.exe> [more images...]");
        process::exit(1);
    }

    let mut failed = false;
    for path in paths {
        match PeFile::parse_file(&path) {
            Ok(pe) => {
                println!("{}:", path);
                println!("{}", pe);
                println!(
                    "{} sections, {} imports, {} exports, {} resources, {} relocs, {} symbols",
                    pe.sections().len(),
                    pe.imports().len(),
                    pe.exports().len(),
                    pe.resources().len(),
                    pe.relocs().len(),
                    pe.symbols().len()
                );
            }
            Err(err) => {
                eprintln!("{}: {} ({:?} at {})", path, err, err.kind(), err.location());
                failed = true;
            }
        }
    }
    if failed {
        process::exit(1);
    }
}
